//! Meshrelay Router - decides what crosses between the mesh and chat
//!
//! Inbound [`RelayUnit`](meshrelay_core::RelayUnit)s from either supervisor
//! are queued into a [`RelayService`], deduplicated and routed by the
//! [`Router`], which formats, gates and schedules the outbound sends and
//! keeps the identity store up to date.
//!
//! # Modules
//!
//! - [`router`] - Routing decisions and outbound scheduling
//! - [`service`] - Inbound queues, consumers and the command handle
//! - [`format`] - Prefix templates and text shaping
//! - [`names`] - Sender name cache
//! - [`plugin`] - Plugin host seam
//!
//! ```ignore
//! let router = Router::new(config, radio, chat, store, bridge)
//!     .with_bindings(chat_supervisor.bindings());
//! let (mut service, handle) = RelayService::new(router);
//! service.attach_radio(radio_supervisor.take_inbound().unwrap());
//! tokio::spawn(service.run());
//! ```

pub mod format;
pub mod names;
pub mod plugin;
pub mod router;
pub mod service;
pub mod test_utils;

pub use names::NameCache;
pub use plugin::{NoPlugins, PluginHost};
pub use router::{DropReason, RelayTarget, RouteOutcome, Router};
pub use service::{RelayCommand, RelayHandle, RelayService, RelayStats};
