//! Meshrelay Matrix - chat homeserver session
//!
//! The chat half of the relay: a small client-server API client, `/sync`
//! parsing into [`RelayUnit`](meshrelay_core::RelayUnit)s and a supervisor
//! that keeps the session alive.
//!
//! ```ignore
//! use meshrelay_matrix::ChatSupervisor;
//!
//! let chat = ChatSupervisor::new(config.clone())?;
//! chat.start().await?;
//! let inbound = chat.take_inbound().unwrap();
//! chat.spawn_sync_loop();
//! ```
//!
//! Encrypted rooms are not supported; their events arrive as
//! `m.room.encrypted` and are ignored.

pub mod client;
pub mod error;
pub mod supervisor;
pub mod sync;
pub mod test_utils;

pub use client::{MatrixApi, MatrixClient};
pub use error::{MatrixError, Result};
pub use supervisor::ChatSupervisor;
pub use sync::{message_content, normalize_event, RoomEvent, SyncResponse};
