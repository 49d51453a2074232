//! Meshrelay State - message identity persistence
//!
//! Relaying a reply or reaction needs to know which chat event a radio packet
//! became, and the other way round. This crate keeps that mapping in SQLite
//! with bounded retention.
//!
//! ## Example
//!
//! ```ignore
//! use meshrelay_state::MessageIdentityStore;
//!
//! let store = MessageIdentityStore::open("meshrelay.sqlite").await?;
//! store.put(&mapping).await?;
//! store.prune(500).await?;
//! let original = store.get_by_chat_event_id("$event").await?;
//! ```

pub mod error;
pub mod store;

pub use error::{Result, StateError};
pub use store::MessageIdentityStore;
