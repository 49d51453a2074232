//! Capability traits the router sends through
//!
//! The radio and chat supervisors implement these; tests substitute
//! recording fakes.

use async_trait::async_trait;

use crate::error::Result;
use crate::message::{NodeUser, OutboundChat, OutboundText};

/// Outbound access to the radio mesh
#[async_trait]
pub trait RadioPort: Send + Sync + 'static {
    /// Send a text packet; returns the packet id assigned to it
    async fn send_text(&self, message: OutboundText) -> Result<u32>;

    /// Look up a node in the live node database
    fn node_user(&self, node: u32) -> Option<NodeUser>;

    /// Node number of the locally attached radio, once known
    fn my_node_num(&self) -> Option<u32>;
}

/// Outbound access to the chat homeserver
#[async_trait]
pub trait ChatPort: Send + Sync + 'static {
    /// Send a message to a room; returns the new event id
    async fn send_message(&self, room_id: &str, message: OutboundChat) -> Result<String>;

    /// Display name of a user, when set
    async fn display_name(&self, user_id: &str) -> Option<String>;

    /// User id of the relay account
    fn user_id(&self) -> Option<String>;
}
