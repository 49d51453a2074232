//! Recording port implementations for tests
//!
//! [`RecordingRadio`] and [`RecordingChat`] stand in for the supervisors:
//! every send is captured and answered with a fresh id.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use meshrelay_core::{
    radio_node_id, ChatPort, NodeUser, OutboundChat, OutboundText, RadioPort, RelayError, Result,
};

/// Radio port that records sends
pub struct RecordingRadio {
    my_node: u32,
    nodes: Mutex<HashMap<u32, NodeUser>>,
    sent: Mutex<Vec<(u32, OutboundText)>>,
    next_id: AtomicU32,
    offline: AtomicBool,
}

impl RecordingRadio {
    /// Radio whose local node number is `my_node`
    pub fn new(my_node: u32) -> Self {
        Self {
            my_node,
            nodes: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(5000),
            offline: AtomicBool::new(false),
        }
    }

    /// Add a node to the database
    pub fn add_node(&self, num: u32, long_name: &str, short_name: &str) {
        self.nodes.lock().insert(
            num,
            NodeUser {
                id: radio_node_id(num),
                long_name: long_name.to_string(),
                short_name: short_name.to_string(),
            },
        );
    }

    /// Remove a node from the database
    pub fn remove_node(&self, num: u32) {
        self.nodes.lock().remove(&num);
    }

    /// Fail every send
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Sends so far, with the packet id each was given
    pub fn sent(&self) -> Vec<(u32, OutboundText)> {
        self.sent.lock().clone()
    }

    /// Texts sent so far
    pub fn texts(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(_, m)| m.text.clone()).collect()
    }
}

#[async_trait]
impl RadioPort for RecordingRadio {
    async fn send_text(&self, message: OutboundText) -> Result<u32> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RelayError::NotConnected("radio"));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().push((id, message));
        Ok(id)
    }

    fn node_user(&self, node: u32) -> Option<NodeUser> {
        self.nodes.lock().get(&node).cloned()
    }

    fn my_node_num(&self) -> Option<u32> {
        Some(self.my_node)
    }
}

/// One captured chat send
#[derive(Debug, Clone)]
pub struct SentChat {
    /// Target room
    pub room_id: String,
    /// Message as requested
    pub message: OutboundChat,
    /// Event id handed back
    pub event_id: String,
}

/// Chat port that records sends
pub struct RecordingChat {
    user_id: String,
    display_names: Mutex<HashMap<String, String>>,
    sent: Mutex<Vec<SentChat>>,
}

impl RecordingChat {
    /// Chat session logged in as `user_id`
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            display_names: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Set a profile display name
    pub fn set_display_name(&self, user_id: &str, name: &str) {
        self.display_names
            .lock()
            .insert(user_id.to_string(), name.to_string());
    }

    /// Sends so far
    pub fn sent(&self) -> Vec<SentChat> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl ChatPort for RecordingChat {
    async fn send_message(&self, room_id: &str, message: OutboundChat) -> Result<String> {
        let mut sent = self.sent.lock();
        let event_id = format!("$relayed{}", sent.len() + 1);
        sent.push(SentChat {
            room_id: room_id.to_string(),
            message,
            event_id: event_id.clone(),
        });
        Ok(event_id)
    }

    async fn display_name(&self, user_id: &str) -> Option<String> {
        self.display_names.lock().get(user_id).cloned()
    }

    fn user_id(&self) -> Option<String> {
        Some(self.user_id.clone())
    }
}
