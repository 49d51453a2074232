//! Sender name resolution
//!
//! Radio nodes resolve cache → live node database → raw id; chat users
//! resolve cache → profile lookup → user id. Fallbacks are not cached so a
//! name learned later still shows up.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use tracing::trace;

use meshrelay_core::{radio_node_id, ChatPort, NodeUser, RadioPort};

/// Default number of cached names per side
pub const DEFAULT_NAME_CAPACITY: usize = 512;

/// LRU of node and chat user names
#[derive(Debug)]
pub struct NameCache {
    nodes: Mutex<LruCache<u32, NodeUser>>,
    displays: Mutex<LruCache<String, String>>,
}

impl Default for NameCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_NAME_CAPACITY)
    }
}

impl NameCache {
    /// Cache holding up to `capacity` names per side
    pub fn with_capacity(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            nodes: Mutex::new(LruCache::new(cap)),
            displays: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Identity of a radio node
    pub fn node(&self, num: u32, radio: &dyn RadioPort) -> NodeUser {
        let cached = self.nodes.lock().get(&num).cloned();
        if let Some(user) = cached {
            return user;
        }
        match radio.node_user(num) {
            Some(user) => {
                self.nodes.lock().put(num, user.clone());
                user
            }
            None => {
                trace!(node = num, "Node not in database, using raw id");
                fallback_node(num)
            }
        }
    }

    /// Display name of a chat user
    pub async fn display(&self, user_id: &str, chat: &dyn ChatPort) -> String {
        let cached = self.displays.lock().get(user_id).cloned();
        if let Some(name) = cached {
            return name;
        }
        match chat.display_name(user_id).await {
            Some(name) => {
                self.displays.lock().put(user_id.to_string(), name.clone());
                name
            }
            None => user_id.to_string(),
        }
    }

    /// Drop a cached node identity
    pub fn forget_node(&self, num: u32) {
        self.nodes.lock().pop(&num);
    }
}

/// Identity used for nodes missing from the database
///
/// The short name follows the firmware default: last four hex digits.
pub fn fallback_node(num: u32) -> NodeUser {
    let id = radio_node_id(num);
    NodeUser {
        short_name: id[id.len() - 4..].to_string(),
        long_name: id.clone(),
        id,
    }
}
