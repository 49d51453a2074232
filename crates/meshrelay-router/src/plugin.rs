//! Plugin host seam
//!
//! Plugins see messages before they are relayed and may consume them.
//! Discovery and execution live outside this crate; the router only talks to
//! a [`PluginHost`].

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use meshrelay_core::RelayUnit;

/// Message hooks offered to plugins
///
/// Returning `true` marks the message handled and stops relaying.
#[async_trait]
pub trait PluginHost: Send + Sync + 'static {
    /// A radio message, with the sender's long name and the local meshnet
    async fn on_radio_message(&self, _unit: &RelayUnit, _long_name: &str, _meshnet: &str) -> bool {
        false
    }

    /// A chat message from a bound room
    async fn on_chat_message(&self, _room_id: &str, _unit: &RelayUnit) -> bool {
        false
    }
}

/// Host with no plugins loaded
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPlugins;

impl PluginHost for NoPlugins {}

/// Await a plugin decision for at most `limit`
///
/// A plugin that does not answer in time counts as having handled the
/// message, so it is never delivered twice.
pub async fn offer<F>(limit: Duration, hook: &'static str, decision: F) -> bool
where
    F: Future<Output = bool>,
{
    match tokio::time::timeout(limit, decision).await {
        Ok(handled) => handled,
        Err(_) => {
            warn!(hook, timeout = ?limit, "Plugin did not answer in time, treating message as handled");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_offer_passes_decision_through() {
        assert!(!offer(Duration::from_secs(1), "radio", async { false }).await);
        assert!(offer(Duration::from_secs(1), "radio", async { true }).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offer_timeout_counts_as_handled() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            false
        };
        assert!(offer(Duration::from_secs(1), "chat", slow).await);
    }

    #[tokio::test]
    async fn test_no_plugins_never_handles() {
        let unit = RelayUnit::radio_text(1, 2, meshrelay_core::BROADCAST_ADDR, 0, "hi");
        assert!(!NoPlugins.on_radio_message(&unit, "Alice", "Home").await);
        assert!(!NoPlugins.on_chat_message("!r:x", &unit).await);
    }
}
