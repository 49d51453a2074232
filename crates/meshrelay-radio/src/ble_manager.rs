//! Process-wide owner of the BLE link
//!
//! BLE stacks misbehave when a second client object is created for a device
//! that still has one, so a single link per address is kept for the lifetime
//! of the process. It is replaced only when the address changes or the link
//! is released after an explicit loss.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::BLE_DISCONNECT_TIMEOUT;
use crate::error::Result;
use crate::link::RadioLink;

/// Proof that the caller holds the BLE connect gate
pub struct BleConnectPermit<'a> {
    _guard: tokio::sync::MutexGuard<'a, ()>,
}

/// Owner of the single BLE link
pub struct BleInterfaceManager {
    current: Mutex<Option<(String, Arc<dyn RadioLink>)>>,
    gate: tokio::sync::Mutex<()>,
    disconnect_timeout: Duration,
    created: AtomicUsize,
}

impl BleInterfaceManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self::with_disconnect_timeout(BLE_DISCONNECT_TIMEOUT)
    }

    /// Create with a custom bound on graceful disconnects
    pub fn with_disconnect_timeout(disconnect_timeout: Duration) -> Self {
        Self {
            current: Mutex::new(None),
            gate: tokio::sync::Mutex::new(()),
            disconnect_timeout,
            created: AtomicUsize::new(0),
        }
    }

    /// Serialise BLE connects; hold the permit across acquire and connect
    pub async fn lock_connect(&self) -> BleConnectPermit<'_> {
        BleConnectPermit {
            _guard: self.gate.lock().await,
        }
    }

    /// Return the link for `address`, building it with `create` when needed
    ///
    /// A link held for a different address is closed first.
    pub async fn acquire<F>(
        &self,
        _permit: &BleConnectPermit<'_>,
        address: &str,
        create: F,
    ) -> Result<Arc<dyn RadioLink>>
    where
        F: FnOnce() -> Result<Arc<dyn RadioLink>>,
    {
        let previous = {
            let mut current = self.current.lock();
            match current.as_ref() {
                Some((held, link)) if held == address => {
                    debug!(address, "Reusing BLE link");
                    return Ok(link.clone());
                }
                _ => current.take(),
            }
        };

        if let Some((held, link)) = previous {
            info!(old = %held, new = address, "BLE address changed, releasing previous link");
            self.close_gracefully(link).await;
        }

        let link = create()?;
        self.created.fetch_add(1, Ordering::SeqCst);
        *self.current.lock() = Some((address.to_string(), link.clone()));
        Ok(link)
    }

    /// Currently held link
    pub fn current(&self) -> Option<Arc<dyn RadioLink>> {
        self.current.lock().as_ref().map(|(_, link)| link.clone())
    }

    /// Address of the currently held link
    pub fn current_address(&self) -> Option<String> {
        self.current.lock().as_ref().map(|(address, _)| address.clone())
    }

    /// Close and forget the held link; returns whether one was held
    pub async fn release(&self) -> bool {
        let held = self.current.lock().take();
        match held {
            Some((address, link)) => {
                debug!(address = %address, "Releasing BLE link");
                self.close_gracefully(link).await;
                true
            }
            None => false,
        }
    }

    /// Number of links built so far
    pub fn creations(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    async fn close_gracefully(&self, link: Arc<dyn RadioLink>) {
        match tokio::time::timeout(self.disconnect_timeout, link.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_already_closed() => {}
            Ok(Err(e)) => warn!(link = link.name(), error = %e, "BLE disconnect failed"),
            Err(_) => warn!(
                link = link.name(),
                timeout = ?self.disconnect_timeout,
                "BLE disconnect timed out"
            ),
        }
    }
}

impl Default for BleInterfaceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::RadioEventSink;
    use crate::test_utils::MockLink;
    use tokio::sync::mpsc;

    fn factory(id: u64, address: &str) -> Result<Arc<dyn RadioLink>> {
        let (tx, _rx) = mpsc::channel(1);
        Ok(Arc::new(MockLink::new(RadioEventSink::new(id, tx), address)))
    }

    #[tokio::test]
    async fn test_same_address_reuses_link() {
        let manager = BleInterfaceManager::new();
        let permit = manager.lock_connect().await;

        let first = manager
            .acquire(&permit, "AA:AA", || factory(1, "AA:AA"))
            .await
            .unwrap();
        let second = manager
            .acquire(&permit, "AA:AA", || factory(2, "AA:AA"))
            .await
            .unwrap();

        assert_eq!(manager.creations(), 1);
        assert_eq!(first.link_id(), second.link_id());
    }

    #[tokio::test]
    async fn test_new_address_tears_down_previous() {
        let manager = BleInterfaceManager::new();
        let permit = manager.lock_connect().await;

        let first = manager
            .acquire(&permit, "AA:AA", || factory(1, "AA:AA"))
            .await
            .unwrap();
        first.connect().await.unwrap();

        let second = manager
            .acquire(&permit, "BB:BB", || factory(2, "BB:BB"))
            .await
            .unwrap();

        assert!(!first.is_connected());
        assert_eq!(second.link_id(), 2);
        assert_eq!(manager.current_address().as_deref(), Some("BB:BB"));
        assert_eq!(manager.creations(), 2);
    }

    #[tokio::test]
    async fn test_release_forgets_link() {
        let manager = BleInterfaceManager::new();
        {
            let permit = manager.lock_connect().await;
            manager
                .acquire(&permit, "AA:AA", || factory(1, "AA:AA"))
                .await
                .unwrap();
        }
        assert!(manager.release().await);
        assert!(manager.current().is_none());
        assert!(!manager.release().await);
    }

    #[tokio::test]
    async fn test_gate_serialises_connects() {
        let manager = Arc::new(BleInterfaceManager::new());
        let permit = manager.lock_connect().await;

        let contender = {
            let manager = manager.clone();
            tokio::spawn(async move {
                let _permit = manager.lock_connect().await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        drop(permit);
        contender.await.unwrap();
    }
}
