//! Async bridge between callback-driven code and the runtime
//!
//! Radio I/O tasks and other callback-style code hand futures to an
//! [`AsyncBridge`]. A dispatcher task running on the target runtime receives
//! them over a channel and spawns them, so scheduling is a single channel send
//! from any thread. When no dispatcher is reachable the work runs on the
//! current runtime if there is one, or synchronously on a private
//! current-thread runtime otherwise.
//!
//! ```rust,no_run
//! use meshrelay_core::dispatch::AsyncBridge;
//! use std::time::Duration;
//!
//! let rt = tokio::runtime::Runtime::new().unwrap();
//! let bridge = AsyncBridge::start(rt.handle().clone());
//!
//! let mut handle = bridge.submit(async { 40 + 2 });
//! assert_eq!(handle.wait_timeout(Duration::from_secs(1)), Ok(42));
//! ```

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::runtime::{Builder, Handle};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, warn};

use crate::error::BridgeError;

type Job = BoxFuture<'static, ()>;

struct Dispatcher {
    tx: mpsc::UnboundedSender<Job>,
    shutdown: watch::Sender<bool>,
}

/// Schedules futures onto a target runtime from any thread
pub struct AsyncBridge {
    dispatcher: Mutex<Option<Dispatcher>>,
}

impl AsyncBridge {
    /// Start a dispatcher task on the given runtime
    pub fn start(handle: Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        handle.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        debug!("Async bridge dispatcher stopping");
                        break;
                    }
                    job = rx.recv() => match job {
                        Some(job) => {
                            tokio::spawn(job);
                        }
                        None => break,
                    }
                }
            }
        });

        Self {
            dispatcher: Mutex::new(Some(Dispatcher {
                tx,
                shutdown: shutdown_tx,
            })),
        }
    }

    /// A bridge with no dispatcher; every submission takes the fallback path
    pub fn detached() -> Self {
        Self {
            dispatcher: Mutex::new(None),
        }
    }

    /// Whether a dispatcher is attached
    pub fn is_running(&self) -> bool {
        self.dispatcher
            .lock()
            .as_ref()
            .map_or(false, |d| !d.tx.is_closed())
    }

    /// Schedule a future and get a handle to its result
    ///
    /// Never fails synchronously: scheduling errors are stored in the handle.
    pub fn submit<F, T>(&self, fut: F) -> TaskHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = async move {
            let result = AssertUnwindSafe(fut)
                .catch_unwind()
                .await
                .map_err(|_| BridgeError::Panicked);
            let _ = tx.send(result);
        }
        .boxed();

        let job = {
            let guard = self.dispatcher.lock();
            match guard.as_ref() {
                Some(dispatcher) => match dispatcher.tx.send(job) {
                    Ok(()) => return TaskHandle::pending(rx),
                    Err(mpsc::error::SendError(job)) => job,
                },
                None => job,
            }
        };

        match run_fallback(job) {
            Ok(()) => TaskHandle::pending(rx),
            Err(err) => TaskHandle::failed(err),
        }
    }

    /// [`submit`](Self::submit) for optional work; `None` schedules nothing
    pub fn try_submit<F, T>(&self, fut: Option<F>) -> Option<TaskHandle<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        match fut {
            Some(fut) => Some(self.submit(fut)),
            None => {
                debug!("Ignoring submission without work");
                None
            }
        }
    }

    /// Schedule a fallible future and log its outcome
    ///
    /// Errors are logged at warn, panics at error. Cancellation is silent.
    pub fn fire_and_forget<F, E>(&self, label: &'static str, fut: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let observed = async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(task = label, error = %e, "Background task failed"),
                Err(_) => error!(task = label, "Background task panicked"),
            }
        };
        let mut handle = self.submit(observed);
        if let Some(err) = handle.take_failure() {
            error!(task = label, error = %err, "Failed to schedule background task");
        }
    }

    /// [`fire_and_forget`](Self::fire_and_forget) for optional work
    pub fn try_fire_and_forget<F, E>(&self, label: &'static str, fut: Option<F>)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        match fut {
            Some(fut) => self.fire_and_forget(label, fut),
            None => debug!(task = label, "Ignoring fire-and-forget without work"),
        }
    }

    /// Stop the dispatcher; later submissions take the fallback path
    pub fn shutdown(&self) {
        if let Some(dispatcher) = self.dispatcher.lock().take() {
            let _ = dispatcher.shutdown.send(true);
        }
    }
}

impl Default for AsyncBridge {
    fn default() -> Self {
        Self::detached()
    }
}

fn run_fallback(job: Job) -> Result<(), BridgeError> {
    if let Ok(handle) = Handle::try_current() {
        handle.spawn(job);
        return Ok(());
    }

    let rt = Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| BridgeError::Schedule(e.to_string()))?;
    rt.block_on(job);
    Ok(())
}

enum HandleState<T> {
    Pending(oneshot::Receiver<Result<T, BridgeError>>),
    Failed(BridgeError),
    Done,
}

/// Result handle of a bridged task
pub struct TaskHandle<T> {
    state: HandleState<T>,
}

impl<T> TaskHandle<T> {
    fn pending(rx: oneshot::Receiver<Result<T, BridgeError>>) -> Self {
        Self {
            state: HandleState::Pending(rx),
        }
    }

    fn failed(err: BridgeError) -> Self {
        Self {
            state: HandleState::Failed(err),
        }
    }

    fn take_failure(&mut self) -> Option<BridgeError> {
        match std::mem::replace(&mut self.state, HandleState::Done) {
            HandleState::Failed(err) => Some(err),
            other => {
                self.state = other;
                None
            }
        }
    }

    /// Await the result from inside a runtime
    pub async fn join(self) -> Result<T, BridgeError> {
        match self.state {
            HandleState::Pending(rx) => rx.await.unwrap_or(Err(BridgeError::Cancelled)),
            HandleState::Failed(err) => Err(err),
            HandleState::Done => Err(BridgeError::Cancelled),
        }
    }

    /// Block the calling thread for at most `timeout`
    ///
    /// Must be called from outside any runtime; on a runtime thread it returns
    /// [`BridgeError::OnLoopThread`] instead of blocking. After a timeout the
    /// handle stays usable and can be waited on again.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<T, BridgeError> {
        if Handle::try_current().is_ok() {
            return Err(BridgeError::OnLoopThread);
        }

        let rx = match &mut self.state {
            HandleState::Pending(rx) => rx,
            HandleState::Failed(err) => return Err(err.clone()),
            HandleState::Done => return Err(BridgeError::Cancelled),
        };

        let rt = Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| BridgeError::Schedule(e.to_string()))?;

        match rt.block_on(async { tokio::time::timeout(timeout, rx).await }) {
            Err(_) => Err(BridgeError::Timeout(timeout)),
            Ok(received) => {
                self.state = HandleState::Done;
                received.unwrap_or(Err(BridgeError::Cancelled))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn runtime() -> tokio::runtime::Runtime {
        Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn test_submit_from_foreign_thread() {
        let rt = runtime();
        let bridge = AsyncBridge::start(rt.handle().clone());
        assert!(bridge.is_running());

        let mut handle = bridge.submit(async { "done" });
        assert_eq!(handle.wait_timeout(Duration::from_secs(5)), Ok("done"));
    }

    #[test]
    fn test_wait_timeout_expires() {
        let rt = runtime();
        let bridge = AsyncBridge::start(rt.handle().clone());

        let mut handle = bridge.submit(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        let err = handle.wait_timeout(Duration::from_millis(50)).unwrap_err();
        assert_eq!(err, BridgeError::Timeout(Duration::from_millis(50)));
    }

    #[test]
    fn test_panic_is_reported() {
        let rt = runtime();
        let bridge = AsyncBridge::start(rt.handle().clone());

        let mut handle = bridge.submit(async {
            if true {
                panic!("boom");
            }
        });
        assert_eq!(handle.wait_timeout(Duration::from_secs(5)), Err(BridgeError::Panicked));
    }

    #[test]
    fn test_detached_runs_synchronously() {
        let bridge = AsyncBridge::detached();
        let mut handle = bridge.submit(async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            7
        });
        assert_eq!(handle.wait_timeout(Duration::from_millis(1)), Ok(7));
    }

    #[test]
    fn test_shutdown_falls_back() {
        let rt = runtime();
        let bridge = AsyncBridge::start(rt.handle().clone());
        bridge.shutdown();
        assert!(!bridge.is_running());

        let mut handle = bridge.submit(async { 1 });
        assert_eq!(handle.wait_timeout(Duration::from_secs(1)), Ok(1));
    }

    #[test]
    fn test_optional_work_schedules_nothing() {
        let bridge = AsyncBridge::detached();
        let none: Option<std::future::Ready<u8>> = None;
        assert!(bridge.try_submit(none).is_none());

        let none: Option<std::future::Ready<Result<(), String>>> = None;
        bridge.try_fire_and_forget("noop", none);
    }

    #[tokio::test]
    async fn test_blocking_wait_on_loop_thread() {
        let bridge = AsyncBridge::start(Handle::current());
        let mut handle = bridge.submit(async { 1 });
        assert_eq!(
            handle.wait_timeout(Duration::from_millis(10)),
            Err(BridgeError::OnLoopThread)
        );
        assert_eq!(handle.join().await, Ok(1));
    }

    #[tokio::test]
    async fn test_fire_and_forget_swallows_failures() {
        let bridge = AsyncBridge::start(Handle::current());
        let ran = Arc::new(AtomicUsize::new(0));

        let r = ran.clone();
        bridge.fire_and_forget("failing", async move {
            r.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>("radio unavailable")
        });
        let r = ran.clone();
        bridge.fire_and_forget("panicking", async move {
            r.fetch_add(1, Ordering::SeqCst);
            if true {
                panic!("boom");
            }
            Ok::<(), String>(())
        });

        for _ in 0..50 {
            if ran.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }
}
