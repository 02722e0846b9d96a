//! Shared store connection with single-flight setup and reconnect backoff.
//!
//! # Lifecycle
//!
//! - `Unset` → `Connecting` on the first `acquire()`
//! - `Connecting` → `Open` when setup succeeds, `Failed` once retries run out
//! - `Open` whose handle reports closed, or `Failed`, → `Connecting` on the next `acquire()`
//! - `close()` returns any state to `Unset`, aborting a setup in progress
//!
//! Only one setup runs at a time. It is spawned as its own task, and every
//! caller that arrives while it runs waits for the same outcome, so a caller
//! that gives up does not cancel the attempt for the others.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::backend::{Connector, KvConnection};
use crate::config::StoreConfig;
use crate::error::ConnectionError;

/// Linear reconnect backoff: the n-th retry waits `n × step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub step: Duration,
    pub max_retries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            step: Duration::from_millis(100),
            max_retries: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `retry` (1-based), `None` once the budget is spent.
    pub fn delay_for(&self, retry: u32) -> Option<Duration> {
        (retry <= self.max_retries).then(|| self.step * retry)
    }
}

/// Connection lifecycle notifications, for diagnostics only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConnectionEvent {
    Connecting { attempt: u32 },
    Ready,
    Error { message: String },
    Reconnecting { retry: u32, delay_ms: u64 },
    Closed,
}

type Outcome<T> = Option<Result<T, ConnectionError>>;

enum ConnectionState<T> {
    Unset,
    Connecting {
        /// Identifies the setup task allowed to publish into this state.
        generation: u64,
        outcome: watch::Receiver<Outcome<T>>,
        task: JoinHandle<()>,
    },
    Open(T),
    Failed(ConnectionError),
}

impl<T> ConnectionState<T> {
    const fn label(&self) -> &'static str {
        match self {
            Self::Unset => "unset",
            Self::Connecting { .. } => "connecting",
            Self::Open(_) => "open",
            Self::Failed(_) => "failed",
        }
    }
}

struct Inner<C: Connector> {
    connector: C,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    state: Mutex<ConnectionState<C::Connection>>,
    generations: AtomicU64,
    events: broadcast::Sender<ConnectionEvent>,
}

/// Owns the single connection shared by every session store operation.
///
/// Construct once at startup and hand clones to whoever needs a handle;
/// clones share the same underlying state.
pub struct ConnectionManager<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> ConnectionManager<C> {
    /// Create a manager. No connection is made until the first [`acquire`](Self::acquire).
    pub fn new(connector: C, policy: ReconnectPolicy, connect_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                connector,
                policy,
                connect_timeout,
                state: Mutex::new(ConnectionState::Unset),
                generations: AtomicU64::new(0),
                events,
            }),
        }
    }

    /// Create a manager using the reconnect settings from `config`.
    pub fn from_config(connector: C, config: &StoreConfig) -> Self {
        Self::new(connector, config.reconnect_policy(), config.connect_timeout())
    }

    /// Get a ready handle, connecting first if no open handle exists.
    pub async fn acquire(&self) -> Result<C::Connection, ConnectionError> {
        let mut outcome = {
            let mut state = self.inner.lock_state();
            match &*state {
                ConnectionState::Open(conn) if conn.is_open() => return Ok(conn.clone()),
                ConnectionState::Connecting { outcome, .. } if outcome.has_changed().is_ok() => {
                    outcome.clone()
                }
                previous => {
                    if matches!(previous, ConnectionState::Open(_)) {
                        tracing::info!(backend = %self.inner.connector.name(), "Store connection closed, reconnecting");
                    }
                    let generation = self.inner.generations.fetch_add(1, Ordering::SeqCst) + 1;
                    let (tx, rx) = watch::channel(None);
                    let inner = Arc::clone(&self.inner);
                    let task = tokio::spawn(async move { inner.establish(generation, tx).await });
                    *state = ConnectionState::Connecting {
                        generation,
                        outcome: rx.clone(),
                        task,
                    };
                    rx
                }
            }
        };

        let result = match outcome.wait_for(Option::is_some).await {
            Ok(ready) => (*ready).clone(),
            Err(_) => None,
        };
        result.unwrap_or(Err(ConnectionError::Aborted))
    }

    /// Drop the shared handle. The next `acquire` connects again.
    ///
    /// A setup in progress is aborted and its waiters get
    /// [`ConnectionError::Aborted`].
    pub fn close(&self) {
        let previous = std::mem::replace(&mut *self.inner.lock_state(), ConnectionState::Unset);
        match previous {
            ConnectionState::Open(_) => self.inner.emit(ConnectionEvent::Closed),
            ConnectionState::Connecting { task, .. } => {
                task.abort();
                tracing::info!(backend = %self.inner.connector.name(), "Store connection setup cancelled");
            }
            ConnectionState::Unset | ConnectionState::Failed(_) => {}
        }
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Current state name: `unset`, `connecting`, `open` or `failed`.
    pub fn state_label(&self) -> &'static str {
        self.inner.lock_state().label()
    }

    /// Error that ended the most recent failed setup, if the manager is in `failed`.
    pub fn last_error(&self) -> Option<ConnectionError> {
        match &*self.inner.lock_state() {
            ConnectionState::Failed(err) => Some(err.clone()),
            _ => None,
        }
    }

    pub fn backend_name(&self) -> &str {
        self.inner.connector.name()
    }
}

impl<C: Connector> Inner<C> {
    fn lock_state(&self) -> MutexGuard<'_, ConnectionState<C::Connection>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn establish(self: Arc<Self>, generation: u64, tx: watch::Sender<Outcome<C::Connection>>) {
        let result = self.connect_with_retry().await;

        {
            let mut state = self.lock_state();
            let owned = matches!(
                &*state,
                ConnectionState::Connecting { generation: current, .. } if *current == generation
            );
            if !owned {
                // Closed while connecting; the result belongs to nobody.
                tracing::debug!(backend = %self.connector.name(), generation, "Discarding stale connection setup");
                return;
            }
            *state = match &result {
                Ok(conn) => ConnectionState::Open(conn.clone()),
                Err(err) => ConnectionState::Failed(err.clone()),
            };
        }
        tx.send_replace(Some(result));
    }

    async fn connect_with_retry(&self) -> Result<C::Connection, ConnectionError> {
        let mut retries = 0;
        loop {
            self.emit(ConnectionEvent::Connecting {
                attempt: retries + 1,
            });

            let err = match tokio::time::timeout(self.connect_timeout, self.connector.connect())
                .await
            {
                Ok(Ok(conn)) => {
                    self.emit(ConnectionEvent::Ready);
                    return Ok(conn);
                }
                Ok(Err(err)) => err,
                Err(_) => ConnectionError::Timeout(
                    u64::try_from(self.connect_timeout.as_millis()).unwrap_or(u64::MAX),
                ),
            };

            self.emit(ConnectionEvent::Error {
                message: err.to_string(),
            });
            if matches!(err, ConnectionError::InvalidUrl(_)) {
                return Err(err);
            }

            retries += 1;
            let Some(delay) = self.policy.delay_for(retries) else {
                let exhausted = ConnectionError::RetriesExhausted {
                    retries: self.policy.max_retries,
                    last_error: err.to_string(),
                };
                tracing::error!(backend = %self.connector.name(), error = %exhausted, "Abandoning store connection attempt");
                return Err(exhausted);
            };

            self.emit(ConnectionEvent::Reconnecting {
                retry: retries,
                delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            });
            tokio::time::sleep(delay).await;
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        let backend = self.connector.name();
        match &event {
            ConnectionEvent::Connecting { attempt } => {
                tracing::debug!(backend = %backend, attempt, "Connecting to store");
            }
            ConnectionEvent::Ready => tracing::info!(backend = %backend, "Connected to store"),
            ConnectionEvent::Error { message } => {
                tracing::error!(backend = %backend, error = %message, "Store connection error");
            }
            ConnectionEvent::Reconnecting { retry, delay_ms } => {
                tracing::warn!(backend = %backend, retry, delay_ms, "Retrying store connection");
            }
            ConnectionEvent::Closed => tracing::info!(backend = %backend, "Store connection closed"),
        }
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use async_trait::async_trait;

    use super::*;
    use crate::backend::{MemoryConnection, MemoryConnector};

    /// Panics on its first connect, then delegates to the memory store.
    struct PanicOnceConnector {
        store: MemoryConnector,
        panicked: AtomicBool,
    }

    #[async_trait]
    impl Connector for PanicOnceConnector {
        type Connection = MemoryConnection;

        fn name(&self) -> &str {
            "panic-once"
        }

        async fn connect(&self) -> Result<MemoryConnection, ConnectionError> {
            if !self.panicked.swap(true, Ordering::SeqCst) {
                panic!("connector crashed");
            }
            self.store.connect().await
        }
    }

    fn fast_policy() -> ReconnectPolicy {
        ReconnectPolicy {
            step: Duration::from_millis(1),
            max_retries: 10,
        }
    }

    fn manager(store: &MemoryConnector) -> ConnectionManager<MemoryConnector> {
        ConnectionManager::new(store.clone(), fast_policy(), Duration::from_secs(5))
    }

    #[test]
    fn test_policy_delays_are_linear() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_for(4), Some(Duration::from_millis(400)));
        assert_eq!(policy.delay_for(10), Some(Duration::from_millis(1000)));
        assert_eq!(policy.delay_for(11), None);
    }

    #[tokio::test]
    async fn test_reuses_open_handle() {
        let store = MemoryConnector::new();
        let manager = manager(&store);
        assert_eq!(manager.state_label(), "unset");

        manager.acquire().await.unwrap();
        manager.acquire().await.unwrap();

        assert_eq!(store.connect_attempts(), 1);
        assert_eq!(manager.state_label(), "open");
    }

    #[tokio::test]
    async fn test_concurrent_acquire_shares_one_setup() {
        let store = MemoryConnector::new().with_connect_delay(Duration::from_millis(50));
        let manager = manager(&store);

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.acquire().await.is_ok() })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap());
        }

        assert_eq!(store.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_retries_until_connected() {
        let store = MemoryConnector::new();
        store.fail_next_connects(3);
        let manager = manager(&store);
        let mut events = manager.subscribe();

        manager.acquire().await.unwrap();
        assert_eq!(store.connect_attempts(), 4);

        let mut retries = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ConnectionEvent::Reconnecting { retry, delay_ms } = event {
                retries.push((retry, delay_ms));
            }
        }
        assert_eq!(retries, vec![(1, 1), (2, 2), (3, 3)]);
    }

    #[tokio::test]
    async fn test_gives_up_after_retry_budget() {
        let store = MemoryConnector::new();
        store.set_reachable(false);
        let manager = manager(&store);

        let err = manager.acquire().await.unwrap_err();
        assert!(matches!(err, ConnectionError::RetriesExhausted { retries: 10, .. }));
        assert_eq!(store.connect_attempts(), 11);
        assert_eq!(manager.state_label(), "failed");
        assert_eq!(manager.last_error(), Some(err));
    }

    #[tokio::test]
    async fn test_failed_setup_is_retried_fresh() {
        let store = MemoryConnector::new();
        store.set_reachable(false);
        let manager = manager(&store);
        assert!(manager.acquire().await.is_err());

        store.set_reachable(true);
        manager.acquire().await.unwrap();

        assert_eq!(store.connect_attempts(), 12);
        assert!(manager.last_error().is_none());
    }

    #[tokio::test]
    async fn test_reconnects_when_handle_closes() {
        let store = MemoryConnector::new();
        let manager = manager(&store);

        let first = manager.acquire().await.unwrap();
        store.sever();
        assert!(!first.is_open());

        let second = manager.acquire().await.unwrap();
        assert!(second.is_open());
        assert_eq!(store.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_abandoned_caller_does_not_cancel_setup() {
        let store = MemoryConnector::new().with_connect_delay(Duration::from_millis(100));
        let manager = manager(&store);

        let abandoned = tokio::time::timeout(Duration::from_millis(10), manager.acquire()).await;
        assert!(abandoned.is_err());
        assert_eq!(manager.state_label(), "connecting");

        manager.acquire().await.unwrap();
        assert_eq!(store.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_connect_timeout_counts_as_failed_attempt() {
        let store = MemoryConnector::new().with_connect_delay(Duration::from_millis(200));
        let policy = ReconnectPolicy {
            step: Duration::from_millis(1),
            max_retries: 1,
        };
        let manager = ConnectionManager::new(store.clone(), policy, Duration::from_millis(10));

        let err = manager.acquire().await.unwrap_err();
        match err {
            ConnectionError::RetriesExhausted { last_error, .. } => {
                assert!(last_error.contains("timed out"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_close_resets_and_emits() {
        let store = MemoryConnector::new();
        let manager = manager(&store);
        manager.acquire().await.unwrap();
        let mut events = manager.subscribe();

        manager.close();
        assert_eq!(manager.state_label(), "unset");
        assert_eq!(events.try_recv().unwrap(), ConnectionEvent::Closed);

        manager.acquire().await.unwrap();
        assert_eq!(store.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_close_cancels_setup_in_progress() {
        let store = MemoryConnector::new().with_connect_delay(Duration::from_millis(50));
        let manager = manager(&store);

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.state_label(), "connecting");

        manager.close();
        assert_eq!(manager.state_label(), "unset");
        assert_eq!(waiter.await.unwrap().unwrap_err(), ConnectionError::Aborted);

        let conn = manager.acquire().await.unwrap();
        assert!(conn.is_open());

        // Long enough for a leftover setup to have finished and overwritten the state.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.state_label(), "open");
        assert_eq!(store.connect_attempts(), 2);
        assert_eq!(store.peak_concurrent_connects(), 1);
    }

    #[tokio::test]
    async fn test_dead_setup_task_aborts_waiters_and_starts_over() {
        let store = MemoryConnector::new();
        let connector = PanicOnceConnector {
            store: store.clone(),
            panicked: AtomicBool::new(false),
        };
        let manager = ConnectionManager::new(connector, fast_policy(), Duration::from_secs(5));

        assert_eq!(manager.acquire().await.unwrap_err(), ConnectionError::Aborted);
        assert_eq!(manager.state_label(), "connecting");

        let conn = manager.acquire().await.unwrap();
        assert!(conn.is_open());
        assert_eq!(manager.state_label(), "open");
        assert_eq!(store.connect_attempts(), 1);
    }
}
