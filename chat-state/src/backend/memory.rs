use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{Connector, KvConnection};
use crate::error::{ConnectionError, Result, StoreError};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
struct Shared {
    entries: Mutex<HashMap<String, Entry>>,
    unreachable: AtomicBool,
    /// Bumped by `sever`; handles from an older epoch are closed.
    epoch: AtomicU64,
    connect_attempts: AtomicU64,
    failing_connects: AtomicU32,
    connect_delay_ms: AtomicU64,
    connects_in_flight: AtomicU64,
    peak_connects_in_flight: AtomicU64,
}

impl Shared {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Counts a connect attempt as in flight until dropped.
struct InFlight<'a>(&'a Shared);

impl<'a> InFlight<'a> {
    fn enter(shared: &'a Shared) -> Self {
        let now = shared.connects_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        shared.peak_connects_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(shared)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.connects_in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-process store with per-key expiry.
///
/// Clones share the same data, so a test can keep one clone to inspect and
/// break the store while another is owned by a connection manager.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    shared: Arc<Shared>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every connect attempt by `delay`.
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.shared.connect_delay_ms.store(millis, Ordering::SeqCst);
        self
    }

    /// Simulate an outage. While unreachable, connects are refused and live
    /// handles report closed.
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Drop every live handle; the store itself stays reachable.
    pub fn sever(&self) {
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Refuse the next `count` connect attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.shared.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Total connect attempts seen so far.
    pub fn connect_attempts(&self) -> u64 {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    /// Most connect attempts ever running at the same time.
    pub fn peak_concurrent_connects(&self) -> u64 {
        self.shared.peak_connects_in_flight.load(Ordering::SeqCst)
    }

    /// Read a value directly, bypassing connection state.
    pub fn peek(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.shared
            .entries()
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone())
    }

    /// Write a value directly, bypassing connection state.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>, ttl: Option<Duration>) {
        let entry = Entry {
            value: value.into(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.shared.entries().insert(key.into(), entry);
    }

    /// Remaining time to live of `key`, `None` if absent or persistent.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.shared
            .entries()
            .get(key)
            .filter(|entry| entry.is_live(now))
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.shared
            .entries()
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Connection = MemoryConnection;

    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self) -> std::result::Result<MemoryConnection, ConnectionError> {
        self.shared.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight::enter(&self.shared);

        let delay = self.shared.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if self.shared.unreachable.load(Ordering::SeqCst) {
            return Err(ConnectionError::Connect("connection refused".to_string()));
        }

        let refused = self
            .shared
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ConnectionError::Connect("connection refused".to_string()));
        }

        Ok(MemoryConnection {
            shared: Arc::clone(&self.shared),
            epoch: self.shared.epoch.load(Ordering::SeqCst),
        })
    }
}

/// Handle onto a [`MemoryConnector`]'s data.
#[derive(Clone)]
pub struct MemoryConnection {
    shared: Arc<Shared>,
    epoch: u64,
}

impl fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("epoch", &self.epoch)
            .field("open", &self.is_open())
            .finish()
    }
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(StoreError::connection_lost("memory store connection closed"))
        }
    }
}

#[async_trait]
impl KvConnection for MemoryConnection {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut entries = self.shared.entries();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        self.ensure_open()?;
        let entry = Entry {
            value: value.to_string(),
            expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
        };
        self.shared.entries().insert(key.to_string(), entry);
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.ensure_open()?;
        self.shared.entries().remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.ensure_open()
    }

    fn is_open(&self) -> bool {
        !self.shared.unreachable.load(Ordering::SeqCst)
            && self.shared.epoch.load(Ordering::SeqCst) == self.epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_del() {
        let store = MemoryConnector::new();
        let conn = store.connect().await.unwrap();

        conn.set_ex("user:1", "v1", 60).await.unwrap();
        assert_eq!(conn.get("user:1").await.unwrap().as_deref(), Some("v1"));

        conn.set_ex("user:1", "v2", 60).await.unwrap();
        assert_eq!(conn.get("user:1").await.unwrap().as_deref(), Some("v2"));

        conn.del("user:1").await.unwrap();
        conn.del("user:1").await.unwrap();
        assert!(conn.get("user:1").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_expired_entries_are_absent() {
        let store = MemoryConnector::new();
        store.insert("user:old", "stale", Some(Duration::ZERO));
        let conn = store.connect().await.unwrap();

        assert!(conn.get("user:old").await.unwrap().is_none());
        assert!(store.peek("user:old").is_none());
    }

    #[tokio::test]
    async fn test_set_ex_records_ttl() {
        let store = MemoryConnector::new();
        let conn = store.connect().await.unwrap();
        conn.set_ex("k", "v", 3600).await.unwrap();

        let ttl = store.ttl("k").unwrap();
        assert!(ttl > Duration::from_secs(3590));
        assert!(ttl <= Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_unreachable_refuses_connects_and_closes_handles() {
        let store = MemoryConnector::new();
        let conn = store.connect().await.unwrap();
        assert!(conn.is_open());

        store.set_reachable(false);
        assert!(!conn.is_open());
        assert!(conn.get("k").await.unwrap_err().is_connection_loss());
        assert!(store.connect().await.is_err());

        store.set_reachable(true);
        assert!(conn.is_open());
    }

    #[tokio::test]
    async fn test_sever_closes_existing_handles_only() {
        let store = MemoryConnector::new();
        let old = store.connect().await.unwrap();
        store.sever();

        assert!(!old.is_open());
        let fresh = store.connect().await.unwrap();
        assert!(fresh.is_open());
        assert_eq!(store.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_fail_next_connects() {
        let store = MemoryConnector::new();
        store.fail_next_connects(2);

        assert!(store.connect().await.is_err());
        assert!(store.connect().await.is_err());
        assert!(store.connect().await.is_ok());
        assert_eq!(store.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_tracks_overlapping_connects() {
        let store = MemoryConnector::new().with_connect_delay(Duration::from_millis(20));
        let (a, b) = tokio::join!(store.connect(), store.connect());
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(store.peak_concurrent_connects(), 2);

        store.connect().await.unwrap();
        assert_eq!(store.peak_concurrent_connects(), 2);
    }

    #[tokio::test]
    async fn test_connection_debug_reports_open_state() {
        let store = MemoryConnector::new();
        let conn = store.connect().await.unwrap();
        let shown = format!("{conn:?}");
        assert!(shown.contains("MemoryConnection"));
        assert!(shown.contains("open: true"));

        store.sever();
        assert!(format!("{conn:?}").contains("open: false"));
    }
}
