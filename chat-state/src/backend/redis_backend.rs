use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;

use super::{Connector, KvConnection};
use crate::error::{ConnectionError, Result, StoreError};

/// Opens multiplexed connections to a Redis server.
pub struct RedisConnector {
    client: redis::Client,
}

impl RedisConnector {
    /// Create a connector for a `redis://` or `rediss://` URL.
    ///
    /// Only parses the URL; no network traffic happens until [`Connector::connect`].
    pub fn new(url: &str) -> std::result::Result<Self, ConnectionError> {
        let client =
            redis::Client::open(url).map_err(|e| ConnectionError::InvalidUrl(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Connector for RedisConnector {
    type Connection = RedisConnection;

    fn name(&self) -> &str {
        "redis"
    }

    async fn connect(&self) -> std::result::Result<RedisConnection, ConnectionError> {
        let inner = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| ConnectionError::Connect(e.to_string()))?;

        Ok(RedisConnection {
            inner,
            open: Arc::new(AtomicBool::new(true)),
        })
    }
}

/// Shared Redis handle.
///
/// The multiplexed connection does not reconnect on its own, so the first
/// command that observes a dropped socket marks every clone closed.
#[derive(Clone)]
pub struct RedisConnection {
    inner: MultiplexedConnection,
    open: Arc<AtomicBool>,
}

impl fmt::Debug for RedisConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisConnection")
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl RedisConnection {
    fn track<T>(&self, result: redis::RedisResult<T>) -> Result<T> {
        result.map_err(|e| {
            let err = StoreError::from(e);
            if err.is_connection_loss() {
                self.open.store(false, Ordering::SeqCst);
                tracing::warn!(error = %err, "Redis connection lost");
            }
            err
        })
    }
}

#[async_trait]
impl KvConnection for RedisConnection {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.inner.clone();
        let result = redis::cmd("GET")
            .arg(key)
            .query_async::<Option<String>>(&mut conn)
            .await;
        self.track(result)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.inner.clone();
        let result = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs)
            .query_async::<()>(&mut conn)
            .await;
        self.track(result)
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.inner.clone();
        let result = redis::cmd("DEL").arg(key).query_async::<i64>(&mut conn).await;
        self.track(result).map(|_| ())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.inner.clone();
        let result = redis::cmd("PING").query_async::<String>(&mut conn).await;
        match self.track(result)? {
            reply if reply == "PONG" => Ok(()),
            reply => Err(StoreError::transport(format!("Unexpected PING reply: {reply}"))),
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
