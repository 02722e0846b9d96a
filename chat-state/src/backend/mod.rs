//! Key-value store backends.
//!
//! The session cache only needs four commands from its store: `GET`,
//! `SET .. EX`, `DEL` and `PING`. Two backends are provided:
//!
//! - **Redis**: the production store, over a multiplexed async connection
//! - **In-Memory**: for local development and testing, with simulated outages

mod memory;
mod redis_backend;

pub use self::memory::{MemoryConnection, MemoryConnector};
pub use self::redis_backend::{RedisConnection, RedisConnector};

use std::fmt;

use async_trait::async_trait;

use crate::error::{ConnectionError, Result};

/// A live handle to the store.
///
/// Handles are cheap to clone and every clone talks over the same
/// underlying connection.
#[async_trait]
pub trait KvConnection: Clone + fmt::Debug + Send + Sync + 'static {
    /// Fetch the value at `key`, `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` at `key`, replacing any prior value, expiring after `ttl_secs`.
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;

    /// Remove `key`. Removing an absent key succeeds.
    async fn del(&self, key: &str) -> Result<()>;

    /// Round-trip a no-op command.
    async fn ping(&self) -> Result<()>;

    /// Whether the handle can still carry commands.
    fn is_open(&self) -> bool;
}

/// Opens connections to a store.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: KvConnection;

    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Make a single connection attempt. Retrying is the caller's job.
    async fn connect(&self) -> std::result::Result<Self::Connection, ConnectionError>;
}
