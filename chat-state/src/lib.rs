//! Chat State - per-sender conversational state cache backed by Redis.
//!
//! This crate provides:
//! - The session state record and its JSON codec
//! - Key-value store backends (Redis, in-memory)
//! - A shared connection manager with single-flight setup and reconnect backoff
//! - The session store: get/set/delete with session timeout and safe fallbacks
//! - Configuration loading and logging setup

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod backend;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod state;
pub mod store;

pub use backend::{Connector, KvConnection, MemoryConnector, RedisConnector};
pub use config::Config;
pub use connection::{ConnectionEvent, ConnectionManager, ReconnectPolicy};
pub use error::{CodecError, ConfigError, ConnectionError, StoreError};
pub use state::SessionState;
pub use store::{SessionPolicy, SessionStore};

/// Re-export commonly used types for convenience
pub mod prelude {
    pub use crate::backend::{Connector, KvConnection};
    pub use crate::config::Config;
    pub use crate::connection::ConnectionManager;
    pub use crate::logging::{init_logging, LogFormat};
    pub use crate::state::SessionState;
    pub use crate::store::{SessionPolicy, SessionStore};
}
