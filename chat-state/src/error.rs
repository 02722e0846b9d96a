//! Error types for the chat state cache.
//!
//! None of these cross the public [`SessionStore`](crate::store::SessionStore)
//! operations; they exist so the internal paths stay typed and loggable.

use thiserror::Error;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Failures while establishing or holding the shared store connection.
///
/// Cloneable so a single connection attempt can hand the same outcome to
/// every caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Connection string could not be parsed.
    #[error("Invalid store URL: {0}")]
    InvalidUrl(String),

    /// A single connect attempt failed.
    #[error("Connection error: {0}")]
    Connect(String),

    /// A single connect attempt exceeded the connect timeout.
    #[error("Connection attempt timed out after {0}ms")]
    Timeout(u64),

    /// Reconnect budget spent; the attempt is abandoned.
    #[error("Gave up connecting after {retries} retries: {last_error}")]
    RetriesExhausted { retries: u32, last_error: String },

    /// The setup task ended without reporting a result.
    #[error("Connection setup aborted")]
    Aborted,
}

/// Failures while encoding or decoding a stored session record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Failed to encode session state: {0}")]
    Encode(String),

    #[error("Failed to decode session state: {0}")]
    Decode(String),
}

impl CodecError {
    pub const fn is_decode(&self) -> bool {
        matches!(self, Self::Decode(_))
    }
}

/// Unified error for a single store operation.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// No usable connection could be acquired.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Stored value is not a valid session record.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A get/set/del command failed mid-operation.
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        /// The underlying connection is gone and must be re-established.
        connection_lost: bool,
    },
}

impl StoreError {
    /// Create a transport error that leaves the connection usable.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            connection_lost: false,
        }
    }

    /// Create a transport error for a dropped connection.
    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            connection_lost: true,
        }
    }

    /// Check if the shared handle should be considered dead after this error.
    pub const fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            Self::Connection(_)
                | Self::Transport {
                    connection_lost: true,
                    ..
                }
        )
    }

    /// Short label used in structured logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Codec(_) => "decode",
            Self::Transport { .. } => "transport",
        }
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_dropped() || err.is_io_error() || err.is_connection_refusal() {
            Self::connection_lost(err.to_string())
        } else {
            Self::transport(err.to_string())
        }
    }
}

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config from {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config from {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}
