//! Per-sender session state over the shared store connection.
//!
//! The public `get`, `set` and `delete` never fail: a store outage shows up
//! to the chat flow as a new or reset conversation. The `try_*` variants
//! return the underlying typed error for callers that want to observe it.

use std::time::Duration;

use crate::backend::{Connector, KvConnection};
use crate::codec;
use crate::config::SessionConfig;
use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::state::{now_millis, SessionState};

/// Session lifetime rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPolicy {
    /// Inactivity after which a session restarts from the beginning of the flow
    pub session_timeout: Duration,
    /// Store-side expiry, refreshed on every write
    pub record_ttl: Duration,
    pub key_prefix: String,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for SessionPolicy {
    fn from(config: &SessionConfig) -> Self {
        Self {
            session_timeout: Duration::from_secs(config.timeout_secs),
            record_ttl: Duration::from_secs(config.record_ttl_secs),
            key_prefix: config.key_prefix.clone(),
        }
    }
}

impl SessionPolicy {
    fn timeout_millis(&self) -> i64 {
        i64::try_from(self.session_timeout.as_millis()).unwrap_or(i64::MAX)
    }
}

/// Session state cache keyed by sender.
pub struct SessionStore<C: Connector> {
    connections: ConnectionManager<C>,
    policy: SessionPolicy,
}

impl<C: Connector> SessionStore<C> {
    pub fn new(connections: ConnectionManager<C>, policy: SessionPolicy) -> Self {
        Self {
            connections,
            policy,
        }
    }

    pub fn connections(&self) -> &ConnectionManager<C> {
        &self.connections
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    /// Store key for `sender`. The sender is used verbatim.
    pub fn key_for(&self, sender: &str) -> String {
        format!("{}{}", self.policy.key_prefix, sender)
    }

    /// Resolve the current state for `sender`.
    ///
    /// Unknown senders get a first-visit state. A stored state idle for longer
    /// than the session timeout comes back reset, keeping only its language.
    /// Nothing is written back in either case.
    pub async fn try_get(&self, sender: &str) -> Result<SessionState> {
        let conn = self.connections.acquire().await?;
        let raw = conn.get(&self.key_for(sender)).await?;
        let now = now_millis();

        let Some(raw) = raw else {
            tracing::debug!(sender = %sender, "No stored state, new sender");
            return Ok(SessionState::first_visit(now));
        };

        let state = codec::decode(&raw)?;
        if state.is_expired(now, self.policy.timeout_millis()) {
            tracing::debug!(
                sender = %sender,
                idle_ms = now - state.last_activity,
                "Session timed out, resetting flow"
            );
            return Ok(state.reset_after_timeout(now));
        }

        Ok(state)
    }

    /// Persist `state` for `sender`, stamping its `last_activity` first.
    ///
    /// The stamp is applied to the caller's record only once a connection is
    /// available.
    pub async fn try_set(&self, sender: &str, state: &mut SessionState) -> Result<()> {
        let conn = self.connections.acquire().await?;
        state.last_activity = now_millis();

        let value = codec::encode(state)?;
        conn.set_ex(&self.key_for(sender), &value, self.policy.record_ttl.as_secs())
            .await?;

        tracing::debug!(sender = %sender, step = %state.step, "State saved");
        Ok(())
    }

    /// Remove the stored state for `sender`.
    pub async fn try_delete(&self, sender: &str) -> Result<()> {
        let conn = self.connections.acquire().await?;
        conn.del(&self.key_for(sender)).await?;

        tracing::debug!(sender = %sender, "State deleted");
        Ok(())
    }

    /// Like [`try_get`](Self::try_get), falling back to a first-visit state on any error.
    pub async fn get(&self, sender: &str) -> SessionState {
        match self.try_get(sender).await {
            Ok(state) => state,
            Err(e) => {
                tracing::error!(
                    sender = %sender,
                    kind = e.kind(),
                    error = %e,
                    "Failed to load session state, treating as new sender"
                );
                SessionState::first_visit(now_millis())
            }
        }
    }

    /// Like [`try_set`](Self::try_set), dropping the write on any error.
    pub async fn set(&self, sender: &str, state: &mut SessionState) {
        if let Err(e) = self.try_set(sender, state).await {
            tracing::error!(
                sender = %sender,
                kind = e.kind(),
                error = %e,
                "Failed to save session state"
            );
        }
    }

    /// Like [`try_delete`](Self::try_delete), ignoring any error.
    pub async fn delete(&self, sender: &str) {
        if let Err(e) = self.try_delete(sender).await {
            tracing::error!(
                sender = %sender,
                kind = e.kind(),
                error = %e,
                "Failed to delete session state"
            );
        }
    }

    /// Health check: verify the store answers a PING.
    pub async fn health_check(&self) -> bool {
        let result = match self.connections.acquire().await {
            Ok(conn) => conn.ping().await,
            Err(e) => Err(e.into()),
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Store health check failed");
                false
            }
        }
    }
}
