//! Per-sender session state record.

use serde::{Deserialize, Serialize};

/// Language assigned to senders we know nothing about.
pub const DEFAULT_LANG: &str = "ru";

/// Flow position of a fresh or reset conversation.
pub const START_STEP: &str = "start";

/// Conversational position of a single sender.
///
/// Stored as JSON with camelCase field names. Optional fields are written
/// as explicit `null`, and unknown fields are ignored when reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    /// Preferred language
    #[serde(default = "default_lang")]
    pub lang: String,

    /// Current position in the conversational flow
    #[serde(default = "default_step")]
    pub step: String,

    /// Selected organization identifier
    #[serde(default)]
    pub org: Option<String>,

    /// Previous flow position
    #[serde(default)]
    pub prev_step: Option<String>,

    /// Unix timestamp (milliseconds) of the last write
    #[serde(default)]
    pub last_activity: i64,

    /// True only for a synthesized state of a sender with no stored record
    #[serde(default)]
    pub is_first_visit: bool,
}

fn default_lang() -> String {
    DEFAULT_LANG.to_string()
}

fn default_step() -> String {
    START_STEP.to_string()
}

impl SessionState {
    /// State handed out for a sender with no usable stored record.
    pub fn first_visit(now_ms: i64) -> Self {
        Self {
            lang: default_lang(),
            step: default_step(),
            org: None,
            prev_step: None,
            last_activity: now_ms,
            is_first_visit: true,
        }
    }

    /// Start-of-flow state for a returning sender, keeping only the language.
    pub fn reset_after_timeout(&self, now_ms: i64) -> Self {
        let lang = if self.lang.is_empty() {
            default_lang()
        } else {
            self.lang.clone()
        };

        Self {
            lang,
            step: default_step(),
            org: None,
            prev_step: None,
            last_activity: now_ms,
            is_first_visit: false,
        }
    }

    /// Whether more than `timeout_ms` has passed since the last write.
    pub fn is_expired(&self, now_ms: i64, timeout_ms: i64) -> bool {
        now_ms.saturating_sub(self.last_activity) > timeout_ms
    }
}

/// Current wall-clock time in Unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
