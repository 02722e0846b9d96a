//! JSON codec for stored session records.

use crate::error::CodecError;
use crate::state::SessionState;

/// Encode a session record into its stored text form.
pub fn encode(state: &SessionState) -> Result<String, CodecError> {
    serde_json::to_string(state).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Decode a stored session record.
///
/// Unknown fields are ignored and missing fields take their defaults.
pub fn decode(text: &str) -> Result<SessionState, CodecError> {
    serde_json::from_str(text).map_err(|e| CodecError::Decode(e.to_string()))
}
