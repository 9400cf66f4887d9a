//! Wire envelope for named events.
//!
//! Every message on the channel, in either direction, is a named event with
//! an arbitrary JSON payload:
//!
//! ```text
//! {"event": "postLiked", "data": {"postId": "p1", "by": "u9"}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named event and its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event name used for listener dispatch.
    pub event: String,
    /// Event payload. Missing payloads decode as `null`.
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// Create an envelope.
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self { event: event.into(), data }
    }

    /// Encode as a JSON text frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode a JSON text frame.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
