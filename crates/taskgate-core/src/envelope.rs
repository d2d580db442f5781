//! The task result envelope.
//!
//! External producers write a JSON envelope to the store under the task's
//! data key and publish the same shape on the task's channel. The gateway
//! only ever *inspects* the envelope — responses carry the verbatim stored
//! or published text, never a re-serialization, so unknown fields pass
//! through untouched.

use serde::Deserialize;
use serde_json::Value;

use crate::token::WatcherToken;

/// Envelope `status` values the gateway reacts to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Terminal result; the envelope is the final answer.
    Done,
    /// Intermediate or refreshed result.
    Update,
    /// Duplicate-watcher arbitration broadcast.
    Kill,
    /// Anything else; ignored while waiting.
    #[serde(other)]
    Other,
}

/// Parsed view of a stored or published task envelope.
#[derive(Clone, Debug, Deserialize)]
pub struct ResultEnvelope {
    /// Task status.
    pub status: TaskStatus,
    /// Inline result payload, if the producer included one.
    #[serde(default)]
    pub data: Option<Value>,
    /// Publishing session's token; set on `kill` broadcasts.
    #[serde(default)]
    pub src: Option<String>,
}

impl ResultEnvelope {
    /// Parse an envelope from raw JSON text.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Whether this envelope carries a result the client can receive
    /// (inline, or by a follow-up store read).
    #[must_use]
    pub fn is_result(&self) -> bool {
        matches!(self.status, TaskStatus::Done | TaskStatus::Update)
    }
}

/// Serialize the kill broadcast a watch session publishes after its
/// post-subscribe read.
#[must_use]
pub fn kill_payload(src: &WatcherToken) -> String {
    serde_json::json!({
        "status": "kill",
        "src": src.as_str(),
    })
    .to_string()
}
