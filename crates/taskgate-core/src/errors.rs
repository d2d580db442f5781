//! Error hierarchy for the gateway.
//!
//! Every error is terminal for the session that encounters it and maps to
//! exactly one client-facing message. Responses always carry HTTP 200; the
//! error is signaled in the JSON body (`status: "error"`), so the messages
//! here are part of the wire compatibility contract.

use thiserror::Error;

/// Top-level error type for gateway sessions.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Task id failed the configured character-set/length validation.
    ///
    /// Deliberately indistinguishable from a missing task on the wire.
    #[error("invalid task id: {0}")]
    Validation(String),

    /// No stored result for the task.
    #[error("task not found")]
    NotFound,

    /// Key/value store or bus transport failure.
    #[error("backend error: {0}")]
    Backend(String),

    /// The stored task envelope was not valid JSON.
    #[error("JSON parse failure reading task data: {0}")]
    Parse(String),

    /// A newer concurrent watcher for the same task won arbitration.
    #[error("superseded by a newer request for this task")]
    Superseded,

    /// Unrecognized mode query parameter on the request URL.
    #[error("invalid mode")]
    InvalidMode,
}

impl GatewayError {
    /// The message placed in the response body's `error_message` field.
    ///
    /// Validation failures are reported as "Not Found" so probing requests
    /// cannot distinguish a malformed id from an absent task.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            Self::Validation(_) | Self::NotFound => "Not Found".into(),
            Self::Backend(_) => "Backend error".into(),
            Self::Parse(detail) => {
                format!("JSON parse failure reading task data: {detail}")
            }
            Self::Superseded => {
                "Killed due to another concurrent request for this task".into()
            }
            Self::InvalidMode => "Invalid mode".into(),
        }
    }
}
