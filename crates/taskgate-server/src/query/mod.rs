//! Poll and watch query sessions.

pub mod poll;
pub mod watch;

pub use poll::PollQuery;
pub use watch::WatchQuery;

use taskgate_core::GatewayError;

/// Build the JSON error body every failed query responds with.
///
/// The shape (`status` / `error_message`, HTTP 200) is a compatibility
/// contract with existing clients.
#[must_use]
pub fn error_body(err: &GatewayError) -> String {
    serde_json::json!({
        "status": "error",
        "error_message": err.client_message(),
    })
    .to_string()
}
