//! Watcher tokens.
//!
//! Every watch session carries a process-unique token which it embeds in
//! its kill broadcast. A session receiving a kill whose `src` equals its
//! own token is observing its own broadcast and must ignore it.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A process-unique token identifying one watch session on the bus.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WatcherToken(String);

impl WatcherToken {
    /// Generate a fresh token (UUID v7, time-ordered).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// The token as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether a kill broadcast's `src` field names this session.
    #[must_use]
    pub fn matches(&self, src: Option<&str>) -> bool {
        src == Some(self.0.as_str())
    }
}

impl Default for WatcherToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WatcherToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
