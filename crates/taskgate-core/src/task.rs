//! Task identity and key derivation.
//!
//! A [`TaskId`] is an opaque string validated against an allow-listed
//! character set and a maximum length before the core ever sees it. From a
//! task id the [`KeySpace`] derives the two backend names the gateway
//! touches: the data key holding the result envelope and the pub/sub
//! channel carrying update notifications. Both are namespaced with a
//! process-wide prefix so several deployments can share one backend.

use regex::Regex;

use crate::errors::GatewayError;

/// Default allow-list for task ids.
pub const DEFAULT_TASK_ID_PATTERN: &str = "^[A-Za-z0-9_]+$";

/// Default maximum task id length.
pub const DEFAULT_MAX_TASK_ID_LENGTH: usize = 32;

/// Default key/channel prefix.
pub const DEFAULT_KEY_PREFIX: &str = "RA_";

/// Validation rules for task ids, compiled once at startup.
#[derive(Debug, Clone)]
pub struct TaskIdRules {
    pattern: Regex,
    max_length: usize,
}

impl TaskIdRules {
    /// Compile rules from a pattern string and a maximum length.
    pub fn new(pattern: &str, max_length: usize) -> Result<Self, GatewayError> {
        let pattern = Regex::new(pattern)
            .map_err(|e| GatewayError::Validation(format!("bad task id pattern: {e}")))?;
        Ok(Self {
            pattern,
            max_length,
        })
    }

    /// Maximum accepted id length.
    #[must_use]
    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Default for TaskIdRules {
    fn default() -> Self {
        Self::new(DEFAULT_TASK_ID_PATTERN, DEFAULT_MAX_TASK_ID_LENGTH)
            .expect("default pattern compiles")
    }
}

/// A validated task identifier.
///
/// Can only be constructed through [`TaskId::parse`], so holding a `TaskId`
/// is proof the id passed validation.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TaskId(String);

impl TaskId {
    /// Validate a raw id against the configured rules.
    pub fn parse(raw: &str, rules: &TaskIdRules) -> Result<Self, GatewayError> {
        if raw.is_empty() {
            return Err(GatewayError::Validation("empty task id".into()));
        }
        if raw.len() > rules.max_length {
            return Err(GatewayError::Validation(format!(
                "task id exceeds {} characters",
                rules.max_length
            )));
        }
        if !rules.pattern.is_match(raw) {
            return Err(GatewayError::Validation(format!(
                "task id contains disallowed characters: {raw:?}"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives backend names for a task under a process-wide prefix.
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    /// Create a key space with the given prefix.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Key/value store key holding the task's result envelope.
    #[must_use]
    pub fn data_key(&self, task: &TaskId) -> String {
        format!("{}D_{}", self.prefix, task.as_str())
    }

    /// Pub/sub channel carrying the task's status updates.
    #[must_use]
    pub fn channel_name(&self, task: &TaskId) -> String {
        format!("{}SC_{}", self.prefix, task.as_str())
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}
