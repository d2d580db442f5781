//! Shared gateway context.
//!
//! One explicitly constructed context object carries every collaborator
//! a query session needs: the key/value store, the bus publisher, the
//! subscriber connection pool, key derivation, and validation rules. It
//! is built once in `main` and passed down; nothing in the gateway
//! reaches for globals.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use taskgate_bus::pool::ConnectionPool;
use taskgate_bus::{BusPublisher, KvStore};
use taskgate_core::{KeySpace, TaskIdRules};

/// Collaborators and policy shared by all query sessions.
pub struct GatewayContext {
    /// Read-only key/value store.
    pub kv: Arc<dyn KvStore>,
    /// Publish side of the bus (kill broadcasts).
    pub publisher: Arc<dyn BusPublisher>,
    /// Subscriber connection pool.
    pub pool: Arc<ConnectionPool>,
    /// Key and channel derivation.
    pub keyspace: KeySpace,
    /// Task id validation rules.
    pub rules: TaskIdRules,
    /// Keep-alive whitespace interval for open watch responses
    /// (zero disables).
    pub keepalive: Duration,
    query_counter: AtomicU64,
}

impl GatewayContext {
    /// Assemble a context.
    #[must_use]
    pub fn new(
        kv: Arc<dyn KvStore>,
        publisher: Arc<dyn BusPublisher>,
        pool: Arc<ConnectionPool>,
        keyspace: KeySpace,
        rules: TaskIdRules,
        keepalive: Duration,
    ) -> Self {
        Self {
            kv,
            publisher,
            pool,
            keyspace,
            rules,
            keepalive,
            query_counter: AtomicU64::new(0),
        }
    }

    /// Next per-process query id, for log correlation.
    pub fn next_query_id(&self) -> u64 {
        self.query_counter.fetch_add(1, Ordering::Relaxed)
    }
}
