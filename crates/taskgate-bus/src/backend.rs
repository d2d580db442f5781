//! Backend seams: key/value store, publisher, and pub/sub transport.
//!
//! The gateway is a read-only consumer of the store and a subscriber (plus
//! kill-broadcast publisher) on the bus. Both are reached through traits so
//! the whole core runs against the in-memory backend in tests and embedded
//! deployments, with a networked client slotting in behind the same seams.

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Errors from the backend store or bus transport.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Transport-level failure (connect, read, write).
    #[error("bus transport error: {0}")]
    Transport(String),
    /// The session or backend has been closed.
    #[error("bus session closed")]
    Closed,
}

/// Read-only key/value store access.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch the raw value stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>, BusError>;
}

/// Publish-side access to the bus.
///
/// Kept separate from [`BusTransport`]: publishing goes over a shared
/// command connection, never over a pooled subscriber session (the bus
/// protocol forbids non-pub/sub commands while subscribed).
#[async_trait]
pub trait BusPublisher: Send + Sync {
    /// Publish `payload` to every current subscriber of `channel`.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError>;
}

/// Factory for physical pub/sub sessions.
pub trait BusTransport: Send + Sync {
    /// Open a new session. The returned handle's event stream reports
    /// `Ready` once the session can accept subscribe commands.
    fn connect(&self) -> Result<BusHandle, BusError>;
}

/// Commands the gateway issues on a subscriber session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusCommand {
    /// Subscribe to a channel.
    Subscribe(String),
    /// Unsubscribe from a channel.
    Unsubscribe(String),
    /// Keep-alive no-op, only legal while nothing is subscribed.
    Ping,
}

/// Events a subscriber session delivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// The session is connected and may subscribe.
    Ready,
    /// The bus acknowledged a subscribe for the named channel.
    SubscribeAck(String),
    /// A message published on a subscribed channel.
    Message {
        /// Channel the message arrived on.
        channel: String,
        /// Verbatim message payload.
        payload: String,
    },
    /// Transport failure; the session is no longer usable.
    Error(String),
}

/// One physical pub/sub session: a command sender paired with the
/// session's event stream.
pub struct BusHandle {
    /// Commands toward the bus.
    pub commands: mpsc::UnboundedSender<BusCommand>,
    /// Events from the bus, per-channel FIFO.
    pub events: mpsc::UnboundedReceiver<BusEvent>,
}
