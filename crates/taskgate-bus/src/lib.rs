//! # taskgate-bus
//!
//! The subscription-multiplexing core of the gateway:
//!
//! - [`backend`] — the seams to the external key/value store and pub/sub
//!   bus: [`KvStore`], [`BusPublisher`], [`BusTransport`]
//! - [`connection`] — [`BusConnection`], one physical pub/sub session
//!   carrying up to a fixed number of logical channel subscriptions with
//!   reference counting, deferred subscribes, reconnect, and idle pings
//! - [`pool`] — [`ConnectionPool`], best-fit packing of logical channels
//!   onto few physical connections, with idle reclamation
//! - [`memory`] — an in-process backend implementing all three seams,
//!   used by tests and the embedded binary mode

#![deny(unsafe_code)]

pub mod backend;
pub mod connection;
pub mod memory;
pub mod pool;

pub use backend::{BusCommand, BusError, BusEvent, BusHandle, BusPublisher, BusTransport, KvStore};
pub use connection::{BusConnection, ChannelEvent, ChannelHandler};
pub use memory::MemoryBackend;
pub use pool::{ChannelGuard, ConnectionPool};
