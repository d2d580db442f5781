//! # taskgate-core
//!
//! Foundation types for the taskgate gateway.
//!
//! This crate provides the shared vocabulary the other taskgate crates
//! depend on:
//!
//! - **Task identity**: [`TaskId`] with allow-list validation, [`KeySpace`]
//!   deriving the data key and notification channel for a task
//! - **Watcher tokens**: [`WatcherToken`] distinguishing a session's own
//!   kill broadcast from a competitor's
//! - **Envelopes**: [`ResultEnvelope`], the JSON blob an external producer
//!   writes to the store and publishes on the bus
//! - **Errors**: [`GatewayError`] hierarchy via `thiserror`, with the
//!   client-facing message every variant maps to

#![deny(unsafe_code)]

pub mod envelope;
pub mod errors;
pub mod task;
pub mod token;

pub use envelope::{ResultEnvelope, TaskStatus};
pub use errors::GatewayError;
pub use task::{KeySpace, TaskId, TaskIdRules};
pub use token::WatcherToken;
