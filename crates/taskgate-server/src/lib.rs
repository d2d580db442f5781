//! # taskgate-server
//!
//! Axum HTTP surface of the gateway.
//!
//! - Dispatcher route `GET /task/{task_id}` parsing the poll/watch mode
//!   flag and validating the task id
//! - [`query::PollQuery`] — one store read, verbatim reply
//! - [`query::WatchQuery`] — the watch protocol: subscribe through the
//!   connection pool, post-subscribe read, kill-broadcast arbitration,
//!   single-shot delivery
//! - Streaming response sink with whitespace keep-alive
//! - `/health` and Prometheus `/metrics` endpoints
//!
//! Wire contract: every response is HTTP 200 with
//! `Content-Type: application/json`; errors are signaled in the body as
//! `{"status":"error","error_message":"..."}`.

#![deny(unsafe_code)]

pub mod context;
pub mod health;
pub mod metrics;
pub mod query;
pub mod routes;
pub mod sink;

pub use context::GatewayContext;
pub use routes::{AppState, router};
pub use sink::ResponseSink;
