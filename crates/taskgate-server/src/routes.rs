//! Router and the task dispatcher handler.
//!
//! One route serves both query modes: `GET /task/{task_id}` with no
//! query string (or `?poll`) answers from a single store read, and
//! `?watch` upgrades the request into a streaming watch session.
//!
//! Wire contract: the task route always answers HTTP 200 with
//! `Content-Type: application/json`. Failures ride in the body as
//! `{"status":"error","error_message":"..."}` so polling clients never
//! need status-code handling.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::header;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use futures::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::debug;

use taskgate_core::{GatewayError, TaskId};

use crate::context::GatewayContext;
use crate::health::{self, HealthResponse};
use crate::query::error_body;
use crate::query::poll::PollQuery;
use crate::query::watch::WatchQuery;
use crate::sink::ResponseSink;

/// Response-stream buffer: one terminal payload plus a few keep-alive
/// chunks the client has not drained yet.
const STREAM_BUFFER: usize = 16;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Gateway wiring for query sessions.
    pub ctx: Arc<GatewayContext>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus render handle, when metrics are installed.
    pub prometheus: Option<PrometheusHandle>,
}

impl AppState {
    /// State with a fresh start time and no metrics recorder.
    #[must_use]
    pub fn new(ctx: Arc<GatewayContext>) -> Self {
        Self {
            ctx,
            start_time: Instant::now(),
            prometheus: None,
        }
    }
}

/// Build the Axum router with all routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/task/{task_id}", get(task_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// How the client wants its answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryMode {
    Poll,
    Watch,
}

impl QueryMode {
    /// Parse the raw query string. A bare `?poll`, an empty query, or no
    /// query at all is a poll; `?watch` opens a watch; anything else is
    /// rejected.
    fn parse(raw: Option<&str>) -> Result<Self, GatewayError> {
        match raw {
            None | Some("") | Some("poll") => Ok(Self::Poll),
            Some("watch") => Ok(Self::Watch),
            Some(_) => Err(GatewayError::InvalidMode),
        }
    }
}

/// GET /task/{task_id}
async fn task_handler(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    RawQuery(raw): RawQuery,
) -> Response {
    let ctx = state.ctx.clone();
    let mode = match QueryMode::parse(raw.as_deref()) {
        Ok(mode) => mode,
        Err(e) => {
            debug!(query = ?raw, "rejecting unknown query mode");
            return json_body(error_body(&e));
        }
    };
    let task = match TaskId::parse(&task_id, &ctx.rules) {
        Ok(task) => task,
        Err(e) => {
            debug!(task_id, error = %e, "rejecting invalid task id");
            return json_body(error_body(&e));
        }
    };
    match mode {
        QueryMode::Poll => {
            let body = PollQuery::new(&ctx, &task).run(&ctx).await;
            json_body(body)
        }
        QueryMode::Watch => {
            let (sink, rx) = ResponseSink::channel(STREAM_BUFFER);
            let query = WatchQuery::new(&ctx, &task);
            let _ = tokio::spawn(query.run(ctx, sink));
            let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
            json_stream(Body::from_stream(stream))
        }
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let resp = health::health_check(
        state.start_time,
        state.ctx.pool.connection_count(),
        state.ctx.pool.used_channels(),
    );
    Json(resp)
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => "metrics recorder not installed\n".into_response(),
    }
}

fn json_body(body: String) -> Response {
    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
}

fn json_stream(body: Body) -> Response {
    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
}
