//! Watch queries — the long-poll watch protocol.
//!
//! A watch session subscribes to the task's channel through the
//! connection pool, waits for the subscribe acknowledgment, and only
//! then reads the store: anything published after the ack arrives as a
//! bus message, anything terminal before it is seen by the read, so the
//! miss-window is closed. After the read it broadcasts a kill envelope
//! carrying its own token; every other watcher of the task, on any
//! connection in any process, loses arbitration and answers its client
//! with a superseded error. The newest watcher survives.
//!
//! The session is one async task `select!`-ing over its channel events,
//! client disconnect, and the keep-alive interval, so cancellation and
//! single-shot delivery are structural rather than a callback
//! discipline.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use taskgate_bus::ChannelEvent;
use taskgate_core::envelope::kill_payload;
use taskgate_core::{GatewayError, ResultEnvelope, TaskId, TaskStatus, WatcherToken};

use crate::context::GatewayContext;
use crate::metrics::{WATCH_ACTIVE, WATCH_DELIVERED_TOTAL, WATCH_QUERIES_TOTAL, WATCH_SUPERSEDED_TOTAL};
use crate::query::error_body;
use crate::sink::ResponseSink;

/// A long-poll watch for one task.
pub struct WatchQuery {
    id: u64,
    token: WatcherToken,
    data_key: String,
    channel: String,
    keepalive: Duration,
}

impl WatchQuery {
    /// Prepare a watch for `task`.
    #[must_use]
    pub fn new(ctx: &GatewayContext, task: &TaskId) -> Self {
        Self {
            id: ctx.next_query_id(),
            token: WatcherToken::new(),
            data_key: ctx.keyspace.data_key(task),
            channel: ctx.keyspace.channel_name(task),
            keepalive: ctx.keepalive,
        }
    }

    /// Drive the watch to its single terminal outcome.
    ///
    /// Exactly one terminal payload is ever written to `sink`; if the
    /// client disconnects first, none is. The borrowed pool channel is
    /// released on every exit path.
    pub async fn run(self, ctx: Arc<GatewayContext>, mut sink: ResponseSink) {
        counter!(WATCH_QUERIES_TOTAL).increment(1);
        gauge!(WATCH_ACTIVE).increment(1.0);

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let mut guard = match ctx.pool.subscribe(&self.channel, events_tx) {
            Ok(guard) => guard,
            Err(e) => {
                warn!(query_id = self.id, channel = %self.channel, error = %e, "failed to open bus connection");
                let _ = sink
                    .finish(error_body(&GatewayError::Backend(e.to_string())))
                    .await;
                gauge!(WATCH_ACTIVE).decrement(1.0);
                return;
            }
        };
        debug!(
            query_id = self.id,
            conn_id = guard.connection().id(),
            channel = %self.channel,
            token = %self.token,
            "watch subscribed through pool"
        );

        let terminal = self.watch(&ctx, &mut events, &sink).await;
        match terminal {
            Some(body) => {
                if sink.finish(body).await {
                    counter!(WATCH_DELIVERED_TOTAL).increment(1);
                }
            }
            None => debug!(query_id = self.id, "client disconnected, no response sent"),
        }

        // Teardown: release the borrowed channel (the pool rebalances and
        // reclaims); the connection itself is never destroyed here.
        guard.release();
        gauge!(WATCH_ACTIVE).decrement(1.0);
    }

    /// The state machine proper. Returns the terminal body, or `None`
    /// when the client disconnected and nothing must be sent.
    async fn watch(
        &self,
        ctx: &GatewayContext,
        events: &mut mpsc::UnboundedReceiver<ChannelEvent>,
        sink: &ResponseSink,
    ) -> Option<String> {
        // ── subscribing: wait for the subscribe acknowledgment ─────────
        loop {
            tokio::select! {
                () = sink.closed() => return None,
                event = events.recv() => match event {
                    Some(ChannelEvent::Subscribed) => break,
                    Some(ChannelEvent::Killed) => return Some(self.superseded()),
                    Some(ChannelEvent::Message(_)) => {
                        // Per-channel FIFO puts the ack first; anything
                        // earlier belonged to a previous handler.
                        trace!(query_id = self.id, "message before subscribe ack ignored");
                    }
                    None => return Some(self.backend_lost()),
                },
            }
        }

        // ── checking: post-subscribe read closes the miss-window ───────
        let read = ctx.kv.get(&self.data_key).await;

        // Kill broadcast goes out after the read completes, regardless of
        // its outcome; competing watchers on any connection or process
        // observe it and stand down.
        if let Err(e) = ctx
            .publisher
            .publish(&self.channel, &kill_payload(&self.token))
            .await
        {
            warn!(query_id = self.id, error = %e, "kill broadcast failed");
        }

        match read {
            Err(e) => {
                warn!(query_id = self.id, key = %self.data_key, error = %e, "store read failed");
                return Some(error_body(&GatewayError::Backend(e.to_string())));
            }
            Ok(None) => {
                debug!(query_id = self.id, key = %self.data_key, "no stored task");
                return Some(error_body(&GatewayError::NotFound));
            }
            Ok(Some(raw)) => match ResultEnvelope::parse(&raw) {
                Err(e) => {
                    warn!(query_id = self.id, error = %e, "stored task envelope is not valid JSON");
                    return Some(error_body(&GatewayError::Parse(e.to_string())));
                }
                Ok(envelope) if envelope.status == TaskStatus::Done => {
                    debug!(query_id = self.id, "task already done at subscribe time");
                    return Some(raw);
                }
                Ok(_) => {}
            },
        }

        // ── waiting: idle until a bus message, kill, or disconnect ─────
        let mut keepalive = if self.keepalive.is_zero() {
            None
        } else {
            let mut interval = tokio::time::interval(self.keepalive);
            // Skip the immediate first tick.
            let _ = interval.tick().await;
            Some(interval)
        };

        loop {
            tokio::select! {
                () = sink.closed() => return None,
                _ = tick(&mut keepalive) => {
                    if !sink.write_keepalive() {
                        return None;
                    }
                    trace!(query_id = self.id, "keep-alive whitespace written");
                }
                event = events.recv() => match event {
                    Some(ChannelEvent::Message(raw)) => {
                        if let Some(body) = self.handle_message(ctx, &raw).await {
                            return Some(body);
                        }
                    }
                    Some(ChannelEvent::Killed) => return Some(self.superseded()),
                    Some(ChannelEvent::Subscribed) => {
                        // Replayed ack after a transport reconnect.
                        debug!(query_id = self.id, "resubscribed after reconnect");
                    }
                    None => return Some(self.backend_lost()),
                },
            }
        }
    }

    /// React to one bus message while waiting. `Some` is a terminal
    /// body; `None` keeps waiting.
    async fn handle_message(&self, ctx: &GatewayContext, raw: &str) -> Option<String> {
        let envelope = match ResultEnvelope::parse(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                // One bad payload must not disturb the watch.
                warn!(query_id = self.id, error = %e, "ignoring malformed bus message");
                return None;
            }
        };
        match envelope.status {
            TaskStatus::Kill => {
                if self.token.matches(envelope.src.as_deref()) {
                    trace!(query_id = self.id, "observed own kill broadcast");
                    None
                } else {
                    Some(self.superseded())
                }
            }
            TaskStatus::Done | TaskStatus::Update => {
                if envelope.data.is_some() {
                    debug!(query_id = self.id, "result delivered inline from bus message");
                    Some(raw.to_string())
                } else {
                    debug!(query_id = self.id, "bus message without data, fetching stored value");
                    Some(self.fetch_stored(ctx).await)
                }
            }
            TaskStatus::Other => {
                trace!(query_id = self.id, "ignoring unknown status update");
                None
            }
        }
    }

    /// The one follow-up read for a notification without inline data.
    async fn fetch_stored(&self, ctx: &GatewayContext) -> String {
        match ctx.kv.get(&self.data_key).await {
            Ok(Some(value)) => value,
            Ok(None) => {
                warn!(query_id = self.id, key = %self.data_key, "notified but no stored task");
                error_body(&GatewayError::NotFound)
            }
            Err(e) => {
                warn!(query_id = self.id, key = %self.data_key, error = %e, "store read failed");
                error_body(&GatewayError::Backend(e.to_string()))
            }
        }
    }

    fn superseded(&self) -> String {
        debug!(query_id = self.id, "killed by a concurrent request for this task");
        counter!(WATCH_SUPERSEDED_TOTAL).increment(1);
        error_body(&GatewayError::Superseded)
    }

    fn backend_lost(&self) -> String {
        warn!(query_id = self.id, "bus connection abandoned while watching");
        error_body(&GatewayError::Backend("bus connection lost".into()))
    }
}

/// Await the next keep-alive tick, or pend forever when disabled.
async fn tick(keepalive: &mut Option<tokio::time::Interval>) {
    match keepalive.as_mut() {
        Some(interval) => {
            let _ = interval.tick().await;
        }
        None => futures::future::pending().await,
    }
}
