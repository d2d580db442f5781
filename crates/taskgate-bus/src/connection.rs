//! One physical pub/sub session multiplexing many logical channels.
//!
//! A [`BusConnection`] owns up to `capacity` logical channel
//! subscriptions. Each channel has at most one active handler (the most
//! recently registered one) and a reference count; the bus-level
//! unsubscribe only happens when the count reaches zero. A driver task
//! dispatches bus events to handlers, re-subscribes everything after a
//! reconnect, and sends keep-alive pings while the connection is idle
//! (the bus protocol forbids other commands while subscribed).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::backend::{BusCommand, BusError, BusEvent, BusTransport};

/// Events delivered to a channel's registered handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The bus acknowledged the subscribe; the post-subscribe read may
    /// begin.
    Subscribed,
    /// A message published on the channel, verbatim.
    Message(String),
    /// A newer handler registered for the same channel on this
    /// connection; this handler lost arbitration.
    Killed,
}

/// A channel's handler: the sending half of the owning session's event
/// queue.
pub type ChannelHandler = mpsc::UnboundedSender<ChannelEvent>;

struct ChannelTable {
    handlers: HashMap<String, ChannelHandler>,
    sub_counts: HashMap<String, u32>,
    ready: bool,
    failed: bool,
}

/// One pooled pub/sub session.
pub struct BusConnection {
    id: u64,
    capacity: usize,
    state: Mutex<ChannelTable>,
    /// Command sender toward the current transport handle; replaced on
    /// reconnect.
    commands: Mutex<mpsc::UnboundedSender<BusCommand>>,
    cancel: CancellationToken,
}

impl BusConnection {
    /// Open a transport session and start the driver task.
    pub fn spawn(
        id: u64,
        capacity: usize,
        transport: Arc<dyn BusTransport>,
        ping_interval: Duration,
    ) -> Result<Arc<Self>, BusError> {
        let handle = transport.connect()?;
        let conn = Arc::new(Self {
            id,
            capacity,
            state: Mutex::new(ChannelTable {
                handlers: HashMap::new(),
                sub_counts: HashMap::new(),
                ready: false,
                failed: false,
            }),
            commands: Mutex::new(handle.commands),
            cancel: CancellationToken::new(),
        });
        debug!(conn_id = id, capacity, "bus connection opened");

        let driver = conn.clone();
        let _ = tokio::spawn(async move {
            driver.drive(handle.events, transport, ping_interval).await;
        });
        Ok(conn)
    }

    /// Connection identity (for logs).
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Fixed logical channel capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of distinct channels currently held.
    #[must_use]
    pub fn used_channels(&self) -> usize {
        self.state.lock().handlers.len()
    }

    /// Remaining logical capacity. A failed connection reports zero so
    /// the pool never assigns new channels to it.
    #[must_use]
    pub fn free_channels(&self) -> usize {
        let table = self.state.lock();
        if table.failed {
            return 0;
        }
        self.capacity.saturating_sub(table.handlers.len())
    }

    /// Whether the underlying session has reported ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state.lock().ready
    }

    /// Whether the connection was abandoned after a failed reconnect.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.state.lock().failed
    }

    /// Register `handler` for `channel`, bumping its reference count.
    ///
    /// If the channel already has a handler, the previous one receives
    /// [`ChannelEvent::Killed`] before being replaced — same-connection
    /// duplicate arbitration, independent of any bus round trip. The
    /// subscribe command is issued now if the session is ready, otherwise
    /// deferred until it is.
    pub fn add_channel(&self, channel: &str, handler: ChannelHandler) {
        let ready = {
            let mut table = self.state.lock();
            if table.failed {
                // Dropping the handler closes the session's event
                // stream, which it reads as a lost backend.
                return;
            }
            let count = table.sub_counts.entry(channel.to_string()).or_insert(0);
            *count += 1;
            if *count > 1 {
                if let Some(prev) = table.handlers.get(channel) {
                    debug!(
                        conn_id = self.id,
                        channel, "duplicate watcher on connection, killing previous handler"
                    );
                    let _ = prev.send(ChannelEvent::Killed);
                }
            }
            let _ = table.handlers.insert(channel.to_string(), handler);
            table.ready
        };
        if ready {
            self.send_command(BusCommand::Subscribe(channel.to_string()));
        }
    }

    /// Drop one reference to `channel`.
    ///
    /// Only when the count reaches zero is the channel actually
    /// unsubscribed from the bus and its handler forgotten; a fresh
    /// watcher that re-registered the same channel keeps it alive.
    /// Returns `true` if the channel was released for real.
    pub fn remove_channel(&self, channel: &str) -> bool {
        let released = {
            let mut table = self.state.lock();
            let Some(count) = table.sub_counts.get_mut(channel) else {
                return false;
            };
            *count = count.saturating_sub(1);
            if *count > 0 {
                trace!(
                    conn_id = self.id,
                    channel, refs = *count, "channel still referenced, keeping subscription"
                );
                false
            } else {
                let _ = table.sub_counts.remove(channel);
                let _ = table.handlers.remove(channel);
                true
            }
        };
        if released {
            debug!(conn_id = self.id, channel, "unsubscribing from channel");
            self.send_command(BusCommand::Unsubscribe(channel.to_string()));
        }
        released
    }

    /// Stop the driver task. Called by the pool when reclaiming an idle
    /// connection; never called while channels are held.
    pub fn close(&self) {
        debug!(conn_id = self.id, "closing bus connection");
        self.cancel.cancel();
    }

    /// Tear the connection down after an unrecoverable transport
    /// failure. Every handler is dropped so each owning session sees
    /// its event stream close, and the failed flag withdraws all
    /// advertised capacity until the pool prunes the connection.
    fn abandon(&self) {
        let mut table = self.state.lock();
        table.failed = true;
        table.ready = false;
        table.handlers.clear();
        table.sub_counts.clear();
    }

    fn send_command(&self, cmd: BusCommand) {
        if self.commands.lock().send(cmd).is_err() {
            // The driver is between handles during a reconnect; local
            // bookkeeping remains the source of truth and the channel
            // set is replayed once the replacement is ready.
            trace!(conn_id = self.id, "command dropped while disconnected");
        }
    }

    fn dispatch(&self, channel: &str, event: ChannelEvent) {
        let table = self.state.lock();
        match table.handlers.get(channel) {
            Some(handler) => {
                let _ = handler.send(event);
            }
            // Handler already torn down; benign race with unsubscribe.
            None => trace!(
                conn_id = self.id,
                channel, "dropping event for channel with no handler"
            ),
        }
    }

    fn on_ready(&self) {
        let channels: Vec<String> = {
            let mut table = self.state.lock();
            table.ready = true;
            table.handlers.keys().cloned().collect()
        };
        if !channels.is_empty() {
            debug!(
                conn_id = self.id,
                count = channels.len(),
                "session ready, subscribing to outstanding channels"
            );
            for channel in channels {
                self.send_command(BusCommand::Subscribe(channel));
            }
        }
    }

    fn maybe_ping(&self) {
        let table = self.state.lock();
        if table.ready && table.handlers.is_empty() {
            drop(table);
            trace!(conn_id = self.id, "idle keep-alive ping");
            self.send_command(BusCommand::Ping);
        }
    }

    async fn drive(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<BusEvent>,
        transport: Arc<dyn BusTransport>,
        ping_interval: Duration,
    ) {
        let mut ping = tokio::time::interval(ping_interval);
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                _ = ping.tick() => self.maybe_ping(),
                event = events.recv() => {
                    let failure = match event {
                        Some(BusEvent::Ready) => {
                            self.on_ready();
                            None
                        }
                        Some(BusEvent::SubscribeAck(channel)) => {
                            self.dispatch(&channel, ChannelEvent::Subscribed);
                            None
                        }
                        Some(BusEvent::Message { channel, payload }) => {
                            self.dispatch(&channel, ChannelEvent::Message(payload));
                            None
                        }
                        Some(BusEvent::Error(description)) => Some(description),
                        None => Some("event stream closed".to_string()),
                    };
                    if let Some(description) = failure {
                        warn!(conn_id = self.id, error = %description, "bus session failed, reconnecting");
                        self.state.lock().ready = false;
                        // Subscriptions are NOT dropped from local
                        // bookkeeping; they are replayed on the next
                        // Ready. One fresh connect per failure, no
                        // retry loop.
                        match transport.connect() {
                            Ok(handle) => {
                                *self.commands.lock() = handle.commands;
                                events = handle.events;
                            }
                            Err(e) => {
                                warn!(conn_id = self.id, error = %e, "reconnect failed, connection abandoned");
                                self.abandon();
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BusHandle;

    struct ScriptedSession {
        events: mpsc::UnboundedSender<BusEvent>,
        commands: Option<mpsc::UnboundedReceiver<BusCommand>>,
    }

    /// Transport whose sessions are driven by the test.
    #[derive(Default)]
    struct ScriptedTransport {
        sessions: Mutex<Vec<ScriptedSession>>,
    }

    impl ScriptedTransport {
        fn session_count(&self) -> usize {
            self.sessions.lock().len()
        }

        fn events(&self, index: usize) -> mpsc::UnboundedSender<BusEvent> {
            self.sessions.lock()[index].events.clone()
        }

        fn take_commands(&self, index: usize) -> mpsc::UnboundedReceiver<BusCommand> {
            self.sessions.lock()[index]
                .commands
                .take()
                .expect("commands already taken")
        }
    }

    impl BusTransport for ScriptedTransport {
        fn connect(&self) -> Result<BusHandle, BusError> {
            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            let (evt_tx, evt_rx) = mpsc::unbounded_channel();
            self.sessions.lock().push(ScriptedSession {
                events: evt_tx,
                commands: Some(cmd_rx),
            });
            Ok(BusHandle {
                commands: cmd_tx,
                events: evt_rx,
            })
        }
    }

    const PING: Duration = Duration::from_secs(60);

    fn handler() -> (ChannelHandler, mpsc::UnboundedReceiver<ChannelEvent>) {
        mpsc::unbounded_channel()
    }

    /// Let the driver task process everything queued so far.
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn subscribe_deferred_until_ready() {
        let transport = Arc::new(ScriptedTransport::default());
        let conn = BusConnection::spawn(0, 16, transport.clone(), PING).unwrap();
        let mut commands = transport.take_commands(0);

        let (tx, _rx) = handler();
        conn.add_channel("c1", tx);
        settle().await;
        assert!(commands.try_recv().is_err(), "subscribe must wait for ready");
        assert!(!conn.is_ready());

        transport.events(0).send(BusEvent::Ready).unwrap();
        settle().await;
        assert!(conn.is_ready());
        assert_eq!(
            commands.try_recv().unwrap(),
            BusCommand::Subscribe("c1".into())
        );
    }

    #[tokio::test]
    async fn subscribe_immediate_when_ready() {
        let transport = Arc::new(ScriptedTransport::default());
        let conn = BusConnection::spawn(0, 16, transport.clone(), PING).unwrap();
        let mut commands = transport.take_commands(0);
        transport.events(0).send(BusEvent::Ready).unwrap();
        settle().await;

        let (tx, mut rx) = handler();
        conn.add_channel("c1", tx);
        settle().await;
        assert_eq!(
            commands.try_recv().unwrap(),
            BusCommand::Subscribe("c1".into())
        );

        transport
            .events(0)
            .send(BusEvent::SubscribeAck("c1".into()))
            .unwrap();
        settle().await;
        assert_eq!(rx.try_recv().unwrap(), ChannelEvent::Subscribed);
    }

    #[tokio::test]
    async fn messages_reach_registered_handler() {
        let transport = Arc::new(ScriptedTransport::default());
        let conn = BusConnection::spawn(0, 16, transport.clone(), PING).unwrap();
        transport.events(0).send(BusEvent::Ready).unwrap();

        let (tx, mut rx) = handler();
        conn.add_channel("c1", tx);
        transport
            .events(0)
            .send(BusEvent::Message {
                channel: "c1".into(),
                payload: "{\"status\":\"done\"}".into(),
            })
            .unwrap();
        settle().await;
        assert_eq!(
            rx.try_recv().unwrap(),
            ChannelEvent::Message("{\"status\":\"done\"}".into())
        );
    }

    #[tokio::test]
    async fn message_without_handler_dropped_silently() {
        let transport = Arc::new(ScriptedTransport::default());
        let _conn = BusConnection::spawn(0, 16, transport.clone(), PING).unwrap();
        transport.events(0).send(BusEvent::Ready).unwrap();
        transport
            .events(0)
            .send(BusEvent::Message {
                channel: "nobody".into(),
                payload: "x".into(),
            })
            .unwrap();
        settle().await;
        // Nothing to assert beyond "did not panic / did not wedge".
    }

    #[tokio::test]
    async fn second_handler_kills_first_synchronously() {
        let transport = Arc::new(ScriptedTransport::default());
        let conn = BusConnection::spawn(0, 16, transport.clone(), PING).unwrap();
        transport.events(0).send(BusEvent::Ready).unwrap();
        settle().await;

        let (tx1, mut rx1) = handler();
        conn.add_channel("c1", tx1);
        let (tx2, mut rx2) = handler();
        conn.add_channel("c1", tx2);

        // The kill is observable before any bus round trip.
        assert_eq!(rx1.try_recv().unwrap(), ChannelEvent::Killed);
        assert_eq!(conn.used_channels(), 1);

        // Later traffic goes to the surviving handler only.
        transport
            .events(0)
            .send(BusEvent::Message {
                channel: "c1".into(),
                payload: "m".into(),
            })
            .unwrap();
        settle().await;
        assert_eq!(rx2.try_recv().unwrap(), ChannelEvent::Message("m".into()));
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn refcounted_release_keeps_subscription() {
        let transport = Arc::new(ScriptedTransport::default());
        let conn = BusConnection::spawn(0, 16, transport.clone(), PING).unwrap();
        let mut commands = transport.take_commands(0);
        transport.events(0).send(BusEvent::Ready).unwrap();
        settle().await;

        let (tx1, _rx1) = handler();
        conn.add_channel("c1", tx1);
        let (tx2, mut rx2) = handler();
        conn.add_channel("c1", tx2);
        settle().await;
        // Drain the two subscribe commands.
        assert_eq!(
            commands.try_recv().unwrap(),
            BusCommand::Subscribe("c1".into())
        );
        assert_eq!(
            commands.try_recv().unwrap(),
            BusCommand::Subscribe("c1".into())
        );

        // First release: count 2 -> 1, no unsubscribe, handler intact.
        assert!(!conn.remove_channel("c1"));
        assert_eq!(conn.used_channels(), 1);
        transport
            .events(0)
            .send(BusEvent::Message {
                channel: "c1".into(),
                payload: "still here".into(),
            })
            .unwrap();
        settle().await;
        assert_eq!(
            rx2.try_recv().unwrap(),
            ChannelEvent::Message("still here".into())
        );
        assert!(commands.try_recv().is_err());

        // Second release: count 1 -> 0, real unsubscribe.
        assert!(conn.remove_channel("c1"));
        assert_eq!(conn.used_channels(), 0);
        settle().await;
        assert_eq!(
            commands.try_recv().unwrap(),
            BusCommand::Unsubscribe("c1".into())
        );
    }

    #[tokio::test]
    async fn remove_unknown_channel_is_a_no_op() {
        let transport = Arc::new(ScriptedTransport::default());
        let conn = BusConnection::spawn(0, 16, transport.clone(), PING).unwrap();
        assert!(!conn.remove_channel("never_added"));
    }

    #[tokio::test]
    async fn reconnect_replays_outstanding_channels() {
        let transport = Arc::new(ScriptedTransport::default());
        let conn = BusConnection::spawn(0, 16, transport.clone(), PING).unwrap();
        transport.events(0).send(BusEvent::Ready).unwrap();
        settle().await;

        let (tx1, _rx1) = handler();
        conn.add_channel("c1", tx1);
        let (tx2, _rx2) = handler();
        conn.add_channel("c2", tx2);
        settle().await;

        // Fail the session; the driver opens a replacement.
        transport
            .events(0)
            .send(BusEvent::Error("connection reset".into()))
            .unwrap();
        settle().await;
        assert_eq!(transport.session_count(), 2);
        assert!(!conn.is_ready());
        assert_eq!(conn.used_channels(), 2, "bookkeeping survives the error");

        // Replacement ready: both channels replayed.
        let mut commands = transport.take_commands(1);
        transport.events(1).send(BusEvent::Ready).unwrap();
        settle().await;
        assert!(conn.is_ready());
        let mut replayed = Vec::new();
        while let Ok(BusCommand::Subscribe(c)) = commands.try_recv() {
            replayed.push(c);
        }
        replayed.sort();
        assert_eq!(replayed, vec!["c1".to_string(), "c2".to_string()]);
    }

    /// Delegates the first connect to the scripted transport, then
    /// refuses every later one.
    #[derive(Default)]
    struct RefusingReconnectTransport {
        inner: ScriptedTransport,
        connects: std::sync::atomic::AtomicUsize,
    }

    impl BusTransport for RefusingReconnectTransport {
        fn connect(&self) -> Result<BusHandle, BusError> {
            use std::sync::atomic::Ordering;
            if self.connects.fetch_add(1, Ordering::SeqCst) == 0 {
                self.inner.connect()
            } else {
                Err(BusError::Transport("connection refused".into()))
            }
        }
    }

    #[tokio::test]
    async fn failed_reconnect_closes_handler_streams() {
        let transport = Arc::new(RefusingReconnectTransport::default());
        let conn = BusConnection::spawn(0, 16, transport.clone(), PING).unwrap();
        transport.inner.events(0).send(BusEvent::Ready).unwrap();
        settle().await;

        let (tx, mut rx) = handler();
        conn.add_channel("c1", tx);
        transport
            .inner
            .events(0)
            .send(BusEvent::SubscribeAck("c1".into()))
            .unwrap();
        settle().await;
        assert_eq!(rx.try_recv().unwrap(), ChannelEvent::Subscribed);

        transport
            .inner
            .events(0)
            .send(BusEvent::Error("connection reset".into()))
            .unwrap();
        settle().await;

        // The handler's stream closes so the owning session answers
        // with a backend error instead of waiting forever.
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert!(conn.is_failed());
        assert_eq!(conn.used_channels(), 0);
        assert_eq!(conn.free_channels(), 0, "no capacity may be advertised");
    }

    #[tokio::test]
    async fn failed_connection_rejects_new_handlers() {
        let transport = Arc::new(RefusingReconnectTransport::default());
        let conn = BusConnection::spawn(0, 16, transport.clone(), PING).unwrap();
        transport.inner.events(0).send(BusEvent::Ready).unwrap();
        transport
            .inner
            .events(0)
            .send(BusEvent::Error("connection reset".into()))
            .unwrap();
        settle().await;
        assert!(conn.is_failed());

        // A handler racing the failure is released immediately rather
        // than parked on a dead connection.
        let (tx, mut rx) = handler();
        conn.add_channel("c1", tx);
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert_eq!(conn.used_channels(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_pings() {
        let transport = Arc::new(ScriptedTransport::default());
        let _conn = BusConnection::spawn(0, 16, transport.clone(), PING).unwrap();
        let mut commands = transport.take_commands(0);
        transport.events(0).send(BusEvent::Ready).unwrap();
        settle().await;

        tokio::time::advance(PING + Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(commands.try_recv().unwrap(), BusCommand::Ping);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribed_connection_does_not_ping() {
        let transport = Arc::new(ScriptedTransport::default());
        let conn = BusConnection::spawn(0, 16, transport.clone(), PING).unwrap();
        let mut commands = transport.take_commands(0);
        transport.events(0).send(BusEvent::Ready).unwrap();
        settle().await;

        let (tx, _rx) = handler();
        conn.add_channel("c1", tx);
        settle().await;
        assert_eq!(
            commands.try_recv().unwrap(),
            BusCommand::Subscribe("c1".into())
        );

        tokio::time::advance(3 * PING).await;
        settle().await;
        assert!(commands.try_recv().is_err(), "no ping while subscribed");

        // Back to idle: pings resume.
        assert!(conn.remove_channel("c1"));
        settle().await;
        assert_eq!(
            commands.try_recv().unwrap(),
            BusCommand::Unsubscribe("c1".into())
        );
        tokio::time::advance(PING + Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(commands.try_recv().unwrap(), BusCommand::Ping);
    }

    #[tokio::test]
    async fn not_ready_connection_does_not_ping() {
        let transport = Arc::new(ScriptedTransport::default());
        let _conn =
            BusConnection::spawn(0, 16, transport.clone(), Duration::from_millis(1)).unwrap();
        let mut commands = transport.take_commands(0);
        // Never send Ready.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(commands.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_stops_the_driver() {
        let transport = Arc::new(ScriptedTransport::default());
        let conn = BusConnection::spawn(0, 16, transport.clone(), PING).unwrap();
        transport.events(0).send(BusEvent::Ready).unwrap();
        settle().await;

        conn.close();
        settle().await;
        // Events after close are simply not consumed; no panic.
        let _ = transport.events(0).send(BusEvent::Ready);
    }

    #[tokio::test]
    async fn capacity_accounting() {
        let transport = Arc::new(ScriptedTransport::default());
        let conn = BusConnection::spawn(7, 2, transport.clone(), PING).unwrap();
        assert_eq!(conn.id(), 7);
        assert_eq!(conn.capacity(), 2);
        assert_eq!(conn.free_channels(), 2);

        let (tx, _rx) = handler();
        conn.add_channel("a", tx);
        assert_eq!(conn.used_channels(), 1);
        assert_eq!(conn.free_channels(), 1);
    }
}
