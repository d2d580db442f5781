//! In-process backend: a key/value map plus a pub/sub broker.
//!
//! Implements all three backend seams over shared `parking_lot` state.
//! Publishing fans out to every handle currently subscribed to the
//! channel, whichever session it arrived through, which is exactly the
//! cross-connection delivery the watch arbitration protocol relies on.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use crate::backend::{BusCommand, BusError, BusEvent, BusHandle, BusPublisher, BusTransport, KvStore};

#[derive(Default)]
struct Shared {
    data: HashMap<String, String>,
    /// channel -> (session id, event sender) for every live subscription.
    subs: HashMap<String, Vec<(u64, mpsc::UnboundedSender<BusEvent>)>>,
}

/// In-memory key/value store and pub/sub broker.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    shared: Arc<Mutex<Shared>>,
    next_session: Arc<AtomicU64>,
}

impl MemoryBackend {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value. This is the producer side; the gateway itself never
    /// writes.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) {
        let _ = self.shared.lock().data.insert(key.into(), value.into());
    }

    /// Remove a value.
    pub fn remove(&self, key: &str) {
        let _ = self.shared.lock().data.remove(key);
    }

    /// Number of live subscriptions on a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.shared
            .lock()
            .subs
            .get(channel)
            .map_or(0, Vec::len)
    }

    fn fan_out(&self, channel: &str, payload: &str) {
        let mut shared = self.shared.lock();
        if let Some(entries) = shared.subs.get_mut(channel) {
            // Prune subscribers whose session is gone.
            entries.retain(|(_, tx)| {
                tx.send(BusEvent::Message {
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                })
                .is_ok()
            });
        }
    }

    fn drop_session(&self, session: u64) {
        let mut shared = self.shared.lock();
        for entries in shared.subs.values_mut() {
            entries.retain(|(sid, _)| *sid != session);
        }
        shared.subs.retain(|_, entries| !entries.is_empty());
    }
}

#[async_trait]
impl KvStore for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, BusError> {
        Ok(self.shared.lock().data.get(key).cloned())
    }
}

#[async_trait]
impl BusPublisher for MemoryBackend {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        self.fan_out(channel, payload);
        Ok(())
    }
}

impl BusTransport for MemoryBackend {
    fn connect(&self) -> Result<BusHandle, BusError> {
        let session = self.next_session.fetch_add(1, Ordering::Relaxed);
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<BusCommand>();
        let (evt_tx, evt_rx) = mpsc::unbounded_channel::<BusEvent>();

        // The in-memory session is ready as soon as it exists.
        let _ = evt_tx.send(BusEvent::Ready);

        let backend = self.clone();
        let _ = tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    BusCommand::Subscribe(channel) => {
                        {
                            let mut shared = backend.shared.lock();
                            let entries = shared.subs.entry(channel.clone()).or_default();
                            // Re-subscribing the same session replaces its entry.
                            entries.retain(|(sid, _)| *sid != session);
                            entries.push((session, evt_tx.clone()));
                        }
                        let _ = evt_tx.send(BusEvent::SubscribeAck(channel));
                    }
                    BusCommand::Unsubscribe(channel) => {
                        let mut shared = backend.shared.lock();
                        if let Some(entries) = shared.subs.get_mut(&channel) {
                            entries.retain(|(sid, _)| *sid != session);
                            if entries.is_empty() {
                                let _ = shared.subs.remove(&channel);
                            }
                        }
                    }
                    BusCommand::Ping => trace!(session, "memory bus ping"),
                }
            }
            // Command sender dropped: the session is gone.
            backend.drop_session(session);
        });

        Ok(BusHandle {
            commands: cmd_tx,
            events: evt_rx,
        })
    }
}
