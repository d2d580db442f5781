//! Best-fit packing of logical channels onto few physical connections.
//!
//! The pool orders connections by remaining capacity, computed live from
//! each connection's current used count at query time (a cached sort key
//! would go stale the moment a session releases a channel). Acquisition
//! picks the most-utilized connection *among those with at least one free
//! slot* — a completely full connection never masks a sibling with room.
//! After every release the pool opportunistically reclaims connections
//! that hold zero channels, always retaining at least one.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::backend::{BusError, BusTransport};
use crate::connection::{BusConnection, ChannelHandler};

/// Pool of [`BusConnection`]s sharing one transport.
pub struct ConnectionPool {
    transport: Arc<dyn BusTransport>,
    capacity: usize,
    ping_interval: Duration,
    connections: Mutex<Vec<Arc<BusConnection>>>,
    next_id: AtomicU64,
}

impl ConnectionPool {
    /// Create an empty pool. Connections are opened on demand.
    #[must_use]
    pub fn new(
        transport: Arc<dyn BusTransport>,
        capacity: usize,
        ping_interval: Duration,
    ) -> Self {
        Self {
            transport,
            capacity,
            ping_interval,
            connections: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register `handler` for `channel` on the best-fit connection,
    /// opening a new connection only when every existing one is full.
    ///
    /// Selection and registration happen under the pool lock, so
    /// concurrent subscribers can neither observe stale capacity nor
    /// over-commit a connection. The returned guard releases the channel
    /// on [`ChannelGuard::release`] or on drop, whichever comes first.
    pub fn subscribe(
        self: &Arc<Self>,
        channel: &str,
        handler: ChannelHandler,
    ) -> Result<ChannelGuard, BusError> {
        let conn = {
            let mut connections = self.connections.lock();
            let best = connections
                .iter()
                .filter(|c| c.free_channels() > 0)
                .min_by_key(|c| c.free_channels())
                .cloned();
            let conn = match best {
                Some(conn) => conn,
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    info!(
                        conn_id = id,
                        pool_size = connections.len() + 1,
                        "pool full, opening new bus connection"
                    );
                    let conn = BusConnection::spawn(
                        id,
                        self.capacity,
                        self.transport.clone(),
                        self.ping_interval,
                    )?;
                    connections.push(conn.clone());
                    conn
                }
            };
            conn.add_channel(channel, handler);
            conn
        };
        Ok(ChannelGuard {
            pool: self.clone(),
            conn,
            channel: channel.to_string(),
            released: false,
        })
    }

    /// Drop every connection holding zero channels while more than one
    /// connection exists. The count is taken from live pool membership,
    /// never a separately maintained counter. Connections that failed an
    /// unrecoverable reconnect are dropped unconditionally, even when
    /// they are the last one.
    pub fn reclaim_idle(&self) {
        let mut connections = self.connections.lock();
        connections.retain(|conn| {
            if conn.is_failed() {
                debug!(conn_id = conn.id(), "dropping failed bus connection");
                conn.close();
                false
            } else {
                true
            }
        });
        while connections.len() > 1 {
            let Some(pos) = connections.iter().position(|c| c.used_channels() == 0) else {
                break;
            };
            let conn = connections.swap_remove(pos);
            debug!(
                conn_id = conn.id(),
                pool_size = connections.len(),
                "reclaiming idle bus connection"
            );
            conn.close();
        }
    }

    /// Number of open connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Total logical channels held across the pool.
    #[must_use]
    pub fn used_channels(&self) -> usize {
        self.connections
            .lock()
            .iter()
            .map(|c| c.used_channels())
            .sum()
    }

    fn release(&self, conn: &Arc<BusConnection>, channel: &str) {
        let _ = conn.remove_channel(channel);
        // Reconsider packing in the same call that changed the used
        // count, whether or not the channel was really unsubscribed.
        self.reclaim_idle();
    }
}

/// A borrowed logical channel on a pooled connection.
///
/// Releasing is idempotent: explicit [`release`](Self::release) and the
/// drop path release the channel at most once. The guard releases the
/// borrowed reference only — the connection itself belongs to the pool.
pub struct ChannelGuard {
    pool: Arc<ConnectionPool>,
    conn: Arc<BusConnection>,
    channel: String,
    released: bool,
}

impl ChannelGuard {
    /// The connection this channel lives on.
    #[must_use]
    pub fn connection(&self) -> &Arc<BusConnection> {
        &self.conn
    }

    /// The channel name.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Release the channel reference and let the pool rebalance.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.pool.release(&self.conn, &self.channel);
    }
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ChannelEvent;
    use crate::memory::MemoryBackend;
    use tokio::sync::mpsc;

    const PING: Duration = Duration::from_secs(60);

    fn pool_with_capacity(capacity: usize) -> Arc<ConnectionPool> {
        let backend = Arc::new(MemoryBackend::new());
        Arc::new(ConnectionPool::new(backend, capacity, PING))
    }

    fn handler() -> (
        ChannelHandler,
        mpsc::UnboundedReceiver<ChannelEvent>,
    ) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn first_subscribe_opens_a_connection() {
        let pool = pool_with_capacity(16);
        assert_eq!(pool.connection_count(), 0);
        let (tx, _rx) = handler();
        let _guard = pool.subscribe("c1", tx).unwrap();
        assert_eq!(pool.connection_count(), 1);
        assert_eq!(pool.used_channels(), 1);
    }

    #[tokio::test]
    async fn packs_onto_existing_connection_until_full() {
        // Capacity 2: tasks A,B share connection 1, C forces
        // connection 2.
        let pool = pool_with_capacity(2);
        let (ta, _ra) = handler();
        let ga = pool.subscribe("SC_A", ta).unwrap();
        let (tb, _rb) = handler();
        let gb = pool.subscribe("SC_B", tb).unwrap();
        assert_eq!(pool.connection_count(), 1);
        assert_eq!(ga.connection().id(), gb.connection().id());

        let (tc, _rc) = handler();
        let gc = pool.subscribe("SC_C", tc).unwrap();
        assert_eq!(pool.connection_count(), 2);
        assert_ne!(gc.connection().id(), ga.connection().id());
    }

    #[tokio::test]
    async fn full_connection_does_not_mask_free_sibling() {
        // The naive "inspect only the global minimum" bug: once conn 1 is
        // full, a new watcher must land on conn 2's free slot instead of
        // opening conn 3.
        let pool = pool_with_capacity(2);
        let guards: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|c| {
                let (tx, _rx) = handler();
                let guard = pool.subscribe(c, tx).unwrap();
                // Receivers are dropped; the pool only tracks counts here.
                guard
            })
            .collect();
        assert_eq!(pool.connection_count(), 2);

        let (tx, _rx) = handler();
        let gd = pool.subscribe("d", tx).unwrap();
        assert_eq!(pool.connection_count(), 2, "must reuse the free slot");
        assert_eq!(gd.connection().id(), guards[2].connection().id());
    }

    #[tokio::test]
    async fn best_fit_prefers_most_utilized() {
        let pool = pool_with_capacity(3);
        // Fill connection 0 (a, b, c), forcing d onto connection 1.
        let mut guards = Vec::new();
        for name in ["a", "b", "c", "d"] {
            let (tx, _rx) = handler();
            guards.push(pool.subscribe(name, tx).unwrap());
        }
        let conn0 = guards[0].connection().id();
        let conn1 = guards[3].connection().id();
        assert_ne!(conn0, conn1);

        // Free one slot on connection 0: 2/3 used vs 1/3 on connection 1.
        guards[0].release();

        // The next watcher must pack onto the fuller connection 0.
        let (tx, _rx) = handler();
        let g = pool.subscribe("e", tx).unwrap();
        assert_eq!(g.connection().id(), conn0);
    }

    #[tokio::test]
    async fn releasing_all_channels_reclaims_extra_connections() {
        let pool = pool_with_capacity(1);
        let (t1, _r1) = handler();
        let mut g1 = pool.subscribe("a", t1).unwrap();
        let (t2, _r2) = handler();
        let mut g2 = pool.subscribe("b", t2).unwrap();
        assert_eq!(pool.connection_count(), 2);

        g2.release();
        assert_eq!(pool.connection_count(), 1, "idle extra connection dropped");

        g1.release();
        assert_eq!(
            pool.connection_count(),
            1,
            "last connection is always retained"
        );
        assert_eq!(pool.used_channels(), 0);
    }

    #[tokio::test]
    async fn guard_drop_releases_exactly_once() {
        let pool = pool_with_capacity(4);
        let (t1, _r1) = handler();
        {
            let mut guard = pool.subscribe("a", t1).unwrap();
            assert_eq!(pool.used_channels(), 1);
            guard.release();
            assert_eq!(pool.used_channels(), 0);
            // Double release is a no-op.
            guard.release();
            // Drop after explicit release must not underflow anything.
        }
        assert_eq!(pool.used_channels(), 0);
        assert_eq!(pool.connection_count(), 1);
    }

    #[tokio::test]
    async fn partial_release_keeps_connection_packed() {
        // Two watchers on the same channel: releasing one must not
        // unsubscribe, but still triggers reclamation checks.
        let pool = pool_with_capacity(4);
        let (t1, _r1) = handler();
        let mut g1 = pool.subscribe("same", t1).unwrap();
        let (t2, mut r2) = handler();
        let _g2 = pool.subscribe("same", t2).unwrap();
        assert_eq!(pool.used_channels(), 1, "one distinct channel");

        g1.release();
        assert_eq!(pool.used_channels(), 1, "refcount holds the channel");
        assert!(r2.try_recv().is_err(), "survivor not disturbed");
    }

    #[tokio::test]
    async fn idle_connection_reused_after_becoming_free() {
        let pool = pool_with_capacity(1);
        let (t1, _r1) = handler();
        let mut g1 = pool.subscribe("a", t1).unwrap();
        let first_id = g1.connection().id();
        g1.release();

        let (t2, _r2) = handler();
        let g2 = pool.subscribe("b", t2).unwrap();
        assert_eq!(pool.connection_count(), 1);
        assert_eq!(g2.connection().id(), first_id, "retained connection reused");
    }

    /// Transport whose sessions never ack and can be told to refuse
    /// further connects.
    #[derive(Default)]
    struct BrittleTransport {
        refuse: std::sync::atomic::AtomicBool,
        events: Mutex<Vec<mpsc::UnboundedSender<crate::backend::BusEvent>>>,
    }

    impl BusTransport for BrittleTransport {
        fn connect(&self) -> Result<crate::backend::BusHandle, BusError> {
            use std::sync::atomic::Ordering;
            if self.refuse.load(Ordering::SeqCst) {
                return Err(BusError::Transport("connection refused".into()));
            }
            let (cmd_tx, _cmd_rx) = mpsc::unbounded_channel();
            let (evt_tx, evt_rx) = mpsc::unbounded_channel();
            let _ = evt_tx.send(crate::backend::BusEvent::Ready);
            self.events.lock().push(evt_tx);
            Ok(crate::backend::BusHandle {
                commands: cmd_tx,
                events: evt_rx,
            })
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn failed_connection_is_skipped_and_pruned() {
        use crate::backend::BusEvent;
        use std::sync::atomic::Ordering;

        let transport = Arc::new(BrittleTransport::default());
        let pool = Arc::new(ConnectionPool::new(transport.clone(), 16, PING));

        let (t1, mut r1) = handler();
        let mut g1 = pool.subscribe("a", t1).unwrap();
        let failed_id = g1.connection().id();
        settle().await;

        // Fail the session while the transport refuses the reconnect.
        transport.refuse.store(true, Ordering::SeqCst);
        transport.events.lock()[0]
            .send(BusEvent::Error("connection reset".into()))
            .unwrap();
        settle().await;
        assert!(matches!(
            r1.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));

        // New subscribers must not land on the dead connection.
        transport.refuse.store(false, Ordering::SeqCst);
        let (t2, _r2) = handler();
        let g2 = pool.subscribe("b", t2).unwrap();
        assert_ne!(g2.connection().id(), failed_id);
        assert!(!g2.connection().is_failed());

        // The next rebalance drops the dead connection entirely.
        g1.release();
        assert_eq!(pool.connection_count(), 1);
        assert_eq!(pool.used_channels(), 1);
    }

    #[tokio::test]
    async fn same_connection_duplicate_arbitration_through_pool() {
        let pool = pool_with_capacity(16);
        let (t1, mut r1) = handler();
        let _g1 = pool.subscribe("SC_t1", t1).unwrap();
        let (t2, mut r2) = handler();
        let _g2 = pool.subscribe("SC_t1", t2).unwrap();

        assert_eq!(r1.try_recv().unwrap(), ChannelEvent::Killed);
        assert!(r2.try_recv().is_err());
    }
}
