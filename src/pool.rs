//! Connection pool: ownership, supervision, and self-healing.
//!
//! The pool owns every live broker connection for a producer. It establishes
//! them concurrently, hands out snapshots for dispatch, and supervises each
//! connection's lifecycle channel so that a mid-session drop is repaired in
//! the background without involving any `produce()` caller.
//!
//! ## Establish policy
//!
//! `establish` dials every node concurrently and is all-or-nothing for the
//! caller: the first dial error is surfaced, but connections that succeeded
//! before the failure stay registered (no rollback). The same policy applies
//! in direct and discovery mode. Each establish replaces the previous pool:
//! leftover connections are closed first, and their supervisors recognize
//! the superseding establish by its epoch and stand down instead of
//! re-dialing.
//!
//! ## Reconnection
//!
//! A connection that closes after reaching readiness, while the pool is not
//! closed, is removed by host+port identity and re-dialed under the pool's
//! retry schedule with unbounded attempts. The loop checks the closed flag
//! and the establish epoch at every retry boundary, so it stops on
//! `close()` or when a newer establish takes over; this prevents reconnect
//! storms after an intentional shutdown.
//!
//! ## Cursor
//!
//! The dispatch cursor only ever increases (selection wraps it with modulo),
//! so repeated reconnection does not bias which connection is favored next.
//! It is reset to zero only when a new `connect()` re-establishes the pool.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::retry::RetryPolicy;
use crate::transport::{Connection, ConnectionEvent, EventReceiver, Transport};

/// One established connection plus the identity it was dialed under.
///
/// Identity is host+port, not object identity: the same address may be
/// re-dialed after a drop and must replace its predecessor in the pool.
#[derive(Clone)]
pub struct PooledConnection {
    pub host: String,
    pub port: u16,
    pub conn: Arc<dyn Connection>,
}

/// Pool of live broker connections with background self-healing.
pub struct ConnectionPool {
    transport: Arc<dyn Transport>,
    conns: RwLock<Vec<PooledConnection>>,
    cursor: AtomicU64,
    closed: AtomicBool,
    /// Bumped by every establish. Supervisors and reconnect loops carry the
    /// epoch they were spawned under and stand down once a newer establish
    /// owns the pool, so closing the old set never tears down the new one.
    epoch: AtomicU64,
    reconnect_policy: RetryPolicy,
}

impl ConnectionPool {
    /// Create an empty pool dialing through `transport`.
    ///
    /// `reconnect_policy` supplies the backoff schedule for background
    /// reconnects; its retry ceiling is ignored there (reconnect attempts
    /// are unbounded until the pool closes).
    pub fn new(transport: Arc<dyn Transport>, reconnect_policy: RetryPolicy) -> Self {
        Self {
            transport,
            conns: RwLock::new(Vec::new()),
            cursor: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            reconnect_policy,
        }
    }

    /// Establish one connection per node, all dials running concurrently.
    ///
    /// A fresh establish replaces the previous pool wholesale: any
    /// still-registered connections are closed first, so repeated
    /// `connect()` calls never accumulate duplicates. Clears the closed
    /// flag and resets the dispatch cursor, then waits for every dial to
    /// resolve. Returns the first dial error if any failed; successful
    /// connections stay registered either way.
    pub async fn establish(self: &Arc<Self>, nodes: &[(String, u16)]) -> Result<()> {
        self.closed.store(false, Ordering::SeqCst);
        self.cursor.store(0, Ordering::SeqCst);

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let stale: Vec<PooledConnection> = std::mem::take(&mut *self.conns.write().await);
        for pooled in stale {
            pooled.conn.close().await;
        }

        let dials = nodes
            .iter()
            .map(|(host, port)| self.dial_and_register(host.clone(), *port, epoch));
        let results = join_all(dials).await;

        for result in results {
            result?;
        }
        Ok(())
    }

    /// Establish a single connection to a fixed daemon address.
    pub async fn establish_direct(self: &Arc<Self>, host: &str, port: u16) -> Result<()> {
        self.establish(&[(host.to_string(), port)]).await
    }

    /// Dial one node, register it, and start supervising its lifecycle.
    ///
    /// A close before readiness surfaces here as the dial error; after this
    /// returns, readiness has been reached and any later close is handled by
    /// the supervision task.
    async fn dial_and_register(self: &Arc<Self>, host: String, port: u16, epoch: u64) -> Result<()> {
        let (conn, events) = self.transport.dial(&host, port).await?;

        if self.is_closed() || self.current_epoch() != epoch {
            // Pool was closed or re-established while this dial was in
            // flight; the connection belongs to nobody.
            conn.close().await;
            return Ok(());
        }

        debug!(host = %host, port, "connection ready");
        self.conns.write().await.push(PooledConnection {
            host: host.clone(),
            port,
            conn,
        });
        self.supervise(host, port, epoch, events);
        Ok(())
    }

    /// Watch one connection's lifecycle channel and trigger reconnection on
    /// an unexpected close.
    fn supervise(self: &Arc<Self>, host: String, port: u16, epoch: u64, mut events: EventReceiver) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Some(ConnectionEvent::Error(message)) => {
                        warn!(host = %host, port, error = %message, "connection error");
                    }
                    Some(ConnectionEvent::Closed) | None => break,
                }
            }
            pool.handle_closed(host, port, epoch).await;
        });
    }

    /// React to a connection that closed after readiness.
    async fn handle_closed(self: Arc<Self>, host: String, port: u16, epoch: u64) {
        if self.is_closed() {
            // Intentional shutdown; nothing to repair.
            return;
        }
        if self.current_epoch() != epoch {
            // A newer establish owns the pool; this close was the old set
            // being drained.
            return;
        }
        if !self.remove(&host, port).await {
            // Already removed (e.g. replaced by a newer dial to the same
            // address); that dial's supervisor owns the slot now.
            return;
        }

        info!(host = %host, port, "connection dropped, reconnecting");
        let pool = Arc::clone(&self);
        let outcome = self
            .reconnect_policy
            .run_until_closed(
                || pool.dial_and_register(host.clone(), port, epoch),
                || pool.is_closed() || pool.current_epoch() != epoch,
            )
            .await;

        match outcome {
            Some(()) => info!(host = %host, port, "reconnected"),
            None => debug!(host = %host, port, "reconnect abandoned"),
        }
    }

    /// Remove a connection by host+port identity. Returns whether anything
    /// was removed.
    async fn remove(&self, host: &str, port: u16) -> bool {
        let mut conns = self.conns.write().await;
        let before = conns.len();
        conns.retain(|c| !(c.host == host && c.port == port));
        before != conns.len()
    }

    /// Close the pool: set the closed flag, close every connection's
    /// transport, clear the list.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<PooledConnection> = std::mem::take(&mut *self.conns.write().await);
        info!(count = drained.len(), "closing connection pool");
        for pooled in drained {
            pooled.conn.close().await;
        }
    }

    /// Whether `close()` has been called since the last establish.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Number of live connections.
    pub async fn len(&self) -> usize {
        self.conns.read().await.len()
    }

    /// True when no connections are live.
    pub async fn is_empty(&self) -> bool {
        self.conns.read().await.is_empty()
    }

    /// Snapshot of the current connections, in pool order.
    pub async fn snapshot(&self) -> Vec<PooledConnection> {
        self.conns.read().await.clone()
    }

    /// Addresses of the current connections, in pool order.
    pub async fn peers(&self) -> Vec<(String, u16)> {
        self.conns
            .read()
            .await
            .iter()
            .map(|c| (c.host.clone(), c.port))
            .collect()
    }

    /// Post-increment dispatch cursor; wraps only via the caller's modulo.
    pub fn next_cursor(&self) -> u64 {
        self.cursor.fetch_add(1, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBroker, MockTransport};
    use std::time::Duration;

    fn fast_reconnect() -> RetryPolicy {
        RetryPolicy::new(
            0,
            2.0,
            Duration::from_millis(1),
            Duration::from_millis(10),
        )
    }

    fn pool_with(transport: MockTransport) -> Arc<ConnectionPool> {
        Arc::new(ConnectionPool::new(Arc::new(transport), fast_reconnect()))
    }

    #[tokio::test]
    async fn establish_registers_every_node() {
        let broker = MockBroker::new();
        let pool = pool_with(MockTransport::new(broker));

        pool.establish(&[("a".to_string(), 4150), ("b".to_string(), 4150)])
            .await
            .unwrap();

        assert_eq!(pool.len().await, 2);
        assert_eq!(
            pool.peers().await,
            vec![("a".to_string(), 4150), ("b".to_string(), 4150)]
        );
    }

    #[tokio::test]
    async fn establish_surfaces_first_error_but_keeps_successes() {
        let broker = MockBroker::new();
        let transport = MockTransport::new(broker);
        transport.fail_dial("bad", 4150);
        let pool = pool_with(transport);

        let err = pool
            .establish(&[("good".to_string(), 4150), ("bad".to_string(), 4150)])
            .await
            .unwrap_err();

        assert!(matches!(err, crate::error::ClientError::Connect { .. }));
        // The dial that succeeded is registered, not rolled back.
        assert_eq!(pool.len().await, 1);
        assert_eq!(pool.peers().await, vec![("good".to_string(), 4150)]);
    }

    #[tokio::test]
    async fn unexpected_close_triggers_background_reconnect() {
        let broker = MockBroker::new();
        let transport = MockTransport::new(broker);
        let handle = transport.handle();
        let pool = pool_with(transport);

        pool.establish(&[("a".to_string(), 4150), ("b".to_string(), 4150)])
            .await
            .unwrap();

        handle.drop_connection("a", 4150);

        // Removal happens first, then the background dial restores it.
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if pool.len().await == 2 && handle.dial_count("a", 4150) >= 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pool did not self-heal");
    }

    #[tokio::test]
    async fn close_stops_reconnect_attempts() {
        let broker = MockBroker::new();
        let transport = MockTransport::new(broker);
        let handle = transport.handle();
        let pool = pool_with(transport);

        pool.establish_direct("a", 4150).await.unwrap();

        // Make redial impossible, drop the link, then close the pool; the
        // retry loop must observe the closed flag and stop.
        handle.fail_dial("a", 4150);
        handle.drop_connection("a", 4150);
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.close().await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let dials_after_close = handle.dial_count("a", 4150);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(handle.dial_count("a", 4150), dials_after_close);
        assert!(pool.is_closed());
        assert_eq!(pool.len().await, 0);
    }

    #[tokio::test]
    async fn re_establish_replaces_connections_instead_of_duplicating() {
        let broker = MockBroker::new();
        let transport = MockTransport::new(broker);
        let handle = transport.handle();
        let pool = pool_with(transport);

        pool.establish_direct("a", 4150).await.unwrap();
        pool.establish_direct("a", 4150).await.unwrap();

        // The second establish re-dialed but the old connection was closed
        // and replaced, not kept alongside the new one.
        assert_eq!(pool.peers().await, vec![("a".to_string(), 4150)]);
        assert_eq!(handle.dial_count("a", 4150), 2);

        // The replacement is supervised: a genuine drop still self-heals.
        handle.drop_connection("a", 4150);
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if pool.len().await == 1 && handle.dial_count("a", 4150) >= 3 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("replacement connection was not supervised");
    }

    #[tokio::test]
    async fn re_establish_swaps_the_node_set() {
        let broker = MockBroker::new();
        let pool = pool_with(MockTransport::new(broker));

        pool.establish(&[("a".to_string(), 4150), ("b".to_string(), 4150)])
            .await
            .unwrap();
        pool.establish(&[("c".to_string(), 4150)]).await.unwrap();

        assert_eq!(pool.peers().await, vec![("c".to_string(), 4150)]);
    }

    #[tokio::test]
    async fn reconnect_keeps_retrying_until_the_daemon_returns() {
        let broker = MockBroker::new();
        let transport = MockTransport::new(broker);
        let handle = transport.handle();
        let pool = pool_with(transport);

        pool.establish_direct("a", 4150).await.unwrap();
        handle.fail_dial("a", 4150);
        handle.drop_connection("a", 4150);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(pool.is_empty().await);
        assert!(handle.dial_count("a", 4150) >= 2);

        // Once the daemon accepts dials again the loop recovers.
        handle.allow_dial("a", 4150);
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if pool.len().await == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("reconnect loop did not recover");
    }

    #[tokio::test]
    async fn cursor_increments_and_never_resets_on_reconnect() {
        let broker = MockBroker::new();
        let pool = pool_with(MockTransport::new(broker));
        pool.establish_direct("a", 4150).await.unwrap();

        assert_eq!(pool.next_cursor(), 0);
        assert_eq!(pool.next_cursor(), 1);
        assert_eq!(pool.next_cursor(), 2);

        // Re-establish (a fresh connect) is what resets the cursor.
        pool.establish_direct("a", 4150).await.unwrap();
        assert_eq!(pool.next_cursor(), 0);
    }
}
