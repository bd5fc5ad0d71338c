//! Transport capability seam between the pool and the wire.
//!
//! The pool does not know how bytes reach a broker. It depends on two
//! object-safe traits: [`Transport`] dials a daemon and hands back a ready
//! [`Connection`] plus a lifecycle event channel, and [`Connection`] carries
//! publishes. Implementations are selected by constructor injection on the
//! producer builder; the crate ships [`HttpTransport`] for real daemons and
//! [`crate::mock::MockTransport`] for offline tests.
//!
//! `dial` resolves only once the link is ready, so a failure during
//! handshake is a dial error propagated to the pending `connect()` caller.
//! Anything that goes wrong after readiness is reported through the event
//! channel instead and handled by the pool's background supervision, never
//! by the dialing caller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{ClientError, Result};
use crate::lookup::NodeDescriptor;
use crate::nsqd::Nsqd;

/// Lifecycle notification emitted by a connection after it reached
/// readiness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A transport-level error; informational, usually followed by `Closed`.
    Error(String),
    /// The link is gone. The pool decides whether this is a clean shutdown
    /// or an unexpected drop that needs a reconnect.
    Closed,
}

/// Receiving half of a connection's lifecycle channel.
pub type EventReceiver = mpsc::UnboundedReceiver<ConnectionEvent>;

/// An established, ready link to one broker daemon.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Publish one message to a topic.
    async fn publish(&self, topic: &str, body: Bytes) -> Result<()>;

    /// Publish one message the broker holds back for `delay` before making
    /// it visible to subscribers.
    async fn publish_deferred(&self, topic: &str, body: Bytes, delay: Duration) -> Result<()>;

    /// Close the link. Idempotent.
    async fn close(&self);
}

/// Dials broker daemons.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a link to `host:port`, resolving once it is ready.
    ///
    /// The returned receiver reports lifecycle events for the life of the
    /// connection; its channel closing counts as a close.
    async fn dial(&self, host: &str, port: u16) -> Result<(Arc<dyn Connection>, EventReceiver)>;

    /// Which port of a discovered node this transport dials.
    fn node_port(&self, node: &NodeDescriptor) -> u16 {
        node.tcp_port
    }
}

/// Production transport over the nsqd HTTP publish API.
///
/// `dial` performs a `/ping` handshake; publishes go through `/pub` (with
/// `defer` for delayed messages). HTTP is connectionless, so a failed
/// request is treated as the link dropping: the connection reports
/// `Error` + `Closed` and the pool re-dials it in the background.
#[derive(Default)]
pub struct HttpTransport;

impl HttpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn dial(&self, host: &str, port: u16) -> Result<(Arc<dyn Connection>, EventReceiver)> {
        let nsqd = Nsqd::new(format!("{host}:{port}"));
        nsqd.ping().await.map_err(|e| ClientError::Connect {
            host: host.to_string(),
            port,
            message: e.to_string(),
        })?;

        debug!(host, port, "nsqd handshake ok");
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let conn = HttpConnection {
            host: host.to_string(),
            port,
            nsqd,
            events: events_tx,
            closed: AtomicBool::new(false),
        };
        Ok((Arc::new(conn), events_rx))
    }

    /// Discovered nodes advertise their TCP publish port; the HTTP API
    /// conventionally listens one above it unless the lookupd reported the
    /// HTTP port explicitly.
    fn node_port(&self, node: &NodeDescriptor) -> u16 {
        node.http_port.unwrap_or(node.tcp_port + 1)
    }
}

struct HttpConnection {
    host: String,
    port: u16,
    nsqd: Nsqd,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    closed: AtomicBool,
}

impl HttpConnection {
    fn fail(&self, err: ClientError) -> ClientError {
        // First failure tears the logical connection down; the pool
        // re-establishes it in the background.
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(ConnectionEvent::Error(err.to_string()));
            let _ = self.events.send(ConnectionEvent::Closed);
        }
        ClientError::Publish {
            host: self.host.clone(),
            port: self.port,
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl Connection for HttpConnection {
    async fn publish(&self, topic: &str, body: Bytes) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Publish {
                host: self.host.clone(),
                port: self.port,
                message: "connection is closed".to_string(),
            });
        }
        self.nsqd
            .publish(topic, body)
            .await
            .map_err(|e| self.fail(e))
    }

    async fn publish_deferred(&self, topic: &str, body: Bytes, delay: Duration) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Publish {
                host: self.host.clone(),
                port: self.port,
                message: "connection is closed".to_string(),
            });
        }
        self.nsqd
            .defer_publish(topic, body, delay.as_millis() as u64)
            .await
            .map_err(|e| self.fail(e))
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(ConnectionEvent::Closed);
        }
    }
}
