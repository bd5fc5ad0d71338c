//! Deterministic in-memory broker for offline testing.
//!
//! [`MockBroker`] is a process-local publish/subscribe registry: topics hold
//! channels, each (topic, channel) pair holds handlers, and messages
//! published before any handler exists are stacked per topic and drained the
//! moment the first handler hooks on. [`MockTransport`] implements the
//! transport seam on top of it, so a producer can be pointed at the
//! simulator by constructor injection without touching any call site.
//!
//! The transport adds the failure controls integration tests need:
//! refusing dials, failing publishes, and force-dropping live connections to
//! exercise the pool's background reconnection.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use crate::error::{ClientError, Result};
use crate::transport::{Connection, ConnectionEvent, EventReceiver, Transport};

/// A message as seen by a mock subscriber.
#[derive(Debug, Clone)]
pub struct MockMessage {
    topic: String,
    body: Bytes,
    attempts: u32,
}

impl MockMessage {
    fn new(topic: &str, body: Bytes) -> Self {
        Self {
            topic: topic.to_string(),
            body,
            attempts: 1,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Delivery attempts, starting at 1 and bumped by `requeue`.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Deserialize the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> std::result::Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Acknowledge the message. A no-op in the simulator.
    pub fn finish(&mut self) {}

    /// Ask for redelivery. The simulator only tracks the attempt count;
    /// real redelivery scheduling is consumer-side behavior outside this
    /// crate.
    pub fn requeue(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }
}

/// Callback invoked for each message reaching a (topic, channel) hook.
pub type Handler = Arc<dyn Fn(MockMessage) + Send + Sync>;

/// One publish that went through the mock transport, for test assertions.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// `host:port` of the connection that carried the publish.
    pub target: String,
    pub topic: String,
    pub body: Bytes,
    /// Defer interval for deferred publishes.
    pub deferred: Option<Duration>,
}

#[derive(Default)]
struct BrokerState {
    /// topic -> channels registered under it.
    channels: HashMap<String, Vec<String>>,
    /// (topic, channel) -> handlers; only the first handler of each channel
    /// receives messages, matching one-consumer-per-channel delivery.
    handlers: HashMap<(String, String), Vec<Handler>>,
    /// Messages published before any handler existed, drained on first hook.
    queued: HashMap<String, Vec<MockMessage>>,
    deliveries: Vec<Delivery>,
}

/// Process-local pub/sub registry backing the mock transport.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a message to a topic, dispatching to the first handler of
    /// every channel, or stacking it if no channel has a handler yet.
    pub fn publish(&self, topic: &str, body: Bytes) {
        let message = MockMessage::new(topic, body);
        let handlers = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            first_handler_per_channel(&state, topic)
        };

        if handlers.is_empty() {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state
                .queued
                .entry(topic.to_string())
                .or_default()
                .push(message);
        } else {
            for handler in handlers {
                handler(message.clone());
            }
        }
    }

    /// Hook a handler on a (topic, channel) pair. The first handler on a
    /// channel drains any messages stacked for the topic.
    pub fn subscribe(&self, topic: &str, channel: &str, handler: Handler) {
        let drained = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let channels = state.channels.entry(topic.to_string()).or_default();
            if !channels.iter().any(|c| c == channel) {
                channels.push(channel.to_string());
            }

            let key = (topic.to_string(), channel.to_string());
            let first_hook = !state.handlers.contains_key(&key);
            state.handlers.entry(key).or_default().push(handler.clone());

            if first_hook {
                state.queued.remove(topic).unwrap_or_default()
            } else {
                Vec::new()
            }
        };

        for message in drained {
            handler(message);
        }
    }

    /// Every publish carried by the mock transport, in order.
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .deliveries
            .clone()
    }

    /// Reset all registrations, queues, and the delivery log.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = BrokerState::default();
    }

    fn record(&self, delivery: Delivery) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .deliveries
            .push(delivery);
    }
}

fn first_handler_per_channel(state: &BrokerState, topic: &str) -> Vec<Handler> {
    state
        .channels
        .get(topic)
        .map(|channels| {
            channels
                .iter()
                .filter_map(|channel| {
                    state
                        .handlers
                        .get(&(topic.to_string(), channel.clone()))
                        .and_then(|handlers| handlers.first().cloned())
                })
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Default)]
struct TransportState {
    fail_dials: Mutex<HashSet<(String, u16)>>,
    fail_publishes: Mutex<HashSet<(String, u16)>>,
    dial_counts: Mutex<HashMap<(String, u16), usize>>,
    /// Latest event sender per address, for force-dropping connections.
    event_senders: Mutex<HashMap<(String, u16), mpsc::UnboundedSender<ConnectionEvent>>>,
}

/// Transport implementation backed by a [`MockBroker`].
///
/// Clones share state; keep a clone (or call [`handle`](Self::handle)) to
/// steer failures after the transport has been moved into the producer.
#[derive(Clone)]
pub struct MockTransport {
    broker: MockBroker,
    state: Arc<TransportState>,
}

impl MockTransport {
    pub fn new(broker: MockBroker) -> Self {
        Self {
            broker,
            state: Arc::new(TransportState::default()),
        }
    }

    /// A control handle sharing this transport's state.
    pub fn handle(&self) -> MockTransport {
        self.clone()
    }

    pub fn broker(&self) -> &MockBroker {
        &self.broker
    }

    /// Make future dials to `host:port` fail with a connect error.
    pub fn fail_dial(&self, host: &str, port: u16) {
        self.state
            .fail_dials
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((host.to_string(), port));
    }

    /// Allow dials to `host:port` again.
    pub fn allow_dial(&self, host: &str, port: u16) {
        self.state
            .fail_dials
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(host.to_string(), port));
    }

    /// Make the next publish on the connection to `host:port` fail and tear
    /// the connection down, as a daemon rejecting a request would.
    pub fn fail_publish(&self, host: &str, port: u16) {
        self.state
            .fail_publishes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((host.to_string(), port));
    }

    /// Force-close the live connection to `host:port`, as if the daemon
    /// dropped it mid-session.
    pub fn drop_connection(&self, host: &str, port: u16) {
        let sender = self
            .state
            .event_senders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(host.to_string(), port));
        if let Some(sender) = sender {
            let _ = sender.send(ConnectionEvent::Closed);
        }
    }

    /// How many times `host:port` has been dialed.
    pub fn dial_count(&self, host: &str, port: u16) -> usize {
        *self
            .state
            .dial_counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(host.to_string(), port))
            .unwrap_or(&0)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn dial(&self, host: &str, port: u16) -> Result<(Arc<dyn Connection>, EventReceiver)> {
        let key = (host.to_string(), port);
        *self
            .state
            .dial_counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key.clone())
            .or_default() += 1;

        let refused = self
            .state
            .fail_dials
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&key);
        if refused {
            return Err(ClientError::Connect {
                host: host.to_string(),
                port,
                message: "connection refused (mock)".to_string(),
            });
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.state
            .event_senders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, events_tx.clone());

        let conn = MockConnection {
            host: host.to_string(),
            port,
            broker: self.broker.clone(),
            state: Arc::clone(&self.state),
            events: events_tx,
            closed: AtomicBool::new(false),
        };
        Ok((Arc::new(conn), events_rx))
    }
}

struct MockConnection {
    host: String,
    port: u16,
    broker: MockBroker,
    state: Arc<TransportState>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    closed: AtomicBool,
}

impl MockConnection {
    fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn deliver(&self, topic: &str, body: Bytes, deferred: Option<Duration>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Publish {
                host: self.host.clone(),
                port: self.port,
                message: "connection is closed".to_string(),
            });
        }

        // One-shot: the injected failure fires once, so a reconnected link
        // to the same address publishes normally.
        let failing = self
            .state
            .fail_publishes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(self.host.clone(), self.port));
        if failing {
            if !self.closed.swap(true, Ordering::SeqCst) {
                let _ = self
                    .events
                    .send(ConnectionEvent::Error("publish failed (mock)".to_string()));
                let _ = self.events.send(ConnectionEvent::Closed);
            }
            return Err(ClientError::Publish {
                host: self.host.clone(),
                port: self.port,
                message: "publish failed (mock)".to_string(),
            });
        }

        self.broker.record(Delivery {
            target: self.target(),
            topic: topic.to_string(),
            body: body.clone(),
            deferred,
        });
        self.broker.publish(topic, body);
        Ok(())
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn publish(&self, topic: &str, body: Bytes) -> Result<()> {
        self.deliver(topic, body, None)
    }

    async fn publish_deferred(&self, topic: &str, body: Bytes, delay: Duration) -> Result<()> {
        self.deliver(topic, body, Some(delay))
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(ConnectionEvent::Closed);
        }
    }
}
