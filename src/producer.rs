//! The publishing facade.
//!
//! A [`Producer`] owns one [`ConnectionPool`] and routes publishes across it
//! with a dispatch [`Strategy`]. It is built through [`ProducerBuilder`] in
//! one of two exclusive modes: direct (one nsqd address) or discovery (a
//! cluster of nsqlookupd addresses queried for the live node set).
//!
//! `produce()` never blocks on recovery beyond what the caller opted into:
//! a retry policy passed in [`ProduceOptions`] wraps both the implicit
//! reconnection of an empty pool and the publish itself; without one, a
//! failure is reported after a single attempt.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::try_join_all;
use once_cell::sync::Lazy;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};
use crate::lookup::{LookupdCluster, NodeDescriptor};
use crate::pool::ConnectionPool;
use crate::retry::{RetryPolicy, RetrySpec};
use crate::strategy::Strategy;
use crate::transport::{HttpTransport, Transport};

/// Where the producer finds its daemons.
enum Mode {
    /// One fixed nsqd address.
    Direct { host: String, port: u16 },
    /// Node set discovered from an nsqlookupd cluster at `connect()` time.
    Discovery(LookupdCluster),
}

/// Per-call publish options.
///
/// Everything is optional; `Default` publishes with the producer's
/// configured strategy, no retry, and no defer.
#[derive(Default, Clone)]
pub struct ProduceOptions {
    /// Override the producer's dispatch strategy for this call.
    pub strategy: Option<Strategy>,
    /// Retry the publish under this policy. Incompatible with fan-out.
    pub retry: Option<RetrySpec>,
    /// Defer delivery by this interval (broker-side).
    pub delay: Option<Duration>,
    /// Bound the fan-out window for this call.
    pub max_fanout_nodes: Option<usize>,
}

impl ProduceOptions {
    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn retry(mut self, retry: impl Into<RetrySpec>) -> Self {
        self.retry = Some(retry.into());
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn max_fanout_nodes(mut self, n: usize) -> Self {
        self.max_fanout_nodes = Some(n);
        self
    }
}

/// Builder for [`Producer`].
///
/// Exactly one of [`nsqd_host`](Self::nsqd_host) or
/// [`lookupd_http_addresses`](Self::lookupd_http_addresses) must be set;
/// anything else is a configuration error at
/// [`build`](Self::build) time.
///
/// # Examples
///
/// ```ignore
/// let producer = ProducerBuilder::new()
///     .lookupd_http_addresses(["lookupd-a:4161", "lookupd-b:4161"])
///     .strategy(Strategy::RoundRobin)
///     .build()?;
/// producer.connect().await?;
/// ```
#[derive(Clone)]
pub struct ProducerBuilder {
    host: Option<String>,
    tcp_port: u16,
    lookupd_addresses: Vec<String>,
    strategy: Strategy,
    transport: Option<Arc<dyn Transport>>,
    reconnect_policy: RetryPolicy,
    max_fanout_nodes: Option<usize>,
}

impl Default for ProducerBuilder {
    fn default() -> Self {
        Self {
            host: None,
            tcp_port: 4150,
            lookupd_addresses: Vec::new(),
            strategy: Strategy::RoundRobin,
            transport: None,
            reconnect_policy: RetryPolicy::default(),
            max_fanout_nodes: None,
        }
    }
}

impl ProducerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct mode: publish to this single nsqd host.
    pub fn nsqd_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Advertised TCP publish port of the daemon in direct mode, the same
    /// number a lookupd would report for it. Defaults to 4150. The
    /// configured transport decides which port it actually dials from this
    /// ([`HttpTransport`] uses the HTTP API port, one above it).
    pub fn tcp_port(mut self, port: u16) -> Self {
        self.tcp_port = port;
        self
    }

    /// Discovery mode: nsqlookupd HTTP addresses, as a list.
    pub fn lookupd_http_addresses<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lookupd_addresses = addresses.into_iter().map(Into::into).collect();
        self
    }

    /// Discovery mode: nsqlookupd HTTP addresses as one comma-separated
    /// string, the form most deployment environments hand out.
    pub fn lookupd_http_address_list(mut self, list: &str) -> Self {
        self.lookupd_addresses = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        self
    }

    /// Default dispatch strategy for `produce()` calls that do not override
    /// it. Defaults to round-robin.
    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Inject a transport implementation. Defaults to [`HttpTransport`].
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Backoff policy the pool uses when re-dialing a dropped connection.
    pub fn reconnect_policy(mut self, policy: RetryPolicy) -> Self {
        self.reconnect_policy = policy;
        self
    }

    /// Default fan-out window bound, overridable per call.
    pub fn max_fanout_nodes(mut self, n: usize) -> Self {
        self.max_fanout_nodes = Some(n);
        self
    }

    /// Canonical identity of this configuration, used to key the shared
    /// registry. Lookupd addresses are sorted so permutations of the same
    /// cluster map to the same producer.
    fn identity(&self) -> String {
        let mode = match &self.host {
            Some(host) => format!("nsqd:{host}:{}", self.tcp_port),
            None => {
                let mut addrs = self.lookupd_addresses.clone();
                addrs.sort();
                format!("lookupd:{}", addrs.join(","))
            }
        };
        let strategy = match self.strategy {
            Strategy::RoundRobin => "round_robin",
            Strategy::FanOut => "fan_out",
            Strategy::Direct => "direct",
        };
        format!("{mode}|{strategy}")
    }

    /// Validate the configuration and build the producer. Does not dial;
    /// call [`Producer::connect`] next.
    pub fn build(self) -> Result<Producer> {
        let mode = match (self.host, self.lookupd_addresses.is_empty()) {
            (Some(_), false) => {
                return Err(ClientError::Config(
                    "nsqd_host and lookupd_http_addresses are mutually exclusive".to_string(),
                ))
            }
            (Some(host), true) => Mode::Direct {
                host,
                port: self.tcp_port,
            },
            (None, false) => Mode::Discovery(LookupdCluster::new(self.lookupd_addresses)?),
            (None, true) => {
                return Err(ClientError::Config(
                    "either nsqd_host or lookupd_http_addresses is required".to_string(),
                ))
            }
        };

        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(HttpTransport::new()));
        Ok(Producer {
            mode,
            strategy: self.strategy,
            max_fanout_nodes: self.max_fanout_nodes,
            transport: Arc::clone(&transport),
            pool: Arc::new(ConnectionPool::new(transport, self.reconnect_policy)),
            connected: AtomicBool::new(false),
        })
    }
}

/// Client-side publishing endpoint over a pool of nsqd connections.
pub struct Producer {
    mode: Mode,
    strategy: Strategy,
    max_fanout_nodes: Option<usize>,
    transport: Arc<dyn Transport>,
    pool: Arc<ConnectionPool>,
    connected: AtomicBool,
}

impl Producer {
    /// Establish (or re-establish) the connection pool.
    ///
    /// In discovery mode the lookupd cluster is queried for the live node
    /// set first; an empty merged set is a
    /// [`ClientError::Discovery`]. Dials run concurrently; the first dial
    /// error is surfaced while connections that did succeed stay in the
    /// pool.
    ///
    /// # Returns
    ///
    /// The `(host, port)` pairs connected after this call.
    pub async fn connect(&self) -> Result<Vec<(String, u16)>> {
        match &self.mode {
            Mode::Direct { host, port } => {
                // The configured port is the node's advertised TCP publish
                // port; the transport maps it to the port it actually
                // dials, exactly as it does for discovered nodes.
                let node = NodeDescriptor {
                    broadcast_address: host.clone(),
                    hostname: host.clone(),
                    tcp_port: *port,
                    http_port: None,
                };
                let dial_port = self.transport.node_port(&node);
                debug!(host = %host, port = dial_port, "connecting to nsqd");
                self.pool.establish_direct(host, dial_port).await?;
            }
            Mode::Discovery(cluster) => {
                let nodes = cluster.nodes().await?;
                if nodes.is_empty() {
                    return Err(ClientError::Discovery(
                        "lookupd cluster reported no nsqd nodes".to_string(),
                    ));
                }
                let peers: Vec<(String, u16)> = nodes
                    .iter()
                    .map(|node| (node.broadcast_address.clone(), self.transport.node_port(node)))
                    .collect();
                info!(nodes = peers.len(), "discovered nsqd nodes");
                self.pool.establish(&peers).await?;
            }
        }

        self.connected.store(true, Ordering::SeqCst);
        Ok(self.pool.peers().await)
    }

    /// Publish `body` to `topic`.
    ///
    /// The dispatch strategy (the producer's default unless overridden in
    /// `options`) decides which pooled connections carry the message. An
    /// empty pool triggers one implicit reconnection first; with a retry
    /// policy in `options`, both that reconnection and the publish are
    /// retried under it.
    ///
    /// Combining a retry policy with fan-out is rejected with
    /// [`ClientError::UnsupportedConfiguration`] before any network action:
    /// retrying a partially successful fan-out would re-deliver to the
    /// nodes that already accepted the message.
    pub async fn produce(&self, topic: &str, body: impl Into<Bytes>) -> Result<()> {
        self.produce_with(topic, body, ProduceOptions::default()).await
    }

    /// [`produce`](Self::produce) with explicit [`ProduceOptions`].
    pub async fn produce_with(
        &self,
        topic: &str,
        body: impl Into<Bytes>,
        options: ProduceOptions,
    ) -> Result<()> {
        if self.pool.is_closed() {
            return Err(ClientError::Closed);
        }

        let strategy = options.strategy.unwrap_or(self.strategy);
        if options.retry.is_some() && strategy == Strategy::FanOut {
            return Err(ClientError::UnsupportedConfiguration(
                "retry cannot be combined with fan-out dispatch".to_string(),
            ));
        }

        let body = body.into();
        let max_fanout = options.max_fanout_nodes.or(self.max_fanout_nodes);

        if self.pool.is_empty().await {
            warn!(topic, "connection pool is empty, reconnecting");
            match &options.retry {
                Some(spec) => {
                    let policy = spec.policy();
                    policy.run(|| async { self.connect().await.map(|_| ()) }).await?;
                }
                None => {
                    if let Err(error) = self.connect().await {
                        warn!(%error, "implicit reconnection failed");
                        return Err(ClientError::NoConnections);
                    }
                }
            }
        }

        match &options.retry {
            Some(spec) => {
                let policy = spec.policy();
                policy
                    .run(|| self.produce_once(topic, body.clone(), strategy, options.delay, max_fanout))
                    .await
            }
            None => {
                self.produce_once(topic, body, strategy, options.delay, max_fanout)
                    .await
            }
        }
    }

    /// One dispatch pass: snapshot the pool, select indices, publish.
    ///
    /// Fan-out awaits every selected publish and reports the first failure;
    /// publishes that already succeeded are not rolled back.
    async fn produce_once(
        &self,
        topic: &str,
        body: Bytes,
        strategy: Strategy,
        delay: Option<Duration>,
        max_fanout_nodes: Option<usize>,
    ) -> Result<()> {
        let snapshot = self.pool.snapshot().await;
        if snapshot.is_empty() {
            return Err(ClientError::NoConnections);
        }

        let cursor = self.pool.next_cursor();
        let indices = strategy.select(snapshot.len(), cursor, max_fanout_nodes);
        debug!(topic, ?indices, cursor, "dispatching publish");

        let publishes = indices.into_iter().map(|i| {
            let conn = Arc::clone(&snapshot[i].conn);
            let body = body.clone();
            async move {
                match delay {
                    Some(delay) => conn.publish_deferred(topic, body, delay).await,
                    None => conn.publish(topic, body).await,
                }
            }
        });
        try_join_all(publishes).await?;
        Ok(())
    }

    /// Addresses currently connected.
    pub async fn peers(&self) -> Vec<(String, u16)> {
        self.pool.peers().await
    }

    /// Close every connection and stop background reconnection.
    ///
    /// Calling this before [`connect`](Self::connect) is a
    /// [`ClientError::NotConnected`].
    pub async fn close(&self) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ClientError::NotConnected);
        }
        self.pool.close().await;
        Ok(())
    }
}

/// Process-wide registry of shared producers, keyed by configuration
/// identity.
static SHARED: Lazy<Mutex<HashMap<String, Arc<Producer>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

impl Producer {
    /// Return the process-wide producer for this configuration, building
    /// and connecting it on first use.
    ///
    /// The registry lock is held across construction and `connect()`, so
    /// concurrent first callers for the same configuration await a single
    /// construction instead of racing. A closed shared producer is rebuilt
    /// on the next call.
    pub async fn shared(builder: ProducerBuilder) -> Result<Arc<Producer>> {
        let key = builder.identity();
        let mut registry = SHARED.lock().await;
        if let Some(existing) = registry.get(&key) {
            if !existing.pool.is_closed() {
                return Ok(Arc::clone(existing));
            }
        }

        let producer = Arc::new(builder.build()?);
        producer.connect().await?;
        registry.insert(key, Arc::clone(&producer));
        Ok(producer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_requires_exactly_one_mode() {
        let neither = ProducerBuilder::new().build();
        assert!(matches!(neither, Err(ClientError::Config(_))));

        let both = ProducerBuilder::new()
            .nsqd_host("localhost")
            .lookupd_http_addresses(["localhost:4161"])
            .build();
        assert!(matches!(both, Err(ClientError::Config(_))));

        let direct = ProducerBuilder::new().nsqd_host("localhost").build();
        assert!(direct.is_ok());

        let discovery = ProducerBuilder::new()
            .lookupd_http_addresses(["localhost:4161"])
            .build();
        assert!(discovery.is_ok());
    }

    #[test]
    fn identity_is_canonical_across_address_order() {
        let a = ProducerBuilder::new()
            .lookupd_http_addresses(["b:4161", "a:4161"])
            .identity();
        let b = ProducerBuilder::new()
            .lookupd_http_addresses(["a:4161", "b:4161"])
            .identity();
        assert_eq!(a, b);

        let direct = ProducerBuilder::new().nsqd_host("h").tcp_port(4150).identity();
        assert_ne!(a, direct);
    }

    #[test]
    fn comma_list_is_split_and_trimmed() {
        let builder = ProducerBuilder::new()
            .lookupd_http_address_list("a:4161, b:4161 ,,c:4161");
        assert_eq!(builder.lookupd_addresses, vec!["a:4161", "b:4161", "c:4161"]);
    }

    #[test]
    fn identity_distinguishes_strategy() {
        let rr = ProducerBuilder::new().nsqd_host("h").identity();
        let fo = ProducerBuilder::new()
            .nsqd_host("h")
            .strategy(Strategy::FanOut)
            .identity();
        assert_ne!(rr, fo);
    }
}
