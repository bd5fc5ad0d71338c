//! Node discovery via a cluster of nsqlookupd services.
//!
//! A [`Lookupd`] is a thin REST client for one lookupd daemon. A
//! [`LookupdCluster`] queries every configured lookupd concurrently and
//! merges the reported broker nodes into one deduplicated set: the same
//! physical daemon is usually reported by several lookupds, so the merge
//! keys on the node's stable `hostname` rather than on which service
//! reported it, preserving first-seen order.
//!
//! A single lookupd failing never aborts discovery; the failed query just
//! contributes no nodes. Deciding whether an empty merged set is fatal is
//! the producer's job.

use futures::future::join_all;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ClientError, Result};

/// One broker daemon as reported by a lookupd `/nodes` query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Address producers should dial (hostname or IP).
    pub broadcast_address: String,
    /// Stable node identity; the deduplication key across lookupds.
    pub hostname: String,
    /// TCP port of the broker's publish protocol.
    pub tcp_port: u16,
    /// HTTP admin port, when the lookupd reports it.
    #[serde(default)]
    pub http_port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct NodesResponse {
    producers: Vec<NodeDescriptor>,
}

#[derive(Debug, Deserialize)]
struct TopicsResponse {
    topics: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ChannelsResponse {
    channels: Vec<String>,
}

/// Producers and channels currently registered for one topic.
#[derive(Debug, Deserialize)]
pub struct LookupResponse {
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub producers: Vec<NodeDescriptor>,
}

/// Prefix `http://` when the address carries no scheme, and strip trailing
/// slashes so path concatenation stays predictable.
pub(crate) fn normalize_address(address: &str) -> String {
    let trimmed = address.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

/// Split a comma-separated address list, trimming whitespace around entries.
pub(crate) fn split_addresses(list: &str) -> Vec<String> {
    list.split(',')
        .map(|addr| addr.trim().to_string())
        .filter(|addr| !addr.is_empty())
        .collect()
}

/// REST client for a single nsqlookupd daemon.
#[derive(Debug)]
pub struct Lookupd {
    address: String,
    client: Client,
}

impl Lookupd {
    /// Create a client for the given lookupd HTTP address. A missing URL
    /// scheme is normalized to `http://`.
    pub fn new(address: impl AsRef<str>) -> Self {
        Self {
            address: normalize_address(address.as_ref()),
            client: Client::new(),
        }
    }

    /// The normalized base address this client talks to.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Liveness check.
    pub async fn ping(&self) -> Result<()> {
        self.get_text("/ping", &[]).await.map(|_| ())
    }

    /// All broker nodes known to this lookupd.
    pub async fn nodes(&self) -> Result<Vec<NodeDescriptor>> {
        let response: NodesResponse = self.get_json("/nodes", &[]).await?;
        Ok(response.producers)
    }

    /// Producers and channels for one topic.
    pub async fn lookup(&self, topic: &str) -> Result<LookupResponse> {
        self.get_json("/lookup", &[("topic", topic)]).await
    }

    /// All topics known to this lookupd.
    pub async fn topics(&self) -> Result<Vec<String>> {
        let response: TopicsResponse = self.get_json("/topics", &[]).await?;
        Ok(response.topics)
    }

    /// Channels registered under one topic.
    pub async fn channels(&self, topic: &str) -> Result<Vec<String>> {
        let response: ChannelsResponse = self.get_json("/channels", &[("topic", topic)]).await?;
        Ok(response.channels)
    }

    /// Remove a topic registration from this lookupd.
    pub async fn delete_topic(&self, topic: &str) -> Result<()> {
        self.post("/topic/delete", &[("topic", topic)]).await
    }

    /// Remove a channel registration from this lookupd.
    pub async fn delete_channel(&self, topic: &str, channel: &str) -> Result<()> {
        self.post("/channel/delete", &[("topic", topic), ("channel", channel)])
            .await
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let url = format!("{}{}", self.address, path);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| self.request_error(path, e.to_string()))?;

        if !response.status().is_success() {
            return Err(self.request_error(path, format!("HTTP {}", response.status())));
        }

        response
            .json()
            .await
            .map_err(|e| self.request_error(path, format!("invalid response body: {e}")))
    }

    async fn get_text(&self, path: &str, query: &[(&str, &str)]) -> Result<String> {
        let url = format!("{}{}", self.address, path);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| self.request_error(path, e.to_string()))?;

        if !response.status().is_success() {
            return Err(self.request_error(path, format!("HTTP {}", response.status())));
        }

        response
            .text()
            .await
            .map_err(|e| self.request_error(path, e.to_string()))
    }

    async fn post(&self, path: &str, query: &[(&str, &str)]) -> Result<()> {
        let url = format!("{}{}", self.address, path);
        let response = self
            .client
            .post(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| self.request_error(path, e.to_string()))?;

        if !response.status().is_success() {
            return Err(self.request_error(path, format!("HTTP {}", response.status())));
        }
        Ok(())
    }

    fn request_error(&self, path: &str, message: String) -> ClientError {
        ClientError::Lookup {
            address: self.address.clone(),
            message: format!("{path}: {message}"),
        }
    }
}

/// A cluster of independent lookupd services queried as one directory.
#[derive(Debug)]
pub struct LookupdCluster {
    lookupds: Vec<Lookupd>,
}

impl LookupdCluster {
    /// Build a cluster from a list of lookupd HTTP addresses.
    ///
    /// At least one address is required; addresses without a URL scheme get
    /// `http://` prefixed.
    pub fn new<I, S>(addresses: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let lookupds: Vec<Lookupd> = addresses.into_iter().map(Lookupd::new).collect();
        if lookupds.is_empty() {
            return Err(ClientError::Discovery(
                "at least one lookupd HTTP address is required".to_string(),
            ));
        }
        Ok(Self { lookupds })
    }

    /// Build a cluster from a comma-separated address string.
    pub fn from_comma_list(list: &str) -> Result<Self> {
        Self::new(split_addresses(list))
    }

    /// Normalized addresses of the configured lookupds.
    pub fn addresses(&self) -> Vec<&str> {
        self.lookupds.iter().map(|l| l.address()).collect()
    }

    /// Query every lookupd concurrently and merge the reported nodes.
    ///
    /// A failed query contributes no nodes and does not abort the others.
    /// The merged set preserves first-seen order and contains each node
    /// once, keyed by hostname. An empty result is not an error here; the
    /// producer decides whether zero nodes is fatal.
    pub async fn nodes(&self) -> Result<Vec<NodeDescriptor>> {
        let queries = self.lookupds.iter().map(|lookupd| async move {
            match lookupd.nodes().await {
                Ok(nodes) => {
                    debug!(
                        address = lookupd.address(),
                        count = nodes.len(),
                        "lookupd reported nodes"
                    );
                    nodes
                }
                Err(err) => {
                    warn!(
                        address = lookupd.address(),
                        error = %err,
                        "lookupd query failed, skipping"
                    );
                    Vec::new()
                }
            }
        });

        let reported = join_all(queries).await;
        Ok(merge_nodes(reported))
    }
}

/// Concatenate per-lookupd node lists and deduplicate by hostname,
/// preserving first-seen order.
fn merge_nodes(reported: Vec<Vec<NodeDescriptor>>) -> Vec<NodeDescriptor> {
    let mut seen = std::collections::HashSet::new();
    let mut merged = Vec::new();
    for node in reported.into_iter().flatten() {
        if seen.insert(node.hostname.clone()) {
            merged.push(node);
        }
    }
    merged
}
