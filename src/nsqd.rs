//! HTTP admin client for a single nsqd daemon.
//!
//! Thin pass-through wrappers over the nsqd REST endpoints: publishing via
//! `/pub` (with optional defer), topic and channel administration, and
//! `/ping`. The pooled publish path goes through the transport seam instead;
//! this client exists for admin tooling and as the request layer the
//! HTTP-backed transport is built on.

use bytes::Bytes;
use reqwest::Client;

use crate::error::{ClientError, Result};
use crate::lookup::normalize_address;

/// REST client for one nsqd HTTP endpoint.
#[derive(Clone)]
pub struct Nsqd {
    address: String,
    client: Client,
}

impl Nsqd {
    /// Create a client for the given nsqd HTTP address (scheme optional).
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
        let url = format!("{}/ping", self.address);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.request_error("/ping", e.to_string()))?;
        self.check_status("/ping", response.status())
    }

    /// Publish one message to a topic.
    pub async fn publish(&self, topic: &str, body: Bytes) -> Result<()> {
        self.post_body("/pub", &[("topic", topic)], body).await
    }

    /// Publish one message visible to subscribers only after `defer_ms`.
    pub async fn defer_publish(&self, topic: &str, body: Bytes, defer_ms: u64) -> Result<()> {
        let defer = defer_ms.to_string();
        self.post_body("/pub", &[("topic", topic), ("defer", &defer)], body)
            .await
    }

    /// Create a topic.
    pub async fn create_topic(&self, topic: &str) -> Result<()> {
        self.post("/topic/create", &[("topic", topic)]).await
    }

    /// Delete a topic.
    pub async fn delete_topic(&self, topic: &str) -> Result<()> {
        self.post("/topic/delete", &[("topic", topic)]).await
    }

    /// Empty all queued messages for a topic.
    pub async fn empty_topic(&self, topic: &str) -> Result<()> {
        self.post("/topic/empty", &[("topic", topic)]).await
    }

    /// Create a channel under a topic.
    pub async fn create_channel(&self, topic: &str, channel: &str) -> Result<()> {
        self.post("/channel/create", &[("topic", topic), ("channel", channel)])
            .await
    }

    /// Delete a channel.
    pub async fn delete_channel(&self, topic: &str, channel: &str) -> Result<()> {
        self.post("/channel/delete", &[("topic", topic), ("channel", channel)])
            .await
    }

    /// Empty all queued messages on a channel.
    pub async fn empty_channel(&self, topic: &str, channel: &str) -> Result<()> {
        self.post("/channel/empty", &[("topic", topic), ("channel", channel)])
            .await
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
        self.check_status(path, response.status())
    }

    async fn post_body(&self, path: &str, query: &[(&str, &str)], body: Bytes) -> Result<()> {
        let url = format!("{}{}", self.address, path);
        let response = self
            .client
            .post(&url)
            .query(query)
            .body(body)
            .send()
            .await
            .map_err(|e| self.request_error(path, e.to_string()))?;
        self.check_status(path, response.status())
    }

    fn check_status(&self, path: &str, status: reqwest::StatusCode) -> Result<()> {
        if status.is_success() {
            Ok(())
        } else {
            Err(self.request_error(path, format!("HTTP {status}")))
        }
    }

    fn request_error(&self, path: &str, message: String) -> ClientError {
        ClientError::Admin {
            address: self.address.clone(),
            message: format!("{path}: {message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_is_normalized() {
        let client = Nsqd::new("localhost:4151");
        assert_eq!(client.address(), "http://localhost:4151");
    }
}
