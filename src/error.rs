//! Error types for producer operations.
//!
//! All public APIs return [`Result<T>`], and every failure a caller can see
//! is a typed [`ClientError`] variant. Errors are categorized by where they
//! occur in the publish pipeline:
//!
//! - **Configuration / misuse**: `Config`, `UnsupportedConfiguration`,
//!   `Closed`, `NotConnected`
//! - **Discovery**: `Discovery`, `Lookup`
//! - **Connection lifecycle**: `Connect`, `NoConnections`
//! - **Publishing**: `Publish`, `RetriesExhausted`
//! - **Admin REST**: `Admin`
//!
//! ## Propagation policy
//!
//! Dial failures before a connection reaches readiness propagate to the
//! pending `connect()` caller. Failures after readiness are absorbed by the
//! pool's background reconnect loop and never surface to unrelated callers.
//! Publish failures surface to the specific `produce()` caller, unless a
//! retry policy is configured, in which case only the final error surfaces,
//! wrapped as [`ClientError::RetriesExhausted`].

use thiserror::Error;

/// Convenience alias for `Result<T, ClientError>` used throughout the crate.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Error type covering every failure mode of the producer pipeline.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Discovery could not produce any broker nodes.
    ///
    /// Raised when zero lookupd addresses are configured, or when every
    /// configured lookupd was queried and the merged node set came back
    /// empty. Connecting with zero nodes is never silently accepted.
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// A single lookupd query failed.
    ///
    /// Individual query failures are isolated during discovery (they
    /// contribute no nodes but do not abort the other queries); this variant
    /// surfaces only from direct `Lookupd` calls.
    #[error("lookupd {address} request failed: {message}")]
    Lookup { address: String, message: String },

    /// Dial or handshake against a broker daemon failed.
    ///
    /// Surfaced from the first failing concurrent dial during `connect()`.
    /// Connections that succeeded before the failure stay registered in the
    /// pool; they are not rolled back.
    #[error("failed to connect to nsqd at {host}:{port}: {message}")]
    Connect {
        host: String,
        port: u16,
        message: String,
    },

    /// A publish reached the transport and failed there.
    #[error("publish to {host}:{port} failed: {message}")]
    Publish {
        host: String,
        port: u16,
        message: String,
    },

    /// Produce was attempted with an empty pool and the implicit reconnect
    /// did not yield any connections.
    #[error("no nsqd connections available")]
    NoConnections,

    /// The requested option combination is rejected before any network
    /// action. Currently: per-call retry under the fan-out strategy, where a
    /// partial failure has no single-operation retry semantics.
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// The retry budget is spent; wraps the last underlying error.
    #[error("retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<ClientError>,
    },

    /// `produce()` was called after `close()`. No reconnection is attempted;
    /// call `connect()` again to reopen the pool.
    #[error("producer is closed, call connect() to reopen the pool")]
    Closed,

    /// `close()` was called on a producer that never connected.
    #[error("producer was never connected")]
    NotConnected,

    /// An admin REST call (nsqd or lookupd pass-through) failed.
    #[error("admin request to {address} failed: {message}")]
    Admin { address: String, message: String },

    /// Invalid builder or option configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// True when this error is the terminal wrapper produced by an exhausted
    /// retry loop.
    pub fn is_retries_exhausted(&self) -> bool {
        matches!(self, ClientError::RetriesExhausted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_exhausted_preserves_source() {
        let err = ClientError::RetriesExhausted {
            attempts: 4,
            source: Box::new(ClientError::NoConnections),
        };
        assert!(err.is_retries_exhausted());
        assert!(err.to_string().contains("4 attempts"));
        assert!(err.to_string().contains("no nsqd connections"));
    }

    #[test]
    fn connect_error_includes_address() {
        let err = ClientError::Connect {
            host: "10.0.0.1".to_string(),
            port: 4150,
            message: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "failed to connect to nsqd at 10.0.0.1:4150: connection refused"
        );
    }
}
