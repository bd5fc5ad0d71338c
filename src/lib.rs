//! nsq-dispatch - strategy-driven NSQ publishing client
//!
//! This crate provides a high-level publishing layer over NSQ daemons. It
//! handles node discovery through nsqlookupd clusters, connection pooling
//! with background reconnection, dispatch strategies (round-robin, bounded
//! fan-out, direct), retry with exponential backoff, and error handling.
//!
//! # Examples
//!
//! ## Discovery mode with round-robin dispatch
//!
//! ```ignore
//! use nsq_dispatch::{Producer, ProducerBuilder, Strategy};
//!
//! let producer = ProducerBuilder::new()
//!     .lookupd_http_addresses(["lookupd-a:4161", "lookupd-b:4161"])
//!     .strategy(Strategy::RoundRobin)
//!     .build()?;
//!
//! producer.connect().await?;
//! producer.produce("orders", "order data").await?;
//! ```
//!
//! ## Direct mode with retry
//!
//! ```ignore
//! use nsq_dispatch::{ProduceOptions, ProducerBuilder, RetrySpec};
//!
//! let producer = ProducerBuilder::new()
//!     .nsqd_host("localhost")
//!     .tcp_port(4150)
//!     .build()?;
//!
//! producer.connect().await?;
//! producer
//!     .produce_with("orders", "order data", ProduceOptions::default().retry(RetrySpec::Defaults))
//!     .await?;
//! ```

pub mod error;
pub mod lookup;
pub mod mock;
pub mod nsqd;
pub mod pool;
pub mod producer;
pub mod retry;
pub mod strategy;
pub mod transport;

pub use error::{ClientError, Result};
pub use lookup::{Lookupd, LookupdCluster, NodeDescriptor};
pub use nsqd::Nsqd;
pub use pool::ConnectionPool;
pub use producer::{ProduceOptions, Producer, ProducerBuilder};
pub use retry::{RetryPolicy, RetrySpec};
pub use strategy::Strategy;
pub use transport::{Connection, ConnectionEvent, HttpTransport, Transport};
