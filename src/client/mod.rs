//! The broker client port.
//!
//! The pool and the session facades talk to the cluster exclusively through
//! these traits. The production backend over the `kafka` crate lives in
//! [`kafka`]; tests script the in-memory cluster from [`crate::testing`].

pub mod kafka;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::metadata::Metadata;
use crate::record::Message;

/// Errors surfaced by a broker client backend.
///
/// The first three variants mirror the broker error codes the gateway
/// pattern-matches on; everything else is folded into `Protocol` (final
/// answers from the broker) or `Transport` (connection trouble, retried up
/// to the configured limits inside the backend).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// The partition has no elected leader right now.
    #[error("leader not available")]
    LeaderNotAvailable,

    /// A replica for the partition is missing from the ISR.
    #[error("replica not available")]
    ReplicaNotAvailable,

    #[error("unknown topic or partition")]
    UnknownTopicOrPartition,

    /// The fetch budget was too small to hold the next message.
    #[error("no data within the fetch budget")]
    NoData,

    /// Any other definitive broker answer. Never retried.
    #[error("broker error: {0}")]
    Protocol(String),

    /// Connection-level failure.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ClientError {
    /// Protocol-level answers are final; only transport failures warrant
    /// another attempt on the same session.
    pub fn is_retriable(&self) -> bool {
        matches!(self, ClientError::Transport(_))
    }
}

/// How sessions are dialed.
#[derive(Debug, Clone)]
pub struct DialConfig {
    /// Bootstrap broker addresses (`host:port`).
    pub brokers: Vec<String>,
    pub dial_timeout: Duration,
    pub leader_retry_limit: u32,
    pub leader_retry_wait: Duration,
    /// Let a produce to an unknown topic trigger broker-side auto-creation.
    pub allow_topic_creation: bool,
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub topic: String,
    pub partition: i32,
    pub start_offset: i64,
    pub request_timeout: Duration,
    pub retry_limit: u32,
    pub retry_wait: Duration,
    pub retry_err_limit: u32,
    pub retry_err_wait: Duration,
    pub min_fetch_size: i32,
    /// Byte budget for a single fetch; whole messages only.
    pub max_fetch_size: i32,
}

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub request_timeout: Duration,
    pub retry_limit: u32,
    pub retry_wait: Duration,
}

#[derive(Debug, Clone)]
pub struct OffsetCoordinatorConfig {
    /// Consumer group the offsets are recorded under.
    pub group: String,
    pub retry_err_limit: u32,
    pub retry_err_wait: Duration,
}

/// Dials broker sessions for the pool.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Arc<dyn BrokerSession>, ClientError>;
}

/// One long-lived connection to some broker in the bootstrap list.
///
/// Operations on a single session run strictly sequentially; concurrency
/// comes from the pool handing different sessions to different requests.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    async fn metadata(&self) -> Result<Metadata, ClientError>;

    async fn offset_earliest(&self, topic: &str, partition: i32) -> Result<i64, ClientError>;

    async fn offset_latest(&self, topic: &str, partition: i32) -> Result<i64, ClientError>;

    async fn consumer(&self, conf: ConsumerConfig) -> Result<Arc<dyn ConsumerSession>, ClientError>;

    async fn producer(&self, conf: ProducerConfig) -> Result<Arc<dyn ProducerSession>, ClientError>;

    async fn offset_coordinator(
        &self,
        conf: OffsetCoordinatorConfig,
    ) -> Result<Arc<dyn OffsetCoordinatorSession>, ClientError>;

    /// Tear down the underlying connection.
    async fn close(&self);
}

#[async_trait]
pub trait ConsumerSession: Send + Sync {
    /// Next message at the session cursor, honouring the fetch budget the
    /// session was opened with. `NoData` means the budget was too small.
    async fn consume(&self) -> Result<Message, ClientError>;
}

#[async_trait]
pub trait ProducerSession: Send + Sync {
    /// Append one message; returns its assigned offset.
    async fn produce(&self, topic: &str, partition: i32, payload: Bytes)
        -> Result<i64, ClientError>;
}

#[async_trait]
pub trait OffsetCoordinatorSession: Send + Sync {
    async fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<(), ClientError>;

    /// Committed offset and its metadata string for the partition.
    async fn fetch(&self, topic: &str, partition: i32) -> Result<(i64, String), ClientError>;
}
