//! Broker connection abstractions.
//!
//! The pool is generic over a [`ConnectionFactory`] so it never touches a
//! concrete broker driver. Connections are owned exclusively: by the pool
//! while idle, by exactly one renter between rent and return. All trait
//! methods therefore take `&mut self`; no connection is ever shared across
//! renters concurrently.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::time::Duration;

/// Whether a pool partition hands out producing or consuming connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerRole {
    Produce,
    Consume,
}

/// Identity of one pool partition: role, logical group, and topic set.
///
/// Keys compare by value; topic order is normalized at construction so
/// two keys naming the same topics in different orders are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    role: BrokerRole,
    group: Option<String>,
    topics: Vec<String>,
}

impl PoolKey {
    /// Key for a producer pool over a set of topics.
    pub fn producer(topics: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let mut topics: Vec<String> = topics.into_iter().map(Into::into).collect();
        topics.sort();
        topics.dedup();
        Self {
            role: BrokerRole::Produce,
            group: None,
            topics,
        }
    }

    /// Key for a consumer pool bound to a consumer group.
    pub fn consumer(
        group: impl Into<String>,
        topics: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let mut topics: Vec<String> = topics.into_iter().map(Into::into).collect();
        topics.sort();
        topics.dedup();
        Self {
            role: BrokerRole::Consume,
            group: Some(group.into()),
            topics,
        }
    }

    pub fn role(&self) -> BrokerRole {
        self.role
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match self.role {
            BrokerRole::Produce => "produce",
            BrokerRole::Consume => "consume",
        };
        write!(
            f,
            "{}:{}:[{}]",
            role,
            self.group.as_deref().unwrap_or("-"),
            self.topics.join(",")
        )
    }
}

/// Delivery acknowledgment for one sent message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub partition: u32,
    pub offset: u64,
    pub timestamp: i64,
}

/// One message as read off the broker, before deserialization.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub partition: u32,
    pub offset: u64,
    pub timestamp: i64,
    pub key: Option<Bytes>,
    pub payload: Bytes,
}

/// Outcome of one poll call against a consumer connection.
#[derive(Debug)]
pub enum PollOutcome {
    /// A message was available.
    Record(RawRecord),

    /// The consumer reached the end of its assigned partitions.
    EndOfPartition,

    /// Nothing arrived within the poll timeout.
    Idle,
}

/// Base contract every pooled broker connection satisfies.
#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    /// Whether the underlying native handle is still usable. Cheap; the
    /// pool calls this on every return and during maintenance.
    fn is_valid(&self) -> bool;

    /// Partitions currently assigned to this connection. Meaningful for
    /// consumers only; producers report none.
    fn assigned_partitions(&self) -> Vec<u32> {
        Vec::new()
    }

    /// Release the native handle. Disposal failures are the callee's to
    /// log; the pool never propagates them.
    async fn close(&mut self) {}
}

/// Contract for connections that can send messages.
#[async_trait]
pub trait ProducerConnection: BrokerConnection {
    /// Send one framed message and await the broker acknowledgment.
    async fn send(&mut self, topic: &str, key: Option<Bytes>, payload: Bytes) -> Result<Delivery>;
}

/// Contract for connections that can poll messages.
#[async_trait]
pub trait ConsumerConnection: BrokerConnection {
    /// Poll for the next message, waiting at most `timeout`.
    async fn poll(&mut self, timeout: Duration) -> Result<PollOutcome>;
}

/// Creates native broker connections for the pool.
///
/// The factory sees the full [`PoolKey`] so it can wire group identity
/// and topic subscriptions into the handle it builds. Creation errors
/// propagate to the renter unchanged; the pool records them in metrics
/// but never retries creation itself.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: BrokerConnection;

    /// Create a connection for a produce-role key.
    async fn create_producer(&self, key: &PoolKey) -> Result<Self::Connection>;

    /// Create a connection for a consume-role key.
    async fn create_consumer(&self, key: &PoolKey) -> Result<Self::Connection>;
}
