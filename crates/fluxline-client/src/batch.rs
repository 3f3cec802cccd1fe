//! Batch send and receive over pooled connections.
//!
//! The coordinator rents one connection per batch, drives every message
//! through it, and returns the connection on every exit path, including
//! errors and cancellation. Send outcomes are accounted per message in a
//! [`BatchResult`]; a partial failure is data, not an error.

use crate::connection::{ConnectionFactory, ConsumerConnection, PollOutcome, PoolKey, ProducerConnection};
use crate::error::{ClientError, Result};
use crate::pool::{ConnectionLease, ConnectionPool};
use fluxline_schema::{EntityRecord, EntityShapeDescriptor, SchemaCache};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One failed message within a batch.
#[derive(Debug)]
pub struct BatchFailure {
    /// Index of the message in the submitted batch.
    pub index: usize,
    pub error: ClientError,
}

/// Delivery acknowledgment for one successfully sent message.
#[derive(Debug, Clone)]
pub struct BatchDelivery {
    pub index: usize,
    pub partition: u32,
    pub offset: u64,
    pub timestamp: i64,
}

/// Outcome of a batch send.
///
/// `successful + failures.len() == total` holds for every batch,
/// including the empty one. "All successful" is derived, never stored.
#[derive(Debug)]
pub struct BatchResult {
    pub total: usize,
    pub successful: usize,
    pub deliveries: Vec<BatchDelivery>,
    pub failures: Vec<BatchFailure>,
    pub elapsed: Duration,
}

impl BatchResult {
    pub fn failed_count(&self) -> usize {
        self.failures.len()
    }

    pub fn all_successful(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Options controlling one batch receive.
#[derive(Debug, Clone)]
pub struct ReceiveOptions {
    /// Stop once this many messages have been collected.
    pub max_batch_size: usize,

    /// Overall wait budget for the batch.
    pub max_wait_time: Duration,

    /// Upper bound for a single poll call against the connection.
    pub poll_timeout: Duration,

    /// When true, an end-of-partition signal ends the batch early; when
    /// false it means "no more data right now" and polling continues
    /// until the wait budget is spent.
    pub enable_empty_batches: bool,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            max_batch_size: 500,
            max_wait_time: Duration::from_secs(5),
            poll_timeout: Duration::from_millis(200),
            enable_empty_batches: false,
        }
    }
}

/// One decoded message from a batch receive.
#[derive(Debug)]
pub struct ConsumedRecord {
    pub partition: u32,
    pub offset: u64,
    pub timestamp: i64,
    pub key: Option<EntityRecord>,
    pub value: EntityRecord,
}

/// Outcome of a batch receive. Skipped counts messages dropped because
/// they failed to deserialize.
#[derive(Debug)]
pub struct ReceiveBatchResult {
    pub records: Vec<ConsumedRecord>,
    pub skipped: usize,
    pub elapsed: Duration,
}

/// Drives batch operations through the pool and the schema cache.
pub struct BatchCoordinator<F: ConnectionFactory> {
    pool: ConnectionPool<F>,
    cache: Arc<SchemaCache>,
}

impl<F: ConnectionFactory> BatchCoordinator<F> {
    pub fn new(pool: ConnectionPool<F>, cache: Arc<SchemaCache>) -> Self {
        Self { pool, cache }
    }

    pub fn pool(&self) -> &ConnectionPool<F> {
        &self.pool
    }

    pub fn cache(&self) -> &Arc<SchemaCache> {
        &self.cache
    }

    /// Send a batch of entity records to `topic` through one rented
    /// connection.
    ///
    /// Serialization failures and broker rejections are recorded per
    /// index; the rest of the batch still goes out. Cancellation aborts
    /// the whole operation with [`ClientError::Cancelled`]. The
    /// connection is returned to the pool on every exit path.
    pub async fn send_batch(
        &self,
        descriptor: &dyn EntityShapeDescriptor,
        key: &PoolKey,
        topic: &str,
        messages: &[EntityRecord],
        token: &CancellationToken,
    ) -> Result<BatchResult>
    where
        F::Connection: ProducerConnection,
    {
        let start = Instant::now();
        if messages.is_empty() {
            return Ok(BatchResult {
                total: 0,
                successful: 0,
                deliveries: Vec::new(),
                failures: Vec::new(),
                elapsed: start.elapsed(),
            });
        }

        let mut lease = self.pool.rent(key, token).await?;
        let result = self
            .drive_send(&mut lease, descriptor, topic, messages, token, start)
            .await;
        self.pool.return_lease(lease).await;
        result
    }

    async fn drive_send(
        &self,
        lease: &mut ConnectionLease<F::Connection>,
        descriptor: &dyn EntityShapeDescriptor,
        topic: &str,
        messages: &[EntityRecord],
        token: &CancellationToken,
        start: Instant,
    ) -> Result<BatchResult>
    where
        F::Connection: ProducerConnection,
    {
        let mut deliveries = Vec::new();
        let mut failures = Vec::new();

        for (index, record) in messages.iter().enumerate() {
            if token.is_cancelled() {
                return Err(ClientError::Cancelled);
            }

            let payload = match self.cache.encode_value(descriptor, record, token).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    failures.push(BatchFailure {
                        index,
                        error: err.into(),
                    });
                    continue;
                }
            };
            let key_bytes = match self.cache.encode_key(descriptor, record, token).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    failures.push(BatchFailure {
                        index,
                        error: err.into(),
                    });
                    continue;
                }
            };

            let sent = tokio::select! {
                result = lease.connection().send(topic, key_bytes, payload) => result,
                _ = token.cancelled() => return Err(ClientError::Cancelled),
            };

            match sent {
                Ok(delivery) => deliveries.push(BatchDelivery {
                    index,
                    partition: delivery.partition,
                    offset: delivery.offset,
                    timestamp: delivery.timestamp,
                }),
                Err(error) => failures.push(BatchFailure { index, error }),
            }
        }

        let result = BatchResult {
            total: messages.len(),
            successful: deliveries.len(),
            deliveries,
            failures,
            elapsed: start.elapsed(),
        };
        debug!(
            topic,
            total = result.total,
            successful = result.successful,
            failed = result.failed_count(),
            elapsed_ms = result.elapsed.as_millis() as u64,
            "Batch send completed"
        );
        Ok(result)
    }

    /// Receive a batch of entity records through one rented connection.
    ///
    /// Polls until `max_batch_size` messages are collected or
    /// `max_wait_time` elapses, whichever comes first. Messages that fail
    /// to deserialize are logged and skipped. Cancellation truncates the
    /// batch to what was collected so far; it is not an error.
    pub async fn receive_batch(
        &self,
        descriptor: &dyn EntityShapeDescriptor,
        key: &PoolKey,
        options: &ReceiveOptions,
        token: &CancellationToken,
    ) -> Result<ReceiveBatchResult>
    where
        F::Connection: ConsumerConnection,
    {
        let start = Instant::now();
        let mut lease = self.pool.rent(key, token).await?;
        let result = self
            .drive_receive(&mut lease, descriptor, options, token, start)
            .await;
        self.pool.return_lease(lease).await;
        result
    }

    async fn drive_receive(
        &self,
        lease: &mut ConnectionLease<F::Connection>,
        descriptor: &dyn EntityShapeDescriptor,
        options: &ReceiveOptions,
        token: &CancellationToken,
        start: Instant,
    ) -> Result<ReceiveBatchResult>
    where
        F::Connection: ConsumerConnection,
    {
        let deadline = start + options.max_wait_time;
        let mut records = Vec::new();
        let mut skipped = 0usize;

        while records.len() < options.max_batch_size {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let poll_timeout = options.poll_timeout.min(deadline - now);

            let outcome = tokio::select! {
                result = lease.connection().poll(poll_timeout) => result?,
                _ = token.cancelled() => {
                    debug!(collected = records.len(), "Receive cancelled, truncating batch");
                    break;
                }
            };

            match outcome {
                PollOutcome::Record(raw) => {
                    let value = match self.cache.decode_value(descriptor, &raw.payload, token).await
                    {
                        Ok(value) => value,
                        Err(err) => {
                            warn!(
                                partition = raw.partition,
                                offset = raw.offset,
                                error = %err,
                                "Skipping undecodable message"
                            );
                            skipped += 1;
                            continue;
                        }
                    };
                    let key = match &raw.key {
                        Some(bytes) if !descriptor.key_fields().is_empty() => {
                            match self.cache.decode_key(descriptor, bytes, token).await {
                                Ok(key) => Some(key),
                                Err(err) => {
                                    warn!(
                                        partition = raw.partition,
                                        offset = raw.offset,
                                        error = %err,
                                        "Dropping undecodable message key"
                                    );
                                    None
                                }
                            }
                        }
                        _ => None,
                    };
                    records.push(ConsumedRecord {
                        partition: raw.partition,
                        offset: raw.offset,
                        timestamp: raw.timestamp,
                        key,
                        value,
                    });
                }
                PollOutcome::EndOfPartition => {
                    if options.enable_empty_batches {
                        break;
                    }
                    // No more data right now; keep polling within budget.
                }
                PollOutcome::Idle => {}
            }
        }

        let result = ReceiveBatchResult {
            records,
            skipped,
            elapsed: start.elapsed(),
        };
        debug!(
            received = result.records.len(),
            skipped = result.skipped,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "Batch receive completed"
        );
        Ok(result)
    }
}
