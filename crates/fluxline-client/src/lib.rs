//! Pooled broker connections and batch operations for Fluxline.
//!
//! This crate is the client-side infrastructure layer between
//! application code and a partitioned message broker: a keyed,
//! health-checked connection pool, and a batch coordinator that drives
//! schema-aware send/receive through rented connections.
//!
//! # Architecture
//!
//! ```text
//! application
//!      │
//!      ▼
//! BatchCoordinator ──► SchemaCache (fluxline-schema)
//!      │
//!      ▼
//! ConnectionPool ──► ConnectionFactory ──► broker
//!   │ rent/return        (caller-supplied)
//!   └─ background maintenance: trim, shrink, health, rebalance monitor
//! ```
//!
//! # Example
//!
//! ```ignore
//! let pool = ConnectionPool::new(factory, PoolConfig::default())?;
//! let _maintenance = pool.spawn_maintenance();
//! let coordinator = BatchCoordinator::new(pool, cache);
//!
//! let key = PoolKey::producer(["orders"]);
//! let result = coordinator
//!     .send_batch(&shape, &key, "orders", &messages, &token)
//!     .await?;
//! if !result.all_successful() {
//!     for failure in &result.failures {
//!         eprintln!("message {} failed: {}", failure.index, failure.error);
//!     }
//! }
//! ```

pub mod batch;
pub mod connection;
pub mod error;
pub mod pool;

pub use batch::{
    BatchCoordinator, BatchDelivery, BatchFailure, BatchResult, ConsumedRecord,
    ReceiveBatchResult, ReceiveOptions,
};
pub use connection::{
    BrokerConnection, BrokerRole, ConnectionFactory, ConsumerConnection, Delivery, PollOutcome,
    PoolKey, ProducerConnection, RawRecord,
};
pub use error::{ClientError, Result};
pub use pool::{
    ConnectionLease, ConnectionPool, DisposalReason, HealthStatus, KeyDiagnostics, PoolConfig,
    PoolDiagnostics, PoolHealth, PoolMetrics,
};
