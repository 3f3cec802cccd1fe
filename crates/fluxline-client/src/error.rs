//! Error types for Fluxline client operations.
//!
//! This module defines all possible errors that can occur during pooled
//! connection and batch operations. Errors are categorized by source
//! (connection, broker, schema, lifecycle) to make debugging easier.
//!
//! ## Error Handling Strategy
//!
//! - **Retriable errors**: `ConnectionFailed`, `Timeout`
//! - **Client errors**: `ConfigError`
//! - **Lifecycle errors**: `Cancelled`, `PoolShutdown`
//! - **Fatal errors**: `BrokerError`, `Internal`
//!
//! ## Examples
//!
//! ```ignore
//! use fluxline_client::{BatchCoordinator, ClientError};
//!
//! match coordinator.send_batch(&shape, "orders", messages, &token).await {
//!     Ok(result) => println!("Sent {} of {}", result.successful, result.total),
//!     Err(ClientError::PoolShutdown) => {
//!         eprintln!("Pool already shut down");
//!     }
//!     Err(e) => eprintln!("Error: {}", e),
//! }
//! ```

use thiserror::Error;

/// Convenience type alias for `Result<T, ClientError>`.
///
/// This is the standard Result type used throughout the client library.
/// All public APIs return this type for consistent error handling.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Comprehensive error type for Fluxline client operations.
///
/// ## Error Categories
///
/// - **Communication**: `ConnectionFailed`, `BrokerError`, `Timeout`
/// - **Lifecycle**: `Cancelled`, `PoolShutdown`
/// - **Configuration**: `ConfigError`
/// - **Serialization**: `Schema`
/// - **Unknown**: `Internal`
#[derive(Debug, Error)]
pub enum ClientError {
    /// Failed to establish a broker connection.
    ///
    /// Raised when the connection factory cannot create a connection for
    /// a pool key. The pool surfaces this to the renter immediately;
    /// connection creation is never retried inside the pool.
    ///
    /// ## Causes
    /// - Broker is down or unreachable
    /// - Authentication failure
    /// - Network partition
    ///
    /// ## Resolution
    /// - Verify broker address and credentials
    /// - Retry the operation through the caller's retry policy
    #[error("Failed to create broker connection: {0}")]
    ConnectionFailed(String),

    /// Broker accepted the connection but rejected an operation.
    ///
    /// ## Causes
    /// - Topic or partition does not exist
    /// - Broker-side quota or authorization failure
    /// - Broker is shutting down
    #[error("Broker error: {0}")]
    BrokerError(String),

    /// Operation exceeded its configured deadline.
    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Operation was cancelled through its cancellation token.
    ///
    /// For sends, cancellation surfaces as this error; for receives, the
    /// batch collected so far is returned instead.
    #[error("Operation cancelled")]
    Cancelled,

    /// The connection pool has been shut down.
    ///
    /// Shutdown is terminal: rents fail with this error, and leases
    /// returned afterwards are disposed rather than re-queued.
    #[error("Connection pool is shut down")]
    PoolShutdown,

    /// Invalid client configuration.
    ///
    /// ## Causes
    /// - min_pool_size greater than max_pool_size
    /// - Zero-sized batch or queue limits
    ///
    /// ## Resolution
    /// - Review the pool/batch configuration values
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Schema registration or serialization failed.
    ///
    /// Wraps errors from the schema layer, automatically converted via
    /// the `#[from]` attribute.
    #[error("Schema error: {0}")]
    Schema(#[from] fluxline_schema::SchemaError),

    /// Internal error that shouldn't normally occur.
    ///
    /// ## Resolution
    /// - Report as a bug with full error message
    #[error("Internal error: {0}")]
    Internal(String),
}
