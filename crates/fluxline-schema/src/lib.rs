//! Schema registry integration and wire serialization for Fluxline.
//!
//! This crate owns everything between an entity record and the framed
//! bytes on the broker: subject naming, Avro schema derivation from
//! entity shapes, registration against a Confluent-style registry with
//! retry, and a per-entity serializer cache.
//!
//! # Architecture
//!
//! ```text
//! EntityShapeDescriptor ──► derive schemas ──► SchemaRegistry (HTTP)
//!                                 │                   │
//!                                 ▼                   ▼
//!                           SchemaCache ◄──── registered schema id
//!                                 │
//!                                 ▼
//!                  EntitySerializer / EntityDeserializer
//!                      (0x00 + schema id + Avro datum)
//! ```
//!
//! # Example
//!
//! ```ignore
//! let registry = Arc::new(HttpSchemaRegistry::new("http://localhost:8081".to_string())?);
//! let cache = SchemaCache::new(registry, SchemaCacheConfig::default());
//!
//! let token = CancellationToken::new();
//! let bytes = cache.encode_value(&shape, &record, &token).await?;
//! ```

pub mod cache;
pub mod error;
pub mod registry;
pub mod retry;
pub mod serde;
pub mod shape;
pub mod types;

pub use cache::{
    EntityCodecs, EntityStatistics, RegistrationReport, SchemaCache, SchemaCacheConfig,
    SchemaCacheEntry, SerializationStatistics, ValidationMode,
};
pub use error::{Result, SchemaError};
pub use registry::{HttpSchemaRegistry, SchemaRegistry};
pub use retry::{retry_with_backoff, retry_with_jittered_backoff, RetryPolicy};
pub use serde::{decode_framed, encode_framed, EntityDeserializer, EntitySerializer};
pub use shape::{
    derive_key_schema, derive_value_schema, EntityRecord, EntityShapeDescriptor, FieldKind,
    FieldShape, FieldValue, StaticEntityShape,
};
pub use types::{subject_for, RegisteredSchema, SchemaFormat, SchemaRole};
