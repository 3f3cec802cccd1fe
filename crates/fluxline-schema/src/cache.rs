//! Serializer cache backed by the schema registry.
//!
//! One cache slot exists per `(entity, role)` pair. Slots are created
//! lazily on first use: the entity's shape is turned into Avro schema
//! text, registered under its subject through the configured
//! [`RetryPolicy`], and the resulting serializer/deserializer pair is
//! stored until an explicit cache clear. Key and value subjects register
//! independently.
//!
//! ## Concurrency
//!
//! Each slot is a `tokio::sync::OnceCell`, so concurrent first-use
//! requests for the same entity coalesce into exactly one registration
//! call and every caller receives the same stored entry. Different entity
//! types never contend on the same lock; the outer map is only locked
//! long enough to look up or insert a slot handle.
//!
//! ## Statistics
//!
//! Hit/miss and codec-latency counters are plain atomics, updated on
//! every access and rolled up per entity plus globally. Reading a
//! snapshot never blocks cache operations and never resets anything.

use crate::error::{Result, SchemaError};
use crate::registry::SchemaRegistry;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::serde::{EntityDeserializer, EntitySerializer};
use crate::shape::{
    derive_key_schema, derive_value_schema, EntityRecord, EntityShapeDescriptor, FieldShape,
};
use crate::types::{subject_for, RegisteredSchema, SchemaFormat, SchemaRole};
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Configuration for the schema cache.
///
/// Each registry operation kind carries its own retry policy; their
/// budgets are independent.
#[derive(Debug, Clone)]
pub struct SchemaCacheConfig {
    /// Wire format registered with the registry. Only Avro is encoded
    /// natively; the format tag is passed through to the registry.
    pub format: SchemaFormat,

    /// Retry policy for schema registration.
    pub registration_policy: RetryPolicy,

    /// Retry policy for schema retrieval.
    pub retrieval_policy: RetryPolicy,

    /// Retry policy for compatibility checks.
    pub compatibility_policy: RetryPolicy,
}

impl Default for SchemaCacheConfig {
    fn default() -> Self {
        Self {
            format: SchemaFormat::Avro,
            registration_policy: RetryPolicy::default(),
            retrieval_policy: RetryPolicy::default(),
            compatibility_policy: RetryPolicy::default(),
        }
    }
}

/// How startup-time registration failures are escalated.
///
/// Supplied by the context façade when it pre-registers its entity model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// Abort on the first registration failure.
    FailFast,

    /// Log the failure and continue; sends for that entity will fail
    /// individually instead of failing startup.
    LogAndContinue,
}

/// Outcome of a bulk startup registration.
#[derive(Debug, Default)]
pub struct RegistrationReport {
    /// Entities whose subjects registered successfully.
    pub registered: Vec<String>,

    /// Entities that failed, with the terminal error message.
    pub failed: Vec<(String, String)>,
}

/// One cached serializer/deserializer pair for an `(entity, role)` slot.
pub struct SchemaCacheEntry {
    serializer: EntitySerializer,
    deserializer: EntityDeserializer,
    schema_id: i32,
    registered_at: SystemTime,
    last_used_ms: AtomicU64,
    use_count: AtomicU64,
}

impl SchemaCacheEntry {
    pub fn schema_id(&self) -> i32 {
        self.schema_id
    }

    pub fn registered_at(&self) -> SystemTime {
        self.registered_at
    }

    pub fn use_count(&self) -> u64 {
        self.use_count.load(Ordering::Relaxed)
    }

    /// Last access time as milliseconds since the Unix epoch; zero if the
    /// entry has never been used.
    pub fn last_used_ms(&self) -> u64 {
        self.last_used_ms.load(Ordering::Relaxed)
    }

    pub fn serializer(&self) -> &EntitySerializer {
        &self.serializer
    }

    pub fn deserializer(&self) -> &EntityDeserializer {
        &self.deserializer
    }

    fn touch(&self) {
        self.use_count.fetch_add(1, Ordering::Relaxed);
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.last_used_ms.store(now_ms, Ordering::Relaxed);
    }
}

/// Serializer/deserializer entries for an entity: value slot always, key
/// slot only when the entity declares key fields.
#[derive(Clone)]
pub struct EntityCodecs {
    pub key: Option<Arc<SchemaCacheEntry>>,
    pub value: Arc<SchemaCacheEntry>,
}

#[derive(Default)]
struct StatsCell {
    serializations: AtomicU64,
    deserializations: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    serialize_nanos: AtomicU64,
    deserialize_nanos: AtomicU64,
}

impl StatsCell {
    fn snapshot(&self) -> EntityStatistics {
        let serializations = self.serializations.load(Ordering::Relaxed);
        let deserializations = self.deserializations.load(Ordering::Relaxed);
        let serialize_nanos = self.serialize_nanos.load(Ordering::Relaxed);
        let deserialize_nanos = self.deserialize_nanos.load(Ordering::Relaxed);
        EntityStatistics {
            serializations,
            deserializations,
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            avg_serialize_micros: if serializations == 0 {
                0.0
            } else {
                serialize_nanos as f64 / serializations as f64 / 1_000.0
            },
            avg_deserialize_micros: if deserializations == 0 {
                0.0
            } else {
                deserialize_nanos as f64 / deserializations as f64 / 1_000.0
            },
        }
    }
}

/// Cumulative counters for one entity type (or the global rollup).
#[derive(Debug, Clone, Serialize)]
pub struct EntityStatistics {
    pub serializations: u64,
    pub deserializations: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub avg_serialize_micros: f64,
    pub avg_deserialize_micros: f64,
}

/// Snapshot of cache statistics; reading it has no side effects.
#[derive(Debug, Clone, Serialize)]
pub struct SerializationStatistics {
    pub global: EntityStatistics,
    pub per_entity: HashMap<String, EntityStatistics>,
}

type CacheKey = (String, SchemaRole);
type Slot = Arc<OnceCell<Arc<SchemaCacheEntry>>>;

/// Per-entity-type cache of wire serializers, bound to the registry.
///
/// Explicitly constructed and owned by the top-level context; never
/// process-global.
pub struct SchemaCache {
    registry: Arc<dyn SchemaRegistry>,
    config: SchemaCacheConfig,
    slots: RwLock<HashMap<CacheKey, Slot>>,
    global_stats: StatsCell,
    entity_stats: RwLock<HashMap<String, Arc<StatsCell>>>,
}

impl SchemaCache {
    pub fn new(registry: Arc<dyn SchemaRegistry>, config: SchemaCacheConfig) -> Self {
        Self {
            registry,
            config,
            slots: RwLock::new(HashMap::new()),
            global_stats: StatsCell::default(),
            entity_stats: RwLock::new(HashMap::new()),
        }
    }

    fn slot(&self, entity: &str, role: SchemaRole) -> Slot {
        let key = (entity.to_string(), role);
        {
            let slots = self.slots.read().expect("slots lock poisoned");
            if let Some(slot) = slots.get(&key) {
                return slot.clone();
            }
        }
        let mut slots = self.slots.write().expect("slots lock poisoned");
        slots
            .entry(key)
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    fn stats_for(&self, entity: &str) -> Arc<StatsCell> {
        {
            let stats = self.entity_stats.read().expect("stats lock poisoned");
            if let Some(cell) = stats.get(entity) {
                return cell.clone();
            }
        }
        let mut stats = self.entity_stats.write().expect("stats lock poisoned");
        stats
            .entry(entity.to_string())
            .or_insert_with(|| Arc::new(StatsCell::default()))
            .clone()
    }

    fn record_lookup(&self, entity: &str, hit: bool) {
        let cell = self.stats_for(entity);
        if hit {
            cell.cache_hits.fetch_add(1, Ordering::Relaxed);
            self.global_stats.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            cell.cache_misses.fetch_add(1, Ordering::Relaxed);
            self.global_stats
                .cache_misses
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn build_entry(
        &self,
        descriptor: &dyn EntityShapeDescriptor,
        role: SchemaRole,
        schema_text: &str,
        fields: Vec<FieldShape>,
        token: &CancellationToken,
    ) -> Result<Arc<SchemaCacheEntry>> {
        let subject = subject_for(descriptor.entity_name(), role);
        let registry = self.registry.clone();
        let format = self.config.format;

        let schema_id = retry_with_backoff(&self.config.registration_policy, token, || {
            let registry = registry.clone();
            let subject = subject.clone();
            let schema_text = schema_text.to_string();
            async move { registry.register_schema(&subject, &schema_text, format).await }
        })
        .await?;

        debug!(
            entity = descriptor.entity_name(),
            role = ?role,
            schema_id,
            "Registered schema and built codec pair"
        );

        Ok(Arc::new(SchemaCacheEntry {
            serializer: EntitySerializer::new(schema_text, schema_id, fields)?,
            deserializer: EntityDeserializer::new(schema_text, schema_id)?,
            schema_id,
            registered_at: SystemTime::now(),
            last_used_ms: AtomicU64::new(0),
            use_count: AtomicU64::new(0),
        }))
    }

    async fn resolve(
        &self,
        descriptor: &dyn EntityShapeDescriptor,
        role: SchemaRole,
        token: &CancellationToken,
    ) -> Result<Arc<SchemaCacheEntry>> {
        let entity = descriptor.entity_name();
        let slot = self.slot(entity, role);

        if let Some(entry) = slot.get() {
            self.record_lookup(entity, true);
            entry.touch();
            return Ok(entry.clone());
        }

        // Miss path. The OnceCell coalesces concurrent initializers, so
        // the registry sees exactly one registration per slot; a failed
        // initialization leaves the slot empty for a later retry.
        self.record_lookup(entity, false);

        let (schema_text, fields) = match role {
            SchemaRole::Value => (derive_value_schema(descriptor)?, descriptor.fields().to_vec()),
            SchemaRole::Key => {
                let text = derive_key_schema(descriptor)?.ok_or_else(|| {
                    SchemaError::InvalidSchema(format!("entity '{}' has no key fields", entity))
                })?;
                let fields = descriptor
                    .key_fields()
                    .iter()
                    .filter_map(|name| descriptor.fields().iter().find(|f| &f.name == name))
                    .cloned()
                    .collect();
                (text, fields)
            }
        };

        let entry = slot
            .get_or_try_init(|| self.build_entry(descriptor, role, &schema_text, fields, token))
            .await?;
        entry.touch();
        Ok(entry.clone())
    }

    /// Get the serializer pair for an entity, registering schemas on
    /// first use.
    ///
    /// The value subject always resolves; the key subject resolves only
    /// when the entity declares key fields.
    pub async fn get_serializers(
        &self,
        descriptor: &dyn EntityShapeDescriptor,
        token: &CancellationToken,
    ) -> Result<EntityCodecs> {
        let value = self.resolve(descriptor, SchemaRole::Value, token).await?;
        let key = if descriptor.key_fields().is_empty() {
            None
        } else {
            Some(self.resolve(descriptor, SchemaRole::Key, token).await?)
        };
        Ok(EntityCodecs { key, value })
    }

    /// Get the deserializer pair for an entity.
    ///
    /// Resolves the same cache slots as [`Self::get_serializers`]; each
    /// entry carries both directions of the codec.
    pub async fn get_deserializers(
        &self,
        descriptor: &dyn EntityShapeDescriptor,
        token: &CancellationToken,
    ) -> Result<EntityCodecs> {
        self.get_serializers(descriptor, token).await
    }

    /// Encode an entity record for the value subject, updating statistics.
    pub async fn encode_value(
        &self,
        descriptor: &dyn EntityShapeDescriptor,
        record: &EntityRecord,
        token: &CancellationToken,
    ) -> Result<Bytes> {
        let entry = self.resolve(descriptor, SchemaRole::Value, token).await?;
        self.timed_serialize(descriptor.entity_name(), &entry, record)
    }

    /// Encode the key fields of an entity record for the key subject.
    ///
    /// Returns `None` for keyless entities.
    pub async fn encode_key(
        &self,
        descriptor: &dyn EntityShapeDescriptor,
        record: &EntityRecord,
        token: &CancellationToken,
    ) -> Result<Option<Bytes>> {
        if descriptor.key_fields().is_empty() {
            return Ok(None);
        }
        let entry = self.resolve(descriptor, SchemaRole::Key, token).await?;
        self.timed_serialize(descriptor.entity_name(), &entry, record)
            .map(Some)
    }

    /// Decode value-subject wire bytes back into an entity record.
    pub async fn decode_value(
        &self,
        descriptor: &dyn EntityShapeDescriptor,
        data: &[u8],
        token: &CancellationToken,
    ) -> Result<EntityRecord> {
        let entry = self.resolve(descriptor, SchemaRole::Value, token).await?;
        self.timed_deserialize(descriptor.entity_name(), &entry, data)
    }

    /// Decode key-subject wire bytes back into an entity record.
    pub async fn decode_key(
        &self,
        descriptor: &dyn EntityShapeDescriptor,
        data: &[u8],
        token: &CancellationToken,
    ) -> Result<EntityRecord> {
        let entry = self.resolve(descriptor, SchemaRole::Key, token).await?;
        self.timed_deserialize(descriptor.entity_name(), &entry, data)
    }

    fn timed_serialize(
        &self,
        entity: &str,
        entry: &SchemaCacheEntry,
        record: &EntityRecord,
    ) -> Result<Bytes> {
        let start = Instant::now();
        let bytes = entry.serializer.serialize(record)?;
        let nanos = start.elapsed().as_nanos() as u64;

        let cell = self.stats_for(entity);
        cell.serializations.fetch_add(1, Ordering::Relaxed);
        cell.serialize_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.global_stats
            .serializations
            .fetch_add(1, Ordering::Relaxed);
        self.global_stats
            .serialize_nanos
            .fetch_add(nanos, Ordering::Relaxed);
        Ok(bytes)
    }

    fn timed_deserialize(
        &self,
        entity: &str,
        entry: &SchemaCacheEntry,
        data: &[u8],
    ) -> Result<EntityRecord> {
        let start = Instant::now();
        let record = entry.deserializer.deserialize(data)?;
        let nanos = start.elapsed().as_nanos() as u64;

        let cell = self.stats_for(entity);
        cell.deserializations.fetch_add(1, Ordering::Relaxed);
        cell.deserialize_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.global_stats
            .deserializations
            .fetch_add(1, Ordering::Relaxed);
        self.global_stats
            .deserialize_nanos
            .fetch_add(nanos, Ordering::Relaxed);
        Ok(record)
    }

    /// Serialize then deserialize a sample record and verify field-for-field
    /// equality. Intended for startup self-checks, not the hot path.
    pub async fn validate_round_trip(
        &self,
        descriptor: &dyn EntityShapeDescriptor,
        sample: &EntityRecord,
        token: &CancellationToken,
    ) -> Result<()> {
        let bytes = self.encode_value(descriptor, sample, token).await?;
        let decoded = self.decode_value(descriptor, &bytes, token).await?;

        for field in descriptor.fields() {
            let original = sample.get(&field.name).unwrap_or(&crate::shape::FieldValue::Null);
            let round_tripped = decoded
                .get(&field.name)
                .unwrap_or(&crate::shape::FieldValue::Null);
            if original != round_tripped {
                return Err(SchemaError::Serialization(format!(
                    "round-trip mismatch for '{}.{}': {:?} != {:?}",
                    descriptor.entity_name(),
                    field.name,
                    original,
                    round_tripped
                )));
            }
        }
        Ok(())
    }

    /// Check whether the entity's current value schema is compatible with
    /// the version registered for its subject.
    pub async fn check_compatibility(
        &self,
        descriptor: &dyn EntityShapeDescriptor,
        token: &CancellationToken,
    ) -> Result<bool> {
        let schema_text = derive_value_schema(descriptor)?;
        let subject = subject_for(descriptor.entity_name(), SchemaRole::Value);
        let registry = self.registry.clone();

        retry_with_backoff(&self.config.compatibility_policy, token, || {
            let registry = registry.clone();
            let subject = subject.clone();
            let schema_text = schema_text.clone();
            async move { registry.check_compatible(&subject, &schema_text).await }
        })
        .await
    }

    /// Fetch the latest registered schema for a subject, with retries.
    pub async fn fetch_latest(
        &self,
        subject: &str,
        token: &CancellationToken,
    ) -> Result<RegisteredSchema> {
        let registry = self.registry.clone();
        let subject = subject.to_string();

        retry_with_backoff(&self.config.retrieval_policy, token, || {
            let registry = registry.clone();
            let subject = subject.clone();
            async move { registry.get_latest_schema(&subject).await }
        })
        .await
    }

    /// Register schemas for a set of entities at startup.
    ///
    /// With [`ValidationMode::FailFast`] the first failure aborts; with
    /// [`ValidationMode::LogAndContinue`] failures are logged and the
    /// entity is left unregistered, so later sends for it fail
    /// individually rather than failing startup.
    pub async fn register_all(
        &self,
        descriptors: &[&dyn EntityShapeDescriptor],
        mode: ValidationMode,
        token: &CancellationToken,
    ) -> Result<RegistrationReport> {
        let mut report = RegistrationReport::default();

        for descriptor in descriptors {
            match self.get_serializers(*descriptor, token).await {
                Ok(_) => {
                    report.registered.push(descriptor.entity_name().to_string());
                }
                Err(err) => match mode {
                    ValidationMode::FailFast => {
                        error!(
                            entity = descriptor.entity_name(),
                            error = %err,
                            "Schema registration failed, aborting startup"
                        );
                        return Err(err);
                    }
                    ValidationMode::LogAndContinue => {
                        warn!(
                            entity = descriptor.entity_name(),
                            error = %err,
                            "Schema registration failed, continuing degraded"
                        );
                        report
                            .failed
                            .push((descriptor.entity_name().to_string(), err.to_string()));
                    }
                },
            }
        }

        info!(
            registered = report.registered.len(),
            failed = report.failed.len(),
            "Startup schema registration completed"
        );
        Ok(report)
    }

    /// Snapshot the cumulative statistics. Never resets state.
    pub fn get_statistics(&self) -> SerializationStatistics {
        let per_entity = self
            .entity_stats
            .read()
            .expect("stats lock poisoned")
            .iter()
            .map(|(name, cell)| (name.clone(), cell.snapshot()))
            .collect();
        SerializationStatistics {
            global: self.global_stats.snapshot(),
            per_entity,
        }
    }

    /// Drop the cache slots for one entity; the next access re-registers.
    pub fn clear_cache(&self, entity: &str) {
        let mut slots = self.slots.write().expect("slots lock poisoned");
        slots.remove(&(entity.to_string(), SchemaRole::Key));
        slots.remove(&(entity.to_string(), SchemaRole::Value));
        debug!(entity, "Cleared schema cache entries");
    }

    /// Drop every cache slot; subsequent accesses re-register from scratch.
    pub fn clear_cache_all(&self) {
        let mut slots = self.slots.write().expect("slots lock poisoned");
        let count = slots.len();
        slots.clear();
        debug!(entries = count, "Cleared all schema cache entries");
    }

    /// Number of populated cache slots.
    pub fn entry_count(&self) -> usize {
        self.slots
            .read()
            .expect("slots lock poisoned")
            .values()
            .filter(|slot| slot.get().is_some())
            .count()
    }
}
