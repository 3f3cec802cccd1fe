//! End-to-end pipeline test: schema registration, batch send, batch
//! receive, and pool lifecycle against an in-memory broker and registry.

use async_trait::async_trait;
use bytes::Bytes;
use fluxline_client::{
    BatchCoordinator, BrokerConnection, ClientError, ConnectionFactory, ConnectionPool,
    ConsumerConnection, Delivery, HealthStatus, PollOutcome, PoolConfig, PoolKey,
    ProducerConnection, RawRecord,
};
use fluxline_schema::{
    EntityRecord, FieldKind, FieldShape, FieldValue, RegisteredSchema, Result as SchemaResult,
    RetryPolicy, SchemaCache, SchemaCacheConfig, SchemaError, SchemaFormat, SchemaRegistry,
    StaticEntityShape,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct MemoryRegistry {
    register_calls: AtomicUsize,
    schemas: Mutex<HashMap<(String, String), i32>>,
    next_id: AtomicUsize,
}

impl MemoryRegistry {
    fn new() -> Self {
        Self {
            register_calls: AtomicUsize::new(0),
            schemas: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(1),
        }
    }
}

#[async_trait]
impl SchemaRegistry for MemoryRegistry {
    async fn register_schema(
        &self,
        subject: &str,
        schema: &str,
        _format: SchemaFormat,
    ) -> SchemaResult<i32> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        let mut schemas = self.schemas.lock().unwrap();
        let key = (subject.to_string(), schema.to_string());
        if let Some(id) = schemas.get(&key) {
            return Ok(*id);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) as i32;
        schemas.insert(key, id);
        Ok(id)
    }

    async fn get_latest_schema(&self, subject: &str) -> SchemaResult<RegisteredSchema> {
        let schemas = self.schemas.lock().unwrap();
        schemas
            .iter()
            .find(|((s, _), _)| s == subject)
            .map(|((s, text), id)| RegisteredSchema {
                id: *id,
                subject: s.clone(),
                version: 1,
                schema: text.clone(),
            })
            .ok_or_else(|| SchemaError::SubjectNotFound(subject.to_string()))
    }

    async fn check_compatible(&self, _subject: &str, _schema: &str) -> SchemaResult<bool> {
        Ok(true)
    }

    async fn list_subjects(&self) -> SchemaResult<Vec<String>> {
        let schemas = self.schemas.lock().unwrap();
        Ok(schemas.keys().map(|(s, _)| s.clone()).collect())
    }
}

/// Shared append-only topic log standing in for a broker partition.
#[derive(Default)]
struct TopicLog {
    messages: Mutex<Vec<(Option<Bytes>, Bytes)>>,
}

struct LoopbackConnection {
    log: Arc<TopicLog>,
    position: usize,
}

#[async_trait]
impl BrokerConnection for LoopbackConnection {
    fn is_valid(&self) -> bool {
        true
    }
}

#[async_trait]
impl ProducerConnection for LoopbackConnection {
    async fn send(
        &mut self,
        _topic: &str,
        key: Option<Bytes>,
        payload: Bytes,
    ) -> fluxline_client::Result<Delivery> {
        let mut messages = self.log.messages.lock().unwrap();
        let offset = messages.len() as u64;
        messages.push((key, payload));
        Ok(Delivery {
            partition: 0,
            offset,
            timestamp: 1_700_000_000_000 + offset as i64,
        })
    }
}

#[async_trait]
impl ConsumerConnection for LoopbackConnection {
    async fn poll(&mut self, _timeout: Duration) -> fluxline_client::Result<PollOutcome> {
        let messages = self.log.messages.lock().unwrap();
        match messages.get(self.position) {
            Some((key, payload)) => {
                let offset = self.position as u64;
                self.position += 1;
                Ok(PollOutcome::Record(RawRecord {
                    partition: 0,
                    offset,
                    timestamp: 1_700_000_000_000 + offset as i64,
                    key: key.clone(),
                    payload: payload.clone(),
                }))
            }
            None => Ok(PollOutcome::EndOfPartition),
        }
    }
}

struct LoopbackFactory {
    log: Arc<TopicLog>,
    created: AtomicUsize,
}

/// Newtype so the foreign `ConnectionFactory` trait can be implemented for
/// a shared factory handle without tripping the orphan rule.
struct LoopbackHandle(Arc<LoopbackFactory>);

#[async_trait]
impl ConnectionFactory for LoopbackHandle {
    type Connection = LoopbackConnection;

    async fn create_producer(&self, _key: &PoolKey) -> fluxline_client::Result<LoopbackConnection> {
        self.0.created.fetch_add(1, Ordering::SeqCst);
        Ok(LoopbackConnection {
            log: self.0.log.clone(),
            position: 0,
        })
    }

    async fn create_consumer(&self, _key: &PoolKey) -> fluxline_client::Result<LoopbackConnection> {
        self.0.created.fetch_add(1, Ordering::SeqCst);
        Ok(LoopbackConnection {
            log: self.0.log.clone(),
            position: 0,
        })
    }
}

fn order_shape() -> StaticEntityShape {
    StaticEntityShape::new(
        "Order",
        vec![
            FieldShape::new("order_id", FieldKind::Long),
            FieldShape::new("customer", FieldKind::String),
            FieldShape::optional("note", FieldKind::String),
        ],
        vec!["order_id".to_string()],
    )
    .unwrap()
}

fn order(id: i64, customer: &str) -> EntityRecord {
    let mut record = EntityRecord::new();
    record.insert("order_id".to_string(), FieldValue::Long(id));
    record.insert(
        "customer".to_string(),
        FieldValue::String(customer.to_string()),
    );
    record
}

struct Pipeline {
    registry: Arc<MemoryRegistry>,
    factory: Arc<LoopbackFactory>,
    coordinator: BatchCoordinator<LoopbackHandle>,
}

fn pipeline() -> Pipeline {
    let registry = Arc::new(MemoryRegistry::new());
    let fast = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(5), 2.0);
    let cache = Arc::new(SchemaCache::new(
        registry.clone(),
        SchemaCacheConfig {
            format: SchemaFormat::Avro,
            registration_policy: fast.clone(),
            retrieval_policy: fast.clone(),
            compatibility_policy: fast,
        },
    ));
    let factory = Arc::new(LoopbackFactory {
        log: Arc::new(TopicLog::default()),
        created: AtomicUsize::new(0),
    });
    let pool = ConnectionPool::new(LoopbackHandle(factory.clone()), PoolConfig::default()).unwrap();
    Pipeline {
        registry,
        factory,
        coordinator: BatchCoordinator::new(pool, cache),
    }
}

#[tokio::test]
async fn test_send_then_receive_round_trips_records() {
    let p = pipeline();
    let token = CancellationToken::new();
    let shape = order_shape();
    let produce_key = PoolKey::producer(["orders"]);
    let consume_key = PoolKey::consumer("billing", ["orders"]);

    let messages = vec![order(1, "ada"), order(2, "grace"), order(3, "edsger")];
    let sent = p
        .coordinator
        .send_batch(&shape, &produce_key, "orders", &messages, &token)
        .await
        .unwrap();
    assert!(sent.all_successful());
    assert_eq!(sent.successful, 3);

    let options = fluxline_client::ReceiveOptions {
        max_batch_size: 10,
        max_wait_time: Duration::from_secs(2),
        poll_timeout: Duration::from_millis(50),
        enable_empty_batches: true,
    };
    let received = p
        .coordinator
        .receive_batch(&shape, &consume_key, &options, &token)
        .await
        .unwrap();

    assert_eq!(received.records.len(), 3);
    assert_eq!(received.skipped, 0);
    for (i, record) in received.records.iter().enumerate() {
        assert_eq!(record.offset, i as u64);
        assert_eq!(
            record.value.get("order_id"),
            Some(&FieldValue::Long((i + 1) as i64))
        );
        // Optional field absent at send time decodes as null.
        assert_eq!(record.value.get("note"), Some(&FieldValue::Null));
        // Key subject decodes to just the key fields.
        let key = record.key.as_ref().unwrap();
        assert_eq!(key.get("order_id"), Some(&FieldValue::Long((i + 1) as i64)));
        assert_eq!(key.get("customer"), None);
    }
}

#[tokio::test]
async fn test_schemas_register_once_across_many_batches() {
    let p = pipeline();
    let token = CancellationToken::new();
    let shape = order_shape();
    let produce_key = PoolKey::producer(["orders"]);

    for i in 0..5 {
        p.coordinator
            .send_batch(&shape, &produce_key, "orders", &[order(i, "ada")], &token)
            .await
            .unwrap();
    }

    // Key and value subjects, one registration each.
    assert_eq!(p.registry.register_calls.load(Ordering::SeqCst), 2);

    let stats = p.coordinator.cache().get_statistics();
    assert_eq!(stats.global.serializations, 10); // value + key per message
    assert!(stats.global.cache_hits > 0);
}

#[tokio::test]
async fn test_pool_reuses_connections_per_role() {
    let p = pipeline();
    let token = CancellationToken::new();
    let shape = order_shape();
    let produce_key = PoolKey::producer(["orders"]);

    for i in 0..4 {
        p.coordinator
            .send_batch(&shape, &produce_key, "orders", &[order(i, "ada")], &token)
            .await
            .unwrap();
    }

    assert_eq!(p.factory.created.load(Ordering::SeqCst), 1);
    let metrics = p.coordinator.pool().metrics(&produce_key);
    assert_eq!(metrics.rents, 4);
    assert_eq!(metrics.returns, 4);
    assert_eq!(metrics.active, 0);
    assert_eq!(metrics.created, 1);
}

#[tokio::test]
async fn test_health_and_diagnostics_snapshot() {
    let p = pipeline();
    let token = CancellationToken::new();
    let shape = order_shape();
    let produce_key = PoolKey::producer(["orders"]);

    p.coordinator
        .send_batch(&shape, &produce_key, "orders", &[order(1, "ada")], &token)
        .await
        .unwrap();

    let health = p.coordinator.pool().get_health();
    assert_eq!(health.status, HealthStatus::Healthy);

    let diagnostics = p.coordinator.pool().get_diagnostics();
    assert_eq!(diagnostics.keys.len(), 1);
    assert!(!diagnostics.shutdown);
    // Snapshot is serializable for external monitoring.
    let json = serde_json::to_string(&diagnostics).unwrap();
    assert!(json.contains("produce"));
}

#[tokio::test]
async fn test_shutdown_is_terminal() {
    let p = pipeline();
    let token = CancellationToken::new();
    let shape = order_shape();
    let produce_key = PoolKey::producer(["orders"]);

    p.coordinator
        .send_batch(&shape, &produce_key, "orders", &[order(1, "ada")], &token)
        .await
        .unwrap();

    p.coordinator.pool().shutdown().await;

    let err = p
        .coordinator
        .send_batch(&shape, &produce_key, "orders", &[order(2, "ada")], &token)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::PoolShutdown));
}
