//! MongoDB primary sink and health probe
//!
//! Batches go in as unordered bulk inserts so one rejected document does not
//! sink its siblings. The circuit breaker is consulted before every insert
//! and fed the outcome afterwards; a per-document rejection
//! (`ErrorKind::InsertMany`) counts as success for the batch and for the
//! breaker, because document ids are server-assigned and nothing in the
//! schema should collide under normal operation.
//!
//! Index bootstrap runs on a background task at construction and is retried
//! lazily after the next successful write if it failed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bson::spec::BinarySubtype;
use bson::{doc, Binary, Bson, Document};
use mongodb::error::ErrorKind;
use mongodb::options::{ClientOptions, IndexOptions};
use mongodb::{Client, Collection, IndexModel};
use tracing::{debug, info, warn};

use crate::breaker::CircuitBreaker;
use crate::error::{Result, SiphonError};
use crate::health::HealthProbe;
use crate::sample::{Sample, Value};
use crate::sink::SampleSink;

#[derive(Debug, Clone)]
pub struct MongoSinkConfig {
    pub database: String,
    pub collection: String,
    /// Per-call deadline for the bulk insert
    pub write_timeout: Duration,
    /// Document time-to-live; None disables the expiry index
    pub ttl: Option<Duration>,
}

pub struct MongoSink {
    collection: Collection<Document>,
    breaker: Arc<CircuitBreaker>,
    write_timeout: Duration,
    ttl: Option<Duration>,
    indexes_ready: Arc<AtomicBool>,
    index_task_running: Arc<AtomicBool>,
}

impl MongoSink {
    pub fn new(client: &Client, config: MongoSinkConfig, breaker: Arc<CircuitBreaker>) -> Self {
        let collection = client
            .database(&config.database)
            .collection::<Document>(&config.collection);
        let sink = Self {
            collection,
            breaker,
            write_timeout: config.write_timeout,
            ttl: config.ttl,
            indexes_ready: Arc::new(AtomicBool::new(false)),
            index_task_running: Arc::new(AtomicBool::new(false)),
        };
        sink.schedule_index_bootstrap();
        sink
    }

    /// Spawn the index bootstrap unless it already succeeded or is running.
    fn schedule_index_bootstrap(&self) {
        if self.indexes_ready.load(Ordering::Acquire) {
            return;
        }
        if self
            .index_task_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let collection = self.collection.clone();
        let ttl = self.ttl;
        let ready = Arc::clone(&self.indexes_ready);
        let running = Arc::clone(&self.index_task_running);
        tokio::spawn(async move {
            match Self::create_indexes(&collection, ttl).await {
                Ok(()) => {
                    info!("datapoint indexes ready");
                    ready.store(true, Ordering::Release);
                }
                Err(e) => {
                    warn!(error = %e, "index bootstrap failed, will retry after next write");
                }
            }
            running.store(false, Ordering::Release);
        });
    }

    async fn create_indexes(collection: &Collection<Document>, ttl: Option<Duration>) -> Result<()> {
        let mut models = vec![
            IndexModel::builder()
                .keys(doc! { "nodeId": 1, "sourceTimestamp": -1 })
                .build(),
            IndexModel::builder()
                .keys(doc! { "timestampUtc": -1 })
                .build(),
            IndexModel::builder()
                .keys(doc! { "serverId": 1, "nodeId": 1, "sourceTimestamp": -1 })
                .build(),
            IndexModel::builder()
                .keys(doc! { "serverId": 1, "timestampUtc": -1 })
                .build(),
        ];
        if let Some(ttl) = ttl {
            models.push(
                IndexModel::builder()
                    .keys(doc! { "timestampUtc": 1 })
                    .options(IndexOptions::builder().expire_after(ttl).build())
                    .build(),
            );
        }
        collection.create_indexes(models).await?;
        Ok(())
    }

    /// Map a sample onto the dashboard-visible document schema.
    pub fn to_document(sample: &Sample) -> Document {
        let mut doc = doc! {
            "serverId": &sample.server_id,
            "serverName": &sample.server_name,
            "timestampUtc": bson::DateTime::from_chrono(sample.timestamp_utc),
            "nodeId": &sample.node_id,
            "displayName": &sample.display_name,
            "browsePath": &sample.browse_path,
            "dataType": &sample.data_type,
            "value": Self::encode_value(&sample.value),
            "statusCode": i64::from(sample.status_code),
            "quality": &sample.quality,
        };
        if let Some(ts) = sample.source_timestamp {
            doc.insert("sourceTimestamp", bson::DateTime::from_chrono(ts));
        }
        if let Some(ts) = sample.server_timestamp {
            doc.insert("serverTimestamp", bson::DateTime::from_chrono(ts));
        }
        doc
    }

    /// Polymorphic value encoding: primitives as native BSON, arrays
    /// recursively, uuid as its canonical lowercase string, decimal as
    /// Decimal128 when it parses and a string otherwise.
    fn encode_value(value: &Value) -> Bson {
        match value {
            Value::Null => Bson::Null,
            Value::Bool(b) => Bson::Boolean(*b),
            Value::Int16(i) => Bson::Int32(i32::from(*i)),
            Value::Int32(i) => Bson::Int32(*i),
            Value::Int64(i) => Bson::Int64(*i),
            Value::UInt16(u) => Bson::Int32(i32::from(*u)),
            Value::UInt32(u) => Bson::Int64(i64::from(*u)),
            Value::UInt64(u) => match i64::try_from(*u) {
                Ok(i) => Bson::Int64(i),
                Err(_) => Bson::String(u.to_string()),
            },
            Value::Float(f) => Bson::Double(f64::from(*f)),
            Value::Double(d) => Bson::Double(*d),
            Value::Decimal(s) => match s.parse::<bson::Decimal128>() {
                Ok(d) => Bson::Decimal128(d),
                Err(_) => Bson::String(s.clone()),
            },
            Value::String(s) => Bson::String(s.clone()),
            Value::Bytes(b) => Bson::Binary(Binary {
                subtype: BinarySubtype::Generic,
                bytes: b.clone(),
            }),
            Value::DateTime(ts) => Bson::DateTime(bson::DateTime::from_chrono(*ts)),
            Value::Uuid(u) => Bson::String(u.to_string()),
            Value::Array(items) => Bson::Array(items.iter().map(Self::encode_value).collect()),
        }
    }

    /// Some documents rejected by a per-document constraint, the rest
    /// accepted: counts as success and the rejects are not retried.
    fn is_partial_write(err: &mongodb::error::Error) -> bool {
        matches!(err.kind.as_ref(), ErrorKind::InsertMany(_))
    }
}

#[async_trait]
impl SampleSink for MongoSink {
    fn name(&self) -> &'static str {
        "primary"
    }

    async fn write(&self, batch: &[Sample]) -> Result<()> {
        if !self.breaker.allow() {
            return Err(SiphonError::CircuitOpen);
        }

        let docs: Vec<Document> = batch.iter().map(Self::to_document).collect();
        let insert = self.collection.insert_many(docs).ordered(false);

        match tokio::time::timeout(self.write_timeout, insert).await {
            Ok(Ok(result)) => {
                debug!(inserted = result.inserted_ids.len(), "primary batch accepted");
                self.breaker.record_success();
                self.schedule_index_bootstrap();
                Ok(())
            }
            Ok(Err(e)) if Self::is_partial_write(&e) => {
                warn!(error = %e, batch = batch.len(), "partial bulk insert, rejected documents dropped");
                self.breaker.record_success();
                self.schedule_index_bootstrap();
                Ok(())
            }
            Ok(Err(e)) => {
                self.breaker.record_failure();
                Err(e.into())
            }
            Err(_) => {
                self.breaker.record_failure();
                Err(SiphonError::WriteTimeout(self.write_timeout))
            }
        }
    }
}

/// Dedicated, aggressively-timed connection used only for liveness probes.
pub struct MongoProbe {
    database: mongodb::Database,
}

impl MongoProbe {
    pub async fn connect(uri: &str, database: &str, timeout: Duration) -> Result<Self> {
        let mut options = ClientOptions::parse(uri).await?;
        options.app_name = Some("siphon-health".to_string());
        options.server_selection_timeout = Some(timeout);
        options.connect_timeout = Some(timeout);
        options.max_pool_size = Some(1);
        let client = Client::with_options(options)?;
        Ok(Self {
            database: client.database(database),
        })
    }
}

#[async_trait]
impl HealthProbe for MongoProbe {
    async fn probe(&self) -> Result<()> {
        self.database.run_command(doc! { "ping": 1 }).await?;
        Ok(())
    }
}
