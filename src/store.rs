use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{Aggregates, PeriodAggregate};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Snapshot payload could not be encoded or decoded: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Opaque save/load of aggregate snapshots keyed by a caller-chosen stamp,
/// such as an import date or a data version.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Stores `aggregates` under `stamp`, replacing any previous snapshot.
    async fn put(&self, stamp: &str, aggregates: &Aggregates) -> Result<(), StoreError>;

    async fn get(&self, stamp: &str) -> Result<Option<Aggregates>, StoreError>;
}

fn to_payload(aggregates: &Aggregates) -> Vec<PeriodAggregate> {
    aggregates.values().cloned().collect()
}

fn from_payload(payload: Vec<PeriodAggregate>) -> Aggregates {
    payload
        .into_iter()
        .map(|aggregate| (aggregate.key.clone(), aggregate))
        .collect()
}

/// In-process store, mainly for tests and one-shot CLI runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshots: RwLock<HashMap<String, Aggregates>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn put(&self, stamp: &str, aggregates: &Aggregates) -> Result<(), StoreError> {
        self.snapshots
            .write()
            .await
            .insert(stamp.to_string(), aggregates.clone());
        Ok(())
    }

    async fn get(&self, stamp: &str) -> Result<Option<Aggregates>, StoreError> {
        Ok(self.snapshots.read().await.get(stamp).cloned())
    }
}

/// Postgres-backed store: one JSONB row per stamp.
#[derive(Debug, Clone)]
pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn put(&self, stamp: &str, aggregates: &Aggregates) -> Result<(), StoreError> {
        let payload = to_payload(aggregates);
        let bucket_count = i32::try_from(payload.len()).unwrap_or(i32::MAX);

        sqlx::query(
            r#"
            INSERT INTO surgical_ops.aggregate_snapshots (id, stamp, bucket_count, payload)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (stamp) DO UPDATE
            SET bucket_count = EXCLUDED.bucket_count,
                payload = EXCLUDED.payload,
                updated_at = NOW()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(stamp)
        .bind(bucket_count)
        .bind(Json(payload))
        .execute(&self.pool)
        .await?;

        tracing::info!(stamp, buckets = bucket_count, "stored aggregate snapshot");
        Ok(())
    }

    async fn get(&self, stamp: &str) -> Result<Option<Aggregates>, StoreError> {
        let row = sqlx::query("SELECT payload FROM surgical_ops.aggregate_snapshots WHERE stamp = $1")
            .bind(stamp)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let payload: serde_json::Value = row.try_get("payload")?;
        let payload: Vec<PeriodAggregate> = serde_json::from_value(payload)?;
        Ok(Some(from_payload(payload)))
    }
}
