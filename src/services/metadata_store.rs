//! src/services/metadata_store.rs
//!
//! Metadata store for file records. SQLite has no native row expiry, so
//! [`SqliteMetadataStore`] emulates a TTL index: reads only see rows younger
//! than the retention window, and a TTL monitor task deletes the rest.

use crate::{
    clock::Clock,
    models::file_record::{FileRecord, NewFileRecord},
};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::{collections::HashSet, future::Future, sync::Arc, time::Duration};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("a record with store key `{0}` already exists")]
    DuplicateKey(String),
    #[error("metadata store unavailable: {0}")]
    Persistence(#[from] sqlx::Error),
    #[error("metadata store call timed out after {0:?}")]
    Timeout(Duration),
}

pub type MetadataResult<T> = Result<T, MetadataError>;

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert a new record. Fails with [`MetadataError::DuplicateKey`] when a
    /// live record already owns `store_key`.
    async fn insert(&self, record: NewFileRecord) -> MetadataResult<FileRecord>;

    /// Live record for `store_key`, if any.
    async fn find_by_key(&self, store_key: &str) -> MetadataResult<Option<FileRecord>>;

    /// Live record with `id`, if any.
    async fn find_by_id(&self, id: Uuid) -> MetadataResult<Option<FileRecord>>;

    /// The subset of `store_keys` that still have a live record.
    async fn live_keys(&self, store_keys: &[String]) -> MetadataResult<HashSet<String>>;

    /// Cheap connectivity probe.
    async fn ping(&self) -> MetadataResult<()>;
}

/// Bound a metadata store call; an elapsed timer becomes [`MetadataError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> MetadataResult<T>
where
    F: Future<Output = MetadataResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(MetadataError::Timeout(limit)),
    }
}

const RECORD_COLUMNS: &str =
    "id, store_key, original_name, mime_type, size_bytes, public_url, created_at";

/// Schema applied by [`SqliteMetadataStore::migrate`].
const INIT_MIGRATION: &str = include_str!("../../migrations/0001_init.sql");

#[derive(Clone)]
pub struct SqliteMetadataStore {
    /// Shared SQLite connection pool.
    db: Arc<SqlitePool>,
    retention: TimeDelta,
    clock: Arc<dyn Clock>,
}

impl SqliteMetadataStore {
    /// Create a store whose rows expire `retention` after their `created_at`.
    pub fn new(db: Arc<SqlitePool>, retention: Duration, clock: Arc<dyn Clock>) -> Self {
        let retention = TimeDelta::from_std(retention).unwrap_or(TimeDelta::MAX);
        Self {
            db,
            retention,
            clock,
        }
    }

    /// Apply the embedded schema. Statements are idempotent.
    ///
    /// The script goes to SQLite as a whole, so comments and string literals
    /// in it may contain `;`.
    pub async fn migrate(db: &SqlitePool) -> MetadataResult<()> {
        info!("Running schema migration...");
        debug!("Executing migration SQL: {}", INIT_MIGRATION);
        sqlx::raw_sql(INIT_MIGRATION).execute(db).await?;
        Ok(())
    }

    /// Rows created at or before this instant are expired.
    fn cutoff(&self) -> DateTime<Utc> {
        self.clock
            .now()
            .checked_sub_signed(self.retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Delete every expired row. This is the store's TTL mechanism; nothing
    /// else removes records.
    pub async fn purge_expired(&self) -> MetadataResult<u64> {
        let result = sqlx::query("DELETE FROM file_records WHERE created_at <= ?")
            .bind(self.cutoff())
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected())
    }

    /// Run [`purge_expired`](Self::purge_expired) every `every` until `shutdown` fires.
    pub async fn run_ttl_monitor(&self, every: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.purge_expired().await {
                Ok(0) => debug!("ttl monitor: nothing expired"),
                Ok(purged) => info!(purged, "ttl monitor removed expired file records"),
                Err(err) => warn!(error = %err, "ttl monitor pass failed"),
            }
        }
        debug!("ttl monitor stopped");
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn insert(&self, record: NewFileRecord) -> MetadataResult<FileRecord> {
        let id = Uuid::new_v4();
        let mut tx = self.db.begin().await?;

        // An expired row the monitor has not reached yet must not block the key.
        sqlx::query("DELETE FROM file_records WHERE store_key = ? AND created_at <= ?")
            .bind(&record.store_key)
            .bind(self.cutoff())
            .execute(&mut *tx)
            .await?;

        let inserted = sqlx::query(
            "INSERT INTO file_records (
                id, store_key, original_name, mime_type, size_bytes, public_url, created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(&record.store_key)
        .bind(&record.original_name)
        .bind(&record.mime_type)
        .bind(record.size_bytes)
        .bind(&record.public_url)
        .bind(record.created_at)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {
                tx.commit().await?;
                Ok(record.into_record(id))
            }
            Err(err) if is_unique_violation(&err) => {
                Err(MetadataError::DuplicateKey(record.store_key))
            }
            Err(err) => Err(MetadataError::Persistence(err)),
        }
    }

    async fn find_by_key(&self, store_key: &str) -> MetadataResult<Option<FileRecord>> {
        let record = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM file_records WHERE store_key = ? AND created_at > ?"
        ))
        .bind(store_key)
        .bind(self.cutoff())
        .fetch_optional(&*self.db)
        .await?;
        Ok(record)
    }

    async fn find_by_id(&self, id: Uuid) -> MetadataResult<Option<FileRecord>> {
        let record = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM file_records WHERE id = ? AND created_at > ?"
        ))
        .bind(id)
        .bind(self.cutoff())
        .fetch_optional(&*self.db)
        .await?;
        Ok(record)
    }

    async fn live_keys(&self, store_keys: &[String]) -> MetadataResult<HashSet<String>> {
        if store_keys.is_empty() {
            return Ok(HashSet::new());
        }

        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT store_key FROM file_records WHERE created_at > ",
        );
        builder.push_bind(self.cutoff());
        builder.push(" AND store_key IN (");
        let mut separated = builder.separated(", ");
        for key in store_keys {
            separated.push_bind(key);
        }
        separated.push_unseparated(")");

        let rows: Vec<(String,)> = builder.build_query_as().fetch_all(&*self.db).await?;
        Ok(rows.into_iter().map(|(key,)| key).collect())
    }

    async fn ping(&self) -> MetadataResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

/// Single-connection in-memory pool with the schema applied.
#[cfg(test)]
pub async fn memory_pool() -> Arc<SqlitePool> {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    SqliteMetadataStore::migrate(&pool).await.unwrap();
    Arc::new(pool)
}
