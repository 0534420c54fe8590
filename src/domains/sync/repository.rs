use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool, Transaction};
use std::collections::HashMap;
use uuid::Uuid;

use crate::domains::sync::types::{
    FieldConflict, QueueItemStatus, QueueStatusResponse, SyncQueueItem, SyncQueueItemRow,
    SyncRecord, SyncRecordRow, SyncRecordStatus, SyncStatsResponse, SyncType,
};
use crate::errors::{DbError, DomainError, DomainResult};

/// Repository for the sync_records ledger
#[async_trait]
pub trait SyncRecordRepository: Send + Sync {
    /// Insert a new ledger row within the caller's transaction.
    ///
    /// A uniqueness violation on (store_id, idempotency_key) surfaces as
    /// `DbError::Conflict` so callers can report it as a duplicate.
    async fn create_with_tx<'t>(
        &self,
        record: &SyncRecord,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()>;

    /// Single indexed lookup used for the idempotency short-circuit
    async fn find_by_key(&self, store_id: Uuid, key: &str) -> DomainResult<Option<SyncRecord>>;

    async fn find_by_keys(&self, store_id: Uuid, keys: &[String]) -> DomainResult<Vec<SyncRecord>>;

    /// conflict -> completed; `conflicts` is retained as audit trail
    async fn mark_resolved_with_tx<'t>(
        &self,
        store_id: Uuid,
        key: &str,
        entity_id: Option<Uuid>,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()>;

    /// Record the outcome of one retry attempt, incrementing retry_count
    async fn record_retry_outcome_with_tx<'t>(
        &self,
        store_id: Uuid,
        key: &str,
        status: SyncRecordStatus,
        entity_id: Option<Uuid>,
        conflicts: Option<&[FieldConflict]>,
        error_message: Option<&str>,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()>;

    /// All failed records matching the filter; the retry bound is applied by
    /// the caller, not here
    async fn find_failed(
        &self,
        store_id: Uuid,
        keys: Option<&[String]>,
        sync_type: Option<SyncType>,
    ) -> DomainResult<Vec<SyncRecord>>;

    /// Ledger summary since a cutoff: counts by status and sync type, plus
    /// average seconds from creation to completion
    async fn get_stats(
        &self,
        store_id: Uuid,
        since: DateTime<Utc>,
    ) -> DomainResult<SyncStatsResponse>;
}

/// Repository for the deferred-processing queue
#[async_trait]
pub trait SyncQueueRepository: Send + Sync {
    async fn enqueue_with_tx<'t>(
        &self,
        item: &SyncQueueItem,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()>;

    /// Atomically claim the next ready item: pending, not scheduled in the
    /// future, highest priority first, FIFO within a tier. The claim is a
    /// compare-and-swap on status so two workers never both take one item.
    async fn claim_next_ready(
        &self,
        store_id: Uuid,
        now: DateTime<Utc>,
    ) -> DomainResult<Option<SyncQueueItem>>;

    async fn mark_completed(&self, id: Uuid) -> DomainResult<()>;

    async fn mark_failed(&self, id: Uuid, error_message: &str) -> DomainResult<()>;

    /// Reset failed items back to pending; returns the number requeued
    async fn requeue_failed(&self, store_id: Uuid, batch_id: Option<&str>) -> DomainResult<u64>;

    async fn status_summary(
        &self,
        store_id: Uuid,
        batch_id: Option<&str>,
    ) -> DomainResult<QueueStatusResponse>;
}

/// SQLite implementation of the SyncRecordRepository
pub struct SqliteSyncRecordRepository {
    pool: SqlitePool,
}

impl SqliteSyncRecordRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn conflicts_to_json(conflicts: Option<&[FieldConflict]>) -> DomainResult<Option<String>> {
    conflicts
        .map(|c| {
            serde_json::to_string(c)
                .map_err(|e| DomainError::Internal(format!("Failed to serialize conflicts: {}", e)))
        })
        .transpose()
}

#[async_trait]
impl SyncRecordRepository for SqliteSyncRecordRepository {
    async fn create_with_tx<'t>(
        &self,
        record: &SyncRecord,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        let conflicts = conflicts_to_json(record.conflicts.as_deref())?;
        let payload = serde_json::to_string(&record.payload)
            .map_err(|e| DomainError::Internal(format!("Failed to serialize payload: {}", e)))?;

        let result = sqlx::query(
            "INSERT INTO sync_records (
                id, store_id, idempotency_key, sync_type, operation, entity_type,
                entity_id, payload, status, conflicts, error_message, retry_count,
                created_at, updated_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.to_string())
        .bind(record.store_id.to_string())
        .bind(&record.idempotency_key)
        .bind(record.sync_type.as_str())
        .bind(record.operation.as_str())
        .bind(&record.entity_type)
        .bind(record.entity_id.map(|id| id.to_string()))
        .bind(payload)
        .bind(record.status.as_str())
        .bind(conflicts)
        .bind(record.error_message.as_deref())
        .bind(record.retry_count)
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .bind(record.completed_at.map(|t| t.to_rfc3339()))
        .execute(&mut **tx)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                let db_err = DbError::from(e);
                if db_err.is_unique_violation() {
                    Err(DomainError::Database(DbError::Conflict(format!(
                        "idempotency key already recorded: {}",
                        record.idempotency_key
                    ))))
                } else {
                    Err(DomainError::Database(db_err))
                }
            }
        }
    }

    async fn find_by_key(&self, store_id: Uuid, key: &str) -> DomainResult<Option<SyncRecord>> {
        let row = sqlx::query_as::<_, SyncRecordRow>(
            "SELECT * FROM sync_records WHERE store_id = ? AND idempotency_key = ?",
        )
        .bind(store_id.to_string())
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?;

        row.map(SyncRecord::try_from).transpose()
    }

    async fn find_by_keys(&self, store_id: Uuid, keys: &[String]) -> DomainResult<Vec<SyncRecord>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::new(
            "SELECT * FROM sync_records WHERE store_id = ",
        );
        builder.push_bind(store_id.to_string());
        builder.push(" AND idempotency_key IN (");
        let mut separated = builder.separated(", ");
        for key in keys {
            separated.push_bind(key);
        }
        separated.push_unseparated(")");

        let rows = builder
            .build_query_as::<SyncRecordRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::from)?;

        rows.into_iter().map(SyncRecord::try_from).collect()
    }

    async fn mark_resolved_with_tx<'t>(
        &self,
        store_id: Uuid,
        key: &str,
        entity_id: Option<Uuid>,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE sync_records
             SET status = 'completed',
                 entity_id = COALESCE(?, entity_id),
                 updated_at = ?,
                 completed_at = ?
             WHERE store_id = ? AND idempotency_key = ? AND status = 'conflict'",
        )
        .bind(entity_id.map(|id| id.to_string()))
        .bind(&now)
        .bind(&now)
        .bind(store_id.to_string())
        .bind(key)
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)?;

        if result.rows_affected() == 0 {
            return Err(DomainError::Database(DbError::NotFound(
                "sync_record in conflict status".to_string(),
                key.to_string(),
            )));
        }
        Ok(())
    }

    async fn record_retry_outcome_with_tx<'t>(
        &self,
        store_id: Uuid,
        key: &str,
        status: SyncRecordStatus,
        entity_id: Option<Uuid>,
        conflicts: Option<&[FieldConflict]>,
        error_message: Option<&str>,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        let now = Utc::now().to_rfc3339();
        let completed_at = match status {
            SyncRecordStatus::Completed => Some(now.clone()),
            _ => None,
        };
        let conflicts = conflicts_to_json(conflicts)?;

        let result = sqlx::query(
            "UPDATE sync_records
             SET status = ?,
                 entity_id = COALESCE(?, entity_id),
                 conflicts = COALESCE(?, conflicts),
                 error_message = ?,
                 retry_count = retry_count + 1,
                 updated_at = ?,
                 completed_at = ?
             WHERE store_id = ? AND idempotency_key = ? AND status = 'failed'",
        )
        .bind(status.as_str())
        .bind(entity_id.map(|id| id.to_string()))
        .bind(conflicts)
        .bind(error_message)
        .bind(&now)
        .bind(completed_at)
        .bind(store_id.to_string())
        .bind(key)
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)?;

        if result.rows_affected() == 0 {
            return Err(DomainError::Database(DbError::NotFound(
                "sync_record in failed status".to_string(),
                key.to_string(),
            )));
        }
        Ok(())
    }

    async fn find_failed(
        &self,
        store_id: Uuid,
        keys: Option<&[String]>,
        sync_type: Option<SyncType>,
    ) -> DomainResult<Vec<SyncRecord>> {
        let mut builder = QueryBuilder::new(
            "SELECT * FROM sync_records WHERE status = 'failed' AND store_id = ",
        );
        builder.push_bind(store_id.to_string());

        if let Some(sync_type) = sync_type {
            builder.push(" AND sync_type = ");
            builder.push_bind(sync_type.as_str());
        }
        if let Some(keys) = keys {
            if keys.is_empty() {
                return Ok(Vec::new());
            }
            builder.push(" AND idempotency_key IN (");
            let mut separated = builder.separated(", ");
            for key in keys {
                separated.push_bind(key);
            }
            separated.push_unseparated(")");
        }
        builder.push(" ORDER BY created_at ASC");

        let rows = builder
            .build_query_as::<SyncRecordRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::from)?;

        rows.into_iter().map(SyncRecord::try_from).collect()
    }

    async fn get_stats(
        &self,
        store_id: Uuid,
        since: DateTime<Utc>,
    ) -> DomainResult<SyncStatsResponse> {
        let since_str = since.to_rfc3339();

        let status_rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM sync_records
             WHERE store_id = ? AND created_at >= ?
             GROUP BY status",
        )
        .bind(store_id.to_string())
        .bind(&since_str)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        let type_rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT sync_type, COUNT(*) FROM sync_records
             WHERE store_id = ? AND created_at >= ?
             GROUP BY sync_type",
        )
        .bind(store_id.to_string())
        .bind(&since_str)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        let avg_processing_seconds: Option<f64> = sqlx::query_scalar(
            "SELECT AVG((julianday(completed_at) - julianday(created_at)) * 86400.0)
             FROM sync_records
             WHERE store_id = ? AND created_at >= ? AND completed_at IS NOT NULL",
        )
        .bind(store_id.to_string())
        .bind(&since_str)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::from)?;

        let by_status: HashMap<String, i64> = status_rows.into_iter().collect();
        let total = by_status.values().sum();

        Ok(SyncStatsResponse {
            period: String::new(), // filled in by the service
            total,
            by_status,
            by_sync_type: type_rows.into_iter().collect(),
            avg_processing_seconds,
        })
    }
}

/// SQLite implementation of the SyncQueueRepository
pub struct SqliteSyncQueueRepository {
    pool: SqlitePool,
}

impl SqliteSyncQueueRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SyncQueueRepository for SqliteSyncQueueRepository {
    async fn enqueue_with_tx<'t>(
        &self,
        item: &SyncQueueItem,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        let data = serde_json::to_string(&item.data)
            .map_err(|e| DomainError::Internal(format!("Failed to serialize queue data: {}", e)))?;

        sqlx::query(
            "INSERT INTO sync_queue (
                id, batch_id, store_id, idempotency_key, sync_type, operation,
                entity_type, entity_id, data, priority, scheduled_at, status,
                error_message, created_at, started_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(item.id.to_string())
        .bind(&item.batch_id)
        .bind(item.store_id.to_string())
        .bind(&item.idempotency_key)
        .bind(item.sync_type.as_str())
        .bind(item.operation.as_str())
        .bind(&item.entity_type)
        .bind(item.entity_id.map(|id| id.to_string()))
        .bind(data)
        .bind(item.priority)
        .bind(item.scheduled_at.map(|t| t.to_rfc3339()))
        .bind(item.status.as_str())
        .bind(item.error_message.as_deref())
        .bind(item.created_at.to_rfc3339())
        .bind(item.started_at.map(|t| t.to_rfc3339()))
        .bind(item.completed_at.map(|t| t.to_rfc3339()))
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)?;

        Ok(())
    }

    async fn claim_next_ready(
        &self,
        store_id: Uuid,
        now: DateTime<Utc>,
    ) -> DomainResult<Option<SyncQueueItem>> {
        // The inner SELECT picks the candidate; the outer UPDATE only wins if
        // the row is still pending, which is the CAS that keeps two workers
        // from claiming the same item.
        let row = sqlx::query_as::<_, SyncQueueItemRow>(
            "UPDATE sync_queue
             SET status = 'processing', started_at = ?
             WHERE id = (
                 SELECT id FROM sync_queue
                 WHERE store_id = ?
                   AND status = 'pending'
                   AND (scheduled_at IS NULL OR scheduled_at <= ?)
                 ORDER BY priority DESC, created_at ASC, id ASC
                 LIMIT 1
             ) AND status = 'pending'
             RETURNING *",
        )
        .bind(now.to_rfc3339())
        .bind(store_id.to_string())
        .bind(now.to_rfc3339())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?;

        row.map(SyncQueueItem::try_from).transpose()
    }

    async fn mark_completed(&self, id: Uuid) -> DomainResult<()> {
        sqlx::query(
            "UPDATE sync_queue SET status = 'completed', completed_at = ?
             WHERE id = ? AND status = 'processing'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error_message: &str) -> DomainResult<()> {
        sqlx::query(
            "UPDATE sync_queue SET status = 'failed', error_message = ?, completed_at = ?
             WHERE id = ? AND status = 'processing'",
        )
        .bind(error_message)
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(())
    }

    async fn requeue_failed(&self, store_id: Uuid, batch_id: Option<&str>) -> DomainResult<u64> {
        let mut builder = QueryBuilder::new(
            "UPDATE sync_queue
             SET status = 'pending', error_message = NULL, started_at = NULL, completed_at = NULL
             WHERE status = 'failed' AND store_id = ",
        );
        builder.push_bind(store_id.to_string());
        if let Some(batch_id) = batch_id {
            builder.push(" AND batch_id = ");
            builder.push_bind(batch_id);
        }

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;

        Ok(result.rows_affected())
    }

    async fn status_summary(
        &self,
        store_id: Uuid,
        batch_id: Option<&str>,
    ) -> DomainResult<QueueStatusResponse> {
        let mut builder = QueryBuilder::new(
            "SELECT status, COUNT(*), MIN(created_at), MAX(created_at)
             FROM sync_queue WHERE store_id = ",
        );
        builder.push_bind(store_id.to_string());
        if let Some(batch_id) = batch_id {
            builder.push(" AND batch_id = ");
            builder.push_bind(batch_id);
        }
        builder.push(" GROUP BY status");

        let rows: Vec<(String, i64, Option<String>, Option<String>)> = builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::from)?;

        let mut by_status: HashMap<String, i64> = HashMap::new();
        for status in [
            QueueItemStatus::Pending,
            QueueItemStatus::Processing,
            QueueItemStatus::Completed,
            QueueItemStatus::Failed,
        ] {
            by_status.insert(status.as_str().to_string(), 0);
        }

        let mut oldest: Option<String> = None;
        let mut newest: Option<String> = None;
        for (status, count, min_created, max_created) in rows {
            by_status.insert(status, count);
            if let Some(min_created) = min_created {
                oldest = match oldest {
                    Some(current) if current <= min_created => Some(current),
                    _ => Some(min_created),
                };
            }
            if let Some(max_created) = max_created {
                newest = match newest {
                    Some(current) if current >= max_created => Some(current),
                    _ => Some(max_created),
                };
            }
        }

        let parse = |s: String| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
        };

        Ok(QueueStatusResponse {
            batch_id: batch_id.map(|s| s.to_string()),
            total: by_status.values().sum(),
            by_status,
            oldest_created_at: oldest.and_then(parse),
            newest_created_at: newest.and_then(parse),
        })
    }
}
