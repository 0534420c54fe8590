use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::context::StoreContext;
use crate::domains::sync::conflict::{ConflictResolver, ResolutionPlan};
use crate::domains::sync::handler::{ApplyMode, ApplyOutcome, HandlerRegistry};
use crate::domains::sync::repository::{SyncQueueRepository, SyncRecordRepository};
use crate::domains::sync::types::{
    BatchSyncResponse, ConflictResolutionRequest, ItemOutcome, KeyStatus,
    QueueItemRequest, QueueItemStatus, QueueStatusResponse, QueueSyncResponse, QueuedItemInfo,
    ResolutionOutcome, ResolveConflictsResponse, RetryRequest, RetryResponse, StatsPeriod,
    SyncItem, SyncItemResult, SyncQueueItem, SyncRecord, SyncRecordStatus, SyncStatsResponse,
};
use crate::errors::{DomainError, ServiceError, ServiceResult, SyncError, ValidationError};

/// Default cap on items per batch and per status query.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/// System-wide ceiling on retries. A caller-supplied `max_retries` above this
/// is clamped rather than honored, so no caller can make a record retry
/// forever.
pub const DEFAULT_RETRY_CEILING: u32 = 10;

/// Retries granted when the caller does not say how many it wants.
const DEFAULT_MAX_RETRIES: u32 = 3;

const PRIORITY_MIN: i64 = 0;
const PRIORITY_MAX: i64 = 15;

/// High-level trait for the batch synchronization engine.
#[async_trait]
pub trait SyncService: Send + Sync {
    /// Process one batch of sync items with per-item failure isolation.
    async fn process_batch(
        &self,
        ctx: &StoreContext,
        batch_id: Option<String>,
        items: Vec<SyncItem>,
    ) -> ServiceResult<BatchSyncResponse>;

    /// Process one item, assuming the idempotency check already ran.
    /// `process_batch` performs that check; direct callers must too.
    async fn process_sync(&self, ctx: &StoreContext, item: &SyncItem)
        -> ServiceResult<SyncItemResult>;

    /// Apply resolution strategies to records currently in conflict.
    async fn resolve_conflicts(
        &self,
        ctx: &StoreContext,
        resolutions: Vec<ConflictResolutionRequest>,
    ) -> ServiceResult<ResolveConflictsResponse>;

    /// Re-run failed records through the full sync logic, bounded by retry count.
    async fn retry_failed(
        &self,
        ctx: &StoreContext,
        request: RetryRequest,
    ) -> ServiceResult<RetryResponse>;

    /// Per-key status lookup.
    async fn get_status(
        &self,
        ctx: &StoreContext,
        keys: Vec<String>,
    ) -> ServiceResult<Vec<KeyStatus>>;

    /// Ledger summary over a reporting window.
    async fn get_stats(
        &self,
        ctx: &StoreContext,
        period: StatsPeriod,
    ) -> ServiceResult<SyncStatsResponse>;

    /// Append items to the deferred queue.
    async fn queue_sync(
        &self,
        ctx: &StoreContext,
        batch_id: Option<String>,
        items: Vec<QueueItemRequest>,
    ) -> ServiceResult<QueueSyncResponse>;

    /// Backlog visibility, optionally scoped to one batch.
    async fn get_queue_status(
        &self,
        ctx: &StoreContext,
        batch_id: Option<&str>,
    ) -> ServiceResult<QueueStatusResponse>;

    /// Claim and execute the next ready queue item. Returns None when the
    /// queue has nothing ready. The polling loop around this is the worker's
    /// concern, not the engine's.
    async fn process_next_queued(
        &self,
        ctx: &StoreContext,
    ) -> ServiceResult<Option<SyncItemResult>>;

    /// Operator-triggered reset of failed queue items back to pending.
    async fn requeue_failed(
        &self,
        ctx: &StoreContext,
        batch_id: Option<&str>,
    ) -> ServiceResult<u64>;
}

/// Implementation of the synchronization engine.
pub struct SyncServiceImpl {
    pool: SqlitePool,
    records: Arc<dyn SyncRecordRepository>,
    queue: Arc<dyn SyncQueueRepository>,
    handlers: Arc<HandlerRegistry>,
    max_batch_size: usize,
    retry_ceiling: u32,
}

impl SyncServiceImpl {
    pub fn new(
        pool: SqlitePool,
        records: Arc<dyn SyncRecordRepository>,
        queue: Arc<dyn SyncQueueRepository>,
        handlers: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            pool,
            records,
            queue,
            handlers,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            retry_ceiling: DEFAULT_RETRY_CEILING,
        }
    }

    pub fn with_limits(mut self, max_batch_size: usize, retry_ceiling: u32) -> Self {
        self.max_batch_size = max_batch_size;
        self.retry_ceiling = retry_ceiling;
        self
    }

    fn check_batch_size(&self, len: usize, what: &str) -> Result<(), ServiceError> {
        if len == 0 {
            return Err(ServiceError::Domain(DomainError::Sync(
                SyncError::InvalidBatch(format!("{} must not be empty", what)),
            )));
        }
        if len > self.max_batch_size {
            return Err(ServiceError::Domain(DomainError::Sync(
                SyncError::InvalidBatch(format!(
                    "{} exceeds maximum of {} items (got {})",
                    what, self.max_batch_size, len
                )),
            )));
        }
        Ok(())
    }

    fn new_record(&self, ctx: &StoreContext, item: &SyncItem) -> SyncRecord {
        let now = Utc::now();
        SyncRecord {
            id: Uuid::new_v4(),
            store_id: ctx.store_id,
            idempotency_key: item.idempotency_key.clone(),
            sync_type: item.sync_type,
            operation: item.operation,
            entity_type: item.entity_type.clone(),
            entity_id: item.entity_id,
            payload: item.data.clone(),
            status: SyncRecordStatus::Pending,
            conflicts: None,
            error_message: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Run the handler and write the terminal ledger row in one transaction.
    ///
    /// The entity write (or the conflict comparison that suppressed it) and
    /// the ledger row commit together, so a crash can never record an outcome
    /// that did not happen. On handler failure the transaction rolls back and
    /// a `failed` row is written separately.
    async fn execute_fresh(
        &self,
        ctx: &StoreContext,
        item: &SyncItem,
    ) -> Result<SyncItemResult, DomainError> {
        let handler = self.handlers.get(item.sync_type)?;
        let mut record = self.new_record(ctx, item);

        let mut tx = self.pool.begin().await.map_err(crate::errors::DbError::from)?;
        let applied = handler
            .apply(
                ctx,
                item.operation,
                &item.entity_type,
                item.entity_id,
                &item.data,
                &ApplyMode::Checked,
                &mut tx,
            )
            .await;

        match applied {
            Ok(ApplyOutcome::Applied { entity_id }) => {
                let now = Utc::now();
                record.status = SyncRecordStatus::Completed;
                record.entity_id = Some(entity_id);
                record.completed_at = Some(now);
                record.updated_at = now;
                self.records.create_with_tx(&record, &mut tx).await?;
                tx.commit().await.map_err(crate::errors::DbError::from)?;

                log::debug!(
                    "sync {} {}:{} completed (entity {})",
                    item.operation.as_str(),
                    item.sync_type.as_str(),
                    item.idempotency_key,
                    entity_id
                );
                Ok(SyncItemResult {
                    idempotency_key: item.idempotency_key.clone(),
                    status: ItemOutcome::Completed,
                    entity_id: Some(entity_id),
                    conflicts: None,
                    message: None,
                })
            }
            Ok(ApplyOutcome::Conflict(conflicts)) => {
                // The handler made no entity writes on this path; only the
                // ledger row commits.
                record.status = SyncRecordStatus::Conflict;
                record.conflicts = Some(conflicts.clone());
                record.updated_at = Utc::now();
                self.records.create_with_tx(&record, &mut tx).await?;
                tx.commit().await.map_err(crate::errors::DbError::from)?;

                log::info!(
                    "sync {} {}:{} conflicted on {} field(s)",
                    item.operation.as_str(),
                    item.sync_type.as_str(),
                    item.idempotency_key,
                    conflicts.len()
                );
                Ok(SyncItemResult {
                    idempotency_key: item.idempotency_key.clone(),
                    status: ItemOutcome::Conflict,
                    entity_id: item.entity_id,
                    conflicts: Some(conflicts),
                    message: None,
                })
            }
            Err(e) => {
                // Roll back the entity writes for this item, then record the
                // failure in its own transaction.
                tx.rollback().await.map_err(crate::errors::DbError::from)?;

                let message = e.to_string();
                record.status = SyncRecordStatus::Failed;
                record.error_message = Some(message.clone());
                record.updated_at = Utc::now();

                let mut ledger_tx =
                    self.pool.begin().await.map_err(crate::errors::DbError::from)?;
                self.records.create_with_tx(&record, &mut ledger_tx).await?;
                ledger_tx.commit().await.map_err(crate::errors::DbError::from)?;

                log::warn!(
                    "sync {} {}:{} failed: {}",
                    item.operation.as_str(),
                    item.sync_type.as_str(),
                    item.idempotency_key,
                    message
                );
                Ok(SyncItemResult {
                    idempotency_key: item.idempotency_key.clone(),
                    status: ItemOutcome::Failed,
                    entity_id: None,
                    conflicts: None,
                    message: Some(message),
                })
            }
        }
    }

    fn duplicate_result(record: &SyncRecord) -> SyncItemResult {
        SyncItemResult {
            idempotency_key: record.idempotency_key.clone(),
            status: ItemOutcome::Duplicate,
            entity_id: record.entity_id,
            conflicts: None,
            message: None,
        }
    }

    /// Process one item end to end: idempotency short-circuit, then dispatch.
    /// A uniqueness violation while writing the ledger means a concurrent
    /// submission won the race for this key; that is a duplicate, not an error.
    async fn process_item(
        &self,
        ctx: &StoreContext,
        item: &SyncItem,
    ) -> Result<SyncItemResult, DomainError> {
        if let Some(existing) = self
            .records
            .find_by_key(ctx.store_id, &item.idempotency_key)
            .await?
        {
            return Ok(Self::duplicate_result(&existing));
        }

        match self.execute_fresh(ctx, item).await {
            Ok(result) => Ok(result),
            Err(e) if e.is_duplicate_key() => {
                let existing = self
                    .records
                    .find_by_key(ctx.store_id, &item.idempotency_key)
                    .await?
                    .ok_or_else(|| {
                        DomainError::Internal(format!(
                            "duplicate key reported but no record found: {}",
                            item.idempotency_key
                        ))
                    })?;
                Ok(Self::duplicate_result(&existing))
            }
            Err(e) => Err(e),
        }
    }

    async fn resolve_one(
        &self,
        ctx: &StoreContext,
        resolution: &ConflictResolutionRequest,
    ) -> Result<ResolutionOutcome, DomainError> {
        let key = &resolution.idempotency_key;
        let record = self
            .records
            .find_by_key(ctx.store_id, key)
            .await?
            .ok_or_else(|| DomainError::Sync(SyncError::RecordNotFound(key.clone())))?;

        if record.status != SyncRecordStatus::Conflict {
            return Err(DomainError::Sync(SyncError::InvalidState {
                key: key.clone(),
                expected: SyncRecordStatus::Conflict.as_str().to_string(),
                actual: record.status.as_str().to_string(),
            }));
        }

        let conflicts = record.conflicts.clone().unwrap_or_default();
        let plan = ConflictResolver::plan(
            resolution.resolution,
            &conflicts,
            resolution.merge_data.as_ref(),
        )?;

        let mut tx = self.pool.begin().await.map_err(crate::errors::DbError::from)?;
        let entity_id = match plan {
            ResolutionPlan::KeepServer => record.entity_id,
            ResolutionPlan::ApplyLocal => {
                let handler = self.handlers.get(record.sync_type)?;
                match handler
                    .apply(
                        ctx,
                        record.operation,
                        &record.entity_type,
                        record.entity_id,
                        &record.payload,
                        &ApplyMode::Force,
                        &mut tx,
                    )
                    .await?
                {
                    ApplyOutcome::Applied { entity_id } => Some(entity_id),
                    ApplyOutcome::Conflict(_) => {
                        return Err(DomainError::Internal(
                            "forced apply reported a conflict".to_string(),
                        ))
                    }
                }
            }
            ResolutionPlan::ApplyMerge(merge_data) => {
                let handler = self.handlers.get(record.sync_type)?;
                match handler
                    .apply(
                        ctx,
                        record.operation,
                        &record.entity_type,
                        record.entity_id,
                        &record.payload,
                        &ApplyMode::Merge(merge_data),
                        &mut tx,
                    )
                    .await?
                {
                    ApplyOutcome::Applied { entity_id } => Some(entity_id),
                    ApplyOutcome::Conflict(_) => {
                        return Err(DomainError::Internal(
                            "merge apply reported a conflict".to_string(),
                        ))
                    }
                }
            }
        };

        self.records
            .mark_resolved_with_tx(ctx.store_id, key, entity_id, &mut tx)
            .await?;
        tx.commit().await.map_err(crate::errors::DbError::from)?;

        log::info!("conflict on {} resolved via {:?}", key, resolution.resolution);
        Ok(ResolutionOutcome {
            idempotency_key: key.clone(),
            resolved: true,
            entity_id,
            message: None,
        })
    }

    /// Re-run one failed record through the handler; the outcome replaces the
    /// record's status and bumps retry_count, all in one transaction.
    async fn retry_one(
        &self,
        ctx: &StoreContext,
        record: &SyncRecord,
    ) -> Result<ItemOutcome, DomainError> {
        let handler = self.handlers.get(record.sync_type)?;

        let mut tx = self.pool.begin().await.map_err(crate::errors::DbError::from)?;
        let applied = handler
            .apply(
                ctx,
                record.operation,
                &record.entity_type,
                record.entity_id,
                &record.payload,
                &ApplyMode::Checked,
                &mut tx,
            )
            .await;

        match applied {
            Ok(ApplyOutcome::Applied { entity_id }) => {
                self.records
                    .record_retry_outcome_with_tx(
                        ctx.store_id,
                        &record.idempotency_key,
                        SyncRecordStatus::Completed,
                        Some(entity_id),
                        None,
                        None,
                        &mut tx,
                    )
                    .await?;
                tx.commit().await.map_err(crate::errors::DbError::from)?;
                Ok(ItemOutcome::Completed)
            }
            Ok(ApplyOutcome::Conflict(conflicts)) => {
                self.records
                    .record_retry_outcome_with_tx(
                        ctx.store_id,
                        &record.idempotency_key,
                        SyncRecordStatus::Conflict,
                        None,
                        Some(conflicts.as_slice()),
                        None,
                        &mut tx,
                    )
                    .await?;
                tx.commit().await.map_err(crate::errors::DbError::from)?;
                Ok(ItemOutcome::Conflict)
            }
            Err(e) => {
                tx.rollback().await.map_err(crate::errors::DbError::from)?;

                let mut ledger_tx =
                    self.pool.begin().await.map_err(crate::errors::DbError::from)?;
                self.records
                    .record_retry_outcome_with_tx(
                        ctx.store_id,
                        &record.idempotency_key,
                        SyncRecordStatus::Failed,
                        None,
                        None,
                        Some(&e.to_string()),
                        &mut ledger_tx,
                    )
                    .await?;
                ledger_tx.commit().await.map_err(crate::errors::DbError::from)?;
                Ok(ItemOutcome::Failed)
            }
        }
    }
}

#[async_trait]
impl SyncService for SyncServiceImpl {
    async fn process_batch(
        &self,
        ctx: &StoreContext,
        batch_id: Option<String>,
        items: Vec<SyncItem>,
    ) -> ServiceResult<BatchSyncResponse> {
        self.check_batch_size(items.len(), "batch")?;
        let batch_id = batch_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut results = Vec::with_capacity(items.len());
        let mut processed_count = 0usize;
        let mut conflict_count = 0usize;
        let mut error_count = 0usize;

        for item in &items {
            // Per-item failure boundary: a DomainError here means the ledger
            // itself could not be written, which aborts the batch; everything
            // else became a structured result already.
            let result = self.process_item(ctx, item).await.map_err(ServiceError::Domain)?;
            match result.status {
                ItemOutcome::Completed => processed_count += 1,
                ItemOutcome::Conflict => conflict_count += 1,
                ItemOutcome::Failed => error_count += 1,
                ItemOutcome::Duplicate => {}
            }
            results.push(result);
        }

        log::info!(
            "batch {} for store {}: {} items, {} completed, {} conflicts, {} errors",
            batch_id,
            ctx.store_id,
            items.len(),
            processed_count,
            conflict_count,
            error_count
        );

        Ok(BatchSyncResponse {
            batch_id,
            total_items: items.len(),
            processed_count,
            conflict_count,
            error_count,
            results,
        })
    }

    async fn process_sync(
        &self,
        ctx: &StoreContext,
        item: &SyncItem,
    ) -> ServiceResult<SyncItemResult> {
        self.execute_fresh(ctx, item).await.map_err(ServiceError::Domain)
    }

    async fn resolve_conflicts(
        &self,
        ctx: &StoreContext,
        resolutions: Vec<ConflictResolutionRequest>,
    ) -> ServiceResult<ResolveConflictsResponse> {
        self.check_batch_size(resolutions.len(), "conflicts")?;

        let mut results = Vec::with_capacity(resolutions.len());
        let mut resolved_count = 0usize;

        for resolution in &resolutions {
            match self.resolve_one(ctx, resolution).await {
                Ok(outcome) => {
                    resolved_count += 1;
                    results.push(outcome);
                }
                Err(e) => {
                    log::warn!(
                        "resolution of {} failed: {}",
                        resolution.idempotency_key,
                        e
                    );
                    results.push(ResolutionOutcome {
                        idempotency_key: resolution.idempotency_key.clone(),
                        resolved: false,
                        entity_id: None,
                        message: Some(e.to_string()),
                    });
                }
            }
        }

        Ok(ResolveConflictsResponse {
            resolved_count,
            results,
        })
    }

    async fn retry_failed(
        &self,
        ctx: &StoreContext,
        request: RetryRequest,
    ) -> ServiceResult<RetryResponse> {
        let max_retries = request
            .max_retries
            .unwrap_or(DEFAULT_MAX_RETRIES)
            .min(self.retry_ceiling);

        let failed = self
            .records
            .find_failed(
                ctx.store_id,
                request.idempotency_keys.as_deref(),
                request.sync_type,
            )
            .await
            .map_err(ServiceError::Domain)?;

        let total_failed = failed.len();
        let mut retried_count = 0usize;
        let mut completed_count = 0usize;
        let mut conflict_count = 0usize;
        let mut failed_count = 0usize;

        for record in &failed {
            // Records at or past the bound are rejected from this pass, which
            // the caller sees as total_failed exceeding retried_count.
            if record.retry_count >= max_retries as i64 {
                log::debug!(
                    "skipping retry of {}: retry_count {} >= bound {}",
                    record.idempotency_key,
                    record.retry_count,
                    max_retries
                );
                continue;
            }
            retried_count += 1;
            match self.retry_one(ctx, record).await.map_err(ServiceError::Domain)? {
                ItemOutcome::Completed => completed_count += 1,
                ItemOutcome::Conflict => conflict_count += 1,
                ItemOutcome::Failed => failed_count += 1,
                ItemOutcome::Duplicate => {}
            }
        }

        log::info!(
            "retry pass for store {}: {} failed, {} retried ({} completed, {} conflicts, {} failed again)",
            ctx.store_id,
            total_failed,
            retried_count,
            completed_count,
            conflict_count,
            failed_count
        );

        Ok(RetryResponse {
            total_failed,
            retried_count,
            completed_count,
            conflict_count,
            failed_count,
        })
    }

    async fn get_status(
        &self,
        ctx: &StoreContext,
        keys: Vec<String>,
    ) -> ServiceResult<Vec<KeyStatus>> {
        self.check_batch_size(keys.len(), "idempotency_keys")?;

        let records = self
            .records
            .find_by_keys(ctx.store_id, &keys)
            .await
            .map_err(ServiceError::Domain)?;

        let by_key: std::collections::HashMap<&str, &SyncRecord> = records
            .iter()
            .map(|r| (r.idempotency_key.as_str(), r))
            .collect();

        Ok(keys
            .iter()
            .map(|key| match by_key.get(key.as_str()) {
                Some(record) => KeyStatus {
                    idempotency_key: key.clone(),
                    status: record.status.as_str().to_string(),
                    entity_id: record.entity_id,
                    conflicts: record.conflicts.clone(),
                    error_message: record.error_message.clone(),
                    retry_count: Some(record.retry_count),
                    completed_at: record.completed_at,
                },
                None => KeyStatus::not_found(key),
            })
            .collect())
    }

    async fn get_stats(
        &self,
        ctx: &StoreContext,
        period: StatsPeriod,
    ) -> ServiceResult<SyncStatsResponse> {
        let since = Utc::now() - chrono::Duration::hours(period.hours());
        let mut stats = self
            .records
            .get_stats(ctx.store_id, since)
            .await
            .map_err(ServiceError::Domain)?;
        stats.period = period.as_str().to_string();
        Ok(stats)
    }

    async fn queue_sync(
        &self,
        ctx: &StoreContext,
        batch_id: Option<String>,
        items: Vec<QueueItemRequest>,
    ) -> ServiceResult<QueueSyncResponse> {
        self.check_batch_size(items.len(), "queue batch")?;

        for (index, item) in items.iter().enumerate() {
            if let Some(priority) = item.priority {
                if !(PRIORITY_MIN..=PRIORITY_MAX).contains(&priority) {
                    return Err(ServiceError::Domain(DomainError::Validation(
                        ValidationError::range(
                            &format!("items[{}].priority", index),
                            PRIORITY_MIN,
                            PRIORITY_MAX,
                        ),
                    )));
                }
            }
        }

        let batch_id = batch_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = Utc::now();

        let queue_items: Vec<SyncQueueItem> = items
            .into_iter()
            .map(|item| SyncQueueItem {
                id: Uuid::new_v4(),
                batch_id: batch_id.clone(),
                store_id: ctx.store_id,
                // Server-assigned so deferred execution flows through the
                // same deduplication path as synchronous batches.
                idempotency_key: Uuid::new_v4().to_string(),
                sync_type: item.sync_type,
                operation: item.operation,
                entity_type: item.entity_type,
                entity_id: item.entity_id,
                data: item.data,
                priority: item.priority.unwrap_or(0),
                scheduled_at: item.scheduled_at,
                status: QueueItemStatus::Pending,
                error_message: None,
                created_at: now,
                started_at: None,
                completed_at: None,
            })
            .collect();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ServiceError::Domain(crate::errors::DbError::from(e).into()))?;
        for item in &queue_items {
            self.queue
                .enqueue_with_tx(item, &mut tx)
                .await
                .map_err(ServiceError::Domain)?;
        }
        tx.commit()
            .await
            .map_err(|e| ServiceError::Domain(crate::errors::DbError::from(e).into()))?;

        log::info!(
            "queued {} item(s) in batch {} for store {}",
            queue_items.len(),
            batch_id,
            ctx.store_id
        );

        Ok(QueueSyncResponse {
            batch_id,
            queued_count: queue_items.len(),
            items: queue_items
                .into_iter()
                .map(|item| QueuedItemInfo {
                    id: item.id,
                    idempotency_key: item.idempotency_key,
                    priority: item.priority,
                    scheduled_at: item.scheduled_at,
                })
                .collect(),
        })
    }

    async fn get_queue_status(
        &self,
        ctx: &StoreContext,
        batch_id: Option<&str>,
    ) -> ServiceResult<QueueStatusResponse> {
        self.queue
            .status_summary(ctx.store_id, batch_id)
            .await
            .map_err(ServiceError::Domain)
    }

    async fn process_next_queued(
        &self,
        ctx: &StoreContext,
    ) -> ServiceResult<Option<SyncItemResult>> {
        let Some(item) = self
            .queue
            .claim_next_ready(ctx.store_id, Utc::now())
            .await
            .map_err(ServiceError::Domain)?
        else {
            return Ok(None);
        };

        let sync_item = SyncItem {
            idempotency_key: item.idempotency_key.clone(),
            sync_type: item.sync_type,
            operation: item.operation,
            entity_type: item.entity_type.clone(),
            entity_id: item.entity_id,
            data: item.data.clone(),
            timestamp: None,
        };

        let result = self
            .process_item(ctx, &sync_item)
            .await
            .map_err(ServiceError::Domain)?;

        match result.status {
            ItemOutcome::Failed => {
                let message = result.message.as_deref().unwrap_or("sync failed");
                self.queue
                    .mark_failed(item.id, message)
                    .await
                    .map_err(ServiceError::Domain)?;
            }
            _ => {
                self.queue
                    .mark_completed(item.id)
                    .await
                    .map_err(ServiceError::Domain)?;
            }
        }

        Ok(Some(result))
    }

    async fn requeue_failed(
        &self,
        ctx: &StoreContext,
        batch_id: Option<&str>,
    ) -> ServiceResult<u64> {
        let requeued = self
            .queue
            .requeue_failed(ctx.store_id, batch_id)
            .await
            .map_err(ServiceError::Domain)?;
        if requeued > 0 {
            log::info!("requeued {} failed queue item(s) for store {}", requeued, ctx.store_id);
        }
        Ok(requeued)
    }
}

/// Parse and validate a wire period string (`24h`, `7d`, `30d`).
pub fn parse_period(s: &str) -> Result<StatsPeriod, ServiceError> {
    StatsPeriod::from_str(s).map_err(ServiceError::Domain)
}
