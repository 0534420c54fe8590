mod common;

use serde_json::json;
use uuid::Uuid;

use common::{create_item, delete_item, entity_state, record_status, setup, update_item};
use pos_sync_core::domains::sync::service::SyncService;
use pos_sync_core::domains::sync::types::{
    ConflictResolutionRequest, ItemOutcome, ResolutionStrategy, RetryRequest, StatsPeriod,
    SyncType,
};

#[tokio::test]
async fn create_writes_entity_and_ledger_row() {
    let (pool, service, ctx) = setup().await;
    let order_id = Uuid::new_v4();

    let response = service
        .process_batch(
            &ctx,
            Some("batch-1".to_string()),
            vec![create_item(
                "key-1",
                SyncType::Order,
                order_id,
                json!({"total_amount": "100000", "status": "open"}),
            )],
        )
        .await
        .unwrap();

    assert_eq!(response.batch_id, "batch-1");
    assert_eq!(response.total_items, 1);
    assert_eq!(response.processed_count, 1);
    assert_eq!(response.results[0].status, ItemOutcome::Completed);
    assert_eq!(response.results[0].entity_id, Some(order_id));

    let state = entity_state(&pool, &ctx, "order", order_id).await.unwrap();
    assert_eq!(state["total_amount"], json!("100000"));
    assert_eq!(
        record_status(&pool, &ctx, "key-1").await.as_deref(),
        Some("completed")
    );
}

#[tokio::test]
async fn create_with_bare_field_map_stores_the_fields() {
    let (pool, service, ctx) = setup().await;
    let expense_id = Uuid::new_v4();

    // No `fields` wrapper: the data object itself is the new state.
    let response = service
        .process_batch(
            &ctx,
            None,
            vec![pos_sync_core::domains::sync::types::SyncItem {
                idempotency_key: "key-bare".to_string(),
                sync_type: SyncType::Expense,
                operation: pos_sync_core::domains::sync::types::SyncOperation::Create,
                entity_type: "expense".to_string(),
                entity_id: Some(expense_id),
                data: json!({"amount": "50000", "category": "supplies"}),
                timestamp: None,
            }],
        )
        .await
        .unwrap();

    assert_eq!(response.results[0].status, ItemOutcome::Completed);
    let state = entity_state(&pool, &ctx, "expense", expense_id).await.unwrap();
    assert_eq!(state["amount"], json!("50000"));
    assert_eq!(state["category"], json!("supplies"));
}

#[tokio::test]
async fn replayed_key_returns_duplicate_without_reapplying() {
    let (pool, service, ctx) = setup().await;
    let order_id = Uuid::new_v4();
    let item = create_item(
        "key-replay",
        SyncType::Order,
        order_id,
        json!({"total_amount": "100000"}),
    );

    service
        .process_batch(&ctx, None, vec![item.clone()])
        .await
        .unwrap();

    // Terminal replays after losing the response. A follow-up update makes
    // the replay distinguishable from a genuine apply.
    service
        .process_batch(
            &ctx,
            None,
            vec![update_item(
                "key-followup",
                SyncType::Order,
                Some(order_id),
                json!({"total_amount": "100000"}),
                json!({"total_amount": "120000"}),
            )],
        )
        .await
        .unwrap();

    let replay = service.process_batch(&ctx, None, vec![item]).await.unwrap();
    assert_eq!(replay.results[0].status, ItemOutcome::Duplicate);
    assert_eq!(replay.results[0].entity_id, Some(order_id));
    assert_eq!(replay.processed_count, 0);

    // Replay must not clobber the later update.
    let state = entity_state(&pool, &ctx, "order", order_id).await.unwrap();
    assert_eq!(state["total_amount"], json!("120000"));
}

#[tokio::test]
async fn divergent_expected_state_yields_conflict_and_no_write() {
    let (pool, service, ctx) = setup().await;
    let order_id = Uuid::new_v4();

    service
        .process_batch(
            &ctx,
            None,
            vec![create_item(
                "key-create",
                SyncType::Order,
                order_id,
                json!({"total_amount": "100000", "status": "open"}),
            )],
        )
        .await
        .unwrap();

    // The terminal last saw 90000 but the server moved on to 100000.
    let response = service
        .process_batch(
            &ctx,
            None,
            vec![update_item(
                "key-conflict",
                SyncType::Order,
                Some(order_id),
                json!({"total_amount": "90000"}),
                json!({"total_amount": "95000"}),
            )],
        )
        .await
        .unwrap();

    assert_eq!(response.conflict_count, 1);
    let result = &response.results[0];
    assert_eq!(result.status, ItemOutcome::Conflict);
    let conflicts = result.conflicts.as_ref().unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].field, "total_amount");
    assert_eq!(conflicts[0].client_value, json!("90000"));
    assert_eq!(conflicts[0].server_value, json!("100000"));

    // Server state untouched; record parked in conflict.
    let state = entity_state(&pool, &ctx, "order", order_id).await.unwrap();
    assert_eq!(state["total_amount"], json!("100000"));
    assert_eq!(
        record_status(&pool, &ctx, "key-conflict").await.as_deref(),
        Some("conflict")
    );
}

#[tokio::test]
async fn update_of_missing_entity_is_a_conflict() {
    let (_pool, service, ctx) = setup().await;

    let response = service
        .process_batch(
            &ctx,
            None,
            vec![update_item(
                "key-ghost",
                SyncType::Inventory,
                Some(Uuid::new_v4()),
                json!({"quantity": 5}),
                json!({"quantity": 3}),
            )],
        )
        .await
        .unwrap();

    assert_eq!(response.results[0].status, ItemOutcome::Conflict);
    let conflicts = response.results[0].conflicts.as_ref().unwrap();
    assert_eq!(conflicts[0].field, "_entity");
}

#[tokio::test]
async fn use_server_resolution_keeps_server_state() {
    let (pool, service, ctx) = setup().await;
    let order_id = Uuid::new_v4();

    service
        .process_batch(
            &ctx,
            None,
            vec![create_item(
                "key-create",
                SyncType::Order,
                order_id,
                json!({"total_amount": "100000"}),
            )],
        )
        .await
        .unwrap();
    service
        .process_batch(
            &ctx,
            None,
            vec![update_item(
                "key-conflict",
                SyncType::Order,
                Some(order_id),
                json!({"total_amount": "90000"}),
                json!({"total_amount": "95000"}),
            )],
        )
        .await
        .unwrap();

    let response = service
        .resolve_conflicts(
            &ctx,
            vec![ConflictResolutionRequest {
                idempotency_key: "key-conflict".to_string(),
                resolution: ResolutionStrategy::UseServer,
                merge_data: None,
            }],
        )
        .await
        .unwrap();

    assert_eq!(response.resolved_count, 1);
    assert!(response.results[0].resolved);

    let state = entity_state(&pool, &ctx, "order", order_id).await.unwrap();
    assert_eq!(state["total_amount"], json!("100000"));
    assert_eq!(
        record_status(&pool, &ctx, "key-conflict").await.as_deref(),
        Some("completed")
    );
}

#[tokio::test]
async fn use_local_resolution_overwrites_server_state() {
    let (pool, service, ctx) = setup().await;
    let order_id = Uuid::new_v4();

    service
        .process_batch(
            &ctx,
            None,
            vec![create_item(
                "key-create",
                SyncType::Order,
                order_id,
                json!({"total_amount": "100000", "status": "open"}),
            )],
        )
        .await
        .unwrap();
    service
        .process_batch(
            &ctx,
            None,
            vec![update_item(
                "key-conflict",
                SyncType::Order,
                Some(order_id),
                json!({"total_amount": "90000"}),
                json!({"total_amount": "95000", "status": "paid"}),
            )],
        )
        .await
        .unwrap();

    let response = service
        .resolve_conflicts(
            &ctx,
            vec![ConflictResolutionRequest {
                idempotency_key: "key-conflict".to_string(),
                resolution: ResolutionStrategy::UseLocal,
                merge_data: None,
            }],
        )
        .await
        .unwrap();
    assert!(response.results[0].resolved);

    let state = entity_state(&pool, &ctx, "order", order_id).await.unwrap();
    assert_eq!(state["total_amount"], json!("95000"));
    assert_eq!(state["status"], json!("paid"));
}

#[tokio::test]
async fn merge_resolution_touches_only_conflicting_fields() {
    let (pool, service, ctx) = setup().await;
    let order_id = Uuid::new_v4();

    service
        .process_batch(
            &ctx,
            None,
            vec![create_item(
                "key-create",
                SyncType::Order,
                order_id,
                json!({"total_amount": "100000", "status": "open"}),
            )],
        )
        .await
        .unwrap();
    service
        .process_batch(
            &ctx,
            None,
            vec![update_item(
                "key-conflict",
                SyncType::Order,
                Some(order_id),
                json!({"total_amount": "90000"}),
                json!({"total_amount": "95000"}),
            )],
        )
        .await
        .unwrap();

    // A field outside the declared conflict is rejected.
    let rejected = service
        .resolve_conflicts(
            &ctx,
            vec![ConflictResolutionRequest {
                idempotency_key: "key-conflict".to_string(),
                resolution: ResolutionStrategy::Merge,
                merge_data: Some(
                    json!({"status": "void"}).as_object().unwrap().clone(),
                ),
            }],
        )
        .await
        .unwrap();
    assert!(!rejected.results[0].resolved);
    assert_eq!(
        record_status(&pool, &ctx, "key-conflict").await.as_deref(),
        Some("conflict")
    );

    let response = service
        .resolve_conflicts(
            &ctx,
            vec![ConflictResolutionRequest {
                idempotency_key: "key-conflict".to_string(),
                resolution: ResolutionStrategy::Merge,
                merge_data: Some(
                    json!({"total_amount": "97000"}).as_object().unwrap().clone(),
                ),
            }],
        )
        .await
        .unwrap();
    assert!(response.results[0].resolved);

    let state = entity_state(&pool, &ctx, "order", order_id).await.unwrap();
    assert_eq!(state["total_amount"], json!("97000"));
    assert_eq!(state["status"], json!("open"));
}

#[tokio::test]
async fn resolving_a_completed_record_is_an_invalid_state() {
    let (_pool, service, ctx) = setup().await;
    let order_id = Uuid::new_v4();

    service
        .process_batch(
            &ctx,
            None,
            vec![create_item(
                "key-done",
                SyncType::Order,
                order_id,
                json!({"total_amount": "100000"}),
            )],
        )
        .await
        .unwrap();

    let response = service
        .resolve_conflicts(
            &ctx,
            vec![ConflictResolutionRequest {
                idempotency_key: "key-done".to_string(),
                resolution: ResolutionStrategy::UseServer,
                merge_data: None,
            }],
        )
        .await
        .unwrap();

    assert_eq!(response.resolved_count, 0);
    assert!(!response.results[0].resolved);
    assert!(response.results[0]
        .message
        .as_ref()
        .unwrap()
        .contains("expected conflict"));
}

#[tokio::test]
async fn batch_isolates_failures_per_item() {
    let (pool, service, ctx) = setup().await;
    let first = Uuid::new_v4();
    let third = Uuid::new_v4();

    let response = service
        .process_batch(
            &ctx,
            None,
            vec![
                create_item("key-a", SyncType::Order, first, json!({"total_amount": "10"})),
                // update without entity_id fails validation inside the handler
                update_item(
                    "key-b",
                    SyncType::Order,
                    None,
                    json!({}),
                    json!({"total_amount": "20"}),
                ),
                create_item("key-c", SyncType::Order, third, json!({"total_amount": "30"})),
            ],
        )
        .await
        .unwrap();

    assert_eq!(response.total_items, 3);
    assert_eq!(response.processed_count, 2);
    assert_eq!(response.error_count, 1);
    assert_eq!(response.results[1].status, ItemOutcome::Failed);
    assert!(response.results[1].message.is_some());

    // The failure left its neighbors applied and its own ledger row failed.
    assert!(entity_state(&pool, &ctx, "order", first).await.is_some());
    assert!(entity_state(&pool, &ctx, "order", third).await.is_some());
    assert_eq!(
        record_status(&pool, &ctx, "key-b").await.as_deref(),
        Some("failed")
    );
}

#[tokio::test]
async fn empty_batch_is_rejected() {
    let (_pool, service, ctx) = setup().await;
    let err = service.process_batch(&ctx, None, vec![]).await.unwrap_err();
    assert!(err.to_string().contains("must not be empty"));
}

#[tokio::test]
async fn delete_with_matching_expectation_tombstones_entity() {
    let (pool, service, ctx) = setup().await;
    let product_id = Uuid::new_v4();

    service
        .process_batch(
            &ctx,
            None,
            vec![create_item(
                "key-create",
                SyncType::Product,
                product_id,
                json!({"name": "espresso", "price": "4.50"}),
            )],
        )
        .await
        .unwrap();

    let response = service
        .process_batch(
            &ctx,
            None,
            vec![delete_item(
                "key-delete",
                SyncType::Product,
                product_id,
                Some(json!({"price": "4.50"})),
            )],
        )
        .await
        .unwrap();

    assert_eq!(response.results[0].status, ItemOutcome::Completed);
    assert!(entity_state(&pool, &ctx, "product", product_id).await.is_none());
}

#[tokio::test]
async fn status_lookup_reports_unknown_keys_as_not_found() {
    let (_pool, service, ctx) = setup().await;
    let order_id = Uuid::new_v4();

    service
        .process_batch(
            &ctx,
            None,
            vec![create_item(
                "key-known",
                SyncType::Order,
                order_id,
                json!({"total_amount": "10"}),
            )],
        )
        .await
        .unwrap();

    let statuses = service
        .get_status(
            &ctx,
            vec!["key-known".to_string(), "key-unknown".to_string()],
        )
        .await
        .unwrap();

    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses[0].status, "completed");
    assert_eq!(statuses[0].entity_id, Some(order_id));
    assert_eq!(statuses[1].status, "not_found");
}

#[tokio::test]
async fn stores_do_not_see_each_others_records() {
    let (_pool, service, ctx) = setup().await;
    let other_store = pos_sync_core::StoreContext::new(Uuid::new_v4());

    service
        .process_batch(
            &ctx,
            None,
            vec![create_item(
                "key-shared",
                SyncType::Order,
                Uuid::new_v4(),
                json!({"total_amount": "10"}),
            )],
        )
        .await
        .unwrap();

    // Same idempotency key from a different store is a fresh submission.
    let response = service
        .process_batch(
            &other_store,
            None,
            vec![create_item(
                "key-shared",
                SyncType::Order,
                Uuid::new_v4(),
                json!({"total_amount": "99"}),
            )],
        )
        .await
        .unwrap();
    assert_eq!(response.results[0].status, ItemOutcome::Completed);

    let statuses = service
        .get_status(&other_store, vec!["key-shared".to_string()])
        .await
        .unwrap();
    assert_eq!(statuses[0].status, "completed");
}

#[tokio::test]
async fn retry_reruns_failed_records_up_to_the_bound() {
    let (pool, service, ctx) = setup().await;

    // Fails because entity_id is missing; retries can never fix it.
    service
        .process_batch(
            &ctx,
            None,
            vec![update_item(
                "key-fail",
                SyncType::Payment,
                None,
                json!({}),
                json!({"amount": "5"}),
            )],
        )
        .await
        .unwrap();

    let first = service
        .retry_failed(&ctx, RetryRequest {
            idempotency_keys: None,
            sync_type: None,
            max_retries: Some(2),
        })
        .await
        .unwrap();
    assert_eq!(first.total_failed, 1);
    assert_eq!(first.retried_count, 1);
    assert_eq!(first.failed_count, 1);

    let retry_count: i64 = sqlx::query_scalar(
        "SELECT retry_count FROM sync_records WHERE store_id = ? AND idempotency_key = ?",
    )
    .bind(ctx.store_id.to_string())
    .bind("key-fail")
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(retry_count, 1);

    // Second pass with bound 1: the record already used its one attempt.
    let second = service
        .retry_failed(&ctx, RetryRequest {
            idempotency_keys: None,
            sync_type: None,
            max_retries: Some(1),
        })
        .await
        .unwrap();
    assert_eq!(second.total_failed, 1);
    assert_eq!(second.retried_count, 0);
}

#[tokio::test]
async fn retry_with_key_filter_targets_only_named_records() {
    let (pool, service, ctx) = setup().await;

    service
        .process_batch(
            &ctx,
            None,
            vec![pos_sync_core::domains::sync::types::SyncItem {
                idempotency_key: "key-recover".to_string(),
                sync_type: SyncType::Member,
                operation: pos_sync_core::domains::sync::types::SyncOperation::Update,
                entity_type: "member".to_string(),
                entity_id: None,
                data: json!({"fields": {"points": 10}}),
                timestamp: None,
            }],
        )
        .await
        .unwrap();
    assert_eq!(
        record_status(&pool, &ctx, "key-recover").await.as_deref(),
        Some("failed")
    );

    // The record is immutable; a missing entity_id can never recover, so the
    // retry outcome stays failed and the count keeps climbing.
    let result = service
        .retry_failed(&ctx, RetryRequest {
            idempotency_keys: Some(vec!["key-recover".to_string()]),
            sync_type: None,
            max_retries: None,
        })
        .await
        .unwrap();
    assert_eq!(result.retried_count, 1);
    assert_eq!(result.failed_count, 1);

    // Unrelated store-scoped filter: key filter for another key retries nothing.
    let other = service
        .retry_failed(&ctx, RetryRequest {
            idempotency_keys: Some(vec!["key-other".to_string()]),
            sync_type: None,
            max_retries: None,
        })
        .await
        .unwrap();
    assert_eq!(other.total_failed, 0);
}

#[tokio::test]
async fn stats_aggregate_by_status_and_type() {
    let (_pool, service, ctx) = setup().await;
    let order_id = Uuid::new_v4();

    service
        .process_batch(
            &ctx,
            None,
            vec![
                create_item("key-1", SyncType::Order, order_id, json!({"total_amount": "10"})),
                create_item(
                    "key-2",
                    SyncType::Inventory,
                    Uuid::new_v4(),
                    json!({"quantity": 3}),
                ),
                update_item(
                    "key-3",
                    SyncType::Order,
                    Some(order_id),
                    json!({"total_amount": "999"}),
                    json!({"total_amount": "11"}),
                ),
            ],
        )
        .await
        .unwrap();

    let stats = service.get_stats(&ctx, StatsPeriod::Day).await.unwrap();
    assert_eq!(stats.period, "24h");
    assert_eq!(stats.total, 3);
    assert_eq!(stats.by_status.get("completed"), Some(&2));
    assert_eq!(stats.by_status.get("conflict"), Some(&1));
    assert_eq!(stats.by_sync_type.get("order"), Some(&2));
    assert_eq!(stats.by_sync_type.get("inventory"), Some(&1));
    assert!(stats.avg_processing_seconds.is_some());
}

/// Ledger repository that pretends one key is absent on the first lookup,
/// reproducing the window where a concurrent submission commits the row
/// between the idempotency check and the insert.
mod racing {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use sqlx::{Sqlite, SqlitePool, Transaction};
    use uuid::Uuid;

    use pos_sync_core::domains::sync::repository::{
        SqliteSyncRecordRepository, SyncRecordRepository,
    };
    use pos_sync_core::domains::sync::types::{
        FieldConflict, SyncRecord, SyncRecordStatus, SyncStatsResponse, SyncType,
    };
    use pos_sync_core::errors::DomainResult;

    pub struct RacingRecordRepository {
        inner: SqliteSyncRecordRepository,
        hidden_key: String,
        hide_once: AtomicBool,
    }

    impl RacingRecordRepository {
        pub fn new(pool: SqlitePool, hidden_key: &str) -> Arc<Self> {
            Arc::new(Self {
                inner: SqliteSyncRecordRepository::new(pool),
                hidden_key: hidden_key.to_string(),
                hide_once: AtomicBool::new(true),
            })
        }
    }

    #[async_trait]
    impl SyncRecordRepository for RacingRecordRepository {
        async fn create_with_tx<'t>(
            &self,
            record: &SyncRecord,
            tx: &mut Transaction<'t, Sqlite>,
        ) -> DomainResult<()> {
            self.inner.create_with_tx(record, tx).await
        }

        async fn find_by_key(
            &self,
            store_id: Uuid,
            key: &str,
        ) -> DomainResult<Option<SyncRecord>> {
            if key == self.hidden_key && self.hide_once.swap(false, Ordering::SeqCst) {
                return Ok(None);
            }
            self.inner.find_by_key(store_id, key).await
        }

        async fn find_by_keys(
            &self,
            store_id: Uuid,
            keys: &[String],
        ) -> DomainResult<Vec<SyncRecord>> {
            self.inner.find_by_keys(store_id, keys).await
        }

        async fn mark_resolved_with_tx<'t>(
            &self,
            store_id: Uuid,
            key: &str,
            entity_id: Option<Uuid>,
            tx: &mut Transaction<'t, Sqlite>,
        ) -> DomainResult<()> {
            self.inner.mark_resolved_with_tx(store_id, key, entity_id, tx).await
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
            self.inner
                .record_retry_outcome_with_tx(
                    store_id,
                    key,
                    status,
                    entity_id,
                    conflicts,
                    error_message,
                    tx,
                )
                .await
        }

        async fn find_failed(
            &self,
            store_id: Uuid,
            keys: Option<&[String]>,
            sync_type: Option<SyncType>,
        ) -> DomainResult<Vec<SyncRecord>> {
            self.inner.find_failed(store_id, keys, sync_type).await
        }

        async fn get_stats(
            &self,
            store_id: Uuid,
            since: DateTime<Utc>,
        ) -> DomainResult<SyncStatsResponse> {
            self.inner.get_stats(store_id, since).await
        }
    }
}

#[tokio::test]
async fn losing_the_insert_race_reports_duplicate() {
    use std::sync::Arc;

    use chrono::Utc;
    use pos_sync_core::domains::sync::handler::HandlerRegistry;
    use pos_sync_core::domains::sync::repository::{
        SqliteSyncQueueRepository, SqliteSyncRecordRepository, SyncRecordRepository,
    };
    use pos_sync_core::domains::sync::service::SyncServiceImpl;
    use pos_sync_core::domains::sync::types::{SyncOperation, SyncRecord, SyncRecordStatus};

    let pool = common::setup_pool().await;
    let ctx = pos_sync_core::StoreContext::new(Uuid::new_v4());
    let order_id = Uuid::new_v4();

    // The winning submission's row is already committed when ours runs.
    let now = Utc::now();
    let winner = SyncRecord {
        id: Uuid::new_v4(),
        store_id: ctx.store_id,
        idempotency_key: "key-raced".to_string(),
        sync_type: SyncType::Order,
        operation: SyncOperation::Create,
        entity_type: "order".to_string(),
        entity_id: Some(order_id),
        payload: json!({"fields": {"total_amount": "100000"}}),
        status: SyncRecordStatus::Completed,
        conflicts: None,
        error_message: None,
        retry_count: 0,
        created_at: now,
        updated_at: now,
        completed_at: Some(now),
    };
    let writer = SqliteSyncRecordRepository::new(pool.clone());
    let mut tx = pool.begin().await.unwrap();
    writer.create_with_tx(&winner, &mut tx).await.unwrap();
    tx.commit().await.unwrap();

    let records = racing::RacingRecordRepository::new(pool.clone(), "key-raced");
    let queue = Arc::new(SqliteSyncQueueRepository::new(pool.clone()));
    let handlers = Arc::new(HandlerRegistry::with_defaults());
    let service = SyncServiceImpl::new(pool.clone(), records, queue, handlers);

    // The idempotency check misses (the race window), the insert hits the
    // UNIQUE index, and the outcome must still be a duplicate, not an error.
    let item = create_item(
        "key-raced",
        SyncType::Order,
        order_id,
        json!({"total_amount": "100000"}),
    );
    let response = service.process_batch(&ctx, None, vec![item]).await.unwrap();
    assert_eq!(response.results[0].status, ItemOutcome::Duplicate);
    assert_eq!(response.results[0].entity_id, Some(order_id));
    assert_eq!(response.error_count, 0);
}
