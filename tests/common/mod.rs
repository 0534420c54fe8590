#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use uuid::Uuid;

use pos_sync_core::context::StoreContext;
use pos_sync_core::db_migration;
use pos_sync_core::domains::sync::handler::HandlerRegistry;
use pos_sync_core::domains::sync::repository::{
    SqliteSyncQueueRepository, SqliteSyncRecordRepository,
};
use pos_sync_core::domains::sync::service::SyncServiceImpl;
use pos_sync_core::domains::sync::types::{SyncItem, SyncOperation, SyncType};

/// Fresh in-memory database with the full schema applied.
pub async fn setup_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory pool");
    db_migration::run_migrations(&pool).await.expect("migrations");
    pool
}

pub fn build_service(pool: SqlitePool) -> SyncServiceImpl {
    let records = Arc::new(SqliteSyncRecordRepository::new(pool.clone()));
    let queue = Arc::new(SqliteSyncQueueRepository::new(pool.clone()));
    let handlers = Arc::new(HandlerRegistry::with_defaults());
    SyncServiceImpl::new(pool, records, queue, handlers)
}

pub async fn setup() -> (SqlitePool, SyncServiceImpl, StoreContext) {
    let pool = setup_pool().await;
    let service = build_service(pool.clone());
    let ctx = StoreContext::with_terminal(Uuid::new_v4(), "terminal-1".to_string());
    (pool, service, ctx)
}

pub fn create_item(key: &str, sync_type: SyncType, entity_id: Uuid, fields: Value) -> SyncItem {
    SyncItem {
        idempotency_key: key.to_string(),
        sync_type,
        operation: SyncOperation::Create,
        entity_type: sync_type.as_str().to_string(),
        entity_id: Some(entity_id),
        data: json!({ "fields": fields }),
        timestamp: None,
    }
}

pub fn update_item(
    key: &str,
    sync_type: SyncType,
    entity_id: Option<Uuid>,
    expected: Value,
    fields: Value,
) -> SyncItem {
    SyncItem {
        idempotency_key: key.to_string(),
        sync_type,
        operation: SyncOperation::Update,
        entity_type: sync_type.as_str().to_string(),
        entity_id,
        data: json!({ "expected": expected, "fields": fields }),
        timestamp: None,
    }
}

pub fn delete_item(
    key: &str,
    sync_type: SyncType,
    entity_id: Uuid,
    expected: Option<Value>,
) -> SyncItem {
    let data = match expected {
        Some(expected) => json!({ "expected": expected, "fields": {} }),
        None => json!({ "fields": {} }),
    };
    SyncItem {
        idempotency_key: key.to_string(),
        sync_type,
        operation: SyncOperation::Delete,
        entity_type: sync_type.as_str().to_string(),
        entity_id: Some(entity_id),
        data,
        timestamp: None,
    }
}

/// Read an entity's JSON state straight from storage. Returns None when the
/// row is absent or tombstoned.
pub async fn entity_state(
    pool: &SqlitePool,
    ctx: &StoreContext,
    entity_type: &str,
    entity_id: Uuid,
) -> Option<Value> {
    let row: Option<(String, i64)> = sqlx::query_as(
        "SELECT state, deleted FROM entities WHERE store_id = ? AND entity_type = ? AND id = ?",
    )
    .bind(ctx.store_id.to_string())
    .bind(entity_type)
    .bind(entity_id.to_string())
    .fetch_optional(pool)
    .await
    .expect("entity lookup");

    match row {
        Some((state, 0)) => Some(serde_json::from_str(&state).expect("entity state json")),
        _ => None,
    }
}

pub async fn record_status(pool: &SqlitePool, ctx: &StoreContext, key: &str) -> Option<String> {
    sqlx::query_scalar(
        "SELECT status FROM sync_records WHERE store_id = ? AND idempotency_key = ?",
    )
    .bind(ctx.store_id.to_string())
    .bind(key)
    .fetch_optional(pool)
    .await
    .expect("record lookup")
}
