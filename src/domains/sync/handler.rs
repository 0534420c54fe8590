use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::{Sqlite, Transaction};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::context::StoreContext;
use crate::domains::sync::conflict::{detect_conflicts, missing_entity_conflict};
use crate::domains::sync::types::{FieldConflict, SyncOperation, SyncPayload, SyncType};
use crate::errors::{DbError, DomainError, DomainResult, SyncError};

/// How an apply call treats the server's current state
#[derive(Debug, Clone)]
pub enum ApplyMode {
    /// Compare the client's expected prior state before applying; divergence
    /// yields a conflict instead of a write
    Checked,
    /// Overwrite the server state with the client payload (use_local)
    Force,
    /// Overlay exactly these fields on the server state (merge resolution)
    Merge(Map<String, Value>),
}

/// Result of applying one operation to the target entity
#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    Applied { entity_id: Uuid },
    Conflict(Vec<FieldConflict>),
}

/// Seam between the sync engine and the domain models it mutates.
///
/// The engine never interprets domain logic itself; each sync type registers
/// one implementation. Conflict comparison and the entity write happen inside
/// the caller's transaction so check-then-apply cannot race with a concurrent
/// sync item touching the same entity.
#[async_trait]
pub trait EntityHandler: Send + Sync {
    /// The sync type this handler applies
    fn sync_type(&self) -> SyncType;

    async fn apply<'t>(
        &self,
        ctx: &StoreContext,
        operation: SyncOperation,
        entity_type: &str,
        entity_id: Option<Uuid>,
        data: &Value,
        mode: &ApplyMode,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<ApplyOutcome>;
}

/// Central registry that dispatches by sync type.
///
/// Adding an entity type is registering one more implementation, not touching
/// the orchestrator.
pub struct HandlerRegistry {
    handlers: HashMap<SyncType, Arc<dyn EntityHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry backed by the generic versioned-JSON handler for every sync
    /// type, enough to run the engine end-to-end without any domain crates.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for sync_type in SyncType::ALL {
            registry.register(Arc::new(VersionedEntityHandler::new(sync_type)));
        }
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn EntityHandler>) {
        self.handlers.insert(handler.sync_type(), handler);
    }

    pub fn get(&self, sync_type: SyncType) -> DomainResult<&Arc<dyn EntityHandler>> {
        self.handlers.get(&sync_type).ok_or_else(|| {
            DomainError::Sync(SyncError::NoHandler(sync_type.as_str().to_string()))
        })
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Generic handler backed by the `entities` table: JSON state per
/// (store, entity_type, id), compared field-by-field on update/delete.
pub struct VersionedEntityHandler {
    sync_type: SyncType,
}

impl VersionedEntityHandler {
    pub fn new(sync_type: SyncType) -> Self {
        Self { sync_type }
    }

    async fn load_current<'t>(
        &self,
        ctx: &StoreContext,
        entity_type: &str,
        entity_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Option<Map<String, Value>>> {
        let row: Option<(String, i64)> = sqlx::query_as(
            "SELECT state, deleted FROM entities
             WHERE store_id = ? AND entity_type = ? AND id = ?",
        )
        .bind(ctx.store_id.to_string())
        .bind(entity_type)
        .bind(entity_id.to_string())
        .fetch_optional(&mut **tx)
        .await
        .map_err(DbError::from)?;

        match row {
            None => Ok(None),
            Some((_, deleted)) if deleted != 0 => Ok(None),
            Some((state, _)) => {
                let value: Value = serde_json::from_str(&state).map_err(|e| {
                    DomainError::Internal(format!(
                        "Corrupt entity state for {} {}: {}",
                        entity_type, entity_id, e
                    ))
                })?;
                match value {
                    Value::Object(map) => Ok(Some(map)),
                    _ => Err(DomainError::Internal(format!(
                        "Entity state for {} {} is not an object",
                        entity_type, entity_id
                    ))),
                }
            }
        }
    }

    async fn write_state<'t>(
        &self,
        ctx: &StoreContext,
        entity_type: &str,
        entity_id: Uuid,
        state: &Map<String, Value>,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        let now = Utc::now().to_rfc3339();
        let state_json = serde_json::to_string(&Value::Object(state.clone()))
            .map_err(|e| DomainError::Internal(format!("Failed to serialize entity state: {}", e)))?;

        sqlx::query(
            "INSERT INTO entities (store_id, entity_type, id, state, deleted, created_at, updated_at)
             VALUES (?, ?, ?, ?, 0, ?, ?)
             ON CONFLICT (store_id, entity_type, id)
             DO UPDATE SET state = excluded.state, deleted = 0, updated_at = excluded.updated_at",
        )
        .bind(ctx.store_id.to_string())
        .bind(entity_type)
        .bind(entity_id.to_string())
        .bind(state_json)
        .bind(&now)
        .bind(&now)
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)?;

        Ok(())
    }

    async fn mark_deleted<'t>(
        &self,
        ctx: &StoreContext,
        entity_type: &str,
        entity_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        sqlx::query(
            "UPDATE entities SET deleted = 1, updated_at = ?
             WHERE store_id = ? AND entity_type = ? AND id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(ctx.store_id.to_string())
        .bind(entity_type)
        .bind(entity_id.to_string())
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)?;

        Ok(())
    }

    fn require_entity_id(entity_id: Option<Uuid>, operation: SyncOperation) -> DomainResult<Uuid> {
        entity_id.ok_or_else(|| {
            DomainError::Validation(crate::errors::ValidationError::invalid_value(
                "entity_id",
                &format!("{} operations require entity_id", operation.as_str()),
            ))
        })
    }
}

#[async_trait]
impl EntityHandler for VersionedEntityHandler {
    fn sync_type(&self) -> SyncType {
        self.sync_type
    }

    async fn apply<'t>(
        &self,
        ctx: &StoreContext,
        operation: SyncOperation,
        entity_type: &str,
        entity_id: Option<Uuid>,
        data: &Value,
        mode: &ApplyMode,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<ApplyOutcome> {
        let payload = SyncPayload::parse(data)?;

        match operation {
            // Creation always proceeds; there is no prior state to diverge from.
            SyncOperation::Create => {
                let id = entity_id.unwrap_or_else(Uuid::new_v4);
                self.write_state(ctx, entity_type, id, &payload.fields, tx).await?;
                Ok(ApplyOutcome::Applied { entity_id: id })
            }
            SyncOperation::Update => {
                let id = Self::require_entity_id(entity_id, operation)?;
                let current = self.load_current(ctx, entity_type, id, tx).await?;

                match mode {
                    ApplyMode::Checked => {
                        let Some(current) = current else {
                            return Ok(ApplyOutcome::Conflict(missing_entity_conflict(
                                entity_type,
                                id,
                            )));
                        };
                        if let Some(expected) = &payload.expected {
                            let conflicts = detect_conflicts(expected, &current);
                            if !conflicts.is_empty() {
                                return Ok(ApplyOutcome::Conflict(conflicts));
                            }
                        }
                        let mut next = current;
                        for (field, value) in &payload.fields {
                            next.insert(field.clone(), value.clone());
                        }
                        self.write_state(ctx, entity_type, id, &next, tx).await?;
                        Ok(ApplyOutcome::Applied { entity_id: id })
                    }
                    // use_local: the terminal operator is authoritative, the
                    // server state is overwritten wholesale (recreating the
                    // entity if it was deleted in the meantime).
                    ApplyMode::Force => {
                        self.write_state(ctx, entity_type, id, &payload.fields, tx).await?;
                        Ok(ApplyOutcome::Applied { entity_id: id })
                    }
                    ApplyMode::Merge(merge_data) => {
                        let mut next = current.ok_or_else(|| {
                            DomainError::EntityNotFound(entity_type.to_string(), id)
                        })?;
                        for (field, value) in merge_data {
                            next.insert(field.clone(), value.clone());
                        }
                        self.write_state(ctx, entity_type, id, &next, tx).await?;
                        Ok(ApplyOutcome::Applied { entity_id: id })
                    }
                }
            }
            SyncOperation::Delete => {
                let id = Self::require_entity_id(entity_id, operation)?;
                let current = self.load_current(ctx, entity_type, id, tx).await?;

                match mode {
                    ApplyMode::Checked => {
                        let Some(current) = current else {
                            return Ok(ApplyOutcome::Conflict(missing_entity_conflict(
                                entity_type,
                                id,
                            )));
                        };
                        if let Some(expected) = &payload.expected {
                            let conflicts = detect_conflicts(expected, &current);
                            if !conflicts.is_empty() {
                                return Ok(ApplyOutcome::Conflict(conflicts));
                            }
                        }
                        self.mark_deleted(ctx, entity_type, id, tx).await?;
                        Ok(ApplyOutcome::Applied { entity_id: id })
                    }
                    ApplyMode::Force => {
                        self.mark_deleted(ctx, entity_type, id, tx).await?;
                        Ok(ApplyOutcome::Applied { entity_id: id })
                    }
                    ApplyMode::Merge(_) => Err(DomainError::Validation(
                        crate::errors::ValidationError::invalid_value(
                            "resolution",
                            "merge resolution is not applicable to delete operations",
                        ),
                    )),
                }
            }
        }
    }
}
