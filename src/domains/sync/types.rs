use crate::errors::{DomainError, ValidationError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

/// Which entity handler applies a sync item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    Order,
    Inventory,
    Payment,
    Product,
    Member,
    Expense,
}

impl SyncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncType::Order => "order",
            SyncType::Inventory => "inventory",
            SyncType::Payment => "payment",
            SyncType::Product => "product",
            SyncType::Member => "member",
            SyncType::Expense => "expense",
        }
    }

    pub const ALL: [SyncType; 6] = [
        SyncType::Order,
        SyncType::Inventory,
        SyncType::Payment,
        SyncType::Product,
        SyncType::Member,
        SyncType::Expense,
    ];
}

impl FromStr for SyncType {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "order" => Ok(SyncType::Order),
            "inventory" => Ok(SyncType::Inventory),
            "payment" => Ok(SyncType::Payment),
            "product" => Ok(SyncType::Product),
            "member" => Ok(SyncType::Member),
            "expense" => Ok(SyncType::Expense),
            _ => Err(DomainError::Validation(ValidationError::invalid_value(
                "sync_type",
                &format!("Invalid SyncType string: {}", s),
            ))),
        }
    }
}

impl From<SyncType> for String {
    fn from(sync_type: SyncType) -> Self {
        sync_type.as_str().to_string()
    }
}

/// The operation a sync item applies to its target entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

impl SyncOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOperation::Create => "create",
            SyncOperation::Update => "update",
            SyncOperation::Delete => "delete",
        }
    }
}

impl FromStr for SyncOperation {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(SyncOperation::Create),
            "update" => Ok(SyncOperation::Update),
            "delete" => Ok(SyncOperation::Delete),
            _ => Err(DomainError::Validation(ValidationError::invalid_value(
                "operation",
                &format!("Invalid SyncOperation string: {}", s),
            ))),
        }
    }
}

impl From<SyncOperation> for String {
    fn from(op: SyncOperation) -> Self {
        op.as_str().to_string()
    }
}

/// Lifecycle state of a sync record.
///
/// `pending` is transient (set immediately before dispatch). `completed` is
/// terminal: once a key completes it is permanently a duplicate for any later
/// submission. `conflict` leaves only via explicit resolution, `failed` only
/// via bounded retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncRecordStatus {
    Pending,
    Completed,
    Failed,
    Conflict,
}

impl SyncRecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncRecordStatus::Pending => "pending",
            SyncRecordStatus::Completed => "completed",
            SyncRecordStatus::Failed => "failed",
            SyncRecordStatus::Conflict => "conflict",
        }
    }
}

impl FromStr for SyncRecordStatus {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncRecordStatus::Pending),
            "completed" => Ok(SyncRecordStatus::Completed),
            "failed" => Ok(SyncRecordStatus::Failed),
            "conflict" => Ok(SyncRecordStatus::Conflict),
            _ => Err(DomainError::Validation(ValidationError::invalid_value(
                "status",
                &format!("Invalid SyncRecordStatus string: {}", s),
            ))),
        }
    }
}

/// Lifecycle state of a queued item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueItemStatus::Pending => "pending",
            QueueItemStatus::Processing => "processing",
            QueueItemStatus::Completed => "completed",
            QueueItemStatus::Failed => "failed",
        }
    }
}

impl FromStr for QueueItemStatus {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueItemStatus::Pending),
            "processing" => Ok(QueueItemStatus::Processing),
            "completed" => Ok(QueueItemStatus::Completed),
            "failed" => Ok(QueueItemStatus::Failed),
            _ => Err(DomainError::Validation(ValidationError::invalid_value(
                "status",
                &format!("Invalid QueueItemStatus string: {}", s),
            ))),
        }
    }
}

/// How an operator (or automated policy) wants a conflict resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Force-apply the client's originally submitted payload over the server state
    UseLocal,
    /// Keep the server entity as-is; the client's write is acknowledged as superseded
    UseServer,
    /// Apply a caller-supplied field map on top of the server state
    Merge,
}

impl FromStr for ResolutionStrategy {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "use_local" => Ok(ResolutionStrategy::UseLocal),
            "use_server" => Ok(ResolutionStrategy::UseServer),
            "merge" => Ok(ResolutionStrategy::Merge),
            _ => Err(DomainError::Validation(ValidationError::invalid_value(
                "resolution",
                &format!("Invalid ResolutionStrategy string: {}", s),
            ))),
        }
    }
}

/// Reporting window for sync statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsPeriod {
    Day,
    Week,
    Month,
}

impl StatsPeriod {
    pub fn hours(&self) -> i64 {
        match self {
            StatsPeriod::Day => 24,
            StatsPeriod::Week => 24 * 7,
            StatsPeriod::Month => 24 * 30,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatsPeriod::Day => "24h",
            StatsPeriod::Week => "7d",
            StatsPeriod::Month => "30d",
        }
    }
}

impl FromStr for StatsPeriod {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "24h" => Ok(StatsPeriod::Day),
            "7d" => Ok(StatsPeriod::Week),
            "30d" => Ok(StatsPeriod::Month),
            _ => Err(DomainError::Validation(ValidationError::invalid_value(
                "period",
                &format!("Invalid StatsPeriod string: {} (expected 24h, 7d or 30d)", s),
            ))),
        }
    }
}

/// One detected field-level divergence between client intent and server state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConflict {
    pub field: String,
    pub client_value: Value,
    pub server_value: Value,
}

/// Client payload shape: `expected` carries the prior state the terminal last
/// saw (field map, compared field-by-field against the server), `fields` the
/// proposed new values. `create` operations carry only `fields`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<serde_json::Map<String, Value>>,
    #[serde(default)]
    pub fields: serde_json::Map<String, Value>,
}

impl SyncPayload {
    pub fn parse(data: &Value) -> Result<Self, DomainError> {
        // Terminals may send the field map bare instead of wrapped in
        // `fields`. An object with neither envelope key is the new state
        // itself; treating it as an empty update would drop the payload.
        if let Value::Object(map) = data {
            if !map.contains_key("expected") && !map.contains_key("fields") {
                return Ok(Self {
                    expected: None,
                    fields: map.clone(),
                });
            }
        }
        serde_json::from_value(data.clone()).map_err(|e| {
            DomainError::Validation(ValidationError::format(
                "data",
                &format!("Invalid sync payload: {}", e),
            ))
        })
    }
}

/// Durable ledger row for one idempotency-keyed operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRecord {
    pub id: Uuid,
    pub store_id: Uuid,
    pub idempotency_key: String,
    pub sync_type: SyncType,
    pub operation: SyncOperation,
    pub entity_type: String,
    pub entity_id: Option<Uuid>,
    pub payload: Value,
    pub status: SyncRecordStatus,
    pub conflicts: Option<Vec<FieldConflict>>,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Deferred sync operation awaiting worker pickup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncQueueItem {
    pub id: Uuid,
    pub batch_id: String,
    pub store_id: Uuid,
    pub idempotency_key: String,
    pub sync_type: SyncType,
    pub operation: SyncOperation,
    pub entity_type: String,
    pub entity_id: Option<Uuid>,
    pub data: Value,
    pub priority: i64,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub status: QueueItemStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Wire DTOs
// ---------------------------------------------------------------------------

/// One item of a synchronous batch submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncItem {
    pub idempotency_key: String,
    pub sync_type: SyncType,
    pub operation: SyncOperation,
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<Uuid>,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Terminal-visible outcome of one submitted item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemOutcome {
    Completed,
    Duplicate,
    Conflict,
    Failed,
}

/// Per-item result, in input order, so the terminal can reconcile which local
/// operations are safe to discard versus which need attention
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncItemResult {
    pub idempotency_key: String,
    pub status: ItemOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflicts: Option<Vec<FieldConflict>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Aggregated batch response. Duplicates do not count toward any tally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSyncResponse {
    pub batch_id: String,
    pub total_items: usize,
    pub processed_count: usize,
    pub conflict_count: usize,
    pub error_count: usize,
    pub results: Vec<SyncItemResult>,
}

/// Per-key status lookup result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyStatus {
    pub idempotency_key: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflicts: Option<Vec<FieldConflict>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl KeyStatus {
    pub fn not_found(key: &str) -> Self {
        Self {
            idempotency_key: key.to_string(),
            status: "not_found".to_string(),
            entity_id: None,
            conflicts: None,
            error_message: None,
            retry_count: None,
            completed_at: None,
        }
    }
}

/// Summary statistics over the sync ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatsResponse {
    pub period: String,
    pub total: i64,
    pub by_status: HashMap<String, i64>,
    pub by_sync_type: HashMap<String, i64>,
    pub avg_processing_seconds: Option<f64>,
}

/// One conflict-resolution instruction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictResolutionRequest {
    pub idempotency_key: String,
    pub resolution: ResolutionStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_data: Option<serde_json::Map<String, Value>>,
}

/// Per-key outcome of a resolution attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionOutcome {
    pub idempotency_key: String,
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveConflictsResponse {
    pub resolved_count: usize,
    pub results: Vec<ResolutionOutcome>,
}

/// One item of a deferred queue submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItemRequest {
    pub sync_type: SyncType,
    pub operation: SyncOperation,
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<Uuid>,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedItemInfo {
    pub id: Uuid,
    pub idempotency_key: String,
    pub priority: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSyncResponse {
    pub batch_id: String,
    pub queued_count: usize,
    pub items: Vec<QueuedItemInfo>,
}

/// Backlog visibility: per-status counts plus age of the backlog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatusResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    pub total: i64,
    pub by_status: HashMap<String, i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldest_created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub newest_created_at: Option<DateTime<Utc>>,
}

/// Filter for re-submitting failed sync records
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_keys: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_type: Option<SyncType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryResponse {
    pub total_failed: usize,
    pub retried_count: usize,
    pub completed_count: usize,
    pub conflict_count: usize,
    pub failed_count: usize,
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

fn parse_uuid(uuid_str: &str, field_name: &str) -> Result<Uuid, DomainError> {
    Uuid::parse_str(uuid_str).map_err(|_| {
        DomainError::Validation(ValidationError::format(
            field_name,
            &format!("Invalid UUID format: {}", uuid_str),
        ))
    })
}

fn parse_optional_uuid(
    uuid_str: Option<String>,
    field_name: &str,
) -> Result<Option<Uuid>, DomainError> {
    uuid_str.map(|s| parse_uuid(&s, field_name)).transpose()
}

fn parse_datetime(dt_str: &str, field_name: &str) -> Result<DateTime<Utc>, DomainError> {
    DateTime::parse_from_rfc3339(dt_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| {
            DomainError::Validation(ValidationError::format(
                field_name,
                &format!("Invalid RFC3339 format: {}", dt_str),
            ))
        })
}

fn parse_optional_datetime(
    dt_str: Option<String>,
    field_name: &str,
) -> Result<Option<DateTime<Utc>>, DomainError> {
    dt_str.map(|s| parse_datetime(&s, field_name)).transpose()
}

fn parse_json(json_str: &str, field_name: &str) -> Result<Value, DomainError> {
    serde_json::from_str(json_str).map_err(|e| {
        DomainError::Validation(ValidationError::format(
            field_name,
            &format!("Invalid JSON: {}", e),
        ))
    })
}

#[derive(Debug, Clone, FromRow)]
pub struct SyncRecordRow {
    pub id: String,
    pub store_id: String,
    pub idempotency_key: String,
    pub sync_type: String,
    pub operation: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub payload: String,
    pub status: String,
    pub conflicts: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

impl TryFrom<SyncRecordRow> for SyncRecord {
    type Error = DomainError;
    fn try_from(row: SyncRecordRow) -> Result<Self, Self::Error> {
        let conflicts = row
            .conflicts
            .as_deref()
            .map(|json| {
                serde_json::from_str::<Vec<FieldConflict>>(json).map_err(|e| {
                    DomainError::Validation(ValidationError::format(
                        "sync_records.conflicts",
                        &format!("Invalid conflict JSON: {}", e),
                    ))
                })
            })
            .transpose()?;

        Ok(Self {
            id: parse_uuid(&row.id, "sync_records.id")?,
            store_id: parse_uuid(&row.store_id, "sync_records.store_id")?,
            idempotency_key: row.idempotency_key,
            sync_type: SyncType::from_str(&row.sync_type)?,
            operation: SyncOperation::from_str(&row.operation)?,
            entity_type: row.entity_type,
            entity_id: parse_optional_uuid(row.entity_id, "sync_records.entity_id")?,
            payload: parse_json(&row.payload, "sync_records.payload")?,
            status: SyncRecordStatus::from_str(&row.status)?,
            conflicts,
            error_message: row.error_message,
            retry_count: row.retry_count,
            created_at: parse_datetime(&row.created_at, "sync_records.created_at")?,
            updated_at: parse_datetime(&row.updated_at, "sync_records.updated_at")?,
            completed_at: parse_optional_datetime(row.completed_at, "sync_records.completed_at")?,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct SyncQueueItemRow {
    pub id: String,
    pub batch_id: String,
    pub store_id: String,
    pub idempotency_key: String,
    pub sync_type: String,
    pub operation: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub data: String,
    pub priority: i64,
    pub scheduled_at: Option<String>,
    pub status: String,
    pub error_message: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

impl TryFrom<SyncQueueItemRow> for SyncQueueItem {
    type Error = DomainError;
    fn try_from(row: SyncQueueItemRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&row.id, "sync_queue.id")?,
            batch_id: row.batch_id,
            store_id: parse_uuid(&row.store_id, "sync_queue.store_id")?,
            idempotency_key: row.idempotency_key,
            sync_type: SyncType::from_str(&row.sync_type)?,
            operation: SyncOperation::from_str(&row.operation)?,
            entity_type: row.entity_type,
            entity_id: parse_optional_uuid(row.entity_id, "sync_queue.entity_id")?,
            data: parse_json(&row.data, "sync_queue.data")?,
            priority: row.priority,
            scheduled_at: parse_optional_datetime(row.scheduled_at, "sync_queue.scheduled_at")?,
            status: QueueItemStatus::from_str(&row.status)?,
            error_message: row.error_message,
            created_at: parse_datetime(&row.created_at, "sync_queue.created_at")?,
            started_at: parse_optional_datetime(row.started_at, "sync_queue.started_at")?,
            completed_at: parse_optional_datetime(row.completed_at, "sync_queue.completed_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_type_round_trips_through_strings() {
        for t in SyncType::ALL {
            assert_eq!(SyncType::from_str(t.as_str()).unwrap(), t);
        }
        assert!(SyncType::from_str("invoice").is_err());
    }

    #[test]
    fn stats_period_parses_wire_values() {
        assert_eq!(StatsPeriod::from_str("24h").unwrap(), StatsPeriod::Day);
        assert_eq!(StatsPeriod::from_str("7d").unwrap().hours(), 168);
        assert!(StatsPeriod::from_str("1y").is_err());
    }

    #[test]
    fn payload_parses_expected_and_fields() {
        let data = serde_json::json!({
            "expected": {"total_amount": "90000"},
            "fields": {"total_amount": "95000"}
        });
        let payload = SyncPayload::parse(&data).unwrap();
        assert_eq!(
            payload.expected.unwrap().get("total_amount").unwrap(),
            &serde_json::json!("90000")
        );
        assert_eq!(payload.fields.len(), 1);
    }

    #[test]
    fn payload_without_expected_is_valid() {
        let data = serde_json::json!({"fields": {"amount": "50000"}});
        let payload = SyncPayload::parse(&data).unwrap();
        assert!(payload.expected.is_none());
    }

    #[test]
    fn bare_field_map_is_the_fields_payload() {
        let data = serde_json::json!({"amount": "50000", "category": "supplies"});
        let payload = SyncPayload::parse(&data).unwrap();
        assert!(payload.expected.is_none());
        assert_eq!(payload.fields.len(), 2);
        assert_eq!(
            payload.fields.get("amount").unwrap(),
            &serde_json::json!("50000")
        );
    }

    #[test]
    fn wrapped_payload_is_not_mistaken_for_a_bare_map() {
        let data = serde_json::json!({
            "expected": {"amount": "40000"},
            "fields": {"amount": "50000"}
        });
        let payload = SyncPayload::parse(&data).unwrap();
        assert_eq!(payload.fields.len(), 1);
        assert!(payload.expected.is_some());
    }
}
