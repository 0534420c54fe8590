use rust_decimal::Decimal;
use serde_json::{Map, Value};
use std::str::FromStr;

use crate::errors::{DomainError, DomainResult, ValidationError};
use crate::domains::sync::types::FieldConflict;

/// Compare the client's expected prior state against the server's current
/// state, field by field. Only fields the terminal declares in `expected`
/// participate; which fields a terminal declares is its deployment's
/// configuration, not something the engine hardcodes per entity type.
pub fn detect_conflicts(
    expected: &Map<String, Value>,
    current: &Map<String, Value>,
) -> Vec<FieldConflict> {
    let mut conflicts = Vec::new();
    for (field, client_value) in expected {
        let server_value = current.get(field).cloned().unwrap_or(Value::Null);
        if !values_equal(client_value, &server_value) {
            conflicts.push(FieldConflict {
                field: field.clone(),
                client_value: client_value.clone(),
                server_value,
            });
        }
    }
    conflicts
}

/// Conflict reported when an update/delete targets an entity the server no
/// longer has. The terminal sees its own expectation against a null server side.
pub fn missing_entity_conflict(entity_type: &str, entity_id: uuid::Uuid) -> Vec<FieldConflict> {
    vec![FieldConflict {
        field: "_entity".to_string(),
        client_value: serde_json::json!({
            "entity_type": entity_type,
            "entity_id": entity_id,
        }),
        server_value: Value::Null,
    }]
}

/// Value equality with exact decimal semantics for numeric fields.
///
/// Payloads ultimately affect monetary entities, so `"50000"`, `50000` and
/// `"50000.00"` must compare equal; binary floating point never participates
/// in the comparison when both sides parse as decimals.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (as_decimal(a), as_decimal(b)) {
        (Some(da), Some(db)) => da == db,
        _ => false,
    }
}

fn as_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

/// What the entity handler should do to carry out a resolution strategy
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionPlan {
    /// Force-apply the record's original payload over the server state
    ApplyLocal,
    /// Leave the entity untouched
    KeepServer,
    /// Overlay exactly these fields on the server state
    ApplyMerge(Map<String, Value>),
}

/// Pure decision component: turns a strategy plus the recorded conflict into
/// an executable plan, without touching storage.
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn plan(
        strategy: crate::domains::sync::types::ResolutionStrategy,
        conflicts: &[FieldConflict],
        merge_data: Option<&Map<String, Value>>,
    ) -> DomainResult<ResolutionPlan> {
        use crate::domains::sync::types::ResolutionStrategy::*;
        match strategy {
            UseLocal => Ok(ResolutionPlan::ApplyLocal),
            UseServer => Ok(ResolutionPlan::KeepServer),
            Merge => {
                let merge_data = merge_data.ok_or_else(|| {
                    DomainError::Validation(ValidationError::required("merge_data"))
                })?;
                if merge_data.is_empty() {
                    return Err(DomainError::Validation(ValidationError::invalid_value(
                        "merge_data",
                        "merge_data must not be empty",
                    )));
                }
                // Merge may only touch fields that were part of the declared
                // conflict; everything else stays as the server has it.
                for field in merge_data.keys() {
                    if !conflicts.iter().any(|c| &c.field == field) {
                        return Err(DomainError::Validation(ValidationError::invalid_value(
                            "merge_data",
                            &format!("Field '{}' is not part of the declared conflict", field),
                        )));
                    }
                }
                Ok(ResolutionPlan::ApplyMerge(merge_data.clone()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::sync::types::ResolutionStrategy;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn identical_expected_state_yields_no_conflicts() {
        let expected = map(json!({"total_amount": "100000", "status": "open"}));
        let current = map(json!({"total_amount": "100000", "status": "open", "extra": 1}));
        assert!(detect_conflicts(&expected, &current).is_empty());
    }

    #[test]
    fn overlapping_field_change_is_detected() {
        let expected = map(json!({"total_amount": "90000"}));
        let current = map(json!({"total_amount": "100000"}));
        let conflicts = detect_conflicts(&expected, &current);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].field, "total_amount");
        assert_eq!(conflicts[0].client_value, json!("90000"));
        assert_eq!(conflicts[0].server_value, json!("100000"));
    }

    #[test]
    fn numeric_values_compare_as_exact_decimals() {
        assert!(values_equal(&json!("50000"), &json!("50000.00")));
        assert!(values_equal(&json!(50000), &json!("50000")));
        assert!(!values_equal(&json!("50000.01"), &json!("50000")));
        // Non-numeric strings fall back to plain equality
        assert!(!values_equal(&json!("abc"), &json!("abd")));
    }

    #[test]
    fn missing_server_field_conflicts_against_null() {
        let expected = map(json!({"discount": "5.00"}));
        let current = map(json!({"total_amount": "100000"}));
        let conflicts = detect_conflicts(&expected, &current);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].server_value, Value::Null);
    }

    #[test]
    fn merge_plan_rejects_fields_outside_conflict() {
        let conflicts = vec![FieldConflict {
            field: "total_amount".to_string(),
            client_value: json!("90000"),
            server_value: json!("100000"),
        }];
        let merge = map(json!({"status": "void"}));
        let err = ConflictResolver::plan(ResolutionStrategy::Merge, &conflicts, Some(&merge));
        assert!(err.is_err());

        let merge = map(json!({"total_amount": "95000"}));
        let plan =
            ConflictResolver::plan(ResolutionStrategy::Merge, &conflicts, Some(&merge)).unwrap();
        assert_eq!(plan, ResolutionPlan::ApplyMerge(merge));
    }

    #[test]
    fn merge_plan_requires_merge_data() {
        assert!(ConflictResolver::plan(ResolutionStrategy::Merge, &[], None).is_err());
        assert_eq!(
            ConflictResolver::plan(ResolutionStrategy::UseServer, &[], None).unwrap(),
            ResolutionPlan::KeepServer
        );
    }
}
