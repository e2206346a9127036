//! Per-candidate reconciliation: a pure `decide` step followed by `apply`.
//!
//! Which fields are compared is configuration ([`ReconcileSpec`]); the engine
//! carries no knowledge of what an asset or ticket looks like.

use crate::automation::models::{Candidate, OutcomeBucket, StoredRecord};
use crate::automation::traits::{RecordPatch, RecordStore};
use crate::models::TenantId;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Number,
    Boolean,
    /// RFC 3339 string; compared as an instant.
    Timestamp,
    #[default]
    Any,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    #[default]
    Exact,
    CaseInsensitive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(default)]
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub comparison: Comparison,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            comparison: Comparison::Exact,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn case_insensitive(mut self) -> Self {
        self.comparison = Comparison::CaseInsensitive;
        self
    }
}

/// The reconciled field set for one entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileSpec {
    pub entity_type: String,
    pub fields: Vec<FieldSpec>,
}

impl ReconcileSpec {
    #[tracing::instrument(level = "debug", skip(fields))]
    pub fn new(entity_type: impl Into<String> + fmt::Debug, fields: Vec<FieldSpec>) -> Result<Self> {
        let spec = Self {
            entity_type: entity_type.into(),
            fields,
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let spec: Self = serde_json::from_str(raw)
            .map_err(|e| Error::InvalidInput(format!("invalid reconcile spec: {e}")))?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<()> {
        if self.entity_type.trim().is_empty() {
            return Err(Error::InvalidInput("entity_type is empty".to_string()));
        }
        if self.fields.is_empty() {
            return Err(Error::InvalidInput(
                "reconcile spec must name at least one field".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for f in &self.fields {
            if f.name.trim().is_empty() {
                return Err(Error::InvalidInput("field name is empty".to_string()));
            }
            if !seen.insert(f.name.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "field '{}' is listed twice",
                    f.name
                )));
            }
            if f.comparison == Comparison::CaseInsensitive
                && !matches!(f.kind, FieldKind::String | FieldKind::Any)
            {
                return Err(Error::InvalidInput(format!(
                    "field '{}': case_insensitive comparison requires a string field",
                    f.name
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemErrorKind {
    /// The candidate itself is malformed.
    Validation,
    /// The store rejected the lookup or write for this candidate.
    Apply,
}

/// Failure confined to one candidate. Counted, never fatal on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub kind: ItemErrorKind,
    pub message: String,
}

impl ItemError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            kind: ItemErrorKind::Validation,
            message: message.into(),
        }
    }

    pub fn apply(message: impl Into<String>) -> Self {
        Self {
            kind: ItemErrorKind::Apply,
            message: message.into(),
        }
    }
}

impl fmt::Display for ItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub from: Value,
    pub to: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Create {
        key: String,
        attributes: Map<String, Value>,
    },
    Update {
        key: String,
        record_id: Uuid,
        expected_version: i64,
        changes: Vec<FieldChange>,
    },
    Skip {
        key: String,
        record_id: Uuid,
    },
    Error {
        key: String,
        error: ItemError,
    },
}

impl Decision {
    pub fn key(&self) -> &str {
        match self {
            Decision::Create { key, .. }
            | Decision::Update { key, .. }
            | Decision::Skip { key, .. }
            | Decision::Error { key, .. } => key,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppliedResult {
    Created { record_id: Uuid },
    Updated { record_id: Uuid, fields: Vec<String> },
    Skipped { record_id: Uuid },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApplyError {
    pub key: String,
    pub error: ItemError,
}

/// Who an apply is performed for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ApplyScope {
    pub tenant_id: Option<TenantId>,
    pub run_id: Uuid,
}

/// Result of reconciling one candidate end to end.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemOutcome {
    pub key: String,
    pub bucket: OutcomeBucket,
    pub error: Option<ItemError>,
    pub changed_fields: Vec<String>,
}

pub struct Reconciler {
    spec: Arc<ReconcileSpec>,
    records: Arc<dyn RecordStore>,
}

impl Reconciler {
    pub fn new(spec: ReconcileSpec, records: Arc<dyn RecordStore>) -> Self {
        Self {
            spec: Arc::new(spec),
            records,
        }
    }

    pub fn spec(&self) -> &ReconcileSpec {
        &self.spec
    }

    /// Check the candidate against the spec and project it onto the reconciled fields.
    ///
    /// Absent optional fields project to `null`.
    pub fn validate(&self, candidate: &Candidate) -> std::result::Result<Map<String, Value>, ItemError> {
        if candidate.key.trim().is_empty() {
            return Err(ItemError::validation("candidate has no natural key"));
        }
        let mut projected = Map::new();
        for field in &self.spec.fields {
            let value = candidate
                .attributes
                .get(&field.name)
                .cloned()
                .unwrap_or(Value::Null);
            if value.is_null() {
                if field.required {
                    return Err(ItemError::validation(format!(
                        "missing required field '{}'",
                        field.name
                    )));
                }
            } else {
                check_kind(field, &value)?;
            }
            projected.insert(field.name.clone(), value);
        }
        Ok(projected)
    }

    /// Pure classification of `candidate` against the current persisted record.
    pub fn decide(&self, candidate: &Candidate, current: Option<&StoredRecord>) -> Decision {
        let key = candidate.key.clone();
        let projected = match self.validate(candidate) {
            Ok(p) => p,
            Err(error) => return Decision::Error { key, error },
        };

        let Some(current) = current else {
            return Decision::Create {
                key,
                attributes: projected,
            };
        };

        let mut changes = Vec::new();
        for field in &self.spec.fields {
            let to = projected.get(&field.name).cloned().unwrap_or(Value::Null);
            let from = current
                .attributes
                .get(&field.name)
                .cloned()
                .unwrap_or(Value::Null);
            if !values_match(field, &from, &to) {
                changes.push(FieldChange {
                    field: field.name.clone(),
                    from,
                    to,
                });
            }
        }

        if changes.is_empty() {
            Decision::Skip {
                key,
                record_id: current.id,
            }
        } else {
            Decision::Update {
                key,
                record_id: current.id,
                expected_version: current.version,
                changes,
            }
        }
    }

    /// Execute a decision against the record store. `Skip` never touches the store.
    #[tracing::instrument(level = "debug", skip(self, decision), fields(key = decision.key()))]
    pub async fn apply(
        &self,
        scope: ApplyScope,
        decision: Decision,
        at: DateTime<Utc>,
    ) -> std::result::Result<AppliedResult, ApplyError> {
        match decision {
            Decision::Create { key, attributes } => {
                let record = StoredRecord {
                    id: Uuid::new_v4(),
                    tenant_id: scope.tenant_id,
                    entity_type: self.spec.entity_type.clone(),
                    key: key.clone(),
                    attributes,
                    version: 1,
                    created_by_run: Some(scope.run_id),
                    updated_by_run: Some(scope.run_id),
                    created_at: at,
                    updated_at: at,
                };
                self.records
                    .insert_record(&record)
                    .await
                    .map_err(|e| apply_error(&key, e))?;
                Ok(AppliedResult::Created {
                    record_id: record.id,
                })
            }
            Decision::Update {
                key,
                record_id,
                expected_version,
                changes,
            } => {
                let fields: Vec<String> = changes.iter().map(|c| c.field.clone()).collect();
                let patch = RecordPatch {
                    record_id,
                    expected_version,
                    changes: changes.into_iter().map(|c| (c.field, c.to)).collect(),
                    run_id: scope.run_id,
                    at,
                };
                self.records
                    .update_record(scope.tenant_id, &patch)
                    .await
                    .map_err(|e| apply_error(&key, e))?;
                Ok(AppliedResult::Updated { record_id, fields })
            }
            Decision::Skip { record_id, .. } => Ok(AppliedResult::Skipped { record_id }),
            Decision::Error { key, error } => Err(ApplyError { key, error }),
        }
    }

    /// Look up, decide and apply one candidate. Never fails; failures land in the outcome.
    pub async fn reconcile(&self, scope: ApplyScope, candidate: &Candidate) -> ItemOutcome {
        let current = match self
            .records
            .get_record(scope.tenant_id, &self.spec.entity_type, &candidate.key)
            .await
        {
            Ok(current) => current,
            Err(e) => {
                return ItemOutcome {
                    key: candidate.key.clone(),
                    bucket: OutcomeBucket::Error,
                    error: Some(ItemError::apply(format!("lookup failed: {e}"))),
                    changed_fields: Vec::new(),
                };
            }
        };

        let decision = self.decide(candidate, current.as_ref());
        if let Decision::Error { key, error } = decision {
            return ItemOutcome {
                key,
                bucket: OutcomeBucket::Error,
                error: Some(error),
                changed_fields: Vec::new(),
            };
        }

        match self.apply(scope, decision, Utc::now()).await {
            Ok(AppliedResult::Created { .. }) => ItemOutcome {
                key: candidate.key.clone(),
                bucket: OutcomeBucket::Created,
                error: None,
                changed_fields: Vec::new(),
            },
            Ok(AppliedResult::Updated { fields, .. }) => ItemOutcome {
                key: candidate.key.clone(),
                bucket: OutcomeBucket::Updated,
                error: None,
                changed_fields: fields,
            },
            Ok(AppliedResult::Skipped { .. }) => ItemOutcome {
                key: candidate.key.clone(),
                bucket: OutcomeBucket::Skipped,
                error: None,
                changed_fields: Vec::new(),
            },
            Err(ApplyError { key, error }) => ItemOutcome {
                key,
                bucket: OutcomeBucket::Error,
                error: Some(error),
                changed_fields: Vec::new(),
            },
        }
    }
}

fn apply_error(key: &str, e: Error) -> ApplyError {
    ApplyError {
        key: key.to_string(),
        error: ItemError::apply(e.to_string()),
    }
}

fn check_kind(field: &FieldSpec, value: &Value) -> std::result::Result<(), ItemError> {
    let ok = match field.kind {
        FieldKind::String => value.is_string(),
        FieldKind::Number => value.is_number(),
        FieldKind::Boolean => value.is_boolean(),
        FieldKind::Timestamp => value.as_str().and_then(parse_timestamp).is_some(),
        FieldKind::Any => true,
    };
    if ok {
        Ok(())
    } else {
        Err(ItemError::validation(format!(
            "field '{}' is not a valid {:?} value",
            field.name, field.kind
        )))
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn values_match(field: &FieldSpec, stored: &Value, candidate: &Value) -> bool {
    match (stored, candidate) {
        (Value::Null, Value::Null) => true,
        (Value::Number(a), Value::Number(b)) => numbers_match(a, b),
        (Value::String(a), Value::String(b)) => match field.kind {
            FieldKind::Timestamp => match (parse_timestamp(a), parse_timestamp(b)) {
                (Some(x), Some(y)) => x == y,
                _ => a == b,
            },
            _ if field.comparison == Comparison::CaseInsensitive => {
                a.to_lowercase() == b.to_lowercase()
            }
            _ => a == b,
        },
        (a, b) => a == b,
    }
}

/// Integers compare exactly; `1` and `1.0` are still equal.
fn numbers_match(a: &serde_json::Number, b: &serde_json::Number) -> bool {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x == y;
    }
    if a.is_f64() || b.is_f64() {
        return match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        };
    }
    // One side negative, the other above i64::MAX.
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use serde_json::json;

    fn spec() -> ReconcileSpec {
        ReconcileSpec::new(
            "asset",
            vec![
                FieldSpec::new("hostname", FieldKind::String)
                    .required()
                    .case_insensitive(),
                FieldSpec::new("cpu_count", FieldKind::Number),
                FieldSpec::new("last_seen", FieldKind::Timestamp),
            ],
        )
        .unwrap()
    }

    fn reconciler() -> Reconciler {
        Reconciler::new(spec(), Arc::new(MemoryStore::new()))
    }

    fn stored(attrs: Value) -> StoredRecord {
        let now = Utc::now();
        StoredRecord {
            id: Uuid::new_v4(),
            tenant_id: None,
            entity_type: "asset".to_string(),
            key: "srv-1".to_string(),
            attributes: attrs.as_object().cloned().unwrap(),
            version: 3,
            created_by_run: None,
            updated_by_run: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn decide_creates_when_no_record_exists() {
        let r = reconciler();
        let c = Candidate::from_json("srv-1", json!({"hostname": "a", "extra": 1}));
        match r.decide(&c, None) {
            Decision::Create { key, attributes } => {
                assert_eq!(key, "srv-1");
                assert!(!attributes.contains_key("extra"));
                assert_eq!(attributes["cpu_count"], Value::Null);
            }
            other => panic!("expected create, got {other:?}"),
        }
    }

    #[test]
    fn decide_skips_equivalent_values() {
        let r = reconciler();
        let current = stored(json!({
            "hostname": "SRV-1",
            "cpu_count": 4.0,
            "last_seen": "2024-05-01T10:00:00Z",
        }));
        let c = Candidate::from_json(
            "srv-1",
            json!({"hostname": "srv-1", "cpu_count": 4, "last_seen": "2024-05-01T12:00:00+02:00"}),
        );
        assert!(matches!(r.decide(&c, Some(&current)), Decision::Skip { .. }));
    }

    #[test]
    fn decide_updates_only_changed_fields() {
        let r = reconciler();
        let current = stored(json!({"hostname": "srv-1", "cpu_count": 4, "last_seen": null}));
        let c = Candidate::from_json("srv-1", json!({"hostname": "srv-1", "cpu_count": 8}));
        match r.decide(&c, Some(&current)) {
            Decision::Update {
                changes,
                expected_version,
                ..
            } => {
                assert_eq!(expected_version, 3);
                assert_eq!(changes.len(), 1);
                assert_eq!(changes[0].field, "cpu_count");
                assert_eq!(changes[0].to, json!(8));
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn large_integers_are_compared_exactly() {
        let r = reconciler();
        let current = stored(json!({"hostname": "srv-1", "cpu_count": 9007199254740992u64}));
        let c = Candidate::from_json(
            "srv-1",
            json!({"hostname": "srv-1", "cpu_count": 9007199254740993u64}),
        );
        match r.decide(&c, Some(&current)) {
            Decision::Update { changes, .. } => {
                assert_eq!(changes.len(), 1);
                assert_eq!(changes[0].to, json!(9007199254740993u64));
            }
            other => panic!("expected update, got {other:?}"),
        }

        let same = Candidate::from_json(
            "srv-1",
            json!({"hostname": "srv-1", "cpu_count": 9007199254740992u64}),
        );
        assert!(matches!(r.decide(&same, Some(&current)), Decision::Skip { .. }));

        let negative = stored(json!({"hostname": "srv-1", "cpu_count": -1}));
        let huge = Candidate::from_json("srv-1", json!({"hostname": "srv-1", "cpu_count": u64::MAX}));
        assert!(matches!(r.decide(&huge, Some(&negative)), Decision::Update { .. }));
    }

    #[test]
    fn decide_flags_malformed_candidates() {
        let r = reconciler();
        let missing_key = Candidate::from_json("  ", json!({"hostname": "a"}));
        let missing_required = Candidate::from_json("k", json!({"cpu_count": 1}));
        let wrong_type = Candidate::from_json("k", json!({"hostname": "a", "cpu_count": "many"}));
        let bad_time = Candidate::from_json("k", json!({"hostname": "a", "last_seen": "yesterday"}));
        for c in [missing_key, missing_required, wrong_type, bad_time] {
            match r.decide(&c, None) {
                Decision::Error { error, .. } => assert_eq!(error.kind, ItemErrorKind::Validation),
                other => panic!("expected error, got {other:?}"),
            }
        }
    }

    #[test]
    fn spec_rejects_duplicate_and_mistyped_fields() {
        assert!(
            ReconcileSpec::new(
                "asset",
                vec![
                    FieldSpec::new("a", FieldKind::String),
                    FieldSpec::new("a", FieldKind::Number),
                ],
            )
            .is_err()
        );
        assert!(
            ReconcileSpec::new("asset", vec![FieldSpec::new("n", FieldKind::Number).case_insensitive()])
                .is_err()
        );
        assert!(ReconcileSpec::new("", vec![FieldSpec::new("a", FieldKind::Any)]).is_err());
    }

    #[test]
    fn spec_loads_from_json() {
        let spec = ReconcileSpec::from_json_str(
            r#"{"entity_type":"ticket","fields":[{"name":"state","kind":"string","required":true}]}"#,
        )
        .unwrap();
        assert_eq!(spec.fields[0].comparison, Comparison::Exact);
        assert!(spec.fields[0].required);
    }

    #[tokio::test]
    async fn reconcile_is_idempotent_against_the_store() {
        let r = reconciler();
        let scope = ApplyScope {
            tenant_id: None,
            run_id: Uuid::new_v4(),
        };
        let c = Candidate::from_json("srv-9", json!({"hostname": "srv-9", "cpu_count": 2}));
        assert_eq!(r.reconcile(scope, &c).await.bucket, OutcomeBucket::Created);
        assert_eq!(r.reconcile(scope, &c).await.bucket, OutcomeBucket::Skipped);

        let changed = Candidate::from_json("srv-9", json!({"hostname": "srv-9", "cpu_count": 4}));
        let outcome = r.reconcile(scope, &changed).await;
        assert_eq!(outcome.bucket, OutcomeBucket::Updated);
        assert_eq!(outcome.changed_fields, vec!["cpu_count".to_string()]);
        assert_eq!(r.reconcile(scope, &changed).await.bucket, OutcomeBucket::Skipped);
    }
}
