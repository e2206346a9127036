//! Assembly of the open `details` document written on terminal transitions.

use crate::automation::models::{OutcomeBucket, RunTrigger, SourceCursor};
use crate::automation::reconciler::ItemOutcome;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;
use std::time::Duration;

/// Why a run ended `failed`. Written as `details.reason`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    SourceUnavailable,
    SourceFailed,
    StoreUnavailable,
    ApplyFailureThreshold,
    Cancelled,
    Timeout,
    Stale,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::SourceUnavailable => "source_unavailable",
            FailureReason::SourceFailed => "source_failed",
            FailureReason::StoreUnavailable => "store_unavailable",
            FailureReason::ApplyFailureThreshold => "apply_failure_threshold",
            FailureReason::Cancelled => "cancelled",
            FailureReason::Timeout => "timeout",
            FailureReason::Stale => "stale",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunFailure {
    pub reason: FailureReason,
    pub error: Option<String>,
}

impl RunFailure {
    pub fn new(reason: FailureReason, error: impl Into<String>) -> Self {
        Self {
            reason,
            error: Some(error.into()),
        }
    }

    pub fn bare(reason: FailureReason) -> Self {
        Self {
            reason,
            error: None,
        }
    }

    /// Details for a run finalized by someone other than its executor.
    pub fn into_details(self) -> Value {
        let mut out = Map::new();
        out.insert("reason".to_string(), json!(self.reason));
        if let Some(e) = self.error {
            out.insert("error".to_string(), Value::String(e));
        }
        Value::Object(out)
    }
}

/// Accumulates per-item diagnostics during a run.
#[derive(Debug, Clone)]
pub struct DetailsBuilder {
    max_errors: usize,
    errors: Vec<Value>,
    errors_truncated: u64,
    updated_fields: Map<String, Value>,
    cursor: Option<SourceCursor>,
    source: Option<Value>,
}

impl DetailsBuilder {
    pub fn new(max_errors: usize) -> Self {
        Self {
            max_errors,
            errors: Vec::new(),
            errors_truncated: 0,
            updated_fields: Map::new(),
            cursor: None,
            source: None,
        }
    }

    pub fn record(&mut self, outcome: &ItemOutcome) {
        match outcome.bucket {
            OutcomeBucket::Error => {
                if self.errors.len() < self.max_errors {
                    let (kind, message) = match &outcome.error {
                        Some(e) => (json!(e.kind), Value::String(e.message.clone())),
                        None => (Value::Null, Value::Null),
                    };
                    self.errors.push(json!({
                        "key": outcome.key,
                        "kind": kind,
                        "message": message,
                    }));
                } else {
                    self.errors_truncated += 1;
                }
            }
            OutcomeBucket::Updated => {
                for field in &outcome.changed_fields {
                    let n = self
                        .updated_fields
                        .get(field)
                        .and_then(Value::as_u64)
                        .unwrap_or(0);
                    self.updated_fields.insert(field.clone(), json!(n + 1));
                }
            }
            OutcomeBucket::Created | OutcomeBucket::Skipped => {}
        }
    }

    pub fn set_cursor(&mut self, cursor: SourceCursor) {
        self.cursor = Some(cursor);
    }

    pub fn set_source(&mut self, source: Value) {
        self.source = Some(source);
    }

    /// Render the document. The cursor is only kept for runs that stopped early,
    /// so a completed run makes the next one start from the beginning.
    pub fn finish(self, trigger: RunTrigger, elapsed: Duration, failure: Option<RunFailure>) -> Value {
        let mut out = Map::new();
        let failed = failure.is_some();
        if let Some(failure) = failure {
            out.insert("reason".to_string(), json!(failure.reason));
            if let Some(e) = failure.error {
                out.insert("error".to_string(), Value::String(e));
            }
        }
        out.insert("elapsed_ms".to_string(), json!(elapsed.as_millis() as u64));
        out.insert("trigger".to_string(), json!(trigger));
        if let Some(source) = self.source {
            out.insert("source".to_string(), source);
        }
        if let Some(cursor) = self.cursor.filter(|_| failed) {
            out.insert("cursor".to_string(), cursor.value);
        }
        if !self.errors.is_empty() {
            out.insert("errors".to_string(), Value::Array(self.errors));
        }
        if self.errors_truncated > 0 {
            out.insert("errors_truncated".to_string(), json!(self.errors_truncated));
        }
        if !self.updated_fields.is_empty() {
            out.insert(
                "updated_fields".to_string(),
                Value::Object(self.updated_fields),
            );
        }
        Value::Object(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::reconciler::ItemError;

    fn error_outcome(key: &str) -> ItemOutcome {
        ItemOutcome {
            key: key.to_string(),
            bucket: OutcomeBucket::Error,
            error: Some(ItemError::validation("bad")),
            changed_fields: vec![],
        }
    }

    #[test]
    fn error_samples_are_truncated() {
        let mut b = DetailsBuilder::new(2);
        for k in ["a", "b", "c", "d"] {
            b.record(&error_outcome(k));
        }
        let v = b.finish(RunTrigger::Manual, Duration::from_millis(5), None);
        assert_eq!(v["errors"].as_array().unwrap().len(), 2);
        assert_eq!(v["errors"][0]["kind"], "validation");
        assert_eq!(v["errors_truncated"], 2);
        assert!(v.get("reason").is_none());
    }

    #[test]
    fn failure_reason_leads_the_document() {
        let mut b = DetailsBuilder::new(10);
        b.record(&ItemOutcome {
            key: "x".to_string(),
            bucket: OutcomeBucket::Updated,
            error: None,
            changed_fields: vec!["status".to_string()],
        });
        let v = b.finish(
            RunTrigger::Scheduled,
            Duration::ZERO,
            Some(RunFailure::bare(FailureReason::Cancelled)),
        );
        let keys: Vec<&String> = v.as_object().unwrap().keys().collect();
        assert_eq!(keys[0], "reason");
        assert_eq!(v["reason"], "cancelled");
        assert_eq!(v["trigger"], "scheduled");
        assert_eq!(v["updated_fields"]["status"], 1);
    }

    #[test]
    fn cursor_is_dropped_on_completion() {
        let mut b = DetailsBuilder::new(10);
        b.set_cursor(SourceCursor::new(json!(7)));
        let done = b.clone().finish(RunTrigger::Manual, Duration::ZERO, None);
        assert!(done.get("cursor").is_none());

        let failed = b.finish(
            RunTrigger::Manual,
            Duration::ZERO,
            Some(RunFailure::bare(FailureReason::Timeout)),
        );
        assert_eq!(failed["cursor"], 7);
    }
}
