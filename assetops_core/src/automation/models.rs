use crate::models::{TenantId, scope_key};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Origin of a run. Recorded for audit only; the engine treats both the same.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Scheduled,
    Manual,
}

impl RunTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunTrigger::Scheduled => "scheduled",
            RunTrigger::Manual => "manual",
        }
    }
}

impl fmt::Display for RunTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunTrigger {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scheduled" => Ok(RunTrigger::Scheduled),
            "manual" => Ok(RunTrigger::Manual),
            other => Err(Error::InvalidInput(format!("unknown run trigger: {other}"))),
        }
    }
}

/// Run lifecycle: `running -> completed | failed`. Terminal states never change.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    /// The only legal transitions leave `running` for a terminal state.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(self, RunStatus::Running) && next.is_terminal()
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(Error::BackendMessage(format!(
                "invalid automation run status: {other}"
            ))),
        }
    }
}

/// Counter bucket an applied candidate lands in. Every processed candidate lands in exactly one.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeBucket {
    Created,
    Updated,
    Skipped,
    Error,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    #[serde(rename = "processed_count")]
    pub processed: u64,
    #[serde(rename = "created_count")]
    pub created: u64,
    #[serde(rename = "updated_count")]
    pub updated: u64,
    #[serde(rename = "skipped_count")]
    pub skipped: u64,
    #[serde(rename = "error_count")]
    pub errors: u64,
}

impl RunCounters {
    pub fn record(&mut self, bucket: OutcomeBucket) {
        self.processed += 1;
        match bucket {
            OutcomeBucket::Created => self.created += 1,
            OutcomeBucket::Updated => self.updated += 1,
            OutcomeBucket::Skipped => self.skipped += 1,
            OutcomeBucket::Error => self.errors += 1,
        }
    }

    pub fn bucket_total(&self) -> u64 {
        self.created + self.updated + self.skipped + self.errors
    }

    /// True if no counter in `self` is smaller than in `earlier`.
    pub fn dominates(&self, earlier: &RunCounters) -> bool {
        self.processed >= earlier.processed
            && self.created >= earlier.created
            && self.updated >= earlier.updated
            && self.skipped >= earlier.skipped
            && self.errors >= earlier.errors
    }
}

/// Durable record of one engine execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationRun {
    pub id: Uuid,
    /// `None` only for system-wide runs.
    pub tenant_id: Option<TenantId>,
    pub trigger: RunTrigger,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub counters: RunCounters,
    /// Open, ordered document. Readers must ignore keys they do not know.
    pub details: Option<serde_json::Value>,
    /// Heartbeat: creation time, then the time of each counter flush.
    pub last_flushed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl AutomationRun {
    pub fn new_running(
        tenant_id: Option<TenantId>,
        trigger: RunTrigger,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            trigger,
            status: RunStatus::Running,
            started_at,
            completed_at: None,
            counters: RunCounters::default(),
            details: None,
            last_flushed_at: started_at,
            created_at: started_at,
        }
    }

    pub fn scope_key(&self) -> String {
        scope_key(self.tenant_id)
    }

    pub fn is_active(&self) -> bool {
        self.status == RunStatus::Running
    }

    /// Look up a top-level `details` key.
    pub fn detail(&self, key: &str) -> Option<&serde_json::Value> {
        self.details.as_ref().and_then(|d| d.get(key))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunQuery {
    pub status: Option<RunStatus>,
    pub trigger: Option<RunTrigger>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for RunQuery {
    fn default() -> Self {
        Self {
            status: None,
            trigger: None,
            limit: 50,
            offset: 0,
        }
    }
}

/// Opaque resume position handed out by a source adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCursor {
    pub value: serde_json::Value,
}

impl SourceCursor {
    pub fn new(value: serde_json::Value) -> Self {
        Self { value }
    }
}

/// One externally supplied record proposed for reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Stable natural key in the external system.
    pub key: String,
    pub attributes: serde_json::Map<String, serde_json::Value>,
    /// Position to resume from once this candidate has been applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<SourceCursor>,
}

impl Candidate {
    pub fn new(
        key: impl Into<String>,
        attributes: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            key: key.into(),
            attributes,
            cursor: None,
        }
    }

    /// Build from a JSON object value; non-object values yield an empty attribute map.
    pub fn from_json(key: impl Into<String>, attributes: serde_json::Value) -> Self {
        let attributes = match attributes {
            serde_json::Value::Object(m) => m,
            _ => serde_json::Map::new(),
        };
        Self::new(key, attributes)
    }

    pub fn with_cursor(mut self, cursor: SourceCursor) -> Self {
        self.cursor = Some(cursor);
        self
    }
}

/// Persisted state of a reconciled domain record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: Uuid,
    pub tenant_id: Option<TenantId>,
    pub entity_type: String,
    pub key: String,
    pub attributes: serde_json::Map<String, serde_json::Value>,
    /// Bumped on every update; used for optimistic concurrency.
    pub version: i64,
    pub created_by_run: Option<Uuid>,
    pub updated_by_run: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_leave_running_only() {
        assert!(RunStatus::Running.can_transition_to(RunStatus::Completed));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Failed));
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Completed.can_transition_to(RunStatus::Failed));
        assert!(!RunStatus::Failed.can_transition_to(RunStatus::Completed));
    }

    #[test]
    fn counters_put_each_item_in_one_bucket() {
        let mut c = RunCounters::default();
        c.record(OutcomeBucket::Created);
        c.record(OutcomeBucket::Skipped);
        c.record(OutcomeBucket::Error);
        assert_eq!(c.processed, 3);
        assert_eq!(c.bucket_total(), c.processed);
    }

    #[test]
    fn run_serializes_counters_flat() {
        let run = AutomationRun::new_running(None, RunTrigger::Manual, Utc::now());
        let v = serde_json::to_value(&run).unwrap();
        assert_eq!(v["status"], "running");
        assert_eq!(v["trigger"], "manual");
        assert_eq!(v["processed_count"], 0);
        assert!(v["tenant_id"].is_null());
    }

    #[test]
    fn unknown_status_string_is_rejected() {
        assert!("cancelled".parse::<RunStatus>().is_err());
        assert_eq!("failed".parse::<RunStatus>().unwrap(), RunStatus::Failed);
    }
}
