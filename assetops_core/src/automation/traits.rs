use crate::Result;
use crate::automation::models::{
    AutomationRun, Candidate, RunCounters, RunQuery, RunStatus, RunTrigger, SourceCursor,
    StoredRecord,
};
use crate::models::TenantId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use std::pin::Pin;
use uuid::Uuid;

/// Lazily produced, finite sequence of candidates. An `Err` item ends the run as failed.
pub type CandidateStream = Pin<Box<dyn Stream<Item = Result<Candidate>> + Send + 'static>>;

/// What a source adapter is told about the run it is feeding.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceContext {
    pub tenant_id: Option<TenantId>,
    pub run_id: Uuid,
    pub trigger: RunTrigger,
    /// Resume position from an earlier run, if the adapter handed one out.
    pub cursor: Option<SourceCursor>,
}

/// Supplies the candidates to reconcile for a tenant.
///
/// Implementations must yield a stable natural key per candidate and must not
/// depend on the engine reordering items: the engine applies them in stream order.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Adapter identifier, recorded in run details.
    fn id(&self) -> &str;

    /// Open the candidate stream. A failure here fails the run with zero processed items.
    async fn open(&self, ctx: &SourceContext) -> Result<CandidateStream>;

    /// Adapter-reported metadata merged into the terminal run details.
    async fn metadata(&self, _ctx: &SourceContext) -> Option<serde_json::Value> {
        None
    }
}

/// Durable persistence for automation runs.
///
/// Every call is atomic. Writes are scoped by tenant and run id and never touch
/// another run's row.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert `run` (status `running`) unless its scope already has a running run.
    ///
    /// Must be enforced by the store itself (unique constraint or lock) so that
    /// replicated coordinators cannot both succeed. Fails with
    /// `Error::RunAlreadyActive` without writing anything on conflict.
    async fn try_acquire_run_slot(&self, run: &AutomationRun) -> Result<()>;

    /// Flush interim counters and bump the heartbeat.
    ///
    /// Returns `false` if the run is no longer `running` (finalized elsewhere);
    /// terminal counters are never overwritten.
    async fn update_counters(
        &self,
        tenant_id: Option<TenantId>,
        run_id: Uuid,
        counters: &RunCounters,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Move a running run to a terminal status. Fails with
    /// `Error::InvalidTransition` if the run is already terminal.
    async fn finalize_run(
        &self,
        tenant_id: Option<TenantId>,
        run_id: Uuid,
        status: RunStatus,
        counters: &RunCounters,
        details: Option<serde_json::Value>,
        at: DateTime<Utc>,
    ) -> Result<AutomationRun>;

    async fn get_run(&self, tenant_id: Option<TenantId>, run_id: Uuid)
    -> Result<Option<AutomationRun>>;

    async fn get_active_run(&self, tenant_id: Option<TenantId>) -> Result<Option<AutomationRun>>;

    /// Newest first.
    async fn list_runs(
        &self,
        tenant_id: Option<TenantId>,
        query: RunQuery,
    ) -> Result<Vec<AutomationRun>>;

    /// Running runs (any scope) whose last heartbeat is older than `older_than`.
    async fn list_stale_runs(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AutomationRun>>;

    /// Cursor recorded by the most recent terminal run, if it stopped early.
    async fn latest_cursor(&self, tenant_id: Option<TenantId>) -> Result<Option<SourceCursor>> {
        let runs = self
            .list_runs(
                tenant_id,
                RunQuery {
                    limit: 20,
                    ..Default::default()
                },
            )
            .await?;
        Ok(runs
            .into_iter()
            .find(|r| r.status.is_terminal())
            .and_then(|r| r.detail("cursor").cloned())
            .map(SourceCursor::new))
    }
}

/// Field-level write against a stored record.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordPatch {
    pub record_id: Uuid,
    /// Version read at decision time; the write fails with `Conflict` if it moved.
    pub expected_version: i64,
    /// Only the fields that changed.
    pub changes: serde_json::Map<String, serde_json::Value>,
    pub run_id: Uuid,
    pub at: DateTime<Utc>,
}

/// Persistent state the reconciler applies decisions to.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_record(
        &self,
        tenant_id: Option<TenantId>,
        entity_type: &str,
        key: &str,
    ) -> Result<Option<StoredRecord>>;

    /// Insert a new record. Fails with `Error::Conflict` if the key already exists.
    async fn insert_record(&self, record: &StoredRecord) -> Result<()>;

    /// Apply `patch` in a single transaction and return the updated record.
    async fn update_record(
        &self,
        tenant_id: Option<TenantId>,
        patch: &RecordPatch,
    ) -> Result<StoredRecord>;

    async fn list_records(
        &self,
        tenant_id: Option<TenantId>,
        entity_type: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoredRecord>>;
}
