#![allow(dead_code)]

use assetops_core::automation::models::RunCounters;
use assetops_core::store::memory::MemoryStore;
use assetops_core::{
    AutomationRun, Candidate, EngineConfig, Error, FieldKind, FieldSpec, RecordPatch, RecordStore,
    ReconcileSpec, Reconciler, Result, RunCoordinator, RunHandle, RunQuery, RunStatus, RunStore,
    SourceAdapter, StoredRecord, TenantId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub fn asset_spec() -> ReconcileSpec {
    ReconcileSpec::new(
        "asset",
        vec![
            FieldSpec::new("name", FieldKind::String).required(),
            FieldSpec::new("status", FieldKind::String).case_insensitive(),
            FieldSpec::new("cost", FieldKind::Number),
        ],
    )
    .unwrap()
}

pub fn asset(i: usize) -> Candidate {
    Candidate::from_json(
        format!("asset-{i:03}"),
        json!({ "name": format!("Laptop {i}"), "status": "in_use", "cost": 1200 + i }),
    )
}

pub fn assets(n: usize) -> Vec<Candidate> {
    (0..n).map(asset).collect()
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        batch_size: 4,
        apply_concurrency: 2,
        flush_every_items: 1,
        flush_interval: Duration::from_millis(50),
        max_run_duration: Duration::from_secs(30),
        max_consecutive_apply_failures: 5,
        max_error_details: 10,
        stale_after: Duration::from_secs(60),
        resume_from_cursor: true,
    }
}

pub fn coordinator(
    store: &MemoryStore,
    source: impl SourceAdapter + 'static,
    config: EngineConfig,
) -> RunCoordinator {
    coordinator_with(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        source,
        config,
    )
}

pub fn coordinator_with(
    runs: Arc<dyn RunStore>,
    records: Arc<dyn RecordStore>,
    source: impl SourceAdapter + 'static,
    config: EngineConfig,
) -> RunCoordinator {
    let reconciler = Reconciler::new(asset_spec(), records);
    RunCoordinator::new(runs, Arc::new(source), reconciler, config).unwrap()
}

pub async fn wait(handle: RunHandle) -> AutomationRun {
    tokio::time::timeout(Duration::from_secs(20), handle.wait())
        .await
        .expect("run did not finish in time")
        .unwrap()
}

/// Block until the run reports at least `n` processed candidates.
pub async fn wait_for_progress(handle: &RunHandle, n: u64) {
    let mut progress = handle.progress();
    tokio::time::timeout(Duration::from_secs(20), async {
        while progress.borrow_and_update().processed < n {
            progress.changed().await.unwrap();
        }
    })
    .await
    .expect("run made no progress");
}

pub fn assert_counters_consistent(run: &AutomationRun) {
    assert_eq!(run.counters.bucket_total(), run.counters.processed);
}

pub fn reason(run: &AutomationRun) -> Option<&str> {
    run.detail("reason").and_then(|v| v.as_str())
}

/// Record store whose inserts always fail, as if the database rejected every write.
#[derive(Clone)]
pub struct RejectingInserts {
    pub inner: MemoryStore,
}

#[async_trait]
impl RecordStore for RejectingInserts {
    async fn get_record(
        &self,
        tenant_id: Option<TenantId>,
        entity_type: &str,
        key: &str,
    ) -> Result<Option<StoredRecord>> {
        self.inner.get_record(tenant_id, entity_type, key).await
    }

    async fn insert_record(&self, _record: &StoredRecord) -> Result<()> {
        Err(Error::BackendMessage("disk full".to_string()))
    }

    async fn update_record(
        &self,
        tenant_id: Option<TenantId>,
        patch: &RecordPatch,
    ) -> Result<StoredRecord> {
        self.inner.update_record(tenant_id, patch).await
    }

    async fn list_records(
        &self,
        tenant_id: Option<TenantId>,
        entity_type: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoredRecord>> {
        self.inner
            .list_records(tenant_id, entity_type, limit, offset)
            .await
    }
}

/// Run store that loses its connection on every counter flush.
#[derive(Clone)]
pub struct FailingFlushes {
    pub inner: MemoryStore,
}

#[async_trait]
impl RunStore for FailingFlushes {
    async fn try_acquire_run_slot(&self, run: &AutomationRun) -> Result<()> {
        self.inner.try_acquire_run_slot(run).await
    }

    async fn update_counters(
        &self,
        _tenant_id: Option<TenantId>,
        _run_id: Uuid,
        _counters: &RunCounters,
        _at: DateTime<Utc>,
    ) -> Result<bool> {
        Err(Error::store_unavailable(
            "update counters",
            std::io::Error::other("connection reset"),
        ))
    }

    async fn finalize_run(
        &self,
        tenant_id: Option<TenantId>,
        run_id: Uuid,
        status: RunStatus,
        counters: &RunCounters,
        details: Option<serde_json::Value>,
        at: DateTime<Utc>,
    ) -> Result<AutomationRun> {
        self.inner
            .finalize_run(tenant_id, run_id, status, counters, details, at)
            .await
    }

    async fn get_run(
        &self,
        tenant_id: Option<TenantId>,
        run_id: Uuid,
    ) -> Result<Option<AutomationRun>> {
        self.inner.get_run(tenant_id, run_id).await
    }

    async fn get_active_run(&self, tenant_id: Option<TenantId>) -> Result<Option<AutomationRun>> {
        self.inner.get_active_run(tenant_id).await
    }

    async fn list_runs(
        &self,
        tenant_id: Option<TenantId>,
        query: RunQuery,
    ) -> Result<Vec<AutomationRun>> {
        self.inner.list_runs(tenant_id, query).await
    }

    async fn list_stale_runs(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AutomationRun>> {
        self.inner.list_stale_runs(older_than, limit).await
    }
}

/// Record store whose inserts take a per-key amount of time and can be rejected per key.
#[derive(Clone)]
pub struct SlowInserts {
    pub inner: MemoryStore,
    pub delay: fn(&str) -> Duration,
    pub reject: fn(&str) -> bool,
}

#[async_trait]
impl RecordStore for SlowInserts {
    async fn get_record(
        &self,
        tenant_id: Option<TenantId>,
        entity_type: &str,
        key: &str,
    ) -> Result<Option<StoredRecord>> {
        self.inner.get_record(tenant_id, entity_type, key).await
    }

    async fn insert_record(&self, record: &StoredRecord) -> Result<()> {
        tokio::time::sleep((self.delay)(&record.key)).await;
        if (self.reject)(&record.key) {
            return Err(Error::BackendMessage(format!("rejected {}", record.key)));
        }
        self.inner.insert_record(record).await
    }

    async fn update_record(
        &self,
        tenant_id: Option<TenantId>,
        patch: &RecordPatch,
    ) -> Result<StoredRecord> {
        self.inner.update_record(tenant_id, patch).await
    }

    async fn list_records(
        &self,
        tenant_id: Option<TenantId>,
        entity_type: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoredRecord>> {
        self.inner
            .list_records(tenant_id, entity_type, limit, offset)
            .await
    }
}

/// Run store that remembers every counter snapshot it was asked to flush.
#[derive(Clone, Default)]
pub struct RecordingFlushes {
    pub inner: MemoryStore,
    pub flushed: Arc<std::sync::Mutex<Vec<RunCounters>>>,
}

impl RecordingFlushes {
    pub fn snapshots(&self) -> Vec<RunCounters> {
        self.flushed.lock().unwrap().clone()
    }
}

#[async_trait]
impl RunStore for RecordingFlushes {
    async fn try_acquire_run_slot(&self, run: &AutomationRun) -> Result<()> {
        self.inner.try_acquire_run_slot(run).await
    }

    async fn update_counters(
        &self,
        tenant_id: Option<TenantId>,
        run_id: Uuid,
        counters: &RunCounters,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        self.flushed.lock().unwrap().push(*counters);
        self.inner
            .update_counters(tenant_id, run_id, counters, at)
            .await
    }

    async fn finalize_run(
        &self,
        tenant_id: Option<TenantId>,
        run_id: Uuid,
        status: RunStatus,
        counters: &RunCounters,
        details: Option<serde_json::Value>,
        at: DateTime<Utc>,
    ) -> Result<AutomationRun> {
        self.inner
            .finalize_run(tenant_id, run_id, status, counters, details, at)
            .await
    }

    async fn get_run(
        &self,
        tenant_id: Option<TenantId>,
        run_id: Uuid,
    ) -> Result<Option<AutomationRun>> {
        self.inner.get_run(tenant_id, run_id).await
    }

    async fn get_active_run(&self, tenant_id: Option<TenantId>) -> Result<Option<AutomationRun>> {
        self.inner.get_active_run(tenant_id).await
    }

    async fn list_runs(
        &self,
        tenant_id: Option<TenantId>,
        query: RunQuery,
    ) -> Result<Vec<AutomationRun>> {
        self.inner.list_runs(tenant_id, query).await
    }

    async fn list_stale_runs(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AutomationRun>> {
        self.inner.list_stale_runs(older_than, limit).await
    }
}
