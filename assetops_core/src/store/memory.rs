use crate::automation::models::{AutomationRun, RunCounters, RunQuery, RunStatus, StoredRecord};
use crate::automation::traits::{RecordPatch, RecordStore, RunStore};
use crate::models::{TenantId, scope_key};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

type RecordKey = (String, String, String);

/// Process-local store for tests and single-process dev setups.
///
/// The slot check and the insert happen under one write lock, which gives the
/// same exclusivity as the partial unique index used by the SQL stores.
#[derive(Clone, Default)]
pub struct MemoryStore {
    runs: Arc<RwLock<HashMap<Uuid, AutomationRun>>>,
    records: Arc<RwLock<HashMap<RecordKey, StoredRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a run's heartbeat. Lets tests simulate an executor that died.
    pub async fn set_last_flushed_at(&self, run_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(&run_id)
            .ok_or_else(|| Error::NotFound(format!("automation run {run_id}")))?;
        run.last_flushed_at = at;
        Ok(())
    }
}

fn record_key(tenant_id: Option<TenantId>, entity_type: &str, key: &str) -> RecordKey {
    (scope_key(tenant_id), entity_type.to_string(), key.to_string())
}

#[async_trait]
impl RunStore for MemoryStore {
    #[tracing::instrument(level = "debug", skip_all)]
    async fn try_acquire_run_slot(&self, run: &AutomationRun) -> Result<()> {
        if run.status != RunStatus::Running {
            return Err(Error::InvalidInput(
                "only running runs can acquire a slot".to_string(),
            ));
        }
        let mut runs = self.runs.write().await;
        if let Some(active) = runs
            .values()
            .find(|r| r.is_active() && r.tenant_id == run.tenant_id)
        {
            return Err(Error::RunAlreadyActive {
                scope: run.scope_key(),
                active_run_id: Some(active.id),
            });
        }
        if runs.contains_key(&run.id) {
            return Err(Error::Conflict(format!("automation run {} exists", run.id)));
        }
        runs.insert(run.id, run.clone());
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn update_counters(
        &self,
        tenant_id: Option<TenantId>,
        run_id: Uuid,
        counters: &RunCounters,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(&run_id)
            .filter(|r| r.tenant_id == tenant_id)
            .ok_or_else(|| Error::NotFound(format!("automation run {run_id}")))?;
        if !run.is_active() {
            return Ok(false);
        }
        run.counters = *counters;
        run.last_flushed_at = at;
        Ok(true)
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn finalize_run(
        &self,
        tenant_id: Option<TenantId>,
        run_id: Uuid,
        status: RunStatus,
        counters: &RunCounters,
        details: Option<serde_json::Value>,
        at: DateTime<Utc>,
    ) -> Result<AutomationRun> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(&run_id)
            .filter(|r| r.tenant_id == tenant_id)
            .ok_or_else(|| Error::NotFound(format!("automation run {run_id}")))?;
        if !run.status.can_transition_to(status) {
            return Err(Error::InvalidTransition {
                run_id,
                from: run.status,
                to: status,
            });
        }
        run.status = status;
        run.counters = *counters;
        run.details = details;
        run.completed_at = Some(at);
        run.last_flushed_at = at;
        Ok(run.clone())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn get_run(
        &self,
        tenant_id: Option<TenantId>,
        run_id: Uuid,
    ) -> Result<Option<AutomationRun>> {
        Ok(self
            .runs
            .read()
            .await
            .get(&run_id)
            .filter(|r| r.tenant_id == tenant_id)
            .cloned())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn get_active_run(&self, tenant_id: Option<TenantId>) -> Result<Option<AutomationRun>> {
        Ok(self
            .runs
            .read()
            .await
            .values()
            .find(|r| r.is_active() && r.tenant_id == tenant_id)
            .cloned())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn list_runs(
        &self,
        tenant_id: Option<TenantId>,
        query: RunQuery,
    ) -> Result<Vec<AutomationRun>> {
        let runs = self.runs.read().await;
        let mut out: Vec<AutomationRun> = runs
            .values()
            .filter(|r| r.tenant_id == tenant_id)
            .filter(|r| query.status.is_none_or(|s| r.status == s))
            .filter(|r| query.trigger.is_none_or(|t| r.trigger == t))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            (b.started_at, b.id.to_string()).cmp(&(a.started_at, a.id.to_string()))
        });
        Ok(out
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn list_stale_runs(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AutomationRun>> {
        let runs = self.runs.read().await;
        let mut out: Vec<AutomationRun> = runs
            .values()
            .filter(|r| r.is_active() && r.last_flushed_at < older_than)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.last_flushed_at);
        out.truncate(limit);
        Ok(out)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    #[tracing::instrument(level = "debug", skip_all)]
    async fn get_record(
        &self,
        tenant_id: Option<TenantId>,
        entity_type: &str,
        key: &str,
    ) -> Result<Option<StoredRecord>> {
        Ok(self
            .records
            .read()
            .await
            .get(&record_key(tenant_id, entity_type, key))
            .cloned())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn insert_record(&self, record: &StoredRecord) -> Result<()> {
        let k = record_key(record.tenant_id, &record.entity_type, &record.key);
        let mut records = self.records.write().await;
        if records.contains_key(&k) {
            return Err(Error::Conflict(format!(
                "{} '{}' already exists",
                record.entity_type, record.key
            )));
        }
        records.insert(k, record.clone());
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn update_record(
        &self,
        tenant_id: Option<TenantId>,
        patch: &RecordPatch,
    ) -> Result<StoredRecord> {
        let scope = scope_key(tenant_id);
        let mut records = self.records.write().await;
        let record = records
            .iter_mut()
            .find(|((s, _, _), r)| *s == scope && r.id == patch.record_id)
            .map(|(_, r)| r)
            .ok_or_else(|| Error::NotFound(format!("record {}", patch.record_id)))?;
        if record.version != patch.expected_version {
            return Err(Error::Conflict(format!(
                "record {} changed (version {} != {})",
                patch.record_id, record.version, patch.expected_version
            )));
        }
        for (field, value) in &patch.changes {
            record.attributes.insert(field.clone(), value.clone());
        }
        record.version += 1;
        record.updated_by_run = Some(patch.run_id);
        record.updated_at = patch.at;
        Ok(record.clone())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn list_records(
        &self,
        tenant_id: Option<TenantId>,
        entity_type: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoredRecord>> {
        let scope = scope_key(tenant_id);
        let records = self.records.read().await;
        let mut out: Vec<StoredRecord> = records
            .iter()
            .filter(|((s, e, _), _)| *s == scope && e == entity_type)
            .map(|(_, r)| r.clone())
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out.into_iter().skip(offset).take(limit).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::models::RunTrigger;

    #[tokio::test]
    async fn second_running_run_for_scope_is_rejected() {
        let store = MemoryStore::new();
        let tenant = Some(TenantId::new());
        let first = AutomationRun::new_running(tenant, RunTrigger::Manual, Utc::now());
        store.try_acquire_run_slot(&first).await.unwrap();

        let second = AutomationRun::new_running(tenant, RunTrigger::Scheduled, Utc::now());
        let err = store.try_acquire_run_slot(&second).await.unwrap_err();
        assert!(matches!(
            err,
            Error::RunAlreadyActive { active_run_id: Some(id), .. } if id == first.id
        ));
        assert!(store.get_run(tenant, second.id).await.unwrap().is_none());

        let other = AutomationRun::new_running(None, RunTrigger::Manual, Utc::now());
        store.try_acquire_run_slot(&other).await.unwrap();
    }

    #[tokio::test]
    async fn terminal_runs_reject_flushes_and_transitions() {
        let store = MemoryStore::new();
        let run = AutomationRun::new_running(None, RunTrigger::Manual, Utc::now());
        store.try_acquire_run_slot(&run).await.unwrap();

        let mut counters = RunCounters::default();
        counters.processed = 2;
        counters.created = 2;
        assert!(store.update_counters(None, run.id, &counters, Utc::now()).await.unwrap());

        let done = store
            .finalize_run(None, run.id, RunStatus::Completed, &counters, None, Utc::now())
            .await
            .unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert!(done.completed_at.is_some());

        let later = RunCounters {
            processed: 9,
            ..counters
        };
        assert!(!store.update_counters(None, run.id, &later, Utc::now()).await.unwrap());
        let err = store
            .finalize_run(None, run.id, RunStatus::Failed, &later, None, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        let stored = store.get_run(None, run.id).await.unwrap().unwrap();
        assert_eq!(stored.counters, counters);
    }

    #[tokio::test]
    async fn runs_are_invisible_across_tenants() {
        let store = MemoryStore::new();
        let a = Some(TenantId::new());
        let run = AutomationRun::new_running(a, RunTrigger::Manual, Utc::now());
        store.try_acquire_run_slot(&run).await.unwrap();
        assert!(store.get_run(Some(TenantId::new()), run.id).await.unwrap().is_none());
        assert!(store.get_run(None, run.id).await.unwrap().is_none());
        assert_eq!(store.list_runs(a, RunQuery::default()).await.unwrap().len(), 1);
    }
}
