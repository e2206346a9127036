use crate::automation::coordinator::LocalRuns;
use crate::automation::details::{FailureReason, RunFailure};
use crate::automation::models::{AutomationRun, RunStatus};
use crate::automation::traits::RunStore;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Fails runs left `running` by a crashed or partitioned executor.
///
/// A run is stale once its last heartbeat (`last_flushed_at`) is older than
/// `stale_after`. Runs executing in this process are never touched.
#[derive(Clone)]
pub struct RecoverySweep {
    runs: Arc<dyn RunStore>,
    local: LocalRuns,
    stale_after: Duration,
    batch_limit: usize,
}

impl RecoverySweep {
    pub fn new(runs: Arc<dyn RunStore>, local: LocalRuns, stale_after: Duration) -> Self {
        Self {
            runs,
            local,
            stale_after,
            batch_limit: 500,
        }
    }

    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit.max(1);
        self
    }

    /// Finalize every stale run as `failed` with `reason = "stale"` and return them.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<AutomationRun>> {
        let stale_after = chrono::Duration::from_std(self.stale_after)
            .map_err(|e| Error::InvalidInput(format!("stale_after out of range: {e}")))?;
        let cutoff = now - stale_after;
        let candidates = self.runs.list_stale_runs(cutoff, self.batch_limit).await?;

        let mut finalized = Vec::new();
        for run in candidates {
            if self.local.contains(run.id) {
                tracing::debug!(run_id = %run.id, "skipping stale-looking run executing locally");
                continue;
            }
            let details = RunFailure::new(
                FailureReason::Stale,
                format!("no heartbeat since {}", run.last_flushed_at.to_rfc3339()),
            )
            .into_details();
            match self
                .runs
                .finalize_run(
                    run.tenant_id,
                    run.id,
                    RunStatus::Failed,
                    &run.counters,
                    Some(details),
                    now,
                )
                .await
            {
                Ok(done) => {
                    tracing::warn!(
                        run_id = %done.id,
                        scope = %done.scope_key(),
                        last_flushed_at = %run.last_flushed_at,
                        "stale automation run marked failed"
                    );
                    finalized.push(done);
                }
                Err(Error::InvalidTransition { .. }) => {
                    tracing::debug!(run_id = %run.id, "run finalized concurrently");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(finalized)
    }
}
