//! Scheduled trigger loop.
//!
//! Every tick runs the recovery sweep, then starts one `scheduled` run per
//! configured scope. A scope whose previous run is still going is skipped for
//! that tick.

use assetops_core::{
    AutomationRun, Error, RecoverySweep, RunCoordinator, RunHandle, RunTrigger, TenantId,
    scope_key,
};
use chrono::Utc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub struct ScheduledGateway {
    coordinator: RunCoordinator,
    sweep: RecoverySweep,
    scopes: Vec<Option<TenantId>>,
    interval: Duration,
}

impl ScheduledGateway {
    pub fn new(
        coordinator: RunCoordinator,
        scopes: Vec<Option<TenantId>>,
        interval: Duration,
    ) -> Self {
        let sweep = RecoverySweep::new(
            coordinator.run_store(),
            coordinator.local_runs(),
            coordinator.config().stale_after,
        );
        Self {
            coordinator,
            sweep,
            scopes,
            interval,
        }
    }

    /// Loop until `shutdown` fires. In-flight runs are cancelled and awaited
    /// before returning, so none is left `running` behind a clean exit.
    #[tracing::instrument(level = "info", skip_all, fields(scopes = self.scopes.len()))]
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut in_flight: JoinSet<(Uuid, Result<AutomationRun, Error>)> = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(in_flight = in_flight.len(), "scheduled gateway stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick(&shutdown, &mut in_flight).await;
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    log_finished(joined);
                }
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            log_finished(joined);
        }
    }

    /// One sweep plus one start attempt per scope. Returns the ids of the runs started.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn tick(
        &self,
        shutdown: &CancellationToken,
        in_flight: &mut JoinSet<(Uuid, Result<AutomationRun, Error>)>,
    ) -> Vec<Uuid> {
        match self.sweep.sweep(Utc::now()).await {
            Ok(swept) if !swept.is_empty() => {
                tracing::info!(count = swept.len(), "stale runs failed by sweep");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(%e, "recovery sweep failed"),
        }

        let mut started = Vec::new();
        for &tenant_id in &self.scopes {
            match self
                .coordinator
                .start_run(tenant_id, RunTrigger::Scheduled)
                .await
            {
                Ok(handle) => {
                    started.push(handle.run_id());
                    in_flight.spawn(supervise(handle, shutdown.clone()));
                }
                Err(Error::RunAlreadyActive {
                    scope,
                    active_run_id,
                }) => {
                    tracing::debug!(%scope, ?active_run_id, "run still active, skipping tick");
                }
                Err(e) => {
                    tracing::warn!(scope = %scope_key(tenant_id), %e, "failed to start scheduled run");
                }
            }
        }
        started
    }
}

async fn supervise(
    handle: RunHandle,
    shutdown: CancellationToken,
) -> (Uuid, Result<AutomationRun, Error>) {
    let run_id = handle.run_id();
    let stop = handle.cancel_token();
    let wait = handle.wait();
    tokio::pin!(wait);
    let result = tokio::select! {
        res = &mut wait => res,
        _ = shutdown.cancelled() => {
            stop.cancel();
            wait.await
        }
    };
    (run_id, result)
}

fn log_finished(joined: Result<(Uuid, Result<AutomationRun, Error>), tokio::task::JoinError>) {
    match joined {
        Ok((_, Ok(run))) => tracing::info!(
            run_id = %run.id,
            status = %run.status,
            processed = run.counters.processed,
            errors = run.counters.errors,
            "scheduled run finished"
        ),
        Ok((run_id, Err(e))) => tracing::warn!(%run_id, %e, "scheduled run ended with error"),
        Err(e) => tracing::error!(%e, "run supervisor panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assetops_core::source::StaticSource;
    use assetops_core::store::memory::MemoryStore;
    use assetops_core::{
        Candidate, EngineConfig, FieldKind, FieldSpec, ReconcileSpec, Reconciler, RunQuery,
        RunStatus, RunStore,
    };
    use serde_json::json;
    use std::sync::Arc;

    fn coordinator(store: &MemoryStore, source: StaticSource) -> RunCoordinator {
        let spec = ReconcileSpec::new("asset", vec![FieldSpec::new("name", FieldKind::String)])
            .unwrap();
        let reconciler = Reconciler::new(spec, Arc::new(store.clone()));
        RunCoordinator::new(
            Arc::new(store.clone()),
            Arc::new(source),
            reconciler,
            EngineConfig {
                batch_size: 2,
                flush_every_items: 1,
                flush_interval: Duration::from_millis(20),
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn candidates(n: usize) -> Vec<Candidate> {
        (0..n)
            .map(|i| Candidate::from_json(format!("a-{i}"), json!({ "name": format!("n{i}") })))
            .collect()
    }

    #[tokio::test]
    async fn tick_starts_one_run_per_scope_and_skips_busy_ones() {
        let store = MemoryStore::new();
        let source = StaticSource::new(candidates(50)).with_item_delay(Duration::from_millis(20));
        let tenants = vec![Some(TenantId::new()), Some(TenantId::new()), None];
        let gateway = ScheduledGateway::new(
            coordinator(&store, source),
            tenants.clone(),
            Duration::from_secs(60),
        );
        let shutdown = CancellationToken::new();
        let mut in_flight = JoinSet::new();

        let first = gateway.tick(&shutdown, &mut in_flight).await;
        assert_eq!(first.len(), 3);

        let second = gateway.tick(&shutdown, &mut in_flight).await;
        assert!(second.is_empty());

        shutdown.cancel();
        while let Some(joined) = in_flight.join_next().await {
            let (_, result) = joined.unwrap();
            let run = result.unwrap();
            assert_eq!(run.status, RunStatus::Failed);
            assert_eq!(run.detail("reason"), Some(&json!("cancelled")));
        }
        for tenant in tenants {
            assert!(store.get_active_run(tenant).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn loop_runs_until_shutdown() {
        let store = MemoryStore::new();
        let tenant = Some(TenantId::new());
        let gateway = ScheduledGateway::new(
            coordinator(&store, StaticSource::new(candidates(3))),
            vec![tenant],
            Duration::from_millis(30),
        );
        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            stopper.cancel();
        });
        tokio::time::timeout(Duration::from_secs(10), gateway.run(shutdown))
            .await
            .unwrap();

        let runs = store.list_runs(tenant, RunQuery::default()).await.unwrap();
        assert!(!runs.is_empty());
        assert!(runs.iter().all(|r| r.status.is_terminal()));
        assert!(runs.iter().all(|r| r.trigger == RunTrigger::Scheduled));
        let oldest = runs.last().unwrap();
        assert_eq!(oldest.status, RunStatus::Completed);
        assert_eq!(oldest.counters.created, 3);
    }
}
