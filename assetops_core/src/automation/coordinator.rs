//! Run lifecycle: slot acquisition, candidate streaming, counter flushing and
//! terminal writes.

use crate::automation::details::{DetailsBuilder, FailureReason, RunFailure};
use crate::automation::models::{
    AutomationRun, Candidate, OutcomeBucket, RunCounters, RunQuery, RunStatus, RunTrigger,
    SourceCursor,
};
use crate::automation::reconciler::{ApplyScope, ItemErrorKind, ItemOutcome, Reconciler};
use crate::automation::traits::{CandidateStream, RunStore, SourceAdapter, SourceContext};
use crate::config::EngineConfig;
use crate::models::TenantId;
use crate::{Error, Result};
use chrono::Utc;
use dashmap::DashMap;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct ActiveRun {
    tenant_id: Option<TenantId>,
    cancel: CancellationToken,
}

/// Runs executing in this process, keyed by run id.
#[derive(Debug, Clone, Default)]
pub struct LocalRuns {
    inner: Arc<DashMap<Uuid, ActiveRun>>,
}

impl LocalRuns {
    pub fn contains(&self, run_id: Uuid) -> bool {
        self.inner.contains_key(&run_id)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn token_for(&self, tenant_id: Option<TenantId>, run_id: Uuid) -> Option<CancellationToken> {
        self.inner
            .get(&run_id)
            .filter(|r| r.tenant_id == tenant_id)
            .map(|r| r.cancel.clone())
    }
}

/// Removes a run from [`LocalRuns`] when its task ends, including on panic.
struct LocalRunGuard {
    run_id: Uuid,
    local: LocalRuns,
}

impl Drop for LocalRunGuard {
    fn drop(&mut self) {
        self.local.inner.remove(&self.run_id);
    }
}

/// Handle to a started run.
pub struct RunHandle {
    run: AutomationRun,
    progress: watch::Receiver<RunCounters>,
    cancel: CancellationToken,
    task: JoinHandle<Result<AutomationRun>>,
}

impl RunHandle {
    /// The record as created (status `running`).
    pub fn run(&self) -> &AutomationRun {
        &self.run
    }

    pub fn run_id(&self) -> Uuid {
        self.run.id
    }

    /// Live counters, updated after every processed candidate.
    pub fn progress(&self) -> watch::Receiver<RunCounters> {
        self.progress.clone()
    }

    /// Request cooperative cancellation. In-flight applies finish first.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that stops this run when cancelled; usable after `wait` consumes the handle.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the terminal record.
    pub async fn wait(self) -> Result<AutomationRun> {
        self.task
            .await
            .map_err(|e| Error::BackendMessage(format!("run task aborted: {e}")))?
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    /// The run executes here; it will finalize itself at the next item boundary.
    Signalled,
    /// The run was not executing here and has been finalized in the store.
    Finalized(AutomationRun),
}

#[derive(Debug)]
enum Stop {
    Finished,
    Failed(RunFailure),
    /// Another actor (remote cancel, sweep) already wrote a terminal status.
    FinalizedElsewhere,
}

#[derive(Debug)]
enum PullStop {
    End,
    Failed(String),
    Cancelled,
    Timeout,
    Halt(Stop),
}

struct RunState {
    run: AutomationRun,
    counters: RunCounters,
    details: DetailsBuilder,
    progress: watch::Sender<RunCounters>,
    started: Instant,
    deadline: Instant,
    last_flush: Instant,
    since_flush: u64,
    consecutive_apply_failures: u32,
}

impl RunState {
    fn new(run: AutomationRun, config: &EngineConfig, progress: watch::Sender<RunCounters>) -> Self {
        let now = Instant::now();
        Self {
            run,
            counters: RunCounters::default(),
            details: DetailsBuilder::new(config.max_error_details),
            progress,
            started: now,
            deadline: later(now, config.max_run_duration),
            last_flush: now,
            since_flush: 0,
            consecutive_apply_failures: 0,
        }
    }

    fn record(&mut self, cursor: Option<SourceCursor>, outcome: &ItemOutcome) {
        self.counters.record(outcome.bucket);
        self.details.record(outcome);
        self.since_flush += 1;
        match (&outcome.bucket, &outcome.error) {
            (OutcomeBucket::Error, Some(e)) if e.kind == ItemErrorKind::Apply => {
                self.consecutive_apply_failures += 1;
            }
            (OutcomeBucket::Error, _) => {}
            _ => self.consecutive_apply_failures = 0,
        }
        if let Some(e) = &outcome.error {
            tracing::debug!(run_id = %self.run.id, key = %outcome.key, error = %e, "candidate not applied");
        }
        if let Some(cursor) = cursor {
            self.details.set_cursor(cursor);
        }
        self.progress.send_replace(self.counters);
    }

    fn flush_due(&self, config: &EngineConfig) -> bool {
        self.since_flush >= config.flush_every_items
            || (self.since_flush > 0 && self.last_flush.elapsed() >= config.flush_interval)
    }
}

/// Owns the run state machine and drives the reconciler over a source.
///
/// Cheap to clone; clones share the local run registry.
#[derive(Clone)]
pub struct RunCoordinator {
    runs: Arc<dyn RunStore>,
    source: Arc<dyn SourceAdapter>,
    reconciler: Arc<Reconciler>,
    config: EngineConfig,
    local: LocalRuns,
}

impl RunCoordinator {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(
        runs: Arc<dyn RunStore>,
        source: Arc<dyn SourceAdapter>,
        reconciler: Reconciler,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            runs,
            source,
            reconciler: Arc::new(reconciler),
            config,
            local: LocalRuns::default(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn local_runs(&self) -> LocalRuns {
        self.local.clone()
    }

    pub fn run_store(&self) -> Arc<dyn RunStore> {
        self.runs.clone()
    }

    pub async fn get_run(
        &self,
        tenant_id: Option<TenantId>,
        run_id: Uuid,
    ) -> Result<Option<AutomationRun>> {
        self.runs.get_run(tenant_id, run_id).await
    }

    pub async fn get_active_run(&self, tenant_id: Option<TenantId>) -> Result<Option<AutomationRun>> {
        self.runs.get_active_run(tenant_id).await
    }

    pub async fn list_runs(
        &self,
        tenant_id: Option<TenantId>,
        query: RunQuery,
    ) -> Result<Vec<AutomationRun>> {
        self.runs.list_runs(tenant_id, query).await
    }

    /// Open a run for `tenant_id` and execute it in the background.
    ///
    /// Fails with `Error::RunAlreadyActive` if the scope already has a running run.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn start_run(
        &self,
        tenant_id: Option<TenantId>,
        trigger: RunTrigger,
    ) -> Result<RunHandle> {
        let run = AutomationRun::new_running(tenant_id, trigger, Utc::now());
        self.runs.try_acquire_run_slot(&run).await?;
        tracing::info!(
            run_id = %run.id,
            scope = %run.scope_key(),
            trigger = %trigger,
            "automation run started"
        );

        let cancel = CancellationToken::new();
        self.local.inner.insert(
            run.id,
            ActiveRun {
                tenant_id,
                cancel: cancel.clone(),
            },
        );
        let guard = LocalRunGuard {
            run_id: run.id,
            local: self.local.clone(),
        };

        let (progress_tx, progress_rx) = watch::channel(RunCounters::default());
        let this = self.clone();
        let exec_run = run.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let _guard = guard;
            this.execute(exec_run, token, progress_tx).await
        });

        Ok(RunHandle {
            run,
            progress: progress_rx,
            cancel,
            task,
        })
    }

    /// Start a run and wait for its terminal record.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn run_to_completion(
        &self,
        tenant_id: Option<TenantId>,
        trigger: RunTrigger,
    ) -> Result<AutomationRun> {
        self.start_run(tenant_id, trigger).await?.wait().await
    }

    /// Cancel a run. Local runs stop cooperatively; runs executing elsewhere (or
    /// orphaned) are finalized directly, and their executor stops at its next flush.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn cancel_run(
        &self,
        tenant_id: Option<TenantId>,
        run_id: Uuid,
    ) -> Result<CancelOutcome> {
        if let Some(token) = self.local.token_for(tenant_id, run_id) {
            token.cancel();
            return Ok(CancelOutcome::Signalled);
        }

        let run = cancel_in_store(self.runs.as_ref(), tenant_id, run_id).await?;
        Ok(CancelOutcome::Finalized(run))
    }

    #[tracing::instrument(level = "info", skip_all, fields(run_id = %run.id, scope = %run.scope_key()))]
    async fn execute(
        &self,
        run: AutomationRun,
        cancel: CancellationToken,
        progress: watch::Sender<RunCounters>,
    ) -> Result<AutomationRun> {
        let ctx = SourceContext {
            tenant_id: run.tenant_id,
            run_id: run.id,
            trigger: run.trigger,
            cursor: self.resume_cursor(run.tenant_id).await,
        };
        let mut state = RunState::new(run, &self.config, progress);
        if let Some(cursor) = ctx.cursor.clone() {
            tracing::info!(cursor = %cursor.value, "resuming from cursor");
            state.details.set_cursor(cursor);
        }

        let mut stream = match self.source.open(&ctx).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "source could not be opened");
                let failure = RunFailure::new(FailureReason::SourceUnavailable, e.to_string());
                return self.finish(state, &ctx, Some(failure)).await;
            }
        };

        match self.drive(&mut state, &mut stream, &cancel).await {
            Stop::Finished => self.finish(state, &ctx, None).await,
            Stop::Failed(failure) => self.finish(state, &ctx, Some(failure)).await,
            Stop::FinalizedElsewhere => {
                tracing::warn!("run was finalized by another actor; stopping");
                self.runs
                    .get_run(state.run.tenant_id, state.run.id)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("automation run {}", state.run.id)))
            }
        }
    }

    async fn resume_cursor(&self, tenant_id: Option<TenantId>) -> Option<SourceCursor> {
        if !self.config.resume_from_cursor {
            return None;
        }
        match self.runs.latest_cursor(tenant_id).await {
            Ok(cursor) => cursor,
            Err(e) => {
                tracing::warn!(error = %e, "could not load resume cursor; rescanning");
                None
            }
        }
    }

    async fn drive(
        &self,
        state: &mut RunState,
        stream: &mut CandidateStream,
        cancel: &CancellationToken,
    ) -> Stop {
        loop {
            let (batch, pull_stop) = self.pull_batch(state, stream, cancel).await;
            let pull_stop = match pull_stop {
                Some(PullStop::Halt(stop)) => return stop,
                Some(PullStop::Cancelled) => {
                    return Stop::Failed(RunFailure::bare(FailureReason::Cancelled));
                }
                Some(PullStop::Timeout) => {
                    return Stop::Failed(RunFailure::bare(FailureReason::Timeout));
                }
                other => other,
            };

            if !batch.is_empty() {
                if let Some(stop) = self.process_batch(state, batch, cancel).await {
                    return stop;
                }
            }

            match pull_stop {
                Some(PullStop::End) => return Stop::Finished,
                Some(PullStop::Failed(message)) => {
                    tracing::warn!(error = %message, "source failed mid-stream");
                    return Stop::Failed(RunFailure::new(FailureReason::SourceFailed, message));
                }
                _ => {}
            }
            if cancel.is_cancelled() {
                return Stop::Failed(RunFailure::bare(FailureReason::Cancelled));
            }
            if Instant::now() >= state.deadline {
                return Stop::Failed(RunFailure::bare(FailureReason::Timeout));
            }
        }
    }

    /// Pull up to `batch_size` candidates, heartbeating while the source is slow.
    async fn pull_batch(
        &self,
        state: &mut RunState,
        stream: &mut CandidateStream,
        cancel: &CancellationToken,
    ) -> (Vec<Candidate>, Option<PullStop>) {
        let mut batch = Vec::with_capacity(self.config.batch_size);
        while batch.len() < self.config.batch_size {
            let heartbeat_at = later(state.last_flush, self.config.flush_interval);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return (batch, Some(PullStop::Cancelled)),
                _ = tokio::time::sleep_until(state.deadline) => {
                    return (batch, Some(PullStop::Timeout));
                }
                next = stream.next() => match next {
                    Some(Ok(candidate)) => batch.push(candidate),
                    Some(Err(e)) => return (batch, Some(PullStop::Failed(e.to_string()))),
                    None => return (batch, Some(PullStop::End)),
                },
                _ = tokio::time::sleep_until(heartbeat_at) => {
                    match self.flush(state).await {
                        Ok(true) => {}
                        Ok(false) => return (batch, Some(PullStop::Halt(Stop::FinalizedElsewhere))),
                        Err(e) => {
                            let failure = RunFailure::new(FailureReason::StoreUnavailable, e.to_string());
                            return (batch, Some(PullStop::Halt(Stop::Failed(failure))));
                        }
                    }
                }
            }
        }
        (batch, None)
    }

    /// Reconcile a batch with bounded concurrency, recording outcomes in stream order.
    ///
    /// Stopping (cancel, timeout, threshold, store failure) lets applies that already
    /// started run to completion; candidates not yet started are left unprocessed.
    async fn process_batch(
        &self,
        state: &mut RunState,
        batch: Vec<Candidate>,
        cancel: &CancellationToken,
    ) -> Option<Stop> {
        let halt = cancel.child_token();
        let deadline = state.deadline;
        let scope = ApplyScope {
            tenant_id: state.run.tenant_id,
            run_id: state.run.id,
        };

        let items = batch.into_iter().map(|candidate| {
            let reconciler = self.reconciler.clone();
            let halt = halt.clone();
            async move {
                if halt.is_cancelled() || Instant::now() >= deadline {
                    return (candidate, None);
                }
                let outcome = reconciler.reconcile(scope, &candidate).await;
                (candidate, Some(outcome))
            }
        });
        let mut results =
            std::pin::pin!(futures_util::stream::iter(items).buffered(self.config.apply_concurrency));

        let mut stop = None;
        let mut skipped = 0usize;
        while let Some((candidate, outcome)) = results.next().await {
            let Some(outcome) = outcome else {
                skipped += 1;
                continue;
            };
            state.record(candidate.cursor, &outcome);

            if stop.is_some() {
                continue;
            }
            if state.consecutive_apply_failures >= self.config.max_consecutive_apply_failures {
                tracing::warn!(
                    failures = state.consecutive_apply_failures,
                    "apply failure threshold reached; aborting run"
                );
                stop = Some(Stop::Failed(RunFailure::new(
                    FailureReason::ApplyFailureThreshold,
                    format!(
                        "{} consecutive apply failures",
                        state.consecutive_apply_failures
                    ),
                )));
                halt.cancel();
                continue;
            }
            if state.flush_due(&self.config) {
                match self.flush(state).await {
                    Ok(true) => {}
                    Ok(false) => {
                        stop = Some(Stop::FinalizedElsewhere);
                        halt.cancel();
                    }
                    Err(e) => {
                        stop = Some(Stop::Failed(RunFailure::new(
                            FailureReason::StoreUnavailable,
                            e.to_string(),
                        )));
                        halt.cancel();
                    }
                }
            }
        }

        // Unstarted candidates only count as handled when the run is failing anyway.
        if stop.is_none() && skipped > 0 {
            let reason = if cancel.is_cancelled() {
                FailureReason::Cancelled
            } else {
                FailureReason::Timeout
            };
            tracing::debug!(skipped, %reason, "batch stopped before every candidate started");
            stop = Some(Stop::Failed(RunFailure::bare(reason)));
        }
        stop
    }

    /// Write interim counters. `Ok(false)` means the run is no longer running.
    async fn flush(&self, state: &mut RunState) -> Result<bool> {
        let still_running = self
            .runs
            .update_counters(
                state.run.tenant_id,
                state.run.id,
                &state.counters,
                Utc::now(),
            )
            .await
            .inspect_err(|e| tracing::warn!(error = %e, "counter flush failed"))?;
        state.last_flush = Instant::now();
        state.since_flush = 0;
        Ok(still_running)
    }

    async fn finish(
        &self,
        mut state: RunState,
        ctx: &SourceContext,
        failure: Option<RunFailure>,
    ) -> Result<AutomationRun> {
        let mut source = serde_json::json!({ "adapter": self.source.id() });
        if let Some(meta) = self.source.metadata(ctx).await {
            source["metadata"] = meta;
        }
        state.details.set_source(source);

        let status = if failure.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        let elapsed = state.started.elapsed();
        let details = state.details.finish(state.run.trigger, elapsed, failure);

        let result = self
            .runs
            .finalize_run(
                state.run.tenant_id,
                state.run.id,
                status,
                &state.counters,
                Some(details),
                Utc::now(),
            )
            .await;

        match result {
            Ok(run) => {
                tracing::info!(
                    status = %run.status,
                    processed = run.counters.processed,
                    created = run.counters.created,
                    updated = run.counters.updated,
                    skipped = run.counters.skipped,
                    errors = run.counters.errors,
                    "automation run finalized"
                );
                Ok(run)
            }
            Err(Error::InvalidTransition { .. }) => {
                tracing::warn!("run was finalized concurrently; keeping stored outcome");
                self.runs
                    .get_run(state.run.tenant_id, state.run.id)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("automation run {}", state.run.id)))
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "could not finalize run; leaving it for the recovery sweep"
                );
                Err(e)
            }
        }
    }
}

/// `from + d`, clamped to roughly 30 years out instead of overflowing.
fn later(from: Instant, d: Duration) -> Instant {
    from.checked_add(d)
        .unwrap_or_else(|| from + Duration::from_secs(86_400 * 365 * 30))
}

/// Finalize a running run as `failed` / `reason = "cancelled"` directly in the store.
///
/// Used for runs this process does not execute. Their executor sees the
/// terminal row on its next flush and stops.
#[tracing::instrument(level = "info", skip(runs))]
pub async fn cancel_in_store(
    runs: &dyn RunStore,
    tenant_id: Option<TenantId>,
    run_id: Uuid,
) -> Result<AutomationRun> {
    let run = runs
        .get_run(tenant_id, run_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("automation run {run_id}")))?;
    if run.status.is_terminal() {
        return Err(Error::InvalidTransition {
            run_id,
            from: run.status,
            to: RunStatus::Failed,
        });
    }

    let details = RunFailure::bare(FailureReason::Cancelled).into_details();
    let run = runs
        .finalize_run(
            tenant_id,
            run_id,
            RunStatus::Failed,
            &run.counters,
            Some(details),
            Utc::now(),
        )
        .await?;
    tracing::info!(run_id = %run_id, "automation run cancelled in store");
    Ok(run)
}
