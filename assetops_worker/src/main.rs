use assetops_core::source::JsonLinesSource;
use assetops_core::{
    EngineConfig, ReconcileSpec, Reconciler, RecoverySweep, RunCoordinator, RunQuery, RunStatus,
    RunStore, SourceAdapter, cancel_in_store,
};
use assetops_worker::backends::Backends;
use assetops_worker::cli::{Cli, Commands};
use assetops_worker::gateway::ScheduledGateway;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn load_spec(path: &Path) -> anyhow::Result<ReconcileSpec> {
    let raw = tokio::fs::read_to_string(path).await?;
    Ok(ReconcileSpec::from_json_str(&raw)?)
}

fn build_coordinator(
    backends: &Backends,
    source: Arc<dyn SourceAdapter>,
    spec: ReconcileSpec,
) -> anyhow::Result<RunCoordinator> {
    let config = EngineConfig::from_env()?;
    let reconciler = Reconciler::new(spec, backends.records.clone());
    Ok(RunCoordinator::new(
        backends.runs.clone(),
        source,
        reconciler,
        config,
    )?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    assetops_core::o11y::init_global_from_env()?;
    let cli = Cli::parse();
    let backends = Backends::from_env(&cli.data_dir).await?;

    match cli.command {
        Commands::Migrate => {
            backends.migrate().await?;
            tracing::info!(kind = backends.kind, "migrations applied");
        }
        Commands::Run {
            scope,
            trigger,
            source,
            spec,
        } => {
            let spec = load_spec(&spec).await?;
            let coordinator =
                build_coordinator(&backends, Arc::new(JsonLinesSource::file(source)), spec)?;
            let run = coordinator
                .run_to_completion(scope.tenant_id(), trigger)
                .await?;
            println!("{}", serde_json::to_string_pretty(&run)?);
            if run.status == RunStatus::Failed {
                anyhow::bail!(
                    "run {} failed: {}",
                    run.id,
                    run.detail("reason")
                        .and_then(|r| r.as_str())
                        .unwrap_or("unknown")
                );
            }
        }
        Commands::Schedule {
            tenants,
            system,
            interval_secs,
            source_dir,
            spec,
        } => {
            if interval_secs == 0 {
                anyhow::bail!("--interval-secs must be > 0");
            }
            let spec = load_spec(&spec).await?;
            let coordinator = build_coordinator(
                &backends,
                Arc::new(JsonLinesSource::per_scope_dir(source_dir)),
                spec,
            )?;

            let mut scopes: Vec<_> = tenants.into_iter().map(Some).collect();
            if system {
                scopes.push(None);
            }
            let gateway =
                ScheduledGateway::new(coordinator, scopes, Duration::from_secs(interval_secs));

            let shutdown = CancellationToken::new();
            let on_signal = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(%e, "failed to listen for ctrl-c");
                }
                on_signal.cancel();
            });
            gateway.run(shutdown).await;
        }
        Commands::Sweep => {
            let config = EngineConfig::from_env()?;
            let sweep = RecoverySweep::new(
                backends.runs.clone(),
                Default::default(),
                config.stale_after,
            );
            let swept = sweep.sweep(chrono::Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&swept)?);
        }
        Commands::Runs {
            scope,
            status,
            trigger,
            limit,
            offset,
        } => {
            let runs = backends
                .runs
                .list_runs(
                    scope.tenant_id(),
                    RunQuery {
                        status,
                        trigger,
                        limit,
                        offset,
                    },
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&runs)?);
        }
        Commands::Cancel { scope, run_id } => {
            let run = cancel_in_store(backends.runs.as_ref(), scope.tenant_id(), run_id).await?;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
    }

    Ok(())
}
