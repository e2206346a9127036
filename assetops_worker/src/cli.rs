use assetops_core::{RunStatus, RunTrigger, TenantId};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(
    name = "assetops-worker",
    version,
    about = "AssetOps automation worker (local trigger gateway)"
)]
pub struct Cli {
    /// Data directory for the SQLite store, used when no database URL is configured.
    #[arg(
        long,
        global = true,
        env = "ASSETOPS_DATA_DIR",
        default_value = ".assetops"
    )]
    pub data_dir: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

/// `--tenant <uuid>` or `--system`, exactly one.
#[derive(Debug, Clone, Args)]
#[group(required = true, multiple = false)]
pub struct ScopeArgs {
    #[arg(long)]
    pub tenant: Option<TenantId>,

    /// Act on the system-wide scope instead of a tenant.
    #[arg(long)]
    pub system: bool,
}

impl ScopeArgs {
    pub fn tenant_id(&self) -> Option<TenantId> {
        if self.system { None } else { self.tenant }
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create the run and record tables in the configured store.
    Migrate,

    /// Execute one run and print the final record as JSON.
    Run {
        #[command(flatten)]
        scope: ScopeArgs,

        #[arg(long, default_value = "manual")]
        trigger: RunTrigger,

        /// JSON-lines candidate file.
        #[arg(long)]
        source: PathBuf,

        /// Reconcile spec (JSON).
        #[arg(long)]
        spec: PathBuf,
    },

    /// Trigger `scheduled` runs periodically until interrupted.
    Schedule {
        /// Tenants to schedule (repeatable).
        #[arg(long = "tenant", required_unless_present = "system")]
        tenants: Vec<TenantId>,

        /// Also schedule the system-wide scope.
        #[arg(long)]
        system: bool,

        #[arg(long, default_value = "300")]
        interval_secs: u64,

        /// Directory holding `<tenant id>.jsonl` (and `system.jsonl`) candidate files.
        #[arg(long)]
        source_dir: PathBuf,

        #[arg(long)]
        spec: PathBuf,
    },

    /// Fail runs whose executor stopped sending heartbeats.
    Sweep,

    /// List runs for a scope, newest first.
    Runs {
        #[command(flatten)]
        scope: ScopeArgs,

        #[arg(long)]
        status: Option<RunStatus>,

        #[arg(long)]
        trigger: Option<RunTrigger>,

        #[arg(long, default_value = "50")]
        limit: usize,

        #[arg(long, default_value = "0")]
        offset: usize,
    },

    /// Cancel a running run.
    Cancel {
        #[command(flatten)]
        scope: ScopeArgs,

        #[arg(long)]
        run_id: Uuid,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_requires_tenant_or_system() {
        assert!(Cli::try_parse_from(["assetops-worker", "runs"]).is_err());
        assert!(
            Cli::try_parse_from([
                "assetops-worker",
                "runs",
                "--system",
                "--tenant",
                "6f1d5a7e-1d2b-4c3a-9e8f-0a1b2c3d4e5f",
            ])
            .is_err()
        );

        let cli = Cli::try_parse_from(["assetops-worker", "runs", "--system"]).unwrap();
        match cli.command {
            Commands::Runs { scope, limit, .. } => {
                assert_eq!(scope.tenant_id(), None);
                assert_eq!(limit, 50);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn run_parses_trigger_and_tenant() {
        let tenant = "6f1d5a7e-1d2b-4c3a-9e8f-0a1b2c3d4e5f";
        let cli = Cli::try_parse_from([
            "assetops-worker",
            "run",
            "--tenant",
            tenant,
            "--trigger",
            "scheduled",
            "--source",
            "in.jsonl",
            "--spec",
            "spec.json",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { scope, trigger, .. } => {
                assert_eq!(scope.tenant_id(), Some(tenant.parse().unwrap()));
                assert_eq!(trigger, RunTrigger::Scheduled);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn schedule_accepts_many_tenants() {
        let cli = Cli::try_parse_from([
            "assetops-worker",
            "schedule",
            "--tenant",
            "6f1d5a7e-1d2b-4c3a-9e8f-0a1b2c3d4e5f",
            "--tenant",
            "0b7c2d4e-5f60-4a1b-8c9d-e0f1a2b3c4d5",
            "--source-dir",
            "feeds",
            "--spec",
            "spec.json",
        ])
        .unwrap();
        match cli.command {
            Commands::Schedule {
                tenants,
                system,
                interval_secs,
                ..
            } => {
                assert_eq!(tenants.len(), 2);
                assert!(!system);
                assert_eq!(interval_secs, 300);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
