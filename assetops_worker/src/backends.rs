//! Store wiring for the worker: Postgres when a database URL is configured,
//! otherwise a SQLite file under the data directory.

use assetops_core::store::config::StoreConfig;
use assetops_core::store::postgres::PostgresStore;
use assetops_core::store::sqlite::SqliteStore;
use assetops_core::{RecordStore, RunStore};
use std::path::Path;
use std::sync::Arc;

#[derive(Clone)]
enum Concrete {
    Postgres(PostgresStore),
    Sqlite(SqliteStore),
}

/// The run and record stores the coordinator talks to. Both views share one pool.
#[derive(Clone)]
pub struct Backends {
    pub kind: &'static str,
    pub runs: Arc<dyn RunStore>,
    pub records: Arc<dyn RecordStore>,
    concrete: Concrete,
}

impl Backends {
    #[tracing::instrument(level = "info", skip_all, fields(kind = cfg.kind()))]
    pub async fn connect(cfg: &StoreConfig) -> anyhow::Result<Self> {
        let concrete = match cfg {
            StoreConfig::Postgres(pg) => Concrete::Postgres(PostgresStore::connect(pg).await?),
            StoreConfig::Sqlite { path } => Concrete::Sqlite(SqliteStore::open(path).await?),
        };
        let (runs, records): (Arc<dyn RunStore>, Arc<dyn RecordStore>) = match &concrete {
            Concrete::Postgres(s) => (Arc::new(s.clone()), Arc::new(s.clone())),
            Concrete::Sqlite(s) => (Arc::new(s.clone()), Arc::new(s.clone())),
        };
        Ok(Self {
            kind: cfg.kind(),
            runs,
            records,
            concrete,
        })
    }

    /// Resolve the store from `ASSETOPS_DATABASE_URL` / `DATABASE_URL`, falling back
    /// to `{data_dir}/assetops.db`.
    pub async fn from_env(data_dir: &Path) -> anyhow::Result<Self> {
        let cfg = StoreConfig::from_env(data_dir)?;
        Self::connect(&cfg).await
    }

    /// Apply the schema. Idempotent.
    #[tracing::instrument(level = "info", skip(self), fields(kind = self.kind))]
    pub async fn migrate(&self) -> anyhow::Result<()> {
        match &self.concrete {
            Concrete::Postgres(s) => s.migrate().await?,
            Concrete::Sqlite(s) => s.migrate().await?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assetops_core::{AutomationRun, RunTrigger};
    use chrono::Utc;

    #[tokio::test]
    async fn sqlite_backends_share_one_database() {
        let dir = std::env::temp_dir().join(format!("assetops-backends-{}", uuid::Uuid::new_v4()));
        let cfg = StoreConfig::Sqlite {
            path: dir.join("assetops.db"),
        };
        let backends = Backends::connect(&cfg).await.unwrap();
        assert_eq!(backends.kind, "sqlite");
        backends.migrate().await.unwrap();

        let run = AutomationRun::new_running(None, RunTrigger::Manual, Utc::now());
        backends.runs.try_acquire_run_slot(&run).await.unwrap();

        let reopened = Backends::connect(&cfg).await.unwrap();
        let active = reopened.runs.get_active_run(None).await.unwrap().unwrap();
        assert_eq!(active.id, run.id);
    }
}
