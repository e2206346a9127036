//! SQLite-backed run and record store.
//!
//! Timestamps are stored as fixed-width RFC 3339 strings so that text
//! ordering matches time ordering. JSON columns are stored as TEXT.

use crate::automation::models::{
    AutomationRun, RunCounters, RunQuery, RunStatus, RunTrigger, StoredRecord,
};
use crate::automation::traits::{RecordPatch, RecordStore, RunStore};
use crate::models::{TenantId, scope_key};
use crate::store::{db_err, details_text, is_unique_violation, parse_details, sql_int};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS automation_runs (
    id TEXT PRIMARY KEY,
    tenant_id TEXT,
    scope_key TEXT NOT NULL,
    trigger TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    processed_count INTEGER NOT NULL DEFAULT 0,
    created_count INTEGER NOT NULL DEFAULT 0,
    updated_count INTEGER NOT NULL DEFAULT 0,
    skipped_count INTEGER NOT NULL DEFAULT 0,
    error_count INTEGER NOT NULL DEFAULT 0,
    details TEXT,
    last_flushed_at TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS automation_runs_one_running
    ON automation_runs(scope_key) WHERE status = 'running';

CREATE INDEX IF NOT EXISTS automation_runs_scope_started
    ON automation_runs(scope_key, started_at);

CREATE INDEX IF NOT EXISTS automation_runs_heartbeat
    ON automation_runs(status, last_flushed_at);

CREATE TABLE IF NOT EXISTS automation_records (
    id TEXT PRIMARY KEY,
    tenant_id TEXT,
    scope_key TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    natural_key TEXT NOT NULL,
    attributes TEXT NOT NULL,
    version INTEGER NOT NULL,
    created_by_run TEXT,
    updated_by_run TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (scope_key, entity_type, natural_key)
);
"#;

const RUN_COLUMNS: &str = "id, tenant_id, trigger, status, started_at, completed_at, \
     processed_count, created_count, updated_count, skipped_count, error_count, \
     details, last_flushed_at, created_at";

const RECORD_COLUMNS: &str = "id, tenant_id, entity_type, natural_key, attributes, version, \
     created_by_run, updated_by_run, created_at, updated_at";

/// Durable store backed by a single SQLite database.
///
/// Exclusivity comes from the partial unique index on `scope_key` over
/// running rows, so concurrent acquirers on the same file cannot both win.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    #[tracing::instrument(level = "debug", skip(path), fields(db_path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::backend("sqlite_store", e))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path.display()))
            .map_err(|e| Error::backend("sqlite_store", e))?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
            .map_err(|e| db_err("sqlite_store connect", e))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database. One connection, so every query sees the same data.
    #[tracing::instrument(level = "debug")]
    pub async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| Error::backend("sqlite_store", e))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .map_err(|e| db_err("sqlite_store connect", e))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("sqlite_store migration", e))?;
        Ok(())
    }

    async fn active_run_id(&self, scope: &str) -> Option<Uuid> {
        let row = sqlx::query(
            "SELECT id FROM automation_runs WHERE scope_key = ?1 AND status = 'running'",
        )
        .bind(scope)
        .fetch_optional(&self.pool)
        .await
        .ok()??;
        let id: String = row.try_get("id").ok()?;
        Uuid::parse_str(&id).ok()
    }

    async fn status_of(&self, scope: &str, run_id: Uuid) -> Result<Option<RunStatus>> {
        let row = sqlx::query("SELECT status FROM automation_runs WHERE id = ?1 AND scope_key = ?2")
            .bind(run_id.to_string())
            .bind(scope)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("sqlite_store run status", e))?;
        row.map(|r| {
            let status: String = r
                .try_get("status")
                .map_err(|e| Error::backend("status", e))?;
            status.parse::<RunStatus>()
        })
        .transpose()
    }
}

fn fmt_dt(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_dt(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| Error::backend("timestamp", e))
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| Error::backend("uuid", e))
}

fn get<'r, T>(row: &'r SqliteRow, col: &str) -> Result<T>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(col).map_err(|e| Error::backend(col.to_string(), e))
}

fn count(row: &SqliteRow, col: &str) -> Result<u64> {
    let n: i64 = get(row, col)?;
    Ok(n.max(0) as u64)
}

fn run_from_row(row: &SqliteRow) -> Result<AutomationRun> {
    let tenant_id: Option<String> = get(row, "tenant_id")?;
    let trigger: String = get(row, "trigger")?;
    let status: String = get(row, "status")?;
    let completed_at: Option<String> = get(row, "completed_at")?;
    let details: Option<String> = get(row, "details")?;
    Ok(AutomationRun {
        id: parse_uuid(&get::<String>(row, "id")?)?,
        tenant_id: tenant_id
            .as_deref()
            .map(parse_uuid)
            .transpose()?
            .map(TenantId),
        trigger: trigger
            .parse::<RunTrigger>()
            .map_err(|_| Error::BackendMessage(format!("invalid run trigger in db: {trigger}")))?,
        status: status.parse::<RunStatus>()?,
        started_at: parse_dt(&get::<String>(row, "started_at")?)?,
        completed_at: completed_at.as_deref().map(parse_dt).transpose()?,
        counters: RunCounters {
            processed: count(row, "processed_count")?,
            created: count(row, "created_count")?,
            updated: count(row, "updated_count")?,
            skipped: count(row, "skipped_count")?,
            errors: count(row, "error_count")?,
        },
        details: parse_details(details.as_deref())?,
        last_flushed_at: parse_dt(&get::<String>(row, "last_flushed_at")?)?,
        created_at: parse_dt(&get::<String>(row, "created_at")?)?,
    })
}

fn record_from_row(row: &SqliteRow) -> Result<StoredRecord> {
    let tenant_id: Option<String> = get(row, "tenant_id")?;
    let attributes: String = get(row, "attributes")?;
    let created_by: Option<String> = get(row, "created_by_run")?;
    let updated_by: Option<String> = get(row, "updated_by_run")?;
    Ok(StoredRecord {
        id: parse_uuid(&get::<String>(row, "id")?)?,
        tenant_id: tenant_id
            .as_deref()
            .map(parse_uuid)
            .transpose()?
            .map(TenantId),
        entity_type: get(row, "entity_type")?,
        key: get(row, "natural_key")?,
        attributes: serde_json::from_str(&attributes)
            .map_err(|e| Error::backend("attributes", e))?,
        version: get(row, "version")?,
        created_by_run: created_by.as_deref().map(parse_uuid).transpose()?,
        updated_by_run: updated_by.as_deref().map(parse_uuid).transpose()?,
        created_at: parse_dt(&get::<String>(row, "created_at")?)?,
        updated_at: parse_dt(&get::<String>(row, "updated_at")?)?,
    })
}

#[async_trait]
impl RunStore for SqliteStore {
    #[tracing::instrument(level = "debug", skip_all, fields(run_id = %run.id))]
    async fn try_acquire_run_slot(&self, run: &AutomationRun) -> Result<()> {
        if run.status != RunStatus::Running {
            return Err(Error::InvalidInput(
                "only running runs can acquire a slot".to_string(),
            ));
        }
        let scope = run.scope_key();
        let res = sqlx::query(
            "INSERT INTO automation_runs (id, tenant_id, scope_key, trigger, status, started_at,
             completed_at, processed_count, created_count, updated_count, skipped_count,
             error_count, details, last_flushed_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, 0, 0, 0, 0, 0, ?7, ?8, ?9)",
        )
        .bind(run.id.to_string())
        .bind(run.tenant_id.map(|t| t.to_string()))
        .bind(&scope)
        .bind(run.trigger.as_str())
        .bind(run.status.as_str())
        .bind(fmt_dt(run.started_at))
        .bind(details_text(run.details.as_ref())?)
        .bind(fmt_dt(run.last_flushed_at))
        .bind(fmt_dt(run.created_at))
        .execute(&self.pool)
        .await;

        match res {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(Error::RunAlreadyActive {
                active_run_id: self.active_run_id(&scope).await,
                scope,
            }),
            Err(e) => Err(db_err("sqlite_store acquire run slot", e)),
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(run_id = %run_id))]
    async fn update_counters(
        &self,
        tenant_id: Option<TenantId>,
        run_id: Uuid,
        counters: &RunCounters,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let scope = scope_key(tenant_id);
        let res = sqlx::query(
            "UPDATE automation_runs SET processed_count = ?1, created_count = ?2,
             updated_count = ?3, skipped_count = ?4, error_count = ?5, last_flushed_at = ?6
             WHERE id = ?7 AND scope_key = ?8 AND status = 'running'",
        )
        .bind(sql_int(counters.processed))
        .bind(sql_int(counters.created))
        .bind(sql_int(counters.updated))
        .bind(sql_int(counters.skipped))
        .bind(sql_int(counters.errors))
        .bind(fmt_dt(at))
        .bind(run_id.to_string())
        .bind(&scope)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("sqlite_store update counters", e))?;

        if res.rows_affected() > 0 {
            return Ok(true);
        }
        match self.status_of(&scope, run_id).await? {
            Some(_) => Ok(false),
            None => Err(Error::NotFound(format!("automation run {run_id}"))),
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(run_id = %run_id, status = %status))]
    async fn finalize_run(
        &self,
        tenant_id: Option<TenantId>,
        run_id: Uuid,
        status: RunStatus,
        counters: &RunCounters,
        details: Option<serde_json::Value>,
        at: DateTime<Utc>,
    ) -> Result<AutomationRun> {
        if !status.is_terminal() {
            return Err(Error::InvalidTransition {
                run_id,
                from: RunStatus::Running,
                to: status,
            });
        }
        let scope = scope_key(tenant_id);
        let sql = format!(
            "UPDATE automation_runs SET status = ?1, completed_at = ?2, processed_count = ?3,
             created_count = ?4, updated_count = ?5, skipped_count = ?6, error_count = ?7,
             details = ?8, last_flushed_at = ?2
             WHERE id = ?9 AND scope_key = ?10 AND status = 'running'
             RETURNING {RUN_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(fmt_dt(at))
            .bind(sql_int(counters.processed))
            .bind(sql_int(counters.created))
            .bind(sql_int(counters.updated))
            .bind(sql_int(counters.skipped))
            .bind(sql_int(counters.errors))
            .bind(details_text(details.as_ref())?)
            .bind(run_id.to_string())
            .bind(&scope)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("sqlite_store finalize run", e))?;

        match row {
            Some(row) => run_from_row(&row),
            None => match self.status_of(&scope, run_id).await? {
                Some(from) => Err(Error::InvalidTransition {
                    run_id,
                    from,
                    to: status,
                }),
                None => Err(Error::NotFound(format!("automation run {run_id}"))),
            },
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_run(
        &self,
        tenant_id: Option<TenantId>,
        run_id: Uuid,
    ) -> Result<Option<AutomationRun>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM automation_runs WHERE id = ?1 AND scope_key = ?2"
        );
        let row = sqlx::query(&sql)
            .bind(run_id.to_string())
            .bind(scope_key(tenant_id))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("sqlite_store get run", e))?;
        row.as_ref().map(run_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_active_run(&self, tenant_id: Option<TenantId>) -> Result<Option<AutomationRun>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM automation_runs
             WHERE scope_key = ?1 AND status = 'running'"
        );
        let row = sqlx::query(&sql)
            .bind(scope_key(tenant_id))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("sqlite_store get active run", e))?;
        row.as_ref().map(run_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_runs(
        &self,
        tenant_id: Option<TenantId>,
        query: RunQuery,
    ) -> Result<Vec<AutomationRun>> {
        let mut conditions = vec!["scope_key = ?1".to_string()];
        let mut next_param = 2;
        if query.status.is_some() {
            conditions.push(format!("status = ?{next_param}"));
            next_param += 1;
        }
        if query.trigger.is_some() {
            conditions.push(format!("trigger = ?{next_param}"));
            next_param += 1;
        }

        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM automation_runs WHERE {}
             ORDER BY started_at DESC, id DESC
             LIMIT ?{next_param} OFFSET ?{}",
            conditions.join(" AND "),
            next_param + 1,
        );

        let mut q = sqlx::query(&sql).bind(scope_key(tenant_id));
        if let Some(status) = query.status {
            q = q.bind(status.as_str());
        }
        if let Some(trigger) = query.trigger {
            q = q.bind(trigger.as_str());
        }
        q = q.bind(sql_int(query.limit));
        q = q.bind(sql_int(query.offset));

        let rows = q
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("sqlite_store list runs", e))?;
        rows.iter().map(run_from_row).collect()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_stale_runs(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AutomationRun>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM automation_runs
             WHERE status = 'running' AND last_flushed_at < ?1
             ORDER BY last_flushed_at ASC
             LIMIT ?2"
        );
        let rows = sqlx::query(&sql)
            .bind(fmt_dt(older_than))
            .bind(sql_int(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("sqlite_store list stale runs", e))?;
        rows.iter().map(run_from_row).collect()
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_record(
        &self,
        tenant_id: Option<TenantId>,
        entity_type: &str,
        key: &str,
    ) -> Result<Option<StoredRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM automation_records
             WHERE scope_key = ?1 AND entity_type = ?2 AND natural_key = ?3"
        );
        let row = sqlx::query(&sql)
            .bind(scope_key(tenant_id))
            .bind(entity_type)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("sqlite_store get record", e))?;
        row.as_ref().map(record_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(key = %record.key))]
    async fn insert_record(&self, record: &StoredRecord) -> Result<()> {
        let attributes = serde_json::to_string(&record.attributes)
            .map_err(|e| Error::backend("serialize attributes", e))?;
        let res = sqlx::query(
            "INSERT INTO automation_records (id, tenant_id, scope_key, entity_type, natural_key,
             attributes, version, created_by_run, updated_by_run, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )
        .bind(record.id.to_string())
        .bind(record.tenant_id.map(|t| t.to_string()))
        .bind(scope_key(record.tenant_id))
        .bind(&record.entity_type)
        .bind(&record.key)
        .bind(attributes)
        .bind(record.version)
        .bind(record.created_by_run.map(|r| r.to_string()))
        .bind(record.updated_by_run.map(|r| r.to_string()))
        .bind(fmt_dt(record.created_at))
        .bind(fmt_dt(record.updated_at))
        .execute(&self.pool)
        .await;

        match res {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(Error::Conflict(format!(
                "{} '{}' already exists",
                record.entity_type, record.key
            ))),
            Err(e) => Err(db_err("sqlite_store insert record", e)),
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(record_id = %patch.record_id))]
    async fn update_record(
        &self,
        tenant_id: Option<TenantId>,
        patch: &RecordPatch,
    ) -> Result<StoredRecord> {
        let scope = scope_key(tenant_id);
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_err("sqlite_store begin", e))?;

        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM automation_records WHERE id = ?1 AND scope_key = ?2"
        );
        let row = sqlx::query(&sql)
            .bind(patch.record_id.to_string())
            .bind(&scope)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| db_err("sqlite_store load record", e))?
            .ok_or_else(|| Error::NotFound(format!("record {}", patch.record_id)))?;
        let mut record = record_from_row(&row)?;

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

        let attributes = serde_json::to_string(&record.attributes)
            .map_err(|e| Error::backend("serialize attributes", e))?;
        let res = sqlx::query(
            "UPDATE automation_records SET attributes = ?1, version = ?2, updated_by_run = ?3,
             updated_at = ?4 WHERE id = ?5 AND version = ?6",
        )
        .bind(attributes)
        .bind(record.version)
        .bind(patch.run_id.to_string())
        .bind(fmt_dt(patch.at))
        .bind(patch.record_id.to_string())
        .bind(patch.expected_version)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_err("sqlite_store update record", e))?;
        if res.rows_affected() == 0 {
            return Err(Error::Conflict(format!(
                "record {} changed concurrently",
                patch.record_id
            )));
        }

        tx.commit()
            .await
            .map_err(|e| db_err("sqlite_store commit", e))?;
        Ok(record)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_records(
        &self,
        tenant_id: Option<TenantId>,
        entity_type: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoredRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM automation_records
             WHERE scope_key = ?1 AND entity_type = ?2
             ORDER BY natural_key ASC
             LIMIT ?3 OFFSET ?4"
        );
        let rows = sqlx::query(&sql)
            .bind(scope_key(tenant_id))
            .bind(entity_type)
            .bind(sql_int(limit))
            .bind(sql_int(offset))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("sqlite_store list records", e))?;
        rows.iter().map(record_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_sort_as_text() {
        let a = "2026-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let b = a + chrono::Duration::milliseconds(1500);
        assert!(fmt_dt(a) < fmt_dt(b));
        assert_eq!(fmt_dt(a).len(), fmt_dt(b).len());
        assert_eq!(parse_dt(&fmt_dt(b)).unwrap(), b);
    }
}
