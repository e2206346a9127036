use crate::automation::models::{
    AutomationRun, RunCounters, RunQuery, RunStatus, RunTrigger, StoredRecord,
};
use crate::automation::traits::{RecordPatch, RecordStore, RunStore};
use crate::models::{TenantId, scope_key};
use crate::store::config::PostgresConfig;
use crate::store::{db_err, details_text, is_unique_violation, parse_details, sql_int};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

const MIGRATION_0001: &str = include_str!("../../migrations/0001_automation.sql");

const RUN_COLUMNS: &str = "id, tenant_id, trigger, status, started_at, completed_at, \
     processed_count, created_count, updated_count, skipped_count, error_count, \
     details, last_flushed_at, created_at";

const RECORD_COLUMNS: &str = "id, tenant_id, entity_type, natural_key, attributes, version, \
     created_by_run, updated_by_run, created_at, updated_at";

/// Run and record store for multi-instance deployments.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    #[tracing::instrument(level = "debug", skip(cfg))]
    pub async fn connect(cfg: &PostgresConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .acquire_timeout(cfg.acquire_timeout)
            .connect(&cfg.url)
            .await
            .map_err(|e| db_err("connect postgres", e))?;
        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(MIGRATION_0001)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("apply migrations", e))?;
        Ok(())
    }

    fn run_from_row(row: &PgRow) -> Result<AutomationRun> {
        let trigger: String = row
            .try_get("trigger")
            .map_err(|e| Error::backend("trigger", e))?;
        let status: String = row
            .try_get("status")
            .map_err(|e| Error::backend("status", e))?;
        Ok(AutomationRun {
            id: row.try_get("id").map_err(|e| Error::backend("id", e))?,
            tenant_id: row
                .try_get::<Option<Uuid>, _>("tenant_id")
                .map_err(|e| Error::backend("tenant_id", e))?
                .map(TenantId),
            trigger: trigger.parse::<RunTrigger>().map_err(|_| {
                Error::BackendMessage(format!("invalid run trigger in db: {trigger}"))
            })?,
            status: status.parse::<RunStatus>()?,
            started_at: row
                .try_get("started_at")
                .map_err(|e| Error::backend("started_at", e))?,
            completed_at: row
                .try_get("completed_at")
                .map_err(|e| Error::backend("completed_at", e))?,
            counters: RunCounters {
                processed: Self::count(row, "processed_count")?,
                created: Self::count(row, "created_count")?,
                updated: Self::count(row, "updated_count")?,
                skipped: Self::count(row, "skipped_count")?,
                errors: Self::count(row, "error_count")?,
            },
            details: parse_details(
                row.try_get::<Option<String>, _>("details")
                    .map_err(|e| Error::backend("details", e))?
                    .as_deref(),
            )?,
            last_flushed_at: row
                .try_get("last_flushed_at")
                .map_err(|e| Error::backend("last_flushed_at", e))?,
            created_at: row
                .try_get("created_at")
                .map_err(|e| Error::backend("created_at", e))?,
        })
    }

    fn count(row: &PgRow, col: &str) -> Result<u64> {
        let n: i64 = row
            .try_get(col)
            .map_err(|e| Error::backend(col.to_string(), e))?;
        Ok(n.max(0) as u64)
    }

    fn record_from_row(row: &PgRow) -> Result<StoredRecord> {
        let attributes: serde_json::Value = row
            .try_get("attributes")
            .map_err(|e| Error::backend("attributes", e))?;
        let attributes = match attributes {
            serde_json::Value::Object(m) => m,
            other => {
                return Err(Error::BackendMessage(format!(
                    "record attributes are not an object: {other}"
                )));
            }
        };
        Ok(StoredRecord {
            id: row.try_get("id").map_err(|e| Error::backend("id", e))?,
            tenant_id: row
                .try_get::<Option<Uuid>, _>("tenant_id")
                .map_err(|e| Error::backend("tenant_id", e))?
                .map(TenantId),
            entity_type: row
                .try_get("entity_type")
                .map_err(|e| Error::backend("entity_type", e))?,
            key: row
                .try_get("natural_key")
                .map_err(|e| Error::backend("natural_key", e))?,
            attributes,
            version: row
                .try_get("version")
                .map_err(|e| Error::backend("version", e))?,
            created_by_run: row
                .try_get("created_by_run")
                .map_err(|e| Error::backend("created_by_run", e))?,
            updated_by_run: row
                .try_get("updated_by_run")
                .map_err(|e| Error::backend("updated_by_run", e))?,
            created_at: row
                .try_get("created_at")
                .map_err(|e| Error::backend("created_at", e))?,
            updated_at: row
                .try_get("updated_at")
                .map_err(|e| Error::backend("updated_at", e))?,
        })
    }

    async fn active_run_id(&self, scope: &str) -> Option<Uuid> {
        sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM automation_runs WHERE scope_key = $1 AND status = 'running'",
        )
        .bind(scope)
        .fetch_optional(&self.pool)
        .await
        .ok()
        .flatten()
    }

    async fn status_of(&self, scope: &str, run_id: Uuid) -> Result<Option<RunStatus>> {
        let status = sqlx::query_scalar::<_, String>(
            "SELECT status FROM automation_runs WHERE id = $1 AND scope_key = $2",
        )
        .bind(run_id)
        .bind(scope)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err("load run status", e))?;
        status.map(|s| s.parse::<RunStatus>()).transpose()
    }
}

#[async_trait]
impl RunStore for PostgresStore {
    #[tracing::instrument(level = "debug", skip_all, fields(run_id = %run.id))]
    async fn try_acquire_run_slot(&self, run: &AutomationRun) -> Result<()> {
        if run.status != RunStatus::Running {
            return Err(Error::InvalidInput(
                "only running runs can acquire a slot".to_string(),
            ));
        }
        let scope = run.scope_key();
        let res = sqlx::query(
            r#"
            INSERT INTO automation_runs (id, tenant_id, scope_key, trigger, status, started_at,
                completed_at, details, last_flushed_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, NULL, $7, $8, $9)
            "#,
        )
        .bind(run.id)
        .bind(run.tenant_id.map(|t| t.0))
        .bind(&scope)
        .bind(run.trigger.as_str())
        .bind(run.status.as_str())
        .bind(run.started_at)
        .bind(details_text(run.details.as_ref())?)
        .bind(run.last_flushed_at)
        .bind(run.created_at)
        .execute(&self.pool)
        .await;

        match res {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(Error::RunAlreadyActive {
                active_run_id: self.active_run_id(&scope).await,
                scope,
            }),
            Err(e) => Err(db_err("acquire run slot", e)),
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
            r#"
            UPDATE automation_runs
            SET processed_count = $1, created_count = $2, updated_count = $3,
                skipped_count = $4, error_count = $5, last_flushed_at = $6
            WHERE id = $7 AND scope_key = $8 AND status = 'running'
            "#,
        )
        .bind(sql_int(counters.processed))
        .bind(sql_int(counters.created))
        .bind(sql_int(counters.updated))
        .bind(sql_int(counters.skipped))
        .bind(sql_int(counters.errors))
        .bind(at)
        .bind(run_id)
        .bind(&scope)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("update run counters", e))?;

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
            r#"
            UPDATE automation_runs
            SET status = $1, completed_at = $2, processed_count = $3, created_count = $4,
                updated_count = $5, skipped_count = $6, error_count = $7, details = $8,
                last_flushed_at = $2
            WHERE id = $9 AND scope_key = $10 AND status = 'running'
            RETURNING {RUN_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(at)
            .bind(sql_int(counters.processed))
            .bind(sql_int(counters.created))
            .bind(sql_int(counters.updated))
            .bind(sql_int(counters.skipped))
            .bind(sql_int(counters.errors))
            .bind(details_text(details.as_ref())?)
            .bind(run_id)
            .bind(&scope)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("finalize run", e))?;

        match row {
            Some(row) => Self::run_from_row(&row),
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
            "SELECT {RUN_COLUMNS} FROM automation_runs WHERE id = $1 AND scope_key = $2"
        );
        let row = sqlx::query(&sql)
            .bind(run_id)
            .bind(scope_key(tenant_id))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("get run", e))?;
        row.as_ref().map(Self::run_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_active_run(&self, tenant_id: Option<TenantId>) -> Result<Option<AutomationRun>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM automation_runs WHERE scope_key = $1 AND status = 'running'"
        );
        let row = sqlx::query(&sql)
            .bind(scope_key(tenant_id))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("get active run", e))?;
        row.as_ref().map(Self::run_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_runs(
        &self,
        tenant_id: Option<TenantId>,
        query: RunQuery,
    ) -> Result<Vec<AutomationRun>> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {RUN_COLUMNS} FROM automation_runs WHERE scope_key = "
        ));
        qb.push_bind(scope_key(tenant_id));
        if let Some(status) = query.status {
            qb.push(" AND status = ");
            qb.push_bind(status.as_str());
        }
        if let Some(trigger) = query.trigger {
            qb.push(" AND trigger = ");
            qb.push_bind(trigger.as_str());
        }
        qb.push(" ORDER BY started_at DESC, id DESC LIMIT ");
        qb.push_bind(sql_int(query.limit));
        qb.push(" OFFSET ");
        qb.push_bind(sql_int(query.offset));

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("list runs", e))?;
        rows.iter().map(Self::run_from_row).collect()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_stale_runs(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AutomationRun>> {
        let sql = format!(
            r#"
            SELECT {RUN_COLUMNS} FROM automation_runs
            WHERE status = 'running' AND last_flushed_at < $1
            ORDER BY last_flushed_at ASC
            LIMIT $2
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(older_than)
            .bind(sql_int(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("list stale runs", e))?;
        rows.iter().map(Self::run_from_row).collect()
    }
}

#[async_trait]
impl RecordStore for PostgresStore {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_record(
        &self,
        tenant_id: Option<TenantId>,
        entity_type: &str,
        key: &str,
    ) -> Result<Option<StoredRecord>> {
        let sql = format!(
            r#"
            SELECT {RECORD_COLUMNS} FROM automation_records
            WHERE scope_key = $1 AND entity_type = $2 AND natural_key = $3
            "#
        );
        let row = sqlx::query(&sql)
            .bind(scope_key(tenant_id))
            .bind(entity_type)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("get record", e))?;
        row.as_ref().map(Self::record_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(key = %record.key))]
    async fn insert_record(&self, record: &StoredRecord) -> Result<()> {
        let res = sqlx::query(
            r#"
            INSERT INTO automation_records (id, tenant_id, scope_key, entity_type, natural_key,
                attributes, version, created_by_run, updated_by_run, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(record.id)
        .bind(record.tenant_id.map(|t| t.0))
        .bind(scope_key(record.tenant_id))
        .bind(&record.entity_type)
        .bind(&record.key)
        .bind(serde_json::Value::Object(record.attributes.clone()))
        .bind(record.version)
        .bind(record.created_by_run)
        .bind(record.updated_by_run)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await;

        match res {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(Error::Conflict(format!(
                "{} '{}' already exists",
                record.entity_type, record.key
            ))),
            Err(e) => Err(db_err("insert record", e)),
        }
    }

    /// Single statement: the version predicate makes the write conditional, and
    /// `||` replaces only the changed top-level keys.
    #[tracing::instrument(level = "debug", skip_all, fields(record_id = %patch.record_id))]
    async fn update_record(
        &self,
        tenant_id: Option<TenantId>,
        patch: &RecordPatch,
    ) -> Result<StoredRecord> {
        let scope = scope_key(tenant_id);
        let sql = format!(
            r#"
            UPDATE automation_records
            SET attributes = attributes || $1, version = version + 1,
                updated_by_run = $2, updated_at = $3
            WHERE id = $4 AND scope_key = $5 AND version = $6
            RETURNING {RECORD_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(serde_json::Value::Object(patch.changes.clone()))
            .bind(patch.run_id)
            .bind(patch.at)
            .bind(patch.record_id)
            .bind(&scope)
            .bind(patch.expected_version)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("update record", e))?;

        if let Some(row) = row {
            return Self::record_from_row(&row);
        }
        let exists = sqlx::query_scalar::<_, i64>(
            "SELECT version FROM automation_records WHERE id = $1 AND scope_key = $2",
        )
        .bind(patch.record_id)
        .bind(&scope)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err("load record version", e))?;
        match exists {
            Some(version) => Err(Error::Conflict(format!(
                "record {} changed (version {} != {})",
                patch.record_id, version, patch.expected_version
            ))),
            None => Err(Error::NotFound(format!("record {}", patch.record_id))),
        }
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
            r#"
            SELECT {RECORD_COLUMNS} FROM automation_records
            WHERE scope_key = $1 AND entity_type = $2
            ORDER BY natural_key ASC
            LIMIT $3 OFFSET $4
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(scope_key(tenant_id))
            .bind(entity_type)
            .bind(sql_int(limit))
            .bind(sql_int(offset))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("list records", e))?;
        rows.iter().map(Self::record_from_row).collect()
    }
}
