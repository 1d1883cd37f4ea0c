//! PostgreSQL-backed ledger and result recorder.
//!
//! Rows are keyed by task id; status updates are guarded by the
//! expected current status so a non-monotonic write loses the race
//! instead of clobbering a terminal state.

use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use uuid::Uuid;

use async_trait::async_trait;

use crate::error::FailureKind;
use crate::store::BlobRef;

use super::{LedgerError, ModelRecord, ResultRecorder, TaskLedger, TaskRecord, TaskStatus};

/// Schema statements, applied in order and tracked in `_migrations`.
const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id UUID PRIMARY KEY,
        status VARCHAR(16) NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        model_id UUID,
        execution_id UUID,
        failure_kind VARCHAR(32),
        failure_detail TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS models (
        id UUID PRIMARY KEY,
        task_id UUID NOT NULL,
        model_blob JSONB NOT NULL,
        metrics_blob JSONB NOT NULL,
        header_blob JSONB,
        class_labels JSONB,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS executions (
        id UUID PRIMARY KEY,
        task_id UUID NOT NULL,
        predictions_blob JSONB NOT NULL,
        metadata_blob JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks (status)",
    "CREATE INDEX IF NOT EXISTS idx_models_task ON models (task_id)",
    "CREATE INDEX IF NOT EXISTS idx_executions_task ON executions (task_id)",
];

/// Connects a pool the way the rest of the crate expects it.
pub async fn connect(database_url: &str) -> Result<PgPool, LedgerError> {
    PgPoolOptions::new()
        .max_connections(10)
        .min_connections(1)
        .acquire_timeout(std::time::Duration::from_secs(30))
        .connect(database_url)
        .await
        .map_err(|e| LedgerError::ConnectionFailed(e.to_string()))
}

/// Applies pending schema statements. Idempotent.
pub async fn run_migrations(pool: &PgPool) -> Result<(), LedgerError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS _migrations (
            id SERIAL PRIMARY KEY,
            name VARCHAR(255) NOT NULL UNIQUE,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    for (idx, statement) in SCHEMA_STATEMENTS.iter().enumerate() {
        let name = format!("ledger_v1_part_{idx}");
        let applied: Option<(i32,)> =
            sqlx::query_as("SELECT id FROM _migrations WHERE name = $1")
                .bind(&name)
                .fetch_optional(pool)
                .await?;
        if applied.is_some() {
            continue;
        }

        let mut tx = pool.begin().await?;
        sqlx::query(statement).execute(&mut *tx).await?;
        sqlx::query("INSERT INTO _migrations (name) VALUES ($1)")
            .bind(&name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
    }

    Ok(())
}

/// PostgreSQL `TaskLedger`.
pub struct PgTaskLedger {
    pool: PgPool,
}

impl PgTaskLedger {
    /// Connects and runs migrations.
    pub async fn connect(database_url: &str) -> Result<Self, LedgerError> {
        let pool = connect(database_url).await?;
        run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Wraps an existing pool. Migrations are the caller's problem.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<TaskRecord, LedgerError> {
        let status_raw: String = row.get("status");
        let status = TaskStatus::parse(&status_raw)
            .ok_or_else(|| LedgerError::ConnectionFailed(format!("bad status '{status_raw}'")))?;
        let failure_kind = row
            .get::<Option<String>, _>("failure_kind")
            .and_then(|s| FailureKind::parse(&s));

        Ok(TaskRecord {
            id: row.get("id"),
            status,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            model_id: row.get("model_id"),
            execution_id: row.get("execution_id"),
            failure_kind,
            failure_detail: row.get("failure_detail"),
        })
    }

    /// Status update guarded by the expected current status. Returns
    /// `InvalidTransition` when the guard does not match, which is also
    /// how a write against a terminal state loses.
    async fn guarded_update(
        &self,
        id: Uuid,
        to: TaskStatus,
        model_id: Option<Uuid>,
        execution_id: Option<Uuid>,
        failure_kind: Option<FailureKind>,
        failure_detail: Option<&str>,
    ) -> Result<(), LedgerError> {
        let current = self.get(id).await?;
        if !current.status.can_transition_to(to) {
            return Err(LedgerError::InvalidTransition {
                task: id,
                from: current.status,
                to,
            });
        }

        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = $1,
                updated_at = $2,
                model_id = COALESCE($3, model_id),
                execution_id = COALESCE($4, execution_id),
                failure_kind = $5,
                failure_detail = $6
            WHERE id = $7 AND status = $8
            "#,
        )
        .bind(to.as_str())
        .bind(Utc::now())
        .bind(model_id)
        .bind(execution_id)
        .bind(failure_kind.map(|k| k.as_str()))
        .bind(failure_detail)
        .bind(id)
        .bind(current.status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let now = self.get(id).await?;
            return Err(LedgerError::InvalidTransition {
                task: id,
                from: now.status,
                to,
            });
        }

        Ok(())
    }
}

#[async_trait]
impl TaskLedger for PgTaskLedger {
    async fn create(&self) -> Result<TaskRecord, LedgerError> {
        let record = TaskRecord::new(Uuid::new_v4());

        sqlx::query(
            r#"
            INSERT INTO tasks (id, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(record.id)
        .bind(record.status.as_str())
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get(&self, id: Uuid) -> Result<TaskRecord, LedgerError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(LedgerError::TaskNotFound(id))?;

        Self::record_from_row(&row)
    }

    async fn transition(&self, id: Uuid, to: TaskStatus) -> Result<(), LedgerError> {
        self.guarded_update(id, to, None, None, None, None).await
    }

    async fn record_completion(
        &self,
        id: Uuid,
        model_id: Option<Uuid>,
        execution_id: Option<Uuid>,
    ) -> Result<(), LedgerError> {
        self.guarded_update(id, TaskStatus::Completed, model_id, execution_id, None, None)
            .await
    }

    async fn record_failure(
        &self,
        id: Uuid,
        kind: FailureKind,
        detail: &str,
    ) -> Result<(), LedgerError> {
        self.guarded_update(id, TaskStatus::Failed, None, None, Some(kind), Some(detail))
            .await
    }

    async fn record_stopped(&self, id: Uuid, detail: &str) -> Result<(), LedgerError> {
        self.guarded_update(
            id,
            TaskStatus::Stopped,
            None,
            None,
            Some(FailureKind::Cancelled),
            Some(detail),
        )
        .await
    }
}

/// PostgreSQL `ResultRecorder`.
pub struct PgResultRecorder {
    pool: PgPool,
}

impl PgResultRecorder {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResultRecorder for PgResultRecorder {
    async fn create_model(
        &self,
        task_id: Uuid,
        model_blob: BlobRef,
        metrics_blob: BlobRef,
        header_blob: Option<BlobRef>,
        class_labels: Option<Vec<String>>,
    ) -> Result<Uuid, LedgerError> {
        let id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO models (id, task_id, model_blob, metrics_blob, header_blob, class_labels, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(id)
        .bind(task_id)
        .bind(serde_json::to_value(&model_blob)?)
        .bind(serde_json::to_value(&metrics_blob)?)
        .bind(header_blob.as_ref().map(serde_json::to_value).transpose()?)
        .bind(class_labels.as_ref().map(serde_json::to_value).transpose()?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn create_execution(
        &self,
        task_id: Uuid,
        predictions_blob: BlobRef,
        metadata_blob: BlobRef,
    ) -> Result<Uuid, LedgerError> {
        let id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO executions (id, task_id, predictions_blob, metadata_blob, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(id)
        .bind(task_id)
        .bind(serde_json::to_value(&predictions_blob)?)
        .bind(serde_json::to_value(&metadata_blob)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn get_model(&self, id: Uuid) -> Result<ModelRecord, LedgerError> {
        let row = sqlx::query("SELECT * FROM models WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(LedgerError::ModelNotFound(id))?;

        let model_blob: serde_json::Value = row.get("model_blob");
        let metrics_blob: serde_json::Value = row.get("metrics_blob");
        let header_blob: Option<serde_json::Value> = row.get("header_blob");
        let class_labels: Option<serde_json::Value> = row.get("class_labels");
        let created_at: DateTime<Utc> = row.get("created_at");

        Ok(ModelRecord {
            id: row.get("id"),
            task_id: row.get("task_id"),
            model_blob: serde_json::from_value(model_blob)?,
            metrics_blob: serde_json::from_value(metrics_blob)?,
            header_blob: header_blob.map(serde_json::from_value).transpose()?,
            class_labels: class_labels.map(serde_json::from_value).transpose()?,
            created_at,
        })
    }
}
