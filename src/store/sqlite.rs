//! SQLite-backed [`JobStore`].
//!
//! One database file per data directory, WAL mode. Status transitions use a
//! conditional UPDATE so the compare-and-set contract holds across processes,
//! not just across tasks in one runtime.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::SqlitePool;

use super::{JobPatch, JobStore, StoreError};
use crate::jobs::{ConversionJob, JobStatus};
use crate::plan::ConversionPlan;

/// Ceiling for individual queries; a hung query must not wedge a worker.
const QUERY_TIMEOUT: Duration = Duration::from_secs(30);

async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct JobRow {
    id: String,
    project_id: String,
    plan_id: String,
    status: String,
    progress: i64,
    current_task: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    error_message: Option<String>,
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("bad timestamp in job row: {value}"))?
        .with_timezone(&Utc))
}

impl JobRow {
    fn into_job(self) -> Result<ConversionJob> {
        let status = JobStatus::parse(&self.status)
            .ok_or_else(|| anyhow!("unknown job status in row: {}", self.status))?;
        Ok(ConversionJob {
            id: self.id,
            project_id: self.project_id,
            plan_id: self.plan_id,
            status,
            progress: self.progress.clamp(0, 100) as u8,
            current_task: self.current_task,
            created_at: parse_ts(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_ts).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
            error_message: self.error_message,
        })
    }
}

pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Open (or create) `restack.db` under `data_dir`.
    pub async fn new(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("restack.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
                .create_if_missing(true);
        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Return a clone of the connection pool (cheap, Arc-backed).
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversion_jobs (
                 id TEXT PRIMARY KEY,
                 project_id TEXT NOT NULL,
                 plan_id TEXT NOT NULL,
                 status TEXT NOT NULL,
                 progress INTEGER NOT NULL DEFAULT 0,
                 current_task TEXT,
                 created_at TEXT NOT NULL,
                 started_at TEXT,
                 completed_at TEXT,
                 error_message TEXT
             )",
        )
        .execute(pool)
        .await
        .context("failed to create conversion_jobs table")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversion_plans (
                 id TEXT PRIMARY KEY,
                 project_id TEXT NOT NULL,
                 plan_json TEXT NOT NULL,
                 created_at TEXT NOT NULL
             )",
        )
        .execute(pool)
        .await
        .context("failed to create conversion_plans table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_project ON conversion_jobs (project_id)",
        )
        .execute(pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert_plan(&self, plan: &ConversionPlan) -> Result<(), StoreError> {
        let json = serde_json::to_string(plan).map_err(|e| StoreError(e.into()))?;
        with_timeout(async {
            sqlx::query(
                "INSERT OR REPLACE INTO conversion_plans (id, project_id, plan_json, created_at)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(&plan.id)
            .bind(&plan.project_id)
            .bind(&json)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
        .map_err(StoreError)
    }

    async fn get_plan(&self, plan_id: &str) -> Result<Option<ConversionPlan>, StoreError> {
        with_timeout(async {
            let row: Option<(String,)> =
                sqlx::query_as("SELECT plan_json FROM conversion_plans WHERE id = ?")
                    .bind(plan_id)
                    .fetch_optional(&self.pool)
                    .await?;
            row.map(|(json,)| serde_json::from_str(&json).context("corrupt plan row"))
                .transpose()
        })
        .await
        .map_err(StoreError)
    }

    async fn insert_job(&self, job: &ConversionJob) -> Result<(), StoreError> {
        with_timeout(async {
            sqlx::query(
                "INSERT INTO conversion_jobs
                     (id, project_id, plan_id, status, progress, current_task,
                      created_at, started_at, completed_at, error_message)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&job.id)
            .bind(&job.project_id)
            .bind(&job.plan_id)
            .bind(job.status.as_str())
            .bind(job.progress as i64)
            .bind(&job.current_task)
            .bind(job.created_at.to_rfc3339())
            .bind(job.started_at.map(|at| at.to_rfc3339()))
            .bind(job.completed_at.map(|at| at.to_rfc3339()))
            .bind(&job.error_message)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
        .map_err(StoreError)
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<ConversionJob>, StoreError> {
        with_timeout(async {
            let row: Option<JobRow> =
                sqlx::query_as("SELECT * FROM conversion_jobs WHERE id = ?")
                    .bind(job_id)
                    .fetch_optional(&self.pool)
                    .await?;
            row.map(JobRow::into_job).transpose()
        })
        .await
        .map_err(StoreError)
    }

    async fn list_jobs(&self, project_id: Option<&str>) -> Result<Vec<ConversionJob>, StoreError> {
        with_timeout(async {
            // rowid preserves insertion order.
            let rows: Vec<JobRow> = match project_id {
                Some(project) => {
                    sqlx::query_as(
                        "SELECT * FROM conversion_jobs WHERE project_id = ? ORDER BY rowid",
                    )
                    .bind(project)
                    .fetch_all(&self.pool)
                    .await?
                }
                None => {
                    sqlx::query_as("SELECT * FROM conversion_jobs ORDER BY rowid")
                        .fetch_all(&self.pool)
                        .await?
                }
            };
            rows.into_iter().map(JobRow::into_job).collect()
        })
        .await
        .map_err(StoreError)
    }

    async fn compare_and_set_status(
        &self,
        job_id: &str,
        expected: JobStatus,
        next: JobStatus,
        patch: JobPatch,
    ) -> Result<bool, StoreError> {
        with_timeout(async {
            let result = sqlx::query(
                "UPDATE conversion_jobs SET
                     status = ?,
                     started_at = COALESCE(?, started_at),
                     completed_at = COALESCE(?, completed_at),
                     progress = COALESCE(?, progress),
                     current_task = COALESCE(?, current_task),
                     error_message = COALESCE(?, error_message)
                 WHERE id = ? AND status = ?",
            )
            .bind(next.as_str())
            .bind(patch.started_at.map(|at| at.to_rfc3339()))
            .bind(patch.completed_at.map(|at| at.to_rfc3339()))
            .bind(patch.progress.map(|p| p.min(100) as i64))
            .bind(patch.current_task)
            .bind(patch.error_message)
            .bind(job_id)
            .bind(expected.as_str())
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
        .map_err(StoreError)
    }

    async fn update_progress(
        &self,
        job_id: &str,
        progress: u8,
        current_task: &str,
    ) -> Result<bool, StoreError> {
        with_timeout(async {
            let result = sqlx::query(
                "UPDATE conversion_jobs SET progress = MAX(progress, ?), current_task = ?
                 WHERE id = ? AND status = 'running'",
            )
            .bind(progress.min(100) as i64)
            .bind(current_task)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
        .map_err(StoreError)
    }

    async fn delete_job(&self, job_id: &str) -> Result<bool, StoreError> {
        with_timeout(async {
            let result = sqlx::query("DELETE FROM conversion_jobs WHERE id = ?")
                .bind(job_id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
        .map_err(StoreError)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        with_timeout(async {
            sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
            Ok(())
        })
        .await
        .map_err(StoreError)
    }
}
