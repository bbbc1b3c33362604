//! Durable record store for jobs and plans.
//!
//! The job record is the single source of truth for conversion state — the
//! queue backend only holds transient dispatch state and is always
//! reconcilable from here. Implementations must provide an atomic
//! compare-and-set on job status; that is what serializes concurrent
//! start/pause/resume/delete calls (the loser of a race observes a CAS miss,
//! never corrupted state).

pub mod sqlite;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::classify::{Failure, FailureOrigin};
use crate::jobs::{ConversionJob, JobStatus};
use crate::plan::ConversionPlan;

/// Store backend failure. Classified downstream as a database error.
#[derive(Debug, thiserror::Error)]
#[error("record store error: {0}")]
pub struct StoreError(#[from] pub anyhow::Error);

impl From<StoreError> for Failure {
    fn from(err: StoreError) -> Self {
        Failure::msg(format!("{:#}", err.0)).with_origin(FailureOrigin::Database)
    }
}

/// Fields applied atomically together with a status transition.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: Option<u8>,
    pub current_task: Option<String>,
    pub error_message: Option<String>,
}

/// CRUD + atomic status transitions on job and plan records.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_plan(&self, plan: &ConversionPlan) -> Result<(), StoreError>;
    async fn get_plan(&self, plan_id: &str) -> Result<Option<ConversionPlan>, StoreError>;

    async fn insert_job(&self, job: &ConversionJob) -> Result<(), StoreError>;
    async fn get_job(&self, job_id: &str) -> Result<Option<ConversionJob>, StoreError>;
    /// All jobs in creation order, optionally filtered by project.
    async fn list_jobs(&self, project_id: Option<&str>) -> Result<Vec<ConversionJob>, StoreError>;

    /// Atomically transition `expected → next`, applying `patch` in the same
    /// write. Returns `false` when the job is missing or its status is not
    /// `expected` — the caller disambiguates with a read.
    async fn compare_and_set_status(
        &self,
        job_id: &str,
        expected: JobStatus,
        next: JobStatus,
        patch: JobPatch,
    ) -> Result<bool, StoreError>;

    /// Write progress + current task, only while the job is running.
    /// Progress is monotone: the stored value never decreases. Returns
    /// `false` when the job is missing or not running.
    async fn update_progress(
        &self,
        job_id: &str,
        progress: u8,
        current_task: &str,
    ) -> Result<bool, StoreError>;

    /// Returns `true` if a record was removed.
    async fn delete_job(&self, job_id: &str) -> Result<bool, StoreError>;

    /// Cheap connectivity probe, used by the database recovery strategy.
    async fn ping(&self) -> Result<(), StoreError>;
}

// ── In-memory implementation ─────────────────────────────────────────────────

#[derive(Default)]
struct MemoryInner {
    jobs: HashMap<String, ConversionJob>,
    /// Creation order of job ids.
    order: Vec<String>,
    plans: HashMap<String, ConversionPlan>,
}

/// In-memory store for tests and embedded use.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert_plan(&self, plan: &ConversionPlan) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .plans
            .insert(plan.id.clone(), plan.clone());
        Ok(())
    }

    async fn get_plan(&self, plan_id: &str) -> Result<Option<ConversionPlan>, StoreError> {
        Ok(self.inner.read().await.plans.get(plan_id).cloned())
    }

    async fn insert_job(&self, job: &ConversionJob) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.jobs.insert(job.id.clone(), job.clone()).is_none() {
            inner.order.push(job.id.clone());
        }
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<ConversionJob>, StoreError> {
        Ok(self.inner.read().await.jobs.get(job_id).cloned())
    }

    async fn list_jobs(&self, project_id: Option<&str>) -> Result<Vec<ConversionJob>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.jobs.get(id))
            .filter(|job| project_id.map_or(true, |p| job.project_id == p))
            .cloned()
            .collect())
    }

    async fn compare_and_set_status(
        &self,
        job_id: &str,
        expected: JobStatus,
        next: JobStatus,
        patch: JobPatch,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(job) = inner.jobs.get_mut(job_id) else {
            return Ok(false);
        };
        if job.status != expected {
            return Ok(false);
        }
        job.status = next;
        if let Some(at) = patch.started_at {
            job.started_at = Some(at);
        }
        if let Some(at) = patch.completed_at {
            job.completed_at = Some(at);
        }
        if let Some(progress) = patch.progress {
            job.progress = progress.min(100);
        }
        if let Some(task) = patch.current_task {
            job.current_task = Some(task);
        }
        if let Some(message) = patch.error_message {
            job.error_message = Some(message);
        }
        Ok(true)
    }

    async fn update_progress(
        &self,
        job_id: &str,
        progress: u8,
        current_task: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(job) = inner.jobs.get_mut(job_id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Running {
            return Ok(false);
        }
        job.progress = job.progress.max(progress.min(100));
        job.current_task = Some(current_task.to_string());
        Ok(true)
    }

    async fn delete_job(&self, job_id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let removed = inner.jobs.remove(job_id).is_some();
        if removed {
            inner.order.retain(|id| id != job_id);
        }
        Ok(removed)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::ConversionJob;
    use crate::plan::{AgentKind, ConversionPlan, ConversionTask, TaskKind};

    fn sample_job(id: &str, project: &str) -> ConversionJob {
        ConversionJob::new(id.to_string(), project.to_string(), "plan-1".to_string())
    }

    #[tokio::test]
    async fn list_returns_creation_order() {
        let store = MemoryJobStore::new();
        for i in 0..3 {
            store
                .insert_job(&sample_job(&format!("job-{i}"), "proj"))
                .await
                .unwrap();
        }
        let jobs = store.list_jobs(None).await.unwrap();
        let ids: Vec<_> = jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["job-0", "job-1", "job-2"]);
    }

    #[tokio::test]
    async fn list_filters_by_project() {
        let store = MemoryJobStore::new();
        store.insert_job(&sample_job("a", "p1")).await.unwrap();
        store.insert_job(&sample_job("b", "p2")).await.unwrap();
        let jobs = store.list_jobs(Some("p2")).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, "b");
    }

    #[tokio::test]
    async fn cas_misses_on_wrong_expected_status() {
        let store = MemoryJobStore::new();
        store.insert_job(&sample_job("a", "p")).await.unwrap();
        let applied = store
            .compare_and_set_status("a", JobStatus::Running, JobStatus::Paused, JobPatch::default())
            .await
            .unwrap();
        assert!(!applied);
        assert_eq!(
            store.get_job("a").await.unwrap().unwrap().status,
            JobStatus::Pending
        );
    }

    #[tokio::test]
    async fn update_progress_is_monotone_and_running_only() {
        let store = MemoryJobStore::new();
        store.insert_job(&sample_job("a", "p")).await.unwrap();
        assert!(!store.update_progress("a", 10, "analyze").await.unwrap());

        store
            .compare_and_set_status("a", JobStatus::Pending, JobStatus::Running, JobPatch::default())
            .await
            .unwrap();
        assert!(store.update_progress("a", 40, "generate").await.unwrap());
        assert!(store.update_progress("a", 20, "stale write").await.unwrap());
        let job = store.get_job("a").await.unwrap().unwrap();
        assert_eq!(job.progress, 40);
    }

    #[tokio::test]
    async fn plans_round_trip() {
        let store = MemoryJobStore::new();
        let plan = ConversionPlan::new(
            "proj",
            vec![ConversionTask::new(
                "t1",
                TaskKind::Analysis,
                AgentKind::Analyzer,
            )],
        );
        store.insert_plan(&plan).await.unwrap();
        let loaded = store.get_plan(&plan.id).await.unwrap().unwrap();
        assert_eq!(loaded.tasks.len(), 1);
    }
}
