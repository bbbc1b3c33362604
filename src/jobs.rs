//! Conversion jobs: the durable state machine.
//!
//! A [`ConversionJob`] is a stateful, durable instance of executing one
//! conversion plan. The job record in the store is the sole source of truth;
//! every transition goes through an atomic compare-and-set so concurrent
//! callers serialize and the loser observes an invalid-transition error.
//!
//! ```text
//! pending ──► running ◄──► paused
//!                │
//!                ├──► completed
//!                └──► failed        (paused/pending can also fail)
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::classify::{classify, Failure};
use crate::error::{AppError, ErrorContext};
use crate::plan::{short_id, ConversionPlan};
use crate::queue::QueueAdapter;
use crate::store::{JobPatch, JobStore, StoreError};

// ── Status ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// No transition is defined out of a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Legal job status transitions.
pub fn valid_transition(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    matches!(
        (from, to),
        (Pending, Running)
            | (Running, Paused)
            | (Paused, Running)
            | (Running, Completed)
            | (Pending, Failed)
            | (Running, Failed)
            | (Paused, Failed)
    )
}

// ── Job record ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionJob {
    pub id: String,
    pub project_id: String,
    /// Reference to the accepted plan — never a copy.
    pub plan_id: String,
    pub status: JobStatus,
    /// 0–100, monotone non-decreasing while running.
    pub progress: u8,
    /// Free-text description of the task in flight, for display.
    pub current_task: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Sanitized message, set only on failure.
    pub error_message: Option<String>,
}

impl ConversionJob {
    pub fn new(id: String, project_id: String, plan_id: String) -> Self {
        Self {
            id,
            project_id,
            plan_id,
            status: JobStatus::Pending,
            progress: 0,
            current_task: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }
}

// ── Manager ──────────────────────────────────────────────────────────────────

/// Owns the canonical job record and its state machine.
pub struct JobManager {
    store: Arc<dyn JobStore>,
    adapter: Arc<QueueAdapter>,
}

impl JobManager {
    pub fn new(store: Arc<dyn JobStore>, adapter: Arc<QueueAdapter>) -> Self {
        Self { store, adapter }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    fn store_err(err: StoreError, ctx: &ErrorContext) -> AppError {
        classify(&Failure::from(err), ctx.clone())
    }

    /// Create a job for a feasible, acyclic plan. No queue interaction
    /// happens here — dispatch is a separate step on start.
    pub async fn create_conversion_job(
        &self,
        plan: &ConversionPlan,
    ) -> Result<ConversionJob, AppError> {
        let ctx = ErrorContext::new("create_conversion_job").with_project(&plan.project_id);
        plan.validate()
            .map_err(|graph_err| AppError::validation(graph_err.to_string(), ctx.clone()))?;

        let job = ConversionJob::new(
            short_id("job"),
            plan.project_id.clone(),
            plan.id.clone(),
        );
        self.store
            .insert_plan(plan)
            .await
            .map_err(|e| Self::store_err(e, &ctx))?;
        self.store
            .insert_job(&job)
            .await
            .map_err(|e| Self::store_err(e, &ctx))?;
        info!(job_id = %job.id, plan_id = %plan.id, tasks = plan.tasks.len(), "conversion job created");
        Ok(job)
    }

    /// Transition `pending → running` and stamp `started_at`.
    pub async fn start_conversion_job(
        &self,
        job_id: &str,
        user_id: &str,
    ) -> Result<ConversionJob, AppError> {
        let ctx = ErrorContext::new("start_conversion_job")
            .with_job(job_id)
            .with_user(user_id);
        let patch = JobPatch {
            started_at: Some(Utc::now()),
            ..JobPatch::default()
        };
        let applied = self
            .store
            .compare_and_set_status(job_id, JobStatus::Pending, JobStatus::Running, patch)
            .await
            .map_err(|e| Self::store_err(e, &ctx))?;
        if !applied {
            return Err(self.transition_refused(job_id, "start", &ctx).await);
        }
        info!(job_id, user_id, "conversion job started");
        self.require(job_id, &ctx).await
    }

    /// Transition `running → paused`. Double-pause is rejected, not a no-op.
    pub async fn pause_conversion_job(&self, job_id: &str) -> Result<(), AppError> {
        let ctx = ErrorContext::new("pause_conversion_job").with_job(job_id);
        let applied = self
            .store
            .compare_and_set_status(
                job_id,
                JobStatus::Running,
                JobStatus::Paused,
                JobPatch::default(),
            )
            .await
            .map_err(|e| Self::store_err(e, &ctx))?;
        if !applied {
            return Err(self.transition_refused(job_id, "pause", &ctx).await);
        }
        info!(job_id, "conversion job paused");
        Ok(())
    }

    /// Transition `paused → running`. Progress and current task survive.
    pub async fn resume_conversion_job(&self, job_id: &str) -> Result<ConversionJob, AppError> {
        let ctx = ErrorContext::new("resume_conversion_job").with_job(job_id);
        let applied = self
            .store
            .compare_and_set_status(
                job_id,
                JobStatus::Paused,
                JobStatus::Running,
                JobPatch::default(),
            )
            .await
            .map_err(|e| Self::store_err(e, &ctx))?;
        if !applied {
            return Err(self.transition_refused(job_id, "resume", &ctx).await);
        }
        info!(job_id, "conversion job resumed");
        self.require(job_id, &ctx).await
    }

    /// Report progress for a running job. Values clamp to [0, 100]; the
    /// stored value never decreases (single-owner writes are assumed, this
    /// just keeps a late echo from walking progress backwards).
    pub async fn update_progress(
        &self,
        job_id: &str,
        progress: u8,
        current_task: &str,
    ) -> Result<(), AppError> {
        let ctx = ErrorContext::new("update_progress").with_job(job_id);
        let applied = self
            .store
            .update_progress(job_id, progress.min(100), current_task)
            .await
            .map_err(|e| Self::store_err(e, &ctx))?;
        if !applied {
            return Err(self.transition_refused(job_id, "report progress for", &ctx).await);
        }
        Ok(())
    }

    /// Terminal success. Progress is forced to exactly 100 regardless of the
    /// value beforehand. Idempotent when the job is already completed.
    pub async fn mark_as_completed(
        &self,
        job_id: &str,
        result: Option<String>,
    ) -> Result<(), AppError> {
        let ctx = ErrorContext::new("mark_as_completed").with_job(job_id);
        let patch = JobPatch {
            completed_at: Some(Utc::now()),
            progress: Some(100),
            current_task: result,
            ..JobPatch::default()
        };
        let applied = self
            .store
            .compare_and_set_status(job_id, JobStatus::Running, JobStatus::Completed, patch)
            .await
            .map_err(|e| Self::store_err(e, &ctx))?;
        if applied {
            info!(job_id, "conversion job completed");
            return Ok(());
        }
        match self.get_conversion_job(job_id).await? {
            Some(job) if job.status == JobStatus::Completed => Ok(()),
            Some(job) => Err(AppError::invalid_transition(
                format!("cannot complete job {job_id} in status {}", job.status),
                ctx,
            )),
            None => Err(AppError::not_found(job_id, ctx)),
        }
    }

    /// Terminal failure, reachable from any non-terminal status. Idempotent
    /// when the job already failed.
    pub async fn mark_as_failed(&self, job_id: &str, error_message: &str) -> Result<(), AppError> {
        let ctx = ErrorContext::new("mark_as_failed").with_job(job_id);
        // Read-then-CAS loop: another caller may transition between the read
        // and the write, so retry against the fresh status a few times.
        for _ in 0..4 {
            let Some(job) = self.get_conversion_job(job_id).await? else {
                return Err(AppError::not_found(job_id, ctx));
            };
            match job.status {
                JobStatus::Failed => return Ok(()),
                JobStatus::Completed => {
                    return Err(AppError::invalid_transition(
                        format!("cannot fail job {job_id}: already completed"),
                        ctx,
                    ))
                }
                from => {
                    let patch = JobPatch {
                        completed_at: Some(Utc::now()),
                        error_message: Some(error_message.to_string()),
                        ..JobPatch::default()
                    };
                    let applied = self
                        .store
                        .compare_and_set_status(job_id, from, JobStatus::Failed, patch)
                        .await
                        .map_err(|e| Self::store_err(e, &ctx))?;
                    if applied {
                        warn!(job_id, error_message, "conversion job failed");
                        return Ok(());
                    }
                }
            }
        }
        Err(AppError::invalid_transition(
            format!("could not fail job {job_id}: status kept changing"),
            ctx,
        ))
    }

    /// Remove the record and request dequeue of any pending work item.
    /// Does not interrupt an executor already mid-flight — the worker
    /// notices the missing record at the next task boundary.
    pub async fn delete_conversion_job(&self, job_id: &str) -> Result<(), AppError> {
        let ctx = ErrorContext::new("delete_conversion_job").with_job(job_id);
        self.adapter
            .cancel_job(job_id)
            .await
            .map_err(|e| classify(&Failure::from(e), ctx.clone()))?;
        let removed = self
            .store
            .delete_job(job_id)
            .await
            .map_err(|e| Self::store_err(e, &ctx))?;
        if !removed {
            return Err(AppError::not_found(job_id, ctx));
        }
        info!(job_id, "conversion job deleted");
        Ok(())
    }

    pub async fn get_conversion_job(&self, job_id: &str) -> Result<Option<ConversionJob>, AppError> {
        let ctx = ErrorContext::new("get_conversion_job").with_job(job_id);
        self.store
            .get_job(job_id)
            .await
            .map_err(|e| Self::store_err(e, &ctx))
    }

    /// All jobs in creation order, optionally filtered by project.
    pub async fn list_conversion_jobs(
        &self,
        project_id: Option<&str>,
    ) -> Result<Vec<ConversionJob>, AppError> {
        let ctx = ErrorContext::new("list_conversion_jobs");
        self.store
            .list_jobs(project_id)
            .await
            .map_err(|e| Self::store_err(e, &ctx))
    }

    /// Load a job that must exist.
    async fn require(&self, job_id: &str, ctx: &ErrorContext) -> Result<ConversionJob, AppError> {
        self.get_conversion_job(job_id)
            .await?
            .ok_or_else(|| AppError::not_found(job_id, ctx.clone()))
    }

    /// Turn a CAS miss into the right caller-facing error.
    async fn transition_refused(&self, job_id: &str, verb: &str, ctx: &ErrorContext) -> AppError {
        match self.get_conversion_job(job_id).await {
            Ok(Some(job)) => AppError::invalid_transition(
                format!("cannot {verb} job {job_id} in status {}", job.status),
                ctx.clone(),
            ),
            Ok(None) => AppError::not_found(job_id, ctx.clone()),
            Err(err) => err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{AgentKind, ConversionPlan, ConversionTask, TaskKind};
    use crate::queue::MemoryQueue;
    use crate::store::MemoryJobStore;

    fn sample_plan() -> ConversionPlan {
        ConversionPlan::new(
            "proj-1",
            vec![
                ConversionTask::new("analyze", TaskKind::Analysis, AgentKind::Analyzer),
                ConversionTask::new("gen", TaskKind::CodeGeneration, AgentKind::CodeGenerator)
                    .depends_on("analyze"),
            ],
        )
    }

    fn manager() -> JobManager {
        let store = Arc::new(MemoryJobStore::new());
        let adapter = Arc::new(QueueAdapter::new(Arc::new(MemoryQueue::new())));
        JobManager::new(store, adapter)
    }

    #[tokio::test]
    async fn new_job_is_pending_with_zero_progress() {
        let mgr = manager();
        let job = mgr.create_conversion_job(&sample_plan()).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0);
        assert!(job.started_at.is_none());
    }

    #[tokio::test]
    async fn cyclic_plan_rejected_with_validation_error() {
        let mgr = manager();
        let plan = ConversionPlan::new(
            "proj-1",
            vec![
                ConversionTask::new("a", TaskKind::Analysis, AgentKind::Analyzer).depends_on("b"),
                ConversionTask::new("b", TaskKind::Analysis, AgentKind::Analyzer).depends_on("a"),
            ],
        );
        let err = mgr.create_conversion_job(&plan).await.unwrap_err();
        assert_eq!(err.code, "VALIDATION");
    }

    #[tokio::test]
    async fn infeasible_plan_rejected() {
        let mgr = manager();
        let plan = sample_plan().infeasible("unsupported source framework");
        let err = mgr.create_conversion_job(&plan).await.unwrap_err();
        assert_eq!(err.code, "VALIDATION");
    }

    #[tokio::test]
    async fn start_sets_running_and_started_at() {
        let mgr = manager();
        let job = mgr.create_conversion_job(&sample_plan()).await.unwrap();
        let started = mgr.start_conversion_job(&job.id, "user-1").await.unwrap();
        assert_eq!(started.status, JobStatus::Running);
        assert!(started.started_at.is_some());
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let mgr = manager();
        let job = mgr.create_conversion_job(&sample_plan()).await.unwrap();
        mgr.start_conversion_job(&job.id, "user-1").await.unwrap();
        let err = mgr.start_conversion_job(&job.id, "user-1").await.unwrap_err();
        assert_eq!(err.code, "INVALID_TRANSITION");
        assert!(err.message.contains("cannot start"));
    }

    #[tokio::test]
    async fn pause_resume_round_trip_preserves_progress() {
        let mgr = manager();
        let job = mgr.create_conversion_job(&sample_plan()).await.unwrap();
        mgr.start_conversion_job(&job.id, "user-1").await.unwrap();
        mgr.update_progress(&job.id, 50, "generating code").await.unwrap();

        mgr.pause_conversion_job(&job.id).await.unwrap();
        let resumed = mgr.resume_conversion_job(&job.id).await.unwrap();
        assert_eq!(resumed.status, JobStatus::Running);
        assert_eq!(resumed.progress, 50);
        assert_eq!(resumed.current_task.as_deref(), Some("generating code"));
    }

    #[tokio::test]
    async fn double_pause_is_rejected() {
        let mgr = manager();
        let job = mgr.create_conversion_job(&sample_plan()).await.unwrap();
        mgr.start_conversion_job(&job.id, "user-1").await.unwrap();
        mgr.pause_conversion_job(&job.id).await.unwrap();
        let err = mgr.pause_conversion_job(&job.id).await.unwrap_err();
        assert_eq!(err.code, "INVALID_TRANSITION");
    }

    #[tokio::test]
    async fn progress_rejected_unless_running() {
        let mgr = manager();
        let job = mgr.create_conversion_job(&sample_plan()).await.unwrap();
        let err = mgr.update_progress(&job.id, 10, "analyze").await.unwrap_err();
        assert_eq!(err.code, "INVALID_TRANSITION");
    }

    #[tokio::test]
    async fn complete_forces_progress_to_100_and_is_idempotent() {
        let mgr = manager();
        let job = mgr.create_conversion_job(&sample_plan()).await.unwrap();
        mgr.start_conversion_job(&job.id, "user-1").await.unwrap();
        mgr.update_progress(&job.id, 37, "halfway").await.unwrap();

        mgr.mark_as_completed(&job.id, Some("42 files converted".into()))
            .await
            .unwrap();
        let done = mgr.get_conversion_job(&job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress, 100);
        assert!(done.completed_at.is_some());

        // Idempotent second call.
        mgr.mark_as_completed(&job.id, None).await.unwrap();
    }

    #[tokio::test]
    async fn terminal_job_rejects_all_transitions() {
        let mgr = manager();
        let job = mgr.create_conversion_job(&sample_plan()).await.unwrap();
        mgr.start_conversion_job(&job.id, "user-1").await.unwrap();
        mgr.mark_as_completed(&job.id, None).await.unwrap();

        assert_eq!(
            mgr.pause_conversion_job(&job.id).await.unwrap_err().code,
            "INVALID_TRANSITION"
        );
        assert_eq!(
            mgr.resume_conversion_job(&job.id).await.unwrap_err().code,
            "INVALID_TRANSITION"
        );
        assert_eq!(
            mgr.mark_as_failed(&job.id, "late failure").await.unwrap_err().code,
            "INVALID_TRANSITION"
        );
    }

    #[tokio::test]
    async fn failed_job_records_message_and_is_idempotent() {
        let mgr = manager();
        let job = mgr.create_conversion_job(&sample_plan()).await.unwrap();
        mgr.start_conversion_job(&job.id, "user-1").await.unwrap();
        mgr.mark_as_failed(&job.id, "provider unavailable").await.unwrap();
        let failed = mgr.get_conversion_job(&job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("provider unavailable"));

        mgr.mark_as_failed(&job.id, "again").await.unwrap();
    }

    #[tokio::test]
    async fn delete_removes_job_from_listing() {
        let mgr = manager();
        let job = mgr.create_conversion_job(&sample_plan()).await.unwrap();
        mgr.delete_conversion_job(&job.id).await.unwrap();
        assert!(mgr.get_conversion_job(&job.id).await.unwrap().is_none());
        assert!(mgr.list_conversion_jobs(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_job_yields_not_found_for_all_mutations() {
        let mgr = manager();
        assert_eq!(
            mgr.start_conversion_job("job-missing", "u").await.unwrap_err().code,
            "NOT_FOUND"
        );
        assert_eq!(
            mgr.pause_conversion_job("job-missing").await.unwrap_err().code,
            "NOT_FOUND"
        );
        assert_eq!(
            mgr.resume_conversion_job("job-missing").await.unwrap_err().code,
            "NOT_FOUND"
        );
        assert_eq!(
            mgr.delete_conversion_job("job-missing").await.unwrap_err().code,
            "NOT_FOUND"
        );
    }

    #[tokio::test]
    async fn concurrent_starts_serialize_one_winner() {
        let mgr = Arc::new(manager());
        let job = mgr.create_conversion_job(&sample_plan()).await.unwrap();
        let mut handles = Vec::new();
        for i in 0..4 {
            let mgr = mgr.clone();
            let id = job.id.clone();
            handles.push(tokio::spawn(async move {
                mgr.start_conversion_job(&id, &format!("user-{i}")).await
            }));
        }
        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[test]
    fn transition_table() {
        use JobStatus::*;
        assert!(valid_transition(Pending, Running));
        assert!(valid_transition(Running, Paused));
        assert!(valid_transition(Paused, Running));
        assert!(valid_transition(Running, Completed));
        assert!(valid_transition(Paused, Failed));
        assert!(!valid_transition(Pending, Paused));
        assert!(!valid_transition(Completed, Running));
        assert!(!valid_transition(Failed, Running));
        assert!(!valid_transition(Completed, Failed));
    }
}
