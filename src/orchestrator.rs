//! Conversion orchestrator: the public face of the subsystem.
//!
//! Composes the job manager, queue adapter, recovery registry, and retry
//! executor behind one API. All dependencies are injected — there is no
//! global instance; embedders construct exactly the orchestrator they need
//! and hand out clones of the `Arc`s it exposes.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::classify::Failure;
use crate::config::OrchestratorConfig;
use crate::error::{AppError, ErrorContext};
use crate::executor::ExecutorRegistry;
use crate::jobs::{ConversionJob, JobManager};
use crate::observability::LatencyTracker;
use crate::plan::ConversionPlan;
use crate::queue::{ProgressUpdate, QueueAdapter, QueueBackend, QueueStats};
use crate::recovery::{run_recoverable, RecoveryContext, RecoveryRegistry};
use crate::retry::RetryExecutor;
use crate::store::JobStore;
use crate::worker::Worker;

pub struct ConversionOrchestrator {
    manager: Arc<JobManager>,
    adapter: Arc<QueueAdapter>,
    executors: Arc<ExecutorRegistry>,
    recovery: Arc<RecoveryRegistry>,
    retry: RetryExecutor,
    config: OrchestratorConfig,
    shutdown: watch::Sender<bool>,
}

impl ConversionOrchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        backend: Arc<dyn QueueBackend>,
        executors: Arc<ExecutorRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        let adapter = Arc::new(QueueAdapter::new(backend));
        let manager = Arc::new(JobManager::new(store, adapter.clone()));
        let recovery = Arc::new(RecoveryRegistry::with_defaults(&config.recovery.settings()));
        let retry = RetryExecutor::new(config.retry.policy());
        let (shutdown, _) = watch::channel(false);
        Self {
            manager,
            adapter,
            executors,
            recovery,
            retry,
            config,
            shutdown,
        }
    }

    pub fn manager(&self) -> Arc<JobManager> {
        self.manager.clone()
    }

    pub fn adapter(&self) -> Arc<QueueAdapter> {
        self.adapter.clone()
    }

    /// Spawn one worker task polling the queue. Call more than once for
    /// parallel workers; all of them stop on [`shutdown`](Self::shutdown).
    pub fn spawn_worker(&self) -> tokio::task::JoinHandle<()> {
        let worker = Worker::new(
            self.manager.clone(),
            self.adapter.clone(),
            self.executors.clone(),
            self.recovery.clone(),
            self.retry.clone(),
            self.config.worker.clone(),
            self.shutdown.subscribe(),
        );
        tokio::spawn(worker.run())
    }

    /// Refuse new dispatch once shutdown has been signalled.
    fn ensure_accepting(&self, operation: &str) -> Result<(), AppError> {
        if *self.shutdown.borrow() {
            return Err(AppError::validation(
                "orchestrator is shutting down",
                ErrorContext::new(operation),
            ));
        }
        Ok(())
    }

    /// Validate the plan, create the job, transition it to running, and
    /// dispatch one work item.
    pub async fn start_conversion(
        &self,
        plan: &ConversionPlan,
        user_id: &str,
    ) -> Result<ConversionJob, AppError> {
        self.ensure_accepting("start_conversion")?;
        let tracker = LatencyTracker::start("conversion.start");
        let job = self.manager.create_conversion_job(plan).await?;
        let started = self.manager.start_conversion_job(&job.id, user_id).await?;

        let ctx = ErrorContext::new("dispatch_conversion")
            .with_job(&job.id)
            .with_project(&plan.project_id)
            .with_user(user_id);
        if let Err(err) = self.dispatch(&started, plan, &ctx).await {
            // The job is running but nothing will execute it; fail it so the
            // caller sees a terminal state instead of a stuck record.
            if let Err(mark_err) = self
                .manager
                .mark_as_failed(&job.id, "conversion could not be queued")
                .await
            {
                warn!(job_id = %job.id, error = %mark_err, "could not record dispatch failure");
            }
            return Err(err);
        }
        info!(job_id = %job.id, project_id = %plan.project_id, "conversion dispatched");
        tracker.finish();
        Ok(started)
    }

    /// Cooperative pause: the state flips now, the worker parks at the next
    /// task boundary. A transient store failure goes through the recovery
    /// pipeline; a CAS loss classifies as non-retryable and fails fast.
    pub async fn pause_conversion(&self, job_id: &str) -> Result<(), AppError> {
        let ctx = ErrorContext::new("pause_conversion").with_job(job_id);
        let rctx = RecoveryContext::new(self.manager.store().clone());
        run_recoverable(&self.recovery, &self.retry, &ctx, &rctx, || async move {
            self.manager.pause_conversion_job(job_id).await
        })
        .await
    }

    /// Resume a paused job and re-dispatch it. Stored progress determines
    /// where the worker picks up.
    pub async fn resume_conversion(&self, job_id: &str) -> Result<ConversionJob, AppError> {
        self.ensure_accepting("resume_conversion")?;
        let ctx = ErrorContext::new("resume_conversion").with_job(job_id);
        let rctx = RecoveryContext::new(self.manager.store().clone());
        let job = run_recoverable(&self.recovery, &self.retry, &ctx, &rctx, || async move {
            self.manager.resume_conversion_job(job_id).await
        })
        .await?;

        let ctx = ErrorContext::new("dispatch_conversion")
            .with_job(job_id)
            .with_project(&job.project_id);
        let plan_id = &job.plan_id;
        let plan = run_recoverable(&self.recovery, &self.retry, &ctx, &rctx, || async move {
            self.manager
                .store()
                .get_plan(plan_id)
                .await
                .map_err(Failure::from)
        })
        .await?
        .ok_or_else(|| AppError::not_found(&job.plan_id, ctx.clone()))?;
        self.dispatch(&job, &plan, &ctx).await?;
        Ok(job)
    }

    pub async fn delete_conversion(&self, job_id: &str) -> Result<(), AppError> {
        let ctx = ErrorContext::new("delete_conversion").with_job(job_id);
        let rctx = RecoveryContext::new(self.manager.store().clone());
        run_recoverable(&self.recovery, &self.retry, &ctx, &rctx, || async move {
            self.manager.delete_conversion_job(job_id).await
        })
        .await
    }

    /// The current job record. An unknown (or deleted) id is a not-found
    /// error, not an empty result.
    pub async fn get_conversion_status(&self, job_id: &str) -> Result<ConversionJob, AppError> {
        self.manager.get_conversion_job(job_id).await?.ok_or_else(|| {
            AppError::not_found(
                job_id,
                ErrorContext::new("get_conversion_status").with_job(job_id),
            )
        })
    }

    pub async fn list_conversions(
        &self,
        project_id: Option<&str>,
    ) -> Result<Vec<ConversionJob>, AppError> {
        self.manager.list_conversion_jobs(project_id).await
    }

    pub async fn queue_stats(&self) -> Result<QueueStats, AppError> {
        let ctx = ErrorContext::new("queue_stats");
        self.adapter
            .queue_stats()
            .await
            .map_err(|e| crate::classify::classify(&Failure::from(e), ctx))
    }

    /// Register the progress observer for a job (at most one per job).
    pub async fn on_job_progress(
        &self,
        job_id: &str,
        callback: impl Fn(ProgressUpdate) + Send + Sync + 'static,
    ) {
        self.adapter.on_job_progress(job_id, callback).await;
    }

    pub async fn off_job_progress(&self, job_id: &str) {
        self.adapter.off_job_progress(job_id).await;
    }

    /// Signal workers to stop after their current item and drop observers.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.adapter.clear_observers().await;
        info!("orchestrator shutdown signalled");
    }

    /// Enqueue through the recovery and retry pipeline — a transient queue
    /// failure does not surface to the caller.
    async fn dispatch(
        &self,
        job: &ConversionJob,
        plan: &ConversionPlan,
        ctx: &ErrorContext,
    ) -> Result<(), AppError> {
        let rctx = RecoveryContext::new(self.manager.store().clone());
        let priority = self.config.worker.dispatch_priority;
        run_recoverable(&self.recovery, &self.retry, ctx, &rctx, || async move {
            self.adapter
                .dispatch_job(&job.id, &plan.project_id, plan, priority)
                .await
                .map(|_| ())
                .map_err(Failure::from)
        })
        .await
    }
}
