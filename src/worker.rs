//! Queue worker: executes dispatched conversion jobs one task at a time.
//!
//! A worker reserves one work item, re-derives the task order from the plan
//! snapshot, and runs each task through the recovery and retry pipeline. Job
//! status is re-read from the store at every task boundary — that is where a
//! cooperative pause or an out-of-band delete takes effect. The in-flight
//! task is never interrupted mid-execution (except by its own timeout).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::classify::Failure;
use crate::config::WorkerConfig;
use crate::error::{AppError, ErrorContext};
use crate::executor::{ExecutionContext, ExecutorRegistry, TaskOutput};
use crate::jobs::{ConversionJob, JobManager, JobStatus};
use crate::plan::ConversionTask;
use crate::queue::{ProgressUpdate, QueueAdapter, WorkItem, WorkOutcome};
use crate::recovery::{run_recoverable, ChunkScope, RecoveryContext, RecoveryRegistry};
use crate::retry::RetryExecutor;

/// How to proceed after re-reading the job at a task boundary.
enum Checkpoint {
    Continue,
    Park,
    Drop(WorkOutcome),
}

/// Tasks already completed for a resumed job, derived from stored progress.
/// Progress is written as `done * 100 / total`; the rounding correction
/// inverts that exactly for plans of up to 50 tasks. Larger plans can
/// undershoot by one, re-running an already-completed task — the queue is
/// at-least-once, so executors must tolerate that anyway.
fn resume_point(progress: u8, total: usize) -> usize {
    (progress as usize * total + 50) / 100
}

fn task_label(task: &ConversionTask) -> String {
    if task.description.is_empty() {
        task.id.clone()
    } else {
        task.description.clone()
    }
}

pub struct Worker {
    manager: Arc<JobManager>,
    adapter: Arc<QueueAdapter>,
    executors: Arc<ExecutorRegistry>,
    recovery: Arc<RecoveryRegistry>,
    retry: RetryExecutor,
    config: WorkerConfig,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    pub fn new(
        manager: Arc<JobManager>,
        adapter: Arc<QueueAdapter>,
        executors: Arc<ExecutorRegistry>,
        recovery: Arc<RecoveryRegistry>,
        retry: RetryExecutor,
        config: WorkerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
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

    /// Poll-and-execute loop. Returns when the shutdown signal flips.
    pub async fn run(mut self) {
        info!("conversion worker started");
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            match self.adapter.next_work().await {
                Ok(Some(item)) => self.process_item(item).await,
                Ok(None) => {
                    tokio::select! {
                        _ = self.shutdown.changed() => {}
                        _ = tokio::time::sleep(self.config.poll_interval()) => {}
                    }
                }
                Err(err) => {
                    warn!(error = %err, "queue reserve failed");
                    tokio::time::sleep(self.config.poll_interval()).await;
                }
            }
        }
        info!("conversion worker stopped");
    }

    async fn process_item(&self, item: WorkItem) {
        let job = match self.manager.get_conversion_job(&item.job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                debug!(job_id = %item.job_id, "job deleted before pickup — dropping work item");
                self.finish(&item, WorkOutcome::Completed).await;
                return;
            }
            Err(err) => {
                warn!(job_id = %item.job_id, error = %err, "store read failed — abandoning work item");
                self.finish(&item, WorkOutcome::Failed).await;
                return;
            }
        };
        match job.status {
            JobStatus::Running => self.run_job(&item, &job).await,
            // Paused before pickup, or dispatched ahead of the start CAS:
            // park until a re-dispatch supersedes the item.
            JobStatus::Paused | JobStatus::Pending => {
                self.finish(&item, WorkOutcome::Paused).await;
            }
            // Redelivery of settled work.
            JobStatus::Completed => self.finish(&item, WorkOutcome::Completed).await,
            JobStatus::Failed => self.finish(&item, WorkOutcome::Failed).await,
        }
    }

    async fn run_job(&self, item: &WorkItem, job: &ConversionJob) {
        let order = item.plan.execution_order();
        let total = order.len();
        if total == 0 {
            self.complete(item, &job.id, 0).await;
            return;
        }
        let skip = resume_point(job.progress, total).min(total);
        if skip > 0 {
            debug!(job_id = %job.id, skip, total, "resuming past completed tasks");
        }

        for (index, task) in order.iter().enumerate().skip(skip) {
            match self.checkpoint(&job.id).await {
                Checkpoint::Continue => {}
                Checkpoint::Park => {
                    info!(job_id = %job.id, task = %task.id, "pause observed — parking at task boundary");
                    self.finish(item, WorkOutcome::Paused).await;
                    return;
                }
                Checkpoint::Drop(outcome) => {
                    self.finish(item, outcome).await;
                    return;
                }
            }

            let label = task_label(task);
            let progress = (index * 100 / total) as u8;
            if let Err(err) = self.manager.update_progress(&job.id, progress, &label).await {
                debug!(job_id = %job.id, error = %err, "progress write refused");
            }
            self.emit(&job.id, progress, &label, index, total).await;

            match self.run_task(item, &job.id, task).await {
                Ok(output) => {
                    let done = index + 1;
                    let progress = (done * 100 / total) as u8;
                    if let Err(err) = self.manager.update_progress(&job.id, progress, &label).await
                    {
                        // Paused or deleted mid-task; the next boundary
                        // checkpoint settles the item.
                        debug!(job_id = %job.id, error = %err, "progress write refused");
                    }
                    self.emit(&job.id, progress, &label, done, total).await;
                    debug!(job_id = %job.id, task = %task.id, summary = %output.summary, "task completed");
                }
                Err(err) => {
                    error!(
                        job_id = %job.id,
                        task = %task.id,
                        code = err.code,
                        category = ?err.category,
                        error = %err,
                        "task failed after recovery and retry"
                    );
                    if let Err(mark_err) =
                        self.manager.mark_as_failed(&job.id, &err.user_message).await
                    {
                        warn!(job_id = %job.id, error = %mark_err, "could not record job failure");
                    }
                    self.finish(item, WorkOutcome::Failed).await;
                    return;
                }
            }
        }
        self.complete(item, &job.id, total).await;
    }

    /// One task through the full pipeline: timeout-guarded execution,
    /// classification, recovery strategies, bounded retry.
    async fn run_task(
        &self,
        item: &WorkItem,
        job_id: &str,
        task: &ConversionTask,
    ) -> Result<TaskOutput, AppError> {
        let ctx = ErrorContext::new("execute_task")
            .with_job(job_id)
            .with_project(&item.project_id)
            .with_meta("task_id", task.id.clone());
        let executor = self.executors.get(task.agent).ok_or_else(|| {
            AppError::validation(
                format!("no executor registered for agent {:?}", task.agent),
                ctx.clone(),
            )
        })?;

        let strict = Arc::new(AtomicBool::new(false));
        let scope = Arc::new(ChunkScope::new(self.config.max_chunk_divisor));
        let rctx = RecoveryContext::new(self.manager.store().clone())
            .with_scope(scope.clone())
            .with_strict_mode(strict.clone());
        let timeout = self.config.task_timeout();

        run_recoverable(&self.recovery, &self.retry, &ctx, &rctx, || {
            let executor = executor.clone();
            // Re-read the knobs each attempt — recovery may have adjusted them.
            let exec_ctx = ExecutionContext {
                job_id: job_id.to_string(),
                project_id: item.project_id.clone(),
                user_id: None,
                strict_mode: strict.load(Ordering::Relaxed),
                chunk_divisor: scope.divisor(),
                timeout,
            };
            async move {
                match tokio::time::timeout(timeout, executor.execute(task, &item.plan, &exec_ctx))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(Failure::msg(format!(
                        "task {} timed out after {}s",
                        task.id,
                        timeout.as_secs()
                    ))),
                }
            }
        })
        .await
    }

    async fn complete(&self, item: &WorkItem, job_id: &str, total: usize) {
        let summary = format!("{total} tasks completed");
        match self.manager.mark_as_completed(job_id, Some(summary.clone())).await {
            Ok(()) => {
                self.emit(job_id, 100, &summary, total, total).await;
                self.finish(item, WorkOutcome::Completed).await;
            }
            // Paused after the last task, or deleted; settle by the same
            // boundary rule as mid-run.
            Err(err) => match self.checkpoint(job_id).await {
                Checkpoint::Park => self.finish(item, WorkOutcome::Paused).await,
                Checkpoint::Drop(outcome) => self.finish(item, outcome).await,
                Checkpoint::Continue => {
                    warn!(job_id, error = %err, "completion refused for a running job");
                    self.finish(item, WorkOutcome::Failed).await;
                }
            },
        }
    }

    async fn checkpoint(&self, job_id: &str) -> Checkpoint {
        match self.manager.get_conversion_job(job_id).await {
            Ok(Some(job)) => match job.status {
                JobStatus::Running => Checkpoint::Continue,
                JobStatus::Paused | JobStatus::Pending => Checkpoint::Park,
                JobStatus::Completed => Checkpoint::Drop(WorkOutcome::Completed),
                JobStatus::Failed => Checkpoint::Drop(WorkOutcome::Failed),
            },
            Ok(None) => {
                debug!(job_id, "job deleted — dropping its work item");
                Checkpoint::Drop(WorkOutcome::Completed)
            }
            Err(err) => {
                warn!(job_id, error = %err, "store read failed at task boundary");
                Checkpoint::Drop(WorkOutcome::Failed)
            }
        }
    }

    async fn emit(&self, job_id: &str, progress: u8, label: &str, done: usize, total: usize) {
        self.adapter
            .emit_progress(ProgressUpdate {
                job_id: job_id.to_string(),
                progress,
                current_task: label.to_string(),
                completed_tasks: done,
                total_tasks: total,
            })
            .await;
    }

    async fn finish(&self, item: &WorkItem, outcome: WorkOutcome) {
        if let Err(err) = self
            .adapter
            .finish_item(&item.job_id, &item.id, outcome)
            .await
        {
            warn!(item_id = %item.id, error = %err, "could not settle work item");
        }
    }
}
