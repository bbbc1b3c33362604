//! Queue dispatch for conversion jobs.
//!
//! [`QueueAdapter`] bridges the job manager to a durable, at-least-once
//! queue backend. It enforces the one-work-item-per-job invariant, relays
//! progress to in-process observers, and exposes queue depth statistics.
//! The queue never owns job state — the record store stays authoritative and
//! queue contents are reconcilable from job records after a crash.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::classify::{Failure, FailureOrigin};
use crate::plan::{short_id, ConversionPlan};

// ── Work items ───────────────────────────────────────────────────────────────

/// One dispatchable unit of work: a whole conversion job.
///
/// Carries a plan snapshot so a worker can re-derive the task graph without
/// a store read, even after redelivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Opaque queue-item identifier.
    pub id: String,
    pub job_id: String,
    pub project_id: String,
    pub plan: ConversionPlan,
    /// Higher value = dequeued first. Ties are FIFO.
    pub priority: u8,
    /// Delivery attempt, incremented by the backend on redelivery.
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Earliest time the item may be reserved. `None` = immediately.
    pub not_before: Option<DateTime<Utc>>,
}

impl WorkItem {
    pub fn for_job(job_id: &str, project_id: &str, plan: &ConversionPlan, priority: u8) -> Self {
        Self {
            id: short_id("item"),
            job_id: job_id.to_string(),
            project_id: project_id.to_string(),
            plan: plan.clone(),
            priority,
            attempt: 0,
            enqueued_at: Utc::now(),
            not_before: None,
        }
    }
}

/// Terminal outcome a worker reports for a reserved item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    Completed,
    Failed,
    /// Dispatch stopped cooperatively; the item is parked until the job is
    /// resumed (re-dispatch) or deleted.
    Paused,
}

/// Per-state depth counts. Operational visibility, not correctness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
    pub paused: usize,
}

#[derive(Debug, thiserror::Error)]
#[error("queue backend error: {0}")]
pub struct QueueError(pub String);

impl From<QueueError> for Failure {
    fn from(err: QueueError) -> Self {
        Failure::msg(err.0).with_origin(FailureOrigin::Queue)
    }
}

/// Durable queue backend: dispatch only, never a state store.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Enqueue an item; returns its opaque id.
    async fn enqueue(&self, item: WorkItem) -> Result<String, QueueError>;
    /// Reserve the next due item (highest priority, FIFO within a tier).
    async fn reserve(&self) -> Result<Option<WorkItem>, QueueError>;
    /// Report the outcome for a reserved item.
    async fn finish(&self, item_id: &str, outcome: WorkOutcome) -> Result<(), QueueError>;
    /// Best-effort removal of any not-yet-active item for a job
    /// (waiting, delayed, or parked). Cannot stop an item already reserved.
    async fn discard_job(&self, job_id: &str) -> Result<bool, QueueError>;
    /// Move any parked item for a job back to waiting. Returns `true` when
    /// an item was promoted.
    async fn promote_job(&self, job_id: &str) -> Result<bool, QueueError>;
    async fn stats(&self) -> Result<QueueStats, QueueError>;
}

// ── In-process backend ───────────────────────────────────────────────────────

struct QueuedEntry(WorkItem);

impl PartialEq for QueuedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}
impl Eq for QueuedEntry {}
impl Ord for QueuedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority pops first, then FIFO by enqueue time.
        self.0
            .priority
            .cmp(&other.0.priority)
            .then(other.0.enqueued_at.cmp(&self.0.enqueued_at))
    }
}
impl PartialOrd for QueuedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct MemoryQueueInner {
    waiting: BinaryHeap<QueuedEntry>,
    /// Items with a `not_before` still in the future.
    delayed: Vec<WorkItem>,
    /// item id → item, currently reserved by a worker.
    active: HashMap<String, WorkItem>,
    /// item id → item, parked by a cooperative pause.
    parked: HashMap<String, WorkItem>,
    completed: usize,
    failed: usize,
}

impl MemoryQueueInner {
    /// Move due delayed items into the waiting heap.
    fn promote_due(&mut self) {
        let now = Utc::now();
        let mut still_delayed = Vec::new();
        for item in self.delayed.drain(..) {
            match item.not_before {
                Some(at) if at > now => still_delayed.push(item),
                _ => self.waiting.push(QueuedEntry(item)),
            }
        }
        self.delayed = still_delayed;
    }
}

/// In-process queue backend with priority ordering and delayed delivery.
#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<MemoryQueueInner>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn enqueue(&self, item: WorkItem) -> Result<String, QueueError> {
        let mut inner = self.inner.lock().await;
        // A re-dispatch for a resumed job supersedes its parked item.
        inner.parked.retain(|_, parked| parked.job_id != item.job_id);
        let id = item.id.clone();
        let delayed = matches!(item.not_before, Some(at) if at > Utc::now());
        if delayed {
            inner.delayed.push(item);
        } else {
            inner.waiting.push(QueuedEntry(item));
        }
        Ok(id)
    }

    async fn reserve(&self) -> Result<Option<WorkItem>, QueueError> {
        let mut inner = self.inner.lock().await;
        inner.promote_due();
        let Some(QueuedEntry(mut item)) = inner.waiting.pop() else {
            return Ok(None);
        };
        item.attempt += 1;
        inner.active.insert(item.id.clone(), item.clone());
        Ok(Some(item))
    }

    async fn finish(&self, item_id: &str, outcome: WorkOutcome) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let Some(item) = inner.active.remove(item_id) else {
            return Err(QueueError(format!("item {item_id} is not active")));
        };
        match outcome {
            WorkOutcome::Completed => inner.completed += 1,
            WorkOutcome::Failed => inner.failed += 1,
            WorkOutcome::Paused => {
                inner.parked.insert(item.id.clone(), item);
            }
        }
        Ok(())
    }

    async fn discard_job(&self, job_id: &str) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock().await;
        let before = inner.waiting.len() + inner.delayed.len() + inner.parked.len();
        let kept: Vec<WorkItem> = inner
            .waiting
            .drain()
            .map(|e| e.0)
            .filter(|item| item.job_id != job_id)
            .collect();
        inner.waiting = kept.into_iter().map(QueuedEntry).collect();
        inner.delayed.retain(|item| item.job_id != job_id);
        inner.parked.retain(|_, item| item.job_id != job_id);
        Ok(inner.waiting.len() + inner.delayed.len() + inner.parked.len() < before)
    }

    async fn promote_job(&self, job_id: &str) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock().await;
        let ids: Vec<String> = inner
            .parked
            .values()
            .filter(|item| item.job_id == job_id)
            .map(|item| item.id.clone())
            .collect();
        for id in &ids {
            if let Some(item) = inner.parked.remove(id) {
                inner.waiting.push(QueuedEntry(item));
            }
        }
        Ok(!ids.is_empty())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut inner = self.inner.lock().await;
        inner.promote_due();
        Ok(QueueStats {
            waiting: inner.waiting.len(),
            active: inner.active.len(),
            completed: inner.completed,
            failed: inner.failed,
            delayed: inner.delayed.len(),
            paused: inner.parked.len(),
        })
    }
}

// ── Progress relay ───────────────────────────────────────────────────────────

/// Progress snapshot delivered to in-process observers.
///
/// Best-effort observability only — consumers needing guaranteed state must
/// re-read the job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub job_id: String,
    /// 0–100.
    pub progress: u8,
    pub current_task: String,
    pub completed_tasks: usize,
    pub total_tasks: usize,
}

type ProgressCallback = Box<dyn Fn(ProgressUpdate) + Send + Sync + 'static>;

// ── Adapter ──────────────────────────────────────────────────────────────────

#[derive(Default)]
struct InflightState {
    /// job id → queue item id, for jobs currently dispatched.
    items: HashMap<String, String>,
    /// Jobs re-dispatched while their previous item was still in flight.
    /// A park arriving after the re-dispatch requeues instead of parking.
    resumed: HashSet<String>,
}

/// Bridges jobs onto the queue backend and relays progress.
pub struct QueueAdapter {
    backend: Arc<dyn QueueBackend>,
    inflight: Mutex<InflightState>,
    observers: Mutex<HashMap<String, ProgressCallback>>,
}

impl QueueAdapter {
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self {
            backend,
            inflight: Mutex::new(InflightState::default()),
            observers: Mutex::new(HashMap::new()),
        }
    }

    /// Enqueue one work item for a job entering `running`.
    ///
    /// Duplicate dispatch for a job whose previous item is still tracked
    /// returns the existing item id. If that item was already parked it is
    /// promoted back to waiting here; if it is still held by a worker the
    /// job is flagged so a subsequent park requeues the item — a resume
    /// racing the worker's park must never strand a running job behind a
    /// parked item.
    pub async fn dispatch_job(
        &self,
        job_id: &str,
        project_id: &str,
        plan: &ConversionPlan,
        priority: u8,
    ) -> Result<String, QueueError> {
        let mut inflight = self.inflight.lock().await;
        if let Some(existing) = inflight.items.get(job_id).cloned() {
            if self.backend.promote_job(job_id).await? {
                debug!(job_id, item_id = %existing, "re-dispatch promoted the parked item");
            } else {
                inflight.resumed.insert(job_id.to_string());
                warn!(job_id, item_id = %existing, "duplicate dispatch — item still in flight");
            }
            return Ok(existing);
        }
        let item = WorkItem::for_job(job_id, project_id, plan, priority);
        let item_id = self.backend.enqueue(item).await?;
        inflight.items.insert(job_id.to_string(), item_id.clone());
        inflight.resumed.remove(job_id);
        debug!(job_id, item_id = %item_id, "work item enqueued");
        Ok(item_id)
    }

    /// Reserve the next due work item, if any.
    pub async fn next_work(&self) -> Result<Option<WorkItem>, QueueError> {
        self.backend.reserve().await
    }

    /// Report the outcome of a reserved item and release the job's in-flight
    /// slot. A parked (paused) item stays with the backend for stats until
    /// the job is re-dispatched or deleted — unless the job was already
    /// re-dispatched, in which case the item goes straight back to waiting.
    pub async fn finish_item(
        &self,
        job_id: &str,
        item_id: &str,
        outcome: WorkOutcome,
    ) -> Result<(), QueueError> {
        let mut inflight = self.inflight.lock().await;
        self.backend.finish(item_id, outcome).await?;
        let resumed = inflight.resumed.remove(job_id);
        if outcome == WorkOutcome::Paused && resumed {
            // A resume raced this park: the job is running again and this
            // was its only item, so requeue it instead of parking.
            self.backend.promote_job(job_id).await?;
            debug!(job_id, item_id, "parked item requeued for resumed job");
            return Ok(());
        }
        inflight.items.remove(job_id);
        Ok(())
    }

    /// Best-effort cancellation for a deleted job: removes any pending item
    /// and drops the progress observer. Work already reserved by a worker is
    /// allowed to finish; the worker notices the missing job record.
    pub async fn cancel_job(&self, job_id: &str) -> Result<(), QueueError> {
        {
            let mut inflight = self.inflight.lock().await;
            inflight.items.remove(job_id);
            inflight.resumed.remove(job_id);
        }
        self.backend.discard_job(job_id).await?;
        self.off_job_progress(job_id).await;
        Ok(())
    }

    pub async fn queue_stats(&self) -> Result<QueueStats, QueueError> {
        self.backend.stats().await
    }

    /// Register the progress observer for a job. At most one per job id —
    /// a second registration replaces the first.
    pub async fn on_job_progress(
        &self,
        job_id: &str,
        callback: impl Fn(ProgressUpdate) + Send + Sync + 'static,
    ) {
        let mut observers = self.observers.lock().await;
        if observers
            .insert(job_id.to_string(), Box::new(callback))
            .is_some()
        {
            warn!(job_id, "progress observer replaced");
        }
    }

    pub async fn off_job_progress(&self, job_id: &str) {
        self.observers.lock().await.remove(job_id);
    }

    /// Deliver a progress update to the job's observer, if registered.
    pub async fn emit_progress(&self, update: ProgressUpdate) {
        let observers = self.observers.lock().await;
        if let Some(callback) = observers.get(&update.job_id) {
            callback(update);
        }
    }

    /// Drop all observers (shutdown).
    pub async fn clear_observers(&self) {
        self.observers.lock().await.clear();
    }
}
