//! Job orchestration and error recovery for source-stack conversions.
//!
//! A conversion migrates a project from one framework stack to another by
//! running a validated plan of tasks (analysis, code generation, dependency
//! updates, validation) through pluggable executors. This crate owns the
//! durable job state machine, the dispatch queue, and the failure pipeline:
//! classify → recovery strategy → bounded retry → escalate.
//!
//! Entry point is [`ConversionOrchestrator`]; everything it composes is
//! injected, so tests and embedders can swap the store, queue backend, and
//! executors independently.

pub mod classify;
pub mod config;
pub mod error;
pub mod executor;
pub mod jobs;
pub mod observability;
pub mod orchestrator;
pub mod plan;
pub mod queue;
pub mod recovery;
pub mod retry;
pub mod store;
pub mod worker;

pub use classify::{classify, Failure, FailureOrigin};
pub use config::OrchestratorConfig;
pub use error::{AppError, ErrorCategory, ErrorContext, Severity};
pub use executor::{ExecutionContext, ExecutorRegistry, TaskExecutor, TaskOutput};
pub use jobs::{ConversionJob, JobManager, JobStatus};
pub use orchestrator::ConversionOrchestrator;
pub use plan::{AgentKind, Complexity, ConversionPlan, ConversionTask, TaskKind};
pub use queue::{MemoryQueue, ProgressUpdate, QueueAdapter, QueueBackend, QueueStats};
pub use recovery::{RecoveryOutcome, RecoveryRegistry, RecoverySettings, RecoveryStrategy};
pub use retry::{RetryExecutor, RetryPolicy};
pub use store::sqlite::SqliteJobStore;
pub use store::{JobStore, MemoryJobStore};
