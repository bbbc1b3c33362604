//! Task executor interface.
//!
//! A task executor is the component that actually performs one conversion
//! task — e.g. invoking an AI model to rewrite a file. Executors live
//! outside this core: here is only the seam they plug into, keyed by the
//! task's agent kind.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::classify::Failure;
use crate::plan::{AgentKind, ConversionPlan, ConversionTask};

/// Per-invocation context an executor may consult.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub job_id: String,
    pub project_id: String,
    pub user_id: Option<String>,
    /// Set after a syntax failure: generate conservatively, prefer
    /// compilable output over idiomatic output.
    pub strict_mode: bool,
    /// Split inputs into this many chunks (1 = whole input at once).
    /// Raised after a context-length failure.
    pub chunk_divisor: u32,
    /// Ceiling for one invocation; exceeding it is treated as a failure.
    pub timeout: Duration,
}

/// What a successful task invocation produced.
#[derive(Debug, Clone, Default)]
pub struct TaskOutput {
    pub summary: String,
    pub output_files: Vec<String>,
}

/// Executes one conversion task. Failures are raw [`Failure`]s — the caller
/// classifies them and routes them through recovery and retry.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(
        &self,
        task: &ConversionTask,
        plan: &ConversionPlan,
        ctx: &ExecutionContext,
    ) -> Result<TaskOutput, Failure>;
}

/// Executors keyed by agent kind.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<AgentKind, Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: AgentKind, executor: Arc<dyn TaskExecutor>) {
        self.executors.insert(agent, executor);
    }

    pub fn get(&self, agent: AgentKind) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.get(&agent).cloned()
    }

    /// Register one executor for every agent kind.
    pub fn with_fallback(executor: Arc<dyn TaskExecutor>) -> Self {
        let mut registry = Self::new();
        for agent in [
            AgentKind::Analyzer,
            AgentKind::Planner,
            AgentKind::CodeGenerator,
            AgentKind::DependencyManager,
            AgentKind::ConfigMigrator,
            AgentKind::Validator,
            AgentKind::Integrator,
        ] {
            registry.register(agent, executor.clone());
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::TaskKind;

    struct Noop;

    #[async_trait]
    impl TaskExecutor for Noop {
        async fn execute(
            &self,
            task: &ConversionTask,
            _plan: &ConversionPlan,
            _ctx: &ExecutionContext,
        ) -> Result<TaskOutput, Failure> {
            Ok(TaskOutput {
                summary: format!("done: {}", task.id),
                output_files: Vec::new(),
            })
        }
    }

    #[test]
    fn registry_lookup_by_agent_kind() {
        let mut registry = ExecutorRegistry::new();
        registry.register(AgentKind::Analyzer, Arc::new(Noop));
        assert!(registry.get(AgentKind::Analyzer).is_some());
        assert!(registry.get(AgentKind::Validator).is_none());
    }

    #[tokio::test]
    async fn fallback_covers_every_agent_kind() {
        let registry = ExecutorRegistry::with_fallback(Arc::new(Noop));
        let task = ConversionTask::new("t", TaskKind::Validation, AgentKind::Validator);
        let plan = ConversionPlan::new("p", vec![task.clone()]);
        let executor = registry.get(AgentKind::Validator).unwrap();
        let out = executor
            .execute(
                &task,
                &plan,
                &ExecutionContext {
                    job_id: "job-1".into(),
                    project_id: "p".into(),
                    user_id: None,
                    strict_mode: false,
                    chunk_divisor: 1,
                    timeout: Duration::from_secs(5),
                },
            )
            .await
            .unwrap();
        assert_eq!(out.summary, "done: t");
    }
}
