//! Conversion plan data model.
//!
//! A [`ConversionPlan`] is the DAG of tasks required to migrate a project
//! from its source stack to a target stack. Plans are immutable once the
//! orchestrator accepts them; jobs reference plans, they never copy them.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Generate a prefixed short id, e.g. `plan-1b9f03aa`.
pub fn short_id(prefix: &str) -> String {
    let uuid = uuid::Uuid::new_v4().to_string();
    format!("{prefix}-{}", &uuid[..8])
}

// ── Enums ────────────────────────────────────────────────────────────────────

/// What a task does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Analysis,
    Planning,
    CodeGeneration,
    DependencyUpdate,
    ConfigUpdate,
    Validation,
    Integration,
}

/// Which executor class handles a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Analyzer,
    Planner,
    CodeGenerator,
    DependencyManager,
    ConfigMigrator,
    Validator,
    Integrator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

// ── Task ─────────────────────────────────────────────────────────────────────

/// One unit of conversion work. Immutable after plan creation except `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionTask {
    /// Unique within the plan.
    pub id: String,
    pub kind: TaskKind,
    pub description: String,
    /// Input file globs, e.g. `src/**/*.vue`.
    pub input_globs: Vec<String>,
    pub output_globs: Vec<String>,
    /// Task ids that must complete successfully first.
    pub dependencies: BTreeSet<String>,
    pub agent: AgentKind,
    /// Tie-break for independent tasks; higher runs first.
    pub priority: u8,
    pub status: TaskStatus,
    pub estimated_duration: Duration,
}

impl ConversionTask {
    pub fn new(id: impl Into<String>, kind: TaskKind, agent: AgentKind) -> Self {
        Self {
            id: id.into(),
            kind,
            description: String::new(),
            input_globs: Vec::new(),
            output_globs: Vec::new(),
            dependencies: BTreeSet::new(),
            agent,
            priority: 0,
            status: TaskStatus::Pending,
            estimated_duration: Duration::from_secs(60),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.insert(id.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

// ── Plan ─────────────────────────────────────────────────────────────────────

/// Structural problems found while validating a plan's task graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanGraphError {
    #[error("plan is marked not feasible")]
    NotFeasible,
    #[error("plan has no tasks")]
    Empty,
    #[error("duplicate task id {0:?}")]
    DuplicateTaskId(String),
    #[error("task {task:?} depends on unknown task {dependency:?}")]
    UnknownDependency { task: String, dependency: String },
    #[error("task {0:?} depends on itself")]
    SelfDependency(String),
    #[error("dependency cycle involving task {0:?}")]
    Cycle(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionPlan {
    pub id: String,
    pub project_id: String,
    /// Insertion order = authoring/readability order, not execution order.
    pub tasks: Vec<ConversionTask>,
    pub estimated_total_duration: Duration,
    pub complexity: Complexity,
    /// Human-readable caveats surfaced to the user before starting.
    pub warnings: Vec<String>,
    /// `false` short-circuits job creation.
    pub feasible: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversionPlan {
    pub fn new(project_id: impl Into<String>, tasks: Vec<ConversionTask>) -> Self {
        let now = Utc::now();
        let estimated_total_duration = tasks.iter().map(|t| t.estimated_duration).sum();
        Self {
            id: short_id("plan"),
            project_id: project_id.into(),
            tasks,
            estimated_total_duration,
            complexity: Complexity::Medium,
            warnings: Vec::new(),
            feasible: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn infeasible(mut self, warning: impl Into<String>) -> Self {
        self.feasible = false;
        self.warnings.push(warning.into());
        self
    }

    pub fn task(&self, id: &str) -> Option<&ConversionTask> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Validate the task graph: ids unique, dependencies resolvable, no
    /// self-deps, no cycles. Feasibility is checked first — an infeasible
    /// plan never reaches graph analysis.
    pub fn validate(&self) -> Result<(), PlanGraphError> {
        if !self.feasible {
            return Err(PlanGraphError::NotFeasible);
        }
        if self.tasks.is_empty() {
            return Err(PlanGraphError::Empty);
        }

        let mut ids = BTreeSet::new();
        for task in &self.tasks {
            if !ids.insert(task.id.as_str()) {
                return Err(PlanGraphError::DuplicateTaskId(task.id.clone()));
            }
        }
        for task in &self.tasks {
            for dep in &task.dependencies {
                if dep == &task.id {
                    return Err(PlanGraphError::SelfDependency(task.id.clone()));
                }
                if !ids.contains(dep.as_str()) {
                    return Err(PlanGraphError::UnknownDependency {
                        task: task.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        // Three-color DFS for cycle detection.
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            White,
            Gray,
            Black,
        }
        let index: HashMap<&str, usize> = self
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.as_str(), i))
            .collect();
        let mut marks = vec![Mark::White; self.tasks.len()];

        fn visit(
            i: usize,
            tasks: &[ConversionTask],
            index: &HashMap<&str, usize>,
            marks: &mut [Mark],
        ) -> Result<(), PlanGraphError> {
            marks[i] = Mark::Gray;
            for dep in &tasks[i].dependencies {
                let j = index[dep.as_str()];
                match marks[j] {
                    Mark::Gray => return Err(PlanGraphError::Cycle(tasks[j].id.clone())),
                    Mark::White => visit(j, tasks, index, marks)?,
                    Mark::Black => {}
                }
            }
            marks[i] = Mark::Black;
            Ok(())
        }

        for i in 0..self.tasks.len() {
            if marks[i] == Mark::White {
                visit(i, &self.tasks, &index, &mut marks)?;
            }
        }
        Ok(())
    }

    /// Derive the execution order: a topological order of the dependency
    /// graph. Among tasks whose dependencies are all satisfied, higher
    /// `priority` runs first; ties fall back to insertion order.
    ///
    /// The plan must already have passed [`validate`](Self::validate).
    pub fn execution_order(&self) -> Vec<&ConversionTask> {
        use std::cmp::Ordering;
        use std::collections::BinaryHeap;

        // Max-heap entry: higher priority pops first, then lower insertion index.
        struct Ready {
            priority: u8,
            index: usize,
        }
        impl PartialEq for Ready {
            fn eq(&self, other: &Self) -> bool {
                self.index == other.index
            }
        }
        impl Eq for Ready {}
        impl Ord for Ready {
            fn cmp(&self, other: &Self) -> Ordering {
                self.priority
                    .cmp(&other.priority)
                    .then(other.index.cmp(&self.index))
            }
        }
        impl PartialOrd for Ready {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        let index: HashMap<&str, usize> = self
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.as_str(), i))
            .collect();
        let mut remaining: Vec<usize> = self.tasks.iter().map(|t| t.dependencies.len()).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.tasks.len()];
        for (i, task) in self.tasks.iter().enumerate() {
            for dep in &task.dependencies {
                dependents[index[dep.as_str()]].push(i);
            }
        }

        let mut heap = BinaryHeap::new();
        for (i, task) in self.tasks.iter().enumerate() {
            if remaining[i] == 0 {
                heap.push(Ready {
                    priority: task.priority,
                    index: i,
                });
            }
        }

        let mut order = Vec::with_capacity(self.tasks.len());
        while let Some(ready) = heap.pop() {
            order.push(&self.tasks[ready.index]);
            for &dependent in &dependents[ready.index] {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    heap.push(Ready {
                        priority: self.tasks[dependent].priority,
                        index: dependent,
                    });
                }
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str) -> ConversionTask {
        ConversionTask::new(id, TaskKind::CodeGeneration, AgentKind::CodeGenerator)
    }

    fn plan(tasks: Vec<ConversionTask>) -> ConversionPlan {
        ConversionPlan::new("proj-1", tasks)
    }

    #[test]
    fn valid_chain_passes() {
        let p = plan(vec![
            task("a"),
            task("b").depends_on("a"),
            task("c").depends_on("b"),
        ]);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn two_task_cycle_is_rejected() {
        let p = plan(vec![task("a").depends_on("b"), task("b").depends_on("a")]);
        assert!(matches!(p.validate(), Err(PlanGraphError::Cycle(_))));
    }

    #[test]
    fn self_dependency_is_rejected() {
        let p = plan(vec![task("a").depends_on("a")]);
        assert_eq!(p.validate(), Err(PlanGraphError::SelfDependency("a".into())));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let p = plan(vec![task("a").depends_on("ghost")]);
        assert!(matches!(
            p.validate(),
            Err(PlanGraphError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn infeasible_plan_short_circuits() {
        let p = plan(vec![task("a")]).infeasible("source framework unsupported");
        assert_eq!(p.validate(), Err(PlanGraphError::NotFeasible));
    }

    #[test]
    fn duplicate_ids_rejected() {
        let p = plan(vec![task("a"), task("a")]);
        assert!(matches!(p.validate(), Err(PlanGraphError::DuplicateTaskId(_))));
    }

    #[test]
    fn execution_order_respects_dependencies() {
        let p = plan(vec![
            task("gen").depends_on("analyze"),
            task("analyze"),
            task("validate").depends_on("gen"),
        ]);
        p.validate().unwrap();
        let ids: Vec<&str> = p.execution_order().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["analyze", "gen", "validate"]);
    }

    #[test]
    fn priority_breaks_ties_between_independent_tasks() {
        let p = plan(vec![
            task("low").with_priority(1),
            task("high").with_priority(9),
            task("mid").with_priority(5),
        ]);
        let ids: Vec<&str> = p.execution_order().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["high", "mid", "low"]);
    }

    #[test]
    fn insertion_order_breaks_equal_priority() {
        let p = plan(vec![task("first"), task("second"), task("third")]);
        let ids: Vec<&str> = p.execution_order().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second", "third"]);
    }

    #[test]
    fn diamond_graph_orders_completely() {
        let p = plan(vec![
            task("root"),
            task("left").depends_on("root"),
            task("right").depends_on("root"),
            task("join").depends_on("left").depends_on("right"),
        ]);
        p.validate().unwrap();
        let order = p.execution_order();
        assert_eq!(order.len(), 4);
        assert_eq!(order[0].id, "root");
        assert_eq!(order[3].id, "join");
    }
}
