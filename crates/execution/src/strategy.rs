//! Orchestration strategies.
//!
//! Every strategy turns a [`TaskSet`] into a [`RunPlan`] and then drives the
//! plan through the [`TaskRunner`]. They differ in how many tasks run at once
//! and in what a failure does to the rest of the run.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use runway_core::{Capability, RecordId, TaskKind, Time};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::dependency::build_waves;
use crate::discovery::{DiscoveredTask, TaskSet};
use crate::error::{DiscoveryError, Result};
use crate::machine::{Outcome, RollbackReport, TaskRunner};
use crate::queue::JobQueue;
use crate::scheduler::{Schedule, Slot};

/// Forces every task onto one dispatch path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchOverride {
    Sync,
    Async,
}

/// How a planned task will be dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "mode")]
pub enum DispatchMode {
    /// Run in this process
    Inline,
    /// Hand to the job queue
    Queue { queue: String },
}

/// A task placed in a plan.
#[derive(Debug, Clone)]
pub struct PlannedTask {
    pub task: DiscoveredTask,
    pub mode: DispatchMode,
    /// Dispatch delay (scheduled strategy only)
    pub delay: Duration,
}

impl PlannedTask {
    pub fn name(&self) -> &str {
        &self.task.meta.name
    }
}

/// A task left pending because it is not due yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeferredTask {
    pub name: String,
    pub due: Time,
}

/// What a strategy intends to do, in order.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub strategy: StrategyKind,
    /// Groups in execution order. Whether a group runs one task at a time or
    /// all at once is up to the strategy.
    pub waves: Vec<Vec<PlannedTask>>,
    pub deferred: Vec<DeferredTask>,
}

impl RunPlan {
    /// Planned task names, flattened in execution order.
    pub fn names(&self) -> Vec<String> {
        self.waves
            .iter()
            .flatten()
            .map(|t| t.name().to_string())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.waves.iter().all(Vec::is_empty)
    }

    fn empty(strategy: StrategyKind) -> Self {
        Self {
            strategy,
            waves: Vec::new(),
            deferred: Vec::new(),
        }
    }
}

/// Inputs to planning beyond the task set.
#[derive(Debug, Clone)]
pub struct PlanOptions {
    pub dispatch: Option<DispatchOverride>,
    /// Queue used when neither the run nor the task names one
    pub default_queue: String,
    /// Queue forced for this run
    pub queue: Option<String>,
    pub schedule: Schedule,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            dispatch: None,
            default_queue: "default".to_string(),
            queue: None,
            schedule: Schedule::default(),
        }
    }
}

impl PlanOptions {
    fn queue_for(&self, task: &DiscoveredTask) -> String {
        self.queue
            .clone()
            .or_else(|| task.task.queue())
            .unwrap_or_else(|| self.default_queue.clone())
    }

    /// Dispatch mode for a task under this run's override.
    pub fn mode_for(&self, task: &DiscoveredTask) -> DispatchMode {
        let queued = match self.dispatch {
            Some(DispatchOverride::Sync) => false,
            Some(DispatchOverride::Async) => true,
            None => task.capabilities().contains(Capability::Asynchronous),
        };
        if queued {
            DispatchMode::Queue {
                queue: self.queue_for(task),
            }
        } else {
            DispatchMode::Inline
        }
    }

    fn place(&self, task: &DiscoveredTask) -> PlannedTask {
        PlannedTask {
            task: task.clone(),
            mode: self.mode_for(task),
            delay: Duration::ZERO,
        }
    }
}

/// What a strategy needs to execute a plan.
pub struct RunContext<'a> {
    pub runner: &'a TaskRunner,
    pub queue: &'a dyn JobQueue,
    /// Record tasks as completed without running them
    pub fake: bool,
}

/// Outcome of one task within a run.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub name: String,
    pub kind: TaskKind,
    pub record_id: RecordId,
    pub outcome: Outcome,
    /// Undone by a later failure
    pub rolled_back: bool,
    /// A failure the strategy tolerated
    pub tolerated: bool,
}

impl TaskReport {
    /// Whether this task fails the run.
    pub fn is_fatal(&self) -> bool {
        self.outcome.is_failure() && !self.tolerated
    }
}

/// Everything a strategy did.
#[derive(Debug, Clone, Default)]
pub struct StrategyResult {
    pub reports: Vec<TaskReport>,
    /// Planned tasks never started because the run halted
    pub not_run: Vec<String>,
    pub rollbacks: Vec<RollbackReport>,
}

impl StrategyResult {
    /// Whether any task failed without being tolerated.
    pub fn failed(&self) -> bool {
        self.reports.iter().any(TaskReport::is_fatal)
    }

    fn absorb_rollbacks(&mut self, rollbacks: Vec<RollbackReport>) {
        for rollback in &rollbacks {
            if rollback.error.is_none() {
                if let Some(report) = self
                    .reports
                    .iter_mut()
                    .find(|r| r.record_id == rollback.record_id)
                {
                    report.rolled_back = true;
                }
            }
        }
        self.rollbacks.extend(rollbacks);
    }
}

/// A way of driving a plan.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Which strategy this is.
    fn kind(&self) -> StrategyKind;

    /// Order and group the selected tasks.
    fn plan(&self, set: &TaskSet, options: &PlanOptions) -> std::result::Result<RunPlan, DiscoveryError>;

    /// Execute a plan produced by [`Strategy::plan`].
    async fn execute(&self, plan: &RunPlan, ctx: &RunContext<'_>) -> Result<StrategyResult>;
}

/// The built-in strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    #[default]
    Sequential,
    Batch,
    TransactionalBatch,
    AllowedToFailBatch,
    DependencyWave,
    Scheduled,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 6] = [
        StrategyKind::Sequential,
        StrategyKind::Batch,
        StrategyKind::TransactionalBatch,
        StrategyKind::AllowedToFailBatch,
        StrategyKind::DependencyWave,
        StrategyKind::Scheduled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Sequential => "sequential",
            StrategyKind::Batch => "batch",
            StrategyKind::TransactionalBatch => "transactional-batch",
            StrategyKind::AllowedToFailBatch => "allowed-to-fail-batch",
            StrategyKind::DependencyWave => "dependency-wave",
            StrategyKind::Scheduled => "scheduled",
        }
    }

    /// The strategy implementation.
    pub fn strategy(&self) -> Box<dyn Strategy> {
        match self {
            StrategyKind::Sequential => Box::new(Sequential),
            StrategyKind::Batch => Box::new(Batch::new(BatchPolicy::FailGroup)),
            StrategyKind::TransactionalBatch => Box::new(Batch::new(BatchPolicy::RollbackAll)),
            StrategyKind::AllowedToFailBatch => Box::new(Batch::new(BatchPolicy::TolerateFlagged)),
            StrategyKind::DependencyWave => Box::new(DependencyWave),
            StrategyKind::Scheduled => Box::new(Scheduled),
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('_', "-");
        StrategyKind::ALL
            .into_iter()
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| {
                let known: Vec<_> = StrategyKind::ALL.iter().map(|k| k.as_str()).collect();
                format!("unknown strategy '{}' (expected one of: {})", s, known.join(", "))
            })
    }
}

/// Run one planned task along its dispatch path.
async fn run_one(planned: &PlannedTask, ctx: &RunContext<'_>) -> Result<TaskReport> {
    let task = &planned.task;
    let (record_id, outcome) = if ctx.fake {
        ctx.runner.fake(task).await?
    } else {
        match &planned.mode {
            DispatchMode::Inline => ctx.runner.execute(task).await?,
            DispatchMode::Queue { queue } => {
                ctx.runner
                    .dispatch(task, ctx.queue, queue, planned.delay)
                    .await?
            }
        }
    };
    Ok(TaskReport {
        name: task.meta.name.clone(),
        kind: task.meta.kind,
        record_id,
        outcome,
        rolled_back: false,
        tolerated: false,
    })
}

/// Run a group concurrently and wait for every task to finish.
async fn run_group(group: &[PlannedTask], ctx: &RunContext<'_>) -> Result<Vec<TaskReport>> {
    join_all(group.iter().map(|planned| run_one(planned, ctx)))
        .await
        .into_iter()
        .collect()
}

/// Run tasks one at a time; the first failure halts the run and rolls back
/// what already completed.
async fn run_sequential(tasks: &[PlannedTask], ctx: &RunContext<'_>) -> Result<StrategyResult> {
    let mut result = StrategyResult::default();
    for (i, planned) in tasks.iter().enumerate() {
        let report = run_one(planned, ctx).await?;
        let failed = report.is_fatal();
        result.reports.push(report);
        if failed {
            warn!("{} failed, halting and rolling back", planned.name());
            result.not_run = tasks[i + 1..].iter().map(|t| t.name().to_string()).collect();
            let rollbacks = ctx.runner.rollback_completed().await?;
            result.absorb_rollbacks(rollbacks);
            break;
        }
    }
    Ok(result)
}

/// One task at a time in timestamp order.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sequential;

#[async_trait]
impl Strategy for Sequential {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Sequential
    }

    fn plan(&self, set: &TaskSet, options: &PlanOptions) -> std::result::Result<RunPlan, DiscoveryError> {
        let mut plan = RunPlan::empty(self.kind());
        if !set.is_empty() {
            plan.waves.push(set.selected.iter().map(|t| options.place(t)).collect());
        }
        Ok(plan)
    }

    async fn execute(&self, plan: &RunPlan, ctx: &RunContext<'_>) -> Result<StrategyResult> {
        let tasks: Vec<PlannedTask> = plan.waves.iter().flatten().cloned().collect();
        run_sequential(&tasks, ctx).await
    }
}

/// What a concurrent batch does when a task fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPolicy {
    /// Any failure fails the group; nothing is undone
    FailGroup,
    /// Any failure rolls back every completed task, newest first
    RollbackAll,
    /// Failures of failure-tolerant tasks are logged and ignored
    TolerateFlagged,
}

/// All tasks at once.
#[derive(Debug, Clone, Copy)]
pub struct Batch {
    policy: BatchPolicy,
}

impl Batch {
    pub fn new(policy: BatchPolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl Strategy for Batch {
    fn kind(&self) -> StrategyKind {
        match self.policy {
            BatchPolicy::FailGroup => StrategyKind::Batch,
            BatchPolicy::RollbackAll => StrategyKind::TransactionalBatch,
            BatchPolicy::TolerateFlagged => StrategyKind::AllowedToFailBatch,
        }
    }

    fn plan(&self, set: &TaskSet, options: &PlanOptions) -> std::result::Result<RunPlan, DiscoveryError> {
        let mut plan = RunPlan::empty(self.kind());
        if !set.is_empty() {
            plan.waves.push(set.selected.iter().map(|t| options.place(t)).collect());
        }
        Ok(plan)
    }

    async fn execute(&self, plan: &RunPlan, ctx: &RunContext<'_>) -> Result<StrategyResult> {
        let mut result = StrategyResult::default();
        for group in &plan.waves {
            let mut reports = run_group(group, ctx).await?;

            if self.policy == BatchPolicy::TolerateFlagged {
                for (report, planned) in reports.iter_mut().zip(group) {
                    if report.outcome.is_failure()
                        && planned.task.capabilities().contains(Capability::FailureTolerant)
                    {
                        warn!("{} failed but is allowed to fail", report.name);
                        report.tolerated = true;
                    }
                }
            }
            result.reports.extend(reports);

            if result.failed() {
                if self.policy == BatchPolicy::RollbackAll {
                    warn!("Batch failed, rolling back completed tasks");
                    let rollbacks = ctx.runner.rollback_completed().await?;
                    result.absorb_rollbacks(rollbacks);
                }
                break;
            }
        }
        Ok(result)
    }
}

/// Waves of independent tasks; each wave runs concurrently.
#[derive(Debug, Clone, Copy, Default)]
pub struct DependencyWave;

#[async_trait]
impl Strategy for DependencyWave {
    fn kind(&self) -> StrategyKind {
        StrategyKind::DependencyWave
    }

    fn plan(&self, set: &TaskSet, options: &PlanOptions) -> std::result::Result<RunPlan, DiscoveryError> {
        let mut plan = RunPlan::empty(self.kind());
        plan.waves = build_waves(set)?
            .iter()
            .map(|wave| wave.iter().map(|t| options.place(t)).collect())
            .collect();
        Ok(plan)
    }

    async fn execute(&self, plan: &RunPlan, ctx: &RunContext<'_>) -> Result<StrategyResult> {
        let mut result = StrategyResult::default();
        for (i, wave) in plan.waves.iter().enumerate() {
            info!("Running wave {} ({} task(s))", i, wave.len());
            result.reports.extend(run_group(wave, ctx).await?);
            if result.failed() {
                warn!("Wave {} failed, halting", i);
                result.not_run = plan.waves[i + 1..]
                    .iter()
                    .flatten()
                    .map(|t| t.name().to_string())
                    .collect();
                break;
            }
        }
        Ok(result)
    }
}

/// Due tasks are dispatched to the queue with their remaining delay.
#[derive(Debug, Clone, Copy, Default)]
pub struct Scheduled;

#[async_trait]
impl Strategy for Scheduled {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Scheduled
    }

    fn plan(&self, set: &TaskSet, options: &PlanOptions) -> std::result::Result<RunPlan, DiscoveryError> {
        let mut plan = RunPlan::empty(self.kind());
        let mut due = Vec::new();
        for task in &set.selected {
            match options.schedule.classify(task) {
                Slot::Due { delay } if options.dispatch == Some(DispatchOverride::Sync) => {
                    if delay.is_zero() {
                        due.push(PlannedTask {
                            task: task.clone(),
                            mode: DispatchMode::Inline,
                            delay,
                        });
                    } else {
                        plan.deferred.push(DeferredTask {
                            name: task.meta.name.clone(),
                            due: options.schedule.due_time(task),
                        });
                    }
                }
                Slot::Due { delay } => due.push(PlannedTask {
                    task: task.clone(),
                    mode: DispatchMode::Queue {
                        queue: options.queue_for(task),
                    },
                    delay,
                }),
                Slot::Deferred { due } => plan.deferred.push(DeferredTask {
                    name: task.meta.name.clone(),
                    due,
                }),
            }
        }
        if !due.is_empty() {
            plan.waves.push(due);
        }
        Ok(plan)
    }

    async fn execute(&self, plan: &RunPlan, ctx: &RunContext<'_>) -> Result<StrategyResult> {
        for deferred in &plan.deferred {
            info!("{} is not due until {}, deferring", deferred.name, deferred.due);
        }
        let tasks: Vec<PlannedTask> = plan.waves.iter().flatten().cloned().collect();
        run_sequential(&tasks, ctx).await
    }
}
