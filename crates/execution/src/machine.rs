//! Per-task execution state machine.
//!
//! ```text
//! NotStarted → Running → Completed → RolledBack
//!                      ↘ Failed
//!                      ↘ Skipped
//! ```
//!
//! The [`TaskRunner`] is the only writer of execution records. It drives one
//! attempt through the protocol (hooks, pre-check, transaction, retries,
//! timeout) and journals completed tasks so a later failure in the same run
//! can roll them back in reverse execution order.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use runway_core::{
    Capability, ErrorContext, ErrorRecord, ExecutionRecord, RecordId, RecordType, RunId,
};
use runway_storage::HistoryStore;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::discovery::DiscoveredTask;
use crate::error::{EngineError, Result};
use crate::queue::{JobQueue, QueuedJob};
use crate::task::{TaskContext, TaskError, TaskFailure, TaskResult};
use crate::transaction::TransactionManager;

/// Lifecycle state of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    NotStarted,
    Running,
    Completed,
    Failed,
    Skipped,
    RolledBack,
}

impl TaskState {
    /// Whether `next` is a legal successor.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (NotStarted, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Skipped)
                | (Completed, RolledBack)
        )
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Failed | TaskState::Skipped | TaskState::RolledBack)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::NotStarted => "not-started",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Skipped => "skipped",
            TaskState::RolledBack => "rolled-back",
        };
        f.write_str(s)
    }
}

/// A failure, detached from the original error so it can be cloned into reports.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureInfo {
    pub kind: String,
    pub message: String,
    pub trace: String,
    pub context: ErrorContext,
}

impl From<&TaskFailure> for FailureInfo {
    fn from(failure: &TaskFailure) -> Self {
        Self {
            kind: failure.kind().to_string(),
            message: failure.message(),
            trace: failure.trace(),
            context: failure.context(),
        }
    }
}

/// How a task attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Completed; `ran` is false when a conditional pre-check declined the work.
    Completed { ran: bool },
    /// Skip signal raised by the task.
    Skipped { reason: String },
    /// Unrecovered failure.
    Failed(FailureInfo),
    /// Handed to the job queue.
    Dispatched { queue: String },
    /// Recorded as completed without running.
    Faked,
}

impl Outcome {
    /// Whether the outcome fails its group (before failure tolerance is applied).
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }

    /// Short label for reports.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Completed { ran: true } => "completed",
            Outcome::Completed { ran: false } => "completed (condition not met)",
            Outcome::Skipped { .. } => "skipped",
            Outcome::Failed(_) => "failed",
            Outcome::Dispatched { .. } => "dispatched",
            Outcome::Faked => "faked",
        }
    }
}

/// Runner-level settings.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// Wrap every task in a transaction unless it opts out
    pub auto_transaction: bool,
    /// Persist error records
    pub record_errors: bool,
    /// Value for `executed_by`
    pub executed_by: String,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            auto_transaction: false,
            record_errors: true,
            executed_by: "runway".to_string(),
        }
    }
}

/// One attempt moving through the state machine.
struct Attempt {
    state: TaskState,
    record: ExecutionRecord,
}

impl Attempt {
    fn new(record: ExecutionRecord) -> Self {
        Self {
            state: TaskState::NotStarted,
            record,
        }
    }

    fn transition(&mut self, next: TaskState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                task: self.record.name.clone(),
                from: self.state,
                to: next,
            });
        }
        debug!("{}: {} -> {}", self.record.name, self.state, next);
        self.state = next;
        Ok(())
    }
}

/// A completed task eligible for rollback.
struct JournalEntry {
    sequence: u64,
    task: DiscoveredTask,
    record: ExecutionRecord,
}

/// Result of rolling back one task.
#[derive(Debug, Clone, PartialEq)]
pub struct RollbackReport {
    pub name: String,
    pub record_id: RecordId,
    /// `None` when the rollback succeeded
    pub error: Option<String>,
}

/// Drives task attempts and owns their execution records.
pub struct TaskRunner {
    history: Arc<dyn HistoryStore>,
    transactions: Arc<dyn TransactionManager>,
    settings: RunnerSettings,
    run_id: RunId,
    sequence: AtomicU64,
    journal: Mutex<Vec<JournalEntry>>,
}

impl TaskRunner {
    /// Create a runner for one orchestration run.
    pub fn new(
        history: Arc<dyn HistoryStore>,
        transactions: Arc<dyn TransactionManager>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            history,
            transactions,
            settings,
            run_id: RunId::new(),
            sequence: AtomicU64::new(0),
            journal: Mutex::new(Vec::new()),
        }
    }

    /// The run this runner belongs to.
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    fn tags_of(task: &DiscoveredTask) -> Vec<String> {
        if task.capabilities().contains(Capability::Tagged) {
            task.task.tags()
        } else {
            Vec::new()
        }
    }

    /// Run a task inline, creating its execution record.
    pub async fn execute(&self, task: &DiscoveredTask) -> Result<(RecordId, Outcome)> {
        let record = ExecutionRecord::started(&task.meta.name, RecordType::Sync, &self.settings.executed_by)
            .with_tags(Self::tags_of(task));
        self.history.create(&record).await?;
        let id = record.id;
        let outcome = self.drive(task, record).await?;
        Ok((id, outcome))
    }

    /// Run a task whose record was created at dispatch time.
    pub async fn resume(&self, task: &DiscoveredTask, record_id: RecordId) -> Result<Outcome> {
        let mut record = self
            .history
            .find_by_id(record_id)
            .await?
            .ok_or(EngineError::RecordNotFound(record_id))?;
        if record.executed_at.is_some() || record.is_terminal() {
            let from = if record.is_terminal() {
                TaskState::Failed
            } else {
                TaskState::Running
            };
            return Err(EngineError::InvalidTransition {
                task: record.name.clone(),
                from,
                to: TaskState::Running,
            });
        }
        record.executed_at = Some(chrono::Utc::now());
        record.executed_by = Some(self.settings.executed_by.clone());
        self.history.update(&record).await?;
        self.drive(task, record).await
    }

    /// Record a task as completed without running it.
    pub async fn fake(&self, task: &DiscoveredTask) -> Result<(RecordId, Outcome)> {
        let mut record = ExecutionRecord::started(&task.meta.name, RecordType::Fake, &self.settings.executed_by)
            .with_tags(Self::tags_of(task));
        record.completed_at = record.executed_at;
        self.history.create(&record).await?;
        info!("Faked {}", task.meta.name);
        Ok((record.id, Outcome::Faked))
    }

    /// Create an async record and hand the task to the job queue.
    pub async fn dispatch(
        &self,
        task: &DiscoveredTask,
        queue: &dyn JobQueue,
        queue_name: &str,
        delay: std::time::Duration,
    ) -> Result<(RecordId, Outcome)> {
        let caps = task.capabilities();
        let record = ExecutionRecord::queued(&task.meta.name, queue_name).with_tags(Self::tags_of(task));
        self.history.create(&record).await?;

        let job = QueuedJob::new(&task.meta.name, record.id, queue_name, delay)
            .unique(caps.contains(Capability::UniqueExecution))
            .idempotent(caps.contains(Capability::Idempotent));

        if let Err(source) = queue.enqueue(job).await {
            error!("Failed to dispatch {}: {}", task.meta.name, source);
            let mut record = record;
            record.failed_at = Some(chrono::Utc::now());
            self.history.update(&record).await?;
            if self.settings.record_errors {
                let message = source.to_string();
                let err = ErrorRecord::new(record.id, "dispatch", &message, &message, ErrorContext::default());
                self.history.append_error(&err).await?;
            }
            return Err(EngineError::Dispatch {
                task: task.meta.name.clone(),
                source,
            });
        }

        info!("Dispatched {} to queue '{}' (delay {:?})", task.meta.name, queue_name, delay);
        Ok((
            record.id,
            Outcome::Dispatched {
                queue: queue_name.to_string(),
            },
        ))
    }

    async fn drive(&self, task: &DiscoveredTask, record: ExecutionRecord) -> Result<Outcome> {
        let caps = task.capabilities();
        let mut attempt = Attempt::new(record);
        attempt.transition(TaskState::Running)?;
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);

        let mut ctx = TaskContext {
            name: task.meta.name.clone(),
            kind: task.meta.kind,
            record_id: attempt.record.id,
            run_id: self.run_id,
            attempt: 1,
            record_type: attempt.record.record_type,
            executed_by: self.settings.executed_by.clone(),
        };
        info!("Running {}", task.meta.name);

        let hooks = caps.contains(Capability::HasLifecycleHooks);
        let mut result = if hooks {
            guarded(task.task.before(&ctx)).await
        } else {
            Ok(())
        };

        let mut declined = false;
        if result.is_ok() && caps.contains(Capability::Conditional) {
            match guarded(task.task.should_run(&ctx)).await {
                Ok(true) => {}
                Ok(false) => declined = true,
                Err(e) => result = Err(e),
            }
        }

        let outcome = if declined {
            info!("{}: condition not met, marking completed", task.meta.name);
            Outcome::Completed { ran: false }
        } else if let Err(e) = result {
            self.settle(&attempt, e).await?
        } else {
            let policy = if caps.contains(Capability::Retryable) {
                task.task.retry_policy()
            } else {
                Default::default()
            };
            let max_attempts = policy.max_attempts.max(1);
            loop {
                match self.invoke(task, &ctx).await {
                    Ok(()) => break Outcome::Completed { ran: true },
                    Err(TaskError::Failure(failure)) if ctx.attempt < max_attempts => {
                        warn!(
                            "{} failed on attempt {}/{}: {}; retrying",
                            task.meta.name, ctx.attempt, max_attempts, failure
                        );
                        self.record_error(attempt.record.id, &failure).await?;
                        if !policy.delay.is_zero() {
                            tokio::time::sleep(policy.delay).await;
                        }
                        ctx.attempt += 1;
                    }
                    Err(e) => break self.settle(&attempt, e).await?,
                }
            }
        };

        self.finish(task, &mut attempt, &outcome, sequence).await?;

        if hooks {
            task.task.after(&ctx, &outcome).await;
        }
        Ok(outcome)
    }

    /// Turn a task error into an outcome, recording the error when it is a failure.
    async fn settle(&self, attempt: &Attempt, error: TaskError) -> Result<Outcome> {
        match error {
            TaskError::Skip { reason } => {
                info!("{} skipped: {}", attempt.record.name, reason);
                Ok(Outcome::Skipped { reason })
            }
            TaskError::Failure(failure) => {
                error!("{} failed: {}", attempt.record.name, failure);
                self.record_error(attempt.record.id, &failure).await?;
                Ok(Outcome::Failed(FailureInfo::from(&failure)))
            }
        }
    }

    async fn record_error(&self, record_id: RecordId, failure: &TaskFailure) -> Result<()> {
        if self.settings.record_errors {
            let err = ErrorRecord::new(
                record_id,
                failure.kind(),
                failure.message(),
                failure.trace(),
                failure.context(),
            );
            self.history.append_error(&err).await?;
        }
        Ok(())
    }

    /// Persist the terminal state and journal completed work.
    async fn finish(
        &self,
        task: &DiscoveredTask,
        attempt: &mut Attempt,
        outcome: &Outcome,
        sequence: u64,
    ) -> Result<()> {
        let now = chrono::Utc::now();
        match outcome {
            Outcome::Completed { .. } => {
                attempt.transition(TaskState::Completed)?;
                attempt.record.completed_at = Some(now);
            }
            Outcome::Skipped { reason } => {
                attempt.transition(TaskState::Skipped)?;
                attempt.record.skipped_at = Some(now);
                attempt.record.skip_reason = Some(reason.clone());
            }
            Outcome::Failed(_) => {
                attempt.transition(TaskState::Failed)?;
                attempt.record.failed_at = Some(now);
            }
            Outcome::Dispatched { .. } | Outcome::Faked => {}
        }
        self.history.update(&attempt.record).await?;

        if let Outcome::Completed { ran: true } = outcome {
            self.journal.lock().await.push(JournalEntry {
                sequence,
                task: task.clone(),
                record: attempt.record.clone(),
            });
        }
        Ok(())
    }

    /// Invoke the work function inside its transaction and time limit.
    async fn invoke(&self, task: &DiscoveredTask, ctx: &TaskContext) -> TaskResult {
        let caps = task.capabilities();
        let wrap = caps.contains(Capability::Transactional)
            || (self.settings.auto_transaction && !task.task.opts_out_of_transaction());

        let tx = if wrap {
            let tx = self
                .transactions
                .begin(&ctx.name)
                .await
                .map_err(|e| TaskError::Failure(TaskFailure::internal("transaction", e.into())))?;
            Some(tx)
        } else {
            None
        };

        let limit = if caps.contains(Capability::Timeoutable) {
            task.task.timeout()
        } else {
            None
        };

        let work = guarded(task.task.run(ctx));
        let result = match limit {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(result) => result,
                Err(_) => Err(TaskError::Failure(TaskFailure::internal(
                    "timeout",
                    anyhow::anyhow!("timed out after {:?}", limit),
                ))),
            },
            None => work.await,
        };

        let Some(tx) = tx else {
            return result;
        };
        match result {
            Ok(()) => self
                .transactions
                .commit(tx)
                .await
                .map_err(|e| TaskError::Failure(TaskFailure::internal("transaction", e.into()))),
            Err(e) => {
                if let Err(rollback_err) = self.transactions.rollback(tx).await {
                    warn!("{}: transaction rollback failed: {}", ctx.name, rollback_err);
                }
                Err(e)
            }
        }
    }

    /// Roll back every task completed in this run, newest first.
    ///
    /// Rollback failures are logged and recorded but never stop the walk.
    pub async fn rollback_completed(&self) -> Result<Vec<RollbackReport>> {
        let mut entries = std::mem::take(&mut *self.journal.lock().await);
        entries.sort_by(|a, b| b.sequence.cmp(&a.sequence));

        let mut reports = Vec::new();
        for entry in entries {
            if !entry.task.capabilities().contains(Capability::Rollbackable) {
                debug!("{} is not rollbackable, leaving as-is", entry.task.meta.name);
                continue;
            }

            let ctx = TaskContext {
                name: entry.task.meta.name.clone(),
                kind: entry.task.meta.kind,
                record_id: entry.record.id,
                run_id: self.run_id,
                attempt: 1,
                record_type: entry.record.record_type,
                executed_by: self.settings.executed_by.clone(),
            };

            info!("Rolling back {}", ctx.name);
            let mut attempt = Attempt {
                state: TaskState::Completed,
                record: entry.record,
            };
            match guarded(entry.task.task.rollback(&ctx)).await {
                Ok(()) => {
                    attempt.transition(TaskState::RolledBack)?;
                    attempt.record.rolled_back_at = Some(chrono::Utc::now());
                    self.history.update(&attempt.record).await?;
                    reports.push(RollbackReport {
                        name: ctx.name,
                        record_id: ctx.record_id,
                        error: None,
                    });
                }
                Err(TaskError::Skip { reason }) => {
                    info!("{}: rollback skipped: {}", ctx.name, reason);
                }
                Err(TaskError::Failure(failure)) => {
                    error!("Rollback of {} failed: {}", ctx.name, failure);
                    let failure = failure.with_kind("rollback");
                    self.record_error(ctx.record_id, &failure).await?;
                    reports.push(RollbackReport {
                        name: ctx.name,
                        record_id: ctx.record_id,
                        error: Some(failure.message()),
                    });
                }
            }
        }
        Ok(reports)
    }
}

/// Await a task future, turning a panic into a failure.
async fn guarded<T, F>(fut: F) -> std::result::Result<T, TaskError>
where
    F: std::future::Future<Output = std::result::Result<T, TaskError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "task panicked".to_string());
            Err(TaskError::Failure(TaskFailure::internal(
                "panic",
                anyhow::anyhow!(message),
            )))
        }
    }
}
