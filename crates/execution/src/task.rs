//! The task abstraction.
//!
//! A task is polymorphic over its capability set: [`Task::capabilities`]
//! declares which optional contracts it honors, and the engine only calls the
//! matching optional methods (`rollback`, `should_run`, `before`/`after`, ...)
//! when the capability is present.

use std::panic::Location;
use std::time::Duration;

use async_trait::async_trait;
use runway_core::{Capabilities, ErrorContext, RecordId, RecordType, RunId, TaskKind, Time};

use crate::machine::Outcome;

/// Result of a task's work function.
pub type TaskResult = std::result::Result<(), TaskError>;

/// What a task's work function can report besides success.
#[derive(Debug)]
pub enum TaskError {
    /// Intentional non-execution discovered mid-run. Not an error.
    Skip { reason: String },

    /// The work failed.
    Failure(TaskFailure),
}

impl TaskError {
    /// Signal a skip.
    pub fn skip(reason: impl Into<String>) -> Self {
        TaskError::Skip { reason: reason.into() }
    }

    /// Fail with a message, capturing the caller's location.
    #[track_caller]
    pub fn msg(message: impl std::fmt::Display + std::fmt::Debug + Send + Sync + 'static) -> Self {
        TaskError::Failure(TaskFailure::new(anyhow::Error::msg(message)))
    }
}

impl<E> From<E> for TaskError
where
    E: Into<anyhow::Error>,
{
    #[track_caller]
    fn from(error: E) -> Self {
        TaskError::Failure(TaskFailure::new(error))
    }
}

/// A caught task failure with the location it was raised from.
#[derive(Debug)]
pub struct TaskFailure {
    kind: String,
    error: anyhow::Error,
    location: Option<(&'static str, u32)>,
    code: Option<i32>,
}

impl TaskFailure {
    /// Wrap an error, capturing the caller's location.
    #[track_caller]
    pub fn new(error: impl Into<anyhow::Error>) -> Self {
        let location = Location::caller();
        Self {
            kind: "task_error".to_string(),
            error: error.into(),
            location: Some((location.file(), location.line())),
            code: None,
        }
    }

    /// A failure raised by the engine itself (timeout, panic, transaction).
    pub(crate) fn internal(kind: &str, error: anyhow::Error) -> Self {
        Self {
            kind: kind.to_string(),
            error,
            location: None,
            code: None,
        }
    }

    /// Set the failure class.
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    /// Attach an error code.
    pub fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }

    /// Failure class.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Top-level message.
    pub fn message(&self) -> String {
        self.error.to_string()
    }

    /// The full cause chain.
    pub fn trace(&self) -> String {
        format!("{:?}", self.error)
    }

    /// Source location and code.
    pub fn context(&self) -> ErrorContext {
        ErrorContext {
            file: self.location.map(|(file, _)| file.to_string()),
            line: self.location.map(|(_, line)| line),
            code: self.code,
        }
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.error)
    }
}

/// Retry policy for retryable tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Pause between attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    /// Retry up to `retries` times after the first attempt.
    pub fn retries(retries: u32, delay: Duration) -> Self {
        Self {
            max_attempts: retries.saturating_add(1),
            delay,
        }
    }
}

/// What a task sees while running.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Task name
    pub name: String,
    /// Migration or operation
    pub kind: TaskKind,
    /// Execution record of this attempt
    pub record_id: RecordId,
    /// Orchestration run
    pub run_id: RunId,
    /// 1-based attempt number
    pub attempt: u32,
    /// Dispatch type of the record
    pub record_type: RecordType,
    /// Instance running the task
    pub executed_by: String,
}

/// A migration or operation.
#[async_trait]
pub trait Task: Send + Sync {
    /// Capabilities this task declares.
    fn capabilities(&self) -> Capabilities;

    /// The work function.
    async fn run(&self, ctx: &TaskContext) -> TaskResult;

    /// Undo the work. Called only for `Rollbackable` tasks.
    async fn rollback(&self, _ctx: &TaskContext) -> TaskResult {
        Ok(())
    }

    /// Pre-check. Called only for `Conditional` tasks; `false` completes the
    /// task without running it.
    async fn should_run(&self, _ctx: &TaskContext) -> std::result::Result<bool, TaskError> {
        Ok(true)
    }

    /// Called before the work function for `HasLifecycleHooks` tasks.
    async fn before(&self, _ctx: &TaskContext) -> TaskResult {
        Ok(())
    }

    /// Called with the outcome for `HasLifecycleHooks` tasks.
    async fn after(&self, _ctx: &TaskContext, _outcome: &Outcome) {}

    /// Tags, consulted for `Tagged` tasks.
    fn tags(&self) -> Vec<String> {
        Vec::new()
    }

    /// Dependency ids (task name or slug), consulted for `HasDependencies` tasks.
    fn depends_on(&self) -> Vec<String> {
        Vec::new()
    }

    /// Opt out of the global auto-transaction.
    fn opts_out_of_transaction(&self) -> bool {
        false
    }

    /// Due time, consulted for `Scheduled` tasks.
    fn scheduled_at(&self) -> Option<Time> {
        None
    }

    /// Retry policy, consulted for `Retryable` tasks.
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    /// Time limit, consulted for `Timeoutable` tasks.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Preferred queue for async dispatch.
    fn queue(&self) -> Option<String> {
        None
    }
}
