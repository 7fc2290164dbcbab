//! Scripted tasks and ports for unit tests.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use runway_core::{Capabilities, Capability, ExecutionRecord, RecordType, TaskFileName, TaskKind, TaskMeta, Time};

use crate::discovery::{DiscoveredTask, TaskSet};
use crate::machine::Outcome;
use crate::task::{RetryPolicy, Task, TaskContext, TaskError, TaskResult};
use crate::transaction::{Transaction, TransactionError, TransactionManager};

/// Shared call log.
#[derive(Debug, Clone, Default)]
pub struct Script {
    calls: Arc<Mutex<Vec<String>>>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

/// What the work function does.
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed,
    Skip(&'static str),
    Fail(&'static str),
    /// Fail the first n attempts
    FailTimes(u32),
    Sleep(Duration),
    FailAfter(Duration, &'static str),
    Panic(&'static str),
}

/// A task that logs every call to a [`Script`].
pub struct RecordingTask {
    script: Script,
    label: String,
    behavior: Behavior,
    failures: AtomicU32,
    capabilities: Option<Capabilities>,
    condition: Option<bool>,
    rollbackable: bool,
    failing_rollback: bool,
    retries: u32,
    timeout: Option<Duration>,
    transactional: bool,
    no_transaction: bool,
    hooks: bool,
    tags: Vec<String>,
    depends_on: Vec<String>,
    scheduled_at: Option<Time>,
    tolerant: bool,
    asynchronous: bool,
    queue: Option<String>,
}

impl RecordingTask {
    pub fn new(script: &Script, label: &str) -> Self {
        Self {
            script: script.clone(),
            label: label.to_string(),
            behavior: Behavior::Succeed,
            failures: AtomicU32::new(0),
            capabilities: None,
            condition: None,
            rollbackable: false,
            failing_rollback: false,
            retries: 0,
            timeout: None,
            transactional: false,
            no_transaction: false,
            hooks: false,
            tags: Vec::new(),
            depends_on: Vec::new(),
            scheduled_at: None,
            tolerant: false,
            asynchronous: false,
            queue: None,
        }
    }

    pub fn behave(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn condition(mut self, value: bool) -> Self {
        self.condition = Some(value);
        self
    }

    pub fn rollbackable(mut self) -> Self {
        self.rollbackable = true;
        self
    }

    pub fn failing_rollback(mut self) -> Self {
        self.failing_rollback = true;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn transactional(mut self) -> Self {
        self.transactional = true;
        self
    }

    pub fn no_transaction(mut self) -> Self {
        self.no_transaction = true;
        self
    }

    pub fn hooks(mut self) -> Self {
        self.hooks = true;
        self
    }

    pub fn tagged(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn scheduled(mut self, at: Time) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn tolerant(mut self) -> Self {
        self.tolerant = true;
        self
    }

    pub fn asynchronous(mut self) -> Self {
        self.asynchronous = true;
        self
    }

    pub fn on_queue(mut self, queue: &str) -> Self {
        self.queue = Some(queue.to_string());
        self
    }

    /// Declare exactly these capabilities, whatever the builder set.
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }
}

#[async_trait]
impl Task for RecordingTask {
    fn capabilities(&self) -> Capabilities {
        if let Some(caps) = self.capabilities {
            return caps;
        }
        Capabilities::empty()
            .with_if(Capability::Rollbackable, self.rollbackable || self.failing_rollback)
            .with_if(Capability::Conditional, self.condition.is_some())
            .with_if(Capability::Retryable, self.retries > 0)
            .with_if(Capability::Timeoutable, self.timeout.is_some())
            .with_if(Capability::Transactional, self.transactional)
            .with_if(Capability::HasLifecycleHooks, self.hooks)
            .with_if(Capability::Tagged, !self.tags.is_empty())
            .with_if(Capability::HasDependencies, !self.depends_on.is_empty())
            .with_if(Capability::Scheduled, self.scheduled_at.is_some())
            .with_if(Capability::FailureTolerant, self.tolerant)
            .with_if(Capability::Asynchronous, self.asynchronous)
    }

    async fn run(&self, _ctx: &TaskContext) -> TaskResult {
        self.script.push(format!("run:{}", self.label));
        match &self.behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Skip(reason) => Err(TaskError::skip(*reason)),
            Behavior::Fail(message) => Err(TaskError::msg(*message)),
            Behavior::FailTimes(n) => {
                if self.failures.fetch_add(1, Ordering::SeqCst) < *n {
                    Err(TaskError::msg("transient failure"))
                } else {
                    Ok(())
                }
            }
            Behavior::Sleep(duration) => {
                tokio::time::sleep(*duration).await;
                Ok(())
            }
            Behavior::FailAfter(duration, message) => {
                tokio::time::sleep(*duration).await;
                Err(TaskError::msg(*message))
            }
            Behavior::Panic(message) => panic!("{}", message),
        }
    }

    async fn rollback(&self, _ctx: &TaskContext) -> TaskResult {
        self.script.push(format!("rollback:{}", self.label));
        if self.failing_rollback {
            return Err(TaskError::msg("rollback failed"));
        }
        Ok(())
    }

    async fn should_run(&self, _ctx: &TaskContext) -> Result<bool, TaskError> {
        Ok(self.condition.unwrap_or(true))
    }

    async fn before(&self, _ctx: &TaskContext) -> TaskResult {
        self.script.push(format!("before:{}", self.label));
        Ok(())
    }

    async fn after(&self, _ctx: &TaskContext, outcome: &Outcome) {
        self.script.push(format!("after:{}:{}", self.label, outcome.label()));
    }

    fn tags(&self) -> Vec<String> {
        self.tags.clone()
    }

    fn depends_on(&self) -> Vec<String> {
        self.depends_on.clone()
    }

    fn opts_out_of_transaction(&self) -> bool {
        self.no_transaction
    }

    fn scheduled_at(&self) -> Option<Time> {
        self.scheduled_at
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::retries(self.retries, Duration::ZERO)
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn queue(&self) -> Option<String> {
        self.queue.clone()
    }
}

/// Wrap a task as if discovery had found `<name>.task`.
pub fn discovered(name: &str, kind: TaskKind, task: RecordingTask) -> DiscoveredTask {
    let file_name = format!("{}.task", name);
    let parsed = TaskFileName::parse(&file_name).unwrap().unwrap();
    DiscoveredTask {
        meta: TaskMeta::from_file(parsed, kind, PathBuf::from(file_name)),
        task: Arc::new(task),
        history: None,
    }
}

/// A task set whose catalog is exactly its selection.
pub fn task_set(tasks: Vec<DiscoveredTask>) -> TaskSet {
    TaskSet {
        catalog: tasks.clone(),
        selected: tasks,
    }
}

impl DiscoveredTask {
    pub fn with_completed_history(mut self) -> Self {
        let mut record = ExecutionRecord::started(&self.meta.name, RecordType::Sync, "test");
        record.completed_at = record.executed_at;
        self.history = Some(record);
        self
    }

    pub fn with_failed_history(mut self) -> Self {
        let mut record = ExecutionRecord::started(&self.meta.name, RecordType::Sync, "test");
        record.failed_at = record.executed_at;
        self.history = Some(record);
        self
    }
}

/// Transaction manager logging begin/commit/rollback.
#[derive(Debug, Default)]
pub struct RecordingTransactions {
    events: Mutex<Vec<String>>,
}

impl RecordingTransactions {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransactionManager for RecordingTransactions {
    async fn begin(&self, owner: &str) -> Result<Transaction, TransactionError> {
        self.events.lock().unwrap().push(format!("begin:{}", owner));
        Ok(Transaction {
            owner: owner.to_string(),
        })
    }

    async fn commit(&self, tx: Transaction) -> Result<(), TransactionError> {
        self.events.lock().unwrap().push(format!("commit:{}", tx.owner));
        Ok(())
    }

    async fn rollback(&self, tx: Transaction) -> Result<(), TransactionError> {
        self.events.lock().unwrap().push(format!("rollback:{}", tx.owner));
        Ok(())
    }
}
