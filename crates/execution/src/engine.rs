//! The orchestrator - ties discovery, planning and execution together.
//!
//! ```text
//! Discover → Plan (strategy) → Execute (state machine) → Report
//!        └──────── all inside the isolation lock when requested ────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use runway_core::{ErrorContext, ErrorRecord, RunId, TaskTimestamp};
use runway_storage::HistoryStore;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::discovery::{discover, DiscoveryOptions, TaskSource};
use crate::error::{EngineError, Result};
use crate::lock::{with_lock, InMemoryLockProvider, LockProvider};
use crate::machine::{RollbackReport, RunnerSettings, TaskRunner};
use crate::queue::{InMemoryJobQueue, JobQueue, QueuedJob};
use crate::registry::TaskRegistry;
use crate::scheduler::Schedule;
use crate::strategy::{DeferredTask, DispatchOverride, PlanOptions, RunContext, StrategyKind, TaskReport};
use crate::transaction::{NoopTransactions, TransactionManager};

/// Runtime settings for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Wrap every task in a transaction unless it opts out
    pub auto_transaction: bool,
    /// Persist error records for caught failures
    pub record_errors: bool,
    /// Instance identifier written to `executed_by`
    pub executed_by: String,
    /// Queue used for async dispatch when nothing else names one
    pub default_queue: String,
    /// Name of the isolation lock
    pub lock_name: String,
    /// How long to wait for the isolation lock
    pub lock_timeout: Duration,
    /// Maximum hold time of the isolation lock
    pub lock_ttl: Duration,
    /// Reject equal timestamps instead of tie-breaking
    pub strict_timestamps: bool,
    /// How far ahead the scheduled strategy dispatches
    pub schedule_horizon: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            auto_transaction: false,
            record_errors: true,
            executed_by: "runway".to_string(),
            default_queue: "default".to_string(),
            lock_name: "runway:process".to_string(),
            lock_timeout: Duration::from_secs(10),
            lock_ttl: Duration::from_secs(60 * 60),
            strict_timestamps: false,
            schedule_horizon: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl OrchestratorConfig {
    /// Enable or disable auto-transaction.
    pub fn with_auto_transaction(mut self, enabled: bool) -> Self {
        self.auto_transaction = enabled;
        self
    }

    /// Enable or disable error records.
    pub fn with_record_errors(mut self, enabled: bool) -> Self {
        self.record_errors = enabled;
        self
    }

    /// Set the instance identifier.
    pub fn with_executed_by(mut self, executed_by: impl Into<String>) -> Self {
        self.executed_by = executed_by.into();
        self
    }

    /// Set the default queue.
    pub fn with_default_queue(mut self, queue: impl Into<String>) -> Self {
        self.default_queue = queue.into();
        self
    }

    /// Set the isolation lock name, wait timeout and ttl.
    pub fn with_lock(mut self, name: impl Into<String>, timeout: Duration, ttl: Duration) -> Self {
        self.lock_name = name.into();
        self.lock_timeout = timeout;
        self.lock_ttl = ttl;
        self
    }

    /// Enable or disable strict timestamps.
    pub fn with_strict_timestamps(mut self, strict: bool) -> Self {
        self.strict_timestamps = strict;
        self
    }

    /// Set the scheduling horizon.
    pub fn with_schedule_horizon(mut self, horizon: Duration) -> Self {
        self.schedule_horizon = horizon;
        self
    }
}

/// Per-run flags.
#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    pub strategy: StrategyKind,
    /// Hold the isolation lock for the whole run
    pub isolate: bool,
    /// Plan only; no transitions and no history writes
    pub dry_run: bool,
    pub from: Option<TaskTimestamp>,
    pub repeat: bool,
    pub tags: Vec<String>,
    /// Force inline execution
    pub sync: bool,
    /// Force dispatch to the job queue
    pub asynchronous: bool,
    /// Queue for async dispatch
    pub queue: Option<String>,
    /// Record as completed without running
    pub fake: bool,
}

impl ProcessOptions {
    /// The dispatch override, rejecting `sync` together with `async`.
    pub fn dispatch_override(&self) -> Result<Option<DispatchOverride>> {
        match (self.sync, self.asynchronous) {
            (true, true) => Err(EngineError::ConflictingDispatchModes),
            (true, false) => Ok(Some(DispatchOverride::Sync)),
            (false, true) => Ok(Some(DispatchOverride::Async)),
            (false, false) => Ok(None),
        }
    }
}

/// Outcome of `process`.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// `None` for dry runs
    pub run_id: Option<RunId>,
    pub strategy: StrategyKind,
    pub dry_run: bool,
    /// Planned task names per group, in execution order
    pub plan: Vec<Vec<String>>,
    pub deferred: Vec<DeferredTask>,
    pub tasks: Vec<TaskReport>,
    pub not_run: Vec<String>,
    pub rollbacks: Vec<RollbackReport>,
}

impl RunReport {
    /// Whether the run finished without an unrecovered failure.
    pub fn success(&self) -> bool {
        !self.tasks.iter().any(TaskReport::is_fatal)
    }

    /// Planned task names, flattened.
    pub fn planned(&self) -> Vec<String> {
        self.plan.iter().flatten().cloned().collect()
    }
}

/// Outcome of draining a queue.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkReport {
    pub queue: String,
    /// Task name and outcome label of every job run
    pub completed: Vec<(String, String)>,
    /// Jobs that could not be run
    pub rejected: Vec<String>,
    pub failures: usize,
}

impl WorkReport {
    pub fn success(&self) -> bool {
        self.failures == 0 && self.rejected.is_empty()
    }
}

/// Runs migrations and operations.
pub struct Orchestrator {
    sources: Vec<TaskSource>,
    history: Arc<dyn HistoryStore>,
    registry: TaskRegistry,
    locks: Arc<dyn LockProvider>,
    queue: Arc<dyn JobQueue>,
    transactions: Arc<dyn TransactionManager>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Create an orchestrator over `sources` with in-process ports.
    pub fn new(sources: Vec<TaskSource>, history: Arc<dyn HistoryStore>) -> Self {
        Self {
            sources,
            history,
            registry: TaskRegistry::with_default_loaders(),
            locks: Arc::new(InMemoryLockProvider::new()),
            queue: Arc::new(InMemoryJobQueue::new()),
            transactions: Arc::new(NoopTransactions),
            config: OrchestratorConfig::default(),
        }
    }

    /// Set the task registry.
    pub fn with_registry(mut self, registry: TaskRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Set the lock provider.
    pub fn with_lock_provider(mut self, locks: Arc<dyn LockProvider>) -> Self {
        self.locks = locks;
        self
    }

    /// Set the job queue.
    pub fn with_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = queue;
        self
    }

    /// Set the transaction manager.
    pub fn with_transactions(mut self, transactions: Arc<dyn TransactionManager>) -> Self {
        self.transactions = transactions;
        self
    }

    /// Set the configuration.
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Source directories.
    pub fn sources(&self) -> &[TaskSource] {
        &self.sources
    }

    /// The history store.
    pub fn history(&self) -> &Arc<dyn HistoryStore> {
        &self.history
    }

    fn runner(&self) -> TaskRunner {
        TaskRunner::new(
            self.history.clone(),
            self.transactions.clone(),
            RunnerSettings {
                auto_transaction: self.config.auto_transaction,
                record_errors: self.config.record_errors,
                executed_by: self.config.executed_by.clone(),
            },
        )
    }

    /// Discover, plan and execute pending tasks.
    pub async fn process(&self, options: &ProcessOptions) -> Result<RunReport> {
        let dispatch = options.dispatch_override()?;

        if options.isolate {
            with_lock(
                self.locks.as_ref(),
                &self.config.lock_name,
                self.config.lock_timeout,
                self.config.lock_ttl,
                || self.run(options, dispatch),
            )
            .await?
        } else {
            self.run(options, dispatch).await
        }
    }

    async fn run(&self, options: &ProcessOptions, dispatch: Option<DispatchOverride>) -> Result<RunReport> {
        let discovery = DiscoveryOptions {
            from: options.from,
            tags: options.tags.clone(),
            repeat: options.repeat,
            strict_timestamps: self.config.strict_timestamps,
        };
        let set = discover(&self.sources, &self.registry, self.history.as_ref(), &discovery).await?;

        let plan_options = PlanOptions {
            dispatch,
            default_queue: self.config.default_queue.clone(),
            queue: options.queue.clone(),
            schedule: Schedule::new(self.config.schedule_horizon),
        };
        let strategy = options.strategy.strategy();
        let plan = strategy.plan(&set, &plan_options)?;

        let mut report = RunReport {
            run_id: None,
            strategy: options.strategy,
            dry_run: options.dry_run,
            plan: plan
                .waves
                .iter()
                .map(|w| w.iter().map(|t| t.name().to_string()).collect())
                .collect(),
            deferred: plan.deferred.clone(),
            tasks: Vec::new(),
            not_run: Vec::new(),
            rollbacks: Vec::new(),
        };

        if options.dry_run {
            info!("Dry run: {} task(s) planned with {}", report.planned().len(), options.strategy);
            return Ok(report);
        }
        if plan.is_empty() {
            info!("Nothing to run");
            return Ok(report);
        }

        let runner = self.runner();
        info!(
            "Run {} starting: {} task(s), strategy {}",
            runner.run_id(),
            report.planned().len(),
            options.strategy
        );
        let ctx = RunContext {
            runner: &runner,
            queue: self.queue.as_ref(),
            fake: options.fake,
        };
        let result = strategy.execute(&plan, &ctx).await?;

        report.run_id = Some(runner.run_id());
        report.tasks = result.reports;
        report.not_run = result.not_run;
        report.rollbacks = result.rollbacks;

        if report.success() {
            info!("Run {} finished", runner.run_id());
        } else {
            error!("Run {} failed", runner.run_id());
        }
        Ok(report)
    }

    /// Run every due job waiting on `queue`.
    ///
    /// The catalog is loaded before any job is claimed. If the worker stops
    /// on an error, the jobs it claimed but did not finish go back on the queue.
    pub async fn work(&self, queue: &str) -> Result<WorkReport> {
        let set = discover(
            &self.sources,
            &self.registry,
            self.history.as_ref(),
            &DiscoveryOptions {
                strict_timestamps: self.config.strict_timestamps,
                ..Default::default()
            },
        )
        .await?;

        let jobs = self.queue.take_due(queue, Utc::now()).await?;
        let mut report = WorkReport {
            queue: queue.to_string(),
            ..Default::default()
        };
        if jobs.is_empty() {
            info!("No due jobs on queue '{}'", queue);
            return Ok(report);
        }

        let runner = self.runner();
        let mut jobs = jobs.into_iter();
        while let Some(job) = jobs.next() {
            let Some(task) = set.get(&job.task) else {
                error!("Job for unknown task '{}'", job.task);
                let message = format!("task '{}' is not in the catalog", job.task);
                if let Err(e) = self.reject(job.record_id, &message).await {
                    self.requeue(std::iter::once(job).chain(jobs)).await;
                    return Err(e);
                }
                report.rejected.push(job.task);
                continue;
            };

            match runner.resume(task, job.record_id).await {
                Ok(outcome) => {
                    if outcome.is_failure() {
                        report.failures += 1;
                    }
                    report.completed.push((job.task, outcome.label().to_string()));
                }
                Err(e @ (EngineError::InvalidTransition { .. } | EngineError::RecordNotFound(_))) => {
                    warn!("Dropping job for {}: {}", job.task, e);
                    report.rejected.push(job.task);
                }
                Err(e) => {
                    error!("Worker stopped at {}: {}", job.task, e);
                    self.requeue(std::iter::once(job).chain(jobs)).await;
                    return Err(e);
                }
            }
        }
        Ok(report)
    }

    /// Put claimed jobs back after the worker stopped early. A job that cannot
    /// be requeued has its record failed instead.
    async fn requeue(&self, jobs: impl Iterator<Item = QueuedJob>) {
        for job in jobs {
            let (task, record_id) = (job.task.clone(), job.record_id);
            let Err(e) = self.queue.enqueue(job).await else {
                info!("Requeued {}", task);
                continue;
            };
            error!("Could not requeue {}: {}", task, e);
            let message = format!("job was claimed but could not be requeued: {}", e);
            if let Err(e) = self.reject(record_id, &message).await {
                error!("Could not fail record {} of {}: {}", record_id, task, e);
            }
        }
    }

    /// Fail a queued record that cannot be run.
    async fn reject(&self, record_id: runway_core::RecordId, message: &str) -> Result<()> {
        let Some(mut record) = self.history.find_by_id(record_id).await? else {
            return Ok(());
        };
        if record.is_terminal() {
            return Ok(());
        }
        record.failed_at = Some(Utc::now());
        self.history.update(&record).await?;
        if self.config.record_errors {
            let err = ErrorRecord::new(record_id, "dispatch", message, message, ErrorContext::default());
            self.history.append_error(&err).await?;
        }
        Ok(())
    }
}

/// Where the CLI keeps its state.
pub fn default_storage_dir() -> PathBuf {
    PathBuf::from(".runway")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockError;
    use crate::testing::{Behavior, RecordingTask, Script};
    use runway_core::{RecordFilter, RecordState};
    use runway_storage::InMemoryHistoryStore;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        script: Script,
        registry: TaskRegistry,
        history: Arc<InMemoryHistoryStore>,
        locks: InMemoryLockProvider,
        queue: Arc<InMemoryJobQueue>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            std::fs::create_dir_all(dir.path().join("migrations")).unwrap();
            std::fs::create_dir_all(dir.path().join("operations")).unwrap();
            Self {
                dir,
                script: Script::new(),
                registry: TaskRegistry::with_default_loaders(),
                history: Arc::new(InMemoryHistoryStore::new()),
                locks: InMemoryLockProvider::new(),
                queue: Arc::new(InMemoryJobQueue::new()),
            }
        }

        fn add(&mut self, sub: &str, name: &str, task: RecordingTask) -> &mut Self {
            std::fs::write(self.dir.path().join(sub).join(format!("{}.task", name)), "").unwrap();
            self.registry.register(name, Arc::new(task)).unwrap();
            self
        }

        fn orchestrator(&self) -> Orchestrator {
            Orchestrator::new(
                vec![
                    TaskSource::migrations(self.dir.path().join("migrations")),
                    TaskSource::operations(self.dir.path().join("operations")),
                ],
                self.history.clone(),
            )
            .with_registry(self.registry.clone())
            .with_lock_provider(Arc::new(self.locks.clone()))
            .with_queue(self.queue.clone())
            .with_config(OrchestratorConfig::default().with_lock(
                "runway:process",
                Duration::from_millis(50),
                Duration::from_secs(60),
            ))
        }

        async fn records(&self) -> Vec<runway_core::ExecutionRecord> {
            self.history.list(&RecordFilter::default()).await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_process_runs_pending_tasks_once() {
        let mut fx = Fixture::new();
        let s = fx.script.clone();
        fx.add("migrations", "2024_01_01_000000_schema", RecordingTask::new(&s, "schema"))
            .add("operations", "2024_01_02_000000_seed", RecordingTask::new(&s, "seed"));

        let orchestrator = fx.orchestrator();
        let report = orchestrator.process(&ProcessOptions::default()).await.unwrap();
        assert!(report.success());
        assert_eq!(s.calls(), vec!["run:schema", "run:seed"]);

        // Second run finds nothing pending.
        let report = orchestrator.process(&ProcessOptions::default()).await.unwrap();
        assert!(report.planned().is_empty());
        assert_eq!(s.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_dry_run_matches_real_run_without_writes() {
        let mut fx = Fixture::new();
        let s = fx.script.clone();
        fx.add("operations", "2024_01_01_000002_c", RecordingTask::new(&s, "c"))
            .add("operations", "2024_01_01_000000_a", RecordingTask::new(&s, "a"))
            .add("operations", "2024_01_01_000001_b", RecordingTask::new(&s, "b").depends_on(&["a"]));

        let orchestrator = fx.orchestrator();
        for strategy in StrategyKind::ALL {
            let options = ProcessOptions {
                strategy,
                dry_run: true,
                ..Default::default()
            };
            orchestrator.process(&options).await.unwrap();
        }
        assert_eq!(fx.history.write_count().await, 0);
        assert!(s.calls().is_empty());

        let dry = orchestrator
            .process(&ProcessOptions {
                dry_run: true,
                ..Default::default()
            })
            .await
            .unwrap();
        let real = orchestrator.process(&ProcessOptions::default()).await.unwrap();
        assert_eq!(dry.planned(), real.tasks.iter().map(|t| t.name.clone()).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_repeat_precondition_runs_nothing() {
        let mut fx = Fixture::new();
        let s = fx.script.clone();
        fx.add("operations", "2024_01_01_000000_t1", RecordingTask::new(&s, "t1"));
        let orchestrator = fx.orchestrator();
        orchestrator.process(&ProcessOptions::default()).await.unwrap();

        fx.add("operations", "2024_01_01_000001_t2", RecordingTask::new(&s, "t2"));
        let orchestrator = fx.orchestrator();
        let err = orchestrator
            .process(&ProcessOptions {
                repeat: true,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Discovery(crate::error::DiscoveryError::RepeatWithoutHistory { .. })
        ));
        assert_eq!(s.calls(), vec!["run:t1"]);
    }

    #[tokio::test]
    async fn test_repeat_creates_fresh_records() {
        let mut fx = Fixture::new();
        let s = fx.script.clone();
        fx.add("operations", "2024_01_01_000000_t1", RecordingTask::new(&s, "t1"));
        let orchestrator = fx.orchestrator();
        orchestrator.process(&ProcessOptions::default()).await.unwrap();
        orchestrator
            .process(&ProcessOptions {
                repeat: true,
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(s.calls(), vec!["run:t1", "run:t1"]);
        assert_eq!(fx.records().await.len(), 2);
    }

    #[tokio::test]
    async fn test_conflicting_dispatch_modes_rejected_before_work() {
        let mut fx = Fixture::new();
        let s = fx.script.clone();
        fx.add("operations", "2024_01_01_000000_t1", RecordingTask::new(&s, "t1"));

        let err = fx
            .orchestrator()
            .process(&ProcessOptions {
                sync: true,
                asynchronous: true,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ConflictingDispatchModes));
        assert!(s.calls().is_empty());
        assert_eq!(fx.history.write_count().await, 0);
    }

    #[tokio::test]
    async fn test_cycle_aborts_before_execution() {
        let mut fx = Fixture::new();
        let s = fx.script.clone();
        fx.add("operations", "2024_01_01_000000_a", RecordingTask::new(&s, "a").depends_on(&["b"]))
            .add("operations", "2024_01_01_000001_b", RecordingTask::new(&s, "b").depends_on(&["a"]));

        let err = fx
            .orchestrator()
            .process(&ProcessOptions {
                strategy: StrategyKind::DependencyWave,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Discovery(crate::error::DiscoveryError::Cycle { .. })
        ));
        assert!(s.calls().is_empty());
        assert!(fx.records().await.is_empty());
    }

    #[tokio::test]
    async fn test_isolate_times_out_while_lock_is_held() {
        let mut fx = Fixture::new();
        let s = fx.script.clone();
        fx.add("operations", "2024_01_01_000000_a", RecordingTask::new(&s, "a"));

        let held = fx
            .locks
            .try_acquire("runway:process", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        let options = ProcessOptions {
            isolate: true,
            ..Default::default()
        };
        let err = fx.orchestrator().process(&options).await.unwrap_err();
        assert!(matches!(err, EngineError::Lock(LockError::Timeout { .. })));
        assert!(s.calls().is_empty());

        fx.locks.release(&held).await.unwrap();
        let report = fx.orchestrator().process(&options).await.unwrap();
        assert!(report.success());
        assert!(!fx.locks.is_held("runway:process").await);
    }

    #[tokio::test]
    async fn test_fake_records_without_running() {
        let mut fx = Fixture::new();
        let s = fx.script.clone();
        fx.add("operations", "2024_01_01_000000_a", RecordingTask::new(&s, "a"));

        let report = fx
            .orchestrator()
            .process(&ProcessOptions {
                fake: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(report.success());
        assert!(s.calls().is_empty());
        let records = fx.records().await;
        assert_eq!(records[0].record_type, runway_core::RecordType::Fake);
    }

    #[tokio::test]
    async fn test_failure_reports_unsuccessful_run() {
        let mut fx = Fixture::new();
        let s = fx.script.clone();
        fx.add("operations", "2024_01_01_000000_a", RecordingTask::new(&s, "a").behave(Behavior::Fail("no")));

        let report = fx.orchestrator().process(&ProcessOptions::default()).await.unwrap();
        assert!(!report.success());
        assert_eq!(fx.records().await[0].state(), RecordState::Failed);
    }

    #[tokio::test]
    async fn test_async_dispatch_then_work() {
        let mut fx = Fixture::new();
        let s = fx.script.clone();
        fx.add("operations", "2024_01_01_000000_a", RecordingTask::new(&s, "a"))
            .add("operations", "2024_01_01_000001_b", RecordingTask::new(&s, "b"));

        let orchestrator = fx.orchestrator();
        let report = orchestrator
            .process(&ProcessOptions {
                asynchronous: true,
                queue: Some("bulk".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(report.success());
        assert!(s.calls().is_empty());

        // Dispatched tasks are no longer pending.
        let again = orchestrator.process(&ProcessOptions::default()).await.unwrap();
        assert!(again.planned().is_empty());

        assert!(orchestrator.work("default").await.unwrap().completed.is_empty());
        let work = orchestrator.work("bulk").await.unwrap();
        assert!(work.success());
        assert_eq!(work.completed.len(), 2);
        let mut calls = s.calls();
        calls.sort();
        assert_eq!(calls, vec!["run:a", "run:b"]);
        assert!(fx
            .records()
            .await
            .iter()
            .all(|r| r.state() == RecordState::Completed));
    }

    #[tokio::test]
    async fn test_work_leaves_jobs_queued_when_catalog_is_broken() {
        let mut fx = Fixture::new();
        let s = fx.script.clone();
        fx.add("operations", "2024_01_01_000000_a", RecordingTask::new(&s, "a"));

        let orchestrator = fx.orchestrator();
        orchestrator
            .process(&ProcessOptions {
                asynchronous: true,
                ..Default::default()
            })
            .await
            .unwrap();

        let stray = fx.dir.path().join("operations").join("2024_01_02_000000_stray.task");
        std::fs::write(&stray, "").unwrap();
        assert!(orchestrator.work("default").await.is_err());
        assert_eq!(fx.queue.pending("default").await.unwrap().len(), 1);
        assert_eq!(fx.records().await[0].state(), RecordState::Queued);

        std::fs::remove_file(&stray).unwrap();
        let work = orchestrator.work("default").await.unwrap();
        assert!(work.success());
        assert_eq!(s.calls(), vec!["run:a"]);
        assert_eq!(fx.records().await[0].state(), RecordState::Completed);
    }

    #[tokio::test]
    async fn test_requeue_returns_claimed_jobs() {
        let mut fx = Fixture::new();
        let s = fx.script.clone();
        fx.add("operations", "2024_01_01_000000_a", RecordingTask::new(&s, "a"))
            .add("operations", "2024_01_01_000001_b", RecordingTask::new(&s, "b"));

        let orchestrator = fx.orchestrator();
        orchestrator
            .process(&ProcessOptions {
                asynchronous: true,
                ..Default::default()
            })
            .await
            .unwrap();

        let claimed = fx.queue.take_due("default", Utc::now()).await.unwrap();
        assert_eq!(claimed.len(), 2);
        orchestrator.requeue(claimed.into_iter()).await;
        assert_eq!(fx.queue.pending("default").await.unwrap().len(), 2);

        let work = orchestrator.work("default").await.unwrap();
        assert_eq!(work.completed.len(), 2);
    }

    #[tokio::test]
    async fn test_tag_filter_end_to_end() {
        let mut fx = Fixture::new();
        let s = fx.script.clone();
        fx.add("migrations", "2024_01_01_000000_schema", RecordingTask::new(&s, "schema"))
            .add("operations", "2024_01_02_000000_seed", RecordingTask::new(&s, "seed").tagged(&["seed"]))
            .add("operations", "2024_01_03_000000_plain", RecordingTask::new(&s, "plain"));

        let report = fx
            .orchestrator()
            .process(&ProcessOptions {
                tags: vec!["seed".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(report.success());
        assert_eq!(s.calls(), vec!["run:schema", "run:seed"]);
        let seeded = fx.records().await;
        assert_eq!(seeded.iter().find(|r| r.name.ends_with("seed")).unwrap().tags, vec!["seed"]);
    }
}
