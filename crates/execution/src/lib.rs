//! Execution layer - discovery, dependency waves, the per-task state machine,
//! orchestration strategies and the ports they drive.

#![warn(missing_docs)]

pub mod command;
pub mod config;
pub mod dependency;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod lock;
pub mod machine;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod strategy;
pub mod task;
pub mod transaction;

#[cfg(test)]
pub(crate) mod testing;

pub use command::{CommandLine, CommandTask, ManifestLoader, ScriptLoader, TaskManifest, SCRIPT_SKIP_EXIT_CODE};
pub use config::{ConfigError, LockConfig, RunwayConfig, CONFIG_FILE};
pub use dependency::{build_waves, DependencyGraph};
pub use discovery::{discover, DiscoveredTask, DiscoveryOptions, TaskSet, TaskSource};
pub use engine::{Orchestrator, OrchestratorConfig, ProcessOptions, RunReport, WorkReport};
pub use error::{DiscoveryError, EngineError, Result};
pub use lock::{with_lock, FileLockProvider, InMemoryLockProvider, Lease, LockError, LockProvider};
pub use machine::{FailureInfo, Outcome, RollbackReport, RunnerSettings, TaskRunner, TaskState};
pub use queue::{FileJobQueue, InMemoryJobQueue, JobQueue, QueueError, QueuedJob};
pub use registry::{TaskLoader, TaskRegistry};
pub use scheduler::{Schedule, Slot};
pub use strategy::{
    DispatchMode, DispatchOverride, PlanOptions, PlannedTask, RunPlan, Strategy, StrategyKind,
    StrategyResult, TaskReport,
};
pub use task::{RetryPolicy, Task, TaskContext, TaskError, TaskFailure, TaskResult};
pub use transaction::{NoopTransactions, Transaction, TransactionError, TransactionManager};
