//! Error types for discovery and orchestration.

use std::path::PathBuf;

use runway_core::{RecordId, TimestampError};
use runway_storage::StorageError;
use thiserror::Error;

use crate::lock::LockError;
use crate::machine::TaskState;
use crate::queue::QueueError;

/// Errors raised before any task executes.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to read task directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed task file {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: TimestampError,
    },

    #[error("duplicate task '{name}' in {first} and {second}")]
    DuplicateIdentifier {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("duplicate timestamp {timestamp} in {first} and {second}")]
    DuplicateTimestamp {
        timestamp: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("no task implementation for '{name}' ({path})")]
    UnknownTask { name: String, path: PathBuf },

    #[error("failed to load task '{name}': {message}")]
    Load { name: String, message: String },

    #[error("task '{0}' is already registered")]
    DuplicateRegistration(String),

    #[error("cannot repeat '{name}': it has no terminal execution history")]
    RepeatWithoutHistory { name: String },

    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("task '{task}' depends on '{dependency}', which matches more than one task")]
    AmbiguousDependency { task: String, dependency: String },

    #[error("task '{task}' depends on '{dependency}', which is neither pending nor completed")]
    UnsatisfiedDependency { task: String, dependency: String },

    #[error("circular dependency between: {}", tasks.join(", "))]
    Cycle { tasks: Vec<String> },

    #[error("history lookup failed: {0}")]
    Storage(#[from] StorageError),
}

/// Errors that abort an orchestration run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("failed to dispatch '{task}': {source}")]
    Dispatch {
        task: String,
        #[source]
        source: QueueError,
    },

    #[error("job queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("history store error: {0}")]
    Storage(#[from] StorageError),

    #[error("--sync and --async cannot be used together")]
    ConflictingDispatchModes,

    #[error("invalid transition for '{task}': {from} -> {to}")]
    InvalidTransition {
        task: String,
        from: TaskState,
        to: TaskState,
    },

    #[error("execution record {0} not found")]
    RecordNotFound(RecordId),
}

/// Result alias for the execution layer.
pub type Result<T> = std::result::Result<T, EngineError>;
