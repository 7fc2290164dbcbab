//! Runway core data models.
//!
//! This crate defines the task metadata, capability set and execution history
//! records shared by the storage and execution layers.

#![warn(missing_docs)]

// Core identities
mod id;

// Task catalog
mod timestamp;
mod task;

// Execution history
mod record;

// Re-exports
pub use id::*;

pub use timestamp::{TaskFileName, TaskTimestamp, TimestampError};
pub use task::{Capabilities, Capability, TaskKind, TaskMeta};
pub use record::{
    ErrorContext, ErrorRecord, ExecutionRecord, RecordFilter, RecordState, RecordType,
};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
