//! Execution history - one record per task attempt, plus error records.

use serde::{Deserialize, Serialize};
use crate::id::{ErrorId, RecordId};
use crate::Time;

/// How an attempt was dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    /// Ran inline in the orchestrating process
    Sync,
    /// Dispatched to the job queue
    Async,
    /// Marked as completed without running
    Fake,
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            RecordType::Sync => "sync",
            RecordType::Async => "async",
            RecordType::Fake => "fake",
        })
    }
}

/// State of a record, derived from its timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    /// Dispatched, not yet picked up
    Queued,
    /// Started, no terminal timestamp yet
    Running,
    Completed,
    Failed,
    Skipped,
    RolledBack,
}

impl RecordState {
    /// Whether the state is terminal.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RecordState::Queued | RecordState::Running)
    }

    /// Parse a lowercase state name.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "queued" => Some(RecordState::Queued),
            "running" => Some(RecordState::Running),
            "completed" => Some(RecordState::Completed),
            "failed" => Some(RecordState::Failed),
            "skipped" => Some(RecordState::Skipped),
            "rolled_back" => Some(RecordState::RolledBack),
            _ => None,
        }
    }
}

impl std::fmt::Display for RecordState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RecordState::Queued => "QUEUED",
            RecordState::Running => "RUNNING",
            RecordState::Completed => "COMPLETED",
            RecordState::Failed => "FAILED",
            RecordState::Skipped => "SKIPPED",
            RecordState::RolledBack => "ROLLED_BACK",
        };
        f.pad(s)
    }
}

/// Durable history entry for one task attempt.
///
/// At most one of `completed_at`, `failed_at` and `skipped_at` is set;
/// `rolled_back_at` is only ever set after `completed_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Unique identifier
    pub id: RecordId,

    /// Task name
    pub name: String,

    /// Dispatch type
    #[serde(rename = "type")]
    pub record_type: RecordType,

    /// Tags the task carried when the record was created
    #[serde(default)]
    pub tags: Vec<String>,

    /// Queue the attempt was dispatched to (async only)
    #[serde(default)]
    pub queue: Option<String>,

    /// When the record was created
    pub created_at: Time,

    /// When the work started
    pub executed_at: Option<Time>,

    pub completed_at: Option<Time>,
    pub failed_at: Option<Time>,
    pub skipped_at: Option<Time>,
    pub skip_reason: Option<String>,
    pub rolled_back_at: Option<Time>,

    /// Instance that ran the attempt
    pub executed_by: Option<String>,
}

impl ExecutionRecord {
    /// Create a record for an attempt that starts now.
    pub fn started(name: impl Into<String>, record_type: RecordType, executed_by: impl Into<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: RecordId::new(),
            name: name.into(),
            record_type,
            tags: Vec::new(),
            queue: None,
            created_at: now,
            executed_at: Some(now),
            completed_at: None,
            failed_at: None,
            skipped_at: None,
            skip_reason: None,
            rolled_back_at: None,
            executed_by: Some(executed_by.into()),
        }
    }

    /// Create a record for an attempt handed to the job queue.
    pub fn queued(name: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            id: RecordId::new(),
            name: name.into(),
            record_type: RecordType::Async,
            tags: Vec::new(),
            queue: Some(queue.into()),
            created_at: chrono::Utc::now(),
            executed_at: None,
            completed_at: None,
            failed_at: None,
            skipped_at: None,
            skip_reason: None,
            rolled_back_at: None,
            executed_by: None,
        }
    }

    /// Attach the task's tags.
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Current state.
    pub fn state(&self) -> RecordState {
        if self.rolled_back_at.is_some() {
            RecordState::RolledBack
        } else if self.completed_at.is_some() {
            RecordState::Completed
        } else if self.failed_at.is_some() {
            RecordState::Failed
        } else if self.skipped_at.is_some() {
            RecordState::Skipped
        } else if self.executed_at.is_some() {
            RecordState::Running
        } else {
            RecordState::Queued
        }
    }

    /// Whether the attempt reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Whether the attempt completed and was not rolled back.
    pub fn is_completed(&self) -> bool {
        self.state() == RecordState::Completed
    }
}

/// Where a failure was raised.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub file: Option<String>,
    pub line: Option<u32>,
    /// Error code, e.g. a process exit status
    pub code: Option<i32>,
}

/// A caught failure, appended to its Execution Record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Unique identifier
    pub id: ErrorId,

    /// Owning Execution Record
    pub record_id: RecordId,

    /// Failure class
    pub kind: String,

    pub message: String,

    /// Full cause chain
    pub trace: String,

    pub context: ErrorContext,

    pub created_at: Time,
}

impl ErrorRecord {
    /// Create an error record for `record_id`.
    pub fn new(
        record_id: RecordId,
        kind: impl Into<String>,
        message: impl Into<String>,
        trace: impl Into<String>,
        context: ErrorContext,
    ) -> Self {
        Self {
            id: ErrorId::new(),
            record_id,
            kind: kind.into(),
            message: message.into(),
            trace: trace.into(),
            context,
            created_at: chrono::Utc::now(),
        }
    }
}

/// Filter for history queries.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    /// Filter by state
    pub states: Option<Vec<RecordState>>,

    /// Filter by task name
    pub name: Option<String>,

    /// Records carrying any of these tags
    pub tags: Option<Vec<String>>,

    /// Created at or after
    pub since: Option<Time>,

    /// Created before
    pub until: Option<Time>,
}

impl RecordFilter {
    /// Check a record against the filter.
    pub fn matches(&self, record: &ExecutionRecord) -> bool {
        if let Some(states) = &self.states {
            if !states.contains(&record.state()) {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if &record.name != name {
                return false;
            }
        }
        if let Some(tags) = &self.tags {
            if !record.tags.iter().any(|t| tags.contains(t)) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if record.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if record.created_at >= until {
                return false;
            }
        }
        true
    }
}
