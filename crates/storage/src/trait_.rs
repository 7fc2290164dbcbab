//! History store trait abstraction.

use async_trait::async_trait;
use runway_core::{ErrorRecord, ExecutionRecord, RecordFilter, RecordId};

/// Error type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Item not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Item already exists
    #[error("Already exists: {0}")]
    Conflict(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Durable execution history.
///
/// Treated as an abstract keyed store. Methods take `&self` because tasks of
/// one wave write their own records concurrently; implementations provide
/// per-record atomicity.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    // === Execution records ===

    /// Latest record for a task name.
    async fn find_by_name(&self, name: &str) -> Result<Option<ExecutionRecord>>;

    /// Load a record by ID.
    async fn find_by_id(&self, id: RecordId) -> Result<Option<ExecutionRecord>>;

    /// Insert a new record. Fails with `Conflict` if the ID exists.
    async fn create(&self, record: &ExecutionRecord) -> Result<()>;

    /// Replace an existing record. Fails with `NotFound` if it does not exist.
    async fn update(&self, record: &ExecutionRecord) -> Result<()>;

    /// List records matching the filter, oldest first.
    async fn list(&self, filter: &RecordFilter) -> Result<Vec<ExecutionRecord>>;

    // === Error records ===

    /// Append an error record.
    async fn append_error(&self, error: &ErrorRecord) -> Result<()>;

    /// Error records of one execution record, oldest first.
    async fn errors_for(&self, record: RecordId) -> Result<Vec<ErrorRecord>>;
}

/// Pick the most recent record; ULIDs break ties on identical creation times.
pub(crate) fn latest(records: impl IntoIterator<Item = ExecutionRecord>) -> Option<ExecutionRecord> {
    records
        .into_iter()
        .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
}

pub(crate) fn sort_records(records: &mut [ExecutionRecord]) {
    records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}
