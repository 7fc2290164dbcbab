//! In-memory history store, used by tests and dry tooling.

use std::collections::HashMap;
use runway_core::{ErrorRecord, ExecutionRecord, RecordFilter, RecordId};
use tokio::sync::Mutex;
use super::trait_::{latest, sort_records};
use super::{HistoryStore, Result, StorageError};

#[derive(Default)]
struct Inner {
    records: HashMap<RecordId, ExecutionRecord>,
    errors: Vec<ErrorRecord>,
    writes: usize,
}

/// History store kept entirely in memory.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryHistoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mutating calls made so far.
    pub async fn write_count(&self) -> usize {
        self.inner.lock().await.writes
    }

    /// Every error record, in append order.
    pub async fn all_errors(&self) -> Vec<ErrorRecord> {
        self.inner.lock().await.errors.clone()
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn find_by_name(&self, name: &str) -> Result<Option<ExecutionRecord>> {
        let inner = self.inner.lock().await;
        Ok(latest(inner.records.values().filter(|r| r.name == name).cloned()))
    }

    async fn find_by_id(&self, id: RecordId) -> Result<Option<ExecutionRecord>> {
        Ok(self.inner.lock().await.records.get(&id).cloned())
    }

    async fn create(&self, record: &ExecutionRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.records.contains_key(&record.id) {
            return Err(StorageError::Conflict(record.id.to_string()));
        }
        inner.records.insert(record.id, record.clone());
        inner.writes += 1;
        Ok(())
    }

    async fn update(&self, record: &ExecutionRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.records.get_mut(&record.id) {
            Some(existing) => *existing = record.clone(),
            None => return Err(StorageError::NotFound(record.id.to_string())),
        }
        inner.writes += 1;
        Ok(())
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<ExecutionRecord>> {
        let inner = self.inner.lock().await;
        let mut records: Vec<_> = inner
            .records
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        sort_records(&mut records);
        Ok(records)
    }

    async fn append_error(&self, error: &ErrorRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.errors.push(error.clone());
        inner.writes += 1;
        Ok(())
    }

    async fn errors_for(&self, record: RecordId) -> Result<Vec<ErrorRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .errors
            .iter()
            .filter(|e| e.record_id == record)
            .cloned()
            .collect())
    }
}
