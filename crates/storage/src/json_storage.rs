//! JSON file history store.
//!
//! Stores each execution record as `records/<id>.json` and each error record as
//! `errors/<id>.json` under the storage root. Writes go through a temporary
//! file and a rename so a record is never observed half-written.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use runway_core::{ErrorRecord, ExecutionRecord, RecordFilter, RecordId};
use super::trait_::{latest, sort_records};
use super::{HistoryStore, Result, StorageError};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

/// File-based JSON history store.
pub struct JsonHistoryStore {
    root: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl JsonHistoryStore {
    /// Open storage, creating `records/` and `errors/` under `root`.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        fs::create_dir_all(root.join("records")).await?;
        fs::create_dir_all(root.join("errors")).await?;

        Ok(Self {
            root,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, id: RecordId) -> PathBuf {
        self.root.join("records").join(format!("{}.json", id))
    }

    fn error_path(&self, error: &ErrorRecord) -> PathBuf {
        self.root.join("errors").join(format!("{}.json", error.id))
    }

    async fn write<T: serde::Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json.as_bytes()).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl HistoryStore for JsonHistoryStore {
    async fn find_by_name(&self, name: &str) -> Result<Option<ExecutionRecord>> {
        let all: Vec<ExecutionRecord> = list_dir(&self.root.join("records")).await?;
        Ok(latest(all.into_iter().filter(|r| r.name == name)))
    }

    async fn find_by_id(&self, id: RecordId) -> Result<Option<ExecutionRecord>> {
        read_json(&self.record_path(id)).await
    }

    async fn create(&self, record: &ExecutionRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.record_path(record.id);
        if fs::try_exists(&path).await? {
            return Err(StorageError::Conflict(record.id.to_string()));
        }
        self.write(&path, record).await?;
        debug!("Created record {} for {}", record.id, record.name);
        Ok(())
    }

    async fn update(&self, record: &ExecutionRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.record_path(record.id);
        if !fs::try_exists(&path).await? {
            return Err(StorageError::NotFound(record.id.to_string()));
        }
        self.write(&path, record).await
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<ExecutionRecord>> {
        let all: Vec<ExecutionRecord> = list_dir(&self.root.join("records")).await?;
        let mut records: Vec<_> = all.into_iter().filter(|r| filter.matches(r)).collect();
        sort_records(&mut records);
        Ok(records)
    }

    async fn append_error(&self, error: &ErrorRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write(&self.error_path(error), error).await
    }

    async fn errors_for(&self, record: RecordId) -> Result<Vec<ErrorRecord>> {
        let all: Vec<ErrorRecord> = list_dir(&self.root.join("errors")).await?;
        let mut errors: Vec<_> = all.into_iter().filter(|e| e.record_id == record).collect();
        errors.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(errors)
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read_to_string(path).await {
        Ok(json) => {
            let value = serde_json::from_str(&json)?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn list_dir<T: serde::de::DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut items = Vec::new();
    let mut rd = fs::read_dir(dir).await?;
    while let Some(entry) = rd.next_entry().await? {
        if entry.path().extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        if let Some(item) = read_json(&entry.path()).await? {
            items.push(item);
        }
    }
    Ok(items)
}
