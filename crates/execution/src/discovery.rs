//! Task discovery.
//!
//! Scans the configured source directories, resolves every task file through
//! the [`TaskRegistry`], cross-references history and applies the run's
//! selection filters. Discovery never writes to the history store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use runway_core::{Capabilities, Capability, ExecutionRecord, TaskFileName, TaskKind, TaskMeta, TaskTimestamp};
use runway_storage::HistoryStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::DiscoveryError;
use crate::registry::TaskRegistry;
use crate::task::Task;

/// A directory of task files of one kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSource {
    pub path: PathBuf,
    pub kind: TaskKind,
}

impl TaskSource {
    /// A directory of migrations.
    pub fn migrations(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: TaskKind::Migration,
        }
    }

    /// A directory of operations.
    pub fn operations(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: TaskKind::Operation,
        }
    }
}

/// Selection filters for one run.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryOptions {
    /// Drop tasks sorting before this timestamp
    pub from: Option<TaskTimestamp>,
    /// Keep operations carrying any of these tags (migrations always kept)
    pub tags: Vec<String>,
    /// Re-run tasks that already have terminal history
    pub repeat: bool,
    /// Reject equal timestamps instead of tie-breaking on file name
    pub strict_timestamps: bool,
}

/// A task found on disk, resolved to code and matched against history.
#[derive(Clone)]
pub struct DiscoveredTask {
    pub meta: TaskMeta,
    pub task: Arc<dyn Task>,
    /// Latest execution record, if any
    pub history: Option<ExecutionRecord>,
}

impl std::fmt::Debug for DiscoveredTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveredTask")
            .field("name", &self.meta.name)
            .field("kind", &self.meta.kind)
            .field("capabilities", &self.capabilities())
            .field("history", &self.history.as_ref().map(|r| r.state()))
            .finish()
    }
}

impl DiscoveredTask {
    /// The task's declared capabilities.
    pub fn capabilities(&self) -> Capabilities {
        self.task.capabilities()
    }

    /// Tags, if the task is tagged.
    pub fn tags(&self) -> Vec<String> {
        if self.capabilities().contains(Capability::Tagged) {
            self.task.tags()
        } else {
            Vec::new()
        }
    }

    /// Declared dependency ids, if the task has dependencies.
    pub fn dependencies(&self) -> Vec<String> {
        if self.capabilities().contains(Capability::HasDependencies) {
            self.task.depends_on()
        } else {
            Vec::new()
        }
    }

    /// Whether the task has never been recorded.
    pub fn is_pending(&self) -> bool {
        self.history.is_none()
    }

    /// Whether the latest record completed (and was not rolled back).
    pub fn has_completed(&self) -> bool {
        self.history.as_ref().map(|r| r.is_completed()).unwrap_or(false)
    }
}

/// Result of discovery.
#[derive(Debug, Clone, Default)]
pub struct TaskSet {
    /// Tasks to run, ordered by timestamp then file name
    pub selected: Vec<DiscoveredTask>,
    /// Every task found, in the same order
    pub catalog: Vec<DiscoveredTask>,
}

impl TaskSet {
    /// Names of the selected tasks, in order.
    pub fn names(&self) -> Vec<String> {
        self.selected.iter().map(|t| t.meta.name.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }

    pub fn len(&self) -> usize {
        self.selected.len()
    }

    /// Catalog tasks answering to `id` (full name or slug).
    ///
    /// An exact name match shadows slug matches.
    pub fn lookup(&self, id: &str) -> Vec<&DiscoveredTask> {
        if let Some(exact) = self.catalog.iter().find(|t| t.meta.name == id) {
            return vec![exact];
        }
        self.catalog.iter().filter(|t| t.meta.answers_to(id)).collect()
    }

    /// Catalog task by exact name.
    pub fn get(&self, name: &str) -> Option<&DiscoveredTask> {
        self.catalog.iter().find(|t| t.meta.name == name)
    }
}

/// Scan one source directory (non-recursive).
async fn scan(source: &TaskSource) -> Result<Vec<TaskMeta>, DiscoveryError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| DiscoveryError::Io { path, source }
    };

    let mut entries = match tokio::fs::read_dir(&source.path).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("Task directory {} does not exist, skipping", source.path.display());
            return Ok(Vec::new());
        }
        Err(e) => return Err(io_err(&source.path)(e)),
    };

    let mut found = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(io_err(&source.path))? {
        let path = entry.path();
        let file_type = entry.file_type().await.map_err(io_err(&path))?;
        if !file_type.is_file() {
            continue;
        }
        match TaskFileName::from_path(&path) {
            Ok(Some(file)) => found.push(TaskMeta::from_file(file, source.kind, path)),
            Ok(None) => debug!("Ignoring {}", path.display()),
            Err(source) => return Err(DiscoveryError::Malformed { path, source }),
        }
    }
    Ok(found)
}

/// Merge, order and check task files from every source.
async fn catalog(sources: &[TaskSource], strict_timestamps: bool) -> Result<Vec<TaskMeta>, DiscoveryError> {
    let mut all = Vec::new();
    for source in sources {
        all.extend(scan(source).await?);
    }

    let mut seen: HashMap<&str, &Path> = HashMap::new();
    for meta in &all {
        if let Some(first) = seen.insert(meta.name.as_str(), meta.path.as_path()) {
            return Err(DiscoveryError::DuplicateIdentifier {
                name: meta.name.clone(),
                first: first.to_path_buf(),
                second: meta.path.clone(),
            });
        }
    }

    all.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.file_name.cmp(&b.file_name))
    });

    for pair in all.windows(2) {
        if pair[0].timestamp == pair[1].timestamp {
            if strict_timestamps {
                return Err(DiscoveryError::DuplicateTimestamp {
                    timestamp: pair[0].timestamp.to_string(),
                    first: pair[0].path.clone(),
                    second: pair[1].path.clone(),
                });
            }
            warn!(
                "{} and {} share timestamp {}, ordering by file name",
                pair[0].name, pair[1].name, pair[0].timestamp
            );
        }
    }
    Ok(all)
}

/// Discover tasks and select the ones this run should execute.
pub async fn discover(
    sources: &[TaskSource],
    registry: &TaskRegistry,
    history: &dyn HistoryStore,
    options: &DiscoveryOptions,
) -> Result<TaskSet, DiscoveryError> {
    let metas = catalog(sources, options.strict_timestamps).await?;

    let mut catalog = Vec::with_capacity(metas.len());
    for meta in metas {
        let task = registry.resolve(&meta).await?;
        let latest = history.find_by_name(&meta.name).await?;
        catalog.push(DiscoveredTask {
            meta,
            task,
            history: latest,
        });
    }

    let candidates: Vec<DiscoveredTask> = catalog
        .iter()
        .filter(|t| options.from.map(|from| t.meta.timestamp >= from).unwrap_or(true))
        .filter(|t| {
            if options.tags.is_empty() || t.meta.kind == TaskKind::Migration {
                return true;
            }
            t.tags().iter().any(|tag| options.tags.contains(tag))
        })
        .cloned()
        .collect();

    let selected = if options.repeat {
        if let Some(offender) = candidates
            .iter()
            .find(|t| !t.history.as_ref().map(|r| r.is_terminal()).unwrap_or(false))
        {
            return Err(DiscoveryError::RepeatWithoutHistory {
                name: offender.meta.name.clone(),
            });
        }
        candidates
    } else {
        candidates.into_iter().filter(|t| t.is_pending()).collect()
    };

    info!(
        "Discovered {} task(s), {} selected",
        catalog.len(),
        selected.len()
    );
    Ok(TaskSet { selected, catalog })
}
