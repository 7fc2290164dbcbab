//! Task registry - resolves discovered files to executable tasks.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use runway_core::TaskMeta;
use tracing::debug;

use crate::command::{ManifestLoader, ScriptLoader};
use crate::error::DiscoveryError;
use crate::task::Task;

/// Builds a task from its source file.
#[async_trait]
pub trait TaskLoader: Send + Sync {
    /// Load the task described by `meta`.
    async fn load(&self, meta: &TaskMeta) -> Result<Arc<dyn Task>, DiscoveryError>;
}

/// Explicitly registered tasks plus loaders keyed by file extension.
///
/// Registered tasks win over loaders, so a file can serve only as the ordering
/// anchor for a task implemented in Rust.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<dyn Task>>,
    loaders: HashMap<String, Arc<dyn TaskLoader>>,
}

impl TaskRegistry {
    /// An empty registry with no loaders.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry loading `.json` manifests and `.sh` scripts.
    pub fn with_default_loaders() -> Self {
        Self::new()
            .with_loader("json", Arc::new(ManifestLoader))
            .with_loader("sh", Arc::new(ScriptLoader))
    }

    /// Add a loader for files with extension `ext`.
    pub fn with_loader(mut self, ext: impl Into<String>, loader: Arc<dyn TaskLoader>) -> Self {
        self.loaders.insert(ext.into(), loader);
        self
    }

    /// Register a task under a full name or a slug.
    pub fn register(&mut self, id: impl Into<String>, task: Arc<dyn Task>) -> Result<(), DiscoveryError> {
        let id = id.into();
        if self.tasks.contains_key(&id) {
            return Err(DiscoveryError::DuplicateRegistration(id));
        }
        self.tasks.insert(id, task);
        Ok(())
    }

    /// Registered ids.
    pub fn registered(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.tasks.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Resolve a discovered file: registered name, then slug, then loader.
    pub async fn resolve(&self, meta: &TaskMeta) -> Result<Arc<dyn Task>, DiscoveryError> {
        if let Some(task) = self.tasks.get(&meta.name).or_else(|| self.tasks.get(&meta.slug)) {
            debug!("{} resolved to a registered task", meta.name);
            return Ok(task.clone());
        }
        match meta.extension().and_then(|ext| self.loaders.get(ext)) {
            Some(loader) => loader.load(meta).await,
            None => Err(DiscoveryError::UnknownTask {
                name: meta.name.clone(),
                path: meta.path.clone(),
            }),
        }
    }
}
