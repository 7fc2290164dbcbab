//! File-based configuration (`runway.json`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::discovery::TaskSource;
use crate::engine::{default_storage_dir, OrchestratorConfig};
use crate::strategy::StrategyKind;

/// Default configuration file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "runway.json";

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Isolation lock settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub name: String,
    /// Seconds to wait for the lock
    pub timeout_secs: u64,
    /// Seconds the lock may be held
    pub ttl_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            name: "runway:process".to_string(),
            timeout_secs: 10,
            ttl_secs: 60 * 60,
        }
    }
}

/// Project configuration. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunwayConfig {
    /// Migration directories
    pub migrations: Vec<PathBuf>,
    /// Operation directories
    pub operations: Vec<PathBuf>,
    /// History, lock and queue storage
    pub storage_dir: PathBuf,
    pub lock: LockConfig,
    pub auto_transaction: bool,
    pub record_errors: bool,
    pub default_queue: String,
    /// Written to `executed_by`; defaults to `$HOSTNAME`
    pub instance_id: Option<String>,
    pub strict_timestamps: bool,
    pub strategy: StrategyKind,
    pub schedule_horizon_secs: u64,
}

impl Default for RunwayConfig {
    fn default() -> Self {
        Self {
            migrations: vec![PathBuf::from("migrations")],
            operations: vec![PathBuf::from("operations")],
            storage_dir: default_storage_dir(),
            lock: LockConfig::default(),
            auto_transaction: false,
            record_errors: true,
            default_queue: "default".to_string(),
            instance_id: None,
            strict_timestamps: false,
            strategy: StrategyKind::default(),
            schedule_horizon_secs: 24 * 60 * 60,
        }
    }
}

impl RunwayConfig {
    /// Load from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load an explicit file, or `runway.json` when present, or the defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => Self::load(path),
            None => {
                let default = Path::new(CONFIG_FILE);
                if default.exists() {
                    Self::load(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Source directories, migrations first.
    pub fn sources(&self) -> Vec<TaskSource> {
        self.migrations
            .iter()
            .map(TaskSource::migrations)
            .chain(self.operations.iter().map(TaskSource::operations))
            .collect()
    }

    /// Instance identifier.
    pub fn executed_by(&self) -> String {
        self.instance_id
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "runway".to_string())
    }

    /// Runtime settings for the orchestrator.
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig::default()
            .with_auto_transaction(self.auto_transaction)
            .with_record_errors(self.record_errors)
            .with_executed_by(self.executed_by())
            .with_default_queue(self.default_queue.clone())
            .with_lock(
                self.lock.name.clone(),
                Duration::from_secs(self.lock.timeout_secs),
                Duration::from_secs(self.lock.ttl_secs),
            )
            .with_strict_timestamps(self.strict_timestamps)
            .with_schedule_horizon(Duration::from_secs(self.schedule_horizon_secs))
    }

    /// Directory of the history store.
    pub fn history_dir(&self) -> PathBuf {
        self.storage_dir.join("history")
    }

    /// Directory of lock files.
    pub fn lock_dir(&self) -> PathBuf {
        self.storage_dir.join("locks")
    }

    /// Directory of queued jobs.
    pub fn queue_dir(&self) -> PathBuf {
        self.storage_dir.join("queue")
    }
}
