//! Command-backed tasks.
//!
//! A `.json` manifest describes a task as shell commands plus the options that
//! decide its capabilities; a `.sh` file is a task whose work is the script.
//!
//! ```json
//! {
//!   "run": "psql -f seed.sql",
//!   "rollback": ["psql", "-f", "unseed.sql"],
//!   "tags": ["seed"],
//!   "depends_on": ["create_users"],
//!   "retries": 2,
//!   "timeout_secs": 300
//! }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use runway_core::{Capabilities, Capability, TaskMeta, Time};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::DiscoveryError;
use crate::machine::Outcome;
use crate::registry::TaskLoader;
use crate::task::{RetryPolicy, Task, TaskContext, TaskError, TaskFailure, TaskResult};

/// Exit code a `.sh` task uses to signal a skip.
pub const SCRIPT_SKIP_EXIT_CODE: i32 = 3;

/// A command line: a shell string or an argument vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    /// Run through `sh -c`
    Shell(String),
    /// Program followed by its arguments
    Argv(Vec<String>),
}

impl CommandLine {
    fn to_command(&self) -> anyhow::Result<Command> {
        match self {
            CommandLine::Shell(line) => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(line);
                Ok(cmd)
            }
            CommandLine::Argv(argv) => {
                let (program, args) = argv.split_first().context("empty command")?;
                let mut cmd = Command::new(program);
                cmd.args(args);
                Ok(cmd)
            }
        }
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandLine::Shell(line) => f.write_str(line),
            CommandLine::Argv(argv) => f.write_str(&argv.join(" ")),
        }
    }
}

/// Declarative task definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskManifest {
    /// The work
    pub run: CommandLine,

    #[serde(default)]
    pub rollback: Option<CommandLine>,

    /// Pre-check; a non-zero exit means "nothing to do"
    #[serde(default)]
    pub condition: Option<CommandLine>,

    #[serde(default)]
    pub before: Option<CommandLine>,

    #[serde(default)]
    pub after: Option<CommandLine>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub depends_on: Vec<String>,

    /// `true` forces a transaction, `false` opts out of auto-transaction
    #[serde(default)]
    pub transactional: Option<bool>,

    /// Dispatch to the job queue instead of running inline
    #[serde(default, rename = "async")]
    pub asynchronous: bool,

    #[serde(default)]
    pub queue: Option<String>,

    #[serde(default)]
    pub scheduled_at: Option<Time>,

    /// Retries after the first attempt
    #[serde(default)]
    pub retries: u32,

    #[serde(default)]
    pub retry_delay_ms: u64,

    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub unique: bool,

    #[serde(default)]
    pub idempotent: bool,

    /// Tolerated by the allowed-to-fail strategy
    #[serde(default)]
    pub allow_failure: bool,

    /// Exit code that means "skip" rather than "fail"
    #[serde(default)]
    pub skip_exit_code: Option<i32>,

    /// Extra environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl TaskManifest {
    /// A manifest running a single command and nothing else.
    pub fn command(run: CommandLine) -> Self {
        Self {
            run,
            rollback: None,
            condition: None,
            before: None,
            after: None,
            tags: Vec::new(),
            depends_on: Vec::new(),
            transactional: None,
            asynchronous: false,
            queue: None,
            scheduled_at: None,
            retries: 0,
            retry_delay_ms: 0,
            timeout_secs: None,
            unique: false,
            idempotent: false,
            allow_failure: false,
            skip_exit_code: None,
            env: HashMap::new(),
        }
    }

    /// Capabilities implied by the fields that are set.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities::empty()
            .with_if(Capability::Rollbackable, self.rollback.is_some())
            .with_if(Capability::Idempotent, self.idempotent)
            .with_if(Capability::Transactional, self.transactional == Some(true))
            .with_if(Capability::Asynchronous, self.asynchronous)
            .with_if(Capability::Conditional, self.condition.is_some())
            .with_if(Capability::Tagged, !self.tags.is_empty())
            .with_if(Capability::HasDependencies, !self.depends_on.is_empty())
            .with_if(Capability::Scheduled, self.scheduled_at.is_some())
            .with_if(Capability::Retryable, self.retries > 0)
            .with_if(Capability::Timeoutable, self.timeout_secs.is_some())
            .with_if(Capability::UniqueExecution, self.unique)
            .with_if(
                Capability::HasLifecycleHooks,
                self.before.is_some() || self.after.is_some(),
            )
            .with_if(Capability::FailureTolerant, self.allow_failure)
    }
}

/// Captured result of one command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandOutput {
    /// Last non-empty line of stderr, else of stdout.
    fn summary(&self) -> Option<&str> {
        fn last(s: &str) -> Option<&str> {
            s.lines().rev().map(str::trim).find(|l| !l.is_empty())
        }
        last(&self.stderr).or_else(|| last(&self.stdout))
    }
}

/// A task whose work is a shell command.
#[derive(Debug, Clone)]
pub struct CommandTask {
    manifest: TaskManifest,
    working_dir: PathBuf,
}

impl CommandTask {
    /// Create a task running in `working_dir`.
    pub fn new(manifest: TaskManifest, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            manifest,
            working_dir: working_dir.into(),
        }
    }

    /// The task's manifest.
    pub fn manifest(&self) -> &TaskManifest {
        &self.manifest
    }

    async fn exec(
        &self,
        line: &CommandLine,
        ctx: &TaskContext,
        phase: &str,
        outcome: Option<&str>,
    ) -> anyhow::Result<CommandOutput> {
        let start = std::time::Instant::now();

        let mut cmd = line.to_command()?;
        cmd.current_dir(&self.working_dir)
            .envs(&self.manifest.env)
            .env("RUNWAY_TASK", &ctx.name)
            .env("RUNWAY_KIND", ctx.kind.to_string())
            .env("RUNWAY_RECORD_ID", ctx.record_id.to_string())
            .env("RUNWAY_ATTEMPT", ctx.attempt.to_string())
            .env("RUNWAY_PHASE", phase)
            .kill_on_drop(true);
        if let Some(outcome) = outcome {
            cmd.env("RUNWAY_OUTCOME", outcome);
        }

        debug!("{} [{}]: {}", ctx.name, phase, line);
        let output = cmd
            .output()
            .await
            .with_context(|| format!("failed to spawn `{}`", line))?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration: start.elapsed(),
        })
    }

    /// Run a command and map its exit status onto the task result.
    async fn exec_checked(&self, line: &CommandLine, ctx: &TaskContext, phase: &str) -> TaskResult {
        let output = self.exec(line, ctx, phase, None).await?;
        if output.exit_code == 0 {
            debug!("{} [{}] finished in {:?}", ctx.name, phase, output.duration);
            return Ok(());
        }
        if Some(output.exit_code) == self.manifest.skip_exit_code {
            let reason = output.summary().unwrap_or("skipped by command").to_string();
            return Err(TaskError::skip(reason));
        }

        let detail = output.summary().unwrap_or("no output").to_string();
        Err(TaskError::Failure(
            TaskFailure::new(anyhow::anyhow!(
                "`{}` exited with status {}: {}",
                line,
                output.exit_code,
                detail
            ))
            .with_kind("command")
            .with_code(output.exit_code),
        ))
    }
}

#[async_trait]
impl Task for CommandTask {
    fn capabilities(&self) -> Capabilities {
        self.manifest.capabilities()
    }

    async fn run(&self, ctx: &TaskContext) -> TaskResult {
        self.exec_checked(&self.manifest.run, ctx, "run").await
    }

    async fn rollback(&self, ctx: &TaskContext) -> TaskResult {
        match &self.manifest.rollback {
            Some(line) => self.exec_checked(line, ctx, "rollback").await,
            None => Ok(()),
        }
    }

    async fn should_run(&self, ctx: &TaskContext) -> Result<bool, TaskError> {
        match &self.manifest.condition {
            Some(line) => Ok(self.exec(line, ctx, "condition", None).await?.exit_code == 0),
            None => Ok(true),
        }
    }

    async fn before(&self, ctx: &TaskContext) -> TaskResult {
        match &self.manifest.before {
            Some(line) => self.exec_checked(line, ctx, "before").await,
            None => Ok(()),
        }
    }

    async fn after(&self, ctx: &TaskContext, outcome: &Outcome) {
        if let Some(line) = &self.manifest.after {
            match self.exec(line, ctx, "after", Some(outcome.label())).await {
                Ok(output) if output.exit_code != 0 => {
                    warn!("after hook for {} exited with status {}", ctx.name, output.exit_code)
                }
                Ok(_) => {}
                Err(e) => warn!("after hook for {} failed: {}", ctx.name, e),
            }
        }
    }

    fn tags(&self) -> Vec<String> {
        self.manifest.tags.clone()
    }

    fn depends_on(&self) -> Vec<String> {
        self.manifest.depends_on.clone()
    }

    fn opts_out_of_transaction(&self) -> bool {
        self.manifest.transactional == Some(false)
    }

    fn scheduled_at(&self) -> Option<Time> {
        self.manifest.scheduled_at
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::retries(
            self.manifest.retries,
            Duration::from_millis(self.manifest.retry_delay_ms),
        )
    }

    fn timeout(&self) -> Option<Duration> {
        self.manifest.timeout_secs.map(Duration::from_secs)
    }

    fn queue(&self) -> Option<String> {
        self.manifest.queue.clone()
    }
}

fn working_dir_of(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Loads `.json` manifests.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestLoader;

#[async_trait]
impl TaskLoader for ManifestLoader {
    async fn load(&self, meta: &TaskMeta) -> Result<Arc<dyn Task>, DiscoveryError> {
        let bytes = tokio::fs::read(&meta.path).await.map_err(|source| DiscoveryError::Io {
            path: meta.path.clone(),
            source,
        })?;
        let manifest: TaskManifest = serde_json::from_slice(&bytes).map_err(|e| DiscoveryError::Load {
            name: meta.name.clone(),
            message: e.to_string(),
        })?;
        Ok(Arc::new(CommandTask::new(manifest, working_dir_of(&meta.path))))
    }
}

/// Loads `.sh` scripts, run as `sh <file>`.
///
/// Exiting with [`SCRIPT_SKIP_EXIT_CODE`] skips the task.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptLoader;

#[async_trait]
impl TaskLoader for ScriptLoader {
    async fn load(&self, meta: &TaskMeta) -> Result<Arc<dyn Task>, DiscoveryError> {
        let script = meta.file_name.clone();
        let mut manifest = TaskManifest::command(CommandLine::Argv(vec!["sh".to_string(), script]));
        manifest.skip_exit_code = Some(SCRIPT_SKIP_EXIT_CODE);
        Ok(Arc::new(CommandTask::new(manifest, working_dir_of(&meta.path))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runway_core::{RecordId, RecordType, RunId, TaskKind};
    use tempfile::TempDir;

    fn ctx(name: &str) -> TaskContext {
        TaskContext {
            name: name.to_string(),
            kind: TaskKind::Operation,
            record_id: RecordId::new(),
            run_id: RunId::new(),
            attempt: 1,
            record_type: RecordType::Sync,
            executed_by: "test".to_string(),
        }
    }

    fn shell(line: &str) -> CommandLine {
        CommandLine::Shell(line.to_string())
    }

    #[test]
    fn test_manifest_capabilities() {
        let manifest: TaskManifest = serde_json::from_str(
            r#"{
                "run": "true",
                "rollback": ["echo", "undo"],
                "tags": ["seed"],
                "async": true,
                "retries": 2,
                "transactional": false
            }"#,
        )
        .unwrap();

        let caps = manifest.capabilities();
        assert!(caps.contains(Capability::Rollbackable));
        assert!(caps.contains(Capability::Tagged));
        assert!(caps.contains(Capability::Asynchronous));
        assert!(caps.contains(Capability::Retryable));
        assert!(!caps.contains(Capability::Transactional));
        assert!(!caps.contains(Capability::Conditional));

        let task = CommandTask::new(manifest, ".");
        assert!(task.opts_out_of_transaction());
        assert_eq!(task.retry_policy().max_attempts, 3);
    }

    #[test]
    fn test_output_summary() {
        let output = |stdout: &str, stderr: &str| CommandOutput {
            exit_code: 1,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            duration: Duration::ZERO,
        };

        assert_eq!(output("progress\n", "warn\n  disk full  \n\n").summary(), Some("disk full"));
        assert_eq!(output("first\nlast\n", " \n").summary(), Some("last"));
        assert_eq!(output("\n", "").summary(), None);
    }

    #[tokio::test]
    async fn test_successful_command() {
        let dir = TempDir::new().unwrap();
        let task = CommandTask::new(TaskManifest::command(shell("echo \"$RUNWAY_TASK\" > out.txt")), dir.path());

        task.run(&ctx("2024_01_01_000000_write")).await.unwrap();
        let written = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
        assert_eq!(written.trim(), "2024_01_01_000000_write");
    }

    #[tokio::test]
    async fn test_failing_command_carries_exit_code() {
        let task = CommandTask::new(TaskManifest::command(shell("echo broken >&2; exit 2")), ".");

        let Err(TaskError::Failure(failure)) = task.run(&ctx("t")).await else {
            panic!("expected a failure");
        };
        assert_eq!(failure.kind(), "command");
        assert_eq!(failure.context().code, Some(2));
        assert!(failure.message().contains("broken"));
    }

    #[tokio::test]
    async fn test_skip_exit_code() {
        let mut manifest = TaskManifest::command(shell("echo nothing to backfill; exit 3"));
        manifest.skip_exit_code = Some(3);
        let task = CommandTask::new(manifest, ".");

        match task.run(&ctx("t")).await {
            Err(TaskError::Skip { reason }) => assert_eq!(reason, "nothing to backfill"),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_condition_command() {
        let mut manifest = TaskManifest::command(shell("true"));
        manifest.condition = Some(shell("exit 1"));
        let task = CommandTask::new(manifest, ".");
        assert!(!task.should_run(&ctx("t")).await.unwrap());
    }

    #[tokio::test]
    async fn test_loaders() {
        let dir = TempDir::new().unwrap();
        let json = dir.path().join("2024_01_01_000000_seed.json");
        std::fs::write(&json, r#"{"run": "true", "tags": ["seed"]}"#).unwrap();
        let script = dir.path().join("2024_01_01_000001_skip.sh");
        std::fs::write(&script, "exit 3\n").unwrap();

        let meta = |path: &Path| {
            let file = runway_core::TaskFileName::from_path(path).unwrap().unwrap();
            TaskMeta::from_file(file, TaskKind::Operation, path.to_path_buf())
        };

        let seed = ManifestLoader.load(&meta(&json)).await.unwrap();
        assert_eq!(seed.tags(), vec!["seed"]);

        let skip = ScriptLoader.load(&meta(&script)).await.unwrap();
        assert!(matches!(skip.run(&ctx("t")).await, Err(TaskError::Skip { .. })));

        let bad = dir.path().join("2024_01_01_000002_bad.json");
        std::fs::write(&bad, "{ not json").unwrap();
        assert!(matches!(
            ManifestLoader.load(&meta(&bad)).await,
            Err(DiscoveryError::Load { .. })
        ));
    }
}
