//! Task metadata and the capability set.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use crate::timestamp::{TaskFileName, TaskTimestamp};

/// The two task classes the engine orchestrates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Schema migration; always ahead of operations in dependency waves
    Migration,
    /// Business-logic operation
    Operation,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Migration => write!(f, "migration"),
            TaskKind::Operation => write!(f, "operation"),
        }
    }
}

/// An optional behavioral contract a task may satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Rollbackable,
    Idempotent,
    Transactional,
    Asynchronous,
    Conditional,
    Tagged,
    HasDependencies,
    Scheduled,
    Retryable,
    Timeoutable,
    UniqueExecution,
    HasLifecycleHooks,
    FailureTolerant,
}

impl Capability {
    /// Every capability, in declaration order.
    pub const ALL: [Capability; 13] = [
        Capability::Rollbackable,
        Capability::Idempotent,
        Capability::Transactional,
        Capability::Asynchronous,
        Capability::Conditional,
        Capability::Tagged,
        Capability::HasDependencies,
        Capability::Scheduled,
        Capability::Retryable,
        Capability::Timeoutable,
        Capability::UniqueExecution,
        Capability::HasLifecycleHooks,
        Capability::FailureTolerant,
    ];

    fn bit(self) -> u16 {
        1 << (self as u16)
    }

    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Rollbackable => "rollbackable",
            Capability::Idempotent => "idempotent",
            Capability::Transactional => "transactional",
            Capability::Asynchronous => "asynchronous",
            Capability::Conditional => "conditional",
            Capability::Tagged => "tagged",
            Capability::HasDependencies => "has_dependencies",
            Capability::Scheduled => "scheduled",
            Capability::Retryable => "retryable",
            Capability::Timeoutable => "timeoutable",
            Capability::UniqueExecution => "unique_execution",
            Capability::HasLifecycleHooks => "has_lifecycle_hooks",
            Capability::FailureTolerant => "failure_tolerant",
        }
    }
}

/// A queryable set of capabilities, stored as a bitset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Capabilities(u16);

impl Capabilities {
    /// The empty set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Add a capability.
    pub fn with(mut self, capability: Capability) -> Self {
        self.0 |= capability.bit();
        self
    }

    /// Add a capability when `condition` holds.
    pub fn with_if(self, capability: Capability, condition: bool) -> Self {
        if condition {
            self.with(capability)
        } else {
            self
        }
    }

    /// Check membership.
    pub fn contains(&self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    /// Whether no capability is declared.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Iterate declared capabilities in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL.into_iter().filter(|c| self.contains(*c))
    }
}

impl FromIterator<Capability> for Capabilities {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), Self::with)
    }
}

impl std::fmt::Display for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.iter().map(|c| c.as_str()).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

/// Where a task was found and what it is called.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMeta {
    /// Ordering key
    pub timestamp: TaskTimestamp,

    /// Unique name (`timestamp_slug`)
    pub name: String,

    /// Slug after the timestamp
    pub slug: String,

    /// Migration or operation
    pub kind: TaskKind,

    /// Source file
    pub path: PathBuf,

    /// File name, used to break timestamp ties
    pub file_name: String,
}

impl TaskMeta {
    /// Build metadata from a parsed file name.
    pub fn from_file(file: TaskFileName, kind: TaskKind, path: PathBuf) -> Self {
        Self {
            timestamp: file.timestamp,
            name: file.name,
            slug: file.slug,
            kind,
            path,
            file_name: file.file_name,
        }
    }

    /// File extension without the dot.
    pub fn extension(&self) -> Option<&str> {
        self.path.extension().and_then(|e| e.to_str())
    }

    /// Whether `id` names this task (full name or slug).
    pub fn answers_to(&self, id: &str) -> bool {
        self.name == id || self.slug == id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_set_membership() {
        let caps = Capabilities::empty()
            .with(Capability::Rollbackable)
            .with(Capability::Tagged);

        assert!(caps.contains(Capability::Rollbackable));
        assert!(caps.contains(Capability::Tagged));
        assert!(!caps.contains(Capability::Asynchronous));
        assert_eq!(caps.iter().count(), 2);
    }

    #[test]
    fn test_capability_set_from_iter_and_display() {
        let caps: Capabilities = [Capability::Retryable, Capability::Idempotent]
            .into_iter()
            .collect();
        assert_eq!(caps.to_string(), "[idempotent, retryable]");
        assert!(Capabilities::empty().is_empty());
    }

    #[test]
    fn test_with_if() {
        let caps = Capabilities::empty()
            .with_if(Capability::Scheduled, false)
            .with_if(Capability::Conditional, true);
        assert!(!caps.contains(Capability::Scheduled));
        assert!(caps.contains(Capability::Conditional));
    }

    #[test]
    fn test_meta_answers_to_name_and_slug() {
        let file = TaskFileName::parse("2024_01_01_000000_seed_roles.sh").unwrap().unwrap();
        let meta = TaskMeta::from_file(file, TaskKind::Operation, PathBuf::from("ops/2024_01_01_000000_seed_roles.sh"));
        assert!(meta.answers_to("seed_roles"));
        assert!(meta.answers_to("2024_01_01_000000_seed_roles"));
        assert!(!meta.answers_to("roles"));
        assert_eq!(meta.extension(), Some("sh"));
    }
}
