//! Dependency resolution into execution waves.
//!
//! Edges run from a dependency to the task that declares it. Waves are peeled
//! off with Kahn's algorithm: every round takes the tasks whose remaining
//! in-degree is zero. Whatever is left once no such task exists is a cycle.

use std::collections::{BTreeSet, HashMap};

use runway_core::TaskKind;
use tracing::debug;

use crate::discovery::{DiscoveredTask, TaskSet};
use crate::error::DiscoveryError;

/// Dependency graph over the selected operations of a [`TaskSet`].
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    migrations: Vec<DiscoveredTask>,
    operations: Vec<DiscoveredTask>,
    /// `deps[i]` holds the indices in `operations` that operation `i` waits on
    deps: Vec<BTreeSet<usize>>,
}

impl DependencyGraph {
    /// Resolve every declared dependency against the catalog.
    pub fn build(set: &TaskSet) -> Result<Self, DiscoveryError> {
        let (migrations, operations): (Vec<_>, Vec<_>) = set
            .selected
            .iter()
            .cloned()
            .partition(|t| t.meta.kind == TaskKind::Migration);

        let index: HashMap<&str, usize> = operations
            .iter()
            .enumerate()
            .map(|(i, t)| (t.meta.name.as_str(), i))
            .collect();
        let selected_migrations: BTreeSet<&str> =
            migrations.iter().map(|t| t.meta.name.as_str()).collect();

        let mut deps = vec![BTreeSet::new(); operations.len()];
        for (i, task) in operations.iter().enumerate() {
            for id in task.dependencies() {
                let matches = set.lookup(&id);
                let dependency = match matches.as_slice() {
                    [] => {
                        return Err(DiscoveryError::UnknownDependency {
                            task: task.meta.name.clone(),
                            dependency: id,
                        })
                    }
                    [one] => *one,
                    _ => {
                        return Err(DiscoveryError::AmbiguousDependency {
                            task: task.meta.name.clone(),
                            dependency: id,
                        })
                    }
                };

                let name = dependency.meta.name.as_str();
                if let Some(&j) = index.get(name) {
                    deps[i].insert(j);
                } else if selected_migrations.contains(name) {
                    // Wave 0 runs ahead of every operation.
                } else if !dependency.has_completed() {
                    return Err(DiscoveryError::UnsatisfiedDependency {
                        task: task.meta.name.clone(),
                        dependency: name.to_string(),
                    });
                }
            }
        }

        Ok(Self {
            migrations,
            operations,
            deps,
        })
    }

    /// Direct dependencies of an operation, by name.
    pub fn dependencies_of(&self, name: &str) -> Vec<&str> {
        self.operations
            .iter()
            .position(|t| t.meta.name == name)
            .map(|i| {
                self.deps[i]
                    .iter()
                    .map(|&j| self.operations[j].meta.name.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Partition into waves. Migrations form the first wave; within a wave
    /// tasks keep their timestamp order.
    pub fn waves(&self) -> Result<Vec<Vec<DiscoveredTask>>, DiscoveryError> {
        let n = self.operations.len();
        let mut in_degree: Vec<usize> = self.deps.iter().map(|d| d.len()).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, deps) in self.deps.iter().enumerate() {
            for &j in deps {
                dependents[j].push(i);
            }
        }

        let mut waves = Vec::new();
        if !self.migrations.is_empty() {
            waves.push(self.migrations.clone());
        }

        let mut placed = 0;
        let mut current: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        while !current.is_empty() {
            let mut next = Vec::new();
            for &i in &current {
                for &k in &dependents[i] {
                    in_degree[k] -= 1;
                    if in_degree[k] == 0 {
                        next.push(k);
                    }
                }
            }
            next.sort_unstable();
            placed += current.len();
            waves.push(current.iter().map(|&i| self.operations[i].clone()).collect());
            current = next;
        }

        if placed < n {
            let tasks = (0..n)
                .filter(|&i| in_degree[i] > 0)
                .map(|i| self.operations[i].meta.name.clone())
                .collect();
            return Err(DiscoveryError::Cycle { tasks });
        }

        debug!("Built {} wave(s)", waves.len());
        Ok(waves)
    }
}

/// Build the execution waves for a task set.
pub fn build_waves(set: &TaskSet) -> Result<Vec<Vec<DiscoveredTask>>, DiscoveryError> {
    DependencyGraph::build(set)?.waves()
}
