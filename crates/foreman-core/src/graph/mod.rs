//! The task graph: an in-memory DAG of subtasks with dependencies.
//!
//! Construction is append-only until [`TaskGraph::freeze`], which validates
//! the graph (membership check for missing dependencies, DFS coloring for
//! cycles) and builds the reverse index for dependent lookup. After freeze
//! only the status and assignment fields of subtasks may change, and only
//! through the mutation methods the scheduler uses.

pub mod resolver;
pub mod spec;

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use foreman_models::{Subtask, TaskStatus};

/// Errors from graph construction and mutation.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph is frozen; no subtasks can be added")]
    Frozen,

    #[error("graph is not frozen yet; call freeze() first")]
    NotFrozen,

    #[error("duplicate subtask id: {0:?}")]
    DuplicateSubtask(String),

    #[error("subtask {task:?} depends on unknown subtask {dependency:?}")]
    MissingDependency { task: String, dependency: String },

    #[error("dependency cycle detected: {}", .0.join(" -> "))]
    CircularDependency(Vec<String>),

    #[error("unknown subtask id: {0:?}")]
    UnknownSubtask(String),
}

/// An in-memory DAG of subtasks.
///
/// Owned by exactly one execution; the scheduler is the only mutator after
/// freeze.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskGraph {
    subtasks: BTreeMap<String, Subtask>,
    /// Reverse index: subtask id -> ids of subtasks that depend on it.
    /// Built at freeze time.
    dependents: BTreeMap<String, BTreeSet<String>>,
    frozen: bool,
}

impl TaskGraph {
    /// Create an empty, unfrozen graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a frozen graph from a list of subtasks.
    ///
    /// Convenience for the common decompose-then-freeze path.
    pub fn from_subtasks(subtasks: Vec<Subtask>) -> Result<Self, GraphError> {
        let mut graph = Self::new();
        for subtask in subtasks {
            graph.add_subtask(subtask)?;
        }
        graph.freeze()?;
        Ok(graph)
    }

    /// Add a subtask to an unfrozen graph.
    ///
    /// Subtasks may be added in any order; dependencies on ids that have
    /// not been added yet are resolved at [`freeze`](Self::freeze), where a
    /// reference that never materialized fails with
    /// [`GraphError::MissingDependency`].
    pub fn add_subtask(&mut self, subtask: Subtask) -> Result<(), GraphError> {
        if self.frozen {
            return Err(GraphError::Frozen);
        }
        if self.subtasks.contains_key(&subtask.id) {
            return Err(GraphError::DuplicateSubtask(subtask.id));
        }
        self.subtasks.insert(subtask.id.clone(), subtask);
        Ok(())
    }

    /// Validate the graph and seal it against structural mutation.
    ///
    /// Runs the membership check (every dependency id exists) and DFS
    /// coloring (no cycles; the detected cycle is in the error payload),
    /// then materializes the reverse index.
    pub fn freeze(&mut self) -> Result<(), GraphError> {
        resolver::validate(&self.subtasks)?;

        let mut dependents: BTreeMap<String, BTreeSet<String>> = self
            .subtasks
            .keys()
            .map(|id| (id.clone(), BTreeSet::new()))
            .collect();
        for (id, subtask) in &self.subtasks {
            for dep in &subtask.dependencies {
                dependents
                    .get_mut(dep)
                    .expect("validated dependency must exist")
                    .insert(id.clone());
            }
        }

        self.dependents = dependents;
        self.frozen = true;
        Ok(())
    }

    /// Whether the graph has been frozen.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Number of subtasks in the graph.
    pub fn len(&self) -> usize {
        self.subtasks.len()
    }

    /// Whether the graph has no subtasks.
    pub fn is_empty(&self) -> bool {
        self.subtasks.is_empty()
    }

    /// Look up a subtask by id.
    pub fn get(&self, id: &str) -> Option<&Subtask> {
        self.subtasks.get(id)
    }

    /// Whether the graph contains the given id.
    pub fn contains(&self, id: &str) -> bool {
        self.subtasks.contains_key(id)
    }

    /// All subtask ids, lexically ordered.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.subtasks.keys().map(String::as_str)
    }

    /// All subtasks, lexically ordered by id.
    pub fn subtasks(&self) -> impl Iterator<Item = &Subtask> {
        self.subtasks.values()
    }

    /// Ids of subtasks that depend on `id` (forward neighbors).
    ///
    /// Requires a frozen graph; the reverse index is built at freeze.
    pub fn dependents(&self, id: &str) -> Result<&BTreeSet<String>, GraphError> {
        if !self.frozen {
            return Err(GraphError::NotFrozen);
        }
        self.dependents
            .get(id)
            .ok_or_else(|| GraphError::UnknownSubtask(id.to_owned()))
    }

    /// Ids this subtask depends on (backward neighbors).
    pub fn prerequisites(&self, id: &str) -> Result<&BTreeSet<String>, GraphError> {
        self.subtasks
            .get(id)
            .map(|t| &t.dependencies)
            .ok_or_else(|| GraphError::UnknownSubtask(id.to_owned()))
    }

    /// Iterate subtasks in topological order (Kahn's algorithm), breaking
    /// ties lexically by id for determinism.
    pub fn iter_topological(&self) -> Result<Vec<&Subtask>, GraphError> {
        if !self.frozen {
            return Err(GraphError::NotFrozen);
        }

        let mut in_degree: BTreeMap<&str, usize> = self
            .subtasks
            .iter()
            .map(|(id, t)| (id.as_str(), t.dependencies.len()))
            .collect();

        // BTreeSet as the frontier keeps the pop order lexical.
        let mut frontier: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut order = Vec::with_capacity(self.subtasks.len());
        while let Some(id) = frontier.pop_first() {
            order.push(&self.subtasks[id]);
            for dependent in &self.dependents[id] {
                let deg = in_degree
                    .get_mut(dependent.as_str())
                    .expect("dependent must be a known subtask");
                *deg -= 1;
                if *deg == 0 {
                    frontier.insert(dependent);
                }
            }
        }

        debug_assert_eq!(order.len(), self.subtasks.len());
        Ok(order)
    }

    /// Update a subtask's status. The only structural mutation allowed
    /// after freeze, and only the scheduler issues it.
    pub fn set_status(&mut self, id: &str, status: TaskStatus) -> Result<(), GraphError> {
        let subtask = self
            .subtasks
            .get_mut(id)
            .ok_or_else(|| GraphError::UnknownSubtask(id.to_owned()))?;
        subtask.status = status;
        Ok(())
    }

    /// Update a subtask's assigned agent.
    pub fn set_assigned_agent(
        &mut self,
        id: &str,
        agent: Option<String>,
    ) -> Result<(), GraphError> {
        let subtask = self
            .subtasks
            .get_mut(id)
            .ok_or_else(|| GraphError::UnknownSubtask(id.to_owned()))?;
        subtask.assigned_agent = agent;
        Ok(())
    }

    /// Ids of pending subtasks whose transitive dependency closure contains
    /// any id in `failed`. These can never run and are skipped by the
    /// scheduler with a dependency-failed reason.
    pub fn skippable(&self, failed: &BTreeSet<String>) -> Vec<String> {
        let mut skippable = Vec::new();
        for (id, subtask) in &self.subtasks {
            if subtask.status != TaskStatus::Pending {
                continue;
            }
            if self.closure_intersects(id, failed) {
                skippable.push(id.clone());
            }
        }
        skippable
    }

    /// Whether the transitive dependency closure of `id` intersects `set`.
    fn closure_intersects(&self, id: &str, set: &BTreeSet<String>) -> bool {
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(id);
        while let Some(current) = queue.pop_front() {
            let Some(subtask) = self.subtasks.get(current) else {
                continue;
            };
            for dep in &subtask.dependencies {
                if set.contains(dep) {
                    return true;
                }
                if seen.insert(dep) {
                    queue.push_back(dep);
                }
            }
        }
        false
    }
}
