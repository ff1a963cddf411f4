//! Declarative TOML format for task graph definitions.
//!
//! Parses a graph definition string into a [`GraphToml`], validates it
//! (duplicate ids, unknown dependency references, invalid enum values,
//! cycles via Kahn's algorithm), and lowers it into a frozen
//! [`TaskGraph`].

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use foreman_models::{Complexity, Priority, Subtask};

use super::{GraphError, TaskGraph};

/// Errors from graph definition parsing and validation.
#[derive(Debug, Error)]
pub enum SpecError {
    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("graph must contain at least one subtask")]
    NoSubtasks,

    #[error("duplicate subtask id: {0:?}")]
    DuplicateId(String),

    #[error("subtask {task:?} depends on unknown subtask {dependency:?}")]
    UnknownDependency { task: String, dependency: String },

    #[error("invalid complexity {value:?} on subtask {task:?} (expected small, medium, or large)")]
    InvalidComplexity { task: String, value: String },

    #[error("invalid priority {value:?} on subtask {task:?} (expected critical, high, medium, or low)")]
    InvalidPriority { task: String, value: String },

    #[error("dependency cycle detected involving subtasks: {0}")]
    CycleDetected(String),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Top-level structure of a graph definition file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphToml {
    /// Graph metadata.
    pub graph: GraphMeta,
    /// Subtasks within the graph.
    #[serde(default)]
    pub subtasks: Vec<SubtaskToml>,
}

/// Graph-level metadata in `[graph]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphMeta {
    /// Human-readable graph name.
    pub name: String,
}

/// A single `[[subtasks]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubtaskToml {
    /// Unique subtask id (used as an identifier in `depends_on`).
    pub id: String,
    /// What the subtask should accomplish.
    pub description: String,
    /// Complexity estimate: "small", "medium", or "large".
    #[serde(default = "default_complexity")]
    pub complexity: String,
    /// Priority: "critical", "high", "medium", or "low".
    #[serde(default = "default_priority")]
    pub priority: String,
    /// Capability names a capable agent must offer.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Ids of subtasks this one depends on (must complete first).
    #[serde(default)]
    pub depends_on: Vec<String>,
}

fn default_complexity() -> String {
    "medium".to_owned()
}

fn default_priority() -> String {
    "medium".to_owned()
}

/// Parse and validate a graph definition string.
pub fn parse_graph_toml(content: &str) -> Result<GraphToml, SpecError> {
    let spec: GraphToml = toml::from_str(content)?;
    validate(&spec)?;
    Ok(spec)
}

/// Parse, validate, and lower a graph definition into a frozen [`TaskGraph`].
pub fn load_graph(content: &str) -> Result<TaskGraph, SpecError> {
    let spec = parse_graph_toml(content)?;
    let mut subtasks = Vec::with_capacity(spec.subtasks.len());
    for entry in &spec.subtasks {
        let complexity: Complexity = entry.complexity.parse().expect("validated complexity");
        let priority: Priority = entry.priority.parse().expect("validated priority");
        subtasks.push(
            Subtask::new(&entry.id, &entry.description)
                .depends_on(entry.depends_on.iter().cloned())
                .requires(entry.capabilities.iter().cloned())
                .complexity(complexity)
                .priority(priority),
        );
    }
    Ok(TaskGraph::from_subtasks(subtasks)?)
}

/// Validate the parsed definition structure.
fn validate(spec: &GraphToml) -> Result<(), SpecError> {
    if spec.subtasks.is_empty() {
        return Err(SpecError::NoSubtasks);
    }

    // Collect ids and check for duplicates.
    let mut seen = HashSet::new();
    for subtask in &spec.subtasks {
        if !seen.insert(&subtask.id) {
            return Err(SpecError::DuplicateId(subtask.id.clone()));
        }
    }

    // Validate enum values and dependency references.
    for subtask in &spec.subtasks {
        if subtask.complexity.parse::<Complexity>().is_err() {
            return Err(SpecError::InvalidComplexity {
                task: subtask.id.clone(),
                value: subtask.complexity.clone(),
            });
        }

        if subtask.priority.parse::<Priority>().is_err() {
            return Err(SpecError::InvalidPriority {
                task: subtask.id.clone(),
                value: subtask.priority.clone(),
            });
        }

        for dep in &subtask.depends_on {
            if !seen.contains(dep) {
                return Err(SpecError::UnknownDependency {
                    task: subtask.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    check_for_cycles(spec)?;

    Ok(())
}

/// Detect dependency cycles using Kahn's algorithm for topological sort.
fn check_for_cycles(spec: &GraphToml) -> Result<(), SpecError> {
    let ids: Vec<&str> = spec.subtasks.iter().map(|t| t.id.as_str()).collect();
    let id_to_idx: HashMap<&str, usize> =
        ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    let n = ids.len();
    let mut in_degree = vec![0usize; n];
    let mut adj: Vec<Vec<usize>> = vec![vec![]; n];

    for subtask in &spec.subtasks {
        let task_idx = id_to_idx[subtask.id.as_str()];
        for dep in &subtask.depends_on {
            let dep_idx = id_to_idx[dep.as_str()];
            // Edge: dep -> task (dep must complete before task).
            adj[dep_idx].push(task_idx);
            in_degree[task_idx] += 1;
        }
    }

    let mut queue: VecDeque<usize> = VecDeque::new();
    for (i, deg) in in_degree.iter().enumerate() {
        if *deg == 0 {
            queue.push_back(i);
        }
    }

    let mut sorted_count = 0usize;
    while let Some(node) = queue.pop_front() {
        sorted_count += 1;
        for &neighbor in &adj[node] {
            in_degree[neighbor] -= 1;
            if in_degree[neighbor] == 0 {
                queue.push_back(neighbor);
            }
        }
    }

    if sorted_count != n {
        let cycle_ids: Vec<&str> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, deg)| **deg > 0)
            .map(|(i, _)| ids[i])
            .collect();
        return Err(SpecError::CycleDetected(cycle_ids.join(", ")));
    }

    Ok(())
}
