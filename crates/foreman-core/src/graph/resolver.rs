//! Dependency resolution: readiness computation and structural validation.
//!
//! The resolver answers one question at runtime -- which pending subtasks
//! have every dependency completed -- and performs the one-time structural
//! validation (missing edges, cycles) that [`super::TaskGraph::freeze`]
//! runs.

use std::collections::{BTreeMap, BTreeSet};

use foreman_models::{Subtask, TaskStatus};

use super::{GraphError, TaskGraph};

/// Computes the ready-set over a frozen task graph.
pub struct DependencyResolver<'a> {
    graph: &'a TaskGraph,
}

impl<'a> DependencyResolver<'a> {
    /// Wrap a frozen graph.
    pub fn new(graph: &'a TaskGraph) -> Result<Self, GraphError> {
        if !graph.is_frozen() {
            return Err(GraphError::NotFrozen);
        }
        Ok(Self { graph })
    }

    /// Subtasks ready to execute: status `pending`, not in `completed`,
    /// and every dependency in `completed`. Ordered lexically by id.
    pub fn ready(&self, completed: &BTreeSet<String>) -> Vec<&'a Subtask> {
        self.graph
            .subtasks()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| !completed.contains(&t.id))
            .filter(|t| t.dependencies.iter().all(|d| completed.contains(d)))
            .collect()
    }
}

/// Validate a subtask map: membership check for missing dependencies, then
/// DFS coloring for cycles. Called once, at graph freeze.
pub(super) fn validate(subtasks: &BTreeMap<String, Subtask>) -> Result<(), GraphError> {
    // Membership: every dependency id must exist in the graph.
    for (id, subtask) in subtasks {
        for dep in &subtask.dependencies {
            if !subtasks.contains_key(dep) {
                return Err(GraphError::MissingDependency {
                    task: id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    // Cycles: DFS coloring. White = unvisited, gray = on the current path,
    // black = fully explored. A gray-to-gray edge closes a cycle.
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let mut colors: BTreeMap<&str, Color> =
        subtasks.keys().map(|id| (id.as_str(), Color::White)).collect();

    fn visit<'a>(
        id: &'a str,
        subtasks: &'a BTreeMap<String, Subtask>,
        colors: &mut BTreeMap<&'a str, Color>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        colors.insert(id, Color::Gray);
        path.push(id);

        for dep in &subtasks[id].dependencies {
            match colors[dep.as_str()] {
                Color::Gray => {
                    // Reconstruct the cycle from the first occurrence of
                    // `dep` on the current path.
                    let start = path.iter().position(|n| *n == dep).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|s| (*s).to_owned()).collect();
                    cycle.push(dep.clone());
                    return Some(cycle);
                }
                Color::White => {
                    if let Some(cycle) = visit(dep, subtasks, colors, path) {
                        return Some(cycle);
                    }
                }
                Color::Black => {}
            }
        }

        path.pop();
        colors.insert(id, Color::Black);
        None
    }

    let ids: Vec<&str> = subtasks.keys().map(String::as_str).collect();
    for id in ids {
        if colors[id] == Color::White {
            let mut path = Vec::new();
            if let Some(cycle) = visit(id, subtasks, &mut colors, &mut path) {
                return Err(GraphError::CircularDependency(cycle));
            }
        }
    }

    Ok(())
}
