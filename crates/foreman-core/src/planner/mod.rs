//! Execution planning: topological stages, critical path, bottlenecks.
//!
//! The planner is consulted once up-front for reporting and user preview
//! (stages, critical path, ETA). Runtime dispatch is driven by the
//! dependency resolver's ready-set, never by stages.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::graph::{GraphError, TaskGraph};

/// Fan-out at or above which a subtask counts as a bottleneck.
const DEFAULT_BOTTLENECK_FANOUT: usize = 3;

/// A group of subtasks that can execute in parallel without violating
/// dependencies. Stage `k` holds every subtask whose longest dependency
/// path from a source has length `k`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStage {
    pub stage_number: usize,
    /// Subtask ids in this stage, lexically ordered.
    pub subtasks: Vec<String>,
    /// Max complexity weight within the stage (stage tasks run in parallel).
    pub estimated_duration: u32,
}

/// An execution plan: stages, critical path, bottlenecks, and estimates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub stages: Vec<ExecutionStage>,
    /// Longest complexity-weighted path through the DAG.
    pub critical_path: Vec<String>,
    /// Subtasks with fan-out at or above the bottleneck threshold.
    pub bottlenecks: Vec<String>,
    /// Sum of stage durations, in complexity units.
    pub total_estimated_time: u32,
    /// Maximum stage width.
    pub max_parallelism: usize,
}

/// Generates execution plans from frozen task graphs.
#[derive(Debug, Clone)]
pub struct ExecutionPlanner {
    bottleneck_fanout: usize,
}

impl Default for ExecutionPlanner {
    fn default() -> Self {
        Self {
            bottleneck_fanout: DEFAULT_BOTTLENECK_FANOUT,
        }
    }
}

impl ExecutionPlanner {
    /// Planner with the default bottleneck threshold.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the fan-out threshold for bottleneck detection.
    pub fn bottleneck_fanout(mut self, fanout: usize) -> Self {
        self.bottleneck_fanout = fanout;
        self
    }

    /// Generate a plan for a frozen graph.
    pub fn plan(&self, graph: &TaskGraph) -> Result<ExecutionPlan, GraphError> {
        if graph.is_empty() {
            return Ok(ExecutionPlan::default());
        }

        let levels = compute_levels(graph)?;
        let stages = build_stages(graph, &levels);
        let critical_path = critical_path(graph)?;
        let bottlenecks = self.bottlenecks(graph)?;

        let max_parallelism = stages.iter().map(|s| s.subtasks.len()).max().unwrap_or(0);
        let total_estimated_time = stages.iter().map(|s| s.estimated_duration).sum();

        Ok(ExecutionPlan {
            stages,
            critical_path,
            bottlenecks,
            total_estimated_time,
            max_parallelism,
        })
    }

    /// Subtasks with fan-out at or above the threshold, lexically ordered.
    fn bottlenecks(&self, graph: &TaskGraph) -> Result<Vec<String>, GraphError> {
        let mut out = Vec::new();
        for id in graph.ids() {
            if graph.dependents(id)?.len() >= self.bottleneck_fanout {
                out.push(id.to_owned());
            }
        }
        Ok(out)
    }
}

/// Format an execution plan as human-readable text.
pub fn format_plan_text(plan: &ExecutionPlan) -> String {
    if plan.stages.is_empty() {
        return "No subtasks to execute".to_owned();
    }

    let mut lines = Vec::new();
    lines.push("=== Execution Plan ===".to_owned());
    lines.push(String::new());

    lines.push("Execution Stages:".to_owned());
    for stage in &plan.stages {
        lines.push(format!(
            "  Stage {}: [{}] (~{} units)",
            stage.stage_number,
            stage.subtasks.join(", "),
            stage.estimated_duration
        ));
    }

    lines.push(format!("\nCritical Path: {}", plan.critical_path.join(" -> ")));

    if !plan.bottlenecks.is_empty() {
        lines.push(format!("Bottlenecks: {}", plan.bottlenecks.join(", ")));
    }

    lines.push(format!(
        "\nTotal Estimated Time: {} units",
        plan.total_estimated_time
    ));
    lines.push(format!("Max Parallelism: {} subtasks", plan.max_parallelism));

    lines.join("\n")
}

/// Level of each subtask: 0 for sources, otherwise 1 + max level of its
/// dependencies. Computed over the topological order, so every dependency
/// level is known before its dependents.
fn compute_levels(graph: &TaskGraph) -> Result<BTreeMap<String, usize>, GraphError> {
    let mut levels: BTreeMap<String, usize> = BTreeMap::new();
    for subtask in graph.iter_topological()? {
        let level = subtask
            .dependencies
            .iter()
            .map(|d| levels[d] + 1)
            .max()
            .unwrap_or(0);
        levels.insert(subtask.id.clone(), level);
    }
    Ok(levels)
}

fn build_stages(graph: &TaskGraph, levels: &BTreeMap<String, usize>) -> Vec<ExecutionStage> {
    let max_level = levels.values().copied().max().unwrap_or(0);
    let mut stages = Vec::with_capacity(max_level + 1);

    for level in 0..=max_level {
        // BTreeMap iteration keeps the ids lexically ordered.
        let ids: Vec<String> = levels
            .iter()
            .filter(|(_, lv)| **lv == level)
            .map(|(id, _)| id.clone())
            .collect();
        if ids.is_empty() {
            continue;
        }

        let duration = ids
            .iter()
            .filter_map(|id| graph.get(id))
            .map(|t| t.estimated_complexity.weight())
            .max()
            .unwrap_or(0);

        stages.push(ExecutionStage {
            stage_number: level,
            subtasks: ids,
            estimated_duration: duration,
        });
    }

    stages
}

/// Longest complexity-weighted path through the DAG, ties broken by
/// smaller id at both the predecessor choice and the path endpoint.
fn critical_path(graph: &TaskGraph) -> Result<Vec<String>, GraphError> {
    let mut dist: BTreeMap<String, u32> = BTreeMap::new();
    let mut predecessor: BTreeMap<String, Option<String>> = BTreeMap::new();

    for subtask in graph.iter_topological()? {
        let weight = subtask.estimated_complexity.weight();

        let mut best_dist = 0;
        let mut best_pred: Option<String> = None;
        // Dependencies iterate in lexical order; strict > keeps the
        // smallest id on ties.
        for dep in &subtask.dependencies {
            let dep_dist = dist[dep];
            if dep_dist > best_dist {
                best_dist = dep_dist;
                best_pred = Some(dep.clone());
            }
        }

        dist.insert(subtask.id.clone(), best_dist + weight);
        predecessor.insert(subtask.id.clone(), best_pred);
    }

    // Endpoint with maximum distance; lexical iteration + strict > keeps
    // the smallest id on ties.
    let Some(end) = dist
        .iter()
        .fold(None::<(&String, u32)>, |best, (id, d)| match best {
            Some((_, best_d)) if *d <= best_d => best,
            _ => Some((id, *d)),
        })
        .map(|(id, _)| id.clone())
    else {
        return Ok(Vec::new());
    };

    let mut path = Vec::new();
    let mut current = Some(end);
    while let Some(id) = current {
        path.push(id.clone());
        current = predecessor.get(&id).and_then(Clone::clone);
    }
    path.reverse();
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_models::{Complexity, Subtask};

    fn graph(subtasks: Vec<Subtask>) -> TaskGraph {
        TaskGraph::from_subtasks(subtasks).expect("test graph should be valid")
    }

    #[test]
    fn empty_graph_yields_empty_plan() {
        let plan = ExecutionPlanner::new()
            .plan(&graph(vec![]))
            .expect("should plan");
        assert!(plan.stages.is_empty());
        assert!(plan.critical_path.is_empty());
        assert_eq!(plan.total_estimated_time, 0);
        assert_eq!(plan.max_parallelism, 0);
    }

    #[test]
    fn diamond_stages_and_parallelism() {
        let plan = ExecutionPlanner::new()
            .plan(&graph(vec![
                Subtask::new("a", "root").complexity(Complexity::Small),
                Subtask::new("b", "left").depends_on(["a"]),
                Subtask::new("c", "right")
                    .depends_on(["a"])
                    .complexity(Complexity::Large),
                Subtask::new("d", "join").depends_on(["b", "c"]),
            ]))
            .expect("should plan");

        assert_eq!(plan.stages.len(), 3);
        assert_eq!(plan.stages[0].subtasks, vec!["a"]);
        assert_eq!(plan.stages[1].subtasks, vec!["b", "c"]);
        assert_eq!(plan.stages[2].subtasks, vec!["d"]);

        // Stage durations: a=1, max(b=2, c=3)=3, d=2.
        assert_eq!(plan.stages[0].estimated_duration, 1);
        assert_eq!(plan.stages[1].estimated_duration, 3);
        assert_eq!(plan.stages[2].estimated_duration, 2);
        assert_eq!(plan.total_estimated_time, 6);
        assert_eq!(plan.max_parallelism, 2);
    }

    #[test]
    fn critical_path_follows_heaviest_chain() {
        let plan = ExecutionPlanner::new()
            .plan(&graph(vec![
                Subtask::new("a", "root").complexity(Complexity::Small),
                Subtask::new("b", "light").depends_on(["a"]).complexity(Complexity::Small),
                Subtask::new("c", "heavy").depends_on(["a"]).complexity(Complexity::Large),
                Subtask::new("d", "join").depends_on(["b", "c"]),
            ]))
            .expect("should plan");

        assert_eq!(plan.critical_path, vec!["a", "c", "d"]);
    }

    #[test]
    fn critical_path_ties_break_to_smaller_id() {
        // b and c have equal weight; the path through b wins the tie.
        let plan = ExecutionPlanner::new()
            .plan(&graph(vec![
                Subtask::new("a", "root"),
                Subtask::new("b", "left").depends_on(["a"]),
                Subtask::new("c", "right").depends_on(["a"]),
                Subtask::new("d", "join").depends_on(["b", "c"]),
            ]))
            .expect("should plan");

        assert_eq!(plan.critical_path, vec!["a", "b", "d"]);
    }

    #[test]
    fn single_chain_is_its_own_critical_path() {
        let plan = ExecutionPlanner::new()
            .plan(&graph(vec![
                Subtask::new("a", "first"),
                Subtask::new("b", "second").depends_on(["a"]),
                Subtask::new("c", "third").depends_on(["b"]),
            ]))
            .expect("should plan");

        assert_eq!(plan.critical_path, vec!["a", "b", "c"]);
        assert_eq!(plan.max_parallelism, 1);
        assert_eq!(plan.total_estimated_time, 6); // three medium subtasks
    }

    #[test]
    fn bottleneck_requires_fanout_threshold() {
        let hub = graph(vec![
            Subtask::new("hub", "everyone needs this"),
            Subtask::new("w1", "worker").depends_on(["hub"]),
            Subtask::new("w2", "worker").depends_on(["hub"]),
            Subtask::new("w3", "worker").depends_on(["hub"]),
        ]);

        let plan = ExecutionPlanner::new().plan(&hub).expect("should plan");
        assert_eq!(plan.bottlenecks, vec!["hub"]);

        // Raising the threshold declassifies it.
        let plan = ExecutionPlanner::new()
            .bottleneck_fanout(4)
            .plan(&hub)
            .expect("should plan");
        assert!(plan.bottlenecks.is_empty());
    }

    #[test]
    fn format_text_renders_all_sections() {
        let plan = ExecutionPlanner::new()
            .plan(&graph(vec![
                Subtask::new("a", "root"),
                Subtask::new("b", "next").depends_on(["a"]),
            ]))
            .expect("should plan");

        let text = format_plan_text(&plan);
        assert!(text.contains("Stage 0: [a]"));
        assert!(text.contains("Stage 1: [b]"));
        assert!(text.contains("Critical Path: a -> b"));
        assert!(text.contains("Total Estimated Time: 4 units"));
        assert!(text.contains("Max Parallelism: 1"));
    }

    #[test]
    fn format_text_for_empty_plan() {
        assert_eq!(
            format_plan_text(&ExecutionPlan::default()),
            "No subtasks to execute"
        );
    }
}
