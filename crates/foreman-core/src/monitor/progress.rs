//! Progress tracking over a running execution: completion percentages,
//! blocker detection, and risk callouts for reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use foreman_models::TaskStatus;

use crate::graph::TaskGraph;
use crate::planner::ExecutionPlan;

use super::StatusMonitor;

/// Counts of subtasks by status plus the overall completion percentage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressSummary {
    pub total: usize,
    pub completed: usize,
    pub in_progress: usize,
    pub pending: usize,
    pub failed: usize,
    pub blocked: usize,
    pub cancelled: usize,
    pub percent_complete: f64,
}

/// Something preventing the execution from advancing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Blocker {
    /// An agent has made no progress past the stuck threshold.
    StuckAgent {
        agent_id: String,
        current_task: Option<String>,
        seconds_stuck: f64,
    },
    /// A subtask is explicitly marked blocked.
    BlockedSubtask { task_id: String },
    /// A pending subtask depends on a subtask that already failed.
    FailedDependency {
        task_id: String,
        failed_dependency: String,
    },
}

/// A point-in-time progress report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressReport {
    pub summary: ProgressSummary,
    pub blockers: Vec<Blocker>,
    /// Structural risks worth an operator's attention.
    pub risks: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

/// Computes progress and blockers over a graph and the status monitor.
pub struct ProgressTracker<'a> {
    monitor: &'a StatusMonitor,
}

impl<'a> ProgressTracker<'a> {
    pub fn new(monitor: &'a StatusMonitor) -> Self {
        Self { monitor }
    }

    /// Overall progress of the graph, by subtask status.
    pub fn progress(&self, graph: &TaskGraph) -> ProgressSummary {
        let mut summary = ProgressSummary {
            total: graph.len(),
            ..ProgressSummary::default()
        };

        for subtask in graph.subtasks() {
            match subtask.status {
                TaskStatus::Completed => summary.completed += 1,
                TaskStatus::InProgress => summary.in_progress += 1,
                TaskStatus::Pending => summary.pending += 1,
                TaskStatus::Failed => summary.failed += 1,
                TaskStatus::Blocked => summary.blocked += 1,
                TaskStatus::Cancelled => summary.cancelled += 1,
            }
        }

        summary.percent_complete = if summary.total == 0 {
            0.0
        } else {
            summary.completed as f64 / summary.total as f64 * 100.0
        };
        summary
    }

    /// Current blockers: stuck agents, explicitly blocked subtasks, and
    /// pending subtasks whose direct dependencies failed.
    pub fn detect_blockers(&self, graph: &TaskGraph) -> Vec<Blocker> {
        let mut blockers = Vec::new();

        for stuck in self.monitor.detect_stuck() {
            blockers.push(Blocker::StuckAgent {
                agent_id: stuck.agent_id,
                current_task: stuck.current_task,
                seconds_stuck: stuck.seconds_stuck,
            });
        }

        for subtask in graph.subtasks() {
            match subtask.status {
                TaskStatus::Blocked => blockers.push(Blocker::BlockedSubtask {
                    task_id: subtask.id.clone(),
                }),
                TaskStatus::Pending => {
                    for dep in &subtask.dependencies {
                        let dep_failed = graph
                            .get(dep)
                            .is_some_and(|d| d.status == TaskStatus::Failed);
                        if dep_failed {
                            blockers.push(Blocker::FailedDependency {
                                task_id: subtask.id.clone(),
                                failed_dependency: dep.clone(),
                            });
                        }
                    }
                }
                _ => {}
            }
        }

        blockers
    }

    /// Full report: summary, blockers, and plan-level risks (bottlenecks
    /// and serialization).
    pub fn report(&self, graph: &TaskGraph, plan: Option<&ExecutionPlan>) -> ProgressReport {
        let mut risks = Vec::new();
        if let Some(plan) = plan {
            for bottleneck in &plan.bottlenecks {
                risks.push(format!(
                    "bottleneck: many subtasks depend on {bottleneck:?}"
                ));
            }
            if plan.max_parallelism <= 1 && graph.len() > 1 {
                risks.push("low parallelism: the graph executes serially".to_owned());
            }
        }

        ProgressReport {
            summary: self.progress(graph),
            blockers: self.detect_blockers(graph),
            risks,
            generated_at: Utc::now(),
        }
    }
}

/// Format a progress report as human-readable text.
pub fn format_progress_report(report: &ProgressReport) -> String {
    let mut lines = Vec::new();
    lines.push("=== Progress Report ===".to_owned());
    lines.push(format!(
        "Progress: {}/{} complete ({:.0}%)",
        report.summary.completed, report.summary.total, report.summary.percent_complete
    ));
    lines.push(format!(
        "In progress: {}  Pending: {}  Failed: {}  Cancelled: {}",
        report.summary.in_progress,
        report.summary.pending,
        report.summary.failed,
        report.summary.cancelled
    ));

    if !report.blockers.is_empty() {
        lines.push(String::new());
        lines.push("Blockers:".to_owned());
        for blocker in &report.blockers {
            let line = match blocker {
                Blocker::StuckAgent {
                    agent_id,
                    seconds_stuck,
                    ..
                } => format!("  agent {agent_id} stuck for {seconds_stuck:.0}s"),
                Blocker::BlockedSubtask { task_id } => {
                    format!("  subtask {task_id} is blocked")
                }
                Blocker::FailedDependency {
                    task_id,
                    failed_dependency,
                } => format!("  subtask {task_id} waits on failed {failed_dependency}"),
            };
            lines.push(line);
        }
    }

    if !report.risks.is_empty() {
        lines.push(String::new());
        lines.push("Risks:".to_owned());
        for risk in &report.risks {
            lines.push(format!("  {risk}"));
        }
    }

    lines.join("\n")
}
