use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Working,
    Blocked,
    Completed,
    Failed,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Working => "working",
            Self::Blocked => "blocked",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentStatus {
    type Err = AgentStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "working" => Ok(Self::Working),
            "blocked" => Ok(Self::Blocked),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(AgentStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AgentStatus`] string.
#[derive(Debug, Clone)]
pub struct AgentStatusParseError(pub String);

impl fmt::Display for AgentStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid agent status: {:?}", self.0)
    }
}

impl std::error::Error for AgentStatusParseError {}

// ---------------------------------------------------------------------------
// Resource metrics
// ---------------------------------------------------------------------------

/// Cumulative resource consumption for one agent. All counters are
/// additive; `time_seconds` accrues per state change in the monitor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetrics {
    pub time_seconds: f64,
    pub tokens: u64,
    pub api_calls: u64,
    pub memory_mb: f64,
}

impl ResourceMetrics {
    /// Add another set of counters onto this one.
    pub fn accrue(&mut self, tokens: u64, api_calls: u64, memory_mb: f64) {
        self.tokens += tokens;
        self.api_calls += api_calls;
        self.memory_mb += memory_mb;
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// A specialized worker in the roster.
///
/// The roster owns the agent's lifetime; the scheduler mutates status,
/// assignment, and metrics through roster operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Unique agent id.
    pub id: String,
    /// Role tag (e.g. "backend-engineer").
    pub role: String,
    /// Capability names this agent offers.
    pub capabilities: BTreeSet<String>,
    /// Current status.
    pub status: AgentStatus,
    /// Subtask currently being executed, if any.
    pub current_task: Option<String>,
    /// Subtask ids assigned to this agent, in assignment order.
    pub assigned_tasks: Vec<String>,
    /// Cumulative resource consumption.
    pub resource_metrics: ResourceMetrics,
}

impl Agent {
    /// Create an idle agent with the given role and capabilities.
    pub fn new<I, S>(id: impl Into<String>, role: impl Into<String>, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            role: role.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            status: AgentStatus::Idle,
            current_task: None,
            assigned_tasks: Vec::new(),
            resource_metrics: ResourceMetrics::default(),
        }
    }

    /// Number of capabilities this agent shares with `required`.
    pub fn capability_overlap(&self, required: &BTreeSet<String>) -> usize {
        self.capabilities.intersection(required).count()
    }

    /// Whether this agent offers every capability in `required`.
    pub fn covers(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_status_display_roundtrip() {
        let variants = [
            AgentStatus::Idle,
            AgentStatus::Working,
            AgentStatus::Blocked,
            AgentStatus::Completed,
            AgentStatus::Failed,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: AgentStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn agent_status_invalid() {
        let result = "asleep".parse::<AgentStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn new_agent_is_idle_and_unassigned() {
        let agent = Agent::new("a1", "researcher", ["search", "summarize"]);
        assert_eq!(agent.status, AgentStatus::Idle);
        assert!(agent.current_task.is_none());
        assert!(agent.assigned_tasks.is_empty());
        assert_eq!(agent.resource_metrics, ResourceMetrics::default());
        assert_eq!(agent.capabilities.len(), 2);
    }

    #[test]
    fn capability_overlap_counts_intersection() {
        let agent = Agent::new("a1", "dev", ["rust", "sql", "docs"]);
        let required: BTreeSet<String> = ["rust", "docs", "k8s"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(agent.capability_overlap(&required), 2);
    }

    #[test]
    fn covers_requires_full_subset() {
        let agent = Agent::new("a1", "dev", ["rust", "sql"]);
        let subset: BTreeSet<String> = ["rust"].into_iter().map(String::from).collect();
        let superset: BTreeSet<String> =
            ["rust", "k8s"].into_iter().map(String::from).collect();
        assert!(agent.covers(&subset));
        assert!(!agent.covers(&superset));
        assert!(agent.covers(&BTreeSet::new()));
    }

    #[test]
    fn metrics_accrue_is_additive() {
        let mut metrics = ResourceMetrics::default();
        metrics.accrue(100, 2, 1.5);
        metrics.accrue(50, 1, 0.5);
        assert_eq!(metrics.tokens, 150);
        assert_eq!(metrics.api_calls, 3);
        assert!((metrics.memory_mb - 2.0).abs() < f64::EPSILON);
    }
}
