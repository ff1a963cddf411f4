use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Blocked,
    Cancelled,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "blocked" => Ok(Self::Blocked),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Estimated complexity of a subtask, used for stage-duration and
/// critical-path weighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Small,
    Medium,
    Large,
}

impl Complexity {
    /// Weight in abstract duration units: small = 1, medium = 2, large = 3.
    pub fn weight(self) -> u32 {
        match self {
            Self::Small => 1,
            Self::Medium => 2,
            Self::Large => 3,
        }
    }
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        };
        f.write_str(s)
    }
}

impl FromStr for Complexity {
    type Err = ComplexityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "small" => Ok(Self::Small),
            "medium" => Ok(Self::Medium),
            "large" => Ok(Self::Large),
            other => Err(ComplexityParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Complexity`] string.
#[derive(Debug, Clone)]
pub struct ComplexityParseError(pub String);

impl fmt::Display for ComplexityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid complexity: {:?}", self.0)
    }
}

impl std::error::Error for ComplexityParseError {}

// ---------------------------------------------------------------------------

/// Priority of a subtask. Critical tasks are dispatched ahead of other
/// ready work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    /// Numeric rank for sorting: critical = 4 down to low = 1.
    pub fn rank(self) -> u8 {
        match self {
            Self::Critical => 4,
            Self::High => 3,
            Self::Medium => 2,
            Self::Low => 1,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        };
        f.write_str(s)
    }
}

impl FromStr for Priority {
    type Err = PriorityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => Err(PriorityParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Priority`] string.
#[derive(Debug, Clone)]
pub struct PriorityParseError(pub String);

impl fmt::Display for PriorityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid priority: {:?}", self.0)
    }
}

impl std::error::Error for PriorityParseError {}

// ---------------------------------------------------------------------------
// Subtask
// ---------------------------------------------------------------------------

/// An atomic unit of work within a task graph.
///
/// Use [`Subtask::new`] for the required fields, then chain the optional
/// setters (builder-style) before adding the subtask to a graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    /// Unique id within the graph (used in `dependencies` of other subtasks).
    pub id: String,
    /// What the subtask should accomplish.
    pub description: String,
    /// Ids of subtasks that must complete before this one starts.
    pub dependencies: BTreeSet<String>,
    /// Complexity estimate used for planning.
    pub estimated_complexity: Complexity,
    /// Capability names an agent must have to execute this subtask.
    pub required_capabilities: BTreeSet<String>,
    /// Current execution status.
    pub status: TaskStatus,
    /// Agent currently or last assigned, if any.
    pub assigned_agent: Option<String>,
    /// Dispatch priority.
    pub priority: Priority,
}

impl Subtask {
    /// Create a subtask with the required fields.
    ///
    /// Optional fields default to: no dependencies, medium complexity, no
    /// required capabilities, `pending` status, unassigned, medium priority.
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            dependencies: BTreeSet::new(),
            estimated_complexity: Complexity::Medium,
            required_capabilities: BTreeSet::new(),
            status: TaskStatus::Pending,
            assigned_agent: None,
            priority: Priority::Medium,
        }
    }

    /// Add dependency ids.
    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Set the complexity estimate.
    pub fn complexity(mut self, complexity: Complexity) -> Self {
        self.estimated_complexity = complexity;
        self
    }

    /// Add required capability names.
    pub fn requires<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities
            .extend(capabilities.into_iter().map(Into::into));
        self
    }

    /// Set the priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Whether the subtask has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_display_roundtrip() {
        let variants = [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Blocked,
            TaskStatus::Cancelled,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_invalid() {
        let result = "bogus".parse::<TaskStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn complexity_display_roundtrip() {
        let variants = [Complexity::Small, Complexity::Medium, Complexity::Large];
        for v in &variants {
            let s = v.to_string();
            let parsed: Complexity = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn complexity_weights_are_ordered() {
        assert_eq!(Complexity::Small.weight(), 1);
        assert_eq!(Complexity::Medium.weight(), 2);
        assert_eq!(Complexity::Large.weight(), 3);
    }

    #[test]
    fn complexity_invalid() {
        let result = "tiny".parse::<Complexity>();
        assert!(result.is_err());
    }

    #[test]
    fn priority_display_roundtrip() {
        let variants = [
            Priority::Critical,
            Priority::High,
            Priority::Medium,
            Priority::Low,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: Priority = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn priority_rank_ordering() {
        assert!(Priority::Critical.rank() > Priority::High.rank());
        assert!(Priority::High.rank() > Priority::Medium.rank());
        assert!(Priority::Medium.rank() > Priority::Low.rank());
    }

    #[test]
    fn priority_invalid() {
        let result = "urgent".parse::<Priority>();
        assert!(result.is_err());
    }

    #[test]
    fn subtask_new_sets_defaults() {
        let task = Subtask::new("build-api", "Build the API layer");
        assert_eq!(task.id, "build-api");
        assert!(task.dependencies.is_empty());
        assert_eq!(task.estimated_complexity, Complexity::Medium);
        assert!(task.required_capabilities.is_empty());
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.assigned_agent.is_none());
        assert_eq!(task.priority, Priority::Medium);
    }

    #[test]
    fn subtask_builder_sets_optional_fields() {
        let task = Subtask::new("deploy", "Deploy to staging")
            .depends_on(["build-api", "run-tests"])
            .complexity(Complexity::Large)
            .requires(["deployment"])
            .priority(Priority::High);

        assert_eq!(task.dependencies.len(), 2);
        assert!(task.dependencies.contains("build-api"));
        assert_eq!(task.estimated_complexity, Complexity::Large);
        assert!(task.required_capabilities.contains("deployment"));
        assert_eq!(task.priority, Priority::High);
    }

    #[test]
    fn subtask_terminal_statuses() {
        let mut task = Subtask::new("t", "t");
        assert!(!task.is_terminal());
        task.status = TaskStatus::Completed;
        assert!(task.is_terminal());
        task.status = TaskStatus::Cancelled;
        assert!(task.is_terminal());
        task.status = TaskStatus::InProgress;
        assert!(!task.is_terminal());
    }

    #[test]
    fn subtask_serde_roundtrip() {
        let task = Subtask::new("t1", "First task").depends_on(["t0"]);
        let json = serde_json::to_string(&task).expect("should serialize");
        assert!(json.contains("\"pending\""));
        let back: Subtask = serde_json::from_str(&json).expect("should deserialize");
        assert_eq!(back.id, "t1");
        assert!(back.dependencies.contains("t0"));
    }
}
