use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Category of a task request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Software,
    Research,
    Analysis,
    Creative,
    Hybrid,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Software => "software",
            Self::Research => "research",
            Self::Analysis => "analysis",
            Self::Creative => "creative",
            Self::Hybrid => "hybrid",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskType {
    type Err = TaskTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "software" => Ok(Self::Software),
            "research" => Ok(Self::Research),
            "analysis" => Ok(Self::Analysis),
            "creative" => Ok(Self::Creative),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(TaskTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskType`] string.
#[derive(Debug, Clone)]
pub struct TaskTypeParseError(pub String);

impl fmt::Display for TaskTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task type: {:?}", self.0)
    }
}

impl std::error::Error for TaskTypeParseError {}

// ---------------------------------------------------------------------------

/// A structured task request, as produced by the external task parser.
///
/// The kernel treats the parser as an opaque producer: this is the handoff
/// shape, consumed by an external decomposer that lowers it into subtasks
/// and dependency edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    /// The overall goal in natural language.
    pub goal: String,
    /// Task category.
    pub task_type: TaskType,
    /// Constraints extracted by the parser (budget, deadline, ...).
    #[serde(default)]
    pub constraints: BTreeMap<String, Value>,
    /// Background context keyed by topic.
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
    /// Criteria that define success for the whole task.
    #[serde(default)]
    pub success_criteria: Vec<String>,
    /// Ambiguities the parser could not resolve.
    #[serde(default)]
    pub ambiguities: Vec<String>,
    /// The raw input the parser consumed.
    #[serde(default)]
    pub raw: String,
}

impl TaskRequest {
    /// Create a request with the required fields; maps and lists start empty.
    pub fn new(goal: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            goal: goal.into(),
            task_type,
            constraints: BTreeMap::new(),
            context: BTreeMap::new(),
            success_criteria: Vec::new(),
            ambiguities: Vec::new(),
            raw: String::new(),
        }
    }
}
