use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::task::TaskStatus;

/// The result of one execution attempt of a subtask on an agent.
///
/// Executors construct this from their side of the run; the scheduler
/// classifies it (validation rules, schema checks, partial-completion
/// detection) before deciding the subtask's fate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub agent_id: String,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Error message when the executor reports failure without raising.
    pub error: Option<String>,
    /// Arbitrary result payload. Executors reporting partial work put
    /// `completed_items` / `required_items` string arrays here.
    pub result_data: Value,
}

impl TaskOutcome {
    /// A successful outcome with the given payload.
    pub fn success(
        task_id: impl Into<String>,
        agent_id: impl Into<String>,
        result_data: Value,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            status: TaskStatus::Completed,
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
            error: None,
            result_data,
        }
    }

    /// A failure outcome with an error message.
    pub fn failure(
        task_id: impl Into<String>,
        agent_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            status: TaskStatus::Failed,
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
            error: Some(error.into()),
            result_data: Value::Null,
        }
    }
}
