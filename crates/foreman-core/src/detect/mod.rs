//! Failure detection: pure classifiers over execution outcomes.
//!
//! Detectors classify an attempt's outcome into an [`ErrorContext`] --
//! crash, timeout, invalid output, partial completion, or validation
//! failure -- and append it to a bounded history ring. Detectors never
//! recover; recovery decisions belong to [`crate::recovery`].

pub mod validate;

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Default bound on retained error contexts.
const DEFAULT_MAX_HISTORY: usize = 256;

// ---------------------------------------------------------------------------
// Kind + severity
// ---------------------------------------------------------------------------

/// Classification of a runtime failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Crash,
    Timeout,
    InvalidOutput,
    PartialCompletion,
    ValidationFailure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Crash => "crash",
            Self::Timeout => "timeout",
            Self::InvalidOutput => "invalid_output",
            Self::PartialCompletion => "partial_completion",
            Self::ValidationFailure => "validation_failure",
        };
        f.write_str(s)
    }
}

impl FromStr for ErrorKind {
    type Err = ErrorKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "crash" => Ok(Self::Crash),
            "timeout" => Ok(Self::Timeout),
            "invalid_output" => Ok(Self::InvalidOutput),
            "partial_completion" => Ok(Self::PartialCompletion),
            "validation_failure" => Ok(Self::ValidationFailure),
            other => Err(ErrorKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ErrorKind`] string.
#[derive(Debug, Clone)]
pub struct ErrorKindParseError(pub String);

impl fmt::Display for ErrorKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid error kind: {:?}", self.0)
    }
}

impl std::error::Error for ErrorKindParseError {}

// ---------------------------------------------------------------------------

/// Severity of a failure; drives recovery and rollback decisions.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

impl FromStr for Severity {
    type Err = SeverityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(SeverityParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Severity`] string.
#[derive(Debug, Clone)]
pub struct SeverityParseError(pub String);

impl fmt::Display for SeverityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid severity: {:?}", self.0)
    }
}

impl std::error::Error for SeverityParseError {}

// ---------------------------------------------------------------------------
// ErrorContext
// ---------------------------------------------------------------------------

/// Immutable record of one classified failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub message: String,
    pub agent_id: String,
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    /// Formatted error chain for crashes, when available.
    pub stack: Option<String>,
    pub metadata: Map<String, Value>,
}

impl ErrorContext {
    /// Create a context with the required fields.
    pub fn new(
        kind: ErrorKind,
        severity: Severity,
        message: impl Into<String>,
        agent_id: impl Into<String>,
        task_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            severity,
            message: message.into(),
            agent_id: agent_id.into(),
            task_id: task_id.into(),
            timestamp: Utc::now(),
            stack: None,
            metadata: Map::new(),
        }
    }

    /// Attach a formatted error chain.
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Attach a metadata entry.
    pub fn meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Schema for invalid-output detection: a list of fields the output
/// object must contain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputSchema {
    pub required_fields: Vec<String>,
}

impl OutputSchema {
    pub fn required<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required_fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// FailureDetector
// ---------------------------------------------------------------------------

/// Detects and classifies failures, keeping a bounded history ring.
#[derive(Debug)]
pub struct FailureDetector {
    history: VecDeque<ErrorContext>,
    max_history: usize,
}

impl Default for FailureDetector {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HISTORY)
    }
}

impl FailureDetector {
    /// Create a detector retaining at most `max_history` contexts.
    pub fn new(max_history: usize) -> Self {
        Self {
            history: VecDeque::new(),
            max_history,
        }
    }

    /// Classify a raised executor error as a crash. Severity is critical.
    pub fn detect_crash(
        &mut self,
        error: &anyhow::Error,
        agent_id: &str,
        task_id: &str,
    ) -> ErrorContext {
        let context = ErrorContext::new(
            ErrorKind::Crash,
            Severity::Critical,
            format!("crash detected: {}", error.root_cause()),
            agent_id,
            task_id,
        )
        .with_stack(format!("{error:?}"));
        self.record(context.clone());
        context
    }

    /// Classify a deadline expiry as a timeout. Severity is high.
    pub fn detect_timeout(
        &mut self,
        elapsed: Duration,
        deadline: Duration,
        agent_id: &str,
        task_id: &str,
    ) -> ErrorContext {
        let context = ErrorContext::new(
            ErrorKind::Timeout,
            Severity::High,
            format!("timeout after {:.3}s", elapsed.as_secs_f64()),
            agent_id,
            task_id,
        )
        .meta("timeout_seconds", json!(deadline.as_secs_f64()));
        self.record(context.clone());
        context
    }

    /// Check an output value against a schema. Returns a medium-severity
    /// invalid-output context when the value is not an object or misses
    /// required fields; `None` when valid or nothing is required.
    pub fn detect_invalid_output(
        &mut self,
        output: &Value,
        schema: &OutputSchema,
        agent_id: &str,
        task_id: &str,
    ) -> Option<ErrorContext> {
        if schema.required_fields.is_empty() {
            return None;
        }

        let Some(object) = output.as_object() else {
            let context = ErrorContext::new(
                ErrorKind::InvalidOutput,
                Severity::Medium,
                format!("invalid output type: expected object, got {}", value_kind(output)),
                agent_id,
                task_id,
            );
            self.record(context.clone());
            return Some(context);
        };

        let missing: Vec<&String> = schema
            .required_fields
            .iter()
            .filter(|f| !object.contains_key(*f))
            .collect();
        if missing.is_empty() {
            return None;
        }

        let context = ErrorContext::new(
            ErrorKind::InvalidOutput,
            Severity::Medium,
            format!("missing required fields: {missing:?}"),
            agent_id,
            task_id,
        )
        .meta("missing_fields", json!(missing));
        self.record(context.clone());
        Some(context)
    }

    /// Check a completed-items list against the required list. Returns a
    /// medium-severity partial-completion context with the completion
    /// rate in metadata; `None` when every required item completed.
    pub fn detect_partial_completion(
        &mut self,
        completed_items: &[String],
        required_items: &[String],
        agent_id: &str,
        task_id: &str,
    ) -> Option<ErrorContext> {
        let missing: Vec<&String> = required_items
            .iter()
            .filter(|item| !completed_items.contains(item))
            .collect();
        if missing.is_empty() {
            return None;
        }

        let completion_rate = if required_items.is_empty() {
            0.0
        } else {
            (required_items.len() - missing.len()) as f64 / required_items.len() as f64
        };

        let context = ErrorContext::new(
            ErrorKind::PartialCompletion,
            Severity::Medium,
            format!(
                "partial completion: {} of {} items completed ({:.0}%)",
                required_items.len() - missing.len(),
                required_items.len(),
                completion_rate * 100.0
            ),
            agent_id,
            task_id,
        )
        .meta("completion_rate", json!(completion_rate))
        .meta("missing_items", json!(missing));
        self.record(context.clone());
        Some(context)
    }

    /// Append an already-classified context to the history ring.
    pub fn record(&mut self, context: ErrorContext) {
        tracing::debug!(
            kind = %context.kind,
            severity = %context.severity,
            agent_id = %context.agent_id,
            task_id = %context.task_id,
            "recorded error context"
        );
        self.history.push_back(context);
        while self.history.len() > self.max_history {
            self.history.pop_front();
        }
    }

    /// Retrieve history, optionally filtered by agent, task, and kind.
    pub fn history(
        &self,
        agent_id: Option<&str>,
        task_id: Option<&str>,
        kind: Option<ErrorKind>,
    ) -> Vec<&ErrorContext> {
        self.history
            .iter()
            .filter(|e| agent_id.is_none_or(|a| e.agent_id == a))
            .filter(|e| task_id.is_none_or(|t| e.task_id == t))
            .filter(|e| kind.is_none_or(|k| e.kind == k))
            .collect()
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
