//! Output validation against user-supplied rules and success criteria.

use std::collections::VecDeque;
use std::fmt;

use serde_json::{Value, json};

use super::{ErrorContext, ErrorKind, Severity};

/// Default bound on retained validation failures.
const DEFAULT_MAX_HISTORY: usize = 256;

/// A user-supplied validation rule.
///
/// The check returns `Ok(true)` to pass, `Ok(false)` to fail at the
/// rule's declared severity, or `Err` when the rule itself cannot run --
/// which is classified as a validation failure at elevated (high)
/// severity.
pub struct ValidationRule {
    pub name: String,
    pub description: String,
    pub severity: Severity,
    check: Box<dyn Fn(&Value) -> anyhow::Result<bool> + Send + Sync>,
}

impl ValidationRule {
    /// Create a rule with medium severity.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        check: impl Fn(&Value) -> anyhow::Result<bool> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            severity: Severity::Medium,
            check: Box::new(check),
        }
    }

    /// Override the declared severity.
    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

impl fmt::Debug for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationRule")
            .field("name", &self.name)
            .field("severity", &self.severity)
            .finish()
    }
}

/// Success criteria for criteria-based validation: fields the output
/// must carry and status values it may report.
#[derive(Debug, Clone, Default)]
pub struct SuccessCriteria {
    pub required_fields: Vec<String>,
    pub status_values: Vec<String>,
}

/// Validates agent outputs against registered rules and success criteria,
/// keeping a bounded history of failures.
#[derive(Debug, Default)]
pub struct OutputValidator {
    rules: Vec<ValidationRule>,
    history: VecDeque<ErrorContext>,
}

impl OutputValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a validation rule. Rules run in registration order; the
    /// first failure wins.
    pub fn add_rule(&mut self, rule: ValidationRule) {
        self.rules.push(rule);
    }

    /// Number of registered rules.
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Validate an output against every registered rule.
    ///
    /// Returns the first failure as an [`ErrorContext`], or `None` when
    /// all rules pass.
    pub fn validate(
        &mut self,
        output: &Value,
        agent_id: &str,
        task_id: &str,
    ) -> Option<ErrorContext> {
        for rule in &self.rules {
            let context = match (rule.check)(output) {
                Ok(true) => continue,
                Ok(false) => ErrorContext::new(
                    ErrorKind::ValidationFailure,
                    rule.severity,
                    format!("validation failed: {} - {}", rule.name, rule.description),
                    agent_id,
                    task_id,
                )
                .meta("rule_name", json!(rule.name)),
                // The rule itself could not run: elevated severity.
                Err(error) => ErrorContext::new(
                    ErrorKind::ValidationFailure,
                    Severity::High,
                    format!("validator {} errored: {error}", rule.name),
                    agent_id,
                    task_id,
                )
                .meta("rule_name", json!(rule.name))
                .meta("error", json!(error.to_string())),
            };

            self.push_history(context.clone());
            return Some(context);
        }

        None
    }

    /// Validate an output against task success criteria.
    pub fn validate_against_criteria(
        &mut self,
        output: &Value,
        criteria: &SuccessCriteria,
        agent_id: &str,
        task_id: &str,
    ) -> Option<ErrorContext> {
        if let Some(object) = output.as_object() {
            let missing: Vec<&String> = criteria
                .required_fields
                .iter()
                .filter(|f| !object.contains_key(*f))
                .collect();
            if !missing.is_empty() {
                let context = ErrorContext::new(
                    ErrorKind::ValidationFailure,
                    Severity::Medium,
                    format!("missing required fields from success criteria: {missing:?}"),
                    agent_id,
                    task_id,
                )
                .meta("missing_fields", json!(missing));
                self.push_history(context.clone());
                return Some(context);
            }

            if !criteria.status_values.is_empty() {
                if let Some(status) = object.get("status").and_then(Value::as_str) {
                    if !criteria.status_values.iter().any(|v| v == status) {
                        let context = ErrorContext::new(
                            ErrorKind::ValidationFailure,
                            Severity::Medium,
                            format!(
                                "invalid status value: {status:?} not in allowed values {:?}",
                                criteria.status_values
                            ),
                            agent_id,
                            task_id,
                        )
                        .meta("actual_status", json!(status));
                        self.push_history(context.clone());
                        return Some(context);
                    }
                }
            }
        }

        None
    }

    /// Validation failure history, optionally filtered by agent and task.
    pub fn history(
        &self,
        agent_id: Option<&str>,
        task_id: Option<&str>,
    ) -> Vec<&ErrorContext> {
        self.history
            .iter()
            .filter(|e| agent_id.is_none_or(|a| e.agent_id == a))
            .filter(|e| task_id.is_none_or(|t| e.task_id == t))
            .collect()
    }

    fn push_history(&mut self, context: ErrorContext) {
        self.history.push_back(context);
        while self.history.len() > DEFAULT_MAX_HISTORY {
            self.history.pop_front();
        }
    }
}
