//! Undo awareness: every mutating action records how to reverse itself.
//!
//! The [`UndoChain`] is a bounded per-execution log of reversible actions.
//! It never executes reverse commands -- it emits a rollback plan (LIFO
//! serialization) for a collaborator to act on. Executors record actions
//! through an [`UndoRecorder`], which consults the [`ActionPolicy`]
//! authorization hook before accepting destructive actions.

pub mod planner;

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::detect::{ErrorContext, Severity};

/// Default bound on the number of recorded actions per execution.
const DEFAULT_MAX_DEPTH: usize = 100;

// ---------------------------------------------------------------------------
// Risk
// ---------------------------------------------------------------------------

/// Risk level of an action; determines rollback sensitivity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskLevel {
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

impl FromStr for RiskLevel {
    type Err = RiskLevelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(RiskLevelParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`RiskLevel`] string.
#[derive(Debug, Clone)]
pub struct RiskLevelParseError(pub String);

impl fmt::Display for RiskLevelParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid risk level: {:?}", self.0)
    }
}

impl std::error::Error for RiskLevelParseError {}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// A single action with its undo capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UndoAction {
    /// What was done.
    pub action: String,
    /// Command that reverses the action. A command starting with `#` (or
    /// empty) declares a manual reverse.
    pub undo_command: String,
    /// Human-facing description of the action.
    pub description: String,
    /// Risk level of the action.
    pub risk_level: RiskLevel,
    /// Files the action touched.
    pub files_affected: Vec<String>,
    /// Additional metadata about the action.
    pub metadata: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl UndoAction {
    /// Create an action record with the required fields.
    pub fn new(
        action: impl Into<String>,
        undo_command: impl Into<String>,
        description: impl Into<String>,
        risk_level: RiskLevel,
    ) -> Self {
        Self {
            action: action.into(),
            undo_command: undo_command.into(),
            description: description.into(),
            risk_level,
            files_affected: Vec::new(),
            metadata: Map::new(),
            timestamp: Utc::now(),
        }
    }

    /// Attach affected file paths.
    pub fn files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files_affected.extend(files.into_iter().map(Into::into));
        self
    }

    /// Attach a metadata entry.
    pub fn meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Whether the reverse is declared manual (empty or comment-only
    /// undo command).
    pub fn is_manual(&self) -> bool {
        let trimmed = self.undo_command.trim();
        trimmed.is_empty() || trimmed.starts_with('#')
    }
}

/// One step of a rollback plan: reverse-insertion order serialization of
/// a recorded action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackStep {
    /// 1-based position in the plan (1 = most recent action).
    pub index: usize,
    pub action: String,
    pub undo_command: String,
    pub risk_level: RiskLevel,
    pub files_affected: Vec<String>,
    /// True when the action declares a manual reverse.
    pub manual: bool,
}

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

/// Bounded per-execution log of reversible actions, oldest evicted on
/// overflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UndoChain {
    actions: VecDeque<UndoAction>,
    max_depth: usize,
}

impl Default for UndoChain {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH)
    }
}

impl UndoChain {
    /// Create a chain with the given maximum depth.
    pub fn new(max_depth: usize) -> Self {
        Self {
            actions: VecDeque::new(),
            max_depth,
        }
    }

    /// Append an action, evicting the oldest past the depth bound.
    pub fn record(&mut self, action: UndoAction) {
        self.actions.push_back(action);
        while self.actions.len() > self.max_depth {
            self.actions.pop_front();
        }
    }

    /// Peek the most recent action.
    pub fn last(&self) -> Option<&UndoAction> {
        self.actions.back()
    }

    /// Number of recorded actions.
    pub fn depth(&self) -> usize {
        self.actions.len()
    }

    /// Whether any action can be rolled back.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// All actions, oldest first.
    pub fn actions(&self) -> impl Iterator<Item = &UndoAction> {
        self.actions.iter()
    }

    /// Clear all recorded actions.
    pub fn clear(&mut self) {
        self.actions.clear();
    }

    /// Serialize the chain as a rollback plan in reverse-insertion order
    /// (most recent action first). The chain proposes; it never executes.
    pub fn rollback_plan(&self) -> Vec<RollbackStep> {
        self.actions
            .iter()
            .rev()
            .enumerate()
            .map(|(i, action)| RollbackStep {
                index: i + 1,
                action: action.action.clone(),
                undo_command: action.undo_command.clone(),
                risk_level: action.risk_level,
                files_affected: action.files_affected.clone(),
                manual: action.is_manual(),
            })
            .collect()
    }

    /// Render the rollback plan as human-readable text, optionally naming
    /// the error that triggered it.
    pub fn format_rollback_plan(&self, trigger: Option<&ErrorContext>) -> String {
        if self.actions.is_empty() {
            return "Rollback Plan: no actions to roll back (empty chain)".to_owned();
        }

        let mut lines = vec!["=== Rollback Plan ===".to_owned(), String::new()];

        if let Some(err) = trigger {
            lines.push(format!("Triggered by: {}", err.kind));
            lines.push(format!("Severity: {}", err.severity));
            lines.push(format!("Message: {}", err.message));
            lines.push(String::new());
        }

        lines.push("Execute these commands in order (most recent first):".to_owned());
        lines.push(String::new());

        for step in self.rollback_plan() {
            lines.push(format!("{}. {}", step.index, step.action));
            lines.push(format!("   Command: {}", step.undo_command));
            lines.push(format!("   Risk: {}", step.risk_level));
            if !step.files_affected.is_empty() {
                lines.push(format!("   Files: {}", step.files_affected.join(", ")));
            }
            if step.manual {
                lines.push("   (manual reverse)".to_owned());
            }
            lines.push(String::new());
        }

        lines.join("\n")
    }

    /// Whether an error should trigger automatic rollback.
    ///
    /// Triggered when severity is high/critical, or when severity is
    /// medium and the most recent action's risk is high/critical.
    pub fn should_auto_rollback(&self, error: &ErrorContext) -> bool {
        if self.actions.is_empty() {
            return false;
        }

        if matches!(error.severity, Severity::Critical | Severity::High) {
            return true;
        }

        if error.severity == Severity::Medium {
            if let Some(last) = self.last() {
                return last.risk_level >= RiskLevel::High;
            }
        }

        false
    }
}

// ---------------------------------------------------------------------------
// Authorization hook + recorder
// ---------------------------------------------------------------------------

/// Decision from the [`ActionPolicy`] authorization hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny { reason: String },
}

/// Policy hook consulted before a destructive undo-recorded action is
/// accepted. Injected by the embedder; sandboxing itself is external.
pub trait ActionPolicy: Send + Sync {
    fn authorize(&self, action: &UndoAction, agent_id: &str) -> PolicyDecision;
}

/// Default policy: allow everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl ActionPolicy for AllowAll {
    fn authorize(&self, _action: &UndoAction, _agent_id: &str) -> PolicyDecision {
        PolicyDecision::Allow
    }
}

/// Errors from recording undo actions.
#[derive(Debug, Error)]
pub enum UndoError {
    #[error("action {action:?} denied by policy: {reason}")]
    ActionDenied { action: String, reason: String },
}

/// Per-task sink for undo actions.
///
/// Handed to an executor through the execution context. Actions buffer in
/// the recorder; the scheduler drains them into the execution's
/// [`UndoChain`] when the task finishes, keeping the chain single-writer.
#[derive(Clone)]
pub struct UndoRecorder {
    agent_id: String,
    buffer: Arc<Mutex<Vec<UndoAction>>>,
    policy: Arc<dyn ActionPolicy>,
}

impl UndoRecorder {
    /// Create a recorder for one agent under the given policy.
    pub fn new(agent_id: impl Into<String>, policy: Arc<dyn ActionPolicy>) -> Self {
        Self {
            agent_id: agent_id.into(),
            buffer: Arc::new(Mutex::new(Vec::new())),
            policy,
        }
    }

    /// Record an action. Actions of high or critical risk are checked
    /// against the authorization policy first.
    pub fn record(&self, action: UndoAction) -> Result<(), UndoError> {
        if action.risk_level >= RiskLevel::High {
            if let PolicyDecision::Deny { reason } =
                self.policy.authorize(&action, &self.agent_id)
            {
                tracing::warn!(
                    agent_id = %self.agent_id,
                    action = %action.action,
                    reason = %reason,
                    "destructive action denied by policy"
                );
                return Err(UndoError::ActionDenied {
                    action: action.action,
                    reason,
                });
            }
        }

        self.buffer.lock().expect("recorder lock poisoned").push(action);
        Ok(())
    }

    /// Number of buffered actions.
    pub fn len(&self) -> usize {
        self.buffer.lock().expect("recorder lock poisoned").len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take all buffered actions, leaving the buffer empty.
    pub fn drain(&self) -> Vec<UndoAction> {
        std::mem::take(&mut *self.buffer.lock().expect("recorder lock poisoned"))
    }
}

impl fmt::Debug for UndoRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UndoRecorder")
            .field("agent_id", &self.agent_id)
            .field("buffered", &self.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::ErrorKind;

    fn action(name: &str, risk: RiskLevel) -> UndoAction {
        UndoAction::new(name, format!("undo {name}"), format!("did {name}"), risk)
    }

    fn error_with(severity: Severity) -> ErrorContext {
        ErrorContext::new(ErrorKind::InvalidOutput, severity, "bad output", "a1", "t1")
    }

    #[test]
    fn risk_level_display_roundtrip() {
        let variants = [
            RiskLevel::Low,
            RiskLevel::Medium,
            RiskLevel::High,
            RiskLevel::Critical,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: RiskLevel = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
        assert!("extreme".parse::<RiskLevel>().is_err());
    }

    #[test]
    fn risk_level_ordering() {
        assert!(RiskLevel::Critical > RiskLevel::High);
        assert!(RiskLevel::High > RiskLevel::Medium);
        assert!(RiskLevel::Medium > RiskLevel::Low);
    }

    #[test]
    fn chain_records_and_peeks() {
        let mut chain = UndoChain::default();
        assert!(chain.is_empty());
        assert!(chain.last().is_none());

        chain.record(action("create file", RiskLevel::Low));
        chain.record(action("edit config", RiskLevel::High));

        assert_eq!(chain.depth(), 2);
        assert_eq!(chain.last().unwrap().action, "edit config");
    }

    #[test]
    fn chain_evicts_oldest_beyond_depth() {
        let mut chain = UndoChain::new(3);
        for i in 0..5 {
            chain.record(action(&format!("step-{i}"), RiskLevel::Low));
        }
        assert_eq!(chain.depth(), 3);
        let oldest = chain.actions().next().unwrap();
        assert_eq!(oldest.action, "step-2");
    }

    #[test]
    fn rollback_plan_is_lifo() {
        let mut chain = UndoChain::default();
        chain.record(action("first", RiskLevel::Low));
        chain.record(action("second", RiskLevel::Medium));
        chain.record(action("third", RiskLevel::High));

        let plan = chain.rollback_plan();
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0].index, 1);
        assert_eq!(plan[0].action, "third");
        assert_eq!(plan[1].action, "second");
        assert_eq!(plan[2].action, "first");
    }

    #[test]
    fn manual_reverse_is_flagged() {
        let mut chain = UndoChain::default();
        chain.record(UndoAction::new(
            "run migration",
            "# Run rollback migration script",
            "migrated schema",
            RiskLevel::Critical,
        ));
        let plan = chain.rollback_plan();
        assert!(plan[0].manual);

        let rendered = chain.format_rollback_plan(None);
        assert!(rendered.contains("(manual reverse)"));
    }

    #[test]
    fn format_plan_names_trigger() {
        let mut chain = UndoChain::default();
        chain.record(action("edit", RiskLevel::Medium).files(["src/main.rs"]));

        let err = error_with(Severity::High);
        let rendered = chain.format_rollback_plan(Some(&err));
        assert!(rendered.contains("Triggered by: invalid_output"));
        assert!(rendered.contains("Severity: high"));
        assert!(rendered.contains("Files: src/main.rs"));
    }

    #[test]
    fn format_plan_for_empty_chain() {
        let chain = UndoChain::default();
        assert!(chain.format_rollback_plan(None).contains("empty chain"));
    }

    #[test]
    fn auto_rollback_decision_table() {
        let mut chain = UndoChain::default();

        // Empty chain: never.
        assert!(!chain.should_auto_rollback(&error_with(Severity::Critical)));

        chain.record(action("low risk thing", RiskLevel::Low));

        // High and critical severities always trigger.
        assert!(chain.should_auto_rollback(&error_with(Severity::Critical)));
        assert!(chain.should_auto_rollback(&error_with(Severity::High)));

        // Medium severity with a low-risk last action does not.
        assert!(!chain.should_auto_rollback(&error_with(Severity::Medium)));

        // Medium severity with a high-risk last action does.
        chain.record(action("drop table", RiskLevel::High));
        assert!(chain.should_auto_rollback(&error_with(Severity::Medium)));

        // Low severity never triggers.
        assert!(!chain.should_auto_rollback(&error_with(Severity::Low)));
    }

    #[test]
    fn recorder_buffers_and_drains() {
        let recorder = UndoRecorder::new("a1", Arc::new(AllowAll));
        recorder.record(action("one", RiskLevel::Low)).unwrap();
        recorder.record(action("two", RiskLevel::Medium)).unwrap();
        assert_eq!(recorder.len(), 2);

        let drained = recorder.drain();
        assert_eq!(drained.len(), 2);
        assert!(recorder.is_empty());
        assert_eq!(drained[0].action, "one");
    }

    #[test]
    fn recorder_consults_policy_for_destructive_actions() {
        struct DenyDeletes;
        impl ActionPolicy for DenyDeletes {
            fn authorize(&self, action: &UndoAction, _agent_id: &str) -> PolicyDecision {
                if action.action.contains("delete") {
                    PolicyDecision::Deny {
                        reason: "deletes are not allowed".to_owned(),
                    }
                } else {
                    PolicyDecision::Allow
                }
            }
        }

        let recorder = UndoRecorder::new("a1", Arc::new(DenyDeletes));

        // Low-risk actions bypass the policy entirely.
        recorder.record(action("delete scratch note", RiskLevel::Low)).unwrap();

        // High-risk destructive action is denied.
        let err = recorder
            .record(action("delete database", RiskLevel::Critical))
            .unwrap_err();
        assert!(matches!(err, UndoError::ActionDenied { .. }));

        // High-risk but allowed action passes.
        recorder.record(action("rewrite config", RiskLevel::High)).unwrap();
        assert_eq!(recorder.len(), 2);
    }
}
