//! Recovery strategies for failed execution attempts.
//!
//! The engine selects a strategy from the error context (retry, fallback
//! agent, graceful degradation, or none), applies it, and maintains the
//! per-`(agent, task)` circuit breakers that confine a broken pair's blast
//! radius. Breaker keying means one failing agent-task pair never blocks
//! other work.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use foreman_models::Agent;

use crate::detect::{ErrorContext, ErrorKind, Severity};

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

/// Recovery strategies the engine can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Retry,
    FallbackAgent,
    Degrade,
    None,
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Retry => "retry",
            Self::FallbackAgent => "fallback_agent",
            Self::Degrade => "degrade",
            Self::None => "none",
        };
        f.write_str(s)
    }
}

impl FromStr for RecoveryStrategy {
    type Err = RecoveryStrategyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retry" => Ok(Self::Retry),
            "fallback_agent" => Ok(Self::FallbackAgent),
            "degrade" => Ok(Self::Degrade),
            "none" => Ok(Self::None),
            other => Err(RecoveryStrategyParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`RecoveryStrategy`] string.
#[derive(Debug, Clone)]
pub struct RecoveryStrategyParseError(pub String);

impl fmt::Display for RecoveryStrategyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid recovery strategy: {:?}", self.0)
    }
}

impl std::error::Error for RecoveryStrategyParseError {}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Exponential-backoff retry configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given (0-based) retry attempt:
    /// `min(max_delay, base_delay * multiplier^attempt)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt as i32);
        let delay = self.base_delay.mul_f64(factor);
        delay.min(self.max_delay)
    }

    /// Whether another attempt is permitted. Critical errors never retry.
    pub fn should_retry(&self, attempt: u32, error: Option<&ErrorContext>) -> bool {
        if error.is_some_and(|e| e.severity == Severity::Critical) {
            return false;
        }
        attempt < self.max_attempts
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

/// States of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, requests allowed.
    Closed,
    /// Failure threshold exceeded, requests blocked.
    Open,
    /// Testing recovery after the reset timeout.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

/// A per-`(agent, task)` circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Whether a request may proceed. An open breaker past its reset
    /// timeout transitions to half-open and allows one probe.
    pub fn allow_request(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = self
                    .last_failure
                    .is_some_and(|at| at.elapsed() >= self.config.reset_timeout);
                if elapsed {
                    self.state = CircuitState::HalfOpen;
                    self.success_count = 0;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => true,
        }
    }

    /// Record a failure. Closed trips to open at the failure threshold;
    /// half-open reopens immediately.
    pub fn record_failure(&mut self) {
        self.last_failure = Some(Instant::now());
        self.failure_count += 1;

        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.success_count = 0;
            }
            CircuitState::Closed if self.failure_count >= self.config.failure_threshold => {
                self.state = CircuitState::Open;
            }
            _ => {}
        }
    }

    /// Record a success. In half-open, enough successes close the
    /// breaker and clear its counters; in closed, a no-op.
    pub fn record_success(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.success_count += 1;
            if self.success_count >= self.config.success_threshold {
                self.state = CircuitState::Closed;
                self.failure_count = 0;
                self.success_count = 0;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// The (completed, failed, pending) partition of an execution plus its
/// completion percentage, produced by graceful degradation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialResult {
    /// Subtask whose failure triggered degradation.
    pub task_id: String,
    pub completed_subtasks: Vec<String>,
    pub failed_subtasks: Vec<String>,
    pub pending_subtasks: Vec<String>,
    pub completion_percentage: f64,
}

/// Result of applying a recovery strategy.
#[derive(Debug, Clone)]
pub struct RecoveryResult {
    pub strategy: RecoveryStrategy,
    pub success: bool,
    pub retry_count: u32,
    pub should_retry: bool,
    pub circuit_blocked: bool,
    /// Backoff before the next attempt, set on a granted retry.
    pub delay: Option<Duration>,
    pub fallback_agent_id: Option<String>,
    pub partial_result: Option<PartialResult>,
    pub timestamp: DateTime<Utc>,
}

impl RecoveryResult {
    fn new(strategy: RecoveryStrategy) -> Self {
        Self {
            strategy,
            success: false,
            retry_count: 0,
            should_retry: false,
            circuit_blocked: false,
            delay: None,
            fallback_agent_id: None,
            partial_result: None,
            timestamp: Utc::now(),
        }
    }
}

/// Inputs the engine needs beyond the error itself: fallback candidates
/// and the execution's current partition for degradation.
#[derive(Debug, Clone, Default)]
pub struct RecoverySituation {
    pub candidates: Vec<Agent>,
    pub required_capabilities: BTreeSet<String>,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub pending: Vec<String>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

type BreakerKey = (String, String);

/// The recovery decision machine.
#[derive(Debug)]
pub struct RecoveryEngine {
    default_strategy: RecoveryStrategy,
    retry_policy: RetryPolicy,
    breaker_config: BreakerConfig,
    /// Minimum completion fraction for an acceptable partial result.
    degrade_min_threshold: f64,
    breakers: HashMap<BreakerKey, CircuitBreaker>,
    retry_counts: HashMap<BreakerKey, u32>,
    history: HashMap<String, Vec<RecoveryResult>>,
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new(RecoveryStrategy::Retry, RetryPolicy::default())
    }
}

impl RecoveryEngine {
    /// Create an engine with the given default strategy and retry policy.
    pub fn new(default_strategy: RecoveryStrategy, retry_policy: RetryPolicy) -> Self {
        Self {
            default_strategy,
            retry_policy,
            breaker_config: BreakerConfig::default(),
            degrade_min_threshold: 0.5,
            breakers: HashMap::new(),
            retry_counts: HashMap::new(),
            history: HashMap::new(),
        }
    }

    /// Override the breaker thresholds.
    pub fn breaker_config(mut self, config: BreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    /// Override the acceptable-partial threshold (a fraction, 0.0..=1.0).
    pub fn degrade_min_threshold(mut self, threshold: f64) -> Self {
        self.degrade_min_threshold = threshold;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Select the strategy for an error context.
    ///
    /// Critical severity escalates with no recovery regardless of kind;
    /// otherwise the kind decides, falling back to the engine default.
    pub fn select_strategy(&self, error: &ErrorContext) -> RecoveryStrategy {
        if error.severity == Severity::Critical {
            return RecoveryStrategy::None;
        }

        match error.kind {
            ErrorKind::Timeout => RecoveryStrategy::Retry,
            ErrorKind::InvalidOutput => RecoveryStrategy::FallbackAgent,
            ErrorKind::Crash => RecoveryStrategy::FallbackAgent,
            ErrorKind::PartialCompletion => RecoveryStrategy::Degrade,
            ErrorKind::ValidationFailure => self.default_strategy,
        }
    }

    /// Apply a strategy (or the selected one when `strategy` is `None`)
    /// and record the result in the per-task recovery history.
    pub fn apply(
        &mut self,
        error: &ErrorContext,
        strategy: Option<RecoveryStrategy>,
        situation: &RecoverySituation,
    ) -> RecoveryResult {
        let strategy = strategy.unwrap_or_else(|| self.select_strategy(error));

        let result = match strategy {
            RecoveryStrategy::Retry => self.apply_retry(error),
            RecoveryStrategy::FallbackAgent => self.apply_fallback(error, situation),
            RecoveryStrategy::Degrade => self.apply_degrade(error, situation),
            RecoveryStrategy::None => RecoveryResult::new(RecoveryStrategy::None),
        };

        tracing::info!(
            task_id = %error.task_id,
            agent_id = %error.agent_id,
            strategy = %strategy,
            success = result.success,
            should_retry = result.should_retry,
            circuit_blocked = result.circuit_blocked,
            "applied recovery strategy"
        );

        self.history
            .entry(error.task_id.clone())
            .or_default()
            .push(result.clone());
        result
    }

    fn apply_retry(&mut self, error: &ErrorContext) -> RecoveryResult {
        let mut result = RecoveryResult::new(RecoveryStrategy::Retry);
        let key = breaker_key(error);

        let config = self.breaker_config.clone();
        let breaker = self
            .breakers
            .entry(key.clone())
            .or_insert_with(|| CircuitBreaker::new(config));

        if !breaker.allow_request() {
            result.circuit_blocked = true;
            result.should_retry = false;
            return result;
        }

        let current = self.retry_counts.get(&key).copied().unwrap_or(0);
        if self.retry_policy.should_retry(current, Some(error)) {
            result.should_retry = true;
            result.retry_count = current + 1;
            result.delay = Some(self.retry_policy.delay(current));
            result.success = true;
            self.retry_counts.insert(key, current + 1);
        } else {
            result.should_retry = false;
        }

        result
    }

    fn apply_fallback(
        &mut self,
        error: &ErrorContext,
        situation: &RecoverySituation,
    ) -> RecoveryResult {
        let mut result = RecoveryResult::new(RecoveryStrategy::FallbackAgent);

        let fallback = situation
            .candidates
            .iter()
            .filter(|a| a.id != error.agent_id)
            .find(|a| a.covers(&situation.required_capabilities));

        match fallback {
            Some(agent) => {
                result.fallback_agent_id = Some(agent.id.clone());
                result.success = true;
            }
            None => {
                result.success = false;
            }
        }

        result
    }

    fn apply_degrade(
        &mut self,
        error: &ErrorContext,
        situation: &RecoverySituation,
    ) -> RecoveryResult {
        let mut result = RecoveryResult::new(RecoveryStrategy::Degrade);

        let total =
            situation.completed.len() + situation.failed.len() + situation.pending.len();
        let completion_percentage = if total == 0 {
            0.0
        } else {
            situation.completed.len() as f64 / total as f64 * 100.0
        };

        let partial = PartialResult {
            task_id: error.task_id.clone(),
            completed_subtasks: situation.completed.clone(),
            failed_subtasks: situation.failed.clone(),
            pending_subtasks: situation.pending.clone(),
            completion_percentage,
        };

        result.success = completion_percentage >= self.degrade_min_threshold * 100.0;
        result.partial_result = Some(partial);
        result
    }

    /// Record a successful outcome for a breaker pair. No-op when the
    /// pair has no breaker yet.
    pub fn record_success(&mut self, agent_id: &str, task_id: &str) {
        if let Some(breaker) = self
            .breakers
            .get_mut(&(agent_id.to_owned(), task_id.to_owned()))
        {
            breaker.record_success();
        }
    }

    /// Record a failed outcome for a breaker pair, creating the breaker
    /// on first failure.
    pub fn record_failure(&mut self, agent_id: &str, task_id: &str) {
        let config = self.breaker_config.clone();
        let breaker = self
            .breakers
            .entry((agent_id.to_owned(), task_id.to_owned()))
            .or_insert_with(|| CircuitBreaker::new(config));
        breaker.record_failure();

        if breaker.state() == CircuitState::Open {
            tracing::warn!(
                agent_id = %agent_id,
                task_id = %task_id,
                failures = breaker.failure_count(),
                "circuit breaker open"
            );
        }
    }

    /// Current breaker state for a pair, if one exists.
    pub fn breaker_state(&self, agent_id: &str, task_id: &str) -> Option<CircuitState> {
        self.breakers
            .get(&(agent_id.to_owned(), task_id.to_owned()))
            .map(CircuitBreaker::state)
    }

    /// Operator reset: replace the breaker for a pair with a fresh one.
    pub fn reset_breaker(&mut self, agent_id: &str, task_id: &str) {
        let key = (agent_id.to_owned(), task_id.to_owned());
        if self.breakers.contains_key(&key) {
            self.breakers
                .insert(key, CircuitBreaker::new(self.breaker_config.clone()));
        }
    }

    /// Recovery history for a subtask.
    pub fn history(&self, task_id: &str) -> &[RecoveryResult] {
        self.history.get(task_id).map_or(&[], Vec::as_slice)
    }
}

fn breaker_key(error: &ErrorContext) -> BreakerKey {
    (error.agent_id.clone(), error.task_id.clone())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn err(kind: ErrorKind, severity: Severity) -> ErrorContext {
        ErrorContext::new(kind, severity, "test error", "agent-a", "task-x")
    }

    #[test]
    fn strategy_display_roundtrip() {
        let variants = [
            RecoveryStrategy::Retry,
            RecoveryStrategy::FallbackAgent,
            RecoveryStrategy::Degrade,
            RecoveryStrategy::None,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: RecoveryStrategy = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
        assert!("pray".parse::<RecoveryStrategy>().is_err());
    }

    #[test]
    fn retry_delay_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            backoff_multiplier: 2.0,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(350)); // capped
        assert_eq!(policy.delay(10), Duration::from_millis(350));
    }

    #[test]
    fn retry_never_allows_critical_errors() {
        let policy = RetryPolicy::default();
        let critical = err(ErrorKind::Timeout, Severity::Critical);
        assert!(!policy.should_retry(0, Some(&critical)));
        assert!(policy.should_retry(0, None));
        assert!(!policy.should_retry(3, None)); // at max_attempts
    }

    #[test]
    fn strategy_table_follows_kind() {
        let engine = RecoveryEngine::default();
        assert_eq!(
            engine.select_strategy(&err(ErrorKind::Timeout, Severity::High)),
            RecoveryStrategy::Retry
        );
        assert_eq!(
            engine.select_strategy(&err(ErrorKind::InvalidOutput, Severity::Medium)),
            RecoveryStrategy::FallbackAgent
        );
        assert_eq!(
            engine.select_strategy(&err(ErrorKind::PartialCompletion, Severity::Medium)),
            RecoveryStrategy::Degrade
        );
        // Crash at sub-critical severity falls back to another agent.
        assert_eq!(
            engine.select_strategy(&err(ErrorKind::Crash, Severity::High)),
            RecoveryStrategy::FallbackAgent
        );
        // Otherwise: the engine's configured default.
        assert_eq!(
            engine.select_strategy(&err(ErrorKind::ValidationFailure, Severity::Medium)),
            RecoveryStrategy::Retry
        );
    }

    #[test]
    fn critical_severity_overrides_kind() {
        let engine = RecoveryEngine::default();
        for kind in [
            ErrorKind::Crash,
            ErrorKind::Timeout,
            ErrorKind::InvalidOutput,
            ErrorKind::PartialCompletion,
        ] {
            assert_eq!(
                engine.select_strategy(&err(kind, Severity::Critical)),
                RecoveryStrategy::None
            );
        }
    }

    #[test]
    fn retry_grants_attempts_up_to_max() {
        let mut engine = RecoveryEngine::new(
            RecoveryStrategy::Retry,
            RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
                backoff_multiplier: 2.0,
            },
        );
        let error = err(ErrorKind::Timeout, Severity::High);
        let situation = RecoverySituation::default();

        let first = engine.apply(&error, None, &situation);
        assert!(first.should_retry);
        assert_eq!(first.retry_count, 1);
        assert_eq!(first.delay, Some(Duration::from_millis(10)));

        let second = engine.apply(&error, None, &situation);
        assert!(second.should_retry);
        assert_eq!(second.retry_count, 2);
        assert_eq!(second.delay, Some(Duration::from_millis(20)));

        let third = engine.apply(&error, None, &situation);
        assert!(!third.should_retry, "max attempts exhausted");
    }

    #[test]
    fn open_breaker_blocks_retry_for_its_pair_only() {
        let mut engine = RecoveryEngine::default().breaker_config(BreakerConfig {
            failure_threshold: 2,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(60),
        });

        engine.record_failure("agent-a", "task-x");
        assert_eq!(
            engine.breaker_state("agent-a", "task-x"),
            Some(CircuitState::Closed)
        );
        engine.record_failure("agent-a", "task-x");
        assert_eq!(
            engine.breaker_state("agent-a", "task-x"),
            Some(CircuitState::Open)
        );

        let blocked = engine.apply(
            &err(ErrorKind::Timeout, Severity::High),
            None,
            &RecoverySituation::default(),
        );
        assert!(blocked.circuit_blocked);
        assert!(!blocked.should_retry);

        // A different subtask on the same agent is unaffected.
        let other = ErrorContext::new(
            ErrorKind::Timeout,
            Severity::High,
            "other",
            "agent-a",
            "task-y",
        );
        let allowed = engine.apply(&other, None, &RecoverySituation::default());
        assert!(!allowed.circuit_blocked);
        assert!(allowed.should_retry);
    }

    #[test]
    fn open_breaker_half_opens_after_timeout() {
        let mut engine = RecoveryEngine::default().breaker_config(BreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            reset_timeout: Duration::from_millis(20),
        });

        engine.record_failure("agent-a", "task-x");
        assert_eq!(
            engine.breaker_state("agent-a", "task-x"),
            Some(CircuitState::Open)
        );

        std::thread::sleep(Duration::from_millis(40));
        let result = engine.apply(
            &err(ErrorKind::Timeout, Severity::High),
            None,
            &RecoverySituation::default(),
        );
        assert!(!result.circuit_blocked, "probe allowed after reset timeout");
        assert_eq!(
            engine.breaker_state("agent-a", "task-x"),
            Some(CircuitState::HalfOpen)
        );

        // A success in half-open closes the breaker at the threshold.
        engine.record_success("agent-a", "task-x");
        assert_eq!(
            engine.breaker_state("agent-a", "task-x"),
            Some(CircuitState::Closed)
        );
    }

    #[test]
    fn half_open_failure_reopens_immediately() {
        let mut breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            success_threshold: 2,
            reset_timeout: Duration::from_millis(10),
        });
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn success_in_closed_state_is_a_noop() {
        let mut engine = RecoveryEngine::default();
        engine.record_failure("agent-a", "task-x");
        engine.record_success("agent-a", "task-x");
        assert_eq!(
            engine.breaker_state("agent-a", "task-x"),
            Some(CircuitState::Closed)
        );
        // No breaker for an unseen pair.
        assert!(engine.breaker_state("agent-b", "task-x").is_none());
    }

    #[test]
    fn operator_reset_replaces_breaker() {
        let mut engine = RecoveryEngine::default().breaker_config(BreakerConfig {
            failure_threshold: 1,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(60),
        });
        engine.record_failure("agent-a", "task-x");
        assert_eq!(
            engine.breaker_state("agent-a", "task-x"),
            Some(CircuitState::Open)
        );

        engine.reset_breaker("agent-a", "task-x");
        assert_eq!(
            engine.breaker_state("agent-a", "task-x"),
            Some(CircuitState::Closed)
        );
    }

    #[test]
    fn fallback_excludes_failed_agent_and_requires_coverage() {
        let mut engine = RecoveryEngine::default();
        let error = err(ErrorKind::InvalidOutput, Severity::Medium);

        let required: BTreeSet<String> = ["rust".to_owned()].into();
        let situation = RecoverySituation {
            candidates: vec![
                Agent::new("agent-a", "dev", ["rust"]), // the failed agent
                Agent::new("agent-b", "docs", ["prose"]), // lacks coverage
                Agent::new("agent-c", "dev", ["rust", "sql"]),
            ],
            required_capabilities: required,
            ..RecoverySituation::default()
        };

        let result = engine.apply(&error, None, &situation);
        assert!(result.success);
        assert_eq!(result.fallback_agent_id.as_deref(), Some("agent-c"));
    }

    #[test]
    fn fallback_fails_with_no_candidates() {
        let mut engine = RecoveryEngine::default();
        let error = err(ErrorKind::Crash, Severity::High);
        let result = engine.apply(&error, None, &RecoverySituation::default());
        assert!(!result.success);
        assert!(result.fallback_agent_id.is_none());
    }

    #[test]
    fn degrade_accepts_at_threshold() {
        let mut engine = RecoveryEngine::default();
        let error = err(ErrorKind::PartialCompletion, Severity::Medium);

        let situation = RecoverySituation {
            completed: vec!["a".into(), "b".into()],
            failed: vec!["c".into()],
            pending: vec!["d".into()],
            ..RecoverySituation::default()
        };

        let result = engine.apply(&error, None, &situation);
        assert!(result.success, "50% meets the default 0.5 threshold");
        let partial = result.partial_result.expect("partial present");
        assert_eq!(partial.completion_percentage, 50.0);
        assert_eq!(partial.completed_subtasks.len(), 2);
        assert_eq!(partial.task_id, "task-x");
    }

    #[test]
    fn degrade_rejects_below_threshold() {
        let mut engine = RecoveryEngine::default().degrade_min_threshold(0.8);
        let error = err(ErrorKind::PartialCompletion, Severity::Medium);

        let situation = RecoverySituation {
            completed: vec!["a".into()],
            failed: vec!["b".into()],
            pending: vec![],
            ..RecoverySituation::default()
        };

        let result = engine.apply(&error, None, &situation);
        assert!(!result.success);
        assert!(result.partial_result.is_some(), "partial still reported");
    }

    #[test]
    fn history_accumulates_per_task() {
        let mut engine = RecoveryEngine::default();
        let error = err(ErrorKind::Timeout, Severity::High);
        engine.apply(&error, None, &RecoverySituation::default());
        engine.apply(&error, None, &RecoverySituation::default());

        assert_eq!(engine.history("task-x").len(), 2);
        assert!(engine.history("task-unknown").is_empty());
    }
}
