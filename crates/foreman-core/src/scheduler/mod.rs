//! The parallel scheduler: dependency-aware dispatch of subtasks to
//! agents, with recovery on failure.
//!
//! One scheduler instance drives one execution. The control loop runs on
//! a single task that owns the completed/failed/in-progress bookkeeping;
//! workers execute as spawned tokio tasks and report back over an mpsc
//! channel (first-completed semantics via `select!`). Cancellation is
//! cooperative through a token tree: the scheduler owns the root token
//! and each worker gets a child.

pub mod handoff;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use foreman_models::{Agent, AgentStatus, Subtask, TaskOutcome, TaskStatus};

use crate::detect::validate::OutputValidator;
use crate::detect::{ErrorContext, ErrorKind, FailureDetector, OutputSchema};
use crate::graph::resolver::DependencyResolver;
use crate::graph::{GraphError, TaskGraph};
use crate::monitor::StatusMonitor;
use crate::recovery::{PartialResult, RecoveryEngine, RecoverySituation, RecoveryStrategy};
use crate::roster::{AgentRoster, RosterError};
use crate::undo::{ActionPolicy, AllowAll, UndoAction, UndoChain, UndoError, UndoRecorder};

use handoff::HandoffManager;

/// How long an aborting scheduler waits for in-flight workers to deliver
/// their final outcomes before giving up on them.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Executor seam
// ---------------------------------------------------------------------------

/// The implementer-supplied execution callback.
///
/// Invoked once per attempt; must be safe to run concurrently with other
/// invocations on different subtasks. Report failure by returning `Err`
/// (classified as a crash) or let the scheduler's deadline classify a
/// timeout. Undo actions and resource usage flow through the
/// [`ExecutionContext`].
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        subtask: &Subtask,
        agent: &Agent,
        ctx: &ExecutionContext,
    ) -> anyhow::Result<TaskOutcome>;
}

// Compile-time assertion: Executor must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Executor) {}
};

/// Resource usage tallied by one attempt, drained into the roster when
/// the attempt finishes.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageTally {
    pub tokens: u64,
    pub api_calls: u64,
    pub memory_mb: f64,
}

/// Per-attempt context handed to the executor callback.
pub struct ExecutionContext {
    /// 0-based attempt number for this subtask.
    pub attempt: u32,
    /// Child cancellation token; well-behaved executors check it at
    /// bounded intervals during long work.
    pub cancel: CancellationToken,
    agent_id: String,
    recorder: UndoRecorder,
    monitor: Arc<StatusMonitor>,
    handoffs: Arc<HandoffManager>,
    usage: StdMutex<UsageTally>,
}

impl ExecutionContext {
    fn new(
        attempt: u32,
        cancel: CancellationToken,
        agent_id: String,
        policy: Arc<dyn ActionPolicy>,
        monitor: Arc<StatusMonitor>,
        handoffs: Arc<HandoffManager>,
    ) -> Self {
        Self {
            attempt,
            cancel,
            recorder: UndoRecorder::new(agent_id.clone(), policy),
            agent_id,
            monitor,
            handoffs,
            usage: StdMutex::new(UsageTally::default()),
        }
    }

    /// Id of the agent executing this attempt.
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Record a reversible action. Destructive actions are checked
    /// against the authorization policy before acceptance.
    pub fn record_undo(&self, action: UndoAction) -> Result<(), UndoError> {
        self.recorder.record(action)
    }

    /// Reset the agent's stuck-detection clock.
    pub fn report_progress(&self) {
        self.monitor.record_progress(&self.agent_id);
    }

    /// Accrue resource usage for this attempt and the agent's monitor
    /// counters.
    pub fn record_usage(&self, tokens: u64, api_calls: u64, memory_mb: f64) {
        self.monitor
            .record_resource_usage(&self.agent_id, tokens, api_calls, memory_mb);
        let mut tally = self.usage.lock().expect("usage lock poisoned");
        tally.tokens += tokens;
        tally.api_calls += api_calls;
        tally.memory_mb += memory_mb;
    }

    /// Handoff manager for state transfer between agents.
    pub fn handoffs(&self) -> &HandoffManager {
        &self.handoffs
    }

    fn drain_undo(&self) -> Vec<UndoAction> {
        self.recorder.drain()
    }

    fn take_usage(&self) -> UsageTally {
        std::mem::take(&mut *self.usage.lock().expect("usage lock poisoned"))
    }
}

// ---------------------------------------------------------------------------
// Configuration, report, errors
// ---------------------------------------------------------------------------

/// Scheduler configuration.
#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    /// Maximum concurrent subtasks. Defaults to the roster size.
    pub max_concurrent: Option<usize>,
    /// Per-attempt deadline; expiry is classified as a timeout failure.
    pub task_timeout: Option<Duration>,
    /// When false, the first failure cancels all running work and aborts
    /// the execution. When true, recovery runs and independent work
    /// continues.
    pub continue_on_error: bool,
    /// Optional schema every successful output must satisfy.
    pub output_schema: Option<OutputSchema>,
}

/// Aggregate outcome of an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// Every subtask completed.
    Completed,
    /// The graph is fully decided but some subtasks failed.
    Failed { failed_tasks: Vec<String> },
    /// `continue_on_error = false` and a subtask failed; running work was
    /// cancelled.
    Aborted { first_failure: String },
    /// The scheduler's cancellation token fired.
    Interrupted,
}

/// A failed subtask with its classified error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedTask {
    pub task_id: String,
    /// Classification, when the failure came through the detector.
    pub kind: Option<ErrorKind>,
    pub reason: String,
}

/// Scheduler performance counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerMetrics {
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub skipped_tasks: usize,
    pub max_concurrent_observed: usize,
    pub total_wall_seconds: f64,
    /// Duration of the last attempt per subtask, seconds.
    pub task_durations: BTreeMap<String, f64>,
    /// Cumulative idle time across all agents, seconds.
    pub total_idle_seconds: f64,
}

impl SchedulerMetrics {
    /// Work time across all attempts, seconds.
    pub fn total_work_seconds(&self) -> f64 {
        self.task_durations.values().sum()
    }

    /// Efficiency: work time / (work time + idle time), as a percentage.
    /// Zero when nothing ran.
    pub fn efficiency(&self) -> f64 {
        let work = self.total_work_seconds();
        let total = work + self.total_idle_seconds;
        if total == 0.0 {
            0.0
        } else {
            work / total * 100.0
        }
    }
}

/// Final report of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub outcome: ExecutionOutcome,
    pub completed: Vec<String>,
    pub failed: Vec<FailedTask>,
    pub cancelled: Vec<String>,
    /// Partial results the recovery engine accepted.
    pub partial_results: Vec<PartialResult>,
    /// Rendered rollback plan, present when an error triggered the
    /// auto-rollback policy. A proposal for a collaborator, never
    /// executed here.
    pub rollback_plan: Option<String>,
    pub metrics: SchedulerMetrics,
}

/// Errors from the scheduler itself (not from subtask execution).
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("task graph must be frozen before execution")]
    GraphNotFrozen,

    #[error("scheduler invariant violated: {0}")]
    InvariantViolation(String),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Roster(#[from] RosterError),
}

// ---------------------------------------------------------------------------
// Internal plumbing
// ---------------------------------------------------------------------------

/// Message sent from a finished worker back to the control loop.
struct ExecutionDone {
    task_id: String,
    agent_id: String,
    attempt: u32,
    started: Instant,
    outcome: AttemptOutcome,
    undo_actions: Vec<UndoAction>,
    usage: UsageTally,
}

enum AttemptOutcome {
    Finished(TaskOutcome),
    Crashed(anyhow::Error),
    TimedOut { elapsed: Duration },
    Cancelled,
}

/// A re-dispatch granted by the recovery engine: retry on the same agent
/// after backoff, or rebind to a fallback agent.
struct RetryTicket {
    task_id: String,
    agent_id: String,
    attempt: u32,
    delay: Duration,
}

struct RunningTask {
    agent_id: String,
    token: CancellationToken,
}

/// Mutable loop state, owned by the control task.
#[derive(Default)]
struct Bookkeeping {
    completed: BTreeSet<String>,
    failed: BTreeMap<String, FailedTask>,
    cancelled: BTreeSet<String>,
    in_progress: BTreeSet<String>,
    /// Subtasks granted a retry/fallback, waiting in the ticket queue.
    awaiting_retry: BTreeSet<String>,
    running: HashMap<String, RunningTask>,
    idle_since: HashMap<String, Instant>,
    total_idle: Duration,
    metrics: SchedulerMetrics,
    partial_results: Vec<PartialResult>,
    rollback_trigger: Option<ErrorContext>,
}

impl Bookkeeping {
    fn decided(&self) -> usize {
        self.completed.len() + self.failed.len() + self.cancelled.len()
    }

    /// Mark a subtask failed with a direct failure reason.
    fn fail(
        &mut self,
        graph: &mut TaskGraph,
        task_id: &str,
        kind: Option<ErrorKind>,
        reason: impl Into<String>,
    ) -> Result<(), SchedulerError> {
        graph.set_status(task_id, TaskStatus::Failed)?;
        self.failed.insert(
            task_id.to_owned(),
            FailedTask {
                task_id: task_id.to_owned(),
                kind,
                reason: reason.into(),
            },
        );
        self.metrics.failed_tasks += 1;
        Ok(())
    }

    /// Mark a subtask failed because an ancestor failed. Counted as
    /// skipped, not as a direct failure.
    fn skip(&mut self, graph: &mut TaskGraph, task_id: &str) -> Result<(), SchedulerError> {
        graph.set_status(task_id, TaskStatus::Failed)?;
        self.failed.insert(
            task_id.to_owned(),
            FailedTask {
                task_id: task_id.to_owned(),
                kind: None,
                reason: "dependency failed".to_owned(),
            },
        );
        self.metrics.skipped_tasks += 1;
        Ok(())
    }

    /// Accrue an agent's idle window ending now (it is being put to work).
    fn end_idle(&mut self, agent_id: &str) {
        if let Some(since) = self.idle_since.remove(agent_id) {
            self.total_idle += since.elapsed();
        }
    }

    /// Start an idle window for an agent (its work just finished).
    fn begin_idle(&mut self, agent_id: &str) {
        self.idle_since.insert(agent_id.to_owned(), Instant::now());
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

impl std::fmt::Debug for ParallelScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelScheduler").finish_non_exhaustive()
    }
}

/// Top-level driver for one execution of a task graph.
pub struct ParallelScheduler {
    graph: TaskGraph,
    roster: AgentRoster,
    config: SchedulerConfig,
    monitor: Arc<StatusMonitor>,
    handoffs: Arc<HandoffManager>,
    policy: Arc<dyn ActionPolicy>,
    detector: FailureDetector,
    validator: OutputValidator,
    engine: RecoveryEngine,
    undo_chain: UndoChain,
    cancel: CancellationToken,
}

impl ParallelScheduler {
    /// Create a scheduler over a frozen graph and a roster.
    pub fn new(
        graph: TaskGraph,
        roster: AgentRoster,
        config: SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        if !graph.is_frozen() {
            return Err(SchedulerError::GraphNotFrozen);
        }
        Ok(Self {
            graph,
            roster,
            config,
            monitor: Arc::new(StatusMonitor::default()),
            handoffs: Arc::new(HandoffManager::default()),
            policy: Arc::new(AllowAll),
            detector: FailureDetector::default(),
            validator: OutputValidator::new(),
            engine: RecoveryEngine::default(),
            undo_chain: UndoChain::default(),
            cancel: CancellationToken::new(),
        })
    }

    /// Replace the status monitor (e.g. with a custom stuck threshold).
    pub fn with_monitor(mut self, monitor: Arc<StatusMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Replace the recovery engine (policies, breaker thresholds).
    pub fn with_recovery_engine(mut self, engine: RecoveryEngine) -> Self {
        self.engine = engine;
        self
    }

    /// Replace the output validator (validation rules).
    pub fn with_validator(mut self, validator: OutputValidator) -> Self {
        self.validator = validator;
        self
    }

    /// Replace the authorization policy for destructive undo actions.
    pub fn with_policy(mut self, policy: Arc<dyn ActionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// The graph, reflecting current subtask statuses.
    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    /// The roster, reflecting current assignments and usage.
    pub fn roster(&self) -> &AgentRoster {
        &self.roster
    }

    /// Shared status monitor handle.
    pub fn monitor(&self) -> Arc<StatusMonitor> {
        Arc::clone(&self.monitor)
    }

    /// Shared handoff manager handle.
    pub fn handoffs(&self) -> Arc<HandoffManager> {
        Arc::clone(&self.handoffs)
    }

    /// The failure detector and its history.
    pub fn detector(&self) -> &FailureDetector {
        &self.detector
    }

    /// The recovery engine (breaker states, recovery history).
    pub fn recovery(&self) -> &RecoveryEngine {
        &self.engine
    }

    /// Operator access to the recovery engine (e.g. breaker reset).
    pub fn recovery_mut(&mut self) -> &mut RecoveryEngine {
        &mut self.engine
    }

    /// The execution's undo chain.
    pub fn undo_chain(&self) -> &UndoChain {
        &self.undo_chain
    }

    /// Root cancellation token; cancelling it interrupts the execution.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the execution to completion.
    ///
    /// Returns when every subtask is decided (completed or failed), when
    /// the first failure aborts a `continue_on_error = false` run, or
    /// when the cancellation token fires. Invariant breakage returns an
    /// error.
    pub async fn run(
        &mut self,
        executor: Arc<dyn Executor>,
    ) -> Result<ExecutionReport, SchedulerError> {
        if !self.graph.is_frozen() {
            return Err(SchedulerError::GraphNotFrozen);
        }

        let max_concurrent = self.config.max_concurrent.unwrap_or(self.roster.len()).max(1);
        let (tx, mut rx) = mpsc::channel::<ExecutionDone>(max_concurrent * 2);

        let run_started = Instant::now();
        let cancel = self.cancel.clone();
        let mut books = Bookkeeping {
            metrics: SchedulerMetrics {
                total_tasks: self.graph.len(),
                ..SchedulerMetrics::default()
            },
            ..Bookkeeping::default()
        };
        let mut retry_queue: VecDeque<RetryTicket> = VecDeque::new();

        // Register every agent idle with the monitor; idle accrual starts
        // at run start.
        for agent in self.roster.agents() {
            books.idle_since.insert(agent.id.clone(), run_started);
        }
        let agent_ids: Vec<String> = self.roster.agents().map(|a| a.id.clone()).collect();
        for id in &agent_ids {
            self.monitor.update_status(id, AgentStatus::Idle, None);
        }

        tracing::info!(
            total_tasks = self.graph.len(),
            agents = self.roster.len(),
            max_concurrent,
            continue_on_error = self.config.continue_on_error,
            "starting execution"
        );

        loop {
            // 1. Termination: every subtask decided.
            if books.decided() >= self.graph.len() {
                break;
            }

            // 2. External cancellation.
            if cancel.is_cancelled() {
                tracing::info!("execution interrupted, draining in-flight work");
                self.drain_on_abort(&mut rx, &mut books).await?;
                return Ok(self.build_report(books, ExecutionOutcome::Interrupted, run_started));
            }

            let mut dispatched_any = false;

            // 3. Dispatch granted retries whose bound agent is free.
            let tickets: Vec<RetryTicket> = retry_queue.drain(..).collect();
            for ticket in tickets {
                if books.running.len() >= max_concurrent {
                    retry_queue.push_back(ticket);
                    continue;
                }
                let agent_free = self
                    .roster
                    .get(&ticket.agent_id)
                    .is_some_and(|a| a.current_task.is_none());
                if !agent_free {
                    retry_queue.push_back(ticket);
                    continue;
                }

                books.awaiting_retry.remove(&ticket.task_id);
                self.dispatch(
                    &ticket.task_id,
                    &ticket.agent_id,
                    ticket.attempt,
                    ticket.delay,
                    &mut books,
                    &tx,
                    &executor,
                )?;
                dispatched_any = true;
            }

            // 4. Ready set: pending, dependencies completed, not already
            // in flight or awaiting a granted retry. Dispatch order is
            // deterministic: priority rank, then lexical id.
            let mut ready: Vec<(u8, String)> = {
                let resolver = DependencyResolver::new(&self.graph)?;
                resolver
                    .ready(&books.completed)
                    .into_iter()
                    .filter(|t| !books.in_progress.contains(&t.id))
                    .filter(|t| !books.awaiting_retry.contains(&t.id))
                    .map(|t| (t.priority.rank(), t.id.clone()))
                    .collect()
            };
            ready.sort_by(|(pa, ia), (pb, ib)| pb.cmp(pa).then(ia.cmp(ib)));

            // 5. Dispatch ready subtasks up to the concurrency cap.
            for (_, task_id) in ready {
                if books.running.len() >= max_concurrent {
                    break;
                }

                let subtask = self.graph.get(&task_id).expect("ready id exists").clone();
                let candidates =
                    self.roster
                        .find_capable(&subtask.required_capabilities, None, true);

                let Some(agent) = candidates.into_iter().next() else {
                    // Distinguish "no capable agent exists" from "capable
                    // agents are all busy": the former fails the subtask,
                    // the latter waits.
                    let any_capable = !self
                        .roster
                        .find_capable(&subtask.required_capabilities, None, false)
                        .is_empty();
                    if any_capable {
                        continue;
                    }

                    let reason = format!(
                        "no capable agent for capabilities {:?}",
                        subtask.required_capabilities
                    );
                    tracing::error!(task_id = %task_id, %reason, "cannot dispatch");
                    if self.config.continue_on_error {
                        books.fail(&mut self.graph, &task_id, None, reason)?;
                        continue;
                    }
                    books.fail(&mut self.graph, &task_id, None, reason)?;
                    self.drain_on_abort(&mut rx, &mut books).await?;
                    return Ok(self.build_report(
                        books,
                        ExecutionOutcome::Aborted {
                            first_failure: task_id,
                        },
                        run_started,
                    ));
                };

                self.dispatch(
                    &task_id,
                    &agent.id,
                    0,
                    Duration::ZERO,
                    &mut books,
                    &tx,
                    &executor,
                )?;
                dispatched_any = true;
            }

            // 6. No running work: either skip descendants of failures or
            // the loop cannot make progress.
            if books.running.is_empty() {
                debug_assert!(!dispatched_any, "dispatch always spawns a worker");
                if books.decided() >= self.graph.len() {
                    continue;
                }

                let failed_ids: BTreeSet<String> = books.failed.keys().cloned().collect();
                let skippable = self.graph.skippable(&failed_ids);
                if skippable.is_empty() {
                    return Err(SchedulerError::InvariantViolation(format!(
                        "no runnable work but {} of {} subtasks undecided",
                        self.graph.len() - books.decided(),
                        self.graph.len()
                    )));
                }
                for task_id in skippable {
                    tracing::warn!(task_id = %task_id, "skipping: dependency failed");
                    books.skip(&mut self.graph, &task_id)?;
                }
                continue;
            }

            // 7. Wait for at least one worker to finish (first-completed
            // semantics), or for cancellation.
            tokio::select! {
                done = rx.recv() => {
                    let done = done.expect("scheduler holds a live sender");
                    if let Some(report) =
                        self.handle_finisher(done, &mut books, &mut retry_queue, &mut rx, run_started).await?
                    {
                        return Ok(report);
                    }
                }
                _ = cancel.cancelled() => {
                    // Handled at the top of the next iteration.
                    continue;
                }
            }
        }

        let outcome = if books.failed.is_empty() {
            ExecutionOutcome::Completed
        } else {
            ExecutionOutcome::Failed {
                failed_tasks: books.failed.keys().cloned().collect(),
            }
        };
        Ok(self.build_report(books, outcome, run_started))
    }

    /// Spawn one attempt of a subtask on an agent.
    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        &mut self,
        task_id: &str,
        agent_id: &str,
        attempt: u32,
        delay: Duration,
        books: &mut Bookkeeping,
        tx: &mpsc::Sender<ExecutionDone>,
        executor: &Arc<dyn Executor>,
    ) -> Result<(), SchedulerError> {
        let subtask = self
            .graph
            .get(task_id)
            .ok_or_else(|| GraphError::UnknownSubtask(task_id.to_owned()))?
            .clone();
        let agent = self
            .roster
            .get(agent_id)
            .ok_or_else(|| RosterError::UnknownAgent(agent_id.to_owned()))?
            .clone();

        // Removing the id from the ready pool before spawning enforces
        // that no subtask runs twice concurrently.
        self.roster.assign(agent_id, task_id)?;
        self.graph.set_status(task_id, TaskStatus::InProgress)?;
        self.graph
            .set_assigned_agent(task_id, Some(agent_id.to_owned()))?;
        books.in_progress.insert(task_id.to_owned());
        books.end_idle(agent_id);
        self.monitor
            .update_status(agent_id, AgentStatus::Working, Some(task_id));

        let token = self.cancel.child_token();
        books.running.insert(
            task_id.to_owned(),
            RunningTask {
                agent_id: agent_id.to_owned(),
                token: token.clone(),
            },
        );
        books.metrics.max_concurrent_observed =
            books.metrics.max_concurrent_observed.max(books.running.len());

        tracing::info!(
            task_id = %task_id,
            agent_id = %agent_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "dispatching subtask"
        );

        let ctx = ExecutionContext::new(
            attempt,
            token.clone(),
            agent_id.to_owned(),
            Arc::clone(&self.policy),
            Arc::clone(&self.monitor),
            Arc::clone(&self.handoffs),
        );
        spawn_worker(
            Arc::clone(executor),
            subtask,
            agent,
            ctx,
            delay,
            self.config.task_timeout,
            tx.clone(),
        );

        Ok(())
    }

    /// Process a finished attempt. Returns a report when the run must
    /// abort (`continue_on_error = false` failure).
    async fn handle_finisher(
        &mut self,
        done: ExecutionDone,
        books: &mut Bookkeeping,
        retry_queue: &mut VecDeque<RetryTicket>,
        rx: &mut mpsc::Receiver<ExecutionDone>,
        run_started: Instant,
    ) -> Result<Option<ExecutionReport>, SchedulerError> {
        self.settle_attempt(&done, books)?;

        // Cancelled outcomes record without re-triggering recovery.
        if matches!(done.outcome, AttemptOutcome::Cancelled) {
            self.graph.set_status(&done.task_id, TaskStatus::Cancelled)?;
            books.cancelled.insert(done.task_id.clone());
            tracing::info!(task_id = %done.task_id, "subtask cancelled");
            return Ok(None);
        }

        let error = classify_outcome(
            &mut self.detector,
            &mut self.validator,
            &self.config,
            &done,
        );

        let Some(error) = error else {
            // Success.
            self.engine.record_success(&done.agent_id, &done.task_id);
            self.graph.set_status(&done.task_id, TaskStatus::Completed)?;
            books.completed.insert(done.task_id.clone());
            books.metrics.completed_tasks += 1;
            tracing::info!(
                task_id = %done.task_id,
                agent_id = %done.agent_id,
                attempt = done.attempt,
                "subtask completed"
            );
            return Ok(None);
        };

        // Failure.
        self.engine.record_failure(&done.agent_id, &done.task_id);

        if books.rollback_trigger.is_none() && self.undo_chain.should_auto_rollback(&error) {
            tracing::warn!(
                task_id = %done.task_id,
                kind = %error.kind,
                severity = %error.severity,
                "auto-rollback triggered; emitting rollback plan"
            );
            books.rollback_trigger = Some(error.clone());
        }

        if !self.config.continue_on_error {
            books.fail(
                &mut self.graph,
                &done.task_id,
                Some(error.kind),
                error.message.clone(),
            )?;
            tracing::warn!(
                task_id = %done.task_id,
                "failure with continue_on_error disabled, aborting execution"
            );
            self.drain_on_abort(rx, books).await?;
            return Ok(Some(self.build_report(
                std::mem::take(books),
                ExecutionOutcome::Aborted {
                    first_failure: done.task_id,
                },
                run_started,
            )));
        }

        // Recovery.
        let subtask = self
            .graph
            .get(&done.task_id)
            .expect("finished id exists")
            .clone();
        let situation = RecoverySituation {
            candidates: self.roster.find_capable(
                &subtask.required_capabilities,
                Some(&done.agent_id),
                false,
            ),
            required_capabilities: subtask.required_capabilities.clone(),
            completed: books.completed.iter().cloned().collect(),
            failed: books.failed.keys().cloned().collect(),
            pending: self
                .graph
                .ids()
                .filter(|id| {
                    !books.completed.contains(*id) && !books.failed.contains_key(*id)
                })
                .map(ToOwned::to_owned)
                .collect(),
        };

        let strategy = self.engine.select_strategy(&error);
        let result = self.engine.apply(&error, Some(strategy), &situation);

        match strategy {
            RecoveryStrategy::Retry if result.should_retry => {
                self.graph.set_status(&done.task_id, TaskStatus::Pending)?;
                books.awaiting_retry.insert(done.task_id.clone());
                retry_queue.push_back(RetryTicket {
                    task_id: done.task_id.clone(),
                    agent_id: done.agent_id.clone(),
                    attempt: done.attempt + 1,
                    delay: result.delay.unwrap_or_default(),
                });
                tracing::info!(
                    task_id = %done.task_id,
                    retry_count = result.retry_count,
                    delay_ms = result.delay.unwrap_or_default().as_millis() as u64,
                    "retrying after backoff"
                );
            }
            RecoveryStrategy::FallbackAgent
                if result.success
                    && done.attempt + 1 < self.engine.retry_policy().max_attempts.max(1) =>
            {
                let fallback = result
                    .fallback_agent_id
                    .clone()
                    .expect("successful fallback names an agent");
                self.graph.set_status(&done.task_id, TaskStatus::Pending)?;
                books.awaiting_retry.insert(done.task_id.clone());
                retry_queue.push_back(RetryTicket {
                    task_id: done.task_id.clone(),
                    agent_id: fallback.clone(),
                    attempt: done.attempt + 1,
                    delay: Duration::ZERO,
                });
                tracing::info!(
                    task_id = %done.task_id,
                    from = %done.agent_id,
                    to = %fallback,
                    "reassigning to fallback agent"
                );
            }
            RecoveryStrategy::Degrade if result.success => {
                let partial = result
                    .partial_result
                    .clone()
                    .expect("degradation produces a partial result");
                tracing::info!(
                    task_id = %done.task_id,
                    completion = partial.completion_percentage,
                    "accepted partial result"
                );
                books.partial_results.push(partial);
                self.graph.set_status(&done.task_id, TaskStatus::Completed)?;
                books.completed.insert(done.task_id.clone());
                books.metrics.completed_tasks += 1;
            }
            _ => {
                if result.circuit_blocked {
                    tracing::warn!(
                        task_id = %done.task_id,
                        agent_id = %done.agent_id,
                        "retry blocked by open circuit breaker"
                    );
                }
                books.fail(
                    &mut self.graph,
                    &done.task_id,
                    Some(error.kind),
                    error.message.clone(),
                )?;
            }
        }

        Ok(None)
    }

    /// Common bookkeeping for every finished attempt: release the agent,
    /// mark it idle, accrue usage, record duration and undo actions.
    fn settle_attempt(
        &mut self,
        done: &ExecutionDone,
        books: &mut Bookkeeping,
    ) -> Result<(), SchedulerError> {
        books.running.remove(&done.task_id);
        books.in_progress.remove(&done.task_id);

        self.roster.release(&done.agent_id, &done.task_id)?;
        self.roster.record_usage(
            &done.agent_id,
            done.usage.tokens,
            done.usage.api_calls,
            done.usage.memory_mb,
        )?;
        self.monitor
            .update_status(&done.agent_id, AgentStatus::Idle, None);
        books.begin_idle(&done.agent_id);

        books.metrics.task_durations.insert(
            done.task_id.clone(),
            done.started.elapsed().as_secs_f64(),
        );

        // Undo actions are recorded for every outcome: a failed attempt's
        // side effects are exactly what a rollback must cover.
        for action in &done.undo_actions {
            self.undo_chain.record(action.clone());
        }

        Ok(())
    }

    /// Cancel all running work and drain final outcomes with a grace
    /// deadline. Late outcomes are recorded but never re-processed:
    /// completed work counts, everything else reports as cancelled.
    async fn drain_on_abort(
        &mut self,
        rx: &mut mpsc::Receiver<ExecutionDone>,
        books: &mut Bookkeeping,
    ) -> Result<(), SchedulerError> {
        for running in books.running.values() {
            running.token.cancel();
        }

        let deadline = tokio::time::Instant::now() + DRAIN_GRACE;
        while !books.running.is_empty() {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(done)) => {
                    self.settle_attempt(&done, books)?;
                    match &done.outcome {
                        AttemptOutcome::Finished(outcome)
                            if outcome.status == TaskStatus::Completed
                                && outcome.error.is_none() =>
                        {
                            // Already finalizing when cancelled; the work
                            // is real.
                            self.graph.set_status(&done.task_id, TaskStatus::Completed)?;
                            books.completed.insert(done.task_id.clone());
                            books.metrics.completed_tasks += 1;
                        }
                        _ => {
                            self.graph.set_status(&done.task_id, TaskStatus::Cancelled)?;
                            books.cancelled.insert(done.task_id.clone());
                        }
                    }
                }
                _ => break,
            }
        }

        // Workers that never delivered within the grace period.
        let leftovers: Vec<(String, RunningTask)> = books.running.drain().collect();
        for (task_id, running) in leftovers {
            tracing::warn!(task_id = %task_id, "worker did not stop within drain grace");
            let _ = self.roster.release(&running.agent_id, &task_id);
            self.monitor
                .update_status(&running.agent_id, AgentStatus::Idle, None);
            books.begin_idle(&running.agent_id);
            books.in_progress.remove(&task_id);
            self.graph.set_status(&task_id, TaskStatus::Cancelled)?;
            books.cancelled.insert(task_id);
        }

        // Granted retries that never re-dispatched are cancelled too.
        let awaiting: Vec<String> = books.awaiting_retry.iter().cloned().collect();
        for task_id in awaiting {
            books.awaiting_retry.remove(&task_id);
            self.graph.set_status(&task_id, TaskStatus::Cancelled)?;
            books.cancelled.insert(task_id);
        }

        Ok(())
    }

    fn build_report(
        &mut self,
        mut books: Bookkeeping,
        outcome: ExecutionOutcome,
        run_started: Instant,
    ) -> ExecutionReport {
        // Close out every open idle window.
        for (_, since) in books.idle_since.drain() {
            books.total_idle += since.elapsed();
        }
        books.metrics.total_idle_seconds = books.total_idle.as_secs_f64();
        books.metrics.total_wall_seconds = run_started.elapsed().as_secs_f64();

        let rollback_plan = books
            .rollback_trigger
            .as_ref()
            .map(|err| self.undo_chain.format_rollback_plan(Some(err)));

        tracing::info!(
            outcome = ?outcome,
            completed = books.completed.len(),
            failed = books.failed.len(),
            cancelled = books.cancelled.len(),
            wall_seconds = books.metrics.total_wall_seconds,
            "execution finished"
        );

        ExecutionReport {
            outcome,
            completed: books.completed.into_iter().collect(),
            failed: books.failed.into_values().collect(),
            cancelled: books.cancelled.into_iter().collect(),
            partial_results: books.partial_results,
            rollback_plan,
            metrics: books.metrics,
        }
    }
}

// ---------------------------------------------------------------------------
// Worker + classification
// ---------------------------------------------------------------------------

/// Spawn the worker task for one attempt.
///
/// The worker sleeps out any backoff delay, runs the executor under the
/// optional deadline, and reports the outcome together with drained undo
/// actions and usage. Cancellation is observed at the delay and at the
/// execution await point.
fn spawn_worker(
    executor: Arc<dyn Executor>,
    subtask: Subtask,
    agent: Agent,
    ctx: ExecutionContext,
    delay: Duration,
    timeout: Option<Duration>,
    tx: mpsc::Sender<ExecutionDone>,
) {
    tokio::spawn(async move {
        let token = ctx.cancel.clone();

        if !delay.is_zero() {
            tokio::select! {
                _ = token.cancelled() => {
                    let _ = tx
                        .send(ExecutionDone {
                            task_id: subtask.id.clone(),
                            agent_id: agent.id.clone(),
                            attempt: ctx.attempt,
                            started: Instant::now(),
                            outcome: AttemptOutcome::Cancelled,
                            undo_actions: ctx.drain_undo(),
                            usage: ctx.take_usage(),
                        })
                        .await;
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let started = Instant::now();
        let attempt = executor.execute(&subtask, &agent, &ctx);

        let outcome = tokio::select! {
            _ = token.cancelled() => AttemptOutcome::Cancelled,
            result = async {
                match timeout {
                    Some(deadline) => match tokio::time::timeout(deadline, attempt).await {
                        Ok(Ok(outcome)) => AttemptOutcome::Finished(outcome),
                        Ok(Err(error)) => AttemptOutcome::Crashed(error),
                        Err(_elapsed) => AttemptOutcome::TimedOut {
                            elapsed: started.elapsed(),
                        },
                    },
                    None => match attempt.await {
                        Ok(outcome) => AttemptOutcome::Finished(outcome),
                        Err(error) => AttemptOutcome::Crashed(error),
                    },
                }
            } => result,
        };

        let _ = tx
            .send(ExecutionDone {
                task_id: subtask.id.clone(),
                agent_id: agent.id.clone(),
                attempt: ctx.attempt,
                started,
                outcome,
                undo_actions: ctx.drain_undo(),
                usage: ctx.take_usage(),
            })
            .await;
    });
}

/// Classify a non-cancelled attempt outcome. `None` means success.
fn classify_outcome(
    detector: &mut FailureDetector,
    validator: &mut OutputValidator,
    config: &SchedulerConfig,
    done: &ExecutionDone,
) -> Option<ErrorContext> {
    match &done.outcome {
        AttemptOutcome::Crashed(error) => {
            Some(detector.detect_crash(error, &done.agent_id, &done.task_id))
        }
        AttemptOutcome::TimedOut { elapsed } => Some(detector.detect_timeout(
            *elapsed,
            config.task_timeout.unwrap_or(*elapsed),
            &done.agent_id,
            &done.task_id,
        )),
        AttemptOutcome::Cancelled => None,
        AttemptOutcome::Finished(outcome) => {
            // An executor that declares failure without raising is
            // classified like a crash.
            if outcome.status == TaskStatus::Failed || outcome.error.is_some() {
                let error = anyhow::anyhow!(
                    "{}",
                    outcome
                        .error
                        .clone()
                        .unwrap_or_else(|| "executor reported failure".to_owned())
                );
                return Some(detector.detect_crash(&error, &done.agent_id, &done.task_id));
            }

            if let Some(schema) = &config.output_schema {
                if let Some(context) = detector.detect_invalid_output(
                    &outcome.result_data,
                    schema,
                    &done.agent_id,
                    &done.task_id,
                ) {
                    return Some(context);
                }
            }

            if let Some(context) =
                validator.validate(&outcome.result_data, &done.agent_id, &done.task_id)
            {
                // Mirror validation failures into the detector history so
                // the run's error record is complete in one place.
                detector.record(context.clone());
                return Some(context);
            }

            // Executors report partial work via item lists in the result
            // payload.
            let completed_items = string_array(&outcome.result_data, "completed_items");
            let required_items = string_array(&outcome.result_data, "required_items");
            if let (Some(completed), Some(required)) = (completed_items, required_items) {
                if let Some(context) = detector.detect_partial_completion(
                    &completed,
                    &required,
                    &done.agent_id,
                    &done.task_id,
                ) {
                    return Some(context);
                }
            }

            None
        }
    }
}

fn string_array(value: &serde_json::Value, key: &str) -> Option<Vec<String>> {
    value.get(key)?.as_array().map(|items| {
        items
            .iter()
            .filter_map(|v| v.as_str().map(ToOwned::to_owned))
            .collect()
    })
}
