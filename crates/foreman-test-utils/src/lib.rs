//! Shared test utilities for foreman integration tests.
//!
//! Provides scripted executors with per-subtask behaviors plus quick
//! builders for graphs and rosters, so scheduler tests can describe a
//! scenario in a few lines.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use foreman_core::graph::TaskGraph;
use foreman_core::roster::AgentRoster;
use foreman_core::scheduler::{ExecutionContext, Executor};
use foreman_models::{Agent, Subtask, TaskOutcome};

/// Install a fmt subscriber honoring `RUST_LOG` for the current test
/// binary. Safe to call from every test; only the first call wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Build a frozen graph from `(id, dependencies)` pairs.
///
/// Panics on an invalid graph; tests describe valid scenarios.
pub fn graph_of(entries: &[(&str, &[&str])]) -> TaskGraph {
    let subtasks: Vec<Subtask> = entries
        .iter()
        .map(|(id, deps)| {
            Subtask::new(*id, format!("subtask {id}")).depends_on(deps.iter().copied())
        })
        .collect();
    TaskGraph::from_subtasks(subtasks).expect("test graph should be valid")
}

/// Build a roster of `count` interchangeable agents named `agent-0`,
/// `agent-1`, ... all carrying the given capabilities.
pub fn roster_of(count: usize, capabilities: &[&str]) -> AgentRoster {
    let agents: Vec<Agent> = (0..count)
        .map(|i| Agent::new(format!("agent-{i}"), "worker", capabilities.iter().copied()))
        .collect();
    AgentRoster::from_agents(agents)
}

/// Scripted behavior for one subtask.
#[derive(Debug, Clone)]
pub enum Script {
    /// Sleep, then succeed.
    Succeed { delay: Duration },
    /// Return an error (classified as a crash).
    Crash,
    /// Sleep for `duration`; with a shorter scheduler deadline this
    /// manifests as a timeout.
    Busy { duration: Duration },
    /// Be busy for `busy` on the first `times` attempts (timing out
    /// under a shorter deadline), then succeed after `then_delay`.
    TimeoutTimes {
        times: u32,
        busy: Duration,
        then_delay: Duration,
    },
    /// Crash on the first `times` attempts, then succeed.
    CrashTimes { times: u32, then_delay: Duration },
    /// Succeed with declared partial work in the result payload.
    PartialItems {
        completed: Vec<String>,
        required: Vec<String>,
    },
    /// Produce an output missing the `summary` field when run on one of
    /// the listed agents; a valid output otherwise. For schema-driven
    /// fallback scenarios.
    InvalidOutputFrom { agents: Vec<String> },
}

/// An [`Executor`] driven by per-subtask scripts, recording invocation
/// order, counts, times, and observed concurrency for assertions.
pub struct ScriptedExecutor {
    scripts: HashMap<String, Script>,
    default: Script,
    starts: Mutex<Vec<String>>,
    invocations: Mutex<HashMap<String, Vec<Instant>>>,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedExecutor {
    /// An executor whose default behavior is immediate success.
    pub fn new() -> Self {
        Self {
            scripts: HashMap::new(),
            default: Script::Succeed {
                delay: Duration::ZERO,
            },
            starts: Mutex::new(Vec::new()),
            invocations: Mutex::new(HashMap::new()),
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Set the behavior for one subtask id.
    pub fn script(mut self, task_id: impl Into<String>, script: Script) -> Self {
        self.scripts.insert(task_id.into(), script);
        self
    }

    /// Set the behavior for every unscripted subtask.
    pub fn default_script(mut self, script: Script) -> Self {
        self.default = script;
        self
    }

    /// Subtask ids in the order their attempts started.
    pub fn start_order(&self) -> Vec<String> {
        self.starts.lock().expect("starts lock poisoned").clone()
    }

    /// Number of attempts made for a subtask.
    pub fn call_count(&self, task_id: &str) -> usize {
        self.invocations
            .lock()
            .expect("invocations lock poisoned")
            .get(task_id)
            .map_or(0, Vec::len)
    }

    /// Start instants of every attempt for a subtask, oldest first.
    pub fn invocation_times(&self, task_id: &str) -> Vec<Instant> {
        self.invocations
            .lock()
            .expect("invocations lock poisoned")
            .get(task_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Highest number of concurrently executing attempts observed.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn note_start(&self, task_id: &str) -> ConcurrencyGuard<'_> {
        self.starts
            .lock()
            .expect("starts lock poisoned")
            .push(task_id.to_owned());
        self.invocations
            .lock()
            .expect("invocations lock poisoned")
            .entry(task_id.to_owned())
            .or_default()
            .push(Instant::now());

        let current = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        ConcurrencyGuard { executor: self }
    }
}

/// Decrements the live-attempt counter even when an attempt future is
/// dropped mid-await (cancellation, deadline expiry).
struct ConcurrencyGuard<'a> {
    executor: &'a ScriptedExecutor,
}

impl Drop for ConcurrencyGuard<'_> {
    fn drop(&mut self) {
        self.executor.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn execute(
        &self,
        subtask: &Subtask,
        agent: &Agent,
        ctx: &ExecutionContext,
    ) -> Result<TaskOutcome> {
        let _guard = self.note_start(&subtask.id);
        let script = self
            .scripts
            .get(&subtask.id)
            .unwrap_or(&self.default)
            .clone();

        let result = match script {
            Script::Succeed { delay } => {
                tokio::time::sleep(delay).await;
                Ok(TaskOutcome::success(
                    &subtask.id,
                    &agent.id,
                    json!({"agent": agent.id}),
                ))
            }
            Script::Crash => Err(anyhow::anyhow!("scripted crash for {}", subtask.id)),
            Script::Busy { duration } => {
                tokio::time::sleep(duration).await;
                Ok(TaskOutcome::success(&subtask.id, &agent.id, json!({})))
            }
            Script::TimeoutTimes {
                times,
                busy,
                then_delay,
            } => {
                if ctx.attempt < times {
                    tokio::time::sleep(busy).await;
                } else {
                    tokio::time::sleep(then_delay).await;
                }
                Ok(TaskOutcome::success(&subtask.id, &agent.id, json!({})))
            }
            Script::CrashTimes { times, then_delay } => {
                if ctx.attempt < times {
                    Err(anyhow::anyhow!(
                        "scripted crash for {} (attempt {})",
                        subtask.id,
                        ctx.attempt
                    ))
                } else {
                    tokio::time::sleep(then_delay).await;
                    Ok(TaskOutcome::success(&subtask.id, &agent.id, json!({})))
                }
            }
            Script::PartialItems {
                completed,
                required,
            } => Ok(TaskOutcome::success(
                &subtask.id,
                &agent.id,
                json!({"completed_items": completed, "required_items": required}),
            )),
            Script::InvalidOutputFrom { agents } => {
                let data = if agents.contains(&agent.id) {
                    json!({})
                } else {
                    json!({"summary": format!("summary from {}", agent.id)})
                };
                Ok(TaskOutcome::success(&subtask.id, &agent.id, data))
            }
        };

        result
    }
}
