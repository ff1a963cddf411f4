//! Agent status monitoring: states, resource counters, stuck detection.
//!
//! All operations serialize on a single internal lock, and every value
//! handed back to a caller is a by-value snapshot, so callers can never
//! observe a torn read or hold live shared state. Stuck detection runs on
//! a monotonic progress clock.

pub mod progress;

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use foreman_models::{AgentStatus, ResourceMetrics};

/// Default no-progress window before an agent counts as stuck.
const DEFAULT_STUCK_THRESHOLD: Duration = Duration::from_secs(120);

/// Default bound on retained snapshots per agent.
const DEFAULT_MAX_HISTORY: usize = 100;

/// Monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// No-progress window before a working/blocked agent is stuck.
    pub stuck_threshold: Duration,
    /// Maximum history snapshots retained per agent; oldest evicted.
    pub max_history_per_agent: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            stuck_threshold: DEFAULT_STUCK_THRESHOLD,
            max_history_per_agent: DEFAULT_MAX_HISTORY,
        }
    }
}

/// Point-in-time, immutable copy of an agent's status and metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatusSnapshot {
    pub agent_id: String,
    pub status: AgentStatus,
    pub current_task: Option<String>,
    pub last_update: DateTime<Utc>,
    pub resources: ResourceMetrics,
}

/// A stuck-agent report from [`StatusMonitor::detect_stuck`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StuckAgent {
    pub agent_id: String,
    pub status: AgentStatus,
    pub current_task: Option<String>,
    /// Seconds since the agent last reported progress.
    pub seconds_stuck: f64,
}

/// Live tracking state for one agent. Internal only; callers see
/// [`AgentStatusSnapshot`] copies.
#[derive(Debug)]
struct AgentRecord {
    status: AgentStatus,
    current_task: Option<String>,
    last_update: DateTime<Utc>,
    metrics: ResourceMetrics,
    /// When the current state began; elapsed time accrues on state change.
    state_started: Instant,
    /// Monotonic progress clock for stuck detection.
    last_progress: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    records: BTreeMap<String, AgentRecord>,
    history: BTreeMap<String, VecDeque<AgentStatusSnapshot>>,
}

/// Concurrent-safe monitor of agent states and resource consumption.
#[derive(Debug)]
pub struct StatusMonitor {
    config: MonitorConfig,
    inner: Mutex<Inner>,
}

impl Default for StatusMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

impl StatusMonitor {
    /// Create a monitor with the given configuration.
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Convenience constructor overriding only the stuck threshold.
    pub fn with_stuck_threshold(threshold: Duration) -> Self {
        Self::new(MonitorConfig {
            stuck_threshold: threshold,
            ..MonitorConfig::default()
        })
    }

    /// Set an agent's status.
    ///
    /// Accrues time-in-previous-state onto the agent's `time_seconds`,
    /// stamps `last_update`, and records a snapshot into the bounded
    /// history. First sight of an agent initializes its progress clock.
    pub fn update_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
        current_task: Option<&str>,
    ) {
        let mut inner = self.inner.lock().expect("monitor lock poisoned");
        let now = Instant::now();

        let record = match inner.records.get_mut(agent_id) {
            Some(record) => {
                let elapsed = now.duration_since(record.state_started);
                record.metrics.time_seconds += elapsed.as_secs_f64();
                record.status = status;
                record.current_task = current_task.map(ToOwned::to_owned);
                record.last_update = Utc::now();
                record.state_started = now;
                record
            }
            None => {
                inner.records.insert(
                    agent_id.to_owned(),
                    AgentRecord {
                        status,
                        current_task: current_task.map(ToOwned::to_owned),
                        last_update: Utc::now(),
                        metrics: ResourceMetrics::default(),
                        state_started: now,
                        last_progress: now,
                    },
                );
                inner.records.get_mut(agent_id).expect("just inserted")
            }
        };

        let snapshot = AgentStatusSnapshot {
            agent_id: agent_id.to_owned(),
            status: record.status,
            current_task: record.current_task.clone(),
            last_update: record.last_update,
            resources: record.metrics,
        };

        let history = inner.history.entry(agent_id.to_owned()).or_default();
        history.push_back(snapshot);
        while history.len() > self.config.max_history_per_agent {
            history.pop_front();
        }
    }

    /// Accrue resource consumption onto an agent's counters. Creates an
    /// idle record if the agent is not yet tracked.
    pub fn record_resource_usage(
        &self,
        agent_id: &str,
        tokens: u64,
        api_calls: u64,
        memory_mb: f64,
    ) {
        {
            let inner = self.inner.lock().expect("monitor lock poisoned");
            if !inner.records.contains_key(agent_id) {
                drop(inner);
                self.update_status(agent_id, AgentStatus::Idle, None);
            }
        }

        let mut inner = self.inner.lock().expect("monitor lock poisoned");
        if let Some(record) = inner.records.get_mut(agent_id) {
            record.metrics.accrue(tokens, api_calls, memory_mb);
        }
    }

    /// Reset an agent's stuck-detection clock. No-op for unknown agents.
    pub fn record_progress(&self, agent_id: &str) {
        let mut inner = self.inner.lock().expect("monitor lock poisoned");
        if let Some(record) = inner.records.get_mut(agent_id) {
            record.last_progress = Instant::now();
        }
    }

    /// Current snapshot for an agent, or `None` if not tracked.
    ///
    /// The snapshot's `time_seconds` includes the uncommitted time since
    /// the last state change (computed on the read path).
    pub fn get_status(&self, agent_id: &str) -> Option<AgentStatusSnapshot> {
        let inner = self.inner.lock().expect("monitor lock poisoned");
        inner.records.get(agent_id).map(|record| {
            let mut resources = record.metrics;
            resources.time_seconds += record.state_started.elapsed().as_secs_f64();
            AgentStatusSnapshot {
                agent_id: agent_id.to_owned(),
                status: record.status,
                current_task: record.current_task.clone(),
                last_update: record.last_update,
                resources,
            }
        })
    }

    /// Snapshots for every tracked agent, ordered by agent id.
    pub fn all_statuses(&self) -> Vec<AgentStatusSnapshot> {
        let ids: Vec<String> = {
            let inner = self.inner.lock().expect("monitor lock poisoned");
            inner.records.keys().cloned().collect()
        };
        ids.iter().filter_map(|id| self.get_status(id)).collect()
    }

    /// Snapshots of agents currently in the given status.
    pub fn agents_with_status(&self, status: AgentStatus) -> Vec<AgentStatusSnapshot> {
        self.all_statuses()
            .into_iter()
            .filter(|s| s.status == status)
            .collect()
    }

    /// Agents in `working` or `blocked` state with no progress for at
    /// least the stuck threshold. Idle/completed/failed agents are never
    /// stuck.
    pub fn detect_stuck(&self) -> Vec<StuckAgent> {
        let inner = self.inner.lock().expect("monitor lock poisoned");
        let mut stuck = Vec::new();

        for (agent_id, record) in &inner.records {
            if !matches!(record.status, AgentStatus::Working | AgentStatus::Blocked) {
                continue;
            }

            let since_progress = record.last_progress.elapsed();
            if since_progress >= self.config.stuck_threshold {
                tracing::warn!(
                    agent_id = %agent_id,
                    seconds_stuck = since_progress.as_secs_f64(),
                    "agent appears stuck"
                );
                stuck.push(StuckAgent {
                    agent_id: agent_id.clone(),
                    status: record.status,
                    current_task: record.current_task.clone(),
                    seconds_stuck: since_progress.as_secs_f64(),
                });
            }
        }

        stuck
    }

    /// History snapshots for an agent, oldest first.
    pub fn history(&self, agent_id: &str) -> Vec<AgentStatusSnapshot> {
        let inner = self.inner.lock().expect("monitor lock poisoned");
        inner
            .history
            .get(agent_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Stop tracking an agent entirely.
    pub fn remove_agent(&self, agent_id: &str) {
        let mut inner = self.inner.lock().expect("monitor lock poisoned");
        inner.records.remove(agent_id);
        inner.history.remove(agent_id);
    }
}
