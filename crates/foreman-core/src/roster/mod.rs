//! Agent roster: the registry of available agents and their assignments.
//!
//! The roster owns agent lifetimes. Assignment is a roster-mediated
//! operation: every `assign` must be paired with a `release`, and
//! double-assignment is an invariant violation surfaced as a typed error.
//! All mutation is scheduler-issued.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use foreman_models::{Agent, AgentStatus};

/// Errors from roster operations.
#[derive(Debug, Error)]
pub enum RosterError {
    #[error("unknown agent id: {0:?}")]
    UnknownAgent(String),

    #[error("agent {agent:?} is already assigned subtask {task:?}")]
    AlreadyAssigned { agent: String, task: String },

    #[error("agent {agent:?} is not assigned subtask {task:?}")]
    NotAssigned { agent: String, task: String },
}

/// The roster of agents, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct AgentRoster {
    agents: BTreeMap<String, Agent>,
}

impl AgentRoster {
    /// Create an empty roster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a roster from a list of agents.
    pub fn from_agents(agents: Vec<Agent>) -> Self {
        let mut roster = Self::new();
        for agent in agents {
            roster.register(agent);
        }
        roster
    }

    /// Register an agent. If an agent with the same id already exists it
    /// is replaced and the old one is returned.
    pub fn register(&mut self, agent: Agent) -> Option<Agent> {
        self.agents.insert(agent.id.clone(), agent)
    }

    /// Look up an agent by id.
    pub fn get(&self, id: &str) -> Option<&Agent> {
        self.agents.get(id)
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Whether the roster is empty.
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// All agents, ordered by id.
    pub fn agents(&self) -> impl Iterator<Item = &Agent> {
        self.agents.values()
    }

    /// Number of subtasks currently assigned to an agent (0 for unknown).
    pub fn assignment_count(&self, id: &str) -> usize {
        self.agents.get(id).map_or(0, |a| a.assigned_tasks.len())
    }

    /// Find agents capable of the required capabilities, best first.
    ///
    /// An agent qualifies when it shares at least one required capability
    /// (or when nothing is required). Candidates are scored by capability
    /// overlap (higher wins), then current assignment count (lower wins),
    /// then cumulative tokens (lower wins), then id for determinism.
    /// Returns cloned snapshots; an empty vec when nothing matches.
    pub fn find_capable(
        &self,
        required: &BTreeSet<String>,
        exclude_agent: Option<&str>,
        exclude_busy: bool,
    ) -> Vec<Agent> {
        let mut candidates: Vec<(&Agent, usize)> = self
            .agents
            .values()
            .filter(|a| Some(a.id.as_str()) != exclude_agent)
            .filter(|a| !exclude_busy || a.current_task.is_none())
            .filter_map(|a| {
                let score = if required.is_empty() {
                    1
                } else {
                    a.capability_overlap(required)
                };
                (score > 0).then_some((a, score))
            })
            .collect();

        candidates.sort_by(|(a, sa), (b, sb)| {
            sb.cmp(sa)
                .then(a.assigned_tasks.len().cmp(&b.assigned_tasks.len()))
                .then(a.resource_metrics.tokens.cmp(&b.resource_metrics.tokens))
                .then(a.id.cmp(&b.id))
        });

        candidates.into_iter().map(|(a, _)| a.clone()).collect()
    }

    /// Assign a subtask to an agent: append to its task list, set it
    /// working. Assigning the same subtask twice is an invariant violation.
    pub fn assign(&mut self, agent_id: &str, task_id: &str) -> Result<(), RosterError> {
        let agent = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| RosterError::UnknownAgent(agent_id.to_owned()))?;

        if agent.assigned_tasks.iter().any(|t| t == task_id) {
            return Err(RosterError::AlreadyAssigned {
                agent: agent_id.to_owned(),
                task: task_id.to_owned(),
            });
        }

        agent.assigned_tasks.push(task_id.to_owned());
        agent.current_task = Some(task_id.to_owned());
        agent.status = AgentStatus::Working;

        tracing::debug!(agent_id = %agent_id, task_id = %task_id, "assigned subtask");
        Ok(())
    }

    /// Release a subtask from an agent on completion or failure. Pairs
    /// with [`assign`](Self::assign).
    pub fn release(&mut self, agent_id: &str, task_id: &str) -> Result<(), RosterError> {
        let agent = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| RosterError::UnknownAgent(agent_id.to_owned()))?;

        let Some(pos) = agent.assigned_tasks.iter().position(|t| t == task_id) else {
            return Err(RosterError::NotAssigned {
                agent: agent_id.to_owned(),
                task: task_id.to_owned(),
            });
        };

        agent.assigned_tasks.remove(pos);
        if agent.current_task.as_deref() == Some(task_id) {
            agent.current_task = None;
        }
        if agent.current_task.is_none() {
            agent.status = AgentStatus::Idle;
        }

        tracing::debug!(agent_id = %agent_id, task_id = %task_id, "released subtask");
        Ok(())
    }

    /// Accrue resource usage onto an agent's cumulative counters.
    pub fn record_usage(
        &mut self,
        agent_id: &str,
        tokens: u64,
        api_calls: u64,
        memory_mb: f64,
    ) -> Result<(), RosterError> {
        let agent = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| RosterError::UnknownAgent(agent_id.to_owned()))?;
        agent.resource_metrics.accrue(tokens, api_calls, memory_mb);
        Ok(())
    }
}
