//! Task handoff synchronization between agents.
//!
//! A handoff transfers state from one agent to another mid-execution.
//! Receipt requires the designated recipient, and unreceived handoffs
//! expire after a timeout measured on a monotonic clock.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Default expiry for unreceived handoffs.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Errors from handoff operations.
#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("handoff {0} not found")]
    NotFound(Uuid),

    #[error("agent {agent:?} is not the designated recipient of handoff {handoff}")]
    WrongRecipient { handoff: Uuid, agent: String },

    #[error("handoff {0} has expired")]
    Expired(Uuid),
}

/// A state transfer between two agents for one subtask.
#[derive(Debug, Clone)]
pub struct Handoff {
    pub id: Uuid,
    pub from_agent: String,
    pub to_agent: String,
    pub task_id: String,
    pub data: Value,
    pub created_at: DateTime<Utc>,
    pub received_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    /// Monotonic creation time; expiry is measured against this, never
    /// against wall-clock timestamps.
    created: Instant,
}

/// Manages handoffs between agents with recipient checks and expiry.
#[derive(Debug)]
pub struct HandoffManager {
    timeout: Duration,
    handoffs: Mutex<HashMap<Uuid, Handoff>>,
}

impl Default for HandoffManager {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl HandoffManager {
    /// Create a manager with the given expiry timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            handoffs: Mutex::new(HashMap::new()),
        }
    }

    /// Initiate a handoff from one agent to another. Returns the handoff
    /// id used for receipt and acknowledgement.
    pub fn initiate(
        &self,
        from_agent: impl Into<String>,
        to_agent: impl Into<String>,
        task_id: impl Into<String>,
        data: Value,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let handoff = Handoff {
            id,
            from_agent: from_agent.into(),
            to_agent: to_agent.into(),
            task_id: task_id.into(),
            data,
            created_at: Utc::now(),
            received_at: None,
            acknowledged_at: None,
            created: Instant::now(),
        };

        tracing::debug!(
            handoff_id = %id,
            from = %handoff.from_agent,
            to = %handoff.to_agent,
            task_id = %handoff.task_id,
            "initiated handoff"
        );

        self.handoffs
            .lock()
            .expect("handoff lock poisoned")
            .insert(id, handoff);
        id
    }

    /// Receive a handoff's data. The caller must be the designated
    /// recipient, and the handoff must not have expired.
    pub fn receive(&self, id: Uuid, agent_id: &str) -> Result<Value, HandoffError> {
        let mut handoffs = self.handoffs.lock().expect("handoff lock poisoned");
        let handoff = handoffs.get_mut(&id).ok_or(HandoffError::NotFound(id))?;

        if handoff.to_agent != agent_id {
            return Err(HandoffError::WrongRecipient {
                handoff: id,
                agent: agent_id.to_owned(),
            });
        }

        if handoff.created.elapsed() > self.timeout {
            return Err(HandoffError::Expired(id));
        }

        handoff.received_at = Some(Utc::now());
        Ok(handoff.data.clone())
    }

    /// Acknowledge a received handoff. The caller must be the designated
    /// recipient.
    pub fn acknowledge(&self, id: Uuid, agent_id: &str) -> Result<(), HandoffError> {
        let mut handoffs = self.handoffs.lock().expect("handoff lock poisoned");
        let handoff = handoffs.get_mut(&id).ok_or(HandoffError::NotFound(id))?;

        if handoff.to_agent != agent_id {
            return Err(HandoffError::WrongRecipient {
                handoff: id,
                agent: agent_id.to_owned(),
            });
        }

        handoff.acknowledged_at = Some(Utc::now());
        Ok(())
    }

    /// Whether a handoff has been acknowledged. Unknown ids are not
    /// complete.
    pub fn is_complete(&self, id: Uuid) -> bool {
        self.handoffs
            .lock()
            .expect("handoff lock poisoned")
            .get(&id)
            .is_some_and(|h| h.acknowledged_at.is_some())
    }

    /// Snapshot of a handoff, if it exists.
    pub fn get(&self, id: Uuid) -> Option<Handoff> {
        self.handoffs
            .lock()
            .expect("handoff lock poisoned")
            .get(&id)
            .cloned()
    }
}
