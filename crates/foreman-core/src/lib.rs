//! Foreman core: the scheduling and coordination kernel.
//!
//! The kernel takes a frozen [`graph::TaskGraph`], dispatches ready
//! subtasks to capable agents from the [`roster::AgentRoster`] under a
//! concurrency cap, tracks agent health in the [`monitor::StatusMonitor`],
//! records reversible actions into an [`undo::UndoChain`], classifies
//! failures with the [`detect::FailureDetector`], and applies recovery
//! (retry with backoff, circuit breakers, fallback agents, graceful
//! degradation) through the [`recovery::RecoveryEngine`]. The
//! [`scheduler::ParallelScheduler`] is the top-level driver tying these
//! together.

pub mod detect;
pub mod estimate;
pub mod graph;
pub mod monitor;
pub mod planner;
pub mod recovery;
pub mod roster;
pub mod scheduler;
pub mod undo;

pub use detect::{ErrorContext, ErrorKind, FailureDetector, Severity};
pub use graph::{GraphError, TaskGraph};
pub use monitor::StatusMonitor;
pub use recovery::{RecoveryEngine, RecoveryStrategy, RetryPolicy};
pub use roster::AgentRoster;
pub use scheduler::{
    ExecutionContext, ExecutionOutcome, ExecutionReport, Executor, ParallelScheduler,
    SchedulerConfig,
};
pub use undo::{RiskLevel, UndoAction, UndoChain};
