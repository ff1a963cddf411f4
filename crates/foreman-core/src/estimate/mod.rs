//! Token cost estimation for task requests.
//!
//! Heuristic pre-execution estimates from description length, subtask
//! count, task type, and a caller-supplied context size. The context size
//! is one quantified number (characters); the caller decides what it
//! measures.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use foreman_models::{TaskRequest, TaskType};

/// Tokens added per 100 characters of context.
const CONTEXT_OVERHEAD_PER_100_CHARS: u64 = 110;

/// Tokens added per subtask.
const SUBTASK_OVERHEAD: u64 = 500;

/// Complexity bands for estimation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimateBand {
    Simple,
    Medium,
    Complex,
    VeryComplex,
}

impl EstimateBand {
    /// Base token estimate for the band.
    pub fn base_tokens(self) -> u64 {
        match self {
            Self::Simple => 2_000,
            Self::Medium => 8_000,
            Self::Complex => 25_000,
            Self::VeryComplex => 60_000,
        }
    }
}

impl fmt::Display for EstimateBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Simple => "simple",
            Self::Medium => "medium",
            Self::Complex => "complex",
            Self::VeryComplex => "very_complex",
        };
        f.write_str(s)
    }
}

impl FromStr for EstimateBand {
    type Err = EstimateBandParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "simple" => Ok(Self::Simple),
            "medium" => Ok(Self::Medium),
            "complex" => Ok(Self::Complex),
            "very_complex" => Ok(Self::VeryComplex),
            other => Err(EstimateBandParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`EstimateBand`] string.
#[derive(Debug, Clone)]
pub struct EstimateBandParseError(pub String);

impl fmt::Display for EstimateBandParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid estimate band: {:?}", self.0)
    }
}

impl std::error::Error for EstimateBandParseError {}

/// Estimates token costs before execution.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenEstimator;

impl TokenEstimator {
    pub fn new() -> Self {
        Self
    }

    /// Assess a request's complexity band from description length,
    /// subtask count, and task type.
    pub fn assess(&self, request: &TaskRequest, subtask_count: usize) -> EstimateBand {
        let mut score = 0;

        score += match request.goal.len() {
            0..50 => 0,
            50..150 => 1,
            150..300 => 2,
            _ => 3,
        };

        score += match subtask_count {
            0 => 0,
            1..3 => 1,
            3..8 => 2,
            _ => 3,
        };

        if request.task_type == TaskType::Software {
            score += 1;
        }

        match score {
            0..=1 => EstimateBand::Simple,
            2..=3 => EstimateBand::Medium,
            4..=5 => EstimateBand::Complex,
            _ => EstimateBand::VeryComplex,
        }
    }

    /// Estimate tokens for a request.
    ///
    /// `context_size` is the caller-quantified size of the ambient
    /// context in characters.
    pub fn estimate(
        &self,
        request: &TaskRequest,
        subtask_count: usize,
        context_size: usize,
    ) -> u64 {
        let base = self.assess(request, subtask_count).base_tokens();
        let context_overhead = (context_size as u64 / 100) * CONTEXT_OVERHEAD_PER_100_CHARS;
        let subtask_overhead = subtask_count as u64 * SUBTASK_OVERHEAD;
        base + context_overhead + subtask_overhead
    }

    /// Estimate total tokens across a batch of requests, each with its
    /// own subtask count and context size.
    pub fn estimate_batch(&self, batch: &[(TaskRequest, usize, usize)]) -> u64 {
        batch
            .iter()
            .map(|(request, subtasks, context)| self.estimate(request, *subtasks, *context))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(goal: &str, task_type: TaskType) -> TaskRequest {
        TaskRequest::new(goal, task_type)
    }

    #[test]
    fn band_display_roundtrip() {
        let variants = [
            EstimateBand::Simple,
            EstimateBand::Medium,
            EstimateBand::Complex,
            EstimateBand::VeryComplex,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: EstimateBand = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
        assert!("huge".parse::<EstimateBand>().is_err());
    }

    #[test]
    fn short_research_goal_is_simple() {
        let estimator = TokenEstimator::new();
        let band = estimator.assess(&request("Summarize a paper", TaskType::Research), 0);
        assert_eq!(band, EstimateBand::Simple);
    }

    #[test]
    fn software_type_raises_the_score() {
        let estimator = TokenEstimator::new();
        let goal = "Fix the typo";
        assert_eq!(
            estimator.assess(&request(goal, TaskType::Research), 0),
            EstimateBand::Simple
        );
        assert_eq!(
            estimator.assess(&request(goal, TaskType::Software), 1),
            EstimateBand::Medium
        );
    }

    #[test]
    fn long_goal_with_many_subtasks_is_very_complex() {
        let estimator = TokenEstimator::new();
        let goal = "Design and implement a distributed build cache with content-addressed \
                    storage, a gRPC front end, a background eviction service, per-tenant \
                    quotas, integration with three existing CI providers, and a migration \
                    path off the current NFS-backed store, including load tests.";
        let band = estimator.assess(&request(goal, TaskType::Software), 12);
        assert_eq!(band, EstimateBand::VeryComplex);
    }

    #[test]
    fn estimate_adds_context_and_subtask_overhead() {
        let estimator = TokenEstimator::new();
        let req = request("Summarize a paper", TaskType::Research);

        // Simple band base = 2000; 250 chars of context -> 2 * 110;
        // 2 subtasks -> 1000. (2 subtasks bumps the band score by 1 but
        // keeps it simple: 0 + 1 + 0 = 1.)
        let tokens = estimator.estimate(&req, 2, 250);
        assert_eq!(tokens, 2_000 + 220 + 1_000);
    }

    #[test]
    fn zero_context_adds_no_overhead() {
        let estimator = TokenEstimator::new();
        let req = request("Summarize a paper", TaskType::Research);
        assert_eq!(estimator.estimate(&req, 0, 0), 2_000);
    }

    #[test]
    fn batch_is_the_sum_of_parts() {
        let estimator = TokenEstimator::new();
        let a = request("Summarize a paper", TaskType::Research);
        let b = request("Summarize another paper", TaskType::Research);
        let batch = vec![(a.clone(), 0, 0), (b.clone(), 0, 0)];
        assert_eq!(
            estimator.estimate_batch(&batch),
            estimator.estimate(&a, 0, 0) + estimator.estimate(&b, 0, 0)
        );
    }
}
