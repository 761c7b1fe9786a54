//! Step Execution Module
//!
//! The in-container side: interprets an action group, supervises each
//! step's command and announces every transition on the output stream.
//!
//! # Architecture
//!
//! - [`action`]: the action group program
//! - [`state`]: persisted step table
//! - [`expression`]: conditions, retry predicates and durations
//! - [`session`]: shared state, supervisor and output
//! - [`step`]: one command run
//! - [`engine`]: the state machine

pub mod action;
pub mod engine;
pub mod expression;
pub mod session;
pub mod state;
pub mod step;

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;

pub use action::{load_groups, Action, ActionError, ActionGroup, ContainerConfig};
pub use engine::Engine;
pub use expression::{parse_duration, BasicEvaluator, Evaluator, ExprContext, ExpressionError};
pub use session::{OutputSink, Session};
pub use state::{ExecutionState, PauseInterval, RetryPolicy, StateError, StepState, StepStatus};

/// Exit code for invalid action groups.
pub const CODE_INPUT_ERROR: i32 = 155;

/// Exit code for a cancelled execution.
pub const CODE_ABORTED: i32 = 137;

/// Exit code for runner failures unrelated to the steps.
pub const CODE_INTERNAL: i32 = 190;

/// Exit code recorded when a step's command cannot be started.
pub const CODE_COMMAND_NOT_FOUND: i32 = 127;

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("invalid configuration for step '{reference}': {message}")]
    Config { reference: String, message: String },

    #[error("setup failed: {0}")]
    Setup(#[source] std::io::Error),

    #[error(transparent)]
    State(#[from] StateError),
}

impl ExecutionError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ExecutionError::Config { .. } => CODE_INPUT_ERROR,
            ExecutionError::Setup(_) | ExecutionError::State(_) => CODE_INTERNAL,
        }
    }
}

/// Outcome of one action group run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub steps: BTreeMap<String, StepStatus>,
    pub aborted: bool,
    pub duration: Duration,
}

impl RunSummary {
    pub fn new(state: &ExecutionState, aborted: bool, duration: Duration) -> Self {
        Self {
            steps: state
                .steps
                .iter()
                .map(|(reference, step)| (reference.clone(), step.status))
                .collect(),
            aborted,
            duration,
        }
    }

    /// Folded status of every finished step.
    pub fn status(&self) -> StepStatus {
        if self.aborted {
            return StepStatus::Aborted;
        }
        StepStatus::fold(self.steps.values().copied().filter(|s| s.is_terminal()))
    }

    pub fn exit_code(&self) -> i32 {
        if self.aborted {
            CODE_ABORTED
        } else if self.status().is_failure() {
            1
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(steps: &[(&str, StepStatus)], aborted: bool) -> RunSummary {
        let mut state = ExecutionState::new("unused");
        for (reference, status) in steps {
            state.step_mut(reference).status = *status;
        }
        RunSummary::new(&state, aborted, Duration::ZERO)
    }

    #[test]
    fn test_summary_exit_codes() {
        assert_eq!(summary(&[("a", StepStatus::Passed)], false).exit_code(), 0);
        assert_eq!(
            summary(&[("a", StepStatus::Passed), ("b", StepStatus::Skipped)], false).exit_code(),
            0
        );
        assert_eq!(
            summary(&[("a", StepStatus::Passed), ("b", StepStatus::Timeout)], false).exit_code(),
            1
        );
        assert_eq!(summary(&[("a", StepStatus::Passed)], true).exit_code(), CODE_ABORTED);
    }

    #[test]
    fn test_summary_ignores_unfinished_steps() {
        let summary = summary(&[("a", StepStatus::Passed), ("b", StepStatus::Running)], false);
        assert_eq!(summary.status(), StepStatus::Passed);
    }

    #[test]
    fn test_error_exit_codes() {
        let config = ExecutionError::Config {
            reference: "a".into(),
            message: "bad".into(),
        };
        assert_eq!(config.exit_code(), CODE_INPUT_ERROR);
        let setup = ExecutionError::Setup(std::io::Error::new(std::io::ErrorKind::Other, "x"));
        assert_eq!(setup.exit_code(), CODE_INTERNAL);
    }
}
