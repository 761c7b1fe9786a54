//! Execution result model.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::execution::{PauseInterval, StepStatus};

use super::signature::Signature;

/// What the consumer knows about one step.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub iteration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pause_intervals: Vec<PauseInterval>,
}

impl StepResult {
    /// Moves the step to `status` unless it already finished.
    pub fn settle(&mut self, status: StepStatus, at: DateTime<Utc>) -> bool {
        if self.status.is_terminal() || status == StepStatus::NotStarted {
            return false;
        }
        self.status = status;
        if status == StepStatus::Running {
            self.started_at.get_or_insert(at);
        } else if status.is_terminal() {
            let finished = self.started_at.map_or(at, |started| at.max(started));
            self.finished_at.get_or_insert(finished);
        }
        true
    }

    pub fn is_paused(&self) -> bool {
        self.pause_intervals
            .last()
            .map(|p| p.ended_at.is_none())
            .unwrap_or(false)
    }
}

/// Authoritative view of one execution.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub init_step: StepResult,
    pub steps: BTreeMap<String, StepResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pause_intervals: Vec<PauseInterval>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub status: StepStatus,
}

impl ExecutionResult {
    /// Creates a result with an entry for every signature node.
    pub fn new(signature: &[Signature]) -> Self {
        let steps = super::signature::walk(signature)
            .into_iter()
            .map(|n| (n.reference.clone(), StepResult::default()))
            .collect();
        Self {
            steps,
            ..Self::default()
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Folds step statuses over the signature tree.
    ///
    /// Group nodes fold their children unless they resolved themselves.
    pub fn fold_status(&self, signature: &[Signature]) -> StepStatus {
        fn node_status(result: &ExecutionResult, node: &Signature) -> StepStatus {
            let own = result
                .steps
                .get(&node.reference)
                .map(|s| s.status)
                .unwrap_or_default();
            if node.is_leaf() || own.is_terminal() {
                return own;
            }
            let folded = StepStatus::fold(node.children.iter().map(|c| node_status(result, c)));
            if folded == StepStatus::NotStarted && own == StepStatus::Running {
                own
            } else {
                folded
            }
        }

        let started = self.init_step.status != StepStatus::NotStarted
            || self.steps.values().any(|s| s.status != StepStatus::NotStarted);
        if !started {
            return StepStatus::NotStarted;
        }
        let init = Some(self.init_step.status).filter(|s| *s != StepStatus::NotStarted);
        let folded = StepStatus::fold(
            init.into_iter()
                .chain(signature.iter().map(|n| node_status(self, n))),
        );
        if folded == StepStatus::NotStarted {
            // Some steps ran, the rest are still queued
            StepStatus::Running
        } else {
            folded
        }
    }

    /// Pushes timestamps forward until queued <= started <= finished.
    pub fn clamp_timestamps(&mut self) {
        if let (Some(queued), Some(started)) = (self.queued_at, self.started_at) {
            self.started_at = Some(started.max(queued));
        }
        let floor = self.started_at.or(self.queued_at);
        if let (Some(floor), Some(finished)) = (floor, self.finished_at) {
            self.finished_at = Some(finished.max(floor));
        }
    }
}
