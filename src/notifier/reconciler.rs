//! Result reconciliation.
//!
//! [`Notifier`] folds three sources into one [`ExecutionResult`]: the
//! instructions read from container output, the compute unit as the
//! platform reports it, and the platform's lifecycle events. Any of them
//! may be late, duplicated or missing, so every update only moves the
//! result forward.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde_json::Value;

use crate::cluster::{ClusterEvent, ComputeUnit, ContainerState};
use crate::execution::{PauseInterval, StepStatus};
use crate::protocol::{hints, Instruction, INIT_STEP_REF};

use super::result::{ExecutionResult, StepResult};
use super::signature::{last_step, walk, Plan};

/// Message attached to steps cut short without a better explanation.
pub const DEFAULT_ERROR_MESSAGE: &str = "execution was aborted";

/// Event reasons that explain why an execution stopped.
const FAILURE_REASONS: &[&str] = &[
    "Failed",
    "FailedScheduling",
    "BackOff",
    "Evicted",
    "OOMKilled",
    "DeadlineExceeded",
    "Preempted",
];

#[derive(Debug, Clone)]
struct Termination {
    exit_code: i32,
    reason: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: DateTime<Utc>,
}

fn exit_status(exit_code: i32) -> StepStatus {
    if exit_code == 0 {
        StepStatus::Passed
    } else {
        StepStatus::Failed
    }
}

impl Termination {
    fn status(&self) -> StepStatus {
        exit_status(self.exit_code)
    }

    fn message(&self) -> String {
        match &self.reason {
            Some(reason) => format!("{} (exit code {})", reason, self.exit_code),
            None => format!("exit code {}", self.exit_code),
        }
    }
}

pub struct Notifier {
    plan: Plan,
    last_step: Option<String>,
    result: ExecutionResult,
    terminations: HashMap<String, Termination>,
    unit_reason: Option<String>,
    event_reason: Option<String>,
    completed: bool,
}

impl Notifier {
    pub fn new(plan: Plan) -> Self {
        let result = ExecutionResult::new(&plan.signature);
        let last_step = last_step(&plan.signature).map(str::to_string);
        Self {
            plan,
            last_step,
            result,
            terminations: HashMap::new(),
            unit_reason: None,
            event_reason: None,
            completed: false,
        }
    }

    /// Snapshot of the current result.
    pub fn result(&self) -> ExecutionResult {
        self.result.clone()
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    /// Folds the platform's view of the unit in. Returns true on change.
    pub fn align_unit(&mut self, unit: &ComputeUnit) -> bool {
        if self.completed {
            return false;
        }
        let before = self.result.clone();

        if let Some(created) = unit.created_at.or(unit.scheduled_at) {
            self.result.queued_at.get_or_insert(created);
        }
        if let Some(started) = unit.containers.iter().filter_map(|c| c.started_at()).min() {
            self.result.started_at.get_or_insert(started);
        }
        for container in &unit.containers {
            if let ContainerState::Terminated {
                started_at,
                finished_at,
                exit_code,
                reason,
            } = &container.state
            {
                self.terminations
                    .entry(container.name.clone())
                    .or_insert_with(|| Termination {
                        exit_code: *exit_code,
                        reason: reason.clone(),
                        started_at: *started_at,
                        finished_at: *finished_at,
                    });
            }
        }
        if let Some(reason) = &unit.failure_reason {
            self.unit_reason = Some(reason.clone());
        }

        self.fill_gaps(false);
        match unit.completed_at {
            Some(completed) => self.finalize(completed, true),
            None => self.refresh(),
        }
        self.result != before
    }

    /// Folds a lifecycle event in. Returns true on change.
    pub fn align_event(&mut self, event: &ClusterEvent) -> bool {
        if self.completed {
            return false;
        }
        let before = self.result.clone();

        self.result.queued_at.get_or_insert(event.time);
        match event.reason.as_str() {
            "Started" => {
                self.result.started_at.get_or_insert(event.time);
            }
            reason if FAILURE_REASONS.contains(&reason) => {
                debug!("Execution problem reported: {} {}", reason, event.message);
                self.event_reason = Some(format!("{}: {}", reason, event.message));
            }
            _ => {}
        }

        self.refresh();
        self.result != before
    }

    /// Applies one instruction read at `time`. Returns true on change.
    pub fn instruction(&mut self, time: DateTime<Utc>, instruction: &Instruction) -> bool {
        if self.completed {
            return false;
        }
        let before = self.result.clone();
        let reference = instruction.reference.as_str();

        if !instruction.is_hint {
            let value = instruction.value.clone().unwrap_or(Value::Null);
            self.step_mut(reference)
                .outputs
                .insert(instruction.name.clone(), value);
            return self.result != before;
        }

        match instruction.name.as_str() {
            hints::START => {
                self.step_mut(reference).settle(StepStatus::Running, time);
                self.result.started_at.get_or_insert(time);
            }
            hints::END => {
                let (status, exit_code) = end_value(instruction.value.as_ref());
                let status = status
                    .or_else(|| exit_code.map(exit_status))
                    .unwrap_or_else(|| self.children_status(reference));
                let step = self.step_mut(reference);
                if !step.status.is_terminal() {
                    if exit_code.is_some() {
                        step.exit_code = exit_code;
                    }
                    close_interval(&mut step.pause_intervals, time);
                    step.settle(status, time);
                }
            }
            hints::PAUSE => {
                open_interval(&mut self.step_mut(reference).pause_intervals, time);
                open_interval(&mut self.result.pause_intervals, time);
            }
            hints::RESUME => {
                close_interval(&mut self.step_mut(reference).pause_intervals, time);
                close_interval(&mut self.result.pause_intervals, time);
            }
            hints::ITERATION => {
                if let Some(iteration) = instruction
                    .value
                    .as_ref()
                    .and_then(Value::as_u64)
                    .and_then(|i| u32::try_from(i).ok())
                {
                    let step = self.step_mut(reference);
                    step.iteration = step.iteration.max(iteration);
                }
            }
            other => debug!("Ignoring unknown hint '{}' for step '{}'", other, reference),
        }

        self.fill_gaps(false);
        let is_last = self.last_step.as_deref() == Some(reference);
        if instruction.name == hints::END && is_last {
            self.finalize(time, false);
        } else {
            self.refresh();
        }
        self.result != before
    }

    /// Closes the result: every unfinished step becomes aborted when it
    /// started, skipped otherwise.
    pub fn finalize(&mut self, at: DateTime<Utc>, force: bool) {
        if self.completed {
            return;
        }
        self.fill_gaps(force);

        let reason = self.unit_reason.clone().or_else(|| self.event_reason.clone());
        let mut order: Vec<String> = vec![INIT_STEP_REF.to_string()];
        order.extend(self.plan.order());

        // Children resolve before their parents
        for reference in order.iter().rev() {
            let status = self.status_of(reference);
            if status.is_terminal() {
                continue;
            }
            let derived = self.derived_status(reference);
            let started = status == StepStatus::Running;
            let is_group = self.plan.container_of(reference).is_none();

            // A platform reason outranks exit-derived statuses of executed steps
            let (next, message) = match derived {
                Some((derived, message)) if is_group || reason.is_none() => (derived, message),
                _ if started => (
                    StepStatus::Aborted,
                    Some(reason.clone().unwrap_or_else(|| DEFAULT_ERROR_MESSAGE.to_string())),
                ),
                _ => (StepStatus::Skipped, None),
            };
            if reference == INIT_STEP_REF && !started && next == StepStatus::Skipped {
                continue;
            }

            let step = self.step_mut(reference);
            close_interval(&mut step.pause_intervals, at);
            if message.is_some() {
                step.error_message = message;
            }
            step.settle(next, at);
        }

        close_interval(&mut self.result.pause_intervals, at);
        self.result.finished_at.get_or_insert(at);
        self.result.clamp_timestamps();
        self.result.status = match self.result.fold_status(&self.plan.signature) {
            status if status.is_terminal() => status,
            _ => StepStatus::Aborted,
        };
        self.completed = true;
        info!("Execution finished: {}", self.result.status);
    }

    fn refresh(&mut self) {
        self.result.clamp_timestamps();
        // Only finalization may declare the execution finished
        self.result.status = match self.result.fold_status(&self.plan.signature) {
            status if status.is_terminal() => StepStatus::Running,
            status => status,
        };
    }

    /// Resolves not-started steps of terminated containers, up to the
    /// furthest step with a known status.
    fn fill_gaps(&mut self, force: bool) {
        let mut order: Vec<String> = Vec::new();
        if self.plan.container_of(INIT_STEP_REF).is_some() {
            order.push(INIT_STEP_REF.to_string());
        }
        order.extend(self.plan.order());

        let limit = if force {
            order.len()
        } else {
            order
                .iter()
                .rposition(|r| self.status_of(r) != StepStatus::NotStarted)
                .map_or(0, |i| i + 1)
        };

        for reference in &order[..limit] {
            if self.status_of(reference) != StepStatus::NotStarted {
                continue;
            }
            let Some(termination) = self
                .plan
                .container_of(reference)
                .and_then(|c| self.terminations.get(&c.name))
                .cloned()
            else {
                continue;
            };

            let status = termination.status();
            let step = self.step_mut(reference);
            if let Some(started) = termination.started_at {
                step.started_at.get_or_insert(started);
            }
            step.exit_code = Some(termination.exit_code);
            if status == StepStatus::Failed {
                step.error_message = Some(termination.message());
                warn!("Step '{}' failed without reporting: {}", reference, termination.message());
            }
            step.settle(status, termination.finished_at);
        }
    }

    /// Status implied by what already finished: the container exit for
    /// executed steps, the children's fold for groups.
    fn derived_status(&self, reference: &str) -> Option<(StepStatus, Option<String>)> {
        if let Some(container) = self.plan.container_of(reference) {
            let termination = self.terminations.get(&container.name)?;
            let message = (termination.exit_code != 0).then(|| termination.message());
            return Some((termination.status(), message));
        }
        let node = walk(&self.plan.signature)
            .into_iter()
            .find(|n| n.reference == reference)?;
        if node.is_leaf() {
            return None;
        }
        let statuses: Vec<StepStatus> = node
            .children
            .iter()
            .map(|c| self.status_of(&c.reference))
            .collect();
        if !statuses.iter().all(|s| s.is_terminal()) {
            return None;
        }
        Some((StepStatus::fold(statuses), None))
    }

    fn children_status(&self, reference: &str) -> StepStatus {
        match self.derived_status(reference) {
            Some((status, _)) => status,
            None => StepStatus::Passed,
        }
    }

    fn status_of(&self, reference: &str) -> StepStatus {
        if reference == INIT_STEP_REF {
            return self.result.init_step.status;
        }
        self.result
            .steps
            .get(reference)
            .map(|s| s.status)
            .unwrap_or_default()
    }

    fn step_mut(&mut self, reference: &str) -> &mut StepResult {
        if reference == INIT_STEP_REF {
            return &mut self.result.init_step;
        }
        self.result.steps.entry(reference.to_string()).or_default()
    }
}

/// Reads the `{status, exitCode}` payload of an end hint.
fn end_value(value: Option<&Value>) -> (Option<StepStatus>, Option<i32>) {
    let Some(value) = value else {
        return (None, None);
    };
    let status = value
        .get("status")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .filter(|s: &StepStatus| s.is_terminal());
    let exit_code = value
        .get("exitCode")
        .and_then(Value::as_i64)
        .and_then(|c| i32::try_from(c).ok());
    (status, exit_code)
}

fn open_interval(intervals: &mut Vec<PauseInterval>, at: DateTime<Utc>) {
    if intervals.last().map(|p| p.ended_at.is_none()).unwrap_or(false) {
        return;
    }
    intervals.push(PauseInterval {
        started_at: at,
        ended_at: None,
    });
}

fn close_interval(intervals: &mut [PauseInterval], at: DateTime<Utc>) {
    if let Some(open) = intervals.last_mut().filter(|p| p.ended_at.is_none()) {
        open.ended_at = Some(at.max(open.started_at));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ContainerStatus;
    use crate::notifier::signature::{PlannedContainer, Signature};
    use serde_json::json;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    /// Group `g` with steps `a` and `b`, both run by container `c1`.
    fn plan() -> Plan {
        Plan {
            signature: vec![Signature::new("g")
                .with_child(Signature::new("a"))
                .with_child(Signature::new("b"))],
            containers: vec![PlannedContainer {
                name: "c1".into(),
                steps: vec!["a".into(), "b".into()],
            }],
        }
    }

    fn unit(state: ContainerState) -> ComputeUnit {
        let mut unit = ComputeUnit::new("u");
        unit.created_at = Some(t(0));
        unit.containers.push(ContainerStatus {
            name: "c1".into(),
            state,
        });
        unit
    }

    fn terminated(exit_code: i32, reason: Option<&str>) -> ContainerState {
        ContainerState::Terminated {
            started_at: Some(t(1)),
            finished_at: t(10),
            exit_code,
            reason: reason.map(str::to_string),
        }
    }

    fn end(reference: &str, status: &str, exit_code: i32) -> Instruction {
        Instruction::hint(reference, hints::END)
            .with_value(json!({ "status": status, "exitCode": exit_code }))
    }

    #[test]
    fn test_failed_container_without_instructions() {
        let mut notifier = Notifier::new(plan());
        let mut unit = unit(terminated(2, Some("Error")));
        unit.completed_at = Some(t(11));

        assert!(notifier.align_unit(&unit));
        let result = notifier.result();
        for reference in ["a", "b"] {
            let step = &result.steps[reference];
            assert_eq!(step.status, StepStatus::Failed, "step {}", reference);
            assert_eq!(step.exit_code, Some(2));
            assert_eq!(step.error_message.as_deref(), Some("Error (exit code 2)"));
        }
        assert_eq!(result.steps["g"].status, StepStatus::Failed);
        assert_eq!(result.status, StepStatus::Failed);
        assert!(notifier.is_completed());
    }

    #[test]
    fn test_gaps_filled_only_up_to_known_steps() {
        let mut notifier = Notifier::new(plan());
        notifier.instruction(t(2), &Instruction::hint("a", hints::START));
        notifier.instruction(t(3), &end("a", "passed", 0));

        // Container ended but its last step never reported
        notifier.align_unit(&unit(terminated(0, None)));
        let result = notifier.result();
        assert_eq!(result.steps["a"].status, StepStatus::Passed);
        assert_eq!(result.steps["b"].status, StepStatus::NotStarted);
        assert_eq!(result.status, StepStatus::Running);

        notifier.instruction(t(4), &Instruction::hint("b", hints::START));
        notifier.instruction(t(5), &end("b", "passed", 0));
        let result = notifier.result();
        assert!(notifier.is_completed());
        assert_eq!(result.steps["g"].status, StepStatus::Passed);
        assert_eq!(result.status, StepStatus::Passed);
    }

    #[test]
    fn test_skipped_gap_step_filled_from_exit() {
        let mut notifier = Notifier::new(plan());
        notifier.align_unit(&unit(terminated(0, None)));
        notifier.instruction(t(5), &Instruction::hint("b", hints::START));

        let result = notifier.result();
        assert_eq!(result.steps["a"].status, StepStatus::Passed);
        assert_eq!(result.steps["a"].exit_code, Some(0));
    }

    #[test]
    fn test_timestamps_never_move_backward() {
        let mut notifier = Notifier::new(plan());
        let mut first = unit(ContainerState::Running { started_at: t(5) });
        first.created_at = Some(t(3));
        notifier.align_unit(&first);

        // Older observations do not replace the first ones
        let mut stale = unit(ContainerState::Running { started_at: t(1) });
        stale.created_at = Some(t(0));
        notifier.align_unit(&stale);
        notifier.instruction(t(2), &Instruction::hint("a", hints::START));

        let result = notifier.result();
        assert_eq!(result.queued_at, Some(t(3)));
        assert_eq!(result.started_at, Some(t(5)));

        notifier.finalize(t(4), true);
        let result = notifier.result();
        let queued = result.queued_at.unwrap();
        let started = result.started_at.unwrap();
        let finished = result.finished_at.unwrap();
        assert!(queued <= started && started <= finished);
        assert_eq!(finished, t(5));
    }

    #[test]
    fn test_started_before_queued_is_clamped() {
        let mut notifier = Notifier::new(plan());
        notifier.instruction(t(1), &Instruction::hint("a", hints::START));
        let mut unit = unit(ContainerState::Running { started_at: t(1) });
        unit.created_at = Some(t(4));
        notifier.align_unit(&unit);

        let result = notifier.result();
        assert_eq!(result.started_at, Some(t(4)));
    }

    #[test]
    fn test_completed_result_is_immutable() {
        let mut notifier = Notifier::new(plan());
        notifier.instruction(t(1), &Instruction::hint("a", hints::START));
        notifier.finalize(t(2), true);
        let snapshot = notifier.result();

        assert!(!notifier.instruction(t(3), &end("a", "passed", 0)));
        assert!(!notifier.align_unit(&unit(terminated(0, None))));
        assert_eq!(notifier.result(), snapshot);
    }

    #[test]
    fn test_platform_reason_overrides_derived_status() {
        let mut notifier = Notifier::new(plan());
        notifier.instruction(t(1), &Instruction::hint("a", hints::START));
        let mut unit = unit(ContainerState::Running { started_at: t(1) });
        unit.failure_reason = Some("DeadlineExceeded".into());
        unit.completed_at = Some(t(9));
        notifier.align_unit(&unit);

        let result = notifier.result();
        assert_eq!(result.steps["a"].status, StepStatus::Aborted);
        assert_eq!(
            result.steps["a"].error_message.as_deref(),
            Some("DeadlineExceeded")
        );
        assert_eq!(result.steps["b"].status, StepStatus::Skipped);
        assert_eq!(result.status, StepStatus::Aborted);
    }

    fn event(reason: &str, message: &str) -> ClusterEvent {
        ClusterEvent {
            time: t(4),
            reason: reason.into(),
            message: message.into(),
            unit: "u".into(),
            container: None,
        }
    }

    #[test]
    fn test_event_reason_explains_aborted_step() {
        let mut notifier = Notifier::new(plan());
        notifier.instruction(t(1), &Instruction::hint("a", hints::START));
        notifier.align_event(&event("OOMKilled", "container exceeded its memory limit"));
        notifier.finalize(t(9), true);

        let result = notifier.result();
        assert_eq!(result.steps["a"].status, StepStatus::Aborted);
        assert_eq!(
            result.steps["a"].error_message.as_deref(),
            Some("OOMKilled: container exceeded its memory limit")
        );
        assert!(result.steps["b"].error_message.is_none());
        assert_eq!(result.status, StepStatus::Aborted);
    }

    #[test]
    fn test_unit_reason_wins_over_event_reason() {
        let mut notifier = Notifier::new(plan());
        notifier.instruction(t(1), &Instruction::hint("a", hints::START));
        notifier.align_event(&event("BackOff", "restarting failed container"));

        let mut unit = unit(ContainerState::Running { started_at: t(1) });
        unit.failure_reason = Some("DeadlineExceeded".into());
        unit.completed_at = Some(t(9));
        notifier.align_unit(&unit);

        let result = notifier.result();
        assert_eq!(result.steps["a"].status, StepStatus::Aborted);
        assert_eq!(
            result.steps["a"].error_message.as_deref(),
            Some("DeadlineExceeded")
        );
    }

    #[test]
    fn test_non_failure_event_leaves_default_message() {
        let mut notifier = Notifier::new(plan());
        notifier.instruction(t(1), &Instruction::hint("a", hints::START));
        notifier.align_event(&event("Pulled", "image already present"));
        notifier.finalize(t(9), true);

        assert_eq!(
            notifier.result().steps["a"].error_message.as_deref(),
            Some(DEFAULT_ERROR_MESSAGE)
        );
    }

    #[test]
    fn test_out_of_range_numbers_are_ignored() {
        let mut notifier = Notifier::new(plan());
        notifier.instruction(t(1), &Instruction::hint("a", hints::START));
        notifier.instruction(
            t(2),
            &Instruction::hint("a", hints::ITERATION).with_value(json!(u64::MAX)),
        );
        notifier.instruction(
            t(3),
            &Instruction::hint("a", hints::END)
                .with_value(json!({ "status": "failed", "exitCode": 1i64 << 40 })),
        );

        let result = notifier.result();
        let step = &result.steps["a"];
        assert_eq!(step.iteration, 0);
        assert_eq!(step.exit_code, None);
        assert_eq!(step.status, StepStatus::Failed);
    }

    #[test]
    fn test_exit_status_wins_over_default_abort() {
        let mut notifier = Notifier::new(plan());
        notifier.instruction(t(1), &Instruction::hint("a", hints::START));
        notifier.instruction(t(2), &end("a", "passed", 0));
        notifier.instruction(t(3), &Instruction::hint("b", hints::START));

        // The end of b was lost, the container exited cleanly
        let mut unit = unit(terminated(0, None));
        unit.completed_at = Some(t(11));
        notifier.align_unit(&unit);

        let result = notifier.result();
        assert_eq!(result.steps["b"].status, StepStatus::Passed);
        assert!(result.steps["b"].error_message.is_none());
        assert_eq!(result.status, StepStatus::Passed);
    }

    #[test]
    fn test_running_step_aborted_with_default_message() {
        let mut notifier = Notifier::new(plan());
        notifier.instruction(t(1), &Instruction::hint("a", hints::START));
        notifier.finalize(t(2), true);

        let result = notifier.result();
        assert_eq!(result.steps["a"].status, StepStatus::Aborted);
        assert_eq!(
            result.steps["a"].error_message.as_deref(),
            Some(DEFAULT_ERROR_MESSAGE)
        );
        assert_eq!(result.steps["b"].status, StepStatus::Skipped);
        assert_eq!(result.status, StepStatus::Aborted);
    }

    #[test]
    fn test_outputs_iterations_and_pauses() {
        let mut notifier = Notifier::new(plan());
        notifier.instruction(t(1), &Instruction::hint("a", hints::START));
        notifier.instruction(t(2), &Instruction::output("a", "count", json!(3)));
        notifier.instruction(
            t(2),
            &Instruction::hint("a", hints::ITERATION).with_value(json!(2)),
        );
        notifier.instruction(t(3), &Instruction::hint("a", hints::PAUSE));
        notifier.instruction(t(5), &Instruction::hint("a", hints::RESUME));
        // Late duplicate of an older iteration
        notifier.instruction(
            t(6),
            &Instruction::hint("a", hints::ITERATION).with_value(json!(1)),
        );

        let result = notifier.result();
        let step = &result.steps["a"];
        assert_eq!(step.outputs["count"], json!(3));
        assert_eq!(step.iteration, 2);
        assert_eq!(step.pause_intervals.len(), 1);
        assert_eq!(step.pause_intervals[0].ended_at, Some(t(5)));
        assert_eq!(result.pause_intervals.len(), 1);
        assert_eq!(result.status, StepStatus::Running);
    }

    #[test]
    fn test_end_status_is_kept_over_late_failure() {
        let mut notifier = Notifier::new(plan());
        notifier.instruction(t(1), &Instruction::hint("a", hints::START));
        notifier.instruction(t(2), &end("a", "passed", 0));
        notifier.align_unit(&unit(terminated(1, None)));

        assert_eq!(notifier.result().steps["a"].status, StepStatus::Passed);
        assert_eq!(notifier.result().steps["a"].finished_at, Some(t(2)));
    }
}
