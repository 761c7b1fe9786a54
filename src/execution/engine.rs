//! Action Group Engine
//!
//! Interprets one action group as a state machine over the step table:
//! - Conditional start with skip propagation to descendants
//! - Command execution with retry, negation and nested timeouts
//! - Delayed and immediate pauses
//! - Result expressions and child folding at `end`
//! - Cancellation that aborts every unfinished step exactly once
//!
//! State is persisted after every action, so a restarted runner replaying
//! the same group leaves finished steps untouched.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::config::{DEFAULT_BINARY_DIR, DEFAULT_CHECK_INTERVAL, DEFAULT_MONITOR_INTERVAL};
use crate::protocol::{hints, Instruction, INIT_STEP_REF};

use super::action::{Action, ContainerConfig};
use super::expression::{parse_duration, BasicEvaluator, Evaluator, ExprContext};
use super::session::Session;
use super::state::{RetryPolicy, StepStatus};
use super::step::{run_command, CommandOutcome, RunOptions, TimeLimit};
use super::{ExecutionError, RunSummary, CODE_COMMAND_NOT_FOUND};

/// Runs action groups against a shared [`Session`].
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use runwatch::execution::{load_groups, Engine, ExecutionState, Session};
/// use runwatch::obfuscator::Obfuscator;
/// use runwatch::process::{Supervisor, SysinfoProcessTable};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let groups = load_groups("groups.yaml")?;
///     let output: Box<dyn std::io::Write + Send> = Box::new(std::io::stdout());
///     let session = Arc::new(Session::new(
///         ExecutionState::load_or_new("/tmp/state.json")?,
///         Supervisor::new(Arc::new(SysinfoProcessTable::new())),
///         Obfuscator::new(output, &["s3cr3t"]),
///     ));
///
///     let mut engine = Engine::new(session);
///     let summary = engine.run(&groups[0]).await?;
///     std::process::exit(summary.exit_code());
/// }
/// ```
pub struct Engine {
    session: Arc<Session>,
    evaluator: Arc<dyn Evaluator>,
    cancel: CancellationToken,
    containers: HashMap<String, ContainerConfig>,
    binary_dir: PathBuf,
    options: RunOptions,
}

impl Engine {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            evaluator: Arc::new(BasicEvaluator),
            cancel: CancellationToken::new(),
            containers: HashMap::new(),
            binary_dir: PathBuf::from(DEFAULT_BINARY_DIR),
            options: RunOptions {
                check_interval: DEFAULT_CHECK_INTERVAL,
                monitor_interval: DEFAULT_MONITOR_INTERVAL,
            },
        }
    }

    /// Replaces the expression evaluator.
    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Uses an externally owned cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sets where `setup` copies the runner binary when the action names
    /// no directory.
    pub fn with_binary_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.binary_dir = dir.into();
        self
    }

    /// Sets the timeout check and resource sampling intervals.
    pub fn with_intervals(mut self, check: Duration, monitor: Duration) -> Self {
        self.options = RunOptions {
            check_interval: check,
            monitor_interval: monitor,
        };
        self
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Executes an action group.
    ///
    /// # Returns
    ///
    /// * `Ok(summary)` - Group finished or was cancelled
    /// * `Err` - Invalid configuration, failed setup or unwritable state
    pub async fn run(&mut self, group: &[Action]) -> Result<RunSummary, ExecutionError> {
        let start_time = Instant::now();
        info!("Running action group ({} actions)", group.len());

        let mut outcome = Ok(());
        for action in group {
            if self.cancel.is_cancelled() {
                break;
            }
            debug!("Applying {} action", action.kind());
            if let Err(e) = self.apply(action).await {
                error!("Action group stopped: {}", e);
                outcome = Err(e);
                break;
            }
            self.session.persist()?;
        }

        if self.cancel.is_cancelled() {
            self.abort_all();
        }
        let persisted = self.session.persist();
        outcome?;
        persisted?;

        let summary = RunSummary::new(
            &self.session.snapshot(),
            self.session.is_aborted(),
            start_time.elapsed(),
        );
        info!(
            "Action group finished: {} (exit code {})",
            summary.status(),
            summary.exit_code()
        );
        Ok(summary)
    }

    async fn apply(&mut self, action: &Action) -> Result<(), ExecutionError> {
        match action {
            Action::Declare {
                reference,
                condition,
                parents,
            } => {
                self.check(reference, condition)?;
                let mut state = self.session.state();
                let step = state.step_mut(reference);
                step.condition = Some(condition.clone());
                step.parents = parents.clone();
            }
            Action::Pause { reference } => self.pause(reference).await,
            Action::Result { reference, value } => {
                self.check(reference, value)?;
                self.session.state().step_mut(reference).result = Some(value.clone());
            }
            Action::Timeout { reference, timeout } => {
                parse_duration(timeout).map_err(|e| config_error(reference, e))?;
                self.session.state().step_mut(reference).timeout = Some(timeout.clone());
            }
            Action::Retry {
                reference,
                count,
                until,
            } => {
                self.check(reference, until)?;
                self.session.state().step_mut(reference).retry = Some(RetryPolicy {
                    count: *count,
                    until: until.clone(),
                });
            }
            Action::Container { reference, config } => {
                self.containers.insert(reference.clone(), config.clone());
            }
            Action::CurrentStatus { status } => {
                self.check("current-status", status)?;
                self.session.state().current_status = Some(status.clone());
            }
            Action::Start { reference } => self.start(reference).await?,
            Action::End { reference } => self.end(reference)?,
            Action::Setup {
                copy_binaries,
                target_dir,
            } => self.setup(*copy_binaries, target_dir.as_deref())?,
            Action::Execute {
                reference,
                negative,
            } => self.execute(reference, *negative).await?,
        }
        Ok(())
    }

    async fn start(&mut self, reference: &str) -> Result<(), ExecutionError> {
        let (status, condition) = {
            let state = self.session.state();
            let step = state.step(reference);
            (
                step.map(|s| s.status).unwrap_or_default(),
                step.and_then(|s| s.condition.clone()),
            )
        };
        if status.is_terminal() {
            debug!("Step '{}' already finished ({}), not starting", reference, status);
            return Ok(());
        }

        if status == StepStatus::NotStarted {
            if let Some(condition) = condition {
                let aggregate = self.aggregate_status(reference)?;
                if !self.evaluate(reference, &condition, aggregate)? {
                    info!("Step '{}' skipped: condition '{}' is false", reference, condition);
                    self.skip(reference);
                    return Ok(());
                }
            }
        }

        let pause_requested = {
            let mut state = self.session.state();
            let step = state.step_mut(reference);
            step.set_status(StepStatus::Running);
            if step.started_at.is_none() {
                step.started_at = Some(Utc::now());
            }
            let pause_requested = std::mem::take(&mut step.pause_requested);
            state.current = Some(reference.to_string());
            pause_requested
        };

        info!("Starting step: {}", reference);
        self.session
            .emit(&Instruction::hint(reference, hints::START));

        if pause_requested {
            if let Err(e) = self.session.pause_current().await {
                warn!("Delayed pause of step '{}' failed: {}", reference, e);
            }
        }
        Ok(())
    }

    /// Skips a step and every descendant that has not started.
    fn skip(&self, reference: &str) {
        let targets: Vec<String> = {
            let state = self.session.state();
            std::iter::once(reference.to_string())
                .chain(state.descendants(reference))
                .filter(|r| state.status_of(r) == StepStatus::NotStarted)
                .collect()
        };
        for target in targets {
            self.session.finish_step(&target, StepStatus::Skipped, None);
        }
    }

    async fn execute(&mut self, reference: &str, negative: bool) -> Result<(), ExecutionError> {
        if self.session.is_aborted() {
            return Ok(());
        }
        let status = self.session.state().status_of(reference);
        if status.is_terminal() {
            debug!("Step '{}' already finished ({}), not executing", reference, status);
            return Ok(());
        }
        if status == StepStatus::NotStarted {
            self.start(reference).await?;
            if self.session.state().status_of(reference).is_terminal() {
                return Ok(());
            }
        }

        let config = self
            .container_for(reference)
            .ok_or_else(|| ExecutionError::Config {
                reference: reference.to_string(),
                message: "no container configuration for step".to_string(),
            })?;
        let limits = self.time_limits(reference)?;
        let retry = self
            .session
            .state()
            .step(reference)
            .and_then(|s| s.retry.clone());

        loop {
            let iteration = {
                let mut state = self.session.state();
                let step = state.step_mut(reference);
                step.iteration += 1;
                step.iteration
            };
            self.session.emit(
                &Instruction::hint(reference, hints::ITERATION).with_value(json!(iteration)),
            );
            self.session.persist()?;

            let outcome = match run_command(
                &self.session,
                reference,
                &config,
                &limits,
                self.options,
                &self.cancel,
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Step '{}' could not run its command: {}", reference, e);
                    CommandOutcome::Exited(CODE_COMMAND_NOT_FOUND)
                }
            };

            match outcome {
                CommandOutcome::Cancelled => return Ok(()),
                CommandOutcome::TimedOut { node } => {
                    self.time_out(reference, &node);
                    return Ok(());
                }
                CommandOutcome::Exited(code) => {
                    let passed = (code == 0) != negative;
                    let status = if passed {
                        StepStatus::Passed
                    } else {
                        StepStatus::Failed
                    };

                    if let Some(policy) = &retry {
                        let satisfied = if iteration <= policy.count {
                            match self.evaluate(reference, &policy.until, status) {
                                Ok(satisfied) => satisfied,
                                Err(e) => {
                                    self.session.finish_step(reference, status, Some(code));
                                    return Err(e);
                                }
                            }
                        } else {
                            true
                        };
                        if !satisfied {
                            info!(
                                "Step '{}' {} (exit code {}), retrying ({}/{})",
                                reference, status, code, iteration, policy.count
                            );
                            self.session.state().step_mut(reference).exit_code = Some(code);
                            continue;
                        }
                    }

                    self.session.finish_step(reference, status, Some(code));
                    return Ok(());
                }
            }
        }
    }

    /// Marks the step and every ancestor up to `node` as timed out.
    fn time_out(&self, reference: &str, node: &str) {
        let mut chain = vec![reference.to_string()];
        if node != reference {
            let parents = self
                .session
                .state()
                .step(reference)
                .map(|s| s.parents.clone())
                .unwrap_or_default();
            for parent in parents.into_iter().rev() {
                let reached = parent == node;
                chain.push(parent);
                if reached {
                    break;
                }
            }
        }
        for target in chain {
            self.session.finish_step(&target, StepStatus::Timeout, None);
        }
    }

    fn end(&mut self, reference: &str) -> Result<(), ExecutionError> {
        let (status, expr) = {
            let state = self.session.state();
            let step = state.step(reference);
            (
                step.map(|s| s.status).unwrap_or_default(),
                step.and_then(|s| s.result.clone()),
            )
        };
        if status.is_terminal() {
            return Ok(());
        }

        let children = self.children_status(reference);
        let status = match expr {
            Some(expr) => {
                if self.evaluate(reference, &expr, children)? {
                    StepStatus::Passed
                } else {
                    StepStatus::Failed
                }
            }
            None => children,
        };
        self.session.finish_step(reference, status, None);
        Ok(())
    }

    fn setup(&mut self, copy_binaries: bool, target_dir: Option<&Path>) -> Result<(), ExecutionError> {
        {
            let mut state = self.session.state();
            let step = state.step_mut(INIT_STEP_REF);
            if step.status.is_terminal() {
                return Ok(());
            }
            step.set_status(StepStatus::Running);
            step.started_at.get_or_insert_with(Utc::now);
        }
        self.session
            .emit(&Instruction::hint(INIT_STEP_REF, hints::START));

        if copy_binaries {
            let target = target_dir.unwrap_or(self.binary_dir.as_path());
            if let Err(e) = copy_runner_binary(target) {
                self.session.finish_step(INIT_STEP_REF, StepStatus::Failed, None);
                return Err(ExecutionError::Setup(e));
            }
            info!("Runner binary provisioned in {}", target.display());
        }

        self.session.finish_step(INIT_STEP_REF, StepStatus::Passed, Some(0));
        Ok(())
    }

    async fn pause(&mut self, reference: &str) {
        let (status, is_current) = {
            let state = self.session.state();
            (
                state.status_of(reference),
                state.current.as_deref() == Some(reference),
            )
        };
        match status {
            s if s.is_terminal() => debug!("Ignoring pause of finished step '{}'", reference),
            StepStatus::Running if is_current => {
                if let Err(e) = self.session.pause_current().await {
                    warn!("Failed to pause step '{}': {}", reference, e);
                }
            }
            _ => {
                debug!("Step '{}' will start paused", reference);
                self.session.state().step_mut(reference).pause_requested = true;
            }
        }
    }

    /// Aborts every unfinished step. Only the first call has an effect.
    fn abort_all(&self) {
        if !self.session.mark_aborted() {
            return;
        }
        warn!("Execution cancelled, aborting unfinished steps");
        let unfinished: Vec<String> = self
            .session
            .state()
            .steps
            .values()
            .filter(|s| !s.status.is_terminal())
            .map(|s| s.reference.clone())
            .collect();
        for reference in unfinished {
            self.session.finish_step(&reference, StepStatus::Aborted, None);
        }
    }

    /// Nearest container configuration on the step or its ancestors.
    fn container_for(&self, reference: &str) -> Option<ContainerConfig> {
        if let Some(config) = self.containers.get(reference) {
            return Some(config.clone());
        }
        let state = self.session.state();
        let parents = state.step(reference)?.parents.clone();
        parents
            .iter()
            .rev()
            .find_map(|p| self.containers.get(p))
            .cloned()
    }

    /// Time limits of the step and its ancestors, innermost first.
    fn time_limits(&self, reference: &str) -> Result<Vec<TimeLimit>, ExecutionError> {
        let state = self.session.state();
        let parents = state
            .step(reference)
            .map(|s| s.parents.clone())
            .unwrap_or_default();

        std::iter::once(reference.to_string())
            .chain(parents.into_iter().rev())
            .filter_map(|r| {
                let expr = state.step(&r)?.timeout.clone()?;
                Some((r, expr))
            })
            .map(|(r, expr)| -> Result<TimeLimit, ExecutionError> {
                let limit = parse_duration(&expr).map_err(|e| config_error(&r, e))?;
                Ok(TimeLimit {
                    reference: r,
                    limit,
                })
            })
            .collect()
    }

    /// Status conditions are evaluated against.
    fn aggregate_status(&self, reference: &str) -> Result<StepStatus, ExecutionError> {
        let (expr, fold) = {
            let state = self.session.state();
            let fold = StepStatus::fold(
                state
                    .steps
                    .values()
                    .filter(|s| s.reference != reference && s.status.is_terminal())
                    .map(|s| s.status),
            );
            (state.current_status.clone(), fold)
        };
        match expr {
            Some(expr) => Ok(if self.evaluate(reference, &expr, fold)? {
                StepStatus::Passed
            } else {
                StepStatus::Failed
            }),
            None => Ok(fold),
        }
    }

    /// Folded status of the finished direct children.
    fn children_status(&self, reference: &str) -> StepStatus {
        let state = self.session.state();
        StepStatus::fold(
            state
                .children(reference)
                .iter()
                .map(|c| state.status_of(c))
                .filter(|s| s.is_terminal()),
        )
    }

    /// Fails the group on an expression that can never evaluate.
    fn check(&self, reference: &str, expr: &str) -> Result<(), ExecutionError> {
        self.evaluator.check(expr).map_err(|e| ExecutionError::Config {
            reference: reference.to_string(),
            message: format!("invalid expression '{}': {}", expr, e),
        })
    }

    fn evaluate(&self, reference: &str, expr: &str, status: StepStatus) -> Result<bool, ExecutionError> {
        let steps = self.session.state().statuses();
        self.evaluator
            .evaluate(expr, &ExprContext { status, steps: &steps })
            .map_err(|e| ExecutionError::Config {
                reference: reference.to_string(),
                message: format!("cannot evaluate '{}': {}", expr, e),
            })
    }
}

fn config_error(reference: &str, error: impl std::fmt::Display) -> ExecutionError {
    ExecutionError::Config {
        reference: reference.to_string(),
        message: error.to_string(),
    }
}

/// Copies the running executable into `dir` so later containers can use it.
fn copy_runner_binary(dir: &Path) -> std::io::Result<PathBuf> {
    let source = std::env::current_exe()?;
    let name = source
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "runwatch".into());
    fs::create_dir_all(dir)?;
    let target = dir.join(name);
    fs::copy(&source, &target)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&target, fs::Permissions::from_mode(0o755))?;
    }
    debug!("Copied {} to {}", source.display(), target.display());
    Ok(target)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::control::{ControlClient, ControlServer};
    use crate::execution::session::test_support::{session_in, SharedBuffer};
    use crate::execution::state::ExecutionState;
    use crate::execution::{CODE_ABORTED, CODE_INPUT_ERROR};
    use tempfile::tempdir;

    fn engine(session: &Arc<Session>) -> Engine {
        Engine::new(Arc::clone(session))
            .with_intervals(Duration::from_millis(20), Duration::from_millis(100))
    }

    fn declare(reference: &str, condition: &str, parents: &[&str]) -> Action {
        Action::Declare {
            reference: reference.into(),
            condition: condition.into(),
            parents: parents.iter().map(|p| p.to_string()).collect(),
        }
    }

    fn container(reference: &str, command: &[&str]) -> Action {
        Action::Container {
            reference: reference.into(),
            config: ContainerConfig::new(command.iter().copied()),
        }
    }

    fn shell(reference: &str, script: &str) -> Action {
        container(reference, &["/bin/sh", "-c", script])
    }

    fn start(reference: &str) -> Action {
        Action::Start {
            reference: reference.into(),
        }
    }

    fn execute(reference: &str) -> Action {
        Action::Execute {
            reference: reference.into(),
            negative: false,
        }
    }

    fn end(reference: &str) -> Action {
        Action::End {
            reference: reference.into(),
        }
    }

    fn timeout(reference: &str, timeout: &str) -> Action {
        Action::Timeout {
            reference: reference.into(),
            timeout: timeout.into(),
        }
    }

    fn hint_names(buffer: &SharedBuffer, reference: &str) -> Vec<String> {
        buffer
            .instructions()
            .into_iter()
            .filter(|i| i.is_hint && i.reference == reference)
            .map(|i| i.name)
            .collect()
    }

    #[tokio::test]
    async fn test_single_step_passes() {
        let dir = tempdir().unwrap();
        let (session, buffer) = session_in(dir.path(), &[]);
        let group = vec![
            declare("root", "true", &[]),
            container("root", &["/bin/true"]),
            start("root"),
            execute("root"),
            end("root"),
        ];

        let summary = engine(&session).run(&group).await.unwrap();

        let state = session.snapshot();
        let root = state.step("root").unwrap();
        assert_eq!(root.status, StepStatus::Passed);
        assert_eq!(root.exit_code, Some(0));
        assert_eq!(root.iteration, 1);
        assert_eq!(summary.exit_code(), 0);
        assert_eq!(summary.status(), StepStatus::Passed);
        assert_eq!(hint_names(&buffer, "root"), vec!["start", "iteration", "end"]);

        // Persisted after the run
        let persisted = ExecutionState::load(&dir.path().join("state.json")).unwrap();
        assert_eq!(persisted.status_of("root"), StepStatus::Passed);
    }

    #[tokio::test]
    async fn test_retry_until_passed() {
        let dir = tempdir().unwrap();
        let (session, _) = session_in(dir.path(), &[]);
        let counter = dir.path().join("attempts");
        let script = format!(
            "n=$(cat {0} 2>/dev/null || echo 0); n=$((n+1)); echo $n > {0}; [ $n -ge 3 ]",
            counter.display()
        );
        let group = vec![
            declare("root", "true", &[]),
            shell("root", &script),
            Action::Retry {
                reference: "root".into(),
                count: 2,
                until: "passed".into(),
            },
            start("root"),
            execute("root"),
            end("root"),
        ];

        engine(&session).run(&group).await.unwrap();

        let state = session.snapshot();
        let root = state.step("root").unwrap();
        assert_eq!(root.iteration, 3);
        assert_eq!(root.status, StepStatus::Passed);
        assert_eq!(root.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let dir = tempdir().unwrap();
        let (session, _) = session_in(dir.path(), &[]);
        let group = vec![
            declare("root", "true", &[]),
            container("root", &["/bin/false"]),
            Action::Retry {
                reference: "root".into(),
                count: 1,
                until: "passed".into(),
            },
            execute("root"),
        ];

        let summary = engine(&session).run(&group).await.unwrap();
        let state = session.snapshot();
        assert_eq!(state.step("root").unwrap().iteration, 2);
        assert_eq!(state.status_of("root"), StepStatus::Failed);
        assert_eq!(summary.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_negative_inverts_exit_code() {
        let dir = tempdir().unwrap();
        let (session, _) = session_in(dir.path(), &[]);
        let group = vec![
            declare("root", "true", &[]),
            container("root", &["/bin/false"]),
            Action::Execute {
                reference: "root".into(),
                negative: true,
            },
        ];

        engine(&session).run(&group).await.unwrap();
        let state = session.snapshot();
        assert_eq!(state.status_of("root"), StepStatus::Passed);
        assert_eq!(state.step("root").unwrap().exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_false_condition_skips_descendants() {
        let dir = tempdir().unwrap();
        let (session, _) = session_in(dir.path(), &[]);
        let group = vec![
            declare("group", "false", &[]),
            declare("a", "passed", &["group"]),
            declare("b", "passed", &["group"]),
            container("group", &["/bin/true"]),
            start("group"),
            start("a"),
            execute("a"),
            end("a"),
            end("group"),
        ];

        engine(&session).run(&group).await.unwrap();
        let state = session.snapshot();
        for reference in ["group", "a", "b"] {
            assert_eq!(state.status_of(reference), StepStatus::Skipped);
        }
        assert_eq!(state.step("a").unwrap().iteration, 0);
    }

    #[tokio::test]
    async fn test_failed_step_skips_following_steps() {
        let dir = tempdir().unwrap();
        let (session, _) = session_in(dir.path(), &[]);
        let group = vec![
            declare("group", "true", &[]),
            declare("a", "passed", &["group"]),
            declare("b", "passed", &["group"]),
            declare("cleanup", "always", &["group"]),
            container("a", &["/bin/false"]),
            container("b", &["/bin/true"]),
            container("cleanup", &["/bin/true"]),
            start("group"),
            execute("a"),
            execute("b"),
            execute("cleanup"),
            end("group"),
        ];

        let summary = engine(&session).run(&group).await.unwrap();
        let state = session.snapshot();
        assert_eq!(state.status_of("a"), StepStatus::Failed);
        assert_eq!(state.status_of("b"), StepStatus::Skipped);
        assert_eq!(state.status_of("cleanup"), StepStatus::Passed);
        assert_eq!(state.status_of("group"), StepStatus::Failed);
        assert_eq!(summary.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_container_config_inherited_from_parent() {
        let dir = tempdir().unwrap();
        let (session, buffer) = session_in(dir.path(), &[]);
        let group = vec![
            declare("group", "true", &[]),
            declare("leaf", "true", &["group"]),
            shell("group", "echo inherited"),
            start("group"),
            execute("leaf"),
            end("group"),
        ];

        engine(&session).run(&group).await.unwrap();
        assert_eq!(session.state().status_of("leaf"), StepStatus::Passed);
        assert_eq!(session.state().status_of("group"), StepStatus::Passed);
        assert!(buffer.text().contains("inherited\n"));
    }

    #[tokio::test]
    async fn test_result_expression_decides_end_status() {
        let dir = tempdir().unwrap();
        let (session, _) = session_in(dir.path(), &[]);
        let group = vec![
            declare("group", "true", &[]),
            declare("a", "true", &["group"]),
            container("a", &["/bin/false"]),
            Action::Result {
                reference: "group".into(),
                value: "a.failed".into(),
            },
            start("group"),
            execute("a"),
            end("group"),
        ];

        engine(&session).run(&group).await.unwrap();
        assert_eq!(session.state().status_of("a"), StepStatus::Failed);
        assert_eq!(session.state().status_of("group"), StepStatus::Passed);
    }

    #[tokio::test]
    async fn test_outer_timeout_marks_chain() {
        let dir = tempdir().unwrap();
        let (session, _) = session_in(dir.path(), &[]);
        let group = vec![
            declare("outer", "true", &[]),
            declare("inner", "true", &["outer"]),
            declare("leaf", "true", &["outer", "inner"]),
            timeout("outer", "300ms"),
            timeout("leaf", "30s"),
            container("leaf", &["sleep", "10"]),
            start("outer"),
            start("inner"),
            execute("leaf"),
            end("inner"),
            end("outer"),
        ];

        let started = Instant::now();
        engine(&session).run(&group).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));

        let state = session.snapshot();
        for reference in ["outer", "inner", "leaf"] {
            assert_eq!(state.status_of(reference), StepStatus::Timeout, "{}", reference);
        }
    }

    #[tokio::test]
    async fn test_inner_timeout_leaves_parent_running() {
        let dir = tempdir().unwrap();
        let (session, _) = session_in(dir.path(), &[]);
        let group = vec![
            declare("outer", "true", &[]),
            declare("leaf", "true", &["outer"]),
            timeout("outer", "30s"),
            timeout("leaf", "200ms"),
            container("leaf", &["sleep", "10"]),
            start("outer"),
            execute("leaf"),
        ];

        engine(&session).run(&group).await.unwrap();
        let state = session.snapshot();
        assert_eq!(state.status_of("leaf"), StepStatus::Timeout);
        assert_eq!(state.status_of("outer"), StepStatus::Running);
    }

    #[tokio::test]
    async fn test_timeouts_are_not_retried() {
        let dir = tempdir().unwrap();
        let (session, _) = session_in(dir.path(), &[]);
        let group = vec![
            declare("leaf", "true", &[]),
            timeout("leaf", "200ms"),
            Action::Retry {
                reference: "leaf".into(),
                count: 3,
                until: "passed".into(),
            },
            container("leaf", &["sleep", "10"]),
            execute("leaf"),
        ];

        engine(&session).run(&group).await.unwrap();
        let state = session.snapshot();
        assert_eq!(state.status_of("leaf"), StepStatus::Timeout);
        assert_eq!(state.step("leaf").unwrap().iteration, 1);
    }

    #[tokio::test]
    async fn test_finished_steps_are_not_rerun() {
        let dir = tempdir().unwrap();
        let (session, buffer) = session_in(dir.path(), &[]);
        {
            let mut state = session.state();
            let root = state.step_mut("root");
            root.set_status(StepStatus::Passed);
            root.exit_code = Some(0);
        }
        let group = vec![
            declare("root", "true", &[]),
            container("root", &["/bin/false"]),
            start("root"),
            execute("root"),
            end("root"),
        ];

        engine(&session).run(&group).await.unwrap();
        let state = session.snapshot();
        assert_eq!(state.status_of("root"), StepStatus::Passed);
        assert_eq!(state.step("root").unwrap().iteration, 0);
        assert!(buffer.instructions().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_aborts_unfinished_steps_once() {
        let dir = tempdir().unwrap();
        let (session, _) = session_in(dir.path(), &[]);
        let group = vec![
            declare("first", "true", &[]),
            declare("slow", "true", &[]),
            declare("never", "true", &[]),
            container("first", &["/bin/true"]),
            container("slow", &["sleep", "10"]),
            container("never", &["/bin/true"]),
            execute("first"),
            execute("slow"),
            execute("never"),
        ];

        let mut engine = engine(&session);
        let cancel = engine.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            cancel.cancel();
        });

        let started = Instant::now();
        let summary = engine.run(&group).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));

        let state = session.snapshot();
        assert_eq!(state.status_of("first"), StepStatus::Passed);
        assert_eq!(state.status_of("slow"), StepStatus::Aborted);
        assert_eq!(state.status_of("never"), StepStatus::Aborted);
        assert!(summary.aborted);
        assert_eq!(summary.exit_code(), CODE_ABORTED);

        // A second pass changes nothing
        engine.abort_all();
        assert_eq!(session.state().status_of("first"), StepStatus::Passed);
    }

    #[tokio::test]
    async fn test_invalid_timeout_is_input_error() {
        let dir = tempdir().unwrap();
        let (session, _) = session_in(dir.path(), &[]);
        let group = vec![declare("root", "true", &[]), timeout("root", "soon")];

        let err = engine(&session).run(&group).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Config { .. }));
        assert_eq!(err.exit_code(), CODE_INPUT_ERROR);
    }

    #[tokio::test]
    async fn test_invalid_retry_until_fails_before_running() {
        for count in [0, 1] {
            let dir = tempdir().unwrap();
            let (session, _) = session_in(dir.path(), &[]);
            let marker = dir.path().join("ran");
            let group = vec![
                declare("root", "true", &[]),
                shell("root", &format!("touch {}; exit 1", marker.display())),
                Action::Retry {
                    reference: "root".into(),
                    count,
                    until: "passed &&".into(),
                },
                execute("root"),
            ];

            let err = engine(&session).run(&group).await.unwrap_err();
            assert_eq!(err.exit_code(), CODE_INPUT_ERROR, "count {}", count);
            assert!(!marker.exists(), "command ran with count {}", count);
            assert_eq!(session.state().status_of("root"), StepStatus::NotStarted);
        }
    }

    /// Accepts every expression up front and fails every evaluation.
    struct BrokenEvaluator;

    impl Evaluator for BrokenEvaluator {
        fn evaluate(
            &self,
            expr: &str,
            _ctx: &ExprContext<'_>,
        ) -> Result<bool, crate::execution::ExpressionError> {
            Err(crate::execution::ExpressionError::UnknownSymbol(expr.to_string()))
        }
    }

    #[tokio::test]
    async fn test_retry_evaluation_error_finishes_step() {
        let dir = tempdir().unwrap();
        let (session, _) = session_in(dir.path(), &[]);
        let group = vec![
            container("root", &["/bin/false"]),
            Action::Retry {
                reference: "root".into(),
                count: 1,
                until: "passed".into(),
            },
            execute("root"),
        ];

        let err = engine(&session)
            .with_evaluator(Arc::new(BrokenEvaluator))
            .run(&group)
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), CODE_INPUT_ERROR);
        assert_eq!(session.state().status_of("root"), StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_invalid_condition_is_input_error() {
        let dir = tempdir().unwrap();
        let (session, _) = session_in(dir.path(), &[]);
        let group = vec![declare("root", "passed &&", &[]), start("root")];

        let err = engine(&session).run(&group).await.unwrap_err();
        assert_eq!(err.exit_code(), CODE_INPUT_ERROR);
    }

    #[tokio::test]
    async fn test_missing_container_is_input_error() {
        let dir = tempdir().unwrap();
        let (session, _) = session_in(dir.path(), &[]);
        let group = vec![declare("root", "true", &[]), execute("root")];

        let err = engine(&session).run(&group).await.unwrap_err();
        assert_eq!(err.exit_code(), CODE_INPUT_ERROR);
    }

    #[tokio::test]
    async fn test_unknown_program_fails_step() {
        let dir = tempdir().unwrap();
        let (session, _) = session_in(dir.path(), &[]);
        let group = vec![
            declare("root", "true", &[]),
            container("root", &["/nonexistent/program"]),
            execute("root"),
        ];

        engine(&session).run(&group).await.unwrap();
        let state = session.snapshot();
        assert_eq!(state.status_of("root"), StepStatus::Failed);
        assert_eq!(state.step("root").unwrap().exit_code, Some(CODE_COMMAND_NOT_FOUND));
    }

    #[tokio::test]
    async fn test_setup_provisions_binary() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let bin = dir.path().join("bin");
        let (session, buffer) = session_in(dir.path(), &[]);
        let group = vec![Action::Setup {
            copy_binaries: true,
            target_dir: Some(bin.clone()),
        }];

        engine(&session).run(&group).await.unwrap();
        assert_eq!(session.state().status_of(INIT_STEP_REF), StepStatus::Passed);

        let copied: Vec<_> = fs::read_dir(&bin).unwrap().collect();
        assert_eq!(copied.len(), 1);
        let mode = copied[0].as_ref().unwrap().metadata().unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert_eq!(hint_names(&buffer, INIT_STEP_REF), vec!["start", "end"]);
    }

    #[tokio::test]
    async fn test_delayed_pause_is_applied_at_start() {
        let dir = tempdir().unwrap();
        let (session, buffer) = session_in(dir.path(), &[]);
        let group = vec![
            declare("root", "true", &[]),
            Action::Pause {
                reference: "root".into(),
            },
            start("root"),
        ];

        engine(&session).run(&group).await.unwrap();
        let state = session.snapshot();
        let root = state.step("root").unwrap();
        assert!(root.is_paused());
        assert!(!root.pause_requested);
        assert!(session.supervisor().is_paused().await);
        assert_eq!(hint_names(&buffer, "root"), vec!["start", "pause"]);
    }

    #[tokio::test]
    async fn test_pause_over_control_channel_halts_command() {
        let dir = tempdir().unwrap();
        let (session, _) = session_in(dir.path(), &[]);
        let socket = dir.path().join("control.sock");
        let server = ControlServer::bind(&socket).unwrap();
        let cancel = CancellationToken::new();
        let handler: Arc<dyn crate::control::ControlHandler> = session.clone();
        let serving = {
            let cancel = cancel.clone();
            tokio::spawn(async move { server.serve(handler, cancel).await })
        };

        // Six short sleeps: a stopped shell cannot start the next one.
        let group = vec![
            declare("root", "true", &[]),
            timeout("root", "2s"),
            shell("root", "for i in 1 2 3 4 5 6; do sleep 0.1; done"),
            start("root"),
            execute("root"),
            end("root"),
        ];
        let run = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { engine(&session).run(&group).await })
        };

        let mut client = ControlClient::connect(&socket).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        let paused_at = Instant::now();
        client.pause().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!run.is_finished(), "command progressed while paused");
        client.resume().await.unwrap();
        let paused_for = paused_at.elapsed();

        run.await.unwrap().unwrap();
        cancel.cancel();
        serving.await.unwrap().unwrap();

        let state = session.snapshot();
        let root = state.step("root").unwrap();
        assert_eq!(root.status, StepStatus::Passed);
        assert_eq!(root.pause_intervals.len(), 1);
        assert!(root.excluded_paused_duration >= Duration::from_millis(2000));
        assert!(root.excluded_paused_duration <= paused_for + Duration::from_millis(100));
    }
}
