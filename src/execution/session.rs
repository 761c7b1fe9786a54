//! Execution Session
//!
//! Everything a running action group shares: the step table, the process
//! supervisor and the output stream instructions are written to. The
//! engine, the output pumps and the control channel all hold the same
//! session.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};
use serde_json::json;

use crate::control::ControlHandler;
use crate::monitoring::ResourceUsage;
use crate::obfuscator::Obfuscator;
use crate::process::{Supervisor, SupervisorError};
use crate::protocol::{hints, Instruction};

use super::state::{ExecutionState, StateError, StepStatus};

/// Redacted output shared between the engine and the command pumps.
pub type OutputSink = Arc<Mutex<Obfuscator<Box<dyn Write + Send>>>>;

pub struct Session {
    state: Mutex<ExecutionState>,
    supervisor: Supervisor,
    output: OutputSink,
    aborted: AtomicBool,
}

impl Session {
    pub fn new(
        state: ExecutionState,
        supervisor: Supervisor,
        output: Obfuscator<Box<dyn Write + Send>>,
    ) -> Self {
        Self {
            state: Mutex::new(state),
            supervisor,
            output: Arc::new(Mutex::new(output)),
            aborted: AtomicBool::new(false),
        }
    }

    /// Locks the step table.
    pub fn state(&self) -> MutexGuard<'_, ExecutionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A copy of the step table.
    pub fn snapshot(&self) -> ExecutionState {
        self.state().clone()
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn output(&self) -> OutputSink {
        Arc::clone(&self.output)
    }

    pub fn persist(&self) -> Result<(), StateError> {
        self.state().save()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Marks the session aborted. Returns false if it already was.
    pub fn mark_aborted(&self) -> bool {
        !self.aborted.swap(true, Ordering::SeqCst)
    }

    /// Writes an instruction frame.
    ///
    /// Held-back output goes out first so the frame lands after everything
    /// the command printed before it.
    pub fn emit(&self, instruction: &Instruction) {
        let frame = match instruction.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(
                    "Dropping instruction '{}' for step '{}': {}",
                    instruction.name, instruction.reference, e
                );
                return;
            }
        };

        let mut output = lock_output(&self.output);
        let written = output
            .flush()
            .and_then(|_| output.get_mut().write_all(&frame))
            .and_then(|_| output.get_mut().flush());
        if let Err(e) = written {
            warn!("Failed to write instruction: {}", e);
        }
    }

    /// Pushes any held-back output through.
    pub fn flush_output(&self) {
        if let Err(e) = lock_output(&self.output).flush() {
            warn!("Failed to flush output: {}", e);
        }
    }

    pub fn record_usage(&self, reference: &str, usage: ResourceUsage) {
        debug!(
            "Step '{}' used {:.1}% CPU on average, {} MB peak",
            reference, usage.average_cpu, usage.peak_memory_mb
        );
        self.state().usage.insert(reference.to_string(), usage);
    }

    /// Moves a step into a terminal status and announces it.
    ///
    /// Returns false when the step had already finished.
    pub fn finish_step(&self, reference: &str, status: StepStatus, exit_code: Option<i32>) -> bool {
        let now = Utc::now();
        let exit_code = {
            let mut state = self.state();
            let step = state.step_mut(reference);
            if step.status.is_terminal() || !status.is_terminal() {
                return false;
            }
            step.set_status(status);
            step.close_pause(now);
            step.finished_at = Some(now);
            if exit_code.is_some() {
                step.exit_code = exit_code;
            }
            let exit_code = step.exit_code;
            let parent = step.parents.last().cloned();

            if state.current.as_deref() == Some(reference) {
                let next = parent.filter(|p| !state.status_of(p).is_terminal());
                state.current = next;
            }
            exit_code
        };

        info!("Step '{}' finished: {}", reference, status);
        self.emit(
            &Instruction::hint(reference, hints::END)
                .with_value(json!({ "status": status.as_str(), "exitCode": exit_code })),
        );
        true
    }

    /// Suspends the current step's command tree.
    pub async fn pause_current(&self) -> Result<(), String> {
        match self.supervisor.pause().await {
            Ok(true) => {
                self.mark_paused(true);
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e @ SupervisorError::Partial(_)) => {
                self.mark_paused(true);
                Err(e.to_string())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    /// Resumes the current step's command tree.
    pub async fn resume_current(&self) -> Result<(), String> {
        match self.supervisor.resume().await {
            Ok(true) => {
                self.mark_paused(false);
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e @ SupervisorError::Partial(_)) => {
                self.mark_paused(false);
                Err(e.to_string())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    /// Opens or closes pause intervals on the current step and its
    /// running ancestors.
    fn mark_paused(&self, paused: bool) {
        let now = Utc::now();
        let current = {
            let mut state = self.state();
            let Some(current) = state.current.clone() else {
                debug!("Pause state changed with no current step");
                return;
            };
            let mut chain = state
                .step(&current)
                .map(|s| s.parents.clone())
                .unwrap_or_default();
            chain.push(current.clone());

            for reference in &chain {
                let step = state.step_mut(reference);
                if step.status != StepStatus::Running {
                    continue;
                }
                if paused {
                    step.open_pause(now);
                } else {
                    step.close_pause(now);
                }
            }
            current
        };

        let name = if paused { hints::PAUSE } else { hints::RESUME };
        info!("Step '{}' {}d", current, name);
        self.emit(&Instruction::hint(&current, name));
        if let Err(e) = self.persist() {
            warn!("Failed to persist pause state: {}", e);
        }
    }
}

#[async_trait]
impl ControlHandler for Session {
    async fn pause(&self) -> Result<(), String> {
        self.pause_current().await
    }

    async fn resume(&self) -> Result<(), String> {
        self.resume_current().await
    }
}

fn lock_output(
    output: &OutputSink,
) -> MutexGuard<'_, Obfuscator<Box<dyn Write + Send>>> {
    output.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Writes command output through the shared sink.
pub(crate) fn write_output(output: &OutputSink, bytes: &[u8]) {
    if let Err(e) = lock_output(output).write_all(bytes) {
        warn!("Failed to forward command output: {}", e);
    }
}
