//! Command Execution
//!
//! Runs one iteration of a step's command under the process supervisor:
//! output is pumped into the session's redacted stream, resource usage is
//! sampled beside it, and the time limits of the step and its ancestors
//! are checked on every tick.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use chrono::Utc;
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::monitoring;
use crate::process::SupervisorError;

use super::action::ContainerConfig;
use super::session::{write_output, OutputSink, Session};

/// How long pumps may keep draining after the command exited.
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const PUMP_BUFFER_SIZE: usize = 8192;

/// A timeout attached to one node of the step tree.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeLimit {
    pub reference: String,
    pub limit: Duration,
}

/// How one command run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Exited(i32),
    /// `node` is the innermost step whose limit was breached
    TimedOut { node: String },
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub check_interval: Duration,
    pub monitor_interval: Duration,
}

enum Event {
    Exited(io::Result<ExitStatus>),
    Cancelled,
    Tick,
}

/// Runs the command once.
///
/// `limits` must be ordered innermost first so the innermost breached
/// node wins.
pub async fn run_command(
    session: &Session,
    reference: &str,
    config: &ContainerConfig,
    limits: &[TimeLimit],
    options: RunOptions,
    cancel: &CancellationToken,
) -> Result<CommandOutcome, SupervisorError> {
    let argv = config.argv();
    let Some((program, args)) = argv.split_first() else {
        return Err(SupervisorError::Spawn(io::Error::new(
            io::ErrorKind::InvalidInput,
            "container command is empty",
        )));
    };

    let mut command = Command::new(program);
    command
        .args(args)
        .envs(&config.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &config.working_dir {
        command.current_dir(dir);
    }

    debug!("Step '{}' running: {}", reference, argv.join(" "));
    let mut child = session.supervisor().spawn(&mut command).await?;

    let pumps: Vec<JoinHandle<()>> = [
        child.stdout.take().map(|out| spawn_pump(out, session.output())),
        child.stderr.take().map(|err| spawn_pump(err, session.output())),
    ]
    .into_iter()
    .flatten()
    .collect();

    let stop_recorder = CancellationToken::new();
    let recorder = child.id().map(|pid| {
        tokio::spawn(monitoring::record(
            pid,
            options.monitor_interval,
            stop_recorder.clone(),
        ))
    });

    let mut tick = tokio::time::interval(options.check_interval);
    let outcome = loop {
        let event = tokio::select! {
            status = child.wait() => Event::Exited(status),
            _ = cancel.cancelled() => Event::Cancelled,
            _ = tick.tick() => Event::Tick,
        };

        match event {
            Event::Exited(Ok(status)) => break CommandOutcome::Exited(exit_code(status)),
            Event::Exited(Err(e)) => {
                warn!("Failed to wait for step '{}': {}", reference, e);
                break CommandOutcome::Exited(1);
            }
            Event::Cancelled => {
                terminate(session, &mut child, reference).await;
                break CommandOutcome::Cancelled;
            }
            Event::Tick => {
                if let Some(node) = breached(session, limits) {
                    warn!("Step '{}' exceeded the time limit of '{}'", reference, node);
                    terminate(session, &mut child, reference).await;
                    break CommandOutcome::TimedOut { node };
                }
            }
        }
    };

    session.supervisor().release().await;
    for pump in pumps {
        if tokio::time::timeout(PUMP_DRAIN_TIMEOUT, pump).await.is_err() {
            debug!("Output of step '{}' still open after exit", reference);
        }
    }
    session.flush_output();

    stop_recorder.cancel();
    if let Some(recorder) = recorder {
        if let Ok(usage) = recorder.await {
            session.record_usage(reference, usage);
        }
    }

    Ok(outcome)
}

fn spawn_pump<R>(mut reader: R, output: OutputSink) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; PUMP_BUFFER_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => write_output(&output, &buf[..n]),
                Err(e) => {
                    debug!("Output pump stopped: {}", e);
                    break;
                }
            }
        }
    })
}

async fn terminate(session: &Session, child: &mut Child, reference: &str) {
    if let Err(e) = session.supervisor().kill().await {
        warn!("Failed to kill process tree of step '{}': {}", reference, e);
    }
    if let Err(e) = child.kill().await {
        debug!("Command of step '{}' already gone: {}", reference, e);
    }
}

/// The innermost node whose paused-excluded elapsed time reached its limit.
fn breached(session: &Session, limits: &[TimeLimit]) -> Option<String> {
    let now = Utc::now();
    let state = session.state();
    limits
        .iter()
        .find(|limit| {
            state
                .step(&limit.reference)
                .map(|step| step.elapsed(now) >= limit.limit)
                .unwrap_or(false)
        })
        .map(|limit| limit.reference.clone())
}

/// Exit code of a finished command; signals map to `128 + signal`.
pub(crate) fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}
