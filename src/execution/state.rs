//! Execution State
//!
//! The step table driven by the state machine, persisted to a single JSON
//! file after every transition so a restarted runner can pick up where
//! the previous one stopped.
//!
//! The file is written world-readable and world-writable: containers of
//! the same compute unit may run under different users and all of them
//! read and write it.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::monitoring::ResourceUsage;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to access state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid state file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    #[default]
    NotStarted,
    Running,
    Passed,
    Failed,
    Timeout,
    Aborted,
    Skipped,
}

impl StepStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Passed | Self::Failed | Self::Timeout | Self::Aborted | Self::Skipped
        )
    }

    /// Passed or skipped.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Passed | Self::Skipped)
    }

    /// Failed, timed out or aborted.
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Timeout | Self::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not-started",
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Aborted => "aborted",
            Self::Skipped => "skipped",
        }
    }

    /// Folds child statuses the way a group step resolves them.
    pub fn fold<I: IntoIterator<Item = StepStatus>>(statuses: I) -> StepStatus {
        let mut result = StepStatus::Skipped;
        let mut seen = false;
        for status in statuses {
            seen = true;
            result = match (result, status) {
                (Self::Aborted, _) | (_, Self::Aborted) => Self::Aborted,
                (Self::Timeout, _) | (_, Self::Timeout) => Self::Timeout,
                (Self::Failed, _) | (_, Self::Failed) => Self::Failed,
                (Self::Running, _) | (_, Self::Running) => Self::Running,
                (Self::NotStarted, _) | (_, Self::NotStarted) => Self::NotStarted,
                (Self::Passed, _) | (_, Self::Passed) => Self::Passed,
                _ => Self::Skipped,
            };
        }
        if seen {
            result
        } else {
            Self::Passed
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not-started" | "queued" => Ok(Self::NotStarted),
            "running" | "paused" => Ok(Self::Running),
            "passed" => Ok(Self::Passed),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            "aborted" => Ok(Self::Aborted),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown step status '{}'", other)),
        }
    }
}

/// A span during which a step was paused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseInterval {
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub count: u32,
    pub until: String,
}

/// Producer-side state of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepState {
    pub reference: String,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub excluded_paused_duration: Duration,
    #[serde(default)]
    pub iteration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub pause_intervals: Vec<PauseInterval>,
    /// Pause requested before the step started
    #[serde(default)]
    pub pause_requested: bool,
}

impl StepState {
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            status: StepStatus::NotStarted,
            condition: None,
            parents: Vec::new(),
            timeout: None,
            retry: None,
            result: None,
            started_at: None,
            finished_at: None,
            excluded_paused_duration: Duration::ZERO,
            iteration: 0,
            exit_code: None,
            pause_intervals: Vec::new(),
            pause_requested: false,
        }
    }

    /// Moves the step forward. Terminal statuses are never replaced and a
    /// started step never goes back to not-started.
    pub fn set_status(&mut self, status: StepStatus) -> bool {
        if self.status.is_terminal() || self.status == status {
            return false;
        }
        if status == StepStatus::NotStarted {
            return false;
        }
        self.status = status;
        true
    }

    pub fn is_paused(&self) -> bool {
        self.pause_intervals
            .last()
            .map(|p| p.ended_at.is_none())
            .unwrap_or(false)
    }

    /// Opens a pause interval unless one is already open.
    pub fn open_pause(&mut self, at: DateTime<Utc>) -> bool {
        if self.is_paused() {
            return false;
        }
        self.pause_intervals.push(PauseInterval {
            started_at: at,
            ended_at: None,
        });
        true
    }

    /// Closes the open pause interval and folds it into the excluded time.
    pub fn close_pause(&mut self, at: DateTime<Utc>) -> bool {
        let Some(interval) = self.pause_intervals.last_mut() else {
            return false;
        };
        if interval.ended_at.is_some() {
            return false;
        }
        let at = at.max(interval.started_at);
        interval.ended_at = Some(at);
        let span = (at - interval.started_at).to_std().unwrap_or(Duration::ZERO);
        self.excluded_paused_duration += span;
        true
    }

    /// Wall time since start, minus every paused span.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        let Some(started) = self.started_at else {
            return Duration::ZERO;
        };
        let total = (now - started).to_std().unwrap_or(Duration::ZERO);

        let mut excluded = self.excluded_paused_duration;
        if let Some(open) = self.pause_intervals.last().filter(|p| p.ended_at.is_none()) {
            excluded += (now - open.started_at).to_std().unwrap_or(Duration::ZERO);
        }
        total.saturating_sub(excluded)
    }
}

/// Persisted state of every step the runner knows about.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    #[serde(skip)]
    path: PathBuf,

    /// Steps keyed by reference
    pub steps: BTreeMap<String, StepState>,

    /// Reference of the step currently executing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<String>,

    /// Expression resolving the aggregate status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_status: Option<String>,

    /// Resource usage per executed step
    #[serde(default)]
    pub usage: BTreeMap<String, ResourceUsage>,

    /// Last time the state was updated
    pub updated_at: DateTime<Utc>,
}

impl ExecutionState {
    /// Creates an empty state bound to a file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            steps: BTreeMap::new(),
            current: None,
            current_status: None,
            usage: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    /// Loads the state file, or starts fresh when none exists yet.
    pub fn load_or_new(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = path.into();
        if path.exists() {
            Self::load(&path)
        } else {
            info!("Starting fresh execution state at {}", path.display());
            Ok(Self::new(path))
        }
    }

    /// Loads state from a file.
    pub fn load(path: &Path) -> Result<Self, StateError> {
        let content = fs::read_to_string(path).map_err(|source| StateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut state: ExecutionState =
            serde_json::from_str(&content).map_err(|source| StateError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        state.path = path.to_path_buf();

        info!(
            "Loaded execution state from {} ({} steps)",
            path.display(),
            state.steps.len()
        );
        Ok(state)
    }

    /// Saves the state to its file.
    pub fn save(&mut self) -> Result<(), StateError> {
        let io_err = |source| StateError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        self.updated_at = Utc::now();
        let json = serde_json::to_string_pretty(self).map_err(|source| StateError::Json {
            path: self.path.clone(),
            source,
        })?;
        fs::write(&self.path, json).map_err(io_err)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o666)).map_err(io_err)?;
        }

        debug!("Saved execution state to {}", self.path.display());
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn step(&self, reference: &str) -> Option<&StepState> {
        self.steps.get(reference)
    }

    /// Returns the step, creating it on first reference.
    pub fn step_mut(&mut self, reference: &str) -> &mut StepState {
        self.steps
            .entry(reference.to_string())
            .or_insert_with(|| StepState::new(reference))
    }

    pub fn status_of(&self, reference: &str) -> StepStatus {
        self.steps
            .get(reference)
            .map(|s| s.status)
            .unwrap_or_default()
    }

    pub fn statuses(&self) -> HashMap<String, StepStatus> {
        self.steps
            .iter()
            .map(|(reference, step)| (reference.clone(), step.status))
            .collect()
    }

    /// Steps nested anywhere below `reference`.
    pub fn descendants(&self, reference: &str) -> Vec<String> {
        self.steps
            .values()
            .filter(|s| s.parents.iter().any(|p| p == reference))
            .map(|s| s.reference.clone())
            .collect()
    }

    /// Steps nested directly below `reference`.
    pub fn children(&self, reference: &str) -> Vec<String> {
        self.steps
            .values()
            .filter(|s| s.parents.last().map(|p| p == reference).unwrap_or(false))
            .map(|s| s.reference.clone())
            .collect()
    }
}
