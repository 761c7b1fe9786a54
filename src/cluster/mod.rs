//! Cluster Collaborator
//!
//! What the consumer side needs from the container platform: compute units
//! and their container statuses, lifecycle events, logs and bulk deletion.
//! The platform itself is reached through [`ClusterClient`];
//! [`MemoryCluster`] implements it in memory for tests and local runs.

pub mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

pub use memory::MemoryCluster;

/// Lifecycle state of one container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum ContainerState {
    Waiting {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Running {
        started_at: DateTime<Utc>,
    },
    Terminated {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        started_at: Option<DateTime<Utc>>,
        finished_at: DateTime<Utc>,
        exit_code: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    pub state: ContainerState,
}

impl ContainerStatus {
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        match &self.state {
            ContainerState::Waiting { .. } => None,
            ContainerState::Running { started_at } => Some(*started_at),
            ContainerState::Terminated { started_at, .. } => *started_at,
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self.state, ContainerState::Terminated { .. })
    }
}

/// One scheduled execution: a group of containers run in order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeUnit {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub containers: Vec<ContainerStatus>,
    /// Platform-level reason the unit failed, when it did
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl ComputeUnit {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn container(&self, name: &str) -> Option<&ContainerStatus> {
        self.containers.iter().find(|c| c.name == name)
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled_at.is_some()
    }
}

/// A lifecycle event reported by the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub time: DateTime<Utc>,
    pub reason: String,
    pub message: String,
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

/// Equality-based label selector (`key=value,key2=value2`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Selector(BTreeMap<String, String>);

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// True when every requirement is present in `labels`.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|(k, v)| labels.get(k) == Some(v))
    }
}

impl FromStr for Selector {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut selector = Selector::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| ClusterError::Other(format!("invalid selector term '{}'", part)))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(ClusterError::Other(format!("empty key in selector term '{}'", part)));
            }
            selector.0.insert(key.to_string(), value.trim().to_string());
        }
        Ok(selector)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let terms: Vec<String> = self.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        f.write_str(&terms.join(","))
    }
}

/// Options for reading a container's output.
#[derive(Debug, Clone, PartialEq)]
pub struct LogOptions {
    pub container: String,
    pub follow: bool,
    pub timestamps: bool,
    /// Only lines at or after this time
    pub since: Option<DateTime<Utc>>,
}

impl LogOptions {
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            follow: true,
            timestamps: true,
            since: None,
        }
    }
}

pub type LogStream = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClusterError {
    #[error("connection reset: {0}")]
    ConnectionReset(String),

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    #[error("proxy error: {0}")]
    Proxy(String),

    #[error("container is waiting to start: {0}")]
    ContainerWaiting(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl ClusterError {
    /// Errors worth retrying the same request for.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClusterError::ConnectionReset(_)
                | ClusterError::Tls(_)
                | ClusterError::Proxy(_)
                | ClusterError::ContainerWaiting(_)
        )
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let (base, max) = match self {
            ClusterError::ConnectionReset(_) => (Duration::from_millis(100), Duration::from_secs(2)),
            ClusterError::Tls(_) | ClusterError::Proxy(_) => {
                (Duration::from_millis(500), Duration::from_secs(5))
            }
            ClusterError::ContainerWaiting(_) => (Duration::from_secs(1), Duration::from_secs(1)),
            ClusterError::NotFound(_) | ClusterError::Other(_) => (Duration::ZERO, Duration::ZERO),
        };
        exponential_backoff(base, max, attempt)
    }
}

/// `base * 2^attempt`, capped at `max`.
pub fn exponential_backoff(base: Duration, max: Duration, attempt: u32) -> Duration {
    let base_ms = base.as_millis();
    if base_ms == 0 {
        return Duration::ZERO;
    }
    let max_ms = max.as_millis().max(base_ms);
    let multiplier = 1u128 << attempt.min(20);
    let millis = base_ms.saturating_mul(multiplier).min(max_ms);
    Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
}

/// Access to the container platform.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn list_units(&self, selector: &Selector) -> Result<Vec<ComputeUnit>, ClusterError>;

    /// Streams every change to a matching unit.
    async fn watch_units(
        &self,
        selector: &Selector,
    ) -> Result<mpsc::Receiver<ComputeUnit>, ClusterError>;

    async fn list_events(&self, selector: &Selector) -> Result<Vec<ClusterEvent>, ClusterError>;

    async fn watch_events(
        &self,
        selector: &Selector,
    ) -> Result<mpsc::Receiver<ClusterEvent>, ClusterError>;

    /// Deletes every matching unit, returning how many were removed.
    async fn delete_collection(&self, selector: &Selector) -> Result<usize, ClusterError>;

    async fn logs(&self, unit: &str, options: &LogOptions) -> Result<LogStream, ClusterError>;
}
