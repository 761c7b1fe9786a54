//! In-memory cluster.
//!
//! Holds units, events and per-container log lines. Log reads end at the
//! current content, like a followed stream the platform closed early, and a
//! one-shot cut can shorten the next read to simulate log rotation.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::Cursor;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use log::debug;
use tokio::sync::mpsc;

use super::{
    ClusterClient, ClusterError, ClusterEvent, ComputeUnit, ContainerState, LogOptions, LogStream,
    Selector,
};

const WATCH_CAPACITY: usize = 64;

#[derive(Default)]
struct LogBuffer {
    lines: Vec<(DateTime<Utc>, Vec<u8>)>,
    /// Lines the next read stops after
    cut: Option<usize>,
}

#[derive(Default)]
struct Inner {
    units: BTreeMap<String, ComputeUnit>,
    events: Vec<ClusterEvent>,
    logs: HashMap<(String, String), LogBuffer>,
    unit_watchers: Vec<(Selector, mpsc::Sender<ComputeUnit>)>,
    event_watchers: Vec<(Selector, mpsc::Sender<ClusterEvent>)>,
    log_failures: VecDeque<ClusterError>,
    log_requests: Vec<LogOptions>,
}

#[derive(Default)]
pub struct MemoryCluster {
    inner: Mutex<Inner>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates or replaces a unit and notifies matching watchers.
    pub fn apply_unit(&self, unit: ComputeUnit) {
        let mut inner = self.lock();
        inner
            .unit_watchers
            .retain(|(selector, tx)| !selector.matches(&unit.labels) || tx.try_send(unit.clone()).is_ok());
        inner.units.insert(unit.name.clone(), unit);
    }

    /// Records an event and notifies matching watchers.
    pub fn push_event(&self, event: ClusterEvent) {
        let mut inner = self.lock();
        let labels = inner
            .units
            .get(&event.unit)
            .map(|u| u.labels.clone())
            .unwrap_or_default();
        inner
            .event_watchers
            .retain(|(selector, tx)| !selector.matches(&labels) || tx.try_send(event.clone()).is_ok());
        inner.events.push(event);
    }

    /// Appends one output line (without trailing newline) to a container.
    pub fn push_log(&self, unit: &str, container: &str, time: DateTime<Utc>, line: impl Into<Vec<u8>>) {
        self.lock()
            .logs
            .entry((unit.to_string(), container.to_string()))
            .or_default()
            .lines
            .push((time, line.into()));
    }

    /// Makes the next read of a container stop after `lines` lines.
    pub fn cut_next_read(&self, unit: &str, container: &str, lines: usize) {
        self.lock()
            .logs
            .entry((unit.to_string(), container.to_string()))
            .or_default()
            .cut = Some(lines);
    }

    /// Makes the next `logs` call fail.
    pub fn fail_next_logs(&self, error: ClusterError) {
        self.lock().log_failures.push_back(error);
    }

    /// Every `logs` request received so far.
    pub fn log_requests(&self) -> Vec<LogOptions> {
        self.lock().log_requests.clone()
    }

    pub fn unit(&self, name: &str) -> Option<ComputeUnit> {
        self.lock().units.get(name).cloned()
    }
}

#[async_trait]
impl ClusterClient for MemoryCluster {
    async fn list_units(&self, selector: &Selector) -> Result<Vec<ComputeUnit>, ClusterError> {
        Ok(self
            .lock()
            .units
            .values()
            .filter(|u| selector.matches(&u.labels))
            .cloned()
            .collect())
    }

    async fn watch_units(
        &self,
        selector: &Selector,
    ) -> Result<mpsc::Receiver<ComputeUnit>, ClusterError> {
        let (tx, rx) = mpsc::channel(WATCH_CAPACITY);
        self.lock().unit_watchers.push((selector.clone(), tx));
        Ok(rx)
    }

    async fn list_events(&self, selector: &Selector) -> Result<Vec<ClusterEvent>, ClusterError> {
        let inner = self.lock();
        Ok(inner
            .events
            .iter()
            .filter(|e| {
                inner
                    .units
                    .get(&e.unit)
                    .map(|u| selector.matches(&u.labels))
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn watch_events(
        &self,
        selector: &Selector,
    ) -> Result<mpsc::Receiver<ClusterEvent>, ClusterError> {
        let (tx, rx) = mpsc::channel(WATCH_CAPACITY);
        self.lock().event_watchers.push((selector.clone(), tx));
        Ok(rx)
    }

    async fn delete_collection(&self, selector: &Selector) -> Result<usize, ClusterError> {
        let mut inner = self.lock();
        let before = inner.units.len();
        inner.units.retain(|_, u| !selector.matches(&u.labels));
        let deleted = before - inner.units.len();
        debug!("Deleted {} unit(s) matching '{}'", deleted, selector);
        Ok(deleted)
    }

    async fn logs(&self, unit: &str, options: &LogOptions) -> Result<LogStream, ClusterError> {
        let mut inner = self.lock();
        inner.log_requests.push(options.clone());
        if let Some(error) = inner.log_failures.pop_front() {
            return Err(error);
        }

        let waiting = match inner
            .units
            .get(unit)
            .ok_or_else(|| ClusterError::NotFound(unit.to_string()))?
            .container(&options.container)
        {
            None => true,
            Some(status) => matches!(status.state, ContainerState::Waiting { .. }),
        };
        if waiting {
            return Err(ClusterError::ContainerWaiting(options.container.clone()));
        }

        let buffer = inner
            .logs
            .entry((unit.to_string(), options.container.clone()))
            .or_default();
        let limit = buffer.cut.take().unwrap_or(usize::MAX);

        let mut content = Vec::new();
        let selected = buffer
            .lines
            .iter()
            .filter(|(time, _)| options.since.map(|since| *time >= since).unwrap_or(true))
            .take(limit);
        for (time, line) in selected {
            if options.timestamps {
                content.extend_from_slice(time.to_rfc3339_opts(SecondsFormat::Nanos, true).as_bytes());
                content.push(b' ');
            }
            content.extend_from_slice(line);
            content.push(b'\n');
        }
        Ok(Box::new(Cursor::new(content)))
    }
}
