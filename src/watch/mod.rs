//! Watch Orchestrator
//!
//! Follows one execution from the outside. Containers are watched in plan
//! order: wait until the container starts, stream its logs, wait until it
//! terminates. Unit changes, lifecycle events and log items are merged into
//! a single ordered [`Notification`] stream, and every change to the
//! reconciled result is republished.
//!
//! Watch streams can silently drop changes, so a unit that stays quiet for
//! longer than the silence timeout is listed again.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cluster::{ClusterClient, ClusterError, ClusterEvent, ComputeUnit, ContainerState, Selector};
use crate::config::{ReaderConfig, WatchConfig};
use crate::logs::{LogItem, LogStreamReader, ReaderError};
use crate::notifier::{ExecutionResult, Notifier, Plan, PlannedContainer};
use crate::protocol::Instruction;

type LogReceiver = mpsc::Receiver<Result<LogItem, ReaderError>>;

/// One item of the unified stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Unit(ComputeUnit),
    Event(ClusterEvent),
    Output {
        container: String,
        time: DateTime<Utc>,
        bytes: Vec<u8>,
    },
    Instruction {
        container: String,
        time: DateTime<Utc>,
        instruction: Instruction,
    },
    /// The reconciled result changed
    Result(ExecutionResult),
    /// Last notification of a completed watch
    Finished(ExecutionResult),
    /// Last notification of a failed watch
    Error(String),
}

impl Notification {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Notification::Finished(_) | Notification::Error(_))
    }
}

/// Why the watch loop stopped early.
#[derive(Debug)]
enum Stop {
    Cancelled,
    /// Nobody listens anymore
    Closed,
    Failed(String),
}

enum Wake {
    Log(Result<LogItem, ReaderError>),
    LogsDone,
    Other,
}

pub struct WatchOrchestrator {
    client: Arc<dyn ClusterClient>,
    unit: String,
    selector: Selector,
    plan: Plan,
    config: WatchConfig,
    cancel: CancellationToken,
}

impl WatchOrchestrator {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        unit: impl Into<String>,
        selector: Selector,
        plan: Plan,
        config: WatchConfig,
    ) -> Self {
        Self {
            client,
            unit: unit.into(),
            selector,
            plan,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Deletes every unit of the execution.
    pub async fn cleanup(&self) -> Result<usize, ClusterError> {
        let deleted = self.client.delete_collection(&self.selector).await?;
        info!("Cleaned up {} unit(s) matching '{}'", deleted, self.selector);
        Ok(deleted)
    }

    /// Starts watching in a background task.
    ///
    /// The stream ends with exactly one terminal notification unless the
    /// receiver is dropped first.
    pub fn spawn(self) -> mpsc::Receiver<Notification> {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        tokio::spawn(async move {
            self.run(tx).await;
        });
        rx
    }

    pub async fn run(self, tx: mpsc::Sender<Notification>) {
        let mut watcher = match Watcher::open(&self, tx.clone()).await {
            Ok(watcher) => watcher,
            Err(e) => {
                warn!("Cannot watch unit '{}': {}", self.unit, e);
                let _ = tx.send(Notification::Error(e.to_string())).await;
                return;
            }
        };

        let outcome = if self.config.follow {
            watcher.follow(&self.plan.containers).await
        } else {
            watcher.read_finished(&self.plan.containers).await
        };

        match outcome {
            Ok(()) => watcher.finish().await,
            Err(Stop::Cancelled) => {
                info!("Watch of unit '{}' cancelled", self.unit);
                watcher.notifier.finalize(Utc::now(), true);
                watcher.finish().await;
            }
            Err(Stop::Failed(message)) => {
                warn!("Watch of unit '{}' failed: {}", self.unit, message);
                let _ = tx.send(Notification::Error(message)).await;
            }
            Err(Stop::Closed) => debug!("Notification receiver for '{}' dropped", self.unit),
        }
    }
}

/// State of one running watch.
struct Watcher {
    client: Arc<dyn ClusterClient>,
    unit: String,
    selector: Selector,
    config: WatchConfig,
    cancel: CancellationToken,
    tx: mpsc::Sender<Notification>,
    units: Option<mpsc::Receiver<ComputeUnit>>,
    events: Option<mpsc::Receiver<ClusterEvent>>,
    notifier: Notifier,
    latest: Option<ComputeUnit>,
    last_lifecycle: Instant,
}

impl Watcher {
    async fn open(
        orchestrator: &WatchOrchestrator,
        tx: mpsc::Sender<Notification>,
    ) -> Result<Self, ClusterError> {
        let client = orchestrator.client.clone();
        let selector = orchestrator.selector.clone();
        let (units, events) = if orchestrator.config.follow {
            (
                Some(client.watch_units(&selector).await?),
                Some(client.watch_events(&selector).await?),
            )
        } else {
            (None, None)
        };

        let mut watcher = Self {
            client,
            unit: orchestrator.unit.clone(),
            selector,
            config: orchestrator.config.clone(),
            cancel: orchestrator.cancel.clone(),
            tx,
            units,
            events,
            notifier: Notifier::new(orchestrator.plan.clone()),
            latest: None,
            last_lifecycle: Instant::now(),
        };

        // Watches only report changes from now on
        let events = watcher.client.list_events(&watcher.selector).await?;
        for event in events {
            if watcher.apply_event(event).await.is_err() {
                break;
            }
        }
        let _ = watcher.relist().await;
        Ok(watcher)
    }

    /// Watches containers one after another while they run.
    async fn follow(&mut self, containers: &[PlannedContainer]) -> Result<(), Stop> {
        for container in containers {
            let name = container.name.as_str();

            while !self.started(name) {
                if self.unit_completed() {
                    info!("Unit '{}' completed before container '{}' started", self.unit, name);
                    return Ok(());
                }
                self.wait(None).await?;
            }

            info!("Streaming logs of container '{}'", name);
            let (finished_tx, finished_rx) = watch::channel(self.terminated(name));
            let mut logs = self.reader(name, finished_rx, self.config.reader.clone());
            loop {
                match self.wait(Some(&mut logs)).await? {
                    Wake::Log(Ok(item)) => self.apply_log(name, item).await?,
                    Wake::Log(Err(e)) => {
                        return Err(Stop::Failed(format!("logs of container '{}': {}", name, e)))
                    }
                    Wake::LogsDone => break,
                    Wake::Other => {}
                }
                if self.terminated(name) {
                    let _ = finished_tx.send(true);
                }
            }

            while !self.terminated(name) && !self.unit_completed() {
                self.wait(None).await?;
            }

            if self.container_failed(container) {
                info!(
                    "Container '{}' did not succeed, not watching the rest",
                    name
                );
                return Ok(());
            }
        }
        Ok(())
    }

    /// Reads the logs of a finished execution once.
    async fn read_finished(&mut self, containers: &[PlannedContainer]) -> Result<(), Stop> {
        let reader_config = ReaderConfig {
            follow: false,
            ..self.config.reader.clone()
        };
        for container in containers {
            if !self.started(&container.name) {
                continue;
            }
            let (_finished_tx, finished_rx) = watch::channel(true);
            let mut logs = self.reader(&container.name, finished_rx, reader_config.clone());
            loop {
                let item = tokio::select! {
                    _ = self.cancel.cancelled() => return Err(Stop::Cancelled),
                    item = logs.recv() => item,
                };
                match item {
                    Some(Ok(item)) => self.apply_log(&container.name, item).await?,
                    Some(Err(e)) => {
                        warn!("Skipping logs of container '{}': {}", container.name, e);
                        break;
                    }
                    None => break,
                }
            }
        }
        Ok(())
    }

    /// Waits for the platform to confirm completion, then publishes the
    /// final result.
    async fn finish(&mut self) {
        if !self.notifier.is_completed() && self.config.follow {
            let deadline = Instant::now() + self.config.silence_timeout;
            while !self.unit_completed() && Instant::now() < deadline {
                let wait = tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => Ok(Wake::Other),
                    wake = self.wait(None) => wake,
                };
                if wait.is_err() {
                    break;
                }
            }
        }
        if !self.notifier.is_completed() {
            self.notifier.finalize(Utc::now(), true);
        }
        let _ = self
            .tx
            .send(Notification::Finished(self.notifier.result()))
            .await;
    }

    fn reader(&self, container: &str, finished: watch::Receiver<bool>, config: ReaderConfig) -> LogReceiver {
        LogStreamReader::new(self.client.clone(), self.unit.clone(), container, finished, config)
            .with_cancellation(self.cancel.child_token())
            .spawn(None)
    }

    /// Handles the next input of any kind.
    async fn wait(&mut self, logs: Option<&mut LogReceiver>) -> Result<Wake, Stop> {
        let silence_deadline = self.last_lifecycle + self.config.silence_timeout;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Stop::Cancelled),
            item = recv_or_pending(logs) => Ok(match item {
                Some(item) => Wake::Log(item),
                None => Wake::LogsDone,
            }),
            unit = recv_or_pending(self.units.as_mut()) => {
                match unit {
                    Some(unit) => self.apply_unit(unit).await?,
                    None => {
                        debug!("Unit watch closed, relying on re-listing");
                        self.units = None;
                    }
                }
                Ok(Wake::Other)
            }
            event = recv_or_pending(self.events.as_mut()) => {
                match event {
                    Some(event) => self.apply_event(event).await?,
                    None => self.events = None,
                }
                Ok(Wake::Other)
            }
            _ = tokio::time::sleep_until(silence_deadline) => {
                debug!("No lifecycle news for unit '{}', listing again", self.unit);
                self.relist().await?;
                Ok(Wake::Other)
            }
        }
    }

    async fn relist(&mut self) -> Result<(), Stop> {
        self.last_lifecycle = Instant::now();
        match self.client.list_units(&self.selector).await {
            Ok(units) => {
                if let Some(unit) = units.into_iter().find(|u| u.name == self.unit) {
                    self.apply_unit(unit).await?;
                }
                Ok(())
            }
            Err(e) if e.is_transient() => {
                warn!("Listing unit '{}' failed: {}", self.unit, e);
                Ok(())
            }
            Err(e) => Err(Stop::Failed(format!("listing unit '{}': {}", self.unit, e))),
        }
    }

    async fn apply_unit(&mut self, unit: ComputeUnit) -> Result<(), Stop> {
        if unit.name != self.unit {
            return Ok(());
        }
        self.last_lifecycle = Instant::now();
        if self.latest.as_ref() == Some(&unit) {
            return Ok(());
        }
        let changed = self.notifier.align_unit(&unit);
        self.latest = Some(unit.clone());
        self.publish(Notification::Unit(unit)).await?;
        if changed {
            self.publish_result().await?;
        }
        Ok(())
    }

    async fn apply_event(&mut self, event: ClusterEvent) -> Result<(), Stop> {
        if event.unit != self.unit {
            return Ok(());
        }
        self.last_lifecycle = Instant::now();
        let changed = self.notifier.align_event(&event);
        self.publish(Notification::Event(event)).await?;
        if changed {
            self.publish_result().await?;
        }
        Ok(())
    }

    async fn apply_log(&mut self, container: &str, item: LogItem) -> Result<(), Stop> {
        match item {
            LogItem::Text { time, bytes } => {
                self.publish(Notification::Output {
                    container: container.to_string(),
                    time,
                    bytes,
                })
                .await
            }
            LogItem::Instruction {
                time,
                instruction,
                value_error,
            } => {
                if let Some(e) = value_error {
                    warn!("Instruction from container '{}' has a bad value: {}", container, e);
                }
                let changed = self.notifier.instruction(time, &instruction);
                self.publish(Notification::Instruction {
                    container: container.to_string(),
                    time,
                    instruction,
                })
                .await?;
                if changed {
                    self.publish_result().await?;
                }
                Ok(())
            }
        }
    }

    async fn publish(&self, notification: Notification) -> Result<(), Stop> {
        self.tx.send(notification).await.map_err(|_| Stop::Closed)
    }

    async fn publish_result(&self) -> Result<(), Stop> {
        self.publish(Notification::Result(self.notifier.result())).await
    }

    fn container_state(&self, name: &str) -> Option<&ContainerState> {
        self.latest
            .as_ref()
            .and_then(|u| u.container(name))
            .map(|c| &c.state)
    }

    fn started(&self, name: &str) -> bool {
        matches!(
            self.container_state(name),
            Some(ContainerState::Running { .. } | ContainerState::Terminated { .. })
        )
    }

    fn terminated(&self, name: &str) -> bool {
        matches!(self.container_state(name), Some(ContainerState::Terminated { .. }))
    }

    fn unit_completed(&self) -> bool {
        self.latest
            .as_ref()
            .map(|u| u.completed_at.is_some())
            .unwrap_or(false)
    }

    /// Nonzero exit, or any of its steps failed or was aborted.
    fn container_failed(&self, container: &PlannedContainer) -> bool {
        if let Some(ContainerState::Terminated { exit_code, .. }) = self.container_state(&container.name) {
            if *exit_code != 0 {
                return true;
            }
        }
        let result = self.notifier.result();
        container.steps.iter().any(|reference| {
            let status = if reference == crate::protocol::INIT_STEP_REF {
                result.init_step.status
            } else {
                result.steps.get(reference).map(|s| s.status).unwrap_or_default()
            };
            status.is_failure()
        })
    }
}

async fn recv_or_pending<T>(rx: Option<&mut mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
