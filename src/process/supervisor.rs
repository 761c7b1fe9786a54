//! Process Supervisor
//!
//! Owns the process tree of the command a step is running. Spawning,
//! pausing, resuming and killing are serialized through two locks: one
//! guarding the in-flight command, one guarding the pause state. A pause
//! that arrives before any command exists is remembered and applied to
//! the next spawn.

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::tree::{ProcessForest, ProcessSignal, ProcessTable, SignalError};

/// Passes over a subtree while killing, to catch processes forked
/// between the listing and the signal.
const KILL_PASSES: usize = 3;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn command: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("failed to list processes: {0}")]
    Listing(String),

    #[error("{} process operation(s) failed: {}", .0.len(), .0.join("; "))]
    Partial(Vec<String>),
}

/// Which processes a pause applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PauseScope {
    /// Only the running command and its descendants
    #[default]
    Subtree,
    /// Every process in the container except the supervisor's ancestry
    Container,
}

/// Supervises the OS process tree of one step runner.
pub struct Supervisor {
    table: Arc<dyn ProcessTable>,
    scope: PauseScope,
    in_flight: Mutex<Option<u32>>,
    paused: Mutex<bool>,
}

impl Supervisor {
    pub fn new(table: Arc<dyn ProcessTable>) -> Self {
        Self {
            table,
            scope: PauseScope::default(),
            in_flight: Mutex::new(None),
            paused: Mutex::new(false),
        }
    }

    /// Sets the pause scope.
    pub fn with_scope(mut self, scope: PauseScope) -> Self {
        self.scope = scope;
        self
    }

    /// Spawns a command and records it as the in-flight command.
    ///
    /// If a pause is pending, the new tree is suspended right away.
    pub async fn spawn(&self, command: &mut Command) -> Result<Child, SupervisorError> {
        let mut in_flight = self.in_flight.lock().await;
        let paused = self.paused.lock().await;

        let child = command.spawn()?;
        *in_flight = child.id();
        debug!("Spawned command with pid {:?}", child.id());

        if *paused {
            if let Some(pid) = child.id() {
                if let Err(e) = self.signal_tree(pid, ProcessSignal::Suspend) {
                    warn!("Failed to apply pending pause to pid {}: {}", pid, e);
                }
            }
        }
        Ok(child)
    }

    /// Forgets the in-flight command once it has exited.
    pub async fn release(&self) {
        *self.in_flight.lock().await = None;
    }

    /// Returns the PID of the in-flight command.
    pub async fn running_pid(&self) -> Option<u32> {
        *self.in_flight.lock().await
    }

    pub async fn is_paused(&self) -> bool {
        *self.paused.lock().await
    }

    /// Suspends the in-flight command tree.
    ///
    /// Returns `Ok(false)` when already paused. With no command in flight
    /// the pause is only recorded.
    pub async fn pause(&self) -> Result<bool, SupervisorError> {
        let in_flight = self.in_flight.lock().await;
        let mut paused = self.paused.lock().await;
        if *paused {
            return Ok(false);
        }

        if let Some(pid) = *in_flight {
            match self.signal_tree(pid, ProcessSignal::Suspend) {
                Ok(()) => {}
                Err(e @ SupervisorError::Partial(_)) => {
                    *paused = true;
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
        *paused = true;
        Ok(true)
    }

    /// Resumes the in-flight command tree.
    ///
    /// Returns `Ok(false)` when not paused.
    pub async fn resume(&self) -> Result<bool, SupervisorError> {
        let in_flight = self.in_flight.lock().await;
        let mut paused = self.paused.lock().await;
        if !*paused {
            return Ok(false);
        }

        if let Some(pid) = *in_flight {
            match self.signal_tree(pid, ProcessSignal::Resume) {
                Ok(()) => {}
                Err(e @ SupervisorError::Partial(_)) => {
                    *paused = false;
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
        *paused = false;
        Ok(true)
    }

    /// Kills the in-flight command tree and clears the pause state.
    pub async fn kill(&self) -> Result<(), SupervisorError> {
        let in_flight = self.in_flight.lock().await;
        let mut paused = self.paused.lock().await;
        *paused = false;

        match *in_flight {
            Some(pid) => self.kill_tree(pid),
            None => Ok(()),
        }
    }

    fn forest(&self) -> Result<(ProcessForest, Vec<String>), SupervisorError> {
        let listing = self.table.list().map_err(SupervisorError::Listing)?;
        let forest = ProcessForest::build(&listing.entries, self.table.current_pid());
        Ok((forest, listing.failures))
    }

    fn signal_tree(&self, root: u32, signal: ProcessSignal) -> Result<(), SupervisorError> {
        let (forest, mut failures) = self.forest()?;

        // Suspend parents first so a frozen parent cannot block delivery to
        // its children; resume in the inverse order.
        let mut order = match self.scope {
            PauseScope::Subtree => forest.subtree(root),
            PauseScope::Container => forest.top_down(),
        };
        if signal == ProcessSignal::Resume {
            order.reverse();
        }

        for pid in order {
            match self.table.signal(pid, signal) {
                Ok(()) | Err(SignalError::NotFound(_)) => {}
                Err(e) => failures.push(e.to_string()),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SupervisorError::Partial(failures))
        }
    }

    fn kill_tree(&self, root: u32) -> Result<(), SupervisorError> {
        let mut killed: HashSet<u32> = HashSet::new();
        let mut failures = Vec::new();

        for _ in 0..KILL_PASSES {
            let (forest, listing_failures) = self.forest()?;
            failures.extend(listing_failures);

            let targets: Vec<u32> = forest
                .subtree(root)
                .into_iter()
                .filter(|pid| !killed.contains(pid))
                .collect();
            if targets.is_empty() {
                break;
            }

            let mut progressed = false;
            for pid in targets {
                match self.table.signal(pid, ProcessSignal::Kill) {
                    Ok(()) | Err(SignalError::NotFound(_)) => {
                        killed.insert(pid);
                        progressed = true;
                    }
                    Err(e) => failures.push(e.to_string()),
                }
            }
            if !progressed {
                break;
            }
        }

        debug!("Killed {} process(es) under pid {}", killed.len(), root);
        if failures.is_empty() {
            Ok(())
        } else {
            failures.dedup();
            Err(SupervisorError::Partial(failures))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::tree::{ProcessEntry, ProcessListing};
    use std::sync::Mutex as StdMutex;

    /// In-memory process table recording every delivered signal.
    struct FakeTable {
        entries: StdMutex<Vec<ProcessEntry>>,
        signals: StdMutex<Vec<(u32, ProcessSignal)>>,
        failing: Vec<u32>,
        broken: bool,
    }

    impl FakeTable {
        fn new(entries: Vec<ProcessEntry>) -> Self {
            Self {
                entries: StdMutex::new(entries),
                signals: StdMutex::new(Vec::new()),
                failing: Vec::new(),
                broken: false,
            }
        }

        fn signals(&self) -> Vec<(u32, ProcessSignal)> {
            self.signals.lock().unwrap().clone()
        }
    }

    impl ProcessTable for FakeTable {
        fn list(&self) -> Result<ProcessListing, String> {
            if self.broken {
                return Err("listing unavailable".to_string());
            }
            Ok(ProcessListing {
                entries: self.entries.lock().unwrap().clone(),
                failures: Vec::new(),
            })
        }

        fn signal(&self, pid: u32, signal: ProcessSignal) -> Result<(), SignalError> {
            if self.failing.contains(&pid) {
                return Err(SignalError::NotDelivered { pid, signal });
            }
            self.signals.lock().unwrap().push((pid, signal));
            if signal == ProcessSignal::Kill {
                self.entries.lock().unwrap().retain(|e| e.pid != pid);
            }
            Ok(())
        }

        fn current_pid(&self) -> u32 {
            10
        }
    }

    fn entries() -> Vec<ProcessEntry> {
        vec![
            ProcessEntry { pid: 1, parent: None },
            ProcessEntry { pid: 10, parent: Some(1) },
            ProcessEntry { pid: 11, parent: Some(10) },
            ProcessEntry { pid: 12, parent: Some(11) },
            ProcessEntry { pid: 13, parent: Some(12) },
            ProcessEntry { pid: 20, parent: Some(1) },
        ]
    }

    async fn with_command(table: Arc<FakeTable>, scope: PauseScope) -> Supervisor {
        let supervisor = Supervisor::new(table).with_scope(scope);
        *supervisor.in_flight.lock().await = Some(11);
        supervisor
    }

    #[tokio::test]
    async fn test_suspend_top_down_resume_bottom_up() {
        let table = Arc::new(FakeTable::new(entries()));
        let supervisor = with_command(table.clone(), PauseScope::Subtree).await;

        assert!(supervisor.pause().await.unwrap());
        assert!(!supervisor.pause().await.unwrap());
        assert!(supervisor.resume().await.unwrap());

        assert_eq!(
            table.signals(),
            vec![
                (11, ProcessSignal::Suspend),
                (12, ProcessSignal::Suspend),
                (13, ProcessSignal::Suspend),
                (13, ProcessSignal::Resume),
                (12, ProcessSignal::Resume),
                (11, ProcessSignal::Resume),
            ]
        );
    }

    #[tokio::test]
    async fn test_container_scope_skips_own_ancestry() {
        let table = Arc::new(FakeTable::new(entries()));
        let supervisor = with_command(table.clone(), PauseScope::Container).await;

        supervisor.pause().await.unwrap();
        let pids: Vec<u32> = table.signals().iter().map(|(pid, _)| *pid).collect();
        assert!(pids.contains(&20));
        assert!(pids.contains(&13));
        assert!(!pids.contains(&1));
        assert!(!pids.contains(&10));
    }

    #[tokio::test]
    async fn test_pause_without_command_is_remembered() {
        let table = Arc::new(FakeTable::new(entries()));
        let supervisor = Supervisor::new(table.clone());

        assert!(supervisor.pause().await.unwrap());
        assert!(supervisor.is_paused().await);
        assert!(table.signals().is_empty());
    }

    #[tokio::test]
    async fn test_kill_subtree() {
        let table = Arc::new(FakeTable::new(entries()));
        let supervisor = with_command(table.clone(), PauseScope::Subtree).await;

        supervisor.kill().await.unwrap();
        let killed: Vec<u32> = table.signals().iter().map(|(pid, _)| *pid).collect();
        assert_eq!(killed, vec![11, 12, 13]);
        assert!(!supervisor.is_paused().await);
    }

    #[tokio::test]
    async fn test_partial_failures_are_aggregated() {
        let mut fake = FakeTable::new(entries());
        fake.failing = vec![12];
        let table = Arc::new(fake);
        let supervisor = with_command(table.clone(), PauseScope::Subtree).await;

        match supervisor.pause().await {
            Err(SupervisorError::Partial(failures)) => assert_eq!(failures.len(), 1),
            other => panic!("expected partial failure, got {:?}", other),
        }
        // Remaining processes were still signalled
        assert_eq!(table.signals().len(), 2);
        assert!(supervisor.is_paused().await);
    }

    #[tokio::test]
    async fn test_listing_failure_fails_only_the_call() {
        let mut fake = FakeTable::new(entries());
        fake.broken = true;
        let supervisor = with_command(Arc::new(fake), PauseScope::Subtree).await;

        assert!(matches!(
            supervisor.pause().await,
            Err(SupervisorError::Listing(_))
        ));
        assert!(!supervisor.is_paused().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_records_in_flight_command() {
        let supervisor = Supervisor::new(Arc::new(crate::process::SysinfoProcessTable::new()));
        let mut command = Command::new("sleep");
        command.arg("5").kill_on_drop(true);

        let mut child = supervisor.spawn(&mut command).await.unwrap();
        assert_eq!(supervisor.running_pid().await, child.id());

        supervisor.kill().await.unwrap();
        let status = child.wait().await.unwrap();
        assert!(!status.success());

        supervisor.release().await;
        assert!(supervisor.running_pid().await.is_none());
    }
}
