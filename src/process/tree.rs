//! Process Tree Capability
//!
//! Lists processes and delivers signals. The [`ProcessTable`] trait is the
//! seam; [`SysinfoProcessTable`] is the real implementation and tests
//! inject their own.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use sysinfo::{Pid, ProcessRefreshKind, Signal, System};
use thiserror::Error;

/// One row of a process listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub parent: Option<u32>,
}

/// Result of listing the system's processes.
///
/// `failures` describes entries that could not be read; the listing is
/// still usable.
#[derive(Debug, Clone, Default)]
pub struct ProcessListing {
    pub entries: Vec<ProcessEntry>,
    pub failures: Vec<String>,
}

/// Signals the supervisor sends to a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    Suspend,
    Resume,
    Kill,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalError {
    #[error("process {0} no longer exists")]
    NotFound(u32),

    #[error("{signal:?} was not delivered to process {pid}")]
    NotDelivered { pid: u32, signal: ProcessSignal },

    #[error("{0:?} is not supported on this platform")]
    Unsupported(ProcessSignal),
}

/// Injectable access to the OS process table.
pub trait ProcessTable: Send + Sync {
    /// Lists every visible process.
    fn list(&self) -> Result<ProcessListing, String>;

    /// Sends a signal to one process.
    fn signal(&self, pid: u32, signal: ProcessSignal) -> Result<(), SignalError>;

    /// PID of the supervising process itself.
    fn current_pid(&self) -> u32 {
        std::process::id()
    }
}

/// [`ProcessTable`] backed by `sysinfo`.
pub struct SysinfoProcessTable {
    system: Mutex<System>,
}

impl SysinfoProcessTable {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SysinfoProcessTable {
    fn list(&self) -> Result<ProcessListing, String> {
        let mut system = self
            .system
            .lock()
            .map_err(|_| "process table lock poisoned".to_string())?;
        system.refresh_processes_specifics(ProcessRefreshKind::new());

        let entries = system
            .processes()
            .iter()
            .map(|(pid, process)| ProcessEntry {
                pid: pid.as_u32(),
                parent: process.parent().map(|p| p.as_u32()),
            })
            .collect();

        Ok(ProcessListing {
            entries,
            failures: Vec::new(),
        })
    }

    fn signal(&self, pid: u32, signal: ProcessSignal) -> Result<(), SignalError> {
        let mut system = self
            .system
            .lock()
            .map_err(|_| SignalError::NotDelivered { pid, signal })?;

        let target = Pid::from_u32(pid);
        if !system.refresh_process(target) {
            return Err(SignalError::NotFound(pid));
        }
        let process = system.process(target).ok_or(SignalError::NotFound(pid))?;

        let os_signal = match signal {
            ProcessSignal::Suspend => Signal::Stop,
            ProcessSignal::Resume => Signal::Continue,
            ProcessSignal::Kill => Signal::Kill,
        };
        match process.kill_with(os_signal) {
            Some(true) => Ok(()),
            Some(false) => Err(SignalError::NotDelivered { pid, signal }),
            None => Err(SignalError::Unsupported(signal)),
        }
    }
}

/// Parent/child view over a listing.
///
/// The supervisor's own PID and all its ancestors are virtual: they are
/// traversed but never returned, so suspending "everything" cannot
/// suspend the supervisor itself.
#[derive(Debug, Clone)]
pub struct ProcessForest {
    children: HashMap<u32, Vec<u32>>,
    roots: Vec<u32>,
    virtual_nodes: HashSet<u32>,
}

impl ProcessForest {
    pub fn build(entries: &[ProcessEntry], own_pid: u32) -> Self {
        let parents: HashMap<u32, Option<u32>> =
            entries.iter().map(|e| (e.pid, e.parent)).collect();

        let mut virtual_nodes = HashSet::new();
        let mut cursor = Some(own_pid);
        while let Some(pid) = cursor {
            if !virtual_nodes.insert(pid) {
                break;
            }
            cursor = parents.get(&pid).copied().flatten();
        }

        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        let mut roots = Vec::new();
        for entry in entries {
            match entry.parent {
                Some(parent) if parent != entry.pid && parents.contains_key(&parent) => {
                    children.entry(parent).or_default().push(entry.pid)
                }
                _ => roots.push(entry.pid),
            }
        }
        roots.sort_unstable();
        for list in children.values_mut() {
            list.sort_unstable();
        }

        Self {
            children,
            roots,
            virtual_nodes,
        }
    }

    /// Every real process, parents before children.
    pub fn top_down(&self) -> Vec<u32> {
        self.walk(self.roots.iter().copied())
    }

    /// Every real process, children before parents.
    pub fn bottom_up(&self) -> Vec<u32> {
        let mut order = self.top_down();
        order.reverse();
        order
    }

    /// The subtree rooted at `root`, parents before children.
    pub fn subtree(&self, root: u32) -> Vec<u32> {
        self.walk(std::iter::once(root))
    }

    /// Returns true when `pid` belongs to the supervisor's own ancestry.
    pub fn is_virtual(&self, pid: u32) -> bool {
        self.virtual_nodes.contains(&pid)
    }

    fn walk(&self, start: impl Iterator<Item = u32>) -> Vec<u32> {
        let mut order = Vec::new();
        let mut seen = HashSet::new();
        let mut queue: VecDeque<u32> = start.collect();

        while let Some(pid) = queue.pop_front() {
            if !seen.insert(pid) {
                continue;
            }
            if !self.virtual_nodes.contains(&pid) {
                order.push(pid);
            }
            if let Some(kids) = self.children.get(&pid) {
                queue.extend(kids.iter().copied());
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pid: u32, parent: Option<u32>) -> ProcessEntry {
        ProcessEntry { pid, parent }
    }

    // 1 ─┬─ 10 (self) ── 11 (command) ── 12
    //    └─ 20 ── 21
    fn sample() -> Vec<ProcessEntry> {
        vec![
            entry(1, None),
            entry(10, Some(1)),
            entry(11, Some(10)),
            entry(12, Some(11)),
            entry(20, Some(1)),
            entry(21, Some(20)),
        ]
    }

    #[test]
    fn test_own_ancestry_is_virtual() {
        let forest = ProcessForest::build(&sample(), 10);
        assert!(forest.is_virtual(10));
        assert!(forest.is_virtual(1));
        assert!(!forest.is_virtual(11));

        let order = forest.top_down();
        assert!(!order.contains(&1));
        assert!(!order.contains(&10));
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn test_top_down_puts_parents_first() {
        let forest = ProcessForest::build(&sample(), 10);
        let order = forest.top_down();
        let pos = |pid| order.iter().position(|p| *p == pid).unwrap();
        assert!(pos(11) < pos(12));
        assert!(pos(20) < pos(21));
    }

    #[test]
    fn test_bottom_up_puts_children_first() {
        let forest = ProcessForest::build(&sample(), 10);
        let order = forest.bottom_up();
        let pos = |pid| order.iter().position(|p| *p == pid).unwrap();
        assert!(pos(12) < pos(11));
        assert!(pos(21) < pos(20));
    }

    #[test]
    fn test_subtree() {
        let forest = ProcessForest::build(&sample(), 10);
        assert_eq!(forest.subtree(11), vec![11, 12]);
        assert_eq!(forest.subtree(99), vec![99]);
    }

    #[test]
    fn test_orphans_become_roots() {
        let entries = vec![entry(5, Some(4)), entry(6, Some(5))];
        let forest = ProcessForest::build(&entries, 1);
        assert_eq!(forest.top_down(), vec![5, 6]);
    }

    #[test]
    fn test_sysinfo_lists_current_process() {
        let table = SysinfoProcessTable::new();
        let listing = table.list().unwrap();
        let me = std::process::id();
        assert!(listing.entries.iter().any(|e| e.pid == me));
    }
}
