//! Resource Usage Monitoring
//!
//! Samples CPU and memory of a command's whole process tree while a step
//! runs. Recording happens beside the command and never counts toward
//! the step's timeout.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use log::debug;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, System};
use tokio_util::sync::CancellationToken;

/// A single resource usage sample.
#[derive(Debug, Clone)]
pub struct ResourceSample {
    /// When this sample was taken
    pub timestamp: Instant,
    /// CPU usage as a share of the whole machine (0-100)
    pub cpu_usage: f32,
    /// Memory usage in megabytes
    pub memory_mb: u64,
    /// Processes in the tree at sample time
    pub processes: usize,
}

/// Aggregated usage for one step execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub samples: usize,
    pub average_cpu: f32,
    pub peak_cpu: f32,
    pub peak_memory_mb: u64,
}

/// Monitors resource usage of a process and its descendants.
///
/// # Example
///
/// ```rust,ignore
/// use runwatch::monitoring::ResourceMonitor;
/// use std::time::Duration;
/// use std::thread;
///
/// let mut monitor = ResourceMonitor::for_process(std::process::id());
///
/// for _ in 0..5 {
///     monitor.sample();
///     thread::sleep(Duration::from_millis(500));
/// }
///
/// println!("{}", monitor.get_summary());
/// ```
pub struct ResourceMonitor {
    system: System,
    root: Pid,
    samples: Vec<ResourceSample>,
    warmup_done: bool,
    last_sample: Option<Instant>,
    min_interval: Duration,
    cpus: usize,
}

impl ResourceMonitor {
    /// Creates a monitor for the tree rooted at `pid`.
    pub fn for_process(pid: u32) -> Self {
        Self {
            system: System::new(),
            root: Pid::from_u32(pid),
            samples: Vec::new(),
            warmup_done: false,
            last_sample: None,
            min_interval: Duration::from_millis(250),
            cpus: num_cpus::get().max(1),
        }
    }

    /// Sets the minimum interval between samples.
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Takes a resource usage sample.
    ///
    /// The first call performs CPU warmup (required for accurate readings).
    /// Subsequent calls are rate-limited by `min_interval`.
    pub fn sample(&mut self) {
        let now = Instant::now();
        let refresh_kind = ProcessRefreshKind::new().with_cpu().with_memory();

        if !self.warmup_done {
            self.system.refresh_processes_specifics(refresh_kind);
            self.warmup_done = true;
            self.last_sample = Some(now);
            return;
        }

        if let Some(last) = self.last_sample {
            if now.duration_since(last) < self.min_interval {
                return;
            }
        }

        self.system.refresh_processes_specifics(refresh_kind);
        self.last_sample = Some(now);

        let tree = self.tree_pids();
        if tree.is_empty() {
            return;
        }

        let mut cpu = 0.0f32;
        let mut memory = 0u64;
        for pid in &tree {
            if let Some(process) = self.system.process(*pid) {
                cpu += process.cpu_usage();
                memory += process.memory();
            }
        }

        self.samples.push(ResourceSample {
            timestamp: now,
            cpu_usage: cpu / self.cpus as f32,
            memory_mb: memory / (1024 * 1024),
            processes: tree.len(),
        });
    }

    fn tree_pids(&self) -> Vec<Pid> {
        if self.system.process(self.root).is_none() {
            return Vec::new();
        }

        let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
        for (pid, process) in self.system.processes() {
            if let Some(parent) = process.parent() {
                children.entry(parent).or_default().push(*pid);
            }
        }

        let mut tree = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![self.root];
        while let Some(pid) = stack.pop() {
            if !seen.insert(pid) {
                continue;
            }
            tree.push(pid);
            if let Some(kids) = children.get(&pid) {
                stack.extend(kids.iter().copied());
            }
        }
        tree
    }

    /// Returns a human-readable summary of resource usage.
    pub fn get_summary(&self) -> String {
        if self.samples.is_empty() {
            return "No resource data collected".to_string();
        }

        let usage = self.usage();
        format!(
            "Resource Usage:\n  Average CPU: {:.1}%\n  Peak CPU: {:.1}%\n  Peak Memory: {} MB\n  Samples: {}",
            usage.average_cpu, usage.peak_cpu, usage.peak_memory_mb, usage.samples
        )
    }

    /// Returns all collected samples.
    pub fn get_samples(&self) -> &[ResourceSample] {
        &self.samples
    }

    /// Returns the peak memory usage in MB.
    pub fn peak_memory_mb(&self) -> u64 {
        self.samples.iter().map(|s| s.memory_mb).max().unwrap_or(0)
    }

    /// Returns the average CPU usage.
    pub fn average_cpu(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|s| s.cpu_usage).sum::<f32>() / self.samples.len() as f32
    }

    /// Aggregates the collected samples.
    pub fn usage(&self) -> ResourceUsage {
        ResourceUsage {
            samples: self.samples.len(),
            average_cpu: self.average_cpu(),
            peak_cpu: self
                .samples
                .iter()
                .map(|s| s.cpu_usage)
                .fold(0.0f32, f32::max),
            peak_memory_mb: self.peak_memory_mb(),
        }
    }
}

/// Samples the tree rooted at `pid` until `stop` fires.
pub async fn record(pid: u32, interval: Duration, stop: CancellationToken) -> ResourceUsage {
    let mut monitor = ResourceMonitor::for_process(pid).with_min_interval(interval / 2);
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => monitor.sample(),
        }
    }
    debug!("{}", monitor.get_summary());
    monitor.usage()
}
