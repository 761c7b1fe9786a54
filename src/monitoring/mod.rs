//! Resource Monitoring Module
//!
//! Tracks CPU and memory of the command tree a step is running.
//!
//! # Components
//!
//! - [`ResourceMonitor`]: CPU and memory usage tracking
//! - [`record`]: async sampling loop used by the execution engine

pub mod resource;

pub use resource::{record, ResourceMonitor, ResourceSample, ResourceUsage};
