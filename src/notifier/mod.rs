//! Result Reconciliation Module
//!
//! The consumer side's view of an execution. Whatever arrives from the
//! log stream or the platform is folded into one [`ExecutionResult`] that
//! only ever improves.
//!
//! - [`signature`]: step tree and container plan
//! - [`result`]: result types and the status fold
//! - [`reconciler`]: the [`Notifier`] that applies updates

pub mod reconciler;
pub mod result;
pub mod signature;

pub use reconciler::{Notifier, DEFAULT_ERROR_MESSAGE};
pub use result::{ExecutionResult, StepResult};
pub use signature::{Plan, PlannedContainer, Signature};
