//! Process Supervision
//!
//! Suspend, resume and kill whole process trees for the command a step
//! is running.
//!
//! - [`tree`]: listing/signalling capability and the process forest
//! - [`supervisor`]: the locked supervisor used by the execution engine

pub mod supervisor;
pub mod tree;

pub use supervisor::{PauseScope, Supervisor, SupervisorError};
pub use tree::{
    ProcessEntry, ProcessForest, ProcessListing, ProcessSignal, ProcessTable, SignalError,
    SysinfoProcessTable,
};
