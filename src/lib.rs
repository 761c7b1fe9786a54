//! runwatch - Step Execution Control and Observability
//!
//! Runs workflow steps inside cluster compute units and reconstructs their
//! results from the outside. The only reliable channel out of a container
//! is its own log stream, so step lifecycle travels in-band as framed
//! instructions mixed into ordinary output.
//!
//! # Architecture
//!
//! Inside the container:
//!
//! - [`protocol`]: instruction framing shared by both sides
//! - [`matcher`] and [`obfuscator`]: streaming secret redaction
//! - [`process`]: suspend, resume and kill of process trees
//! - [`execution`]: the action group state machine
//! - [`control`]: pause/resume over a Unix socket
//! - [`monitoring`]: resource usage of running commands
//!
//! Outside:
//!
//! - [`cluster`]: the container platform collaborator
//! - [`logs`]: reconnecting log reader and lexer
//! - [`notifier`]: result reconciliation
//! - [`watch`]: per-container sequencing into one notification stream
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use runwatch::execution::{load_groups, Engine, ExecutionState, Session};
//! use runwatch::obfuscator::Obfuscator;
//! use runwatch::process::{Supervisor, SysinfoProcessTable};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let groups = load_groups("groups.yaml")?;
//!
//!     let output: Box<dyn std::io::Write + Send> = Box::new(std::io::stdout());
//!     let session = Session::new(
//!         ExecutionState::load_or_new("/tmp/state.json")?,
//!         Supervisor::new(Arc::new(SysinfoProcessTable::new())),
//!         Obfuscator::new(output, &["secret-token"]),
//!     );
//!
//!     let mut engine = Engine::new(Arc::new(session));
//!     let summary = engine.run(&groups[0]).await?;
//!     println!("{}", summary.status());
//!     Ok(())
//! }
//! ```

pub mod cluster;
pub mod config;
pub mod control;
pub mod execution;
pub mod logs;
pub mod matcher;
pub mod monitoring;
pub mod notifier;
pub mod obfuscator;
pub mod process;
pub mod protocol;
pub mod watch;

// Re-export commonly used types
pub use config::{ReaderConfig, RunnerConfig, WatchConfig};
pub use execution::{Engine, ExecutionError, RunSummary, Session, StepStatus};
pub use notifier::{ExecutionResult, Notifier, Plan};
pub use protocol::Instruction;
pub use watch::{Notification, WatchOrchestrator};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "runwatch";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "runwatch");
    }

    #[test]
    fn test_module_exports_instruction() {
        let instruction = Instruction::hint("step", protocol::hints::START);
        assert_eq!(instruction.reference, "step");
        assert!(instruction.is_hint);
    }

    #[test]
    fn test_module_exports_config() {
        let config = WatchConfig::default();
        assert!(config.follow);
        assert_eq!(config.reader, ReaderConfig::default());
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
