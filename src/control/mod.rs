//! Control Channel
//!
//! A second, log-independent path into a running runner. An external actor
//! connects to a Unix socket and sends single-byte requests; the runner
//! answers each handled request with a single byte.
//!
//! ```text
//! client  'p' ──▶  server   pause the current step
//! client  'r' ──▶  server   resume the current step
//! client  ◀── '+' | '-'     success | failure
//! ```
//!
//! Unknown opcodes are ignored without reply.

use async_trait::async_trait;
use thiserror::Error;

#[cfg(unix)]
pub mod client;
#[cfg(unix)]
pub mod server;

#[cfg(unix)]
pub use client::ControlClient;
#[cfg(unix)]
pub use server::ControlServer;

pub const PAUSE: u8 = b'p';
pub const RESUME: u8 = b'r';
pub const SUCCESS: u8 = b'+';
pub const FAILURE: u8 = b'-';

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("control connection closed")]
    Closed,

    #[error("request rejected by the runner")]
    Rejected,

    #[error("unexpected reply byte {0:#04x}")]
    UnexpectedReply(u8),
}

/// Receiver of control requests.
#[async_trait]
pub trait ControlHandler: Send + Sync {
    async fn pause(&self) -> Result<(), String>;
    async fn resume(&self) -> Result<(), String>;
}
