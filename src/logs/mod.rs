//! Log Consumption
//!
//! Reads a container's captured output back and separates instructions
//! from ordinary text.
//!
//! - [`lexer`]: timestamp splitting, chunking and instruction detection
//! - [`reader`]: reconnecting, retrying stream reader

pub mod lexer;
pub mod reader;

pub use lexer::{split_timestamp, LineLexer, LogItem};
pub use reader::{LogStreamReader, ReaderError};
