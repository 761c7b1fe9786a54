//! Wire Protocol
//!
//! Instructions are out-of-band signals embedded in a step's ordinary
//! output. The runner writes them, the log reader lexes them back out of
//! the captured stream, so both sides import the framing from here.
//!
//! # Frame Layout
//!
//! ```text
//! \n  0x01 0x05  [0x06]  reference  0x02  name  [= json]  0x02  \n
//!     prefix     hint                sep                    sep
//! ```
//!
//! - [`instruction`]: the [`Instruction`] type, encoder and [`detect`]

pub mod instruction;

pub use instruction::{detect, Detection, Instruction, ProtocolError};

/// Bytes that open every instruction line.
pub const CONTROL_PREFIX: &[u8] = b"\x01\x05";

/// Marks the instruction as a lifecycle hint rather than an output.
pub const HINT_MARKER: u8 = 0x06;

/// Separates the reference from the name and closes the frame.
pub const SEPARATOR: u8 = 0x02;

/// Separates the name from its JSON value.
pub const VALUE_SEPARATOR: u8 = b'=';

/// Reference used for the virtual setup step.
pub const INIT_STEP_REF: &str = "<init>";

/// Names of the lifecycle hints.
pub mod hints {
    pub const START: &str = "start";
    pub const END: &str = "end";
    pub const PAUSE: &str = "pause";
    pub const RESUME: &str = "resume";
    pub const ITERATION: &str = "iteration";
}
