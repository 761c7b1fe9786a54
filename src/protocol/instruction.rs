//! Instruction Encoding and Detection

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::{CONTROL_PREFIX, HINT_MARKER, SEPARATOR, VALUE_SEPARATOR};
use crate::matcher::PatternTrie;

static CONTROL_TRIE: Lazy<PatternTrie> = Lazy::new(|| PatternTrie::new([CONTROL_PREFIX]));

/// Errors raised while framing or parsing instructions.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("{field} contains a reserved framing byte")]
    InvalidField { field: &'static str },

    #[error("instruction name is empty")]
    EmptyName,

    #[error("failed to encode value: {0}")]
    Encode(String),

    #[error("invalid value for '{reference}.{name}': {message}")]
    InvalidValue {
        reference: String,
        name: String,
        message: String,
    },
}

/// A single out-of-band signal about a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    /// Step reference (may be empty)
    pub reference: String,
    /// Hint or output name
    pub name: String,
    /// Optional JSON payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Whether this is a lifecycle hint
    pub is_hint: bool,
}

/// Result of a successful [`detect`].
///
/// The instruction is usable even when `value_error` is set; only the
/// payload failed to decode.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub instruction: Instruction,
    pub value_error: Option<ProtocolError>,
}

impl Instruction {
    /// Creates a lifecycle hint without a value.
    pub fn hint(reference: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            name: name.into(),
            value: None,
            is_hint: true,
        }
    }

    /// Creates a named output carrying a value.
    pub fn output(reference: impl Into<String>, name: impl Into<String>, value: Value) -> Self {
        Self {
            reference: reference.into(),
            name: name.into(),
            value: Some(value),
            is_hint: false,
        }
    }

    /// Attaches a value.
    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    /// Encodes the instruction as a complete frame, surrounding newlines included.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        if self.name.is_empty() {
            return Err(ProtocolError::EmptyName);
        }
        if self.reference.bytes().any(is_reserved) {
            return Err(ProtocolError::InvalidField { field: "reference" });
        }
        if self
            .name
            .bytes()
            .any(|b| is_reserved(b) || b == VALUE_SEPARATOR)
        {
            return Err(ProtocolError::InvalidField { field: "name" });
        }

        let mut frame = Vec::with_capacity(self.reference.len() + self.name.len() + 16);
        frame.push(b'\n');
        frame.extend_from_slice(CONTROL_PREFIX);
        if self.is_hint {
            frame.push(HINT_MARKER);
        }
        frame.extend_from_slice(self.reference.as_bytes());
        frame.push(SEPARATOR);
        frame.extend_from_slice(self.name.as_bytes());
        if let Some(value) = &self.value {
            // serde_json escapes every byte below 0x20, so the payload
            // can never contain a framing byte or a newline.
            let json = serde_json::to_vec(value).map_err(|e| ProtocolError::Encode(e.to_string()))?;
            frame.push(VALUE_SEPARATOR);
            frame.extend_from_slice(&json);
        }
        frame.push(SEPARATOR);
        frame.push(b'\n');
        Ok(frame)
    }
}

fn is_reserved(b: u8) -> bool {
    b == SEPARATOR || b == HINT_MARKER || b == b'\n' || b == b'\r'
}

/// Detects an instruction in a single output line.
///
/// Lines that do not open with the control prefix are rejected after
/// looking at no more than the prefix, which is the common case.
pub fn detect(line: &[u8]) -> Option<Detection> {
    let line = trim_line(line);
    let start = CONTROL_TRIE.match_prefix(line)?;

    let mut rest = &line[start..];
    let is_hint = rest.first() == Some(&HINT_MARKER);
    if is_hint {
        rest = &rest[1..];
    }

    let (last, body) = rest.split_last()?;
    if *last != SEPARATOR {
        return None;
    }

    let split = body.iter().position(|b| *b == SEPARATOR)?;
    let reference = std::str::from_utf8(&body[..split]).ok()?;
    let tail = &body[split + 1..];

    let (name, raw_value) = match tail.iter().position(|b| *b == VALUE_SEPARATOR) {
        Some(i) => (&tail[..i], Some(&tail[i + 1..])),
        None => (tail, None),
    };
    if name.is_empty() || name.contains(&SEPARATOR) {
        return None;
    }
    let name = std::str::from_utf8(name).ok()?;

    let mut instruction = Instruction {
        reference: reference.to_string(),
        name: name.to_string(),
        value: None,
        is_hint,
    };

    let mut value_error = None;
    if let Some(raw) = raw_value {
        match serde_json::from_slice::<Value>(raw) {
            Ok(value) => instruction.value = Some(value),
            Err(e) => {
                value_error = Some(ProtocolError::InvalidValue {
                    reference: instruction.reference.clone(),
                    name: instruction.name.clone(),
                    message: e.to_string(),
                })
            }
        }
    }

    Some(Detection {
        instruction,
        value_error,
    })
}

fn trim_line(mut line: &[u8]) -> &[u8] {
    while let Some((b'\n' | b'\r', rest)) = line.split_first() {
        line = rest;
    }
    while let Some((b'\n' | b'\r', rest)) = line.split_last() {
        line = rest;
    }
    line
}
