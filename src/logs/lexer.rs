//! Line lexing.
//!
//! Splits captured output lines into text chunks and instructions. Text
//! lines are coalesced until a chunk is large or old enough; an instruction
//! always flushes the pending chunk first, so items come out in encounter
//! order.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::protocol::{detect, Instruction, ProtocolError};

/// One unit of a container's output.
#[derive(Debug, Clone, PartialEq)]
pub enum LogItem {
    Text {
        time: DateTime<Utc>,
        bytes: Vec<u8>,
    },
    Instruction {
        time: DateTime<Utc>,
        instruction: Instruction,
        value_error: Option<ProtocolError>,
    },
}

impl LogItem {
    pub fn time(&self) -> DateTime<Utc> {
        match self {
            LogItem::Text { time, .. } | LogItem::Instruction { time, .. } => *time,
        }
    }
}

/// Splits the RFC 3339 timestamp prefix off a captured line.
pub fn split_timestamp(line: &[u8]) -> (Option<DateTime<Utc>>, &[u8]) {
    let Some(space) = line.iter().position(|b| *b == b' ') else {
        return (None, line);
    };
    let parsed = std::str::from_utf8(&line[..space])
        .ok()
        .and_then(|prefix| DateTime::parse_from_rfc3339(prefix).ok());
    match parsed {
        Some(time) => (Some(time.with_timezone(&Utc)), &line[space + 1..]),
        None => (None, line),
    }
}

pub struct LineLexer {
    pending: Vec<u8>,
    pending_time: Option<DateTime<Utc>>,
    pending_since: Option<Instant>,
    /// An empty line held back: instruction frames open with a newline
    blank: Option<DateTime<Utc>>,
    last_seen: Option<DateTime<Utc>>,
    max_bytes: usize,
    max_age: Duration,
}

impl LineLexer {
    pub fn new(max_bytes: usize, max_age: Duration) -> Self {
        Self {
            pending: Vec::new(),
            pending_time: None,
            pending_since: None,
            blank: None,
            last_seen: None,
            max_bytes: max_bytes.max(1),
            max_age,
        }
    }

    /// Latest timestamp seen on any line.
    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.last_seen
    }

    /// Lexes one complete line, without its trailing newline.
    pub fn push_line(&mut self, line: &[u8]) -> Vec<LogItem> {
        let (stamp, body) = split_timestamp(line);
        if let Some(stamp) = stamp {
            self.last_seen = Some(self.last_seen.map_or(stamp, |seen| seen.max(stamp)));
        }
        let time = stamp.or(self.last_seen).unwrap_or_else(Utc::now);
        let body = body.strip_suffix(b"\r").unwrap_or(body);

        let mut items = Vec::new();
        if body.is_empty() {
            if let Some(previous) = self.blank.replace(time) {
                self.push_text(previous, b"", &mut items);
            }
            return items;
        }

        if let Some(detection) = detect(body) {
            self.blank = None;
            items.extend(self.flush());
            items.push(LogItem::Instruction {
                time,
                instruction: detection.instruction,
                value_error: detection.value_error,
            });
            return items;
        }

        if let Some(previous) = self.blank.take() {
            self.push_text(previous, b"", &mut items);
        }
        self.push_text(time, body, &mut items);
        items
    }

    fn push_text(&mut self, time: DateTime<Utc>, body: &[u8], items: &mut Vec<LogItem>) {
        if self.pending.is_empty() {
            self.pending_time = Some(time);
            self.pending_since = Some(Instant::now());
        }
        self.pending.extend_from_slice(body);
        self.pending.push(b'\n');
        if self.pending.len() >= self.max_bytes {
            items.extend(self.flush());
        }
    }

    /// Emits the pending text chunk.
    pub fn flush(&mut self) -> Option<LogItem> {
        if self.pending.is_empty() {
            return None;
        }
        let time = self
            .pending_time
            .take()
            .or(self.last_seen)
            .unwrap_or_else(Utc::now);
        self.pending_since = None;
        Some(LogItem::Text {
            time,
            bytes: std::mem::take(&mut self.pending),
        })
    }

    /// Emits the pending chunk once it is older than the age bound.
    pub fn flush_due(&mut self) -> Option<LogItem> {
        match self.pending_since {
            Some(since) if since.elapsed() >= self.max_age => self.flush(),
            _ => None,
        }
    }

    /// Emits everything held back, blank lines included.
    pub fn finish(&mut self) -> Vec<LogItem> {
        let mut items = Vec::new();
        if let Some(previous) = self.blank.take() {
            self.push_text(previous, b"", &mut items);
        }
        items.extend(self.flush());
        items
    }
}
