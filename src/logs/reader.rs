//! Reconnecting log stream reader.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::cluster::{ClusterClient, ClusterError, LogOptions, LogStream};
use crate::config::ReaderConfig;

use super::lexer::{split_timestamp, LineLexer, LogItem};

const READ_BUFFER_SIZE: usize = 8192;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReaderError {
    #[error("log stream failed: {0}")]
    Cluster(ClusterError),

    #[error("log stream failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: ClusterError },

    #[error("no output for {0:?} after the container finished")]
    IdleTimeout(std::time::Duration),
}

/// How one opened stream ended.
enum StreamEnd {
    Eof,
    Broken(ClusterError),
    Idle,
    Stopped,
}

/// Lines delivered at the newest timestamp seen so far.
///
/// A reopened stream starts at that timestamp inclusive; the first
/// `delivered` lines carrying it (and anything older) were already read
/// through the previous stream and are dropped.
#[derive(Debug, Default)]
struct Boundary {
    time: Option<DateTime<Utc>>,
    delivered: usize,
    replaying: bool,
    replayed: usize,
}

impl Boundary {
    fn reopen(&mut self) {
        self.replaying = self.time.is_some();
        self.replayed = 0;
    }

    /// Returns false for a line the previous stream already delivered.
    fn admit(&mut self, stamp: Option<DateTime<Utc>>) -> bool {
        let Some(stamp) = stamp else {
            return true;
        };
        if self.replaying {
            match self.time {
                Some(time) if stamp < time => return false,
                Some(time) if stamp == time && self.replayed < self.delivered => {
                    self.replayed += 1;
                    return false;
                }
                _ => self.replaying = false,
            }
        }
        match self.time {
            Some(time) if stamp == time => self.delivered += 1,
            Some(time) if stamp < time => {}
            _ => {
                self.time = Some(stamp);
                self.delivered = 1;
            }
        }
        true
    }
}

/// Reads one container's output, reopening the stream until the container
/// is known to be finished.
///
/// A reopened stream starts at the last timestamp seen, inclusive, so
/// nothing sharing that timestamp is lost. Lines without a timestamp may
/// be delivered twice.
pub struct LogStreamReader {
    client: Arc<dyn ClusterClient>,
    unit: String,
    container: String,
    finished: watch::Receiver<bool>,
    config: ReaderConfig,
    cancel: CancellationToken,
}

impl LogStreamReader {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        unit: impl Into<String>,
        container: impl Into<String>,
        finished: watch::Receiver<bool>,
        config: ReaderConfig,
    ) -> Self {
        Self {
            client,
            unit: unit.into(),
            container: container.into(),
            finished,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Starts reading in a background task.
    ///
    /// The channel closes when the stream is done; a fatal error arrives as
    /// the last item.
    pub fn spawn(
        self,
        since: Option<DateTime<Utc>>,
    ) -> mpsc::Receiver<Result<LogItem, ReaderError>> {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        tokio::spawn(async move {
            if let Err(e) = self.run(since, &tx).await {
                warn!("Log stream ended with error: {}", e);
                let _ = tx.send(Err(e)).await;
            }
        });
        rx
    }

    /// Reads until the container is finished and its output exhausted.
    pub async fn run(
        self,
        since: Option<DateTime<Utc>>,
        tx: &mpsc::Sender<Result<LogItem, ReaderError>>,
    ) -> Result<(), ReaderError> {
        let mut lexer = LineLexer::new(self.config.chunk_max_bytes, self.config.chunk_max_age);
        let mut cursor = since;
        let mut boundary = Boundary::default();
        let mut attempts = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let options = LogOptions {
                container: self.container.clone(),
                follow: self.config.follow,
                timestamps: true,
                since: cursor,
            };
            debug!(
                "Opening logs of {}/{} since {:?}",
                self.unit, self.container, cursor
            );

            let end = match self.client.logs(&self.unit, &options).await {
                Ok(stream) => {
                    let before = lexer.last_seen();
                    boundary.reopen();
                    let end = self.consume(stream, &mut lexer, &mut boundary, tx).await;
                    if lexer.last_seen() != before {
                        attempts = 0;
                    }
                    end
                }
                Err(e) => StreamEnd::Broken(e),
            };

            match end {
                StreamEnd::Stopped => return Ok(()),
                StreamEnd::Idle => return Err(ReaderError::IdleTimeout(self.config.idle_timeout)),
                StreamEnd::Broken(e) if !e.is_transient() => return Err(ReaderError::Cluster(e)),
                StreamEnd::Broken(e) => {
                    if attempts >= self.config.max_retries {
                        return Err(ReaderError::RetriesExhausted {
                            attempts,
                            last: e,
                        });
                    }
                    let delay = e.backoff(attempts);
                    attempts += 1;
                    info!(
                        "Log stream of {}/{} interrupted ({}), retrying in {:?}",
                        self.unit, self.container, e, delay
                    );
                    if !self.sleep(delay).await {
                        return Ok(());
                    }
                }
                StreamEnd::Eof => {
                    if !self.config.follow || self.is_finished() {
                        send_all(tx, lexer.finish()).await;
                        return Ok(());
                    }
                    if let Some(item) = lexer.flush() {
                        send_all(tx, vec![item]).await;
                    }
                    if !self.sleep(self.config.reopen_delay).await {
                        return Ok(());
                    }
                }
            }

            if boundary.time.is_some() {
                cursor = boundary.time;
            }
        }
    }

    /// Reads one opened stream to its end.
    async fn consume(
        &self,
        mut stream: LogStream,
        lexer: &mut LineLexer,
        boundary: &mut Boundary,
        tx: &mpsc::Sender<Result<LogItem, ReaderError>>,
    ) -> StreamEnd {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut partial: Vec<u8> = Vec::new();
        let mut last_activity = Instant::now();

        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => return StreamEnd::Stopped,
                read = stream.read(&mut buf) => read,
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Some(item) = lexer.flush_due() {
                        if !send_all(tx, vec![item]).await {
                            return StreamEnd::Stopped;
                        }
                    }
                    if self.is_finished() && last_activity.elapsed() >= self.config.idle_timeout {
                        return StreamEnd::Idle;
                    }
                    continue;
                }
            };

            let n = match read {
                Ok(0) => {
                    // A partial line at EOF is complete only if nothing follows
                    if !partial.is_empty() && (!self.config.follow || self.is_finished()) {
                        let items = lex(lexer, boundary, &partial);
                        if !send_all(tx, items).await {
                            return StreamEnd::Stopped;
                        }
                    }
                    return StreamEnd::Eof;
                }
                Ok(n) => n,
                Err(e) => return StreamEnd::Broken(ClusterError::ConnectionReset(e.to_string())),
            };
            last_activity = Instant::now();

            partial.extend_from_slice(&buf[..n]);
            let mut items = Vec::new();
            while let Some(newline) = partial.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = partial.drain(..=newline).collect();
                items.extend(lex(lexer, boundary, &line[..line.len() - 1]));
            }
            items.extend(lexer.flush_due());
            if !send_all(tx, items).await {
                return StreamEnd::Stopped;
            }
        }
    }

    fn is_finished(&self) -> bool {
        // A dropped sender means nobody will ever report more progress
        *self.finished.borrow() || self.finished.has_changed().is_err()
    }

    /// Sleeps unless cancelled first. Returns false on cancellation.
    async fn sleep(&self, delay: std::time::Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

fn lex(lexer: &mut LineLexer, boundary: &mut Boundary, line: &[u8]) -> Vec<LogItem> {
    let (stamp, _) = split_timestamp(line);
    if boundary.admit(stamp) {
        lexer.push_line(line)
    } else {
        Vec::new()
    }
}

/// Sends items in order. Returns false once the receiver is gone.
async fn send_all(tx: &mpsc::Sender<Result<LogItem, ReaderError>>, items: Vec<LogItem>) -> bool {
    for item in items {
        if tx.send(Ok(item)).await.is_err() {
            return false;
        }
    }
    true
}
