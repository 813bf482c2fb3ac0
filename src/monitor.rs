/// Live session accounting from the SSM agent log.
///
/// A single producer (the scan loop) feeds parsed entries into `mark`; any
/// number of readers poll `metrics` for the latest snapshot.
use crate::clock::Clock;
use crate::parser::{LogEntry, ParseError};
use crate::shutdown::ShutdownToken;
use crate::tail::{self, ByteSource, Follower, LineReader, TailError};
use chrono::NaiveDateTime;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// Point-in-time view of session activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Metrics {
    /// Distinct session ids ever seen.
    pub total_sessions: usize,
    /// Sessions without a "session worker closed" line yet.
    pub active_sessions: usize,
    /// Most recent timestamp across all sessions; `None` until the first session.
    pub last_timestamp: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Copy)]
struct SessionRecord {
    last_seen: NaiveDateTime,
    closed: bool,
}

#[derive(Debug)]
pub enum MonitorError {
    Tail(TailError),
    Parse(ParseError),
}

impl std::fmt::Display for MonitorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorError::Tail(e) => write!(f, "failed to follow log: {}", e),
            MonitorError::Parse(e) => write!(f, "failed to parse log: {}", e),
        }
    }
}

impl std::error::Error for MonitorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MonitorError::Tail(e) => Some(e),
            MonitorError::Parse(e) => Some(e),
        }
    }
}

impl From<TailError> for MonitorError {
    fn from(e: TailError) -> Self {
        MonitorError::Tail(e)
    }
}

impl From<ParseError> for MonitorError {
    fn from(e: ParseError) -> Self {
        MonitorError::Parse(e)
    }
}

/// Session records are never evicted: the table holds every session id seen
/// for the life of the process.
#[derive(Debug)]
pub struct Monitor {
    log_path: PathBuf,
    clock: Arc<dyn Clock>,
    file_wait_timeout: Duration,
    file_wait_interval: Duration,
    sessions: Mutex<HashMap<String, SessionRecord>>,
    metrics: RwLock<Metrics>,
}

impl Monitor {
    pub fn new(log_path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            log_path: log_path.into(),
            clock,
            file_wait_timeout: tail::FILE_WAIT_TIMEOUT,
            file_wait_interval: tail::FILE_WAIT_INTERVAL,
            sessions: Mutex::new(HashMap::new()),
            metrics: RwLock::new(Metrics::default()),
        }
    }

    #[cfg(test)]
    pub fn with_file_wait_interval(mut self, interval: Duration) -> Self {
        self.file_wait_interval = interval;
        self
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Record one entry and publish a fresh snapshot.
    pub fn mark(&self, entry: &LogEntry) {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let record = sessions
            .entry(entry.session_id.clone())
            .or_insert(SessionRecord {
                last_seen: entry.timestamp,
                closed: false,
            });
        record.last_seen = entry.timestamp;
        if entry.is_session_closed() {
            record.closed = true;
        }

        let mut snapshot = Metrics::default();
        for record in sessions.values() {
            snapshot.total_sessions += 1;
            if !record.closed {
                snapshot.active_sessions += 1;
            }
            if snapshot
                .last_timestamp
                .map_or(true, |latest| record.last_seen > latest)
            {
                snapshot.last_timestamp = Some(record.last_seen);
            }
        }

        *self
            .metrics
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = snapshot;
    }

    /// The most recently published snapshot.
    pub fn metrics(&self) -> Metrics {
        *self
            .metrics
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait for the log file, then follow it until the token fires.
    pub async fn run(&self, token: &ShutdownToken) -> Result<(), MonitorError> {
        let found = tail::wait_for_file(
            &self.log_path,
            token,
            self.clock.as_ref(),
            self.file_wait_timeout,
            self.file_wait_interval,
        )
        .await?;
        if !found {
            return Ok(());
        }

        tracing::debug!(path = %self.log_path.display(), "following SSM agent log");
        let follower = Follower::open(&self.log_path, token.clone()).await?;
        self.scan(follower, token).await
    }

    /// Feed every session-worker line of `source` into `mark`.
    ///
    /// End of stream and cancellation both end the scan cleanly.
    pub async fn scan<S: ByteSource>(
        &self,
        source: S,
        token: &ShutdownToken,
    ) -> Result<(), MonitorError> {
        let mut lines = LineReader::new(source);
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(()),
                Err(TailError::Cancelled(_)) => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            if token.is_cancelled() {
                return Ok(());
            }
            let Some(entry) = LogEntry::parse(&line)? else {
                continue;
            };
            tracing::trace!(session_id = %entry.session_id, level = %entry.level, "session activity");
            self.mark(&entry);
        }
    }
}
