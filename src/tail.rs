/// `tail -f` over a single growing file.
///
/// The follower never reports end-of-stream: when no new bytes exist it sleeps
/// for `POLL_INTERVAL` and retries until data arrives or the shutdown token
/// fires.
use crate::clock::{elapsed_between, Clock};
use crate::shutdown::{ShutdownToken, StopCause};
use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;

/// How long a read sleeps when the file has not grown.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How long to wait for the log file to be created.
pub const FILE_WAIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// How often to check for the log file while waiting.
pub const FILE_WAIT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum TailError {
    /// The file to follow does not exist.
    NotFound { path: PathBuf },
    /// The file did not appear within the wait budget.
    WaitTimeout { path: PathBuf, waited: Duration },
    /// Any other filesystem error.
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The shutdown token fired while a read was pending.
    Cancelled(StopCause),
}

impl std::fmt::Display for TailError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TailError::NotFound { path } => write!(f, "{} does not exist", path.display()),
            TailError::WaitTimeout { path, waited } => write!(
                f,
                "{} did not appear within {}",
                path.display(),
                humantime::format_duration(*waited)
            ),
            TailError::Io { path, source } => {
                write!(f, "I/O error on {}: {}", path.display(), source)
            }
            TailError::Cancelled(cause) => write!(f, "read cancelled: {}", cause),
        }
    }
}

impl std::error::Error for TailError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TailError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl TailError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        TailError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Anything the log scanner can pull bytes from. `Ok(0)` means end of stream.
#[async_trait]
pub trait ByteSource: Send {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, TailError>;
}

/// Tail-following reader over one file path.
#[derive(Debug)]
pub struct Follower {
    path: PathBuf,
    offset: Mutex<u64>,
    poll_interval: Duration,
    token: ShutdownToken,
}

impl Follower {
    /// Start following `path` from its first byte. The file must already exist.
    pub async fn open(path: impl Into<PathBuf>, token: ShutdownToken) -> Result<Self, TailError> {
        let path = path.into();
        match tokio::fs::metadata(&path).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TailError::NotFound { path });
            }
            Err(e) => return Err(TailError::io(&path, e)),
        }
        Ok(Self {
            path,
            offset: Mutex::new(0),
            poll_interval: POLL_INTERVAL,
            token,
        })
    }

    #[cfg(test)]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Number of bytes delivered so far.
    #[cfg(test)]
    pub async fn offset(&self) -> u64 {
        *self.offset.lock().await
    }

    /// Read new bytes into `buf`, waiting for the file to grow if needed.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, TailError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut offset = self.offset.lock().await;
        loop {
            if let Some(cause) = self.token.cause() {
                return Err(TailError::Cancelled(cause));
            }

            let size = tokio::fs::metadata(&self.path)
                .await
                .map_err(|e| TailError::io(&self.path, e))?
                .len();
            if size < *offset {
                // Truncated or rotated in place: wait until it grows past what we've read.
                tracing::debug!(
                    path = %self.path.display(),
                    size,
                    offset = *offset,
                    "log file is shorter than the read offset"
                );
            }
            if size <= *offset {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = self.token.cancelled() => {}
                }
                continue;
            }

            let mut file = tokio::fs::File::open(&self.path)
                .await
                .map_err(|e| TailError::io(&self.path, e))?;
            file.seek(SeekFrom::Start(*offset))
                .await
                .map_err(|e| TailError::io(&self.path, e))?;
            let n = file
                .read(buf)
                .await
                .map_err(|e| TailError::io(&self.path, e))?;
            if n == 0 {
                continue;
            }
            *offset += n as u64;
            return Ok(n);
        }
    }
}

#[async_trait]
impl ByteSource for Follower {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, TailError> {
        self.read(buf).await
    }
}

/// Adapts a finite `AsyncRead` (a plain file, an in-memory buffer) into a `ByteSource`.
#[allow(dead_code)]
pub struct ReaderSource<R> {
    reader: R,
    label: PathBuf,
}

impl<R> ReaderSource<R> {
    #[allow(dead_code)]
    pub fn new(reader: R, label: impl Into<PathBuf>) -> Self {
        Self {
            reader,
            label: label.into(),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> ByteSource for ReaderSource<R> {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, TailError> {
        self.reader
            .read(buf)
            .await
            .map_err(|e| TailError::io(&self.label, e))
    }
}

/// Splits a byte source into newline-terminated lines.
pub struct LineReader<S> {
    source: S,
    pending: Vec<u8>,
    /// Prefix of `pending` already known to hold no newline.
    scanned: usize,
    chunk: Vec<u8>,
    eof: bool,
}

impl<S: ByteSource> LineReader<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            pending: Vec::new(),
            scanned: 0,
            chunk: vec![0; 64 * 1024],
            eof: false,
        }
    }

    /// Next complete line without its terminator. A final unterminated line is
    /// returned once the source reports end of stream; `Ok(None)` after that.
    pub async fn next_line(&mut self) -> Result<Option<String>, TailError> {
        loop {
            let newline = self.pending[self.scanned..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|i| self.scanned + i);
            if let Some(pos) = newline {
                let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
                self.scanned = 0;
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }
            if self.eof {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                let line = std::mem::take(&mut self.pending);
                self.scanned = 0;
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }
            self.scanned = self.pending.len();
            let n = self.source.read_chunk(&mut self.chunk).await?;
            if n == 0 {
                self.eof = true;
            } else {
                self.pending.extend_from_slice(&self.chunk[..n]);
            }
        }
    }
}

/// Wait for `path` to exist, polling every `interval` for at most `timeout`
/// as measured by `clock`.
///
/// Returns `Ok(false)` if the token fired before the file appeared.
pub async fn wait_for_file(
    path: &Path,
    token: &ShutdownToken,
    clock: &dyn Clock,
    timeout: Duration,
    interval: Duration,
) -> Result<bool, TailError> {
    let started = clock.now();
    loop {
        if token.is_cancelled() {
            return Ok(false);
        }
        match tokio::fs::metadata(path).await {
            Ok(_) => return Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(TailError::io(path, e)),
        }
        let waited = elapsed_between(started, clock.now());
        if waited >= timeout {
            return Err(TailError::WaitTimeout {
                path: path.to_path_buf(),
                waited,
            });
        }
        tracing::debug!(path = %path.display(), "waiting for log file");
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = token.cancelled() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::NaiveDate;
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Instant;

    fn append(path: &Path, bytes: &[u8]) {
        let mut f = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        f.write_all(bytes).unwrap();
        f.sync_all().unwrap();
    }

    #[tokio::test]
    async fn test_open_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = Follower::open(dir.path().join("nope.log"), ShutdownToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TailError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_reads_bytes_written_after_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.log");
        std::fs::write(&path, b"").unwrap();

        let follower = Follower::open(&path, ShutdownToken::new())
            .await
            .unwrap()
            .with_poll_interval(Duration::from_millis(10));
        let data = b"2023-11-17 07:30:00 INFO hello\n".repeat(20);
        append(&path, &data);

        let mut buf = vec![0; data.len()];
        let n = follower.read(&mut buf).await.unwrap();
        assert_eq!(n, data.len());
        assert_eq!(buf, data);
        assert_eq!(follower.offset().await, data.len() as u64);
    }

    #[tokio::test]
    async fn test_delivers_every_burst_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.log");
        std::fs::write(&path, b"first\n").unwrap();

        let follower = Follower::open(&path, ShutdownToken::new())
            .await
            .unwrap()
            .with_poll_interval(Duration::from_millis(10));

        let writer = {
            let path = path.clone();
            tokio::spawn(async move {
                for burst in [&b"second\nthi"[..], b"rd\n", b"fourth\n"] {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    append(&path, burst);
                }
            })
        };

        let expected = b"first\nsecond\nthird\nfourth\n";
        let mut received = Vec::new();
        let mut buf = [0u8; 4];
        while received.len() < expected.len() {
            let n = tokio::time::timeout(Duration::from_secs(5), follower.read(&mut buf))
                .await
                .expect("read should make progress")
                .unwrap();
            received.extend_from_slice(&buf[..n]);
        }
        writer.await.unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_truncated_file_waits_for_growth_past_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.log");
        std::fs::write(&path, b"0123456789").unwrap();

        let follower = Follower::open(&path, ShutdownToken::new())
            .await
            .unwrap()
            .with_poll_interval(Duration::from_millis(10));
        let mut buf = [0u8; 64];
        assert_eq!(follower.read(&mut buf).await.unwrap(), 10);

        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(4)
            .unwrap();
        let pending =
            tokio::time::timeout(Duration::from_millis(100), follower.read(&mut buf)).await;
        assert!(pending.is_err(), "a shrunken file has no new bytes");
        assert_eq!(follower.offset().await, 10);

        append(&path, b"abcdefghij");
        let n = tokio::time::timeout(Duration::from_secs(2), follower.read(&mut buf))
            .await
            .expect("growth past the old offset should be delivered")
            .unwrap();
        assert_eq!(&buf[..n], b"ghij");
        assert_eq!(follower.offset().await, 14);
    }

    #[tokio::test]
    async fn test_cancellation_unblocks_pending_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.log");
        std::fs::write(&path, b"").unwrap();

        let token = ShutdownToken::new();
        let follower = Follower::open(&path, token.clone()).await.unwrap();

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            follower.read(&mut buf).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let started = Instant::now();
        token.cancel(StopCause::Canceled);

        let result = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .expect("read should unblock")
            .unwrap();
        assert!(started.elapsed() <= POLL_INTERVAL);
        assert!(matches!(
            result,
            Err(TailError::Cancelled(StopCause::Canceled))
        ));
    }

    #[tokio::test]
    async fn test_line_reader_splits_and_keeps_trailing_line() {
        let source = ReaderSource::new(&b"one\r\ntwo\n\nthree"[..], "memory");
        let mut lines = LineReader::new(source);
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("one"));
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("two"));
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some(""));
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("three"));
        assert_eq!(lines.next_line().await.unwrap(), None);
    }

    /// Hands out at most `step` bytes per read.
    struct Trickle {
        data: Vec<u8>,
        at: usize,
        step: usize,
    }

    #[async_trait]
    impl ByteSource for Trickle {
        async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, TailError> {
            let n = self.step.min(buf.len()).min(self.data.len() - self.at);
            buf[..n].copy_from_slice(&self.data[self.at..self.at + n]);
            self.at += n;
            Ok(n)
        }
    }

    #[tokio::test]
    async fn test_line_reader_joins_lines_split_across_many_reads() {
        let long = "x".repeat(10_000);
        let data = format!("{long}\nshort\r\n{long}");
        let mut lines = LineReader::new(Trickle {
            data: data.into_bytes(),
            at: 0,
            step: 7,
        });
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some(long.as_str()));
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("short"));
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some(long.as_str()));
        assert_eq!(lines.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_wait_for_file_sees_late_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.log");
        let clock = ManualClock::new(
            NaiveDate::from_ymd_opt(2023, 11, 17)
                .unwrap()
                .and_hms_opt(7, 0, 0)
                .unwrap(),
        );

        let creator = {
            let path = path.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                std::fs::write(&path, b"").unwrap();
            })
        };
        let found = wait_for_file(
            &path,
            &ShutdownToken::new(),
            &clock,
            FILE_WAIT_TIMEOUT,
            Duration::from_millis(10),
        )
        .await
        .unwrap();
        creator.await.unwrap();
        assert!(found);
    }

    #[tokio::test]
    async fn test_wait_for_file_times_out_on_clock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never.log");
        let clock = Arc::new(ManualClock::new(
            NaiveDate::from_ymd_opt(2023, 11, 17)
                .unwrap()
                .and_hms_opt(7, 0, 0)
                .unwrap(),
        ));

        let mover = {
            let clock = Arc::clone(&clock);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                clock.advance(FILE_WAIT_TIMEOUT + Duration::from_secs(1));
            })
        };
        let err = wait_for_file(
            &path,
            &ShutdownToken::new(),
            clock.as_ref(),
            FILE_WAIT_TIMEOUT,
            Duration::from_millis(10),
        )
        .await
        .unwrap_err();
        mover.await.unwrap();
        assert!(matches!(err, TailError::WaitTimeout { .. }));
    }

    #[tokio::test]
    async fn test_wait_for_file_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let token = ShutdownToken::new();
        token.cancel(StopCause::Interrupted);
        let clock = ManualClock::new(
            NaiveDate::from_ymd_opt(2023, 11, 17)
                .unwrap()
                .and_hms_opt(7, 0, 0)
                .unwrap(),
        );
        let found = wait_for_file(
            &dir.path().join("never.log"),
            &token,
            &clock,
            FILE_WAIT_TIMEOUT,
            FILE_WAIT_INTERVAL,
        )
        .await
        .unwrap();
        assert!(!found);
    }
}
