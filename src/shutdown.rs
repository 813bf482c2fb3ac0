/// Shared cancellation for every activity of a run.
///
/// One token is created at the top and cloned into the watchdog, the log
/// monitor, the max-lifetime timer and the wrapped command. The first
/// `cancel` records why the run is stopping; later calls are ignored.
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Why the shared token fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopCause {
    /// SIGINT or SIGTERM was delivered to the process.
    Interrupted,
    /// The watchdog finished and released everything else.
    Canceled,
    /// The configured max lifetime elapsed.
    MaxLifetime,
    /// The wrapped command exited successfully.
    CommandFinished,
    /// The wrapped command failed or exited non-zero.
    CommandFailed { exit_code: i32, message: String },
    /// The log monitor hit a fatal error.
    MonitorFailed(String),
}

impl StopCause {
    /// Causes that should turn into a non-zero process exit.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            StopCause::CommandFailed { .. } | StopCause::MonitorFailed(_)
        )
    }
}

impl fmt::Display for StopCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopCause::Interrupted => write!(f, "received shutdown signal"),
            StopCause::Canceled => write!(f, "canceled"),
            StopCause::MaxLifetime => write!(f, "max lifetime exceeded"),
            StopCause::CommandFinished => write!(f, "wrapped command finished"),
            StopCause::CommandFailed { message, .. } => {
                write!(f, "wrapped command failed: {}", message)
            }
            StopCause::MonitorFailed(message) => write!(f, "monitor failed: {}", message),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    cause: Mutex<Option<StopCause>>,
    notify: Notify,
}

#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    inner: Arc<Inner>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the token. Returns `true` if this call set the cause.
    pub fn cancel(&self, cause: StopCause) -> bool {
        {
            let mut slot = self
                .inner
                .cause
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if slot.is_some() {
                return false;
            }
            tracing::debug!(%cause, "shutdown requested");
            *slot = Some(cause);
        }
        self.inner.notify.notify_waiters();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.cause().is_some()
    }

    pub fn cause(&self) -> Option<StopCause> {
        self.inner
            .cause
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Resolves once the token has fired (immediately if it already has).
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent cancel is not missed.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_first_cause_wins() {
        let token = ShutdownToken::new();
        assert!(!token.is_cancelled());
        assert!(token.cancel(StopCause::MaxLifetime));
        assert!(!token.cancel(StopCause::Canceled));
        assert_eq!(token.cause(), Some(StopCause::MaxLifetime));
    }

    #[test]
    fn test_clones_share_state() {
        let token = ShutdownToken::new();
        let clone = token.clone();
        clone.cancel(StopCause::Interrupted);
        assert_eq!(token.cause(), Some(StopCause::Interrupted));
    }

    #[test]
    fn test_failure_causes() {
        assert!(StopCause::MonitorFailed("boom".to_string()).is_failure());
        assert!(StopCause::CommandFailed {
            exit_code: 2,
            message: "exit status 2".to_string()
        }
        .is_failure());
        assert!(!StopCause::Canceled.is_failure());
        assert!(!StopCause::MaxLifetime.is_failure());
        assert!(!StopCause::CommandFinished.is_failure());
    }

    #[test]
    fn test_cause_display() {
        assert_eq!(StopCause::MaxLifetime.to_string(), "max lifetime exceeded");
        assert_eq!(
            StopCause::MonitorFailed("bad timestamp".to_string()).to_string(),
            "monitor failed: bad timestamp"
        );
    }

    #[tokio::test]
    async fn test_cancelled_resolves_immediately_when_already_fired() {
        let token = ShutdownToken::new();
        token.cancel(StopCause::Canceled);
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("cancelled() should not block");
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiters() {
        let token = ShutdownToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel(StopCause::Interrupted);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }
}
