/// Idle / lifetime decision loop.
///
/// Samples the monitor every `check_interval` and stops the task when nobody
/// ever connected within `initial_wait`, when every session has been closed
/// for longer than `idle_timeout`, or when the shared token fires (signal,
/// max lifetime, wrapped command, monitor failure).
use crate::clock::{elapsed_between, Clock};
use crate::monitor::{Metrics, Monitor};
use crate::shutdown::{ShutdownToken, StopCause};
use chrono::NaiveDateTime;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

pub const NO_TRAFFIC_REASON: &str = "no total connections after initial wait time";
pub const IDLE_REASON: &str = "no active connections after idle timeout";

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Timeout policy, fixed for the lifetime of the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub initial_wait: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Option<Duration>,
    pub check_interval: Duration,
}

impl Policy {
    /// Policy with the initial wait equal to the idle timeout and no lifetime cap.
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            initial_wait: idle_timeout,
            idle_timeout,
            max_lifetime: None,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }

    pub fn initial_wait(mut self, initial_wait: Option<Duration>) -> Self {
        if let Some(wait) = initial_wait.filter(|w| !w.is_zero()) {
            self.initial_wait = wait;
        }
        self
    }

    pub fn max_lifetime(mut self, max_lifetime: Option<Duration>) -> Self {
        self.max_lifetime = max_lifetime.filter(|d| !d.is_zero());
        self
    }

    pub fn check_interval(mut self, interval: Duration) -> Self {
        if !interval.is_zero() {
            self.check_interval = interval;
        }
        self
    }

    /// The per-tick rule. `None` means keep running.
    pub fn evaluate(
        &self,
        metrics: &Metrics,
        now: NaiveDateTime,
        started_at: NaiveDateTime,
    ) -> Option<StopKind> {
        if metrics.total_sessions == 0 {
            let waited = elapsed_between(started_at, now);
            tracing::debug!(
                started_at = %started_at,
                waited = %humantime::format_duration(waited),
                "no total connections"
            );
            return (waited > self.initial_wait).then_some(StopKind::NoTraffic);
        }

        if metrics.active_sessions == 0 {
            let last = metrics.last_timestamp.unwrap_or(started_at);
            let idle = elapsed_between(last, now);
            tracing::debug!(
                last_timestamp = %last,
                idle = %humantime::format_duration(idle),
                "no active connections"
            );
            return (idle > self.idle_timeout).then_some(StopKind::Idle);
        }

        tracing::debug!(active = metrics.active_sessions, "has active connections");
        None
    }
}

/// Terminal state of the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopKind {
    NoTraffic,
    Idle,
    MaxLifetime,
    External(StopCause),
}

impl StopKind {
    pub fn reason(&self) -> String {
        match self {
            StopKind::NoTraffic => NO_TRAFFIC_REASON.to_string(),
            StopKind::Idle => IDLE_REASON.to_string(),
            StopKind::MaxLifetime => StopCause::MaxLifetime.to_string(),
            StopKind::External(cause) => cause.to_string(),
        }
    }

    fn from_cause(cause: StopCause) -> Self {
        match cause {
            StopCause::MaxLifetime => StopKind::MaxLifetime,
            other => StopKind::External(other),
        }
    }
}

/// First-writer-wins holder for the run's stop reason.
#[derive(Debug, Default)]
pub struct StopReason {
    reason: OnceLock<String>,
}

impl StopReason {
    /// Returns `true` if this call set the reason.
    pub fn latch(&self, reason: impl Into<String>) -> bool {
        self.reason.set(reason.into()).is_ok()
    }

    /// The latched reason, or `""` if none was decided.
    pub fn get(&self) -> &str {
        self.reason.get().map(String::as_str).unwrap_or("")
    }
}

/// Read access to live session metrics.
pub trait MetricsSource: Send + Sync {
    fn metrics(&self) -> Metrics;
}

impl MetricsSource for Monitor {
    fn metrics(&self) -> Metrics {
        Monitor::metrics(self)
    }
}

#[derive(Debug)]
pub struct Watchdog {
    policy: Policy,
    clock: Arc<dyn Clock>,
    started_at: NaiveDateTime,
}

impl Watchdog {
    /// The initial-wait window is measured from this call.
    pub fn new(policy: Policy, clock: Arc<dyn Clock>) -> Self {
        let started_at = clock.now();
        Self {
            policy,
            clock,
            started_at,
        }
    }

    /// Run until a stop decision is reached. Always cancels `token` on exit.
    pub async fn run(&self, source: &dyn MetricsSource, token: &ShutdownToken) -> StopKind {
        tracing::debug!(policy = ?self.policy, "starting main loop");
        let kind = self.decide(source, token).await;
        token.cancel(StopCause::Canceled);
        tracing::debug!(reason = %kind.reason(), "main loop finished");
        kind
    }

    async fn decide(&self, source: &dyn MetricsSource, token: &ShutdownToken) -> StopKind {
        loop {
            if let Some(cause) = token.cause() {
                tracing::debug!(%cause, "shutdown token fired");
                return StopKind::from_cause(cause);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.policy.check_interval) => {}
                _ = token.cancelled() => continue,
            }

            let metrics = source.metrics();
            tracing::debug!(
                total = metrics.total_sessions,
                active = metrics.active_sessions,
                last_timestamp = ?metrics.last_timestamp,
                "monitor metrics"
            );
            if let Some(kind) = self
                .policy
                .evaluate(&metrics, self.clock.now(), self.started_at)
            {
                tracing::info!("{}", kind.reason());
                return kind;
            }
        }
    }
}

/// Fire `token` with `StopCause::MaxLifetime` once `max_lifetime` has passed.
pub fn spawn_max_lifetime(
    max_lifetime: Duration,
    token: ShutdownToken,
) -> tokio::task::JoinHandle<()> {
    tracing::debug!(max_lifetime = %humantime::format_duration(max_lifetime), "setting max lifetime");
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(max_lifetime) => {
                token.cancel(StopCause::MaxLifetime);
            }
            _ = token.cancelled() => {}
        }
    })
}
