/// One terminator run: every activity shares a single shutdown token, the
/// watchdog decides when to stop, and the ECS post-process runs last.
use crate::clock::Clock;
use crate::config::Settings;
use crate::ecs::{EcsControl, EcsError};
use crate::metadata::{self, MetadataError};
use crate::monitor::{Metrics, Monitor};
use crate::shutdown::{ShutdownToken, StopCause};
use crate::watchdog::{self, StopReason, Watchdog};
use crate::wrapper;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Budget for the ECS calls made after the watchdog stops.
pub const POST_PROCESS_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub enum AppError {
    /// Task metadata discovery failed before anything started.
    Metadata(MetadataError),
    /// The run ended because of a failure (wrapped command, log monitor).
    Stopped(StopCause),
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::Metadata(e) => write!(f, "failed to detect ecs meta: {}", e),
            AppError::Stopped(cause) => write!(f, "{}", cause),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::Metadata(e) => Some(e),
            AppError::Stopped(_) => None,
        }
    }
}

impl AppError {
    /// Process exit code; a failed wrapped command passes its own code through.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Stopped(StopCause::CommandFailed { exit_code, .. }) => *exit_code,
            _ => 1,
        }
    }
}

pub struct App {
    settings: Settings,
    watchdog: Watchdog,
    ecs: Arc<dyn EcsControl>,
    monitor: Arc<Monitor>,
    stop_reason: StopReason,
    active: AtomicBool,
}

impl App {
    /// The initial-wait window starts here, before metadata discovery.
    pub fn new(settings: Settings, clock: Arc<dyn Clock>, ecs: Arc<dyn EcsControl>) -> Self {
        let monitor = Arc::new(Monitor::new(settings.log_path.clone(), Arc::clone(&clock)));
        let watchdog = Watchdog::new(settings.policy.clone(), clock);
        Self {
            settings,
            watchdog,
            ecs,
            monitor,
            stop_reason: StopReason::default(),
            active: AtomicBool::new(false),
        }
    }

    /// Why the run stopped; empty until a decision has been latched.
    pub fn stop_reason(&self) -> &str {
        self.stop_reason.get()
    }

    /// True between metadata discovery and the end of post-processing.
    #[allow(dead_code)]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Live session metrics from the log monitor.
    #[allow(dead_code)]
    pub fn metrics(&self) -> Metrics {
        self.monitor.metrics()
    }

    pub async fn run(&self, token: ShutdownToken) -> Result<(), AppError> {
        let meta = metadata::discover(self.settings.metadata_uri.as_deref())
            .await
            .map_err(AppError::Metadata)?;

        self.active.store(true, Ordering::SeqCst);
        tracing::debug!(
            version = env!("CARGO_PKG_VERSION"),
            "starting ecs-task-self-terminator"
        );

        let mut helpers = Vec::new();
        if let Some(max_lifetime) = self.settings.policy.max_lifetime {
            helpers.push(watchdog::spawn_max_lifetime(max_lifetime, token.clone()));
        }
        if let Some((program, args)) = self.settings.command.split_first() {
            helpers.push(wrapper::spawn_supervised(
                program.clone(),
                args.to_vec(),
                self.settings.keep_alive_task,
                token.clone(),
            ));
        }

        let monitor_task = {
            let monitor = Arc::clone(&self.monitor);
            let token = token.clone();
            tokio::spawn(async move {
                tracing::debug!(log_file_path = %monitor.log_path().display(), "starting monitor");
                if let Err(e) = monitor.run(&token).await {
                    tracing::error!(error = %e, "monitor error");
                    token.cancel(StopCause::MonitorFailed(e.to_string()));
                }
            })
        };

        let kind = self.watchdog.run(self.monitor.as_ref(), &token).await;
        self.stop_reason.latch(kind.reason());

        for handle in helpers {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "background task panicked");
            }
        }
        if let Err(e) = monitor_task.await {
            tracing::warn!(error = %e, "monitor task panicked");
        }

        if let Err(e) = self.post_process(meta.as_ref()).await {
            tracing::error!(error = %e, "post process error");
        }
        self.active.store(false, Ordering::SeqCst);

        tracing::info!(reason = %self.stop_reason(), "stopped");
        match token.cause() {
            Some(cause) if cause.is_failure() => Err(AppError::Stopped(cause)),
            _ => Ok(()),
        }
    }

    async fn post_process(&self, meta: Option<&metadata::TaskMetadata>) -> Result<(), EcsError> {
        let work = self.settings.post_process.run(self.ecs.as_ref(), meta);
        match tokio::time::timeout(POST_PROCESS_TIMEOUT, work).await {
            Ok(result) => result,
            Err(_) => Err(EcsError::Api {
                action: "finish post process",
                message: format!(
                    "timed out after {}",
                    humantime::format_duration(POST_PROCESS_TIMEOUT)
                ),
            }),
        }
    }
}
