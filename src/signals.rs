/// Signal handling for graceful shutdown.
///
/// SIGINT (Ctrl-C) and SIGTERM (sent by ECS when the task is stopped) both fire
/// the shared token with `StopCause::Interrupted`; the watchdog then finishes
/// the run exactly as it would for an idle stop.
use crate::shutdown::{ShutdownToken, StopCause};
use tokio::signal::unix::{signal, SignalKind};

pub fn spawn_signal_listener(token: ShutdownToken) -> std::io::Result<tokio::task::JoinHandle<()>> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => {
                tracing::info!("received SIGINT, shutting down");
                token.cancel(StopCause::Interrupted);
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                token.cancel(StopCause::Interrupted);
            }
            _ = token.cancelled() => {}
        }
    }))
}
