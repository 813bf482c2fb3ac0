mod app;
mod clock;
mod config;
mod ecs;
mod logging;
mod metadata;
mod monitor;
mod parser;
mod retry;
mod shutdown;
mod signals;
mod tail;
mod watchdog;
mod wrapper;

use clap::Parser;
use config::ConfigLayer;
use logging::{LogFormat, LogLevel};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Stops an ECS task once nobody is using it through ECS Exec / SSM sessions.
///
/// Follows the SSM agent log, counts session worker starts and closes, and
/// ends the task after a period of inactivity. Anything after `--` is run as
/// a wrapped command.
#[derive(Parser, Debug)]
#[command(name = "ecs-task-self-terminator", version, about)]
pub struct Cli {
    /// TOML config file; command line and environment take precedence
    #[arg(long, env = "ECS_TST_CONFIG")]
    config: Option<PathBuf>,

    /// Path of the SSM agent log to follow
    #[arg(long, env = "ECS_TST_SSM_AGENT_LOG_LOCATION")]
    ssm_agent_log_location: Option<PathBuf>,

    /// Log output format
    #[arg(long, env = "ECS_TST_LOG_FORMAT", value_enum)]
    log_format: Option<LogFormat>,

    /// Minimum log level
    #[arg(long, env = "ECS_TST_LOG_LEVEL", value_enum)]
    log_level: Option<LogLevel>,

    /// How long to wait for a first session (default: idle timeout)
    #[arg(long, env = "ECS_TST_INITIAL_WAIT_TIME", value_parser = humantime::parse_duration)]
    initial_wait_time: Option<Duration>,

    /// Stop after all sessions have been closed this long (default: 15m)
    #[arg(long, env = "ECS_TST_IDLE_TIMEOUT", value_parser = humantime::parse_duration)]
    idle_timeout: Option<Duration>,

    /// Stop unconditionally after this long
    #[arg(long, env = "ECS_TST_MAX_LIFE_TIME", value_parser = humantime::parse_duration)]
    max_life_time: Option<Duration>,

    /// How often session metrics are checked (default: 1s)
    #[arg(long, env = "ECS_TST_METRICS_CHECK_INTERVAL", value_parser = humantime::parse_duration)]
    metrics_check_interval: Option<Duration>,

    /// Scale the task's service to zero on exit
    #[arg(long, env = "ECS_TST_SET_DESIRED_COUNT_TO_ZERO")]
    set_desired_count_to_zero: bool,

    /// Call StopTask on exit
    #[arg(long, env = "ECS_TST_STOP_TASK")]
    stop_task_on_exit: bool,

    /// Keep running after the wrapped command exits
    #[arg(long, env = "ECS_TST_KEEP_ALIVE_TASK")]
    keep_alive_task: bool,

    #[arg(long, env = metadata::METADATA_URI_ENV, hide = true)]
    metadata_uri: Option<String>,

    /// Command to run as a wrapped child
    #[arg(value_name = "COMMAND", trailing_var_arg = true, allow_hyphen_values = true)]
    commands: Vec<String>,
}

impl Cli {
    fn into_layer(self) -> ConfigLayer {
        ConfigLayer {
            ssm_agent_log_location: self.ssm_agent_log_location,
            log_format: self.log_format,
            log_level: self.log_level,
            initial_wait_time: self.initial_wait_time,
            idle_timeout: self.idle_timeout,
            max_life_time: self.max_life_time,
            metrics_check_interval: self.metrics_check_interval,
            set_desired_count_to_zero: self.set_desired_count_to_zero.then_some(true),
            stop_task_on_exit: self.stop_task_on_exit.then_some(true),
            keep_alive_task: self.keep_alive_task.then_some(true),
            command: (!self.commands.is_empty()).then_some(self.commands),
            metadata_uri: self.metadata_uri,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = cli.config.clone();
    let mut layer = cli.into_layer();
    if let Some(path) = config_path {
        match config::load_file(&path) {
            Ok(file) => layer = layer.or(file),
            Err(e) => {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
    }
    let settings = config::Settings::resolve(layer);

    logging::init(settings.log_format, settings.log_level);
    tracing::debug!(?settings, "resolved settings");

    let token = shutdown::ShutdownToken::new();
    if let Err(e) = signals::spawn_signal_listener(token.clone()) {
        tracing::error!(error = %e, "failed to install signal handlers");
        std::process::exit(1);
    }

    let ecs = ecs::AwsEcsClient::from_env().await;
    let app = app::App::new(settings, Arc::new(clock::SystemClock), Arc::new(ecs));
    if let Err(e) = app.run(token).await {
        tracing::error!(error = %e, "ecs-task-self-terminator failed");
        std::process::exit(e.exit_code());
    }
}
