use crate::ecs::PostProcess;
use crate::logging::{LogFormat, LogLevel};
use crate::watchdog::Policy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_LOG_LOCATION: &str = "/var/log/amazon/ssm/amazon-ssm-agent.log";
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// One source of settings (config file or command line). Unset fields fall
/// through to the next layer and finally to the defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigLayer {
    pub ssm_agent_log_location: Option<PathBuf>,
    pub log_format: Option<LogFormat>,
    pub log_level: Option<LogLevel>,
    #[serde(with = "humantime_serde")]
    pub initial_wait_time: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub max_life_time: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub metrics_check_interval: Option<Duration>,
    pub set_desired_count_to_zero: Option<bool>,
    pub stop_task_on_exit: Option<bool>,
    pub keep_alive_task: Option<bool>,
    pub command: Option<Vec<String>>,
    pub metadata_uri: Option<String>,
}

impl ConfigLayer {
    /// Fill every unset field of `self` from `lower`.
    pub fn or(self, lower: ConfigLayer) -> ConfigLayer {
        ConfigLayer {
            ssm_agent_log_location: self.ssm_agent_log_location.or(lower.ssm_agent_log_location),
            log_format: self.log_format.or(lower.log_format),
            log_level: self.log_level.or(lower.log_level),
            initial_wait_time: self.initial_wait_time.or(lower.initial_wait_time),
            idle_timeout: self.idle_timeout.or(lower.idle_timeout),
            max_life_time: self.max_life_time.or(lower.max_life_time),
            metrics_check_interval: self.metrics_check_interval.or(lower.metrics_check_interval),
            set_desired_count_to_zero: self
                .set_desired_count_to_zero
                .or(lower.set_desired_count_to_zero),
            stop_task_on_exit: self.stop_task_on_exit.or(lower.stop_task_on_exit),
            keep_alive_task: self.keep_alive_task.or(lower.keep_alive_task),
            command: self.command.or(lower.command),
            metadata_uri: self.metadata_uri.or(lower.metadata_uri),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

/// Load a TOML config file.
pub fn load_file(path: &Path) -> Result<ConfigLayer, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Effective settings for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub log_path: PathBuf,
    pub log_format: LogFormat,
    pub log_level: LogLevel,
    pub policy: Policy,
    pub post_process: PostProcess,
    pub keep_alive_task: bool,
    /// Program and arguments to run as a wrapped child; empty when not wrapping.
    pub command: Vec<String>,
    pub metadata_uri: Option<String>,
}

impl Settings {
    pub fn resolve(layer: ConfigLayer) -> Settings {
        let idle_timeout = layer.idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT);
        let mut policy = Policy::new(idle_timeout)
            .initial_wait(layer.initial_wait_time)
            .max_lifetime(layer.max_life_time);
        if let Some(interval) = layer.metrics_check_interval {
            policy = policy.check_interval(interval);
        }

        Settings {
            log_path: layer
                .ssm_agent_log_location
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_LOCATION)),
            log_format: layer.log_format.unwrap_or_default(),
            log_level: layer.log_level.unwrap_or_default(),
            policy,
            post_process: PostProcess {
                stop_task: layer.stop_task_on_exit.unwrap_or(false),
                set_desired_count_to_zero: layer.set_desired_count_to_zero.unwrap_or(false),
            },
            keep_alive_task: layer.keep_alive_task.unwrap_or(false),
            command: layer.command.unwrap_or_default(),
            metadata_uri: layer.metadata_uri.filter(|uri| !uri.is_empty()),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings::resolve(ConfigLayer::default())
    }
}

/// Durations written as humantime strings (`"90s"`, `"15m"`, `"1h 30m"`).
mod humantime_serde {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let Some(raw) = Option::<String>::deserialize(deserializer)? else {
            return Ok(None);
        };
        humantime::parse_duration(&raw)
            .map(Some)
            .map_err(serde::de::Error::custom)
    }
}
