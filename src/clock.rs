/// Wall-clock time source.
///
/// SSM agent log timestamps carry no zone offset and are written in the
/// container's local zone, so every comparison against them goes through a
/// naive local time obtained from a `Clock`.
use chrono::NaiveDateTime;
use std::time::Duration;

pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> NaiveDateTime;
}

/// The real local wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}

/// Time elapsed from `since` to `now`, clamped at zero when `since` lies in the future.
pub fn elapsed_between(since: NaiveDateTime, now: NaiveDateTime) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
pub use manual::ManualClock;
