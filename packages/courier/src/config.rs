//! Engine configuration.

use std::env;
use std::time::Duration;

use crate::error::{CourierError, Result};

/// Environment variable read by [`EngineConfig::from_env`].
pub const TIMER_SLACK_ENV: &str = "COURIER_TIMER_SLACK_US";

/// Default time before a deadline at which the timer loop stops sleeping
/// and starts yielding. Covers the up-to-two-tick overshoot of a tokio
/// sleep.
pub const DEFAULT_TIMER_SLACK: Duration = Duration::from_millis(3);

/// Tunables for an [`Engine`](crate::Engine).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// How long before a deadline the timer loop switches from sleeping to
    /// yielding. Zero relies on the tokio timer alone (millisecond
    /// granularity, may overshoot by up to two milliseconds).
    pub timer_slack: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timer_slack: DEFAULT_TIMER_SLACK,
        }
    }
}

impl EngineConfig {
    /// Defaults, overridden by `COURIER_TIMER_SLACK_US` when set.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = env::var(TIMER_SLACK_ENV) {
            config.timer_slack = parse_micros(&raw)?;
        }
        Ok(config)
    }

    pub fn with_timer_slack(mut self, slack: Duration) -> Self {
        self.timer_slack = slack;
        self
    }
}

fn parse_micros(raw: &str) -> Result<Duration> {
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_micros)
        .map_err(|e| CourierError::Config(format!("{TIMER_SLACK_ENV}={raw:?}: {e}")))
}
