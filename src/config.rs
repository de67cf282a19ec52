use std::str::FromStr;
use std::time::Duration;

use chrono::Duration as ChronoDuration;

/// Tuning values for the detection engine. Every threshold the product team
/// may want to adjust lives here; nothing in the heuristics is hard-coded.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub history_cap: usize,
    pub retention_hours: i64,
    pub future_skew_secs: i64,
    pub housekeeping_interval: Duration,
    pub cooldown_secs: i64,
    pub low_severity: f64,
    pub high_severity: f64,
    pub error_window: usize,
    pub error_streak_threshold: usize,
    pub trend_window: usize,
    pub help_seeking_threshold: usize,
    pub help_seeking_window_mins: i64,
    pub send_timeout: Duration,
    pub send_queue_depth: usize,
    pub mailbox_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_cap: 50,
            retention_hours: 24,
            future_skew_secs: 30,
            housekeeping_interval: Duration::from_secs(120),
            cooldown_secs: 300,
            low_severity: 0.4,
            high_severity: 0.75,
            error_window: 4,
            error_streak_threshold: 3,
            trend_window: 3,
            help_seeking_threshold: 5,
            help_seeking_window_mins: 30,
            send_timeout: Duration::from_secs(2),
            send_queue_depth: 64,
            mailbox_depth: 128,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by STRUGGLE_* environment variables where set.
    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            history_cap: env_or("STRUGGLE_HISTORY_CAP", base.history_cap),
            retention_hours: env_or("STRUGGLE_RETENTION_HOURS", base.retention_hours),
            future_skew_secs: env_or("STRUGGLE_FUTURE_SKEW_SECS", base.future_skew_secs),
            housekeeping_interval: Duration::from_secs(env_or(
                "STRUGGLE_HOUSEKEEPING_SECS",
                base.housekeeping_interval.as_secs(),
            )),
            cooldown_secs: env_or("STRUGGLE_COOLDOWN_SECS", base.cooldown_secs),
            low_severity: env_or("STRUGGLE_LOW_SEVERITY", base.low_severity),
            high_severity: env_or("STRUGGLE_HIGH_SEVERITY", base.high_severity),
            error_window: env_or("STRUGGLE_ERROR_WINDOW", base.error_window),
            error_streak_threshold: env_or(
                "STRUGGLE_ERROR_STREAK",
                base.error_streak_threshold,
            ),
            trend_window: env_or("STRUGGLE_TREND_WINDOW", base.trend_window),
            help_seeking_threshold: env_or(
                "STRUGGLE_HELP_SEEKING_THRESHOLD",
                base.help_seeking_threshold,
            ),
            help_seeking_window_mins: env_or(
                "STRUGGLE_HELP_SEEKING_WINDOW_MINS",
                base.help_seeking_window_mins,
            ),
            send_timeout: Duration::from_millis(env_or(
                "STRUGGLE_SEND_TIMEOUT_MS",
                base.send_timeout.as_millis() as u64,
            )),
            send_queue_depth: env_or("STRUGGLE_SEND_QUEUE_DEPTH", base.send_queue_depth),
            mailbox_depth: env_or("STRUGGLE_MAILBOX_DEPTH", base.mailbox_depth),
        }
    }

    pub fn retention(&self) -> ChronoDuration {
        ChronoDuration::hours(self.retention_hours.max(1))
    }

    pub fn cooldown(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.cooldown_secs.max(0))
    }

    pub fn future_skew(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.future_skew_secs.max(0))
    }

    pub fn help_seeking_window(&self) -> ChronoDuration {
        ChronoDuration::minutes(self.help_seeking_window_mins.max(1))
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or(default),
        Err(_) => default,
    }
}
