use std::time::Duration;

/// Tuning constants for the listening-room subsystem.
#[derive(Debug, Clone)]
pub struct Config {
    /// How long an empty room may stay idle before it is reaped
    pub room_idle_timeout: Duration,
    /// How often the registry scans for reapable rooms
    pub reap_interval: Duration,
    /// How many times a session retries after a non-auth connection error
    pub max_reconnect_attempts: u32,
    /// The first reconnect delay, doubled on every subsequent attempt
    pub reconnect_backoff: Duration,
    /// The upper bound on any reconnect delay
    pub reconnect_backoff_cap: Duration,
}

impl Config {
    /// The delay to wait before the given reconnect attempt, zero-indexed.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let delay = self
            .reconnect_backoff
            .saturating_mul(2u32.saturating_pow(exponent));

        delay.min(self.reconnect_backoff_cap)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            room_idle_timeout: Duration::from_secs(60 * 5),
            reap_interval: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            reconnect_backoff: Duration::from_millis(500),
            reconnect_backoff_cap: Duration::from_secs(30),
        }
    }
}
