use std::time::Duration;

/// Engine tuning. One struct so every timer in the engine is traceable to
/// a named knob; `Default` matches production values.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How long an optimistic operation may stay pending before it is
    /// rolled back to its snapshot.
    pub revert_timeout: Duration,

    /// Lifetime of an edit lock from acquisition or renewal.
    pub lock_ttl: Duration,

    /// Quiet window that collapses rapid lock acquisitions into a single
    /// store write.
    pub lock_debounce: Duration,

    /// Interval of the expired-lock sweeper.
    pub sweep_interval: Duration,

    /// First reconnect delay after a dropped change stream.
    pub reconnect_initial: Duration,

    /// Ceiling for the exponential reconnect backoff.
    pub reconnect_max: Duration,

    /// Full-refresh polling cadence used while realtime is down.
    pub poll_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            revert_timeout: Duration::from_secs(10),
            lock_ttl: Duration::from_secs(5 * 60),
            lock_debounce: Duration::from_millis(300),
            sweep_interval: Duration::from_secs(60),
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
            poll_interval: Duration::from_secs(30),
        }
    }
}

impl SyncConfig {
    /// Reconnect delay for the given retry attempt, doubling up to the cap.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.reconnect_initial
            .saturating_mul(factor)
            .min(self.reconnect_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let cfg = SyncConfig::default();
        assert_eq!(cfg.reconnect_delay(0), Duration::from_millis(500));
        assert_eq!(cfg.reconnect_delay(1), Duration::from_secs(1));
        assert_eq!(cfg.reconnect_delay(2), Duration::from_secs(2));
        assert_eq!(cfg.reconnect_delay(10), cfg.reconnect_max);
        assert_eq!(cfg.reconnect_delay(u32::MAX), cfg.reconnect_max);
    }
}
