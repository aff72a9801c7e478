use std::time::Duration;

pub mod exponential_backoff {
    /// Delay in whole units before retry number `retry_count` (1-based):
    /// `2^(retry_count - 1)`, capped at `max_duration`.
    pub fn get_duration(retry_count: u32, max_duration: u64) -> u64 {
        let exponent = retry_count.saturating_sub(1).min(63);
        let raw = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        raw.min(max_duration)
    }
}

/// Exponential retry delay expressed in a configurable unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBackoff {
    pub unit: Duration,
    pub max_units: u64,
}

impl RetryBackoff {
    pub fn new(unit: Duration, max_units: u64) -> Self {
        Self { unit, max_units }
    }

    pub fn delay(&self, retry_count: u32) -> Duration {
        let units = exponential_backoff::get_duration(retry_count, self.max_units);
        self.unit
            .checked_mul(u32::try_from(units).unwrap_or(u32::MAX))
            .unwrap_or(Duration::MAX)
    }
}

/// Wait between status polls. Starts at `interval`, doubles on every poll
/// that brought no output and snaps back when output arrives.
#[derive(Debug, Clone)]
pub struct ScriptObserverBackoff {
    interval: Duration,
    max_interval: Duration,
    quiet_polls: u32,
}

impl ScriptObserverBackoff {
    pub fn new(interval: Duration, max_interval: Duration) -> Self {
        Self {
            interval,
            max_interval: max_interval.max(interval),
            quiet_polls: 0,
        }
    }

    pub fn next_delay(&mut self, received_output: bool) -> Duration {
        if received_output {
            self.quiet_polls = 0;
            return self.interval;
        }
        self.quiet_polls = self.quiet_polls.saturating_add(1);
        let factor = exponential_backoff::get_duration(self.quiet_polls, u64::from(u32::MAX));
        self.interval
            .checked_mul(u32::try_from(factor).unwrap_or(u32::MAX))
            .unwrap_or(self.max_interval)
            .min(self.max_interval)
    }

    pub fn reset(&mut self) {
        self.quiet_polls = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::exponential_backoff::get_duration;
    use super::*;

    #[test]
    fn exponential_duration_is_capped() {
        assert_eq!(get_duration(1, 30), 1);
        assert_eq!(get_duration(2, 30), 2);
        assert_eq!(get_duration(5, 30), 16);
        assert_eq!(get_duration(10, 30), 30);
        assert_eq!(get_duration(200, 30), 30);
        assert_eq!(get_duration(0, 30), 1);
    }

    #[test]
    fn retry_backoff_scales_by_unit() {
        let backoff = RetryBackoff::new(Duration::from_millis(10), 30);
        assert_eq!(backoff.delay(1), Duration::from_millis(10));
        assert_eq!(backoff.delay(3), Duration::from_millis(40));
        assert_eq!(backoff.delay(12), Duration::from_millis(300));
    }

    #[test]
    fn observer_backoff_grows_while_quiet_and_resets_on_output() {
        let mut backoff =
            ScriptObserverBackoff::new(Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(false), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(false), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(false), Duration::from_millis(400));
        assert_eq!(backoff.next_delay(false), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(false), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(true), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(false), Duration::from_millis(100));
    }
}
