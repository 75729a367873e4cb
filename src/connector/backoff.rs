//! Retry schedule for failed handshakes and polls.

use std::time::Duration;

use crate::config::ConnectorSettings;

/// Exponential backoff: the n-th consecutive failure waits
/// `min(max, initial * factor^(n-1))`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    failures: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, factor: f64) -> Self {
        Self {
            initial,
            max,
            factor,
            failures: 0,
        }
    }

    pub fn from_settings(settings: &ConnectorSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.initial_backoff_ms),
            Duration::from_millis(settings.max_backoff_ms),
            settings.backoff_factor,
        )
    }

    /// Consecutive failures since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Records a failure and returns how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.delay_for(self.failures)
    }

    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(failures - 1).unwrap_or(i32::MAX);
        let millis = self.initial.as_millis() as f64 * self.factor.powi(exponent);
        let capped = millis.min(self.max.as_millis() as f64);
        if capped.is_nan() {
            return self.max;
        }
        Duration::from_millis(capped.round() as u64)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}
