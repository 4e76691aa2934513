//! Exponential retry gate.
//!
//! `delay = min(base * 2^(attempts - 1), max)`. Before any failure the gate
//! is open; after a failure it stays closed until `delay` has elapsed since
//! the last recorded attempt.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5_000),
            max_delay: Duration::from_millis(600_000),
        }
    }
}

impl BackoffConfig {
    pub fn for_testing() -> Self {
        Self {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackoffCalculator {
    config: BackoffConfig,
    attempts: u32,
    last_attempt: Option<Instant>,
}

impl Default for BackoffCalculator {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

impl BackoffCalculator {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempts: 0,
            last_attempt: None,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Current delay; zero before any failure.
    pub fn delay(&self) -> Duration {
        if self.attempts == 0 {
            return Duration::ZERO;
        }
        let base = self.config.base_delay.as_millis() as u64;
        let factor = 1u64.checked_shl(self.attempts - 1).unwrap_or(u64::MAX);
        let millis = base.saturating_mul(factor);
        Duration::from_millis(millis).min(self.config.max_delay)
    }

    pub fn increase_error(&mut self) {
        self.increase_error_at(Instant::now());
    }

    pub fn increase_error_at(&mut self, now: Instant) {
        self.attempts = self.attempts.saturating_add(1);
        self.last_attempt = Some(now);
    }

    pub fn can_retry(&self) -> bool {
        self.can_retry_at(Instant::now())
    }

    pub fn can_retry_at(&self, now: Instant) -> bool {
        match self.last_attempt {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.delay(),
        }
    }

    /// Time left until `can_retry` turns true.
    pub fn remaining_at(&self, now: Instant) -> Duration {
        match self.last_attempt {
            None => Duration::ZERO,
            Some(last) => self.delay().saturating_sub(now.saturating_duration_since(last)),
        }
    }

    pub fn remaining(&self) -> Duration {
        self.remaining_at(Instant::now())
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.last_attempt = None;
    }
}
