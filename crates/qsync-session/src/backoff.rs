//! Reconnect backoff.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Consecutive failed attempts before the session gives up.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 10,
        }
    }
}

/// Exponential backoff with jitter. Each delay is drawn from
/// `[base / 2, base]` where `base` grows by `multiplier` up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    cfg: BackoffConfig,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(cfg: BackoffConfig) -> Self {
        let current = cfg.initial;
        Self {
            cfg,
            current,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self, rng: &mut impl Rng) -> Option<Duration> {
        if self.attempts >= self.cfg.max_attempts {
            return None;
        }
        self.attempts += 1;

        let base = self.current;
        self.current = Duration::from_secs_f64(
            (base.as_secs_f64() * self.cfg.multiplier).min(self.cfg.max.as_secs_f64()),
        );

        let hi = base.as_millis() as u64;
        let lo = hi / 2;
        let ms = if hi > lo { rng.gen_range(lo..=hi) } else { hi };
        Some(Duration::from_millis(ms))
    }

    pub fn reset(&mut self) {
        self.current = self.cfg.initial;
        self.attempts = 0;
    }
}

/// A recorded outage between losing and regaining the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionGap {
    pub disconnect_ts: DateTime<Utc>,
    pub reconnect_ts: DateTime<Utc>,
    pub gap_ms: u64,
    pub reason: String,
    /// Reconnect attempts before success.
    pub attempts: u32,
}
