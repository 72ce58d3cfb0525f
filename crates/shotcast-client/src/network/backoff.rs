//! Reconnect delay policy: grows linearly with the attempt number up to a cap,
//! jittered by the randomization factor and kept within `[initial, max]`.

use std::time::Duration;

use rand::Rng;

use crate::config::ReconnectConfig;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    randomization_factor: f64,
    max_attempts: Option<u32>,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_delay_ms),
            max: Duration::from_millis(config.max_delay_ms.max(config.initial_delay_ms)),
            randomization_factor: config.randomization_factor.clamp(0.0, 1.0),
            max_attempts: config.max_attempts,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| self.attempt >= max) {
            return None;
        }
        self.attempt += 1;

        let base = self.initial.saturating_mul(self.attempt).min(self.max);
        Some(self.jitter(base).clamp(self.initial, self.max))
    }

    fn jitter(&self, base: Duration) -> Duration {
        if self.randomization_factor <= 0.0 {
            return base;
        }
        let spread = base.as_secs_f64() * self.randomization_factor;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0))
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
