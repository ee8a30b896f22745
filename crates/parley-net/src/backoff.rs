//! Capped exponential backoff for reconnect scheduling.

use std::time::Duration;

use rand::Rng;

use parley_shared::constants::{BACKOFF_BASE_MS, BACKOFF_CAP_MS};

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound on any single delay.
    pub cap: Duration,
    /// Scale each nominal delay by a random factor in `[0.5, 1.0]`.
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(BACKOFF_BASE_MS),
            cap: Duration::from_millis(BACKOFF_CAP_MS),
            jitter: true,
        }
    }
}

/// Produces the delay before each successive reconnect attempt.
///
/// Delays double per failed attempt up to the cap and reset to the base
/// after a successful handshake.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Number of consecutive failed attempts so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Advance to the next attempt and return how long to wait before it.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(16));
        let nominal = self.config.base.saturating_mul(factor).min(self.config.cap);
        self.attempt = self.attempt.saturating_add(1);

        if self.config.jitter {
            nominal.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
        } else {
            nominal
        }
    }

    /// Forget the failure streak after a successful handshake.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
