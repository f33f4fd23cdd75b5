// src/delivery/backoff.rs
//! Exponential backoff with cap and jitter
//!
//! The delay after the n-th consecutive failure (n ≥ 1) is
//! `min(initial * 2^(n-1), max)`, then reduced by a random fraction of up
//! to `jitter` so that many clients coming back online do not retry in
//! lockstep. With `jitter = 0.0` the delays are exact and non-decreasing.

use rand::Rng;
use std::time::Duration;

/// Retry delay policy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    initial: Duration,
    max: Duration,
    jitter: f64,
}

impl BackoffPolicy {
    pub fn new(initial: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            initial,
            max: max.max(initial),
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay before the attempt following `failures` consecutive failures,
    /// without jitter
    pub fn base_delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let shift = (failures - 1).min(31);
        let delay = self.initial.saturating_mul(1u32 << shift);
        delay.min(self.max)
    }

    /// Jittered delay
    pub fn delay(&self, failures: u32) -> Duration {
        let unit = if self.jitter > 0.0 {
            rand::thread_rng().gen::<f64>()
        } else {
            0.0
        };
        self.delay_with(failures, unit)
    }

    /// Jittered delay using a caller-supplied sample from `[0, 1)`
    pub fn delay_with(&self, failures: u32, unit: f64) -> Duration {
        let base = self.base_delay(failures);
        let shave = self.jitter * unit.clamp(0.0, 1.0);
        if shave <= 0.0 {
            return base;
        }
        base.mul_f64(1.0 - shave)
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(300), 0.2)
    }
}
