//! Reconnect backoff
//!
//! Each call to [`ExponentialBackoff::delay`] doubles the wait, up to
//! `base * 2^max_exponent`. A quiet period longer than the reset threshold
//! (by default `base * 2^(max_exponent + 1)`) starts the sequence over, so a
//! connection that stayed up for a while reconnects quickly.
//!
//! Time and randomness are injectable: [`ExponentialBackoff::delay_at`] takes
//! the current instant and [`ExponentialBackoff::with_rng`] takes any
//! [`rand::Rng`].

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};

use crate::config::BackoffConfig;

pub struct ExponentialBackoff<R = StdRng> {
    base: Duration,
    max_exponent: u32,
    reset_after: Duration,
    exponent: u32,
    last_invocation: Instant,
    rng: R,
}

impl ExponentialBackoff<StdRng> {
    pub fn new(config: &BackoffConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }
}

impl<R: Rng> ExponentialBackoff<R> {
    pub fn with_rng(config: &BackoffConfig, rng: R) -> Self {
        let base = config.base();
        let max_exponent = config.max_exponent;
        Self {
            base,
            max_exponent,
            reset_after: base.saturating_mul(factor(max_exponent.saturating_add(1))),
            exponent: 0,
            last_invocation: Instant::now(),
            rng,
        }
    }

    /// Override the quiet period after which the exponent resets.
    pub fn with_reset_after(mut self, reset_after: Duration) -> Self {
        self.reset_after = reset_after;
        self
    }

    /// Delay before the next attempt, measured against the current time.
    pub fn delay(&mut self) -> Duration {
        self.delay_at(Instant::now())
    }

    /// Delay before the next attempt, given the current time.
    pub fn delay_at(&mut self, now: Instant) -> Duration {
        let interval = now.saturating_duration_since(self.last_invocation);
        self.last_invocation = now;

        if interval > self.reset_after {
            self.exponent = 0;
        }
        self.exponent = (self.exponent + 1).min(self.max_exponent);

        // jitter stays below one base unit so consecutive delays never shrink
        let jitter = self.base.mul_f64(self.rng.gen::<f64>());
        let cap = self.base.saturating_mul(factor(self.max_exponent));

        self.base
            .saturating_mul(factor(self.exponent))
            .saturating_add(jitter)
            .min(cap)
    }

    pub fn exponent(&self) -> u32 {
        self.exponent
    }
}

fn factor(exponent: u32) -> u32 {
    1u32.checked_shl(exponent).unwrap_or(u32::MAX)
}
