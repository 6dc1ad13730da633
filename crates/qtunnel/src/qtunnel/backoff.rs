//! Bounded exponential backoff with jitter for redial attempts.

use std::time::Duration;

use rand::{RngExt, rng};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction (0.0..=1.0) of the base delay added at random.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Clamp nonsensical values instead of rejecting them.
    pub fn sanitized(mut self) -> Self {
        if self.max < self.initial {
            self.max = self.initial;
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            self.multiplier = 1.0;
        }
        if !self.jitter.is_finite() {
            self.jitter = 0.0;
        }
        self.jitter = self.jitter.clamp(0.0, 1.0);
        self
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        let policy = policy.sanitized();
        Self {
            current: policy.initial,
            policy,
        }
    }

    /// Delay to wait before the next attempt. Never exceeds `max`.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;

        let grown = base.as_secs_f64() * self.policy.multiplier;
        self.current = Duration::from_secs_f64(grown.min(self.policy.max.as_secs_f64()));

        if self.policy.jitter == 0.0 || base.is_zero() {
            return base;
        }
        let extra = base.as_secs_f64() * self.policy.jitter * rng().random_range(0.0..1.0);
        (base + Duration::from_secs_f64(extra)).min(self.policy.max)
    }

    /// Back to the initial delay, after a successful connect.
    pub fn reset(&mut self) {
        self.current = self.policy.initial;
    }
}
