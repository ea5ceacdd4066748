//! Wait-time computation for retried requests.
//!
//! Pure arithmetic: no sleeping happens here. Randomness comes from a
//! [`JitterSource`] so timing is reproducible under a fixed seed.

use rand::{Rng, SeedableRng, rngs::StdRng};
use std::{sync::Mutex, time::Duration};

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_JITTER: Duration = Duration::from_millis(500);
pub const DEFAULT_WAIT_CEILING: Duration = Duration::from_secs(600);

/// Source of uniformly distributed samples in `[0, 1)`.
pub trait JitterSource: Send + Sync {
    fn sample(&self) -> f64;
}

/// Jitter drawn from the thread-local generator.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRngJitter;

impl JitterSource for ThreadRngJitter {
    fn sample(&self) -> f64 {
        rand::thread_rng().gen_range(0.0..1.0)
    }
}

/// Deterministic jitter for reproducible schedules.
#[derive(Debug)]
pub struct SeededJitter {
    rng: Mutex<StdRng>,
}

impl SeededJitter {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl JitterSource for SeededJitter {
    fn sample(&self) -> f64 {
        match self.rng.lock() {
            Ok(mut rng) => rng.gen_range(0.0..1.0),
            Err(poisoned) => poisoned.into_inner().gen_range(0.0..1.0),
        }
    }
}

/// Always returns the same sample; clamped into `[0, 1)`.
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn sample(&self) -> f64 {
        self.0.clamp(0.0, 1.0 - f64::EPSILON)
    }
}

/// Exponential backoff with bounded jitter and a hard ceiling.
///
/// Attempt `i` (1-based) waits `base * 2^(i-1) + jitter` where
/// `jitter ∈ [0, max_jitter)`. A server hint replaces the computed value.
/// No single wait exceeds `ceiling`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max_jitter: Duration,
    pub ceiling: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE_DELAY,
            max_jitter: DEFAULT_MAX_JITTER,
            ceiling: DEFAULT_WAIT_CEILING,
        }
    }
}

impl BackoffPolicy {
    /// Scaled-down policy keeping the same shape, handy for tests and local
    /// mock servers.
    pub fn scaled(base: Duration) -> Self {
        Self {
            base,
            max_jitter: base / 2,
            ceiling: base.saturating_mul(600),
        }
    }

    pub fn with_ceiling(mut self, ceiling: Duration) -> Self {
        self.ceiling = ceiling;
        self
    }

    /// Wait before the retry that follows failed attempt `attempt`.
    pub fn delay(
        &self,
        attempt: u32,
        server_hint: Option<Duration>,
        jitter: &dyn JitterSource,
    ) -> Duration {
        if let Some(hint) = server_hint {
            return hint.min(self.ceiling);
        }

        let exponent = attempt.max(1) - 1;
        let multiplier = 2_u32.checked_pow(exponent).unwrap_or(u32::MAX);
        let exponential = self.base.saturating_mul(multiplier);
        let noise = self.max_jitter.mul_f64(jitter.sample());

        exponential.saturating_add(noise).min(self.ceiling)
    }
}

/// Parse a `Retry-After` value given in whole or fractional seconds.
///
/// HTTP-date values and garbage are ignored so the caller falls back to
/// exponential backoff.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs: f64 = value.trim().parse().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}
