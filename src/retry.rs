use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};

use crate::error::Error;
use crate::util::lock_unpoisoned;

/// What a strategy decides after a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrategyVerdict {
    Continue,
    ContinueAfter(Duration),
    Stop,
}

/// One evaluator in a retry policy.
///
/// Strategies run in order after every failed attempt with the number of
/// attempts made so far; the call stops at the first `Stop`. A requested delay
/// is slept by the executor before the next strategy runs, and the sleep ends
/// early when the call is cancelled.
pub trait RetryStrategy: Send + Sync {
    fn evaluate(&self, attempt: u32, error: &Error) -> StrategyVerdict;
}

impl<F> RetryStrategy for F
where
    F: Fn(u32, &Error) -> StrategyVerdict + Send + Sync,
{
    fn evaluate(&self, attempt: u32, error: &Error) -> StrategyVerdict {
        self(attempt, error)
    }
}

/// Shared random generator feeding jitter strategies.
///
/// Owned by a client and shared by every call it makes, so access goes through
/// a mutex.
#[derive(Clone, Debug)]
pub struct JitterSource {
    rng: Arc<Mutex<StdRng>>,
}

impl JitterSource {
    pub fn from_entropy() -> Self {
        let seed: u64 = rand::rng().random();
        Self::seeded(seed)
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }

    /// Standard normal sample (Box-Muller).
    pub(crate) fn standard_normal(&self) -> f64 {
        let (uniform_a, uniform_b) = {
            let mut rng = lock_unpoisoned(&self.rng);
            let uniform_a: f64 = rng.random();
            let uniform_b: f64 = rng.random();
            (uniform_a, uniform_b)
        };
        let radius = (-2.0 * (1.0 - uniform_a).ln()).sqrt();
        radius * (std::f64::consts::TAU * uniform_b).cos()
    }
}

impl Default for JitterSource {
    fn default() -> Self {
        Self::from_entropy()
    }
}

/// Caps the number of attempts of a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limit {
    max_attempts: u32,
}

impl Limit {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl RetryStrategy for Limit {
    fn evaluate(&self, attempt: u32, _error: &Error) -> StrategyVerdict {
        if attempt < self.max_attempts {
            StrategyVerdict::Continue
        } else {
            StrategyVerdict::Stop
        }
    }
}

/// `factor * 2^attempt`, saturating.
pub fn binary_exponential(factor: Duration, attempt: u32) -> Duration {
    let exponent = attempt.min(31);
    factor.saturating_mul(1_u32 << exponent)
}

/// Scales `duration` by `|1 + z * deviation|` with `z` drawn from a standard
/// normal distribution.
pub fn normal_jitter(duration: Duration, source: &JitterSource, deviation: f64) -> Duration {
    if duration.is_zero() || deviation <= f64::EPSILON {
        return duration;
    }
    let scale = (1.0 + source.standard_normal() * deviation).abs();
    Duration::try_from_secs_f64(duration.as_secs_f64() * scale).unwrap_or(Duration::MAX)
}

/// Binary exponential backoff with normally distributed jitter.
#[derive(Clone, Debug)]
pub struct BackoffWithJitter {
    factor: Duration,
    source: JitterSource,
    deviation: f64,
}

impl BackoffWithJitter {
    pub fn new(factor: Duration, source: JitterSource, deviation: f64) -> Self {
        Self {
            factor,
            source,
            deviation: deviation.max(0.0),
        }
    }
}

impl RetryStrategy for BackoffWithJitter {
    fn evaluate(&self, attempt: u32, _error: &Error) -> StrategyVerdict {
        let backoff = binary_exponential(self.factor, attempt);
        StrategyVerdict::ContinueAfter(normal_jitter(backoff, &self.source, self.deviation))
    }
}

pub(crate) const STANDARD_BACKOFF_FACTOR: Duration = Duration::from_millis(1);
pub(crate) const STANDARD_JITTER_DEVIATION: f64 = 0.25;

/// Per-attempt timeout plus the ordered strategies consulted between attempts.
///
/// Every policy starts with a [`Limit`] strategy, so a call always terminates.
#[derive(Clone)]
pub struct RetryPolicy {
    request_timeout: Duration,
    max_attempts: u32,
    strategies: Vec<Arc<dyn RetryStrategy>>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RetryPolicy")
            .field("request_timeout", &self.request_timeout)
            .field("max_attempts", &self.max_attempts)
            .field("strategies", &self.strategies.len())
            .finish()
    }
}

impl RetryPolicy {
    pub fn new<I>(request_timeout: Duration, max_attempts: u32, strategies: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn RetryStrategy>>,
    {
        let limit = Limit::new(max_attempts);
        let mut all: Vec<Arc<dyn RetryStrategy>> = vec![Arc::new(limit)];
        all.extend(strategies);
        Self {
            request_timeout,
            max_attempts: limit.max_attempts(),
            strategies: all,
        }
    }

    pub fn standard(request_timeout: Duration, max_attempts: u32, source: &JitterSource) -> Self {
        let backoff: Arc<dyn RetryStrategy> = Arc::new(BackoffWithJitter::new(
            STANDARD_BACKOFF_FACTOR,
            source.clone(),
            STANDARD_JITTER_DEVIATION,
        ));
        Self::new(request_timeout, max_attempts, [backoff])
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn strategies(&self) -> &[Arc<dyn RetryStrategy>] {
        &self.strategies
    }
}
