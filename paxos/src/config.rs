//! Retry timing and the knobs of a [`Proposer`](crate::Proposer)

use std::future::Future;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Exponential backoff between failed rounds.
///
/// The delay before retry `n` is `initial * multiplier^n`, scaled by a random
/// factor in `[0.5, 1.5)`, and never above `max`.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(10),
            max: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `retries` (zero based)
    #[must_use]
    pub fn duration(&self, retries: u32, rng: &mut impl Rng) -> Duration {
        let exponent = i32::try_from(retries).unwrap_or(i32::MAX);
        let scaled = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        let jittered = scaled * rng.random_range(0.5..1.5);
        Duration::from_secs_f64(jittered.min(self.max.as_secs_f64()))
    }
}

/// Retry bookkeeping for one `propose` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    /// Rounds that have failed so far
    pub attempt: u32,
    /// Total number of rounds allowed, including the first
    pub max_attempts: u32,
    /// Backoff before the next round, once one has failed
    pub next_delay: Option<Duration>,
}

impl RetryState {
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            next_delay: None,
        }
    }

    /// Record a failed round.
    ///
    /// Returns the delay to wait before the next round, or `None` once the
    /// attempt budget is exhausted.
    pub fn record_failure(&mut self, backoff: &BackoffConfig, rng: &mut impl Rng) -> Option<Duration> {
        self.attempt = self.attempt.saturating_add(1);
        if self.attempt >= self.max_attempts {
            self.next_delay = None;
            return None;
        }
        let delay = backoff.duration(self.attempt - 1, rng);
        self.next_delay = Some(delay);
        Some(delay)
    }

    #[must_use]
    pub fn exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Timer used between rounds and for round deadlines
pub trait Sleep: Clone + Send + Sync + 'static {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TokioSleep;

impl Sleep for TokioSleep {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

pub struct ProposerConfig<S: Sleep, R: Rng = StdRng> {
    pub backoff: BackoffConfig,
    pub sleep: S,
    /// Source of backoff jitter
    pub rng: R,
    /// Bound on each round, covering both phases
    pub timeout: Duration,
    /// Rounds retried after the first one fails
    pub max_retries: u32,
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_MAX_RETRIES: u32 = 5;

impl<S: Sleep, R: Rng> ProposerConfig<S, R> {
    /// Default round timeout and retry budget
    pub fn new(backoff: BackoffConfig, sleep: S, rng: R) -> Self {
        Self {
            backoff,
            sleep,
            rng,
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

impl<S: Sleep> ProposerConfig<S, StdRng> {
    /// Reproducible jitter, for simulations
    #[must_use]
    pub fn with_seed(backoff: BackoffConfig, sleep: S, seed: u64) -> Self {
        Self::new(backoff, sleep, StdRng::seed_from_u64(seed))
    }
}

impl Default for ProposerConfig<TokioSleep, StdRng> {
    fn default() -> Self {
        Self::new(BackoffConfig::default(), TokioSleep, StdRng::from_os_rng())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_capped() {
        let backoff = BackoffConfig {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(400),
            multiplier: 2.0,
        };
        let mut rng = StdRng::seed_from_u64(7);
        for retries in 0..10 {
            let d = backoff.duration(retries, &mut rng);
            assert!(d <= Duration::from_millis(400), "{d:?}");
        }
    }

    #[test]
    fn test_retry_state_bounds_attempts() {
        let backoff = BackoffConfig::default();
        let mut rng = StdRng::seed_from_u64(1);
        let mut retry = RetryState::new(3);

        assert!(retry.record_failure(&backoff, &mut rng).is_some());
        assert_eq!(retry.attempt, 1);
        assert!(retry.next_delay.is_some());
        assert!(retry.record_failure(&backoff, &mut rng).is_some());
        assert!(!retry.exhausted());
        assert_eq!(retry.record_failure(&backoff, &mut rng), None);
        assert!(retry.exhausted());
        assert_eq!(retry.next_delay, None);
    }

    #[test]
    fn test_single_attempt_never_retries() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut retry = RetryState::new(1);
        assert_eq!(retry.record_failure(&BackoffConfig::default(), &mut rng), None);
    }
}
