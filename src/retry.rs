//! Exponential backoff with full jitter for remote calls.
//!
//! Every remote dependency of the pipeline (Postgres, Elasticsearch) is
//! wrapped in the same transient-failure strategy: retry with a delay that
//! grows by a configured factor, where each actual wait is sampled uniformly
//! from `[0, 2 × delay]` and capped at a ceiling. The unbounded variant
//! retries forever; the sync job is a batch poller, so blocking the single
//! logical task while waiting is acceptable.

use crate::{Error, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Backoff policy for retrying fallible remote operations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Initial delay before the first retry.
    pub base_delay: Duration,

    /// Multiplier applied to the delay after each failed attempt.
    pub factor: f64,

    /// Ceiling for both the sampled wait and the delay growth.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            factor: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Retry `op` until it succeeds.
    ///
    /// Each failure is logged at info level with the causing error, then the
    /// task sleeps for a jittered delay before the next attempt. There is no
    /// attempt limit; the operation either succeeds or the process is
    /// terminated externally.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> T
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delay = self.base_delay;
        loop {
            match op().await {
                Ok(value) => return value,
                Err(e) => {
                    let wait = self.sample_wait(delay);
                    tracing::info!(
                        "{} unavailable, will retry in {:.1}s: {}",
                        what,
                        wait.as_secs_f64(),
                        e
                    );
                    tokio::time::sleep(wait).await;
                    delay = self.grow(delay);
                }
            }
        }
    }

    /// Retry `op` up to `max_attempts` times.
    ///
    /// Returns [`Error::RetriesExhausted`] if every attempt fails. Callers
    /// that cannot afford to block forever (e.g. one-shot invocations) use
    /// this instead of [`RetryPolicy::run`].
    pub async fn run_bounded<T, F, Fut>(&self, what: &str, max_attempts: u32, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delay = self.base_delay;
        for attempt in 1..=max_attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt == max_attempts => {
                    tracing::warn!("{} failed on final attempt {}: {}", what, attempt, e);
                }
                Err(e) => {
                    let wait = self.sample_wait(delay);
                    tracing::info!(
                        "{} failed (attempt {}/{}), will retry in {:.1}s: {}",
                        what,
                        attempt,
                        max_attempts,
                        wait.as_secs_f64(),
                        e
                    );
                    tokio::time::sleep(wait).await;
                    delay = self.grow(delay);
                }
            }
        }
        Err(Error::RetriesExhausted {
            operation: what.to_string(),
            attempts: max_attempts,
        })
    }

    /// Sample the actual wait uniformly from `[0, 2 × delay]`, capped.
    fn sample_wait(&self, delay: Duration) -> Duration {
        let upper = delay.as_secs_f64() * 2.0;
        let sampled = rand::thread_rng().gen_range(0.0..=upper);
        Duration::from_secs_f64(sampled).min(self.max_delay)
    }

    /// Grow the delay for the next attempt, capped at the ceiling.
    fn grow(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(delay.as_secs_f64() * self.factor).min(self.max_delay)
    }
}
