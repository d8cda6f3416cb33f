//! Exponential backoff for transient provider failures.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// How many times to try and how long to wait between tries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2,
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): base * multiplier^(retry-1), capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self
            .multiplier
            .checked_pow(retry.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Where the retry loop waits. Swapped out in tests so the schedule can be observed.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Outcome of a single attempt, as judged by the caller.
pub enum Attempt<T, E> {
    Done(T),
    /// Worth another try; the error is kept in case this was the last attempt
    Retry(E),
    Fail(E),
}

/// Final result together with how many attempts it took.
#[derive(Debug)]
pub struct Retried<T> {
    pub result: T,
    pub attempts: u32,
}

/// Run `operation` until it is done, fails permanently, or the attempts run out.
pub async fn run<T, E, F, Fut>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    mut operation: F,
) -> Retried<Result<T, E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Attempt::Done(value) => {
                return Retried {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Attempt::Fail(err) => {
                return Retried {
                    result: Err(err),
                    attempts: attempt,
                }
            }
            Attempt::Retry(err) if attempt >= policy.max_attempts => {
                warn!(attempts = attempt, error = %err, "giving up after retries");
                return Retried {
                    result: Err(err),
                    attempts: attempt,
                };
            }
            Attempt::Retry(err) => {
                let delay = policy.delay_for(attempt);
                debug!(attempt, ?delay, error = %err, "retrying after transient failure");
                sleeper.sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records requested delays without waiting.
    #[derive(Clone, Default)]
    pub struct RecordingSleeper {
        pub delays: Arc<Mutex<Vec<Duration>>>,
    }

    impl RecordingSleeper {
        pub fn recorded(&self) -> Vec<Duration> {
            self.delays.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.delays.lock().unwrap().push(duration);
        }
    }
}
