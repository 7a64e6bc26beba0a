//! Retry policy and executor
//!
//! Used to bring worker processes up: each attempt is retried on a
//! [`Backoff`] schedule, optionally inside an overall time budget that
//! covers both the attempts and the waits between them.

use log::{debug, info, warn};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

use crate::backoff::Backoff;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Wall-clock limit for the whole run; an attempt in flight when it
    /// runs out is dropped
    pub budget: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_millis(100))
    }
}

impl RetryPolicy {
    /// Exponential doubling from `initial_delay`, capped at ten times it
    pub fn exponential(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::exponential(initial_delay, initial_delay.saturating_mul(10)),
            budget: None,
        }
    }

    /// Same delay before every retry
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::fixed(delay),
            budget: None,
        }
    }

    pub fn with_budget(mut self, budget: Option<Duration>) -> Self {
        self.budget = budget;
        self
    }
}

/// Trait for errors that can be retried
pub trait Retryable {
    fn is_retryable(&self) -> bool;

    /// Override the policy's delay for this error
    fn retry_delay(&self) -> Option<Duration> {
        None
    }
}

pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn execute<F, Fut, T, E>(&self, mut f: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + std::fmt::Display,
    {
        self.execute_with_context(|_attempt| f()).await
    }

    /// Run `f` until it succeeds, passing the 1-indexed attempt number
    pub async fn execute_with_context<F, Fut, T, E>(&self, mut f: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + std::fmt::Display,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let deadline = self.policy.budget.map(|budget| (budget, Instant::now() + budget));
        let mut attempt = 1;

        loop {
            debug!("Executing attempt {} of {}", attempt, max_attempts);

            let outcome = match deadline {
                None => f(attempt).await,
                Some((budget, at)) => match timeout(at.saturating_duration_since(Instant::now()), f(attempt)).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!("Attempt {} cut off by the {:?} budget", attempt, budget);
                        return Err(RetryError::BudgetExhausted {
                            attempts: attempt,
                            budget,
                            last_error: None,
                        });
                    }
                },
            };

            let error = match outcome {
                Ok(result) => {
                    if attempt > 1 {
                        info!("Operation succeeded after {} attempts", attempt);
                    }
                    return Ok(result);
                }
                Err(error) => error,
            };

            if !error.is_retryable() {
                warn!("Operation failed with non-retryable error: {}", error);
                return Err(RetryError::NonRetryableError(error));
            }
            if attempt >= max_attempts {
                warn!("Operation failed after {} attempts: {}", attempt, error);
                return Err(RetryError::MaxAttemptsExceeded {
                    attempts: attempt,
                    last_error: error,
                });
            }

            let delay = error
                .retry_delay()
                .unwrap_or_else(|| self.policy.backoff.delay(attempt));
            if let Some((budget, at)) = deadline {
                if Instant::now() + delay >= at {
                    warn!("Attempt {} failed: {}. No budget left to retry", attempt, error);
                    return Err(RetryError::BudgetExhausted {
                        attempts: attempt,
                        budget,
                        last_error: Some(error),
                    });
                }
            }

            warn!("Attempt {} failed: {}. Retrying in {:?}", attempt, error, delay);
            sleep(delay).await;
            attempt += 1;
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("Maximum retry attempts ({attempts}) exceeded. Last error: {last_error}")]
    MaxAttemptsExceeded { attempts: u32, last_error: E },

    #[error("Non-retryable error: {0}")]
    NonRetryableError(E),

    /// `last_error` is `None` when the budget ran out mid-attempt
    #[error("Retry budget of {budget:?} exhausted after {attempts} attempts")]
    BudgetExhausted {
        attempts: u32,
        budget: Duration,
        last_error: Option<E>,
    },
}

impl<E> RetryError<E> {
    /// The last error an attempt returned, if any attempt completed
    pub fn into_last_error(self) -> Option<E> {
        match self {
            RetryError::MaxAttemptsExceeded { last_error, .. } => Some(last_error),
            RetryError::NonRetryableError(error) => Some(error),
            RetryError::BudgetExhausted { last_error, .. } => last_error,
        }
    }

    /// Attempts started before giving up
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::MaxAttemptsExceeded { attempts, .. }
            | RetryError::BudgetExhausted { attempts, .. } => *attempts,
            RetryError::NonRetryableError(_) => 1,
        }
    }
}
