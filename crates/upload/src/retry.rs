//! Bounded retry with exponential backoff.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Configuration for retrying a fallible operation with exponential backoff.
///
/// Stateless: every operation gets its own [`Backoff`] counter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Maximum delay between attempts (backoff cap).
    pub max_delay: Duration,
    /// Multiplier for each subsequent attempt.
    pub backoff_factor: f64,
    /// Apply ±25% jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Calculates the wait after failed attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if !self.jitter || capped <= 0.0 {
            return Duration::from_secs_f64(capped.max(0.0));
        }
        let jitter = capped * 0.25;
        let offset: f64 = rand::thread_rng().gen_range(-1.0..1.0);
        Duration::from_secs_f64((capped + jitter * offset).max(0.0))
    }

    /// Starts a fresh attempt counter bound to `cancel`.
    pub fn backoff<'a>(&'a self, cancel: &'a CancellationToken) -> Backoff<'a> {
        Backoff {
            policy: self,
            cancel,
            attempts: 0,
            observer: None,
        }
    }

    /// Runs `op` until it succeeds, fails fatally, or exhausts the policy.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        observer: Option<&RetryObserver>,
        mut op: F,
    ) -> Result<Retried<T>, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, Failure<E>>>,
        E: fmt::Display,
    {
        let mut backoff = self.backoff(cancel);
        if let Some(observer) = observer {
            backoff = backoff.observe(observer);
        }
        loop {
            let attempt = backoff.begin();
            match op(attempt).await {
                Ok(value) => {
                    return Ok(Retried {
                        value,
                        attempts: attempt,
                    });
                }
                Err(failure) => backoff.failed(failure).await?,
            }
        }
    }
}

/// A failed attempt, classified by the operation itself.
#[derive(Debug)]
pub struct Failure<E> {
    pub error: E,
    pub transient: bool,
}

impl<E> Failure<E> {
    /// A failure that may succeed if retried.
    pub fn transient(error: E) -> Self {
        Self {
            error,
            transient: true,
        }
    }

    /// A failure that retrying cannot fix.
    pub fn fatal(error: E) -> Self {
        Self {
            error,
            transient: false,
        }
    }
}

/// Successful result plus the attempt that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

/// Terminal outcome of a retried operation that did not succeed.
///
/// The last error is always returned verbatim.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Transient failures persisted through every allowed attempt.
    Exhausted { error: E, attempts: u32 },
    /// The operation reported a failure retrying cannot fix.
    Fatal { error: E, attempts: u32 },
    /// Cancellation arrived while waiting for the next attempt.
    Cancelled { error: E, attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. }
            | RetryError::Fatal { attempts, .. }
            | RetryError::Cancelled { attempts, .. } => *attempts,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }

    pub fn into_error(self) -> E {
        match self {
            RetryError::Exhausted { error, .. }
            | RetryError::Fatal { error, .. }
            | RetryError::Cancelled { error, .. } => error,
        }
    }
}

/// Details of a failed attempt that will be retried.
#[derive(Debug, Clone)]
pub struct RetryNotice {
    pub attempt: u32,
    pub max_attempts: u32,
    pub delay: Duration,
    pub error: String,
}

/// Callback invoked before each backoff wait.
pub type RetryObserver = dyn Fn(&RetryNotice) + Send + Sync;

/// Attempt counter for one operation.
///
/// Usage: call [`Backoff::begin`] before each attempt and
/// [`Backoff::failed`] after each failure. `failed` sleeps before returning
/// `Ok`, or returns the terminal [`RetryError`].
pub struct Backoff<'a> {
    policy: &'a RetryPolicy,
    cancel: &'a CancellationToken,
    attempts: u32,
    observer: Option<&'a RetryObserver>,
}

impl<'a> Backoff<'a> {
    /// Registers a callback notified before every wait.
    pub fn observe(mut self, observer: &'a RetryObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Marks the start of an attempt and returns its 1-based number.
    pub fn begin(&mut self) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.attempts
    }

    /// Attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Handles a failed attempt.
    pub async fn failed<E: fmt::Display>(
        &mut self,
        failure: Failure<E>,
    ) -> Result<(), RetryError<E>> {
        let attempts = self.attempts;
        if !failure.transient {
            debug!(attempt = attempts, error = %failure.error, "fatal failure, not retrying");
            return Err(RetryError::Fatal {
                error: failure.error,
                attempts,
            });
        }
        if attempts >= self.policy.max_attempts.max(1) {
            return Err(RetryError::Exhausted {
                error: failure.error,
                attempts,
            });
        }

        let delay = self.policy.delay_for_attempt(attempts);
        let delay_secs = delay.as_secs_f64();
        warn!(
            attempt = attempts,
            max_attempts = self.policy.max_attempts,
            delay_secs = format_args!("{delay_secs:.1}"),
            error = %failure.error,
            "attempt failed, retrying"
        );
        if let Some(observer) = self.observer {
            observer(&RetryNotice {
                attempt: attempts,
                max_attempts: self.policy.max_attempts,
                delay,
                error: failure.error.to_string(),
            });
        }

        tokio::select! {
            _ = self.cancel.cancelled() => {
                debug!(attempt = attempts, "retry wait cancelled");
                Err(RetryError::Cancelled { error: failure.error, attempts })
            }
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}
