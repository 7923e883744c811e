//! Retry with exponential backoff.
//!
//! [`with_retry`] re-invokes a fallible async operation until it succeeds,
//! fails with a non-retryable error, or the retry budget runs out. The last
//! error is returned unchanged.
//!
//! Delays grow as `base * 2^attempt`, are capped at 30 seconds, and carry
//! ±20% jitter. Both the sleep function and the jitter source can be
//! replaced, which keeps tests deterministic.

use futures_util::future::BoxFuture;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, ErrorKind};

/// First retry delay: 100ms
pub const BASE_DELAY: Duration = Duration::from_millis(100);

/// Largest delay between attempts: 30 seconds
pub const MAX_DELAY: Duration = Duration::from_secs(30);

/// Jitter applied to every delay: ±20%
pub const JITTER_RATIO: f64 = 0.2;

/// S3 and HTTP codes that indicate a transient server-side condition.
const RETRYABLE_CODES: &[&str] = &[
    "InternalError",
    "ServiceUnavailable",
    "SlowDown",
    "Throttling",
    "ThrottlingException",
    "RequestTimeout",
    "RequestLimitExceeded",
    "500",
    "502",
    "503",
    "504",
];

/// Whether an operation that failed with `error` may succeed if repeated.
///
/// Network failures (timeouts, resets, throttling) are retryable, and so are
/// storage errors carrying a transient server code such as `InternalError`
/// or HTTP 503. Everything else is final.
pub fn is_retryable_error(error: &Error) -> bool {
    match error.kind() {
        ErrorKind::Network => true,
        ErrorKind::Storage | ErrorKind::Other => error
            .code()
            .is_some_and(|code| RETRYABLE_CODES.contains(&code)),
        _ => false,
    }
}

/// Sleep function used between attempts.
pub type DelayFn = Arc<dyn Fn(Duration) -> BoxFuture<'static, ()> + Send + Sync>;

/// Source of jitter samples in `[-1.0, 1.0]`.
pub type JitterFn = Arc<dyn Fn() -> f64 + Send + Sync>;

/// Backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    /// Fraction of the delay used as jitter amplitude.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: BASE_DELAY,
            max: MAX_DELAY,
            jitter: JITTER_RATIO,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based), given a jitter sample
    /// in `[-1.0, 1.0]`.
    pub fn delay(&self, attempt: u32, sample: f64) -> Duration {
        let base = u64::try_from(self.base.as_nanos()).unwrap_or(u64::MAX);
        let max = u64::try_from(self.max.as_nanos()).unwrap_or(u64::MAX);
        let capped = base.saturating_mul(1u64 << attempt.min(40)).min(max);
        let jittered = (capped as f64 * (1.0 + self.jitter * sample.clamp(-1.0, 1.0))).round();
        Duration::from_nanos((jittered.max(0.0) as u64).min(max))
    }
}

/// Options for [`with_retry`].
pub struct RetryOptions<E> {
    /// Number of retries after the first attempt.
    pub max_retries: u32,
    pub is_retryable: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    /// Called with `(error, attempt, delay)` before each sleep.
    pub on_retry: Option<Arc<dyn Fn(&E, u32, Duration) + Send + Sync>>,
    pub backoff: Backoff,
    pub delay: DelayFn,
    pub jitter: JitterFn,
}

impl<E> Clone for RetryOptions<E> {
    fn clone(&self) -> Self {
        Self {
            max_retries: self.max_retries,
            is_retryable: Arc::clone(&self.is_retryable),
            on_retry: self.on_retry.clone(),
            backoff: self.backoff,
            delay: Arc::clone(&self.delay),
            jitter: Arc::clone(&self.jitter),
        }
    }
}

impl RetryOptions<Error> {
    /// Retry taxonomy errors with [`is_retryable_error`].
    pub fn new(max_retries: u32) -> Self {
        Self::with_predicate(max_retries, is_retryable_error)
    }
}

impl<E> RetryOptions<E> {
    /// Retry errors accepted by `predicate`, sleeping on the tokio timer.
    pub fn with_predicate(
        max_retries: u32,
        predicate: impl Fn(&E) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            max_retries,
            is_retryable: Arc::new(predicate),
            on_retry: None,
            backoff: Backoff::default(),
            delay: Arc::new(|d: Duration| -> BoxFuture<'static, ()> {
                Box::pin(tokio::time::sleep(d))
            }),
            jitter: Arc::new(|| rand::rng().random_range(-1.0..=1.0)),
        }
    }

    pub fn on_retry(mut self, f: impl Fn(&E, u32, Duration) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(f));
        self
    }

    pub fn delay_fn(mut self, delay: DelayFn) -> Self {
        self.delay = delay;
        self
    }

    pub fn jitter_fn(mut self, jitter: JitterFn) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Run `operation`, retrying retryable failures with backoff.
pub async fn with_retry<T, E, F, Fut>(mut operation: F, options: &RetryOptions<E>) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= options.max_retries || !(options.is_retryable)(&err) {
                    return Err(err);
                }
                let delay = options.backoff.delay(attempt, (options.jitter)());
                if let Some(on_retry) = &options.on_retry {
                    on_retry(&err, attempt + 1, delay);
                }
                (options.delay)(delay).await;
                attempt += 1;
            }
        }
    }
}
