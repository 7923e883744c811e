//! Per-operation deadline, retry and logging shared by the adapters.

use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::logging_impl::{OperationLog, sanitize_for_log};
use crate::retry::{RetryOptions, with_retry};

/// Runs one adapter operation: every attempt gets the configured timeout,
/// retryable failures are retried with backoff.
#[derive(Clone)]
pub(crate) struct OperationRunner {
    timeout: Duration,
    retry: RetryOptions<Error>,
    log: OperationLog,
}

impl OperationRunner {
    pub(crate) fn new(timeout: Duration, max_retries: u32, log: OperationLog) -> Self {
        let retry_log = log.clone();
        let retry = RetryOptions::new(max_retries).on_retry(move |err, attempt, delay| {
            retry_log.warn(&format!(
                "retry {} in {}ms after: {}",
                attempt,
                delay.as_millis(),
                err
            ));
        });
        Self {
            timeout,
            retry,
            log,
        }
    }

    /// Run `attempt` until it succeeds or fails for good.
    ///
    /// `attempt` is called once per try, so each try starts from scratch.
    /// Only pass attempts that are safe to repeat after a timeout, since the
    /// abandoned try may still have landed.
    pub(crate) async fn run<T, F, Fut>(&self, operation: &str, path: &str, attempt: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let shown = sanitize_for_log(path);
        self.log.debug(&format!("{} {}", operation, shown));

        let result = with_retry(
            || self.deadline(operation, path, attempt()),
            &self.retry,
        )
        .await;
        self.finish(operation, &shown, result)
    }

    /// Run a single attempt under the deadline, never retried.
    ///
    /// For writes that must not be applied twice, such as appends.
    pub(crate) async fn run_once<T, Fut>(&self, operation: &str, path: &str, attempt: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let shown = sanitize_for_log(path);
        self.log.debug(&format!("{} {} (single attempt)", operation, shown));
        let result = self.deadline(operation, path, attempt).await;
        self.finish(operation, &shown, result)
    }

    async fn deadline<T>(
        &self,
        operation: &str,
        path: &str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_elapsed) => Err(Error::timeout(operation, path, self.timeout.as_millis())),
        }
    }

    fn finish<T>(&self, operation: &str, shown: &str, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.log.trace(&format!("{} {} ok", operation, shown)),
            Err(e) => self
                .log
                .debug(&format!("{} {} failed: {}", operation, shown, e)),
        }
        result
    }
}
