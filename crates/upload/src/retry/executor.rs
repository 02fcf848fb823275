//! Retry executor: drives one async operation through repeated attempts.

use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{join_all, try_join_all};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use posecoach_core::AttemptError;

use super::backoff::{self, RetryStrategy};

/// Observer called before each retry with `(attempt_number, error, delay)`.
///
/// `attempt_number` is 1 for the first retry.
pub type RetryObserver = Arc<dyn Fn(u32, &AttemptError, Duration) + Send + Sync>;

/// Cancels the retry loop it was taken from.
#[derive(Debug, Clone)]
pub struct CancelHandle(CancellationToken);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// Runs an operation under a [`RetryStrategy`].
///
/// Each attempt receives a child of the executor's cancellation token so
/// the operation can abort its own IO. Cancellation is checked before every
/// attempt and while waiting out a backoff delay; a cancelled executor fails
/// with `USER_ABORT` and makes no further attempts.
#[derive(Clone)]
pub struct RetryExecutor {
    strategy: RetryStrategy,
    cancel: CancellationToken,
    observer: Option<RetryObserver>,
    name: String,
}

impl RetryExecutor {
    pub fn new(strategy: RetryStrategy) -> Self {
        Self {
            strategy,
            cancel: CancellationToken::new(),
            observer: None,
            name: "operation".to_string(),
        }
    }

    /// Name used in log lines.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Share an existing cancellation token instead of a private one.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn on_retry<F>(mut self, observer: F) -> Self
    where
        F: Fn(u32, &AttemptError, Duration) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn strategy(&self) -> &RetryStrategy {
        &self.strategy
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancel.clone())
    }

    /// Attempt `operation` until it succeeds, the strategy refuses another
    /// retry, or the executor is cancelled. Fails with the last error.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T, AttemptError>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        let max_attempts = self.strategy.max_attempts();
        let mut attempt: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                debug!(operation = %self.name, attempt, "cancelled before attempt");
                return Err(AttemptError::aborted());
            }

            let started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(AttemptError::aborted()),
                r = operation(self.cancel.child_token()) => r,
            };

            let error = match result {
                Ok(value) => {
                    if attempt > 0 {
                        info!(
                            operation = %self.name,
                            retries = attempt,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !backoff::should_retry(attempt, &error, &self.strategy) {
                if error.is_abort() {
                    debug!(operation = %self.name, attempt = attempt + 1, "aborted");
                } else if attempt >= self.strategy.max_retries() {
                    warn!(
                        operation = %self.name,
                        attempts = attempt + 1,
                        error = %error,
                        "retries exhausted"
                    );
                } else {
                    error!(
                        operation = %self.name,
                        attempt = attempt + 1,
                        error = %error,
                        "non-retryable failure"
                    );
                }
                return Err(error);
            }

            let delay = backoff::next_delay(attempt, &self.strategy, &mut rand::thread_rng());

            warn!(
                operation = %self.name,
                attempt = attempt + 1,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                code = error.code.as_deref().unwrap_or("-"),
                "attempt failed, retrying"
            );

            self.notify(attempt + 1, &error, delay);

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(operation = %self.name, "cancelled during backoff");
                    return Err(AttemptError::aborted());
                }
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
        }
    }

    /// Like [`execute`](Self::execute), but every attempt races a timer and
    /// fails with `TIMEOUT` when it loses.
    pub async fn execute_with_timeout<T, F, Fut>(
        &self,
        limit: Duration,
        mut operation: F,
    ) -> Result<T, AttemptError>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        self.execute(move |token| with_timeout(limit, operation(token)))
            .await
    }

    fn notify(&self, attempt: u32, error: &AttemptError, delay: Duration) {
        let Some(observer) = &self.observer else {
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| observer(attempt, error, delay))).is_err() {
            error!(operation = %self.name, attempt, "retry observer panicked; ignoring");
        }
    }
}

/// Race `fut` against a timer. Losing drops (and so aborts) the operation.
pub async fn with_timeout<T, Fut>(limit: Duration, fut: Fut) -> Result<T, AttemptError>
where
    Fut: Future<Output = Result<T, AttemptError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(AttemptError::timeout(format!(
            "no response within {} ms",
            limit.as_millis()
        ))),
    }
}

/// One-shot convenience around [`RetryExecutor::execute`].
pub async fn retry_with_backoff<T, F, Fut>(
    strategy: RetryStrategy,
    operation: F,
) -> Result<T, AttemptError>
where
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, AttemptError>>,
{
    RetryExecutor::new(strategy).execute(operation).await
}

/// Run `operation` under `strategy` only if `precondition` resolves true.
pub async fn retry_when<T, C, F, Fut>(
    precondition: C,
    strategy: RetryStrategy,
    operation: F,
) -> Result<T, AttemptError>
where
    C: Future<Output = bool>,
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, AttemptError>>,
{
    if !precondition.await {
        return Err(AttemptError::invalid_params("retry condition not met"));
    }
    retry_with_backoff(strategy, operation).await
}

/// What [`batch_retry`] made of its operations.
#[derive(Debug)]
pub struct BatchRetryReport<T> {
    /// Successful values, in operation order
    pub results: Vec<T>,
    /// Failures as `(operation index, last error)`
    pub errors: Vec<(usize, AttemptError)>,
    pub total_count: usize,
    pub success_count: usize,
    pub error_count: usize,
}

/// Run every operation under `strategy`, `concurrency` at a time.
///
/// Operations start in chunks: the next chunk waits until the whole current
/// chunk has settled. With `fail_fast` the first exhausted operation fails
/// the call, its chunk siblings are dropped and later chunks never start.
pub async fn batch_retry<T, F, Fut>(
    operations: Vec<F>,
    strategy: RetryStrategy,
    concurrency: usize,
    fail_fast: bool,
) -> Result<BatchRetryReport<T>, AttemptError>
where
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, AttemptError>>,
{
    let total_count = operations.len();
    let mut report = BatchRetryReport {
        results: Vec::new(),
        errors: Vec::new(),
        total_count,
        success_count: 0,
        error_count: 0,
    };
    let mut pending = operations.into_iter().enumerate();

    loop {
        let chunk: Vec<(usize, F)> = pending.by_ref().take(concurrency.max(1)).collect();
        if chunk.is_empty() {
            break;
        }

        let runs = chunk.into_iter().map(|(index, operation)| {
            let executor =
                RetryExecutor::new(strategy.clone()).named(format!("batch operation {index}"));
            async move { (index, executor.execute(operation).await) }
        });

        let settled: Vec<(usize, Result<T, AttemptError>)> = if fail_fast {
            try_join_all(runs.map(|run| async move {
                match run.await {
                    (index, Ok(value)) => Ok((index, Ok(value))),
                    (index, Err(err)) => {
                        warn!(index, error = %err, "batch operation failed; stopping batch");
                        Err(err)
                    }
                }
            }))
            .await?
        } else {
            join_all(runs).await
        };

        for (index, result) in settled {
            match result {
                Ok(value) => {
                    report.results.push(value);
                    report.success_count += 1;
                }
                Err(err) => {
                    report.errors.push((index, err));
                    report.error_count += 1;
                }
            }
        }
    }

    debug!(
        total = report.total_count,
        succeeded = report.success_count,
        failed = report.error_count,
        "batch retry finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use futures::FutureExt;
    use futures::future::BoxFuture;
    use posecoach_core::ErrorKind;

    use crate::retry::RetryCondition;

    fn strategy(max_retries: u32, condition: RetryCondition) -> RetryStrategy {
        RetryStrategy::new(
            max_retries,
            Duration::from_millis(100),
            Duration::from_secs(1),
            2.0,
            false,
            condition,
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn success_on_first_attempt_skips_observer() {
        let notified = Arc::new(AtomicU32::new(0));
        let n = notified.clone();
        let executor = RetryExecutor::new(strategy(3, RetryCondition::Always))
            .on_retry(move |_, _, _| {
                n.fetch_add(1, Ordering::SeqCst);
            });

        let result = executor.execute(|_| async { Ok::<_, AttemptError>(42) }).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(notified.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn two_failures_then_success_reports_two_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_observer = seen.clone();

        let executor = RetryExecutor::new(strategy(3, RetryCondition::Always)).on_retry(
            move |attempt, _, delay| {
                seen_in_observer.lock().unwrap().push((attempt, delay));
            },
        );

        let c = calls.clone();
        let result = executor
            .execute(move |_| {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(AttemptError::network("reset"))
                    } else {
                        Ok("scored")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "scored");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (1, Duration::from_millis(100)),
                (2, Duration::from_millis(200)),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_return_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result = RetryExecutor::new(strategy(2, RetryCondition::Always))
            .execute(move |_| {
                let n = c.fetch_add(1, Ordering::SeqCst);
                async move { Err::<(), _>(AttemptError::server(format!("failure {n}"))) }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.message, "failure 2");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_errors_surface_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result = RetryExecutor::new(strategy(5, RetryCondition::Network))
            .execute(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(AttemptError::invalid_params("unknown pose")) }
            })
            .await;

        assert_eq!(result.unwrap_err().kind, ErrorKind::InvalidParams);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_aborts_without_new_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let executor = RetryExecutor::new(
            strategy(5, RetryCondition::Always).with_jitter(false),
        );
        let handle = executor.cancel_handle();

        let run = executor.execute(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(AttemptError::network("down")) }
        });
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.cancel();
        };

        let (result, ()) = tokio::join!(run, cancel);

        let err = result.unwrap_err();
        assert!(err.is_abort());
        assert_eq!(err.kind, ErrorKind::UserAbort);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_executor_never_calls_operation() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let executor = RetryExecutor::new(strategy(2, RetryCondition::Always));
        executor.cancel_handle().cancel();

        let result = executor
            .execute(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, AttemptError>(()) }
            })
            .await;

        assert!(result.unwrap_err().is_abort());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_token_observes_cancellation() {
        let executor = RetryExecutor::new(strategy(0, RetryCondition::Never));
        let handle = executor.cancel_handle();

        let run = executor.execute(|token| async move {
            token.cancelled().await;
            Err::<(), _>(AttemptError::aborted())
        });
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.cancel();
        };

        let (result, ()) = tokio::join!(run, cancel);
        assert!(result.unwrap_err().is_abort());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempts_time_out_and_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result = RetryExecutor::new(strategy(2, RetryCondition::Network))
            .execute_with_timeout(Duration::from_secs(1), move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok::<_, AttemptError>(())
                }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(err.has_code("TIMEOUT"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_observer_is_swallowed() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result = RetryExecutor::new(strategy(1, RetryCondition::Always))
            .on_retry(|_, _, _| panic!("observer bug"))
            .execute(move |_| {
                let first = c.fetch_add(1, Ordering::SeqCst) == 0;
                async move {
                    if first {
                        Err(AttemptError::network("flaky"))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_when_checks_precondition() {
        let result = retry_when(
            async { false },
            strategy(1, RetryCondition::Always),
            |_| async { Ok::<_, AttemptError>(()) },
        )
        .await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::InvalidParams);

        let result = retry_when(
            async { true },
            strategy(1, RetryCondition::Always),
            |_| async { Ok::<_, AttemptError>(1) },
        )
        .await;
        assert_eq!(result.unwrap(), 1);
    }

    fn scored_operations(
        count: u32,
        calls: &Arc<AtomicU32>,
    ) -> Vec<impl FnMut(CancellationToken) -> BoxFuture<'static, Result<u32, AttemptError>>> {
        (0..count)
            .map(|i| {
                let calls = calls.clone();
                move |_: CancellationToken| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        if i % 2 == 1 {
                            Err(AttemptError::invalid_params(format!("frame {i} unreadable")))
                        } else {
                            Ok(i * 10)
                        }
                    }
                    .boxed()
                }
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn batch_retry_counts_successes_and_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = tokio::time::Instant::now();

        let report = batch_retry(
            scored_operations(5, &calls),
            strategy(2, RetryCondition::Network),
            2,
            false,
        )
        .await
        .unwrap();

        assert_eq!(report.results, vec![0, 20, 40]);
        assert_eq!(
            report.errors.iter().map(|(i, _)| *i).collect::<Vec<_>>(),
            vec![1, 3]
        );
        assert_eq!(report.total_count, 5);
        assert_eq!(report.success_count, 3);
        assert_eq!(report.error_count, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        // Three chunks of at most two, one after another
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(started.elapsed() < Duration::from_millis(40));
    }

    #[tokio::test(start_paused = true)]
    async fn batch_retry_fail_fast_stops_later_chunks() {
        let calls = Arc::new(AtomicU32::new(0));

        let err = batch_retry(
            scored_operations(5, &calls),
            strategy(2, RetryCondition::Network),
            2,
            true,
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::InvalidParams);
        assert_eq!(err.message, "frame 1 unreadable");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
