use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use tentacle_protocol::RpcError;

use crate::backoff::RetryBackoff;
use crate::config::RpcRetryOptions;
use crate::error::{ClientResult, TentacleClientError};
use crate::metrics::{AttemptOutcome, RpcCall, RpcCallMetricsBuilder};

enum Attempt<T> {
    Completed(Result<T, RpcError>),
    TimedOut,
    Canceled,
}

/// Runs one RPC call, retrying transient failures inside a fixed time
/// budget.
#[derive(Debug, Clone)]
pub struct RpcCallRetryHandler {
    retry_timeout: Duration,
    backoff: RetryBackoff,
    retry_if_remaining_at_least: Duration,
}

impl RpcCallRetryHandler {
    pub fn new(
        retry_timeout: Duration,
        backoff: RetryBackoff,
        retry_if_remaining_at_least: Duration,
    ) -> Self {
        Self {
            retry_timeout,
            backoff,
            retry_if_remaining_at_least,
        }
    }

    pub fn from_options(options: &RpcRetryOptions) -> Self {
        Self::new(
            options.retry_timeout(),
            options.backoff(),
            options.retry_if_remaining_at_least(),
        )
    }

    pub fn retry_timeout(&self) -> Duration {
        self.retry_timeout
    }

    fn should_retry_with(&self, remaining: Duration) -> bool {
        remaining > self.retry_if_remaining_at_least
    }

    /// The first attempt runs unbounded. Every retry is bounded by what is
    /// left of the budget; if one times out the error of the attempt before
    /// it is reported.
    pub async fn execute<T, F, Fut>(
        &self,
        rpc_call: &RpcCall,
        mut action: F,
        metrics: &mut RpcCallMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let started = Instant::now();
        let mut retry_count: u32 = 0;
        let mut previous_error: Option<RpcError> = None;

        loop {
            let attempt_started = Instant::now();
            let attempt = if retry_count == 0 {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Attempt::Canceled,
                    result = action() => Attempt::Completed(result),
                }
            } else {
                let remaining = self.retry_timeout.saturating_sub(started.elapsed());
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Attempt::Canceled,
                    result = tokio::time::timeout(remaining, action()) => match result {
                        Ok(result) => Attempt::Completed(result),
                        Err(_) => Attempt::TimedOut,
                    },
                }
            };

            let err = match attempt {
                Attempt::Completed(Ok(value)) => {
                    metrics.attempt(attempt_started, AttemptOutcome::Success);
                    return Ok(value);
                }
                Attempt::Canceled => {
                    metrics.attempt(attempt_started, AttemptOutcome::Canceled);
                    metrics.canceled();
                    return Err(TentacleClientError::cancelled(rpc_call.to_string()));
                }
                Attempt::TimedOut => {
                    metrics.attempt(
                        attempt_started,
                        AttemptOutcome::Failure("retry timed out".to_string()),
                    );
                    let err = previous_error.unwrap_or_else(|| {
                        RpcError::timeout(format!(
                            "{rpc_call} did not complete within {}s",
                            self.retry_timeout.as_secs()
                        ))
                    });
                    metrics.failed(&err);
                    info!(
                        rpc_call = %rpc_call,
                        retries = retry_count,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "retry budget exhausted while waiting for a retry"
                    );
                    return Err(TentacleClientError::from_rpc(
                        rpc_call,
                        metrics.attempt_count(),
                        err,
                    ));
                }
                Attempt::Completed(Err(err)) => err,
            };

            metrics.attempt(attempt_started, AttemptOutcome::Failure(err.to_string()));
            metrics.failed(&err);
            if !err.is_transient() {
                return Err(TentacleClientError::from_rpc(
                    rpc_call,
                    metrics.attempt_count(),
                    err,
                ));
            }

            retry_count += 1;
            let sleep = self.backoff.delay(retry_count);
            let remaining = self
                .retry_timeout
                .saturating_sub(started.elapsed())
                .saturating_sub(sleep);
            if !self.should_retry_with(remaining) {
                info!(
                    rpc_call = %rpc_call,
                    attempts = metrics.attempt_count(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "retry budget exhausted"
                );
                return Err(TentacleClientError::from_rpc(
                    rpc_call,
                    metrics.attempt_count(),
                    err,
                ));
            }

            info!(
                rpc_call = %rpc_call,
                retry = retry_count,
                sleep_ms = sleep.as_millis() as u64,
                remaining_ms = remaining.as_millis() as u64,
                "retrying rpc call"
            );
            debug!(rpc_call = %rpc_call, "attempt failed: {err}");
            previous_error = Some(err);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    metrics.canceled();
                    return Err(TentacleClientError::cancelled(rpc_call.to_string()));
                }
                _ = tokio::time::sleep(sleep) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn handler(budget_secs: u64) -> RpcCallRetryHandler {
        RpcCallRetryHandler::new(
            Duration::from_secs(budget_secs),
            RetryBackoff::new(Duration::from_secs(1), 10),
            Duration::from_secs(1),
        )
    }

    fn call() -> RpcCall {
        RpcCall::new("IScriptServiceV2", "GetStatus")
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut metrics = RpcCallMetricsBuilder::for_retries(call(), Duration::from_secs(60));
        let result = handler(60)
            .execute(
                &call(),
                || {
                    let calls = Arc::clone(&calls);
                    async move {
                        match calls.fetch_add(1, Ordering::SeqCst) {
                            0 | 1 => Err(RpcError::connection("reset")),
                            _ => Ok(7),
                        }
                    }
                },
                &mut metrics,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result.unwrap(), 7);
        let metrics = metrics.build();
        assert_eq!(metrics.attempts.len(), 3);
        assert!(metrics.attempts[2].succeeded());
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_is_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut metrics = RpcCallMetricsBuilder::for_retries(call(), Duration::from_secs(60));
        let result: ClientResult<()> = handler(60)
            .execute(
                &call(),
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(RpcError::rejected("unknown ticket")) }
                },
                &mut metrics,
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(TentacleClientError::Rejected { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_bounds_the_number_of_retries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut metrics = RpcCallMetricsBuilder::for_retries(call(), Duration::from_secs(10));
        let result: ClientResult<()> = handler(10)
            .execute(
                &call(),
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(RpcError::connection("refused")) }
                },
                &mut metrics,
                &CancellationToken::new(),
            )
            .await;

        // Sleeps of 1s, 2s, 4s leave 3s; the next 8s sleep would overrun.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result {
            Err(TentacleClientError::RetriesExhausted { attempts, last_error, .. }) => {
                assert_eq!(attempts, 4);
                assert!(last_error.is_connection());
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_retry_reports_previous_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut metrics = RpcCallMetricsBuilder::for_retries(call(), Duration::from_secs(20));
        let result: ClientResult<()> = handler(20)
            .execute(
                &call(),
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n == 0 {
                            Err(RpcError::connection("reset by peer"))
                        } else {
                            std::future::pending().await
                        }
                    }
                },
                &mut metrics,
                &CancellationToken::new(),
            )
            .await;

        match result {
            Err(TentacleClientError::RetriesExhausted { last_error, .. }) => {
                assert_eq!(last_error, RpcError::connection("reset by peer"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(metrics.attempt_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_initial_attempt() {
        let cancel = CancellationToken::new();
        let mut metrics = RpcCallMetricsBuilder::for_retries(call(), Duration::from_secs(60));
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let result: ClientResult<()> = handler(60)
            .execute(&call(), std::future::pending, &mut metrics, &cancel)
            .await;

        assert!(matches!(result, Err(TentacleClientError::Cancelled { .. })));
        assert!(metrics.build().was_canceled);
    }
}
