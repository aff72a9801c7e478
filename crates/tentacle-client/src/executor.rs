use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tentacle_protocol::RpcError;

use crate::config::RpcRetryOptions;
use crate::error::{ClientResult, TentacleClientError};
use crate::metrics::{AttemptOutcome, ClientOperationMetricsBuilder, RpcCall, RpcCallMetricsBuilder};
use crate::observer::TentacleClientObserver;
use crate::retry::RpcCallRetryHandler;

/// Entry point for every RPC the client makes. Each execution appends one
/// `RpcCallMetrics` to the operation and reports it to the observer.
#[derive(Clone)]
pub struct RpcCallExecutor {
    retry_handler: RpcCallRetryHandler,
    retries_enabled: bool,
    observer: Arc<dyn TentacleClientObserver>,
}

impl RpcCallExecutor {
    pub fn new(options: &RpcRetryOptions, observer: Arc<dyn TentacleClientObserver>) -> Self {
        Self {
            retry_handler: RpcCallRetryHandler::from_options(options),
            retries_enabled: options.retries_enabled,
            observer,
        }
    }

    pub fn retries_enabled(&self) -> bool {
        self.retries_enabled
    }

    pub fn observer(&self) -> &Arc<dyn TentacleClientObserver> {
        &self.observer
    }

    /// Run `action` with retries when both the client and the caller allow
    /// them, otherwise as a single attempt.
    pub async fn execute<T, F, Fut>(
        &self,
        rpc_call: RpcCall,
        retryable: bool,
        action: F,
        operation: &ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        if !(self.retries_enabled && retryable) {
            return self
                .execute_with_no_retries(rpc_call, action, operation, cancel)
                .await;
        }

        let mut metrics =
            RpcCallMetricsBuilder::for_retries(rpc_call.clone(), self.retry_handler.retry_timeout());
        let result = self
            .retry_handler
            .execute(&rpc_call, action, &mut metrics, cancel)
            .await;
        self.record(metrics, operation);
        result
    }

    pub async fn execute_with_no_retries<T, F, Fut>(
        &self,
        rpc_call: RpcCall,
        mut action: F,
        operation: &ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let mut metrics = RpcCallMetricsBuilder::for_no_retries(rpc_call.clone());
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = action() => Some(result),
        };

        let result = match result {
            Some(Ok(value)) => {
                metrics.attempt(started, AttemptOutcome::Success);
                Ok(value)
            }
            Some(Err(err)) => {
                debug!(rpc_call = %rpc_call, "rpc call failed: {err}");
                metrics.attempt(started, AttemptOutcome::Failure(err.to_string()));
                metrics.failed(&err);
                Err(TentacleClientError::from_rpc(&rpc_call, 1, err))
            }
            None => {
                metrics.attempt(started, AttemptOutcome::Canceled);
                metrics.canceled();
                Err(TentacleClientError::cancelled(rpc_call.to_string()))
            }
        };
        self.record(metrics, operation);
        result
    }

    /// Single attempt that survives cancellation for `abandon_after`, so a
    /// cleanup call can still land once the caller has given up.
    pub async fn execute_abandonable<T, F, Fut>(
        &self,
        rpc_call: RpcCall,
        action: F,
        abandon_after: Duration,
        operation: &ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let mut metrics = RpcCallMetricsBuilder::for_no_retries(rpc_call.clone());
        let started = Instant::now();
        let call = action();
        tokio::pin!(call);

        let result = tokio::select! {
            result = &mut call => Some(result),
            _ = cancel.cancelled() => {
                debug!(
                    rpc_call = %rpc_call,
                    abandon_after_ms = abandon_after.as_millis() as u64,
                    "cancelled; waiting before abandoning call"
                );
                tokio::time::timeout(abandon_after, &mut call).await.ok()
            }
        };

        let result = match result {
            Some(Ok(value)) => {
                metrics.attempt(started, AttemptOutcome::Success);
                Ok(value)
            }
            Some(Err(err)) => {
                metrics.attempt(started, AttemptOutcome::Failure(err.to_string()));
                metrics.failed(&err);
                Err(TentacleClientError::from_rpc(&rpc_call, 1, err))
            }
            None => {
                warn!(rpc_call = %rpc_call, "abandoned rpc call after cancellation");
                metrics.attempt(started, AttemptOutcome::Canceled);
                metrics.canceled();
                Err(TentacleClientError::Abandoned {
                    rpc_call: rpc_call.to_string(),
                    abandoned_after_ms: abandon_after.as_millis() as u64,
                })
            }
        };
        self.record(metrics, operation);
        result
    }

    fn record(&self, metrics: RpcCallMetricsBuilder, operation: &ClientOperationMetricsBuilder) {
        let metrics = metrics.build();
        self.observer.rpc_call_completed(&metrics);
        operation.with_rpc_call(metrics);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::NoopObserver;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn executor(retries_enabled: bool) -> RpcCallExecutor {
        let options = RpcRetryOptions {
            retries_enabled,
            retry_timeout_secs: 60,
            max_backoff_secs: 10,
            backoff_unit_ms: 10,
            retry_if_remaining_at_least_ms: 1_000,
        };
        RpcCallExecutor::new(&options, Arc::new(NoopObserver))
    }

    fn flaky(calls: &Arc<AtomicUsize>) -> impl FnMut() -> std::future::Ready<Result<u8, RpcError>> + '_ {
        move || {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                std::future::ready(Err(RpcError::connection("reset")))
            } else {
                std::future::ready(Ok(1))
            }
        }
    }

    #[tokio::test]
    async fn disabled_retries_make_one_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let operation = ClientOperationMetricsBuilder::start("test", None);
        let result = executor(false)
            .execute(
                RpcCall::new("IScriptServiceV2", "GetStatus"),
                true,
                flaky(&calls),
                &operation,
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(
            result,
            Err(TentacleClientError::RetriesExhausted { attempts: 1, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let recorded = operation.rpc_calls();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].retry_timeout, None);
    }

    #[tokio::test]
    async fn non_retryable_calls_make_one_attempt_even_when_enabled() {
        let calls = Arc::new(AtomicUsize::new(0));
        let operation = ClientOperationMetricsBuilder::start("test", None);
        let result = executor(true)
            .execute(
                RpcCall::new("IScriptService", "StartScript"),
                false,
                flaky(&calls),
                &operation,
                &CancellationToken::new(),
            )
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retried_call_records_every_attempt_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let operation = ClientOperationMetricsBuilder::start("test", None);
        let result = executor(true)
            .execute(
                RpcCall::new("IScriptServiceV2", "GetStatus"),
                true,
                flaky(&calls),
                &operation,
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(result.unwrap(), 1);

        let recorded = operation.rpc_calls();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].attempts.len(), 2);
        assert_eq!(recorded[0].retry_timeout, Some(Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn abandonable_call_finishes_if_it_lands_in_time() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let operation = ClientOperationMetricsBuilder::start("test", None);
        let result = executor(true)
            .execute_abandonable(
                RpcCall::new("IScriptServiceV2", "CompleteScript"),
                || async {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Ok::<_, RpcError>(())
                },
                Duration::from_secs(5),
                &operation,
                &cancel,
            )
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn abandonable_call_is_abandoned_after_grace() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let operation = ClientOperationMetricsBuilder::start("test", None);
        let result = executor(true)
            .execute_abandonable(
                RpcCall::new("IScriptServiceV2", "CompleteScript"),
                std::future::pending::<Result<(), RpcError>>,
                Duration::from_secs(5),
                &operation,
                &cancel,
            )
            .await;
        assert!(matches!(
            result,
            Err(TentacleClientError::Abandoned {
                abandoned_after_ms: 5_000,
                ..
            })
        ));
        assert!(operation.rpc_calls()[0].was_canceled);
    }
}
