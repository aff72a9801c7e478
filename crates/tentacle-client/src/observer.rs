use tracing::{debug, info, warn};

use crate::metrics::{ClientOperationMetrics, RpcCallMetrics};

/// Receives metrics as the client produces them.
pub trait TentacleClientObserver: Send + Sync {
    fn rpc_call_completed(&self, _metrics: &RpcCallMetrics) {}

    fn operation_completed(&self, _metrics: &ClientOperationMetrics) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl TentacleClientObserver for NoopObserver {}

/// Reports metrics through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl TentacleClientObserver for LoggingObserver {
    fn rpc_call_completed(&self, metrics: &RpcCallMetrics) {
        debug!(
            rpc_call = %metrics.rpc_call,
            attempts = metrics.attempts.len(),
            duration_ms = metrics.duration().as_millis() as u64,
            retry_ms = metrics.additional_time_from_retries().as_millis() as u64,
            was_canceled = metrics.was_canceled,
            error = ?metrics.last_error,
            "rpc call completed"
        );
    }

    fn operation_completed(&self, metrics: &ClientOperationMetrics) {
        let ticket = metrics.ticket.as_ref().map(|t| t.to_string());
        match &metrics.error {
            Some(error) if !metrics.was_canceled => warn!(
                operation = %metrics.operation,
                ticket = ?ticket,
                rpc_calls = metrics.rpc_calls.len(),
                duration_ms = metrics.duration().as_millis() as u64,
                "operation failed: {error}"
            ),
            _ => info!(
                operation = %metrics.operation,
                ticket = ?ticket,
                rpc_calls = metrics.rpc_calls.len(),
                duration_ms = metrics.duration().as_millis() as u64,
                was_canceled = metrics.was_canceled,
                "operation completed"
            ),
        }
    }
}
