//! Timing records for RPC calls and the client operations built from them.

use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use tentacle_protocol::ScriptTicket;

/// A named call on a named service, e.g. `IScriptServiceV2.GetStatus`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RpcCall {
    pub service: String,
    pub name: String,
}

impl RpcCall {
    pub fn new(service: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RpcCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Failure(String),
    Canceled,
}

/// One timed attempt of an RPC call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedOperation {
    pub started_at: Instant,
    pub ended_at: Instant,
    pub outcome: AttemptOutcome,
}

impl TimedOperation {
    pub fn new(started_at: Instant, ended_at: Instant, outcome: AttemptOutcome) -> Self {
        Self {
            started_at,
            ended_at,
            outcome,
        }
    }

    pub fn duration(&self) -> Duration {
        self.ended_at.saturating_duration_since(self.started_at)
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == AttemptOutcome::Success
    }
}

/// Everything observed while executing one logical RPC call, retries
/// included.
#[derive(Debug, Clone)]
pub struct RpcCallMetrics {
    pub rpc_call: RpcCall,
    pub start: Instant,
    pub end: Instant,
    pub retry_timeout: Option<Duration>,
    pub last_error: Option<String>,
    pub was_canceled: bool,
    pub attempts: Vec<TimedOperation>,
}

impl RpcCallMetrics {
    pub fn duration(&self) -> Duration {
        self.end.saturating_duration_since(self.start)
    }

    pub fn succeeded(&self) -> bool {
        self.last_error.is_none() && !self.was_canceled
    }

    /// Time spent in attempts beyond what a single successful attempt
    /// would have cost.
    ///
    /// When the final attempt succeeded this is every earlier attempt. When
    /// all attempts failed the first attempt is the baseline and every
    /// later attempt counts.
    pub fn additional_time_from_retries(&self) -> Duration {
        let Some(last) = self.attempts.last() else {
            return Duration::ZERO;
        };

        let counted: &[TimedOperation] = if last.succeeded() {
            &self.attempts[..self.attempts.len() - 1]
        } else {
            &self.attempts[1..]
        };
        counted.iter().map(TimedOperation::duration).sum()
    }
}

/// Accumulates attempts for one [`RpcCallMetrics`].
#[derive(Debug)]
pub struct RpcCallMetricsBuilder {
    rpc_call: RpcCall,
    start: Instant,
    retry_timeout: Option<Duration>,
    last_error: Option<String>,
    was_canceled: bool,
    attempts: Vec<TimedOperation>,
}

impl RpcCallMetricsBuilder {
    pub fn for_retries(rpc_call: RpcCall, retry_timeout: Duration) -> Self {
        Self::start(rpc_call, Some(retry_timeout))
    }

    pub fn for_no_retries(rpc_call: RpcCall) -> Self {
        Self::start(rpc_call, None)
    }

    fn start(rpc_call: RpcCall, retry_timeout: Option<Duration>) -> Self {
        Self {
            rpc_call,
            start: Instant::now(),
            retry_timeout,
            last_error: None,
            was_canceled: false,
            attempts: Vec::new(),
        }
    }

    pub fn attempt(&mut self, started_at: Instant, outcome: AttemptOutcome) {
        self.attempts
            .push(TimedOperation::new(started_at, Instant::now(), outcome));
    }

    pub fn failed(&mut self, error: impl fmt::Display) {
        self.last_error = Some(error.to_string());
    }

    pub fn canceled(&mut self) {
        self.was_canceled = true;
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }

    pub fn build(self) -> RpcCallMetrics {
        RpcCallMetrics {
            rpc_call: self.rpc_call,
            start: self.start,
            end: Instant::now(),
            retry_timeout: self.retry_timeout,
            last_error: self.last_error,
            was_canceled: self.was_canceled,
            attempts: self.attempts,
        }
    }
}

/// Metrics for one client operation such as `execute_script`.
#[derive(Debug, Clone)]
pub struct ClientOperationMetrics {
    pub operation: String,
    pub ticket: Option<ScriptTicket>,
    pub start: Instant,
    pub end: Instant,
    pub rpc_calls: Vec<RpcCallMetrics>,
    pub error: Option<String>,
    pub was_canceled: bool,
}

impl ClientOperationMetrics {
    pub fn duration(&self) -> Duration {
        self.end.saturating_duration_since(self.start)
    }

    pub fn calls_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a RpcCallMetrics> + 'a {
        self.rpc_calls.iter().filter(move |m| m.rpc_call.name == name)
    }
}

/// Shared sink that RPC executions append to while an operation runs.
#[derive(Debug)]
pub struct ClientOperationMetricsBuilder {
    operation: String,
    ticket: Option<ScriptTicket>,
    start: Instant,
    rpc_calls: Mutex<Vec<RpcCallMetrics>>,
}

impl ClientOperationMetricsBuilder {
    pub fn start(operation: impl Into<String>, ticket: Option<ScriptTicket>) -> Self {
        Self {
            operation: operation.into(),
            ticket,
            start: Instant::now(),
            rpc_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_rpc_call(&self, metrics: RpcCallMetrics) {
        self.rpc_calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(metrics);
    }

    pub fn rpc_calls(&self) -> Vec<RpcCallMetrics> {
        self.rpc_calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn build(self, error: Option<String>, was_canceled: bool) -> ClientOperationMetrics {
        ClientOperationMetrics {
            operation: self.operation,
            ticket: self.ticket,
            start: self.start,
            end: Instant::now(),
            rpc_calls: self
                .rpc_calls
                .into_inner()
                .unwrap_or_else(PoisonError::into_inner),
            error,
            was_canceled,
        }
    }

    pub fn succeeded(self) -> ClientOperationMetrics {
        self.build(None, false)
    }

    pub fn failed(self, error: impl fmt::Display, was_canceled: bool) -> ClientOperationMetrics {
        self.build(Some(error.to_string()), was_canceled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics_with(attempts: &[(u64, AttemptOutcome)]) -> RpcCallMetrics {
        let origin = Instant::now();
        let mut at = origin;
        let attempts = attempts
            .iter()
            .map(|(secs, outcome)| {
                let started = at;
                at += Duration::from_secs(*secs);
                TimedOperation::new(started, at, outcome.clone())
            })
            .collect();
        RpcCallMetrics {
            rpc_call: RpcCall::new("IScriptServiceV2", "GetStatus"),
            start: origin,
            end: at,
            retry_timeout: Some(Duration::from_secs(150)),
            last_error: None,
            was_canceled: false,
            attempts,
        }
    }

    fn failure() -> AttemptOutcome {
        AttemptOutcome::Failure("connection reset".into())
    }

    #[test]
    fn single_success_costs_nothing_extra() {
        let m = metrics_with(&[(7, AttemptOutcome::Success)]);
        assert_eq!(m.additional_time_from_retries(), Duration::ZERO);
    }

    #[test]
    fn success_after_failures_counts_the_failures() {
        let m = metrics_with(&[(2, failure()), (3, failure()), (5, AttemptOutcome::Success)]);
        assert_eq!(m.additional_time_from_retries(), Duration::from_secs(5));
    }

    #[test]
    fn all_failed_counts_everything_after_the_first() {
        let m = metrics_with(&[(2, failure()), (3, failure()), (4, failure())]);
        assert_eq!(m.additional_time_from_retries(), Duration::from_secs(7));
    }

    #[test]
    fn no_attempts_costs_nothing() {
        let m = metrics_with(&[]);
        assert_eq!(m.additional_time_from_retries(), Duration::ZERO);
    }

    #[test]
    fn rpc_call_display() {
        assert_eq!(
            RpcCall::new("IScriptService", "StartScript").to_string(),
            "IScriptService.StartScript"
        );
    }

    #[test]
    fn operation_builder_collects_calls() {
        let builder = ClientOperationMetricsBuilder::start("execute_script", None);
        builder.with_rpc_call(metrics_with(&[(1, AttemptOutcome::Success)]));
        builder.with_rpc_call(metrics_with(&[(1, failure())]));
        let metrics = builder.failed("boom", false);
        assert_eq!(metrics.rpc_calls.len(), 2);
        assert_eq!(metrics.calls_named("GetStatus").count(), 2);
        assert_eq!(metrics.error.as_deref(), Some("boom"));
    }
}
