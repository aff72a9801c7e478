use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use libtentacle::ScriptLogWriter;
use tentacle_protocol::{
    CANCELED_EXIT_CODE, CommandContext, ProcessState, ScriptStatusResponse, StartScriptCommand,
};

use crate::config::{PollingOptions, TentacleClientOptions};
use crate::error::ClientResult;
use crate::metrics::ClientOperationMetricsBuilder;
use crate::script_service::{ScriptOperationResult, ScriptServiceExecutor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    NotStarted,
    Starting,
    Running,
    Canceling,
    Completing,
    Completed,
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "not_started",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Canceling => "canceling",
            Self::Completing => "completing",
            Self::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// Terminal outcome of an orchestration. A script that failed on the agent
/// is still a result, with its non-zero exit code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptExecutionResult {
    pub state: ProcessState,
    pub exit_code: i32,
    pub was_canceled: bool,
    pub context: CommandContext,
}

/// Callbacks invoked while a script is observed.
#[async_trait]
pub trait ScriptExecutionHooks: Send + Sync {
    /// Every status response, including the start response and the final
    /// status returned by the legacy service on complete.
    fn on_status_received(&self, _result: &ScriptOperationResult) {}

    /// Runs once the script is complete and before `CompleteScript` is sent.
    async fn on_script_completed(&self, _cancel: &CancellationToken) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl ScriptExecutionHooks for NoHooks {}

struct Observed {
    last: ScriptOperationResult,
    forced: bool,
}

pub struct ScriptOrchestrator {
    service: ScriptServiceExecutor,
    writer: ScriptLogWriter,
    polling: PollingOptions,
    cancellation_hard_deadline: Duration,
    hooks: Arc<dyn ScriptExecutionHooks>,
    state: Arc<watch::Sender<OrchestratorState>>,
}

impl ScriptOrchestrator {
    pub fn new(
        service: ScriptServiceExecutor,
        writer: ScriptLogWriter,
        options: &TentacleClientOptions,
        hooks: Arc<dyn ScriptExecutionHooks>,
        state: Arc<watch::Sender<OrchestratorState>>,
    ) -> Self {
        Self {
            service,
            writer,
            polling: options.polling.clone(),
            cancellation_hard_deadline: options.cancellation_hard_deadline(),
            hooks,
            state,
        }
    }

    pub fn state(&self) -> OrchestratorState {
        *self.state.borrow()
    }

    fn set_state(&self, next: OrchestratorState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "orchestrator state changed");
        }
    }

    pub async fn execute(
        mut self,
        command: &StartScriptCommand,
        operation: &ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptExecutionResult> {
        self.set_state(OrchestratorState::Starting);
        let started = match self.service.start_script(command, operation, cancel).await {
            Ok(started) => started,
            Err(err) => {
                self.set_state(OrchestratorState::Completed);
                return Err(err);
            }
        };
        self.observe_until_complete_then_finish(started, operation, cancel)
            .await
    }

    /// Continue a script started elsewhere, from its persisted context.
    pub async fn resume(
        mut self,
        context: CommandContext,
        operation: &ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptExecutionResult> {
        info!(
            ticket = %context.script_ticket,
            next_log_sequence = context.next_log_sequence,
            service = %context.script_service_version,
            "resuming script"
        );
        self.set_state(OrchestratorState::Starting);
        let mut status = ScriptStatusResponse::pending(context.script_ticket.clone());
        status.next_log_sequence = context.next_log_sequence;
        let last = ScriptOperationResult { status, context };
        self.observe_until_complete_then_finish(last, operation, cancel)
            .await
    }

    async fn observe_until_complete_then_finish(
        &mut self,
        started: ScriptOperationResult,
        operation: &ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptExecutionResult> {
        self.record(&started);

        let observed = match self.observe_until_complete(started, operation, cancel).await {
            Ok(observed) => observed,
            Err(err) => {
                self.set_state(OrchestratorState::Completed);
                return Err(err);
            }
        };

        self.set_state(OrchestratorState::Completing);
        self.hooks.on_script_completed(cancel).await;

        let mut last = observed.last;
        if let Some(status) = self
            .service
            .complete_script(&last.context, operation, cancel)
            .await
        {
            let completed = ScriptOperationResult {
                context: last.context.advanced_by(&status),
                status,
            };
            self.record(&completed);
            last = completed;
        }

        self.set_state(OrchestratorState::Completed);
        let result = ScriptExecutionResult {
            state: last.status.state,
            exit_code: last.status.exit_code,
            was_canceled: cancel.is_cancelled() || observed.forced,
            context: last.context,
        };
        info!(
            ticket = %result.context.script_ticket,
            exit_code = result.exit_code,
            was_canceled = result.was_canceled,
            "script orchestration finished"
        );
        Ok(result)
    }

    async fn observe_until_complete(
        &mut self,
        started: ScriptOperationResult,
        operation: &ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<Observed> {
        let mut last = started;
        let mut backoff = self.polling.backoff();
        let mut cancel_backoff = self.polling.backoff();
        let mut hard_deadline: Option<Instant> = None;
        // Cancel calls must not be cut short by the token that asked for them.
        let uncancelled = CancellationToken::new();

        while !last.status.is_complete() {
            if cancel.is_cancelled() {
                let deadline = match hard_deadline {
                    Some(deadline) => deadline,
                    None => {
                        info!(ticket = %last.context.script_ticket, "cancelling script");
                        self.set_state(OrchestratorState::Canceling);
                        let deadline = Instant::now() + self.cancellation_hard_deadline;
                        hard_deadline = Some(deadline);
                        deadline
                    }
                };

                let attempt = tokio::time::timeout_at(
                    deadline,
                    self.service
                        .cancel_script(&last.context, operation, &uncancelled),
                )
                .await;
                let received_output = match attempt {
                    Err(_) => return Ok(self.force_complete(last)),
                    Ok(Ok(next)) => {
                        let received_output = !next.status.logs.is_empty();
                        self.record(&next);
                        last = next;
                        received_output
                    }
                    Ok(Err(err)) if err.is_infrastructure() => {
                        warn!(
                            ticket = %last.context.script_ticket,
                            "cancel did not reach the tentacle, trying again: {err}"
                        );
                        false
                    }
                    Ok(Err(err)) => return Err(err),
                };

                if last.status.is_complete() {
                    break;
                }
                let delay = cancel_backoff.next_delay(received_output);
                let wake = (Instant::now() + delay).min(deadline);
                tokio::time::sleep_until(wake).await;
                if Instant::now() >= deadline {
                    return Ok(self.force_complete(last));
                }
            } else {
                let next = match self.service.get_status(&last.context, operation, cancel).await {
                    Ok(next) => {
                        if self.state() == OrchestratorState::Starting {
                            self.set_state(OrchestratorState::Running);
                        }
                        next
                    }
                    Err(_) if cancel.is_cancelled() => continue,
                    Err(err) => {
                        warn!(
                            ticket = %last.context.script_ticket,
                            "lost contact with the script, sending a best effort cancel: {err}"
                        );
                        self.service.cancel_script_detached(last.context.clone());
                        return Err(err);
                    }
                };
                let received_output = !next.status.logs.is_empty();
                self.record(&next);
                last = next;

                if last.status.is_complete() {
                    break;
                }
                let delay = backoff.next_delay(received_output);
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        Ok(Observed { last, forced: false })
    }

    fn force_complete(&self, last: ScriptOperationResult) -> Observed {
        warn!(
            ticket = %last.context.script_ticket,
            deadline_secs = self.cancellation_hard_deadline.as_secs(),
            "script did not stop before the cancellation deadline; completing locally"
        );
        let mut status = last.status;
        status.state = ProcessState::Complete;
        status.exit_code = CANCELED_EXIT_CODE;
        status.logs.clear();
        Observed {
            last: ScriptOperationResult {
                status,
                context: last.context,
            },
            forced: true,
        }
    }

    fn record(&mut self, result: &ScriptOperationResult) {
        if !result.status.logs.is_empty()
            && let Err(err) = self.writer.write_all(result.status.logs.iter().cloned())
        {
            warn!(ticket = %result.context.script_ticket, "failed to record script output: {err}");
        }
        self.hooks.on_status_received(result);
    }
}
