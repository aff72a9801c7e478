//! Per-protocol script calls.
//!
//! The three script service versions differ only in how their calls may be
//! retried and what `CompleteScript` answers, so one executor drives all of
//! them from a static profile table.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tentacle_protocol::{
    CancelScriptCommand, CommandContext, CompleteScriptCommand, ScriptServiceVersion,
    ScriptStatusRequest, ScriptStatusResponse, StartScriptCommand, TentacleRpc,
};

use crate::error::{ClientResult, TentacleClientError};
use crate::executor::RpcCallExecutor;
use crate::metrics::{ClientOperationMetricsBuilder, RpcCall};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptServiceProfile {
    pub version: ScriptServiceVersion,
    /// Start/status/cancel may be retried. The legacy service is not
    /// idempotent on start, so none of its calls are.
    pub retry_script_calls: bool,
    /// `CompleteScript` answers with the final status.
    pub complete_returns_status: bool,
    /// `CompleteScript` is given up on when the caller cancels.
    pub abandon_complete_on_cancel: bool,
}

static PROFILES: [ScriptServiceProfile; 3] = [
    ScriptServiceProfile {
        version: ScriptServiceVersion::Legacy,
        retry_script_calls: false,
        complete_returns_status: true,
        abandon_complete_on_cancel: false,
    },
    ScriptServiceProfile {
        version: ScriptServiceVersion::V2,
        retry_script_calls: true,
        complete_returns_status: false,
        abandon_complete_on_cancel: true,
    },
    ScriptServiceProfile {
        version: ScriptServiceVersion::Kubernetes,
        retry_script_calls: true,
        complete_returns_status: false,
        abandon_complete_on_cancel: true,
    },
];

pub fn profile(version: ScriptServiceVersion) -> &'static ScriptServiceProfile {
    match version {
        ScriptServiceVersion::Legacy => &PROFILES[0],
        ScriptServiceVersion::V2 => &PROFILES[1],
        ScriptServiceVersion::Kubernetes => &PROFILES[2],
    }
}

/// A status response together with the context for the next call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptOperationResult {
    pub status: ScriptStatusResponse,
    pub context: CommandContext,
}

impl ScriptOperationResult {
    fn from_response(version: ScriptServiceVersion, status: ScriptStatusResponse) -> Self {
        let context = CommandContext::new(status.ticket.clone(), status.next_log_sequence, version);
        Self { status, context }
    }

    /// Stand-in for a start whose response was lost to cancellation.
    pub fn assumed_started(command: &StartScriptCommand, version: ScriptServiceVersion) -> Self {
        Self {
            status: ScriptStatusResponse::pending(command.script_ticket.clone()),
            context: CommandContext::started(command.script_ticket.clone(), version),
        }
    }
}

#[derive(Clone)]
pub struct ScriptServiceExecutor {
    rpc: Arc<dyn TentacleRpc>,
    calls: RpcCallExecutor,
    profile: &'static ScriptServiceProfile,
    abandon_complete_after: Duration,
}

impl ScriptServiceExecutor {
    pub fn new(
        rpc: Arc<dyn TentacleRpc>,
        calls: RpcCallExecutor,
        version: ScriptServiceVersion,
        abandon_complete_after: Duration,
    ) -> Self {
        Self {
            rpc,
            calls,
            profile: profile(version),
            abandon_complete_after,
        }
    }

    pub fn version(&self) -> ScriptServiceVersion {
        self.profile.version
    }

    fn rpc_call(&self, name: &str) -> RpcCall {
        RpcCall::new(self.profile.version.service_name(), name)
    }

    /// Start the script. If the caller cancels while the call might
    /// already have reached the agent, the script is assumed to be running
    /// so it still gets cancelled and completed.
    pub async fn start_script(
        &self,
        command: &StartScriptCommand,
        operation: &ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptOperationResult> {
        let version = self.profile.version;
        let possibly_connected = Arc::new(AtomicUsize::new(0));
        let rpc = Arc::clone(&self.rpc);

        let result = self
            .calls
            .execute(
                self.rpc_call("StartScript"),
                self.profile.retry_script_calls,
                || {
                    let rpc = Arc::clone(&rpc);
                    let possibly_connected = Arc::clone(&possibly_connected);
                    async move {
                        possibly_connected.fetch_add(1, Ordering::SeqCst);
                        let result = rpc.start_script(version, command).await;
                        if let Err(err) = &result
                            && err.is_connection()
                        {
                            possibly_connected.fetch_sub(1, Ordering::SeqCst);
                        }
                        result
                    }
                },
                operation,
                cancel,
            )
            .await;

        match result {
            Ok(status) => {
                info!(ticket = %status.ticket, service = %version, "script started");
                Ok(ScriptOperationResult::from_response(version, status))
            }
            Err(err) if cancel.is_cancelled() => {
                if possibly_connected.load(Ordering::SeqCst) > 0 {
                    info!(
                        ticket = %command.script_ticket,
                        "start cancelled after it may have reached the tentacle; treating script as started"
                    );
                    Ok(ScriptOperationResult::assumed_started(command, version))
                } else {
                    debug!(ticket = %command.script_ticket, "start cancelled before reaching the tentacle: {err}");
                    Err(TentacleClientError::cancelled("start_script"))
                }
            }
            Err(err) => Err(err),
        }
    }

    pub async fn get_status(
        &self,
        context: &CommandContext,
        operation: &ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptOperationResult> {
        let version = self.profile.version;
        let request = ScriptStatusRequest::from(context);
        let status = self
            .calls
            .execute(
                self.rpc_call("GetStatus"),
                self.profile.retry_script_calls,
                || self.rpc.get_status(version, &request),
                operation,
                cancel,
            )
            .await?;
        Ok(ScriptOperationResult::from_response(version, status))
    }

    pub async fn cancel_script(
        &self,
        context: &CommandContext,
        operation: &ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptOperationResult> {
        let version = self.profile.version;
        let command = CancelScriptCommand::from(context);
        let status = self
            .calls
            .execute(
                self.rpc_call("CancelScript"),
                self.profile.retry_script_calls,
                || self.rpc.cancel_script(version, &command),
                operation,
                cancel,
            )
            .await?;
        Ok(ScriptOperationResult::from_response(version, status))
    }

    /// Fire a cancel in the background without waiting for it. Used when
    /// polling has failed and the script may still be running.
    pub fn cancel_script_detached(&self, context: CommandContext) {
        let executor = self.clone();
        tokio::spawn(async move {
            let operation =
                ClientOperationMetricsBuilder::start("cancel_script", Some(context.script_ticket.clone()));
            let result = executor
                .cancel_script(&context, &operation, &CancellationToken::new())
                .await;
            let metrics = match result {
                Ok(_) => operation.succeeded(),
                Err(err) => {
                    debug!(ticket = %context.script_ticket, "best effort cancel failed: {err}");
                    operation.failed(err, false)
                }
            };
            executor.calls.observer().operation_completed(&metrics);
        });
    }

    /// Release agent-side resources. Never fails: a complete that cannot
    /// be delivered only leaves a workspace behind on the agent.
    pub async fn complete_script(
        &self,
        context: &CommandContext,
        operation: &ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> Option<ScriptStatusResponse> {
        let version = self.profile.version;
        let command = CompleteScriptCommand::from(context);
        let never = CancellationToken::new();
        let cancel = if self.profile.abandon_complete_on_cancel {
            cancel
        } else {
            &never
        };

        let result = self
            .calls
            .execute_abandonable(
                self.rpc_call("CompleteScript"),
                || self.rpc.complete_script(version, &command),
                self.abandon_complete_after,
                operation,
                cancel,
            )
            .await;

        match result {
            Ok(status) if self.profile.complete_returns_status => status,
            Ok(_) => None,
            Err(err) => {
                warn!(
                    ticket = %context.script_ticket,
                    "failed to clean up the script working directory on the tentacle: {err}"
                );
                None
            }
        }
    }
}
