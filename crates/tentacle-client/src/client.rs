use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use libtentacle::{KeyedLock, ScriptLog, keyed_lock::WriteReleaser};
use tentacle_protocol::{
    CommandContext, DownloadFileRequest, ScriptServiceVersion, ScriptStatusResponse,
    ScriptTicket, ServiceEndpoint, StartScriptCommand, TentacleRpc, UploadFileCommand,
    UploadResult,
};

use crate::background::BackgroundTask;
use crate::capabilities::CapabilityNegotiator;
use crate::config::TentacleClientOptions;
use crate::error::{ClientResult, TentacleClientError};
use crate::executor::RpcCallExecutor;
use crate::file_transfer::FileTransferExecutor;
use crate::metrics::ClientOperationMetricsBuilder;
use crate::observer::{LoggingObserver, TentacleClientObserver};
use crate::orchestrator::{
    NoHooks, OrchestratorState, ScriptExecutionHooks, ScriptExecutionResult, ScriptOrchestrator,
};
use crate::script_service::{ScriptOperationResult, ScriptServiceExecutor};

/// Where an orchestration sends its output and state.
pub struct ScriptRun {
    pub log: ScriptLog,
    pub hooks: Arc<dyn ScriptExecutionHooks>,
    state: Arc<watch::Sender<OrchestratorState>>,
}

impl ScriptRun {
    pub fn new() -> Self {
        let (state, _) = watch::channel(OrchestratorState::NotStarted);
        Self {
            log: ScriptLog::new(),
            hooks: Arc::new(NoHooks),
            state: Arc::new(state),
        }
    }

    pub fn with_log(mut self, log: ScriptLog) -> Self {
        self.log = log;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn ScriptExecutionHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<OrchestratorState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> OrchestratorState {
        *self.state.borrow()
    }
}

impl Default for ScriptRun {
    fn default() -> Self {
        Self::new()
    }
}

/// A script orchestrated in the background by [`TentacleClient::spawn_script`].
/// Dropping the handle detaches it: the script is still observed to
/// completion and released on the agent.
pub struct ScriptHandle {
    pub ticket: ScriptTicket,
    pub log: ScriptLog,
    state: watch::Receiver<OrchestratorState>,
    result: oneshot::Receiver<ClientResult<ScriptExecutionResult>>,
    task: BackgroundTask,
}

impl ScriptHandle {
    pub fn state(&self) -> watch::Receiver<OrchestratorState> {
        self.state.clone()
    }

    /// Ask the orchestration to cancel the script. It keeps running until
    /// the agent confirms or the cancellation deadline passes.
    pub fn cancel(&self) {
        self.task.cancel();
    }

    /// Cancel and give the orchestration the client's stop grace period.
    pub async fn stop(&self) {
        self.task.stop().await;
    }

    pub async fn wait(self) -> ClientResult<ScriptExecutionResult> {
        self.result
            .await
            .unwrap_or_else(|_| Err(TentacleClientError::cancelled("execute_script")))
    }
}

/// Drives scripts on one agent.
#[derive(Clone)]
pub struct TentacleClient {
    endpoint: ServiceEndpoint,
    rpc: Arc<dyn TentacleRpc>,
    options: TentacleClientOptions,
    calls: RpcCallExecutor,
    negotiator: Arc<CapabilityNegotiator>,
    ticket_locks: KeyedLock<ScriptTicket>,
    observer: Arc<dyn TentacleClientObserver>,
}

impl TentacleClient {
    pub fn new(
        endpoint: ServiceEndpoint,
        rpc: Arc<dyn TentacleRpc>,
        options: TentacleClientOptions,
    ) -> Self {
        let observer: Arc<dyn TentacleClientObserver> = Arc::new(LoggingObserver);
        Self {
            calls: RpcCallExecutor::new(&options.rpc_retry, Arc::clone(&observer)),
            endpoint,
            rpc,
            options,
            negotiator: Arc::new(CapabilityNegotiator::new()),
            ticket_locks: KeyedLock::new(),
            observer,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn TentacleClientObserver>) -> Self {
        self.calls = RpcCallExecutor::new(&self.options.rpc_retry, Arc::clone(&observer));
        self.observer = observer;
        self
    }

    /// Share a capability cache between clients of the same agents.
    pub fn with_negotiator(mut self, negotiator: Arc<CapabilityNegotiator>) -> Self {
        self.negotiator = negotiator;
        self
    }

    pub fn endpoint(&self) -> &ServiceEndpoint {
        &self.endpoint
    }

    pub fn options(&self) -> &TentacleClientOptions {
        &self.options
    }

    pub fn negotiator(&self) -> &Arc<CapabilityNegotiator> {
        &self.negotiator
    }

    /// Start `command`, observe it to completion and release it on the
    /// agent. The ticket is locked for the whole orchestration.
    pub async fn execute_script(
        &self,
        command: StartScriptCommand,
        run: &ScriptRun,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptExecutionResult> {
        let operation =
            ClientOperationMetricsBuilder::start("execute_script", Some(command.script_ticket.clone()));
        let result = async {
            let _guard = self.lock(&command.script_ticket, cancel).await?;
            let version = self.negotiate(&operation, cancel).await?;
            info!(ticket = %command.script_ticket, service = %version, "executing script");
            self.orchestrator(version, run)?
                .execute(&command, &operation, cancel)
                .await
        }
        .await;
        self.finish(operation, &result);
        result
    }

    /// Pick up a script from a persisted context without starting it again.
    pub async fn resume(
        &self,
        context: CommandContext,
        run: &ScriptRun,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptExecutionResult> {
        let operation =
            ClientOperationMetricsBuilder::start("resume_script", Some(context.script_ticket.clone()));
        let result = async {
            let _guard = self.lock(&context.script_ticket, cancel).await?;
            self.orchestrator(context.script_service_version, run)?
                .resume(context, &operation, cancel)
                .await
        }
        .await;
        self.finish(operation, &result);
        result
    }

    /// Run `execute_script` on a background task.
    pub fn spawn_script(&self, command: StartScriptCommand, run: ScriptRun) -> ScriptHandle {
        let ticket = command.script_ticket.clone();
        let log = run.log.clone();
        let state = run.subscribe();
        let (result_tx, result_rx) = oneshot::channel();

        let client = self.clone();
        let mut job = Some((command, run, result_tx));
        let task = BackgroundTask::new(
            format!("script-{ticket}"),
            self.options.stop_grace_period(),
            move |cancel| {
                let client = client.clone();
                let job = job.take();
                async move {
                    let Some((command, run, result_tx)) = job else {
                        return Ok(());
                    };
                    let result = client.execute_script(command, &run, &cancel).await;
                    let outcome = result.as_ref().map(|_| ()).map_err(Clone::clone);
                    let _ = result_tx.send(result);
                    outcome
                }
            },
        );
        task.start();

        ScriptHandle {
            ticket,
            log,
            state,
            result: result_rx,
            task,
        }
    }

    /// Which script service the agent will be driven with. Cached per
    /// endpoint after the first successful discovery.
    pub async fn negotiate_script_service(
        &self,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptServiceVersion> {
        let operation = ClientOperationMetricsBuilder::start("negotiate_capabilities", None);
        let result = self.negotiate(&operation, cancel).await;
        self.finish(operation, &result);
        result
    }

    /// Negotiate and start a script without observing it.
    pub async fn start_script(
        &self,
        command: &StartScriptCommand,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptOperationResult> {
        let operation =
            ClientOperationMetricsBuilder::start("start_script", Some(command.script_ticket.clone()));
        let result = async {
            let _guard = self.lock(&command.script_ticket, cancel).await?;
            let version = self.negotiate(&operation, cancel).await?;
            self.script_service(version)
                .start_script(command, &operation, cancel)
                .await
        }
        .await;
        self.finish(operation, &result);
        result
    }

    pub async fn get_status(
        &self,
        context: &CommandContext,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptOperationResult> {
        let operation =
            ClientOperationMetricsBuilder::start("get_status", Some(context.script_ticket.clone()));
        let result = async {
            let _guard = self.lock(&context.script_ticket, cancel).await?;
            self.script_service(context.script_service_version)
                .get_status(context, &operation, cancel)
                .await
        }
        .await;
        self.finish(operation, &result);
        result
    }

    pub async fn cancel_script(
        &self,
        context: &CommandContext,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptOperationResult> {
        let operation =
            ClientOperationMetricsBuilder::start("cancel_script", Some(context.script_ticket.clone()));
        let result = async {
            let _guard = self.lock(&context.script_ticket, cancel).await?;
            self.script_service(context.script_service_version)
                .cancel_script(context, &operation, cancel)
                .await
        }
        .await;
        self.finish(operation, &result);
        result
    }

    /// Release the script on the agent. Only the legacy service returns a
    /// final status; delivery failures are logged, not returned.
    pub async fn complete_script(
        &self,
        context: &CommandContext,
        cancel: &CancellationToken,
    ) -> ClientResult<Option<ScriptStatusResponse>> {
        let operation =
            ClientOperationMetricsBuilder::start("complete_script", Some(context.script_ticket.clone()));
        let result = async {
            let _guard = self.lock(&context.script_ticket, cancel).await?;
            Ok::<_, TentacleClientError>(
                self.script_service(context.script_service_version)
                    .complete_script(context, &operation, cancel)
                    .await,
            )
        }
        .await;
        self.finish(operation, &result);
        result
    }

    /// Store `data` at `remote_path` on the agent.
    pub async fn upload_file(
        &self,
        remote_path: &str,
        data: impl Into<Vec<u8>>,
        cancel: &CancellationToken,
    ) -> ClientResult<UploadResult> {
        let operation = ClientOperationMetricsBuilder::start("upload_file", None);
        let command = UploadFileCommand::new(remote_path, data);
        let result = self
            .file_transfer()
            .upload_file(&command, &operation, cancel)
            .await;
        self.finish(operation, &result);
        result
    }

    pub async fn download_file(
        &self,
        remote_path: &str,
        cancel: &CancellationToken,
    ) -> ClientResult<Vec<u8>> {
        let operation = ClientOperationMetricsBuilder::start("download_file", None);
        let request = DownloadFileRequest::new(remote_path);
        let result = self
            .file_transfer()
            .download_file(&request, &operation, cancel)
            .await;
        self.finish(operation, &result);
        result
    }

    async fn lock(
        &self,
        ticket: &ScriptTicket,
        cancel: &CancellationToken,
    ) -> ClientResult<WriteReleaser<ScriptTicket>> {
        debug!(ticket = %ticket, "acquiring script lock");
        self.ticket_locks
            .lock(ticket.clone(), cancel)
            .await
            .into_guard()
            .ok_or_else(|| TentacleClientError::LockNotAcquired {
                ticket: ticket.clone(),
            })
    }

    async fn negotiate(
        &self,
        operation: &ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptServiceVersion> {
        self.negotiator
            .negotiate(&self.endpoint, self.rpc.as_ref(), &self.calls, operation, cancel)
            .await
    }

    fn script_service(&self, version: ScriptServiceVersion) -> ScriptServiceExecutor {
        ScriptServiceExecutor::new(
            Arc::clone(&self.rpc),
            self.calls.clone(),
            version,
            self.options.abandon_complete_script_after(),
        )
    }

    fn file_transfer(&self) -> FileTransferExecutor {
        FileTransferExecutor::new(Arc::clone(&self.rpc), self.calls.clone())
    }

    fn orchestrator(
        &self,
        version: ScriptServiceVersion,
        run: &ScriptRun,
    ) -> ClientResult<ScriptOrchestrator> {
        let writer = run
            .log
            .create_writer()
            .map_err(|err| TentacleClientError::LogUnavailable {
                message: err.to_string(),
            })?;
        Ok(ScriptOrchestrator::new(
            self.script_service(version),
            writer,
            &self.options,
            Arc::clone(&run.hooks),
            Arc::clone(&run.state),
        ))
    }

    fn finish<T>(&self, operation: ClientOperationMetricsBuilder, result: &ClientResult<T>) {
        let metrics = match result {
            Ok(_) => operation.succeeded(),
            Err(err) => operation.failed(err, err.is_cancelled()),
        };
        self.observer.operation_completed(&metrics);
    }
}
