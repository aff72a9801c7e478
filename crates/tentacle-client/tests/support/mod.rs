#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tentacle_client::{
    ClientOperationMetrics, RpcCallMetrics, TentacleClient, TentacleClientObserver,
    TentacleClientOptions,
};
use tentacle_protocol::capabilities::{CAPABILITIES_SERVICE_V2, SCRIPT_SERVICE, SCRIPT_SERVICE_V2};
use tentacle_protocol::{
    CANCELED_EXIT_CODE, CancelScriptCommand, CapabilitiesResponse, CompleteScriptCommand,
    DownloadFileRequest, ProcessOutput, ProcessOutputSource, ProcessState, RUNNING_EXIT_CODE,
    RpcError, ScriptServiceVersion, ScriptStatusRequest, ScriptStatusResponse, ScriptTicket,
    ServiceEndpoint, StartScriptCommand, TentacleRpc, UploadFileCommand, UploadResult,
};

/// Scripted answer for one call. Status replies get the request's ticket.
#[derive(Debug, Clone)]
pub enum Reply {
    Status(ScriptStatusResponse),
    Error(RpcError),
    Hang,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenCall {
    pub name: &'static str,
    pub service: Option<ScriptServiceVersion>,
    pub last_log_sequence: Option<i64>,
}

pub fn running(logs: &[&str], next_log_sequence: i64) -> Reply {
    Reply::Status(status(ProcessState::Running, RUNNING_EXIT_CODE, logs, next_log_sequence))
}

pub fn complete(exit_code: i32, logs: &[&str], next_log_sequence: i64) -> Reply {
    Reply::Status(status(ProcessState::Complete, exit_code, logs, next_log_sequence))
}

pub fn status(
    state: ProcessState,
    exit_code: i32,
    logs: &[&str],
    next_log_sequence: i64,
) -> ScriptStatusResponse {
    ScriptStatusResponse {
        ticket: ScriptTicket::new("scripted"),
        state,
        exit_code,
        logs: logs
            .iter()
            .map(|text| ProcessOutput::new(ProcessOutputSource::StdOut, *text))
            .collect(),
        next_log_sequence,
    }
}

/// Scripted failure for a file transfer call. An empty queue lets the
/// call through to the fake's file store.
#[derive(Debug, Clone)]
pub enum TransferFault {
    Error(RpcError),
    Hang,
}

/// A `TentacleRpc` that answers from per-call queues and records every
/// call. Empty queues fall back to a running script that completes on
/// cancel.
pub struct FakeTentacle {
    capabilities: Mutex<VecDeque<Result<CapabilitiesResponse, RpcError>>>,
    capabilities_delay: Mutex<Duration>,
    default_capabilities: Mutex<Vec<String>>,
    starts: Mutex<VecDeque<Reply>>,
    statuses: Mutex<VecDeque<Reply>>,
    cancels: Mutex<VecDeque<Reply>>,
    completes: Mutex<VecDeque<Result<Option<ScriptStatusResponse>, RpcError>>>,
    transfer_faults: Mutex<VecDeque<TransferFault>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    seen: Mutex<Vec<SeenCall>>,
}

impl FakeTentacle {
    pub fn new() -> Arc<Self> {
        Self::with_capabilities(&[SCRIPT_SERVICE, SCRIPT_SERVICE_V2, CAPABILITIES_SERVICE_V2])
    }

    pub fn with_capabilities(capabilities: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            capabilities: Mutex::new(VecDeque::new()),
            capabilities_delay: Mutex::new(Duration::ZERO),
            default_capabilities: Mutex::new(capabilities.iter().map(|c| c.to_string()).collect()),
            starts: Mutex::new(VecDeque::new()),
            statuses: Mutex::new(VecDeque::new()),
            cancels: Mutex::new(VecDeque::new()),
            completes: Mutex::new(VecDeque::new()),
            transfer_faults: Mutex::new(VecDeque::new()),
            files: Mutex::new(HashMap::new()),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn push_capabilities(&self, reply: Result<CapabilitiesResponse, RpcError>) {
        self.capabilities.lock().unwrap().push_back(reply);
    }

    /// Every capabilities answer takes this long.
    pub fn delay_capabilities(&self, delay: Duration) {
        *self.capabilities_delay.lock().unwrap() = delay;
    }

    pub fn push_transfer_fault(&self, fault: TransferFault) {
        self.transfer_faults.lock().unwrap().push_back(fault);
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn push_start(&self, reply: Reply) {
        self.starts.lock().unwrap().push_back(reply);
    }

    pub fn push_status(&self, reply: Reply) {
        self.statuses.lock().unwrap().push_back(reply);
    }

    pub fn push_cancel(&self, reply: Reply) {
        self.cancels.lock().unwrap().push_back(reply);
    }

    pub fn push_complete(&self, reply: Result<Option<ScriptStatusResponse>, RpcError>) {
        self.completes.lock().unwrap().push_back(reply);
    }

    pub fn seen(&self) -> Vec<SeenCall> {
        self.seen.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.seen().iter().filter(|c| c.name == name).count()
    }

    fn record(&self, name: &'static str, service: Option<ScriptServiceVersion>, seq: Option<i64>) {
        self.seen.lock().unwrap().push(SeenCall {
            name,
            service,
            last_log_sequence: seq,
        });
    }

    async fn answer(
        queue: &Mutex<VecDeque<Reply>>,
        ticket: &ScriptTicket,
        fallback: ScriptStatusResponse,
    ) -> Result<ScriptStatusResponse, RpcError> {
        let reply = queue.lock().unwrap().pop_front();
        let mut status = match reply {
            Some(Reply::Status(status)) => status,
            Some(Reply::Error(err)) => return Err(err),
            Some(Reply::Hang) => std::future::pending().await,
            None => fallback,
        };
        status.ticket = ticket.clone();
        Ok(status)
    }

    async fn transfer_fault(&self) -> Result<(), RpcError> {
        let fault = self.transfer_faults.lock().unwrap().pop_front();
        match fault {
            Some(TransferFault::Error(err)) => Err(err),
            Some(TransferFault::Hang) => std::future::pending().await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TentacleRpc for FakeTentacle {
    async fn get_capabilities(&self) -> Result<CapabilitiesResponse, RpcError> {
        self.record("GetCapabilities", None, None);
        let delay = *self.capabilities_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.capabilities.lock().unwrap().pop_front();
        match scripted {
            Some(reply) => reply,
            None => Ok(CapabilitiesResponse::new(
                self.default_capabilities.lock().unwrap().clone(),
            )),
        }
    }

    async fn start_script(
        &self,
        service: ScriptServiceVersion,
        command: &StartScriptCommand,
    ) -> Result<ScriptStatusResponse, RpcError> {
        self.record("StartScript", Some(service), None);
        Self::answer(
            &self.starts,
            &command.script_ticket,
            status(ProcessState::Running, RUNNING_EXIT_CODE, &[], 0),
        )
        .await
    }

    async fn get_status(
        &self,
        service: ScriptServiceVersion,
        request: &ScriptStatusRequest,
    ) -> Result<ScriptStatusResponse, RpcError> {
        self.record("GetStatus", Some(service), Some(request.last_log_sequence));
        Self::answer(
            &self.statuses,
            &request.ticket,
            status(
                ProcessState::Running,
                RUNNING_EXIT_CODE,
                &[],
                request.last_log_sequence,
            ),
        )
        .await
    }

    async fn cancel_script(
        &self,
        service: ScriptServiceVersion,
        command: &CancelScriptCommand,
    ) -> Result<ScriptStatusResponse, RpcError> {
        self.record("CancelScript", Some(service), Some(command.last_log_sequence));
        Self::answer(
            &self.cancels,
            &command.ticket,
            status(
                ProcessState::Complete,
                CANCELED_EXIT_CODE,
                &[],
                command.last_log_sequence,
            ),
        )
        .await
    }

    async fn complete_script(
        &self,
        service: ScriptServiceVersion,
        command: &CompleteScriptCommand,
    ) -> Result<Option<ScriptStatusResponse>, RpcError> {
        self.record("CompleteScript", Some(service), Some(command.last_log_sequence));
        let scripted = self.completes.lock().unwrap().pop_front();
        scripted.unwrap_or(Ok(None))
    }

    async fn upload_file(&self, command: &UploadFileCommand) -> Result<UploadResult, RpcError> {
        self.record("UploadFile", None, None);
        self.transfer_fault().await?;
        self.files
            .lock()
            .unwrap()
            .insert(command.remote_path.clone(), command.data.clone());
        Ok(UploadResult {
            full_path: command.remote_path.clone(),
            hash: String::new(),
            length: command.data.len() as u64,
        })
    }

    async fn download_file(&self, request: &DownloadFileRequest) -> Result<Vec<u8>, RpcError> {
        self.record("DownloadFile", None, None);
        self.transfer_fault().await?;
        self.file(&request.remote_path)
            .ok_or_else(|| RpcError::rejected(format!("no file at {}", request.remote_path)))
    }
}

/// Collects everything the client reports.
#[derive(Default)]
pub struct RecordingObserver {
    pub rpc_calls: Mutex<Vec<RpcCallMetrics>>,
    pub operations: Mutex<Vec<ClientOperationMetrics>>,
}

impl RecordingObserver {
    pub fn calls_named(&self, name: &str) -> Vec<RpcCallMetrics> {
        self.rpc_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.rpc_call.name == name)
            .cloned()
            .collect()
    }
}

impl TentacleClientObserver for RecordingObserver {
    fn rpc_call_completed(&self, metrics: &RpcCallMetrics) {
        self.rpc_calls.lock().unwrap().push(metrics.clone());
    }

    fn operation_completed(&self, metrics: &ClientOperationMetrics) {
        self.operations.lock().unwrap().push(metrics.clone());
    }
}

pub fn fast_options() -> TentacleClientOptions {
    let mut options = TentacleClientOptions::default();
    options.rpc_retry.backoff_unit_ms = 1;
    options.rpc_retry.retry_timeout_secs = 30;
    options.rpc_retry.retry_if_remaining_at_least_ms = 10;
    options.polling.interval_ms = 1;
    options.polling.max_interval_ms = 5;
    options.cancellation_hard_deadline_secs = 5;
    options.abandon_complete_script_after_secs = 1;
    options.stop_grace_period_secs = 5;
    options
}

pub fn endpoint() -> ServiceEndpoint {
    ServiceEndpoint::new("https://tentacle.test:10933", "THUMBPRINT")
}

pub fn client_for(
    fake: &Arc<FakeTentacle>,
    options: TentacleClientOptions,
) -> (TentacleClient, Arc<RecordingObserver>) {
    let observer = Arc::new(RecordingObserver::default());
    let rpc: Arc<dyn TentacleRpc> = fake.clone();
    let client = TentacleClient::new(endpoint(), rpc, options).with_observer(observer.clone());
    (client, observer)
}
