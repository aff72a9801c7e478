use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tentacle_protocol::capabilities::{
    CAPABILITIES_SERVICE_V2, FILE_TRANSFER_SERVICE, SCRIPT_SERVICE, SCRIPT_SERVICE_V2,
};
use tentacle_protocol::{
    CANCELED_EXIT_CODE, CancelScriptCommand, CapabilitiesResponse, CompleteScriptCommand,
    DownloadFileRequest, FATAL_EXIT_CODE, ProcessOutputSource, ProcessState, RUNNING_EXIT_CODE,
    RpcError, ScriptIsolationLevel, ScriptServiceVersion, ScriptStatusRequest,
    ScriptStatusResponse, ScriptTicket, StartScriptCommand, TentacleRpc, UploadFileCommand,
    UploadResult,
};

use crate::error::TentacleError;
use crate::keyed_lock::{KeyedLock, KeyedSemaphore, WriteReleaser};
use crate::script_log::{ScriptLog, ScriptLogWriter};

const DEFAULT_ISOLATION_MUTEX: &str = "RunningScript";

#[derive(Deserialize, Debug, Clone)]
pub struct LocalScriptServiceConfig {
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<String>,
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Directory for per-ticket JSONL output. Logs stay in memory when unset.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    /// Base for relative upload and download paths. The working directory
    /// when unset.
    #[serde(default)]
    pub file_root: Option<PathBuf>,
}

impl Default for LocalScriptServiceConfig {
    fn default() -> Self {
        Self {
            capabilities: default_capabilities(),
            shell: default_shell(),
            log_dir: None,
            file_root: None,
        }
    }
}

fn default_capabilities() -> Vec<String> {
    [
        SCRIPT_SERVICE,
        SCRIPT_SERVICE_V2,
        FILE_TRANSFER_SERVICE,
        CAPABILITIES_SERVICE_V2,
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_shell() -> String {
    "sh".to_string()
}

#[derive(Debug, Clone, Copy)]
struct Progress {
    state: ProcessState,
    exit_code: i32,
}

struct ScriptRecord {
    log: ScriptLog,
    progress: Mutex<Progress>,
    cancel: CancellationToken,
}

impl ScriptRecord {
    fn progress(&self) -> Progress {
        *self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_progress(&self, state: ProcessState, exit_code: i32) {
        *self.progress.lock().unwrap_or_else(PoisonError::into_inner) = Progress { state, exit_code };
    }

    fn status(&self, ticket: &ScriptTicket, after_sequence: i64) -> ScriptStatusResponse {
        // Progress first: once it reads Complete every log line is already in.
        let progress = self.progress();
        let (logs, next_log_sequence) = self.log.get_output(after_sequence);
        ScriptStatusResponse {
            ticket: ticket.clone(),
            state: progress.state,
            exit_code: progress.exit_code,
            logs,
            next_log_sequence,
        }
    }
}

struct Inner {
    config: LocalScriptServiceConfig,
    scripts: Mutex<HashMap<ScriptTicket, Arc<ScriptRecord>>>,
    ticket_locks: KeyedLock<ScriptTicket>,
    isolation: KeyedSemaphore<String>,
}

/// In-process agent that runs scripts with the local shell.
#[derive(Clone)]
pub struct LocalScriptService {
    inner: Arc<Inner>,
}

impl LocalScriptService {
    pub fn new(config: LocalScriptServiceConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                scripts: Mutex::new(HashMap::new()),
                ticket_locks: KeyedLock::new(),
                isolation: KeyedSemaphore::new(),
            }),
        }
    }

    /// Tickets the agent still holds state for.
    pub fn known_tickets(&self) -> Vec<ScriptTicket> {
        self.scripts().keys().cloned().collect()
    }

    /// Live output of a script, if the ticket is known.
    pub fn script_log(&self, ticket: &ScriptTicket) -> Option<ScriptLog> {
        self.scripts().get(ticket).map(|r| r.log.clone())
    }

    fn scripts(&self) -> MutexGuard<'_, HashMap<ScriptTicket, Arc<ScriptRecord>>> {
        self.inner
            .scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, ticket: &ScriptTicket) -> Result<Arc<ScriptRecord>, TentacleError> {
        self.scripts()
            .get(ticket)
            .cloned()
            .ok_or_else(|| TentacleError::ScriptNotFound(ticket.clone()))
    }

    fn ensure_supported(&self, service: ScriptServiceVersion) -> Result<(), TentacleError> {
        self.ensure_offered(service.service_name())
    }

    fn ensure_offered(&self, name: &str) -> Result<(), TentacleError> {
        if self.inner.config.capabilities.iter().any(|c| c == name) {
            Ok(())
        } else {
            Err(TentacleError::ServiceNotSupported(name.to_string()))
        }
    }

    fn resolve(&self, remote_path: &str) -> PathBuf {
        let path = Path::new(remote_path);
        match &self.inner.config.file_root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }

    async fn store_file(&self, command: &UploadFileCommand) -> Result<UploadResult, TentacleError> {
        self.ensure_offered(FILE_TRANSFER_SERVICE)?;
        let path = self.resolve(&command.remote_path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &command.data).await?;

        let result = UploadResult {
            full_path: std::path::absolute(&path)?.display().to_string(),
            hash: hex::encode(Sha256::digest(&command.data)),
            length: command.data.len() as u64,
        };
        info!(path = %result.full_path, length = result.length, "stored uploaded file");
        Ok(result)
    }

    async fn read_file(&self, request: &DownloadFileRequest) -> Result<Vec<u8>, TentacleError> {
        self.ensure_offered(FILE_TRANSFER_SERVICE)?;
        let path = self.resolve(&request.remote_path);
        match tokio::fs::read(&path).await {
            Ok(data) => {
                debug!(path = %path.display(), length = data.len(), "sending file");
                Ok(data)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(TentacleError::FileNotFound(path))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn lock_ticket(&self, ticket: &ScriptTicket) -> Result<WriteReleaser<ScriptTicket>, RpcError> {
        self.inner
            .ticket_locks
            .lock(ticket.clone(), &CancellationToken::new())
            .await
            .into_guard()
            .ok_or_else(|| RpcError::rejected(format!("ticket {ticket} is busy")))
    }

    fn open_log(&self, ticket: &ScriptTicket) -> Result<ScriptLog, TentacleError> {
        match &self.inner.config.log_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                ScriptLog::open(dir.join(format!("{ticket}.jsonl")))
            }
            None => Ok(ScriptLog::new()),
        }
    }

    fn launch(&self, command: &StartScriptCommand) -> Result<Arc<ScriptRecord>, TentacleError> {
        let log = self.open_log(&command.script_ticket)?;
        let writer = log.create_writer()?;
        let record = Arc::new(ScriptRecord {
            log,
            progress: Mutex::new(Progress {
                state: ProcessState::Pending,
                exit_code: RUNNING_EXIT_CODE,
            }),
            cancel: CancellationToken::new(),
        });

        let job = ScriptJob {
            ticket: command.script_ticket.clone(),
            shell: self.inner.config.shell.clone(),
            body: command.script_body.clone(),
            arguments: command.arguments.clone(),
            isolation: match command.isolation {
                ScriptIsolationLevel::FullIsolation => Some(
                    command
                        .isolation_mutex_name
                        .clone()
                        .unwrap_or_else(|| DEFAULT_ISOLATION_MUTEX.to_string()),
                ),
                ScriptIsolationLevel::NoIsolation => None,
            },
        };
        tokio::spawn(job.run(
            Arc::clone(&record),
            writer,
            self.inner.isolation.clone(),
        ));
        Ok(record)
    }
}

impl Default for LocalScriptService {
    fn default() -> Self {
        Self::new(LocalScriptServiceConfig::default())
    }
}

struct ScriptJob {
    ticket: ScriptTicket,
    shell: String,
    body: String,
    arguments: Vec<String>,
    isolation: Option<String>,
}

impl ScriptJob {
    async fn run(self, record: Arc<ScriptRecord>, mut writer: ScriptLogWriter, isolation: KeyedSemaphore<String>) {
        let _isolation_guard = match &self.isolation {
            Some(name) => {
                debug!(ticket = %self.ticket, mutex = %name, "waiting for isolation mutex");
                match isolation.wait(name.clone(), &record.cancel).await.into_guard() {
                    Some(guard) => Some(guard),
                    None => {
                        self.finish(&record, writer, CANCELED_EXIT_CODE);
                        return;
                    }
                }
            }
            None => None,
        };

        let exit_code = self.execute(&record, &mut writer).await;
        self.finish(&record, writer, exit_code);
    }

    async fn execute(&self, record: &ScriptRecord, writer: &mut ScriptLogWriter) -> i32 {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&self.body)
            .arg("tentacle-script")
            .args(&self.arguments)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(ticket = %self.ticket, "failed to spawn script: {err}");
                let _ = writer.write_output(
                    ProcessOutputSource::StdErr,
                    format!("failed to start {}: {err}", self.shell),
                );
                return FATAL_EXIT_CODE;
            }
        };
        record.set_progress(ProcessState::Running, RUNNING_EXIT_CODE);
        info!(ticket = %self.ticket, pid = ?child.id(), "script started");

        let (tx, mut rx) = mpsc::channel::<(ProcessOutputSource, String)>(256);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, ProcessOutputSource::StdOut, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, ProcessOutputSource::StdErr, tx.clone()));
        }
        drop(tx);

        loop {
            tokio::select! {
                biased;
                _ = record.cancel.cancelled() => {
                    info!(ticket = %self.ticket, "killing cancelled script");
                    if let Err(err) = child.kill().await {
                        warn!(ticket = %self.ticket, "failed to kill script: {err}");
                    }
                    return CANCELED_EXIT_CODE;
                }
                line = rx.recv() => match line {
                    Some((source, text)) => {
                        if let Err(err) = writer.write_output(source, text) {
                            warn!(ticket = %self.ticket, "failed to record output: {err}");
                        }
                    }
                    None => break,
                },
            }
        }

        tokio::select! {
            biased;
            _ = record.cancel.cancelled() => {
                let _ = child.kill().await;
                CANCELED_EXIT_CODE
            }
            status = child.wait() => match status {
                Ok(status) => status.code().unwrap_or(FATAL_EXIT_CODE),
                Err(err) => {
                    warn!(ticket = %self.ticket, "failed to wait for script: {err}");
                    FATAL_EXIT_CODE
                }
            },
        }
    }

    fn finish(&self, record: &ScriptRecord, writer: ScriptLogWriter, exit_code: i32) {
        writer.finish();
        record.set_progress(ProcessState::Complete, exit_code);
        info!(ticket = %self.ticket, exit_code, "script finished");
    }
}

async fn forward_lines<R>(reader: R, source: ProcessOutputSource, tx: mpsc::Sender<(ProcessOutputSource, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send((source, line)).await.is_err() {
            break;
        }
    }
}

#[async_trait]
impl TentacleRpc for LocalScriptService {
    async fn get_capabilities(&self) -> Result<CapabilitiesResponse, RpcError> {
        Ok(CapabilitiesResponse::new(self.inner.config.capabilities.iter().cloned()))
    }

    async fn start_script(
        &self,
        service: ScriptServiceVersion,
        command: &StartScriptCommand,
    ) -> Result<ScriptStatusResponse, RpcError> {
        self.ensure_supported(service)?;
        let ticket = &command.script_ticket;
        let _guard = self.lock_ticket(ticket).await?;

        // A retried start finds the script already running.
        let existing = self.scripts().get(ticket).cloned();
        let record = match existing {
            Some(record) => {
                debug!(ticket = %ticket, "start repeated for known ticket");
                record
            }
            None => {
                let record = self.launch(command)?;
                self.scripts().insert(ticket.clone(), Arc::clone(&record));
                info!(ticket = %ticket, service = %service, "accepted script");
                record
            }
        };
        Ok(record.status(ticket, 0))
    }

    async fn get_status(
        &self,
        service: ScriptServiceVersion,
        request: &ScriptStatusRequest,
    ) -> Result<ScriptStatusResponse, RpcError> {
        self.ensure_supported(service)?;
        let record = self.record(&request.ticket)?;
        Ok(record.status(&request.ticket, request.last_log_sequence))
    }

    async fn cancel_script(
        &self,
        service: ScriptServiceVersion,
        command: &CancelScriptCommand,
    ) -> Result<ScriptStatusResponse, RpcError> {
        self.ensure_supported(service)?;
        let _guard = self.lock_ticket(&command.ticket).await?;
        let record = self.record(&command.ticket)?;
        if !record.cancel.is_cancelled() {
            info!(ticket = %command.ticket, "cancel requested");
            record.cancel.cancel();
        }
        Ok(record.status(&command.ticket, command.last_log_sequence))
    }

    async fn complete_script(
        &self,
        service: ScriptServiceVersion,
        command: &CompleteScriptCommand,
    ) -> Result<Option<ScriptStatusResponse>, RpcError> {
        self.ensure_supported(service)?;
        let _guard = self.lock_ticket(&command.ticket).await?;
        let record = self
            .scripts()
            .remove(&command.ticket)
            .ok_or_else(|| TentacleError::ScriptNotFound(command.ticket.clone()))?;
        record.cancel.cancel();
        debug!(ticket = %command.ticket, "released script state");

        Ok(match service {
            ScriptServiceVersion::Legacy => {
                Some(record.status(&command.ticket, command.last_log_sequence))
            }
            ScriptServiceVersion::V2 | ScriptServiceVersion::Kubernetes => None,
        })
    }

    async fn upload_file(&self, command: &UploadFileCommand) -> Result<UploadResult, RpcError> {
        Ok(self.store_file(command).await?)
    }

    async fn download_file(&self, request: &DownloadFileRequest) -> Result<Vec<u8>, RpcError> {
        Ok(self.read_file(request).await?)
    }
}
