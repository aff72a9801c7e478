pub mod capabilities;
pub mod file_transfer;
pub mod paths;
pub mod rpc;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

pub use capabilities::CapabilitiesResponse;
pub use file_transfer::{DownloadFileRequest, UploadFileCommand, UploadResult};
pub use rpc::{RpcError, ServiceEndpoint, TentacleRpc};

/// Exit code reported while a script has not finished yet.
pub const RUNNING_EXIT_CODE: i32 = -45;
/// Exit code reported when the agent itself failed to run the script.
pub const FATAL_EXIT_CODE: i32 = -42;
/// Exit code reported for a script that was cancelled.
pub const CANCELED_EXIT_CODE: i32 = -43;
/// Exit code reported when the agent no longer knows the ticket.
pub const UNKNOWN_SCRIPT_EXIT_CODE: i32 = -46;

/// Opaque identifier for one remote script execution.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ScriptTicket(String);

impl ScriptTicket {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Mint a fresh ticket for a script that has not been started yet.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScriptTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Script service protocol variant spoken with an agent.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScriptServiceVersion {
    Legacy,
    V2,
    Kubernetes,
}

impl ScriptServiceVersion {
    /// Service name used when addressing and reporting calls.
    pub fn service_name(self) -> &'static str {
        match self {
            Self::Legacy => capabilities::SCRIPT_SERVICE,
            Self::V2 => capabilities::SCRIPT_SERVICE_V2,
            Self::Kubernetes => capabilities::KUBERNETES_SCRIPT_SERVICE_V1,
        }
    }
}

impl fmt::Display for ScriptServiceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.service_name())
    }
}

/// Resumable cursor for one script: which ticket, how much output has been
/// consumed, and which protocol the script was started with.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CommandContext {
    pub script_ticket: ScriptTicket,
    pub next_log_sequence: i64,
    pub script_service_version: ScriptServiceVersion,
}

impl CommandContext {
    pub fn new(
        script_ticket: ScriptTicket,
        next_log_sequence: i64,
        script_service_version: ScriptServiceVersion,
    ) -> Self {
        Self {
            script_ticket,
            next_log_sequence,
            script_service_version,
        }
    }

    /// Context for a script whose start response was never observed.
    pub fn started(script_ticket: ScriptTicket, script_service_version: ScriptServiceVersion) -> Self {
        Self::new(script_ticket, 0, script_service_version)
    }

    pub fn advanced_by(&self, response: &ScriptStatusResponse) -> Self {
        Self {
            script_ticket: response.ticket.clone(),
            next_log_sequence: response.next_log_sequence,
            script_service_version: self.script_service_version,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProcessOutputSource {
    StdOut,
    StdErr,
    Debug,
}

impl ProcessOutputSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StdOut => "stdout",
            Self::StdErr => "stderr",
            Self::Debug => "debug",
        }
    }
}

/// One line of script output.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub source: ProcessOutputSource,
    pub text: String,
    #[serde(rename = "occurred_at_ms", with = "epoch_ms")]
    pub occurred_at: SystemTime,
}

impl ProcessOutput {
    pub fn new(source: ProcessOutputSource, text: impl Into<String>) -> Self {
        Self::at(source, text, SystemTime::now())
    }

    pub fn at(source: ProcessOutputSource, text: impl Into<String>, occurred_at: SystemTime) -> Self {
        Self {
            source,
            text: text.into(),
            occurred_at,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Pending,
    Running,
    Complete,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScriptIsolationLevel {
    #[default]
    NoIsolation,
    FullIsolation,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StartScriptCommand {
    pub script_ticket: ScriptTicket,
    pub script_body: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub isolation: ScriptIsolationLevel,
    #[serde(default)]
    pub isolation_mutex_name: Option<String>,
}

impl StartScriptCommand {
    pub fn new(script_body: impl Into<String>) -> Self {
        Self {
            script_ticket: ScriptTicket::generate(),
            script_body: script_body.into(),
            arguments: Vec::new(),
            task_id: None,
            isolation: ScriptIsolationLevel::default(),
            isolation_mutex_name: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScriptStatusRequest {
    pub ticket: ScriptTicket,
    pub last_log_sequence: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CancelScriptCommand {
    pub ticket: ScriptTicket,
    pub last_log_sequence: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CompleteScriptCommand {
    pub ticket: ScriptTicket,
    pub last_log_sequence: i64,
}

impl From<&CommandContext> for ScriptStatusRequest {
    fn from(ctx: &CommandContext) -> Self {
        Self {
            ticket: ctx.script_ticket.clone(),
            last_log_sequence: ctx.next_log_sequence,
        }
    }
}

impl From<&CommandContext> for CancelScriptCommand {
    fn from(ctx: &CommandContext) -> Self {
        Self {
            ticket: ctx.script_ticket.clone(),
            last_log_sequence: ctx.next_log_sequence,
        }
    }
}

impl From<&CommandContext> for CompleteScriptCommand {
    fn from(ctx: &CommandContext) -> Self {
        Self {
            ticket: ctx.script_ticket.clone(),
            last_log_sequence: ctx.next_log_sequence,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScriptStatusResponse {
    pub ticket: ScriptTicket,
    pub state: ProcessState,
    pub exit_code: i32,
    #[serde(default)]
    pub logs: Vec<ProcessOutput>,
    pub next_log_sequence: i64,
}

impl ScriptStatusResponse {
    pub fn is_complete(&self) -> bool {
        self.state == ProcessState::Complete
    }

    /// Placeholder used when a start call may have reached the agent but
    /// its response was never seen.
    pub fn pending(ticket: ScriptTicket) -> Self {
        Self {
            ticket,
            state: ProcessState::Pending,
            exit_code: RUNNING_EXIT_CODE,
            logs: Vec::new(),
            next_log_sequence: 0,
        }
    }
}

/// Milliseconds since the unix epoch for `SystemTime` fields.
pub mod epoch_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    pub fn to_millis(time: SystemTime) -> u64 {
        time.duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    pub fn from_millis(millis: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(millis)
    }

    pub fn serialize<S: Serializer>(time: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(to_millis(*time))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SystemTime, D::Error> {
        Ok(from_millis(u64::deserialize(d)?))
    }
}
