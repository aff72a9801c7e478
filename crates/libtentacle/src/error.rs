use thiserror::Error;
use tentacle_protocol::{RpcError, ScriptTicket};

#[derive(Error, Debug)]
pub enum TentacleError {
    #[error("script not found: {0}")]
    ScriptNotFound(ScriptTicket),

    #[error("service {0} is not offered by this tentacle")]
    ServiceNotSupported(String),

    #[error("file not found: {}", .0.display())]
    FileNotFound(std::path::PathBuf),

    #[error("script log already has an open writer")]
    WriterAlreadyOpen,

    #[error("script log entry could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TentacleError {
    /// Convert to the error reported over the RPC channel, keeping internal
    /// detail out of the message.
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            TentacleError::ScriptNotFound(_)
            | TentacleError::ServiceNotSupported(_)
            | TentacleError::FileNotFound(_) => RpcError::rejected(self.to_string()),
            TentacleError::WriterAlreadyOpen => RpcError::rejected("script is already running"),
            TentacleError::Encode(_) | TentacleError::Io(_) => {
                RpcError::rejected("internal tentacle error")
            }
        }
    }
}

impl From<TentacleError> for RpcError {
    fn from(err: TentacleError) -> Self {
        err.to_rpc_error()
    }
}
