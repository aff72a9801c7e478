use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::{
    CancelScriptCommand, CapabilitiesResponse, CompleteScriptCommand, DownloadFileRequest,
    ScriptServiceVersion, ScriptStatusRequest, ScriptStatusResponse, StartScriptCommand,
    UploadFileCommand, UploadResult,
};

/// Address of an agent plus the certificate thumbprint it is trusted under.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceEndpoint {
    pub base_uri: String,
    pub remote_thumbprint: String,
}

impl ServiceEndpoint {
    pub fn new(base_uri: impl Into<String>, remote_thumbprint: impl Into<String>) -> Self {
        Self {
            base_uri: base_uri.into(),
            remote_thumbprint: remote_thumbprint.into(),
        }
    }
}

impl fmt::Display for ServiceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.base_uri, self.remote_thumbprint)
    }
}

/// Failure of a single call on the RPC channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// The request could not be delivered: refused, reset, or dropped.
    #[error("connection error: {message}")]
    Connection { message: String },

    #[error("request timed out: {message}")]
    Timeout { message: String },

    /// The agent received the request and refused it.
    #[error("rejected by tentacle: {message}")]
    Rejected { message: String },
}

impl RpcError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// True when the request is known not to have reached the agent.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}

/// Typed request/reply channel to one agent.
///
/// Implementations own transport and authentication. Dropping a returned
/// future abandons the call locally; the agent may still act on it.
#[async_trait]
pub trait TentacleRpc: Send + Sync {
    async fn get_capabilities(&self) -> Result<CapabilitiesResponse, RpcError>;

    async fn start_script(
        &self,
        service: ScriptServiceVersion,
        command: &StartScriptCommand,
    ) -> Result<ScriptStatusResponse, RpcError>;

    async fn get_status(
        &self,
        service: ScriptServiceVersion,
        request: &ScriptStatusRequest,
    ) -> Result<ScriptStatusResponse, RpcError>;

    async fn cancel_script(
        &self,
        service: ScriptServiceVersion,
        command: &CancelScriptCommand,
    ) -> Result<ScriptStatusResponse, RpcError>;

    /// Release agent-side resources. Only the legacy service answers with a
    /// final status.
    async fn complete_script(
        &self,
        service: ScriptServiceVersion,
        command: &CompleteScriptCommand,
    ) -> Result<Option<ScriptStatusResponse>, RpcError>;

    /// Store a file on the agent, replacing any file already at the path.
    async fn upload_file(&self, command: &UploadFileCommand) -> Result<UploadResult, RpcError>;

    async fn download_file(&self, request: &DownloadFileRequest) -> Result<Vec<u8>, RpcError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(RpcError::connection("reset").is_transient());
        assert!(RpcError::timeout("slow").is_transient());
        assert!(!RpcError::rejected("unknown ticket").is_transient());
        assert!(RpcError::connection("reset").is_connection());
        assert!(!RpcError::timeout("slow").is_connection());
    }

    #[test]
    fn endpoint_display_includes_thumbprint() {
        let endpoint = ServiceEndpoint::new("https://agent:10933", "ABCD");
        assert_eq!(endpoint.to_string(), "https://agent:10933 (ABCD)");
    }
}
