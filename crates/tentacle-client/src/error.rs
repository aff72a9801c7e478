use thiserror::Error;

use tentacle_protocol::{RpcError, ScriptTicket};

pub type ClientResult<T> = std::result::Result<T, TentacleClientError>;

#[derive(Debug, Clone, Error)]
pub enum TentacleClientError {
    /// Transport kept failing until the retry budget ran out, or the only
    /// attempt failed when retries are off.
    #[error("{rpc_call} failed after {attempts} attempt(s): {last_error}")]
    RetriesExhausted {
        rpc_call: String,
        attempts: usize,
        last_error: RpcError,
    },
    #[error("{rpc_call} rejected by tentacle: {message}")]
    Rejected { rpc_call: String, message: String },
    #[error("{operation} was cancelled")]
    Cancelled { operation: String },
    #[error("{rpc_call} abandoned {abandoned_after_ms}ms after cancellation")]
    Abandoned {
        rpc_call: String,
        abandoned_after_ms: u64,
    },
    #[error("could not acquire the lock for script {ticket}")]
    LockNotAcquired { ticket: ScriptTicket },
    #[error("script log unavailable: {message}")]
    LogUnavailable { message: String },
}

impl TentacleClientError {
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// The agent could not be reached reliably, as opposed to refusing the
    /// request.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. } | Self::Abandoned { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. } | Self::LockNotAcquired { .. })
    }

    /// The transport error behind an infrastructure failure.
    pub fn rpc_error(&self) -> Option<&RpcError> {
        match self {
            Self::RetriesExhausted { last_error, .. } => Some(last_error),
            _ => None,
        }
    }

    pub(crate) fn from_rpc(rpc_call: &impl std::fmt::Display, attempts: usize, err: RpcError) -> Self {
        match err {
            RpcError::Rejected { message } => Self::Rejected {
                rpc_call: rpc_call.to_string(),
                message,
            },
            transient => Self::RetriesExhausted {
                rpc_call: rpc_call.to_string(),
                attempts,
                last_error: transient,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let exhausted =
            TentacleClientError::from_rpc(&"IScriptServiceV2.GetStatus", 3, RpcError::connection("reset"));
        assert!(exhausted.is_infrastructure());
        assert!(exhausted.rpc_error().is_some_and(RpcError::is_connection));

        let rejected =
            TentacleClientError::from_rpc(&"IScriptServiceV2.GetStatus", 1, RpcError::rejected("unknown ticket"));
        assert!(!rejected.is_infrastructure());
        assert!(matches!(rejected, TentacleClientError::Rejected { .. }));

        assert!(TentacleClientError::cancelled("execute_script").is_cancelled());
    }

    #[test]
    fn messages_name_the_call() {
        let err = TentacleClientError::from_rpc(&"IScriptService.StartScript", 4, RpcError::timeout("no reply"));
        assert_eq!(
            err.to_string(),
            "IScriptService.StartScript failed after 4 attempt(s): request timed out: no reply"
        );
    }
}
