//! Client-side orchestration of scripts on tentacle agents.
//!
//! [`TentacleClient`] negotiates which script service an agent speaks,
//! starts a script, polls it to completion through a retrying RPC executor
//! and releases it, appending every line of output to a [`ScriptLog`].
//! Files move to and from the agent over the same retrying executor.

pub mod background;
pub mod backoff;
pub mod capabilities;
pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod file_transfer;
pub mod metrics;
pub mod observer;
pub mod orchestrator;
pub mod retry;
pub mod script_service;

pub use background::BackgroundTask;
pub use capabilities::{CapabilityNegotiator, select_script_service};
pub use client::{ScriptHandle, ScriptRun, TentacleClient};
pub use config::{ConfigError, PollingOptions, RpcRetryOptions, TentacleClientOptions};
pub use error::{ClientResult, TentacleClientError};
pub use executor::RpcCallExecutor;
pub use file_transfer::FileTransferExecutor;
pub use libtentacle::ScriptLog;
pub use metrics::{ClientOperationMetrics, RpcCall, RpcCallMetrics, TimedOperation};
pub use observer::{LoggingObserver, NoopObserver, TentacleClientObserver};
pub use orchestrator::{
    NoHooks, OrchestratorState, ScriptExecutionHooks, ScriptExecutionResult, ScriptOrchestrator,
};
pub use script_service::ScriptOperationResult;
