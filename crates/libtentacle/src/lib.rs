pub mod error;
pub mod keyed_lock;
pub mod local_service;
pub mod script_log;

pub use error::TentacleError;
pub use keyed_lock::{Acquisition, KeyedGuard, KeyedLock, KeyedSemaphore};
pub use local_service::{LocalScriptService, LocalScriptServiceConfig};
pub use script_log::{ScriptLog, ScriptLogWriter};
