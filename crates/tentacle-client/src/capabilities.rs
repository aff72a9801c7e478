use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use libtentacle::KeyedLock;
use tentacle_protocol::capabilities::CAPABILITIES_SERVICE_V2;
use tentacle_protocol::{CapabilitiesResponse, ScriptServiceVersion, ServiceEndpoint, TentacleRpc};

use crate::error::{ClientResult, TentacleClientError};
use crate::executor::RpcCallExecutor;
use crate::metrics::{ClientOperationMetricsBuilder, RpcCall};

/// Pick the script service for a capability set. First match wins.
pub fn select_script_service(capabilities: &CapabilitiesResponse) -> ScriptServiceVersion {
    if capabilities.has_any_kubernetes_script_service() {
        ScriptServiceVersion::Kubernetes
    } else if capabilities.has_script_service_v2() {
        ScriptServiceVersion::V2
    } else {
        ScriptServiceVersion::Legacy
    }
}

#[derive(Debug, Clone)]
struct CachedCapabilities {
    capabilities: CapabilitiesResponse,
    agent_version: Option<String>,
}

/// Per-endpoint cache of what each agent supports. Discovery for one
/// endpoint is serialized, so concurrent first use sends one request.
#[derive(Debug, Default)]
pub struct CapabilityNegotiator {
    cache: Mutex<HashMap<ServiceEndpoint, CachedCapabilities>>,
    agent_versions: Mutex<HashMap<ServiceEndpoint, String>>,
    discovery: KeyedLock<ServiceEndpoint>,
}

impl CapabilityNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<ServiceEndpoint, CachedCapabilities>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn agent_versions(&self) -> MutexGuard<'_, HashMap<ServiceEndpoint, String>> {
        self.agent_versions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn cached(&self, endpoint: &ServiceEndpoint) -> Option<CapabilitiesResponse> {
        self.cache().get(endpoint).map(|c| c.capabilities.clone())
    }

    /// Protocol to use with `endpoint`. An agent whose capabilities cannot
    /// be fetched is assumed to speak only the legacy service; that
    /// fallback is not cached.
    pub async fn negotiate(
        &self,
        endpoint: &ServiceEndpoint,
        rpc: &dyn TentacleRpc,
        executor: &RpcCallExecutor,
        operation: &ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptServiceVersion> {
        if let Some(capabilities) = self.cached(endpoint) {
            return Ok(select_script_service(&capabilities));
        }

        let Some(_discovering) = self
            .discovery
            .lock(endpoint.clone(), cancel)
            .await
            .into_guard()
        else {
            return Err(TentacleClientError::cancelled("GetCapabilities"));
        };
        // Another caller may have finished discovery while this one waited.
        if let Some(capabilities) = self.cached(endpoint) {
            return Ok(select_script_service(&capabilities));
        }

        let fetched = executor
            .execute(
                RpcCall::new(CAPABILITIES_SERVICE_V2, "GetCapabilities"),
                true,
                || rpc.get_capabilities(),
                operation,
                cancel,
            )
            .await;

        let capabilities = match fetched {
            Ok(capabilities) => capabilities,
            Err(err @ TentacleClientError::Cancelled { .. }) => return Err(err),
            Err(err) => {
                warn!(
                    endpoint = %endpoint,
                    "could not discover capabilities, falling back to {}: {err}",
                    ScriptServiceVersion::Legacy
                );
                return Ok(ScriptServiceVersion::Legacy);
            }
        };

        let version = select_script_service(&capabilities);
        debug!(
            endpoint = %endpoint,
            capabilities = ?capabilities.supported_capabilities,
            service = %version,
            "discovered tentacle capabilities"
        );
        let agent_version = self.agent_versions().get(endpoint).cloned();
        self.cache().insert(
            endpoint.clone(),
            CachedCapabilities {
                capabilities,
                agent_version,
            },
        );
        Ok(version)
    }

    /// Record the agent version seen on a (re)connection. Cached
    /// capabilities are dropped only if the version changed.
    pub fn on_reconnected(&self, endpoint: &ServiceEndpoint, agent_version: &str) {
        let previous = self
            .agent_versions()
            .insert(endpoint.clone(), agent_version.to_string());

        let mut cache = self.cache();
        let stale = match cache.get(endpoint) {
            Some(cached) => match &cached.agent_version {
                Some(seen) => seen != agent_version,
                None => previous.as_deref().is_some_and(|p| p != agent_version),
            },
            None => false,
        };
        if stale {
            debug!(endpoint = %endpoint, agent_version, "agent version changed, dropping capabilities");
            cache.remove(endpoint);
        }
    }

    pub fn invalidate(&self, endpoint: &ServiceEndpoint) {
        self.cache().remove(endpoint);
    }
}
