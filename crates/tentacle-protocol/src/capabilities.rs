use serde::{Deserialize, Serialize};

pub const CAPABILITIES_SERVICE_V2: &str = "ICapabilitiesServiceV2";
pub const FILE_TRANSFER_SERVICE: &str = "IFileTransferService";
pub const SCRIPT_SERVICE: &str = "IScriptService";
pub const SCRIPT_SERVICE_V2: &str = "IScriptServiceV2";
pub const SCRIPT_SERVICE_V2_ALPHA: &str = "IScriptServiceV2Alpha";
pub const KUBERNETES_SCRIPT_SERVICE_V1: &str = "IKubernetesScriptServiceV1";

/// Substring shared by every kubernetes script service capability.
pub const KUBERNETES_SCRIPT_SERVICE_MARKER: &str = "KubernetesScriptService";

/// Capability set advertised by an agent.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitiesResponse {
    pub supported_capabilities: Vec<String>,
}

impl CapabilitiesResponse {
    pub fn new<I, S>(capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            supported_capabilities: capabilities.into_iter().map(Into::into).collect(),
        }
    }

    pub fn has_any_kubernetes_script_service(&self) -> bool {
        self.supported_capabilities
            .iter()
            .any(|c| c.contains(KUBERNETES_SCRIPT_SERVICE_MARKER))
    }

    pub fn has_script_service_v2(&self) -> bool {
        self.supported_capabilities
            .iter()
            .any(|c| c == SCRIPT_SERVICE_V2 || c == SCRIPT_SERVICE_V2_ALPHA)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpha_name_counts_as_v2() {
        let caps = CapabilitiesResponse::new([SCRIPT_SERVICE_V2_ALPHA]);
        assert!(caps.has_script_service_v2());
        assert!(!caps.has_any_kubernetes_script_service());
    }

    #[test]
    fn v2_match_is_exact() {
        let caps = CapabilitiesResponse::new(["IScriptServiceV2Beta", "MyIScriptServiceV2"]);
        assert!(!caps.has_script_service_v2());
    }

    #[test]
    fn kubernetes_match_is_substring() {
        let caps = CapabilitiesResponse::new(["IKubernetesScriptServiceV1Alpha"]);
        assert!(caps.has_any_kubernetes_script_service());
    }
}
