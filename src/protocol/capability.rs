//! Handshake types: protocol version, peer identity, capability sets.
//!
//! The capability set an upstream peer advertises during `initialize`
//! decides which method families the bridge relays for the rest of the
//! session. Unknown capability groups are preserved verbatim so the
//! replayed handshake result never loses information.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::method::CapabilityGroup;

/// MCP protocol revision the bridge speaks.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// `prompts` capability flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PromptsCapability {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

/// `resources` capability flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourcesCapability {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

/// `tools` capability flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolsCapability {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

/// Capability groups advertised in an `initialize` exchange.
///
/// Group presence is what gates relaying; the per-group flags are kept
/// for the replayed result but do not change the method table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CapabilitySet {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<PromptsCapability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesCapability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completions: Option<Value>,
    /// Capability groups this bridge does not know about (preserved as-is)
    #[serde(flatten)]
    pub extra: Option<Value>,
}

impl CapabilitySet {
    /// Whether the peer advertised the given group.
    pub fn has(&self, group: CapabilityGroup) -> bool {
        match group {
            CapabilityGroup::Prompts => self.prompts.is_some(),
            CapabilityGroup::Resources => self.resources.is_some(),
            CapabilityGroup::Tools => self.tools.is_some(),
            CapabilityGroup::Logging => self.logging.is_some(),
        }
    }
}

/// Name and version a peer reports about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

impl PeerIdentity {
    /// Identity the bridge presents as a client during the handshake.
    pub fn bridge() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Params of the `initialize` request the bridge sends upstream.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    /// The bridge advertises no capabilities of its own
    pub capabilities: CapabilitySet,
    pub client_info: PeerIdentity,
}

impl InitializeParams {
    pub fn new(client_info: PeerIdentity) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: CapabilitySet::default(),
            client_info,
        }
    }
}

/// Typed view of an `initialize` result.
///
/// The raw result value is stored separately for replay; this parse only
/// feeds capability gating and handshake logging.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: CapabilitySet,
    /// Required by the protocol, but tolerated when absent
    pub server_info: Option<PeerIdentity>,
}

impl InitializeResult {
    /// The upstream identity, with a placeholder for peers that omit it.
    pub fn server_identity(&self) -> PeerIdentity {
        self.server_info.clone().unwrap_or_else(|| PeerIdentity {
            name: "unknown".to_string(),
            version: String::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_full_initialize_result() {
        let raw = json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {
                "tools": { "listChanged": true },
                "resources": { "subscribe": true, "listChanged": false },
                "logging": {}
            },
            "serverInfo": { "name": "mock-tool", "version": "0.3.1" }
        });

        let result: InitializeResult = serde_json::from_value(raw).unwrap();

        assert_eq!(result.protocol_version, "2024-11-05");
        assert!(result.capabilities.has(CapabilityGroup::Tools));
        assert!(result.capabilities.has(CapabilityGroup::Resources));
        assert!(result.capabilities.has(CapabilityGroup::Logging));
        assert!(!result.capabilities.has(CapabilityGroup::Prompts));
        assert_eq!(
            result.capabilities.resources.unwrap().subscribe,
            Some(true)
        );
        assert_eq!(result.server_identity().name, "mock-tool");
    }

    #[test]
    fn test_missing_capabilities_default_empty() {
        let raw = json!({ "protocolVersion": "2024-11-05" });

        let result: InitializeResult = serde_json::from_value(raw).unwrap();

        assert!(!result.capabilities.has(CapabilityGroup::Tools));
        assert!(!result.capabilities.has(CapabilityGroup::Prompts));
        assert_eq!(result.server_identity().name, "unknown");
    }

    #[test]
    fn test_unknown_capability_groups_preserved() {
        let raw = json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {
                "tools": {},
                "experimental": { "sampling": true }
            },
            "serverInfo": { "name": "x", "version": "1" }
        });

        let result: InitializeResult = serde_json::from_value(raw).unwrap();
        let extra = result.capabilities.extra.unwrap();
        assert_eq!(extra["experimental"]["sampling"], json!(true));
    }

    #[test]
    fn test_initialize_params_shape() {
        let params = InitializeParams::new(PeerIdentity::bridge());
        let json = serde_json::to_value(&params).unwrap();

        assert_eq!(json["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(json["capabilities"], json!({}));
        assert_eq!(json["clientInfo"]["name"], env!("CARGO_PKG_NAME"));
    }

    #[test]
    fn test_peer_identity_tolerates_missing_version() {
        let identity: PeerIdentity =
            serde_json::from_value(json!({ "name": "bare" })).unwrap();
        assert_eq!(identity.name, "bare");
        assert_eq!(identity.version, "");
    }
}
