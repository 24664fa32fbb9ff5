//! Wire method names for the relayed MCP surface.
//!
//! Dispatch happens on the method string of each decoded request. Every
//! name the bridge understands maps to a [`ProxyMethod`] variant; anything
//! else is answered with method-not-found without touching upstream.

use serde_json::Value;

/// Methods the bridge can relay or answer itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyMethod {
    /// Handshake request, answered from the stored session result
    Initialize,
    /// Liveness check, answered locally with an empty object
    Ping,
    ListPrompts,
    GetPrompt,
    ListResources,
    ReadResource,
    Subscribe,
    Unsubscribe,
    ListTools,
    CallTool,
    SetLogLevel,
    Complete,
}

impl ProxyMethod {
    /// Every known method, in wire-catalog order.
    pub const ALL: [ProxyMethod; 12] = [
        ProxyMethod::Initialize,
        ProxyMethod::Ping,
        ProxyMethod::ListPrompts,
        ProxyMethod::GetPrompt,
        ProxyMethod::ListResources,
        ProxyMethod::ReadResource,
        ProxyMethod::Subscribe,
        ProxyMethod::Unsubscribe,
        ProxyMethod::ListTools,
        ProxyMethod::CallTool,
        ProxyMethod::SetLogLevel,
        ProxyMethod::Complete,
    ];

    /// Parse a wire method name.
    pub fn from_wire(method: &str) -> Option<Self> {
        match method {
            "initialize" => Some(Self::Initialize),
            "ping" => Some(Self::Ping),
            "prompts/list" => Some(Self::ListPrompts),
            "prompts/get" => Some(Self::GetPrompt),
            "resources/list" => Some(Self::ListResources),
            "resources/read" => Some(Self::ReadResource),
            "resources/subscribe" => Some(Self::Subscribe),
            "resources/unsubscribe" => Some(Self::Unsubscribe),
            "tools/list" => Some(Self::ListTools),
            "tools/call" => Some(Self::CallTool),
            "logging/setLevel" => Some(Self::SetLogLevel),
            "completion/complete" => Some(Self::Complete),
            _ => None,
        }
    }

    /// The wire name for this method.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::Ping => "ping",
            Self::ListPrompts => "prompts/list",
            Self::GetPrompt => "prompts/get",
            Self::ListResources => "resources/list",
            Self::ReadResource => "resources/read",
            Self::Subscribe => "resources/subscribe",
            Self::Unsubscribe => "resources/unsubscribe",
            Self::ListTools => "tools/list",
            Self::CallTool => "tools/call",
            Self::SetLogLevel => "logging/setLevel",
            Self::Complete => "completion/complete",
        }
    }

    /// The capability group that must be advertised for this method to be
    /// relayed. `None` means the method is always available: `initialize`
    /// and `ping` are answered by the bridge itself, and completion is
    /// offered unconditionally.
    pub fn capability_group(&self) -> Option<CapabilityGroup> {
        match self {
            Self::Initialize | Self::Ping | Self::Complete => None,
            Self::ListPrompts | Self::GetPrompt => Some(CapabilityGroup::Prompts),
            Self::ListResources | Self::ReadResource | Self::Subscribe | Self::Unsubscribe => {
                Some(CapabilityGroup::Resources)
            }
            Self::ListTools | Self::CallTool => Some(CapabilityGroup::Tools),
            Self::SetLogLevel => Some(CapabilityGroup::Logging),
        }
    }
}

/// Capability groups an upstream peer can advertise during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityGroup {
    Prompts,
    Resources,
    Tools,
    Logging,
}

/// Well-known notification method names.
pub mod notifications {
    /// Sent by the caller once it has accepted the handshake result.
    pub const INITIALIZED: &str = "notifications/initialized";
    /// Progress updates correlated by token to an in-flight request.
    pub const PROGRESS: &str = "notifications/progress";
    /// Upstream log record relayed to the caller.
    pub const MESSAGE: &str = "notifications/message";
    /// A subscribed resource changed.
    pub const RESOURCES_UPDATED: &str = "notifications/resources/updated";
}

/// Progress token a caller attached under `params._meta.progressToken`.
pub fn request_progress_token(params: Option<&Value>) -> Option<Value> {
    params?.get("_meta")?.get("progressToken").cloned()
}

/// Token carried in the body of a `notifications/progress` message.
pub fn progress_notification_token(params: Option<&Value>) -> Option<Value> {
    params?.get("progressToken").cloned()
}
