//! Method dispatch for downstream traffic.
//!
//! Every decoded downstream envelope lands here. Requests are answered
//! locally, relayed, or rejected; notifications are absorbed or dropped.
//! Upstream notifications pass through the router on their way down so
//! stale progress updates can be filtered out.
//!
//! # Dispatch Table
//!
//! | Method | Handling |
//! |--------|----------|
//! | `initialize` | Answered locally from the stored handshake result |
//! | `ping` | Answered locally with an empty object |
//! | `prompts/list`, `prompts/get` | Relayed if `prompts` was advertised |
//! | `resources/list`, `resources/read` | Relayed if `resources` was advertised |
//! | `resources/subscribe`, `resources/unsubscribe` | Relayed if `resources` was advertised |
//! | `tools/list`, `tools/call` | Relayed if `tools` was advertised |
//! | `logging/setLevel` | Relayed if `logging` was advertised |
//! | `completion/complete` | Relayed unconditionally |
//! | anything else | Rejected with method-not-found |
//!
//! Relayed methods whose capability gate is closed are rejected exactly
//! like unknown ones; the caller cannot tell the difference and should
//! consult the handshake result it was given.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::CrosswireError;
use crate::protocol::capability::CapabilitySet;
use crate::protocol::envelope::{JsonRpcId, JsonRpcRequest, JsonRpcResponse, fast_correlation_id};
use crate::protocol::method::{
    ProxyMethod, notifications, progress_notification_token, request_progress_token,
};
use crate::session::UpstreamPeer;

/// The set of relayable methods left open by the upstream's capabilities.
///
/// Built once per session from the handshake result. `initialize` and
/// `ping` are never in the table; the bridge answers those itself.
#[derive(Debug, Clone)]
pub struct HandlerTable {
    enabled: HashSet<ProxyMethod>,
}

impl HandlerTable {
    pub fn from_capabilities(capabilities: &CapabilitySet) -> Self {
        let mut enabled = HashSet::new();
        for method in ProxyMethod::ALL {
            match method.capability_group() {
                Some(group) => {
                    if capabilities.has(group) {
                        enabled.insert(method);
                    }
                }
                None => {
                    if !matches!(method, ProxyMethod::Initialize | ProxyMethod::Ping) {
                        enabled.insert(method);
                    }
                }
            }
        }
        Self { enabled }
    }

    pub fn allows(&self, method: ProxyMethod) -> bool {
        self.enabled.contains(&method)
    }
}

/// Stateless-per-request dispatcher for one established session.
pub struct ProxyRouter {
    table: HandlerTable,
    init_result: Value,
    upstream: Arc<dyn UpstreamPeer>,
}

impl ProxyRouter {
    pub fn new(table: HandlerTable, init_result: Value, upstream: Arc<dyn UpstreamPeer>) -> Self {
        Self {
            table,
            init_result,
            upstream,
        }
    }

    /// Handle one downstream envelope.
    ///
    /// Returns the response to write back, or `None` for notifications,
    /// which never produce one.
    pub async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        if request.is_notification() {
            self.absorb_notification(request);
            return None;
        }
        let id = request.id.clone();

        let method = match ProxyMethod::from_wire(&request.method) {
            Some(method) => method,
            None => {
                debug!(method = %request.method, "rejecting unknown method");
                return Some(self.reject(id, CrosswireError::MethodNotFound {
                    method: request.method,
                }));
            }
        };

        match method {
            // The handshake is replayed verbatim, however many callers ask
            ProxyMethod::Initialize => {
                return Some(JsonRpcResponse::success(id, self.init_result.clone()));
            }
            ProxyMethod::Ping => {
                return Some(JsonRpcResponse::success(id, json!({})));
            }
            _ => {}
        }

        if !self.table.allows(method) {
            debug!(method = %request.method, "rejecting method outside advertised capabilities");
            return Some(self.reject(id, CrosswireError::MethodNotFound {
                method: request.method,
            }));
        }

        let params = request.params.as_deref().cloned();
        let progress_token = request_progress_token(params.as_ref());
        match self.upstream.call(method.as_str(), params, progress_token).await {
            Ok(result) => Some(JsonRpcResponse::success(id, result)),
            Err(e) if method == ProxyMethod::CallTool => {
                // Tool failures are results, not protocol errors: the
                // caller's loop should see them the way the tool contract
                // defines, with the connection still usable.
                debug!(error = %e, "tool call failed, converting to error result");
                Some(JsonRpcResponse::success(id, error_tool_result(&e.to_string())))
            }
            Err(e) => Some(self.reject(id, e)),
        }
    }

    /// Vet one upstream notification before it goes downstream.
    ///
    /// Progress updates must name a token that still belongs to an
    /// in-flight call; everything else is forwarded verbatim.
    pub async fn forward_notification(
        &self,
        notification: JsonRpcRequest,
    ) -> Option<JsonRpcRequest> {
        if notification.method != notifications::PROGRESS {
            return Some(notification);
        }
        let token = match progress_notification_token(notification.params.as_deref()) {
            Some(token) => token,
            None => {
                warn!("dropping progress notification without a token");
                return None;
            }
        };
        if !self.upstream.owns_progress_token(&token).await {
            warn!(token = %token, "dropping progress notification for no in-flight call");
            return None;
        }
        Some(notification)
    }

    fn absorb_notification(&self, notification: JsonRpcRequest) {
        if notification.method == notifications::INITIALIZED {
            debug!("caller confirmed handshake");
        } else {
            debug!(method = %notification.method, "dropping downstream notification");
        }
    }

    fn reject(&self, id: Option<JsonRpcId>, error: CrosswireError) -> JsonRpcResponse {
        let correlation_id = fast_correlation_id();
        JsonRpcResponse::error(id, error.to_jsonrpc_error(&correlation_id.to_string()))
    }
}

/// Shape a relay failure as a tool result with `isError` set.
fn error_tool_result(message: &str) -> Value {
    json!({
        "content": [{ "type": "text", "text": message }],
        "isError": true
    })
}
