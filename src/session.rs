//! Upstream session: handshake state and request correlation.
//!
//! The session owns the upstream half of the bridge. It performs the
//! `initialize` exchange once, remembers the raw result for replay, and
//! correlates every relayed call with its response through a pending-call
//! map keyed by bridge-assigned integer ids.
//!
//! Ids the session puts on the wire are its own monotonic sequence; the
//! caller's original id never leaves the downstream side. That keeps the
//! two id spaces from colliding and makes unknown-response detection
//! trivial.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::error::CrosswireError;
use crate::protocol::capability::{
    CapabilitySet, InitializeParams, InitializeResult, PROTOCOL_VERSION, PeerIdentity,
};
use crate::protocol::envelope::{
    Envelope, JsonRpcId, JsonRpcRequest, JsonRpcResponse, fast_correlation_id,
};
use crate::protocol::method::{ProxyMethod, notifications};
use crate::transport::TransportChannels;

/// The upstream half of a running bridge.
///
/// Cheap to share: all mutable state lives behind an `Arc` internally.
#[derive(Debug)]
pub struct Session {
    shared: Arc<Shared>,
    capabilities: CapabilitySet,
    server_identity: PeerIdentity,
    init_result: Value,
}

/// One relayed call waiting for its upstream response.
#[derive(Debug)]
struct PendingCall {
    responder: oneshot::Sender<JsonRpcResponse>,
    progress_token: Option<Value>,
}

/// Mutable session state behind one lock.
///
/// The outbound sender lives here so that closing the session can drop
/// it, which unwinds the transport's writer task and, for a pipe peer,
/// closes the child's stdin.
#[derive(Debug)]
struct PendingState {
    calls: HashMap<i64, PendingCall>,
    closed: bool,
    outbound: Option<mpsc::Sender<Envelope>>,
}

#[derive(Debug)]
struct Shared {
    pending: Mutex<PendingState>,
    next_id: AtomicI64,
    call_timeout: Option<std::time::Duration>,
}

/// Seam the router dispatches through, mockable in tests.
#[async_trait]
pub trait UpstreamPeer: Send + Sync {
    /// Relay one call and wait for its result value.
    async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        progress_token: Option<Value>,
    ) -> Result<Value, CrosswireError>;

    /// Whether `token` belongs to a call that is still in flight.
    async fn owns_progress_token(&self, token: &Value) -> bool;
}

impl Session {
    /// Perform the `initialize` exchange over freshly opened channels.
    ///
    /// Consumes the transport: responses are routed to pending calls by a
    /// background read task, upstream-originated notifications come back
    /// on the returned receiver, and upstream-originated requests are
    /// answered with method-not-found since the bridge offers its peer no
    /// server surface.
    ///
    /// The whole exchange is bounded by `config.init_timeout`.
    pub async fn initialize(
        channels: TransportChannels,
        client_info: PeerIdentity,
        config: &BridgeConfig,
    ) -> Result<(Session, mpsc::Receiver<JsonRpcRequest>), CrosswireError> {
        let TransportChannels { outbound, inbound } = channels;

        let shared = Arc::new(Shared {
            pending: Mutex::new(PendingState {
                calls: HashMap::new(),
                closed: false,
                outbound: Some(outbound),
            }),
            next_id: AtomicI64::new(1),
            call_timeout: config.call_timeout,
        });

        let (notify_tx, notify_rx) = mpsc::channel(config.channel_capacity);
        tokio::spawn(read_loop(inbound, Arc::clone(&shared), notify_tx));

        let handshake = tokio::time::timeout(config.init_timeout, async {
            let params = serde_json::to_value(InitializeParams::new(client_info))
                .map_err(|e| CrosswireError::InternalError {
                    correlation_id: format!("init-params: {}", e),
                })?;

            let raw = shared
                .call(ProxyMethod::Initialize.as_str(), Some(params), None)
                .await?;

            let parsed: InitializeResult = serde_json::from_value(raw.clone()).map_err(|e| {
                CrosswireError::UpstreamConnectionFailed {
                    reason: format!("malformed initialize result: {}", e),
                }
            })?;

            shared
                .notify(notifications::INITIALIZED, None)
                .await?;

            Ok::<_, CrosswireError>((raw, parsed))
        })
        .await
        .unwrap_or(Err(CrosswireError::UpstreamTimeout {
            timeout_secs: config.init_timeout.as_secs(),
        }));

        let (raw, parsed) = match handshake {
            Ok(ok) => ok,
            Err(e) => {
                shared.close().await;
                return Err(e);
            }
        };

        let server_identity = parsed.server_identity();
        if parsed.protocol_version != PROTOCOL_VERSION {
            // Replayed verbatim either way; the mismatch is the caller's
            // problem to accept or reject.
            warn!(
                offered = %parsed.protocol_version,
                expected = PROTOCOL_VERSION,
                "upstream offered a different protocol revision"
            );
        }
        info!(
            server = %server_identity.name,
            version = %server_identity.version,
            "upstream session established"
        );

        Ok((
            Session {
                shared,
                capabilities: parsed.capabilities,
                server_identity,
                init_result: raw,
            },
            notify_rx,
        ))
    }

    /// Capability groups the upstream advertised.
    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    /// Upstream's self-reported identity.
    pub fn server_identity(&self) -> &PeerIdentity {
        &self.server_identity
    }

    /// The raw `initialize` result, replayed to downstream handshakes.
    pub fn initialize_result(&self) -> &Value {
        &self.init_result
    }

    /// Stop accepting calls and drain everything pending.
    ///
    /// Every waiting caller resolves with a closed-connection error in
    /// the same scheduling tick. Idempotent.
    pub async fn close(&self) {
        self.shared.close().await;
    }
}

#[async_trait]
impl UpstreamPeer for Session {
    async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        progress_token: Option<Value>,
    ) -> Result<Value, CrosswireError> {
        self.shared.call(method, params, progress_token).await
    }

    async fn owns_progress_token(&self, token: &Value) -> bool {
        self.shared.owns_progress_token(token).await
    }
}

impl Shared {
    /// Send one envelope, failing fast once the session has closed.
    async fn send(&self, envelope: Envelope) -> Result<(), CrosswireError> {
        let sender = {
            let pending = self.pending.lock().await;
            match &pending.outbound {
                Some(sender) => sender.clone(),
                None => return Err(CrosswireError::ConnectionClosed),
            }
        };
        sender
            .send(envelope)
            .await
            .map_err(|_| CrosswireError::ConnectionClosed)
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), CrosswireError> {
        self.send(Envelope::Notification(JsonRpcRequest::notification(
            method, params,
        )))
        .await
    }

    /// Relay one call: assign a fresh id, park a responder, send, wait.
    async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        progress_token: Option<Value>,
    ) -> Result<Value, CrosswireError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (responder, receiver) = oneshot::channel();

        {
            let mut pending = self.pending.lock().await;
            if pending.closed {
                return Err(CrosswireError::ConnectionClosed);
            }
            pending.calls.insert(
                id,
                PendingCall {
                    responder,
                    progress_token,
                },
            );
        }

        let request = Envelope::Request(JsonRpcRequest::new(
            JsonRpcId::Number(id),
            method,
            params,
        ));
        if let Err(e) = self.send(request).await {
            self.pending.lock().await.calls.remove(&id);
            return Err(e);
        }

        let received = match self.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, receiver).await {
                Ok(received) => received,
                Err(_) => {
                    self.pending.lock().await.calls.remove(&id);
                    return Err(CrosswireError::UpstreamTimeout {
                        timeout_secs: limit.as_secs(),
                    });
                }
            },
            None => receiver.await,
        };

        // A dropped responder means the pending map was drained
        let response = received.map_err(|_| CrosswireError::ConnectionClosed)?;

        if let Some(error) = response.error {
            return Err(CrosswireError::UpstreamError {
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Hand a response to whoever is waiting on its id.
    async fn resolve(&self, response: JsonRpcResponse) {
        let id = match &response.id {
            Some(JsonRpcId::Number(n)) => *n,
            other => {
                warn!(id = ?other, "dropping response with unusable id");
                return;
            }
        };
        let call = self.pending.lock().await.calls.remove(&id);
        match call {
            // The receiver may have timed out and gone away; that is fine
            Some(call) => {
                let _ = call.responder.send(response);
            }
            None => warn!(id, "dropping response with no pending call"),
        }
    }

    async fn owns_progress_token(&self, token: &Value) -> bool {
        self.pending
            .lock()
            .await
            .calls
            .values()
            .any(|call| call.progress_token.as_ref() == Some(token))
    }

    async fn close(&self) {
        let mut pending = self.pending.lock().await;
        pending.closed = true;
        pending.outbound = None;
        // Dropping the responders wakes every waiting caller with a
        // closed-connection error.
        pending.calls.clear();
    }
}

/// Background task: route everything the upstream sends.
async fn read_loop(
    mut inbound: mpsc::Receiver<Envelope>,
    shared: Arc<Shared>,
    notifications_tx: mpsc::Sender<JsonRpcRequest>,
) {
    while let Some(envelope) = inbound.recv().await {
        match envelope {
            Envelope::Response(response) => shared.resolve(response).await,
            Envelope::Notification(notification) => {
                if notifications_tx.send(notification).await.is_err() {
                    break;
                }
            }
            Envelope::Request(request) => {
                // The bridge offers its upstream no server surface
                let error = CrosswireError::MethodNotFound {
                    method: request.method.clone(),
                };
                let correlation = fast_correlation_id();
                let response = JsonRpcResponse::error(
                    request.id,
                    error.to_jsonrpc_error(&correlation.to_string()),
                );
                if shared.send(Envelope::Response(response)).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!("upstream inbound closed");
    shared.close().await;
}
