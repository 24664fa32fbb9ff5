//! Bridge lifecycle: wire a downstream caller to an upstream peer.
//!
//! One [`BridgeRunner`] drives one session from handshake to teardown:
//!
//! ```text
//!   connecting -> initializing -> active -> closing -> closed
//! ```
//!
//! The active phase is a single select loop. Downstream requests fan out
//! into dispatch tasks so a slow call never blocks the next one; each
//! task writes its own response, so completion order on the wire is
//! whatever order upstream answered in. Either side closing, or a
//! shutdown signal, ends the loop; pending calls are drained before the
//! runner reports why it stopped.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::error::CrosswireError;
use crate::protocol::capability::PeerIdentity;
use crate::protocol::envelope::{Envelope, JsonRpcResponse, fast_correlation_id};
use crate::router::{HandlerTable, ProxyRouter};
use crate::session::{Session, UpstreamPeer};
use crate::transport::TransportChannels;

/// Lifecycle phase of one bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Connecting,
    Initializing,
    Active,
    Closing,
    Closed,
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BridgeState::Connecting => "connecting",
            BridgeState::Initializing => "initializing",
            BridgeState::Active => "active",
            BridgeState::Closing => "closing",
            BridgeState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a bridge stopped, when it stopped cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The caller's transport closed.
    DownstreamClosed,
    /// The upstream peer's transport closed.
    UpstreamClosed,
    /// The process is shutting down.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CloseReason::DownstreamClosed => "downstream-closed",
            CloseReason::UpstreamClosed => "upstream-closed",
            CloseReason::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Drives one downstream/upstream pair to completion.
pub struct BridgeRunner {
    config: BridgeConfig,
    state: watch::Sender<BridgeState>,
}

impl BridgeRunner {
    pub fn new(config: BridgeConfig) -> Self {
        let (state, _) = watch::channel(BridgeState::Connecting);
        Self { config, state }
    }

    /// Observe lifecycle transitions.
    pub fn state(&self) -> watch::Receiver<BridgeState> {
        self.state.subscribe()
    }

    /// Run the bridge until either transport closes or shutdown fires.
    ///
    /// Initialization failure is an `Err`; downstream requests that were
    /// already buffered get a service-unavailable answer first so their
    /// callers are not left hanging. A clean stop reports which side
    /// went away.
    pub async fn run(
        self,
        downstream: TransportChannels,
        upstream: TransportChannels,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<CloseReason, CrosswireError> {
        let TransportChannels {
            outbound: down_tx,
            inbound: mut down_rx,
        } = downstream;

        self.state.send_replace(BridgeState::Initializing);
        let init = tokio::select! {
            result = Session::initialize(upstream, PeerIdentity::bridge(), &self.config) => result,
            _ = shutdown.recv() => {
                self.state.send_replace(BridgeState::Closed);
                return Ok(CloseReason::Shutdown);
            }
        };

        let (session, mut upstream_notes) = match init {
            Ok(established) => established,
            Err(e) => {
                warn!(error = %e, "upstream initialization failed");
                refuse_buffered(&mut down_rx, &down_tx).await;
                self.state.send_replace(BridgeState::Closed);
                return Err(e);
            }
        };

        let session = Arc::new(session);
        let router = Arc::new(ProxyRouter::new(
            HandlerTable::from_capabilities(session.capabilities()),
            session.initialize_result().clone(),
            Arc::clone(&session) as Arc<dyn UpstreamPeer>,
        ));

        self.state.send_replace(BridgeState::Active);
        info!(server = %session.server_identity().name, "bridge active");

        let mut dispatch = JoinSet::new();
        let reason = loop {
            tokio::select! {
                maybe = down_rx.recv() => match maybe {
                    Some(Envelope::Request(request)) => {
                        let router = Arc::clone(&router);
                        let down_tx = down_tx.clone();
                        dispatch.spawn(async move {
                            if let Some(response) = router.handle_request(request).await {
                                let _ = down_tx.send(Envelope::Response(response)).await;
                            }
                        });
                    }
                    Some(Envelope::Notification(notification)) => {
                        // Absorbed or dropped; never produces a response
                        let _ = router.handle_request(notification).await;
                    }
                    Some(Envelope::Response(response)) => {
                        debug!(id = ?response.id, "dropping unsolicited response from caller");
                    }
                    None => break CloseReason::DownstreamClosed,
                },
                maybe = upstream_notes.recv() => match maybe {
                    Some(notification) => {
                        if let Some(notification) = router.forward_notification(notification).await {
                            if down_tx
                                .send(Envelope::Notification(notification))
                                .await
                                .is_err()
                            {
                                break CloseReason::DownstreamClosed;
                            }
                        }
                    }
                    None => break CloseReason::UpstreamClosed,
                },
                _ = shutdown.recv() => break CloseReason::Shutdown,
                // Reap finished dispatch tasks as we go
                Some(_) = dispatch.join_next(), if !dispatch.is_empty() => {}
            }
        };

        self.state.send_replace(BridgeState::Closing);
        session.close().await;

        // In-flight dispatch tasks resolve against the drained session;
        // let their answers flush before the downstream sender drops.
        let drain = async {
            while dispatch.join_next().await.is_some() {}
        };
        if tokio::time::timeout(self.config.shutdown_grace, drain)
            .await
            .is_err()
        {
            warn!("dispatch tasks did not finish within the grace period");
            dispatch.abort_all();
        }

        self.state.send_replace(BridgeState::Closed);
        info!(reason = %reason, "bridge closed");
        Ok(reason)
    }
}

/// Answer everything already buffered from downstream after a failed
/// handshake, so those callers see a retriable error instead of silence.
async fn refuse_buffered(
    down_rx: &mut mpsc::Receiver<Envelope>,
    down_tx: &mpsc::Sender<Envelope>,
) {
    while let Ok(envelope) = down_rx.try_recv() {
        let Envelope::Request(request) = envelope else {
            continue;
        };
        let error = CrosswireError::ServiceUnavailable {
            reason: "upstream initialization failed".to_string(),
        };
        let correlation_id = fast_correlation_id();
        let response =
            JsonRpcResponse::error(request.id, error.to_jsonrpc_error(&correlation_id.to_string()));
        if down_tx.send(Envelope::Response(response)).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::envelope::{JsonRpcId, JsonRpcRequest};
    use serde_json::{Value, json};
    use std::time::Duration;
    use tokio::time::timeout;

    fn fast_config() -> BridgeConfig {
        BridgeConfig {
            init_timeout: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(1),
            ..BridgeConfig::default()
        }
    }

    struct PeerEnd {
        to_bridge: mpsc::Sender<Envelope>,
        from_bridge: mpsc::Receiver<Envelope>,
    }

    fn channel_pair() -> (TransportChannels, PeerEnd) {
        let (out_tx, out_rx) = mpsc::channel(8);
        let (in_tx, in_rx) = mpsc::channel(8);
        (
            TransportChannels {
                outbound: out_tx,
                inbound: in_rx,
            },
            PeerEnd {
                to_bridge: in_tx,
                from_bridge: out_rx,
            },
        )
    }

    fn init_result() -> Value {
        json!({
            "protocolVersion": "2024-11-05",
            "capabilities": { "tools": {} },
            "serverInfo": { "name": "scripted-tool", "version": "0.0.0" }
        })
    }

    /// Upstream stub that completes the handshake and echoes tool calls.
    /// Exits when told to, which closes its side of the wire.
    fn spawn_scripted_upstream(mut peer: PeerEnd, exit_on_call: bool) {
        tokio::spawn(async move {
            while let Some(envelope) = peer.from_bridge.recv().await {
                let Envelope::Request(req) = envelope else {
                    continue;
                };
                match req.method.as_str() {
                    "initialize" => {
                        let reply = JsonRpcResponse::success(req.id.clone(), init_result());
                        if peer.to_bridge.send(Envelope::Response(reply)).await.is_err() {
                            return;
                        }
                    }
                    "tools/call" => {
                        if exit_on_call {
                            // Simulates the peer dying mid-call
                            return;
                        }
                        let reply = JsonRpcResponse::success(
                            req.id.clone(),
                            json!({
                                "content": [{
                                    "type": "text",
                                    "text": req.params.as_deref().cloned().unwrap_or(Value::Null),
                                }],
                                "isError": false
                            }),
                        );
                        if peer.to_bridge.send(Envelope::Response(reply)).await.is_err() {
                            return;
                        }
                    }
                    _ => {}
                }
            }
        });
    }

    async fn recv_response(caller: &mut PeerEnd) -> JsonRpcResponse {
        loop {
            let envelope = timeout(Duration::from_secs(2), caller.from_bridge.recv())
                .await
                .expect("timed out waiting for bridge output")
                .expect("bridge closed unexpectedly");
            match envelope {
                Envelope::Response(response) => return response,
                // Skip interleaved notifications
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_bridge_reaches_active_and_relays_calls() {
        let (down_channels, mut caller) = channel_pair();
        let (up_channels, upstream) = channel_pair();
        spawn_scripted_upstream(upstream, false);

        let runner = BridgeRunner::new(fast_config());
        let mut state = runner.state();
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let run = tokio::spawn(runner.run(down_channels, up_channels, shutdown_rx));

        state
            .wait_for(|s| *s == BridgeState::Active)
            .await
            .unwrap();

        // Handshake replay
        caller
            .to_bridge
            .send(Envelope::Request(JsonRpcRequest::new(
                JsonRpcId::String("h1".to_string()),
                "initialize",
                Some(json!({ "protocolVersion": "2024-11-05" })),
            )))
            .await
            .unwrap();
        let response = recv_response(&mut caller).await;
        assert_eq!(response.id, Some(JsonRpcId::String("h1".to_string())));
        assert_eq!(response.result.unwrap()["serverInfo"]["name"], "scripted-tool");

        // Relayed call, caller id preserved
        caller
            .to_bridge
            .send(Envelope::Request(JsonRpcRequest::new(
                JsonRpcId::Number(42),
                "tools/call",
                Some(json!({ "name": "echo", "arguments": { "v": 1 } })),
            )))
            .await
            .unwrap();
        let response = recv_response(&mut caller).await;
        assert_eq!(response.id, Some(JsonRpcId::Number(42)));
        assert_eq!(response.result.unwrap()["isError"], false);

        // Caller leaves; bridge reports it and finishes
        drop(caller);
        let outcome = timeout(Duration::from_secs(2), run).await.unwrap().unwrap();
        assert_eq!(outcome, Ok(CloseReason::DownstreamClosed));
        assert_eq!(*state.borrow(), BridgeState::Closed);
    }

    #[tokio::test]
    async fn test_upstream_exit_resolves_in_flight_call() {
        let (down_channels, mut caller) = channel_pair();
        let (up_channels, upstream) = channel_pair();
        spawn_scripted_upstream(upstream, true);

        let runner = BridgeRunner::new(fast_config());
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let run = tokio::spawn(runner.run(down_channels, up_channels, shutdown_rx));

        caller
            .to_bridge
            .send(Envelope::Request(JsonRpcRequest::new(
                JsonRpcId::Number(1),
                "tools/call",
                Some(json!({ "name": "echo" })),
            )))
            .await
            .unwrap();

        // The peer dies without answering; the call must still resolve,
        // as a tool error result on a tools/call
        let response = recv_response(&mut caller).await;
        assert_eq!(response.id, Some(JsonRpcId::Number(1)));
        let result = response.result.unwrap();
        assert_eq!(result["isError"], true);
        let text = result["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("Connection closed"), "got {:?}", text);

        let outcome = timeout(Duration::from_secs(2), run).await.unwrap().unwrap();
        assert_eq!(outcome, Ok(CloseReason::UpstreamClosed));
    }

    #[tokio::test]
    async fn test_init_failure_refuses_buffered_requests() {
        let (down_channels, mut caller) = channel_pair();
        // Upstream end is parked: initialize never gets an answer
        let (up_channels, _upstream) = channel_pair();

        let config = BridgeConfig {
            init_timeout: Duration::from_millis(200),
            ..fast_config()
        };
        let runner = BridgeRunner::new(config);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let run = tokio::spawn(runner.run(down_channels, up_channels, shutdown_rx));

        // Arrives during the doomed handshake window
        caller
            .to_bridge
            .send(Envelope::Request(JsonRpcRequest::new(
                JsonRpcId::Number(5),
                "tools/list",
                None,
            )))
            .await
            .unwrap();

        let outcome = timeout(Duration::from_secs(2), run).await.unwrap().unwrap();
        assert_eq!(
            outcome,
            Err(CrosswireError::UpstreamTimeout { timeout_secs: 0 })
        );

        let response = recv_response(&mut caller).await;
        assert_eq!(response.id, Some(JsonRpcId::Number(5)));
        let error = response.error.unwrap();
        assert_eq!(error.code, -32013);
        assert_eq!(error.data.unwrap()["retry_after"], 1);
    }

    #[tokio::test]
    async fn test_shutdown_signal_closes_bridge() {
        let (down_channels, mut caller) = channel_pair();
        let (up_channels, upstream) = channel_pair();
        spawn_scripted_upstream(upstream, false);

        let runner = BridgeRunner::new(fast_config());
        let mut state = runner.state();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let run = tokio::spawn(runner.run(down_channels, up_channels, shutdown_rx));

        state
            .wait_for(|s| *s == BridgeState::Active)
            .await
            .unwrap();
        shutdown_tx.send(()).unwrap();

        let outcome = timeout(Duration::from_secs(2), run).await.unwrap().unwrap();
        assert_eq!(outcome, Ok(CloseReason::Shutdown));

        // The bridge's side of the downstream wire is gone
        let next = timeout(Duration::from_secs(1), caller.from_bridge.recv())
            .await
            .unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_unsolicited_caller_response_ignored() {
        let (down_channels, mut caller) = channel_pair();
        let (up_channels, upstream) = channel_pair();
        spawn_scripted_upstream(upstream, false);

        let runner = BridgeRunner::new(fast_config());
        let mut state = runner.state();
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let _run = tokio::spawn(runner.run(down_channels, up_channels, shutdown_rx));
        state
            .wait_for(|s| *s == BridgeState::Active)
            .await
            .unwrap();

        caller
            .to_bridge
            .send(Envelope::Response(JsonRpcResponse::success(
                Some(JsonRpcId::Number(777)),
                json!({}),
            )))
            .await
            .unwrap();

        // Still serving afterwards
        caller
            .to_bridge
            .send(Envelope::Request(JsonRpcRequest::new(
                JsonRpcId::Number(2),
                "ping",
                None,
            )))
            .await
            .unwrap();
        let response = recv_response(&mut caller).await;
        assert_eq!(response.result.unwrap(), json!({}));
    }

    #[tokio::test]
    async fn test_upstream_notification_reaches_caller() {
        let (down_channels, mut caller) = channel_pair();
        let (up_channels, upstream) = channel_pair();
        let injector = upstream.to_bridge.clone();
        spawn_scripted_upstream(upstream, false);

        let runner = BridgeRunner::new(fast_config());
        let mut state = runner.state();
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let _run = tokio::spawn(runner.run(down_channels, up_channels, shutdown_rx));
        state
            .wait_for(|s| *s == BridgeState::Active)
            .await
            .unwrap();

        injector
            .send(Envelope::Notification(JsonRpcRequest::notification(
                "notifications/message",
                Some(json!({ "level": "info", "data": "warmup done" })),
            )))
            .await
            .unwrap();

        let envelope = timeout(Duration::from_secs(2), caller.from_bridge.recv())
            .await
            .unwrap()
            .unwrap();
        let Envelope::Notification(note) = envelope else {
            panic!("expected notification, got {:?}", envelope);
        };
        assert_eq!(note.method, "notifications/message");
        assert_eq!(note.params.as_deref().unwrap()["data"], "warmup done");
    }
}
