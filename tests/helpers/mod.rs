//! Shared plumbing for integration tests.
//!
//! The caller side of a bridge is always the same two lanes, whether
//! they come from an in-memory pair or a live stream connection;
//! [`CallerEnd`] wraps them with request/receive helpers so the tests
//! read as conversations.

// Each test binary uses its own subset of these helpers.
#![allow(dead_code)]

use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crosswire::config::BridgeConfig;
use crosswire::protocol::envelope::{Envelope, JsonRpcId, JsonRpcRequest, JsonRpcResponse};
use crosswire::transport::{ProcessLaunch, TransportChannels};

/// Generous bound for anything the bridge should do promptly.
pub const WAIT: Duration = Duration::from_secs(5);

/// Launch template for the scripted tool binary.
pub fn mock_tool_launch() -> ProcessLaunch {
    ProcessLaunch::new(env!("CARGO_BIN_EXE_mock_tool"))
}

pub fn fast_config() -> BridgeConfig {
    BridgeConfig {
        init_timeout: Duration::from_secs(5),
        shutdown_grace: Duration::from_secs(2),
        ..BridgeConfig::default()
    }
}

/// The caller's half of a downstream transport.
pub struct CallerEnd {
    pub to_bridge: mpsc::Sender<Envelope>,
    pub from_bridge: mpsc::Receiver<Envelope>,
}

/// In-memory downstream transport: bridge half and caller half.
pub fn downstream_pair(capacity: usize) -> (TransportChannels, CallerEnd) {
    let (bridge_tx, caller_rx) = mpsc::channel(capacity);
    let (caller_tx, bridge_rx) = mpsc::channel(capacity);
    (
        TransportChannels {
            outbound: bridge_tx,
            inbound: bridge_rx,
        },
        CallerEnd {
            to_bridge: caller_tx,
            from_bridge: caller_rx,
        },
    )
}

impl CallerEnd {
    /// Wrap a live transport, e.g. a stream connection into a listening
    /// bridge. The lanes already point the right way.
    pub fn from_transport(channels: TransportChannels) -> Self {
        Self {
            to_bridge: channels.outbound,
            from_bridge: channels.inbound,
        }
    }

    pub async fn request(&self, id: JsonRpcId, method: &str, params: Option<Value>) {
        self.to_bridge
            .send(Envelope::Request(JsonRpcRequest::new(id, method, params)))
            .await
            .expect("bridge hung up");
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) {
        self.to_bridge
            .send(Envelope::Notification(JsonRpcRequest::notification(
                method, params,
            )))
            .await
            .expect("bridge hung up");
    }

    /// Next response, skipping interleaved notifications.
    pub async fn next_response(&mut self) -> JsonRpcResponse {
        loop {
            match self.next_envelope().await {
                Envelope::Response(response) => return response,
                _ => continue,
            }
        }
    }

    /// Next notification, skipping interleaved responses.
    pub async fn next_notification(&mut self) -> JsonRpcRequest {
        loop {
            match self.next_envelope().await {
                Envelope::Notification(notification) => return notification,
                _ => continue,
            }
        }
    }

    pub async fn next_envelope(&mut self) -> Envelope {
        timeout(WAIT, self.from_bridge.recv())
            .await
            .expect("timed out waiting for the bridge")
            .expect("bridge closed the transport")
    }
}
