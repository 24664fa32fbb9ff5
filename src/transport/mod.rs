//! Transport layer: framing on both sides of the bridge.
//!
//! ```text
//! ┌─────────────┐     ┌─────────────────────────────────────┐     ┌─────────────┐
//! │   Caller    │────▶│            Crosswire                │────▶│  Tool Peer  │
//! │ (MCP Host)  │◀────│      [This Transport Layer]         │◀────│ (MCP Server)│
//! └─────────────┘     └─────────────────────────────────────┘     └─────────────┘
//!     stdio lines or               bridge core               child pipes or
//!     SSE + POST                                             SSE + POST
//! ```
//!
//! Every transport speaks the same internal currency: decoded
//! [`Envelope`]s moving through a [`TransportChannels`] pair. The bridge
//! core never touches bytes, sockets, or process handles.
//!
//! | Module | Role |
//! |--------|------|
//! | [`stdio`] | Newline-delimited JSON over pipes: a spawned child's stdio, or our own |
//! | [`sse_client`] | Connecting role: SSE event stream down, HTTP POST up |
//! | [`sse_server`] | Listening role: serves the event stream and the POST endpoint |
//! | [`origin`] | Origin allow-list shared by the HTTP handlers |

pub mod origin;
pub mod sse_client;
pub mod sse_server;
pub mod stdio;

use tokio::sync::mpsc;

use crate::protocol::envelope::Envelope;

/// The two directed lanes a transport exposes to the bridge core.
///
/// `outbound` carries envelopes toward the remote peer, `inbound`
/// carries decoded envelopes from it. Dropping the outbound sender
/// starts transport teardown; the inbound receiver closing means the
/// peer is gone. There is no reconnect: a broken transport ends its
/// session.
#[derive(Debug)]
pub struct TransportChannels {
    pub outbound: mpsc::Sender<Envelope>,
    pub inbound: mpsc::Receiver<Envelope>,
}

// Re-export core types
pub use sse_client::SseClientConfig;
pub use sse_server::StreamServer;
pub use stdio::{PipeChild, ProcessLaunch};
