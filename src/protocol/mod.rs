//! Wire protocol layer.
//!
//! Everything both transports share: the JSON-RPC 2.0 envelope codec, the
//! method catalog the bridge relays, and the handshake capability types.
//!
//! # Message Flow
//!
//! ```text
//! ┌─────────────┐     ┌─────────────────────────────────────┐     ┌─────────────┐
//! │   Caller    │────▶│            crosswire                │────▶│  Tool Peer  │
//! │ (SSE/stdio) │◀────│   [Envelope codec + method table]   │◀────│ (stdio/SSE) │
//! └─────────────┘     └─────────────────────────────────────┘     └─────────────┘
//! ```
//!
//! A decoded [`envelope::Envelope`] is the only shape the relay core ever
//! sees; transports deal with bytes, everything above deals with envelopes.

pub mod capability;
pub mod envelope;
pub mod method;

// Re-export core types
pub use capability::{CapabilitySet, InitializeParams, InitializeResult, PeerIdentity};
pub use envelope::{Envelope, JsonRpcId, JsonRpcRequest, JsonRpcResponse, fast_correlation_id};
pub use method::{CapabilityGroup, ProxyMethod};
