//! Crosswire - Transport bridge for MCP JSON-RPC traffic.
//!
//! This library relays Model Context Protocol sessions between a pipe
//! transport (a spawned tool process, or our own stdio) and a stream
//! transport (HTTP: SSE events down, POST messages up), preserving
//! JSON-RPC 2.0 semantics end to end.
//!
//! # Bridge Modes
//!
//! - **Connecting:** local stdio caller, remote stream peer. The bridge
//!   dials `GET /sse`, learns its POST endpoint from the first event,
//!   and relays its own stdin/stdout.
//! - **Listening:** stream callers, local pipe peer. The bridge serves
//!   the SSE endpoint and spawns one tool process per accepted stream.
//!
//! # Relay Rules
//!
//! - The upstream handshake happens once; later `initialize` requests
//!   are answered from the stored result.
//! - Methods outside the advertised capability groups are rejected
//!   without touching upstream.
//! - Caller ids never cross the bridge; correlation uses a private id
//!   sequence on the upstream side.
//! - A broken transport ends its session. There is no reconnect.

pub mod config;
pub mod error;
pub mod protocol;
pub mod router;
pub mod runner;
pub mod session;
pub mod transport;
