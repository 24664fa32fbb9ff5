//! Error handling for the bridge.
//!
//! This module defines all error types that can occur while relaying
//! traffic and provides JSON-RPC 2.0 compliant error formatting.
//!
//! ## Module Organization
//!
//! - `jsonrpc` - JSON-RPC 2.0 error object structures
//! - `CrosswireError` - bridge error types with wire-code mapping

pub mod jsonrpc;

use jsonrpc::{ErrorData, JsonRpcError};
use thiserror::Error;

/// All error types that can occur in the bridge.
///
/// Each variant maps to a specific JSON-RPC error code and provides
/// structured error information for clients.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CrosswireError {
    // Protocol errors
    /// Input was not valid JSON.
    #[error("Invalid JSON: {details}")]
    ParseError {
        /// Description of the parse error
        details: String,
    },

    /// Input parsed as JSON but is not a valid JSON-RPC 2.0 envelope.
    ///
    /// Covers missing or wrong `jsonrpc` version, float or boolean ids,
    /// and top-level batch arrays, which the bridge does not relay.
    #[error("Invalid JSON-RPC envelope: {details}")]
    InvalidEnvelope {
        /// Description of what makes the envelope invalid
        details: String,
    },

    /// The requested method is not offered by this session.
    #[error("Method '{method}' not found")]
    MethodNotFound {
        /// The method name that was not found
        method: String,
    },

    /// The method parameters are invalid.
    #[error("Invalid parameters: {details}")]
    InvalidParams {
        /// Description of the parameter validation failure
        details: String,
    },

    // Upstream errors
    /// Cannot establish the connection to the upstream peer.
    #[error("Cannot connect to upstream peer")]
    UpstreamConnectionFailed {
        /// Reason for the connection failure (not exposed on the wire)
        reason: String,
    },

    /// The child process for the pipe transport could not be started.
    #[error("Failed to spawn '{command}'")]
    SpawnFailed {
        /// The command that failed to start
        command: String,
        /// The OS-level failure reason
        reason: String,
    },

    /// Upstream peer did not respond in time.
    #[error("Upstream peer did not respond in time")]
    UpstreamTimeout {
        /// The timeout duration in seconds
        timeout_secs: u64,
    },

    /// Upstream peer answered a relayed call with a JSON-RPC error.
    #[error("Upstream error: {message}")]
    UpstreamError {
        /// The error code from upstream
        code: i32,
        /// The error message from upstream
        message: String,
    },

    /// The session closed before a response arrived.
    ///
    /// Produced when pending calls are drained during teardown, or when a
    /// send races with a transport that has already shut down.
    #[error("Connection closed before a response arrived")]
    ConnectionClosed,

    // Operational errors
    /// The bridge is not ready to relay requests yet.
    #[error("Bridge is not ready")]
    ServiceUnavailable {
        /// Reason for unavailability
        reason: String,
    },

    /// Invalid startup configuration.
    #[error("Invalid configuration: {details}")]
    ConfigError {
        /// Description of the configuration problem
        details: String,
    },

    /// Internal error that should not happen.
    #[error("Internal error. Reference: {correlation_id}")]
    InternalError {
        /// Correlation ID for debugging
        correlation_id: String,
    },
}

impl CrosswireError {
    /// Maps error to JSON-RPC 2.0 error code.
    ///
    /// Standard JSON-RPC codes (-32700 to -32603) are used for protocol
    /// errors. Bridge-specific codes sit in the -32000 to -32099 range.
    pub fn to_jsonrpc_code(&self) -> i32 {
        match self {
            // Standard JSON-RPC codes
            Self::ParseError { .. } => -32700,
            Self::InvalidEnvelope { .. } => -32600,
            Self::MethodNotFound { .. } => -32601,
            Self::InvalidParams { .. } => -32602,
            Self::InternalError { .. } => -32603,
            Self::ConfigError { .. } => -32603,

            // Bridge-specific codes
            Self::UpstreamConnectionFailed { .. } => -32000,
            Self::SpawnFailed { .. } => -32000,
            Self::UpstreamTimeout { .. } => -32001,
            Self::UpstreamError { .. } => -32002,
            Self::ConnectionClosed => -32003,
            Self::ServiceUnavailable { .. } => -32013,
        }
    }

    /// Returns the error type name for logging.
    pub fn error_type_name(&self) -> &'static str {
        match self {
            Self::ParseError { .. } => "parse_error",
            Self::InvalidEnvelope { .. } => "invalid_envelope",
            Self::MethodNotFound { .. } => "method_not_found",
            Self::InvalidParams { .. } => "invalid_params",
            Self::UpstreamConnectionFailed { .. } => "upstream_connection_failed",
            Self::SpawnFailed { .. } => "spawn_failed",
            Self::UpstreamTimeout { .. } => "upstream_timeout",
            Self::UpstreamError { .. } => "upstream_error",
            Self::ConnectionClosed => "connection_closed",
            Self::ServiceUnavailable { .. } => "service_unavailable",
            Self::ConfigError { .. } => "config_error",
            Self::InternalError { .. } => "internal_error",
        }
    }

    /// Returns retry-after hint for retriable errors.
    ///
    /// Requests rejected while the upstream handshake is still running can
    /// be retried as soon as the session settles.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::ServiceUnavailable { .. } => Some(1),
            _ => None,
        }
    }

    /// Returns safe details for client consumption (no sensitive data).
    ///
    /// Connection and spawn failure reasons stay out of the wire payload
    /// because they can carry URLs, header names, or local paths. They are
    /// still logged with full detail on the bridge side.
    pub fn safe_details(&self) -> Option<serde_json::Value> {
        match self {
            Self::MethodNotFound { method } => Some(serde_json::json!({ "method": method })),
            Self::UpstreamTimeout { timeout_secs } => {
                Some(serde_json::json!({ "timeout_secs": timeout_secs }))
            }
            Self::UpstreamError { code, .. } => {
                // Don't expose the upstream message twice; the code is
                // enough for the caller to branch on.
                Some(serde_json::json!({ "upstream_code": code }))
            }
            _ => None,
        }
    }

    /// Converts error to a JSON-RPC error object.
    pub fn to_jsonrpc_error(&self, correlation_id: &str) -> JsonRpcError {
        JsonRpcError {
            code: self.to_jsonrpc_code(),
            message: self.to_string(),
            data: serde_json::to_value(ErrorData {
                correlation_id: correlation_id.to_string(),
                error_type: self.error_type_name().to_string(),
                details: self.safe_details(),
                retry_after: self.retry_after(),
            })
            .ok(),
        }
    }
}
