//! JSON-RPC 2.0 error object structures.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC 2.0 error object.
///
/// Embedded in error responses on both sides of the bridge. The `data`
/// field stays an opaque [`Value`] because upstream peers attach arbitrary
/// payloads there; errors the bridge itself produces carry an [`ErrorData`]
/// serialized into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code (standard JSON-RPC or bridge-specific)
    pub code: i32,

    /// Human-readable error message
    pub message: String,

    /// Additional error data (optional, arbitrary JSON)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Create an error object without additional data.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// Structured error context attached to bridge-originated errors.
///
/// All fields are safe for client consumption (no sensitive data).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    /// Unique identifier for tracing this error in logs
    pub correlation_id: String,

    /// Machine-readable error type name
    pub error_type: String,

    /// Type-specific error details (sanitized)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,

    /// Suggested retry delay in seconds (for retriable errors)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}
