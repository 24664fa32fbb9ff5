//! JSON-RPC 2.0 envelope types and the line codec.
//!
//! # JSON-RPC 2.0 Compliance
//!
//! - Requests have `id`, `method`, and optional `params`
//! - Notifications are requests without `id`
//! - Responses carry `result` or `error` and echo the request `id`
//! - `id` type (string or integer) MUST be preserved in responses
//!
//! The bridge relays single envelopes only. A top-level JSON array (a
//! batch) is rejected at the framing layer rather than fanned out, so a
//! relayed response always correlates to exactly one pending call.
//!
//! # Security Note
//!
//! This module parses untrusted input. Size limits are enforced at the
//! transport layer before bytes reach the decoder.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::borrow::Cow;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

use crate::error::CrosswireError;
use crate::error::jsonrpc::JsonRpcError;

// ============================================================================
// Fast Correlation ID Generator
// ============================================================================

/// Startup prefix derived from a single Uuid::new_v4() call.
/// The upper 64 bits provide process-level uniqueness.
static CORRELATION_PREFIX: LazyLock<u64> = LazyLock::new(|| {
    let seed = Uuid::new_v4().as_u128();
    (seed >> 64) as u64
});

/// Monotonically increasing counter for the lower 64 bits.
static CORRELATION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a fast correlation ID using a counter-based approach.
///
/// Combines a process-unique prefix (from a single Uuid::new_v4() at
/// startup) with a monotonically increasing counter. This avoids the
/// CSPRNG overhead of Uuid::new_v4() on every relayed message while still
/// producing unique 128-bit IDs.
///
/// The result has correct v4 version and RFC 4122 variant bits set.
pub fn fast_correlation_id() -> Uuid {
    let prefix = *CORRELATION_PREFIX;
    let counter = CORRELATION_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut combined = ((prefix as u128) << 64) | (counter as u128);
    // Set version 4 (bits 48-51 of the 128-bit value)
    combined = (combined & !(0xF_u128 << 76)) | (0x4_u128 << 76);
    // Set variant 1 - RFC 4122 (bits 64-65)
    combined = (combined & !(0x3_u128 << 62)) | (0x2_u128 << 62);
    Uuid::from_u128(combined)
}

// ============================================================================
// Envelope Field Types
// ============================================================================

/// JSON-RPC 2.0 request ID.
///
/// JSON-RPC 2.0 allows string or integer IDs. The exact type is
/// preserved so responses use the same type as requests.
///
/// # Important
///
/// Never coerce between types! If the caller sends `"id": 1`, the response
/// carries `"id": 1`, not `"id": "1"`.
///
/// # Note on Null IDs
///
/// Per JSON-RPC 2.0, `"id": null` is valid (though unusual) and is echoed
/// back in responses. This is distinct from a missing `id` field, which
/// makes the message a notification that gets no response at all.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JsonRpcId {
    /// Integer ID (e.g., `"id": 1`)
    Number(i64),
    /// String ID (e.g., `"id": "abc-123"`)
    String(String),
    /// Explicit null ID (e.g., `"id": null`) - valid but unusual
    Null,
}

impl Serialize for JsonRpcId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            JsonRpcId::Number(n) => serializer.serialize_i64(*n),
            JsonRpcId::String(s) => serializer.serialize_str(s),
            JsonRpcId::Null => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for JsonRpcId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(JsonRpcId::Number(i))
                } else {
                    Err(serde::de::Error::custom(
                        "JSON-RPC ID must be integer, not float",
                    ))
                }
            }
            Value::String(s) => Ok(JsonRpcId::String(s)),
            Value::Null => Ok(JsonRpcId::Null),
            _ => Err(serde::de::Error::custom(
                "JSON-RPC ID must be string, integer, or null",
            )),
        }
    }
}

/// Wrapper to distinguish between missing field and explicit null.
/// - `Absent` - field was not present in JSON
/// - `Null` - field was present with value `null`
/// - `Present(T)` - field was present with a non-null value
#[derive(Debug, Clone, Default)]
enum MaybeNull<T> {
    #[default]
    Absent,
    Null,
    Present(T),
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for MaybeNull<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Deserialize to serde_json::Value first to check for null
        let value = Value::deserialize(deserializer)?;
        if value.is_null() {
            Ok(MaybeNull::Null)
        } else {
            T::deserialize(value)
                .map(MaybeNull::Present)
                .map_err(serde::de::Error::custom)
        }
    }
}

/// Deserializer that converts MaybeNull<JsonRpcId> to Option<JsonRpcId>
/// where explicit null becomes Some(JsonRpcId::Null)
fn deserialize_optional_id<'de, D>(deserializer: D) -> Result<Option<JsonRpcId>, D::Error>
where
    D: Deserializer<'de>,
{
    match MaybeNull::deserialize(deserializer)? {
        MaybeNull::Absent => Ok(None),
        MaybeNull::Null => Ok(Some(JsonRpcId::Null)),
        MaybeNull::Present(id) => Ok(Some(id)),
    }
}

/// JSON-RPC 2.0 version constant.
const JSONRPC_VERSION: &str = "2.0";

// ============================================================================
// Validated Envelope Types
// ============================================================================

/// Validated JSON-RPC 2.0 request or notification.
///
/// Used both for messages decoded off a transport and for calls the
/// bridge originates itself (the handshake, re-numbered relayed calls).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcRequest {
    /// Always "2.0"
    pub jsonrpc: Cow<'static, str>,
    /// Request ID (None for notifications)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<JsonRpcId>,
    /// Method name
    pub method: String,
    /// Method parameters (Arc-wrapped for O(1) clone)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Arc<Value>>,
}

impl JsonRpcRequest {
    /// Create a request with an explicit id.
    pub fn new(id: JsonRpcId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: Cow::Borrowed(JSONRPC_VERSION),
            id: Some(id),
            method: method.into(),
            params: params.map(Arc::new),
        }
    }

    /// Create a notification (no id, no response expected).
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: Cow::Borrowed(JSONRPC_VERSION),
            id: None,
            method: method.into(),
            params: params.map(Arc::new),
        }
    }

    /// Returns true if this is a notification (no ID).
    #[inline]
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC 2.0 response.
///
/// # ID Serialization
///
/// Per JSON-RPC 2.0, the `id` field is REQUIRED in responses and MUST be:
/// - The same as the request's `id` for success/error responses
/// - `null` if the request `id` could not be determined (e.g., parse error)
///
/// The `id` field always serializes: `None` becomes `"id": null` in JSON.
/// This differs from [`JsonRpcRequest`] where `None` means "notification"
/// and the field is omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Always "2.0"
    pub jsonrpc: Cow<'static, str>,
    /// Request ID - always serialized (None becomes null)
    pub id: Option<JsonRpcId>,
    /// Result (mutually exclusive with error)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error (mutually exclusive with result)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Create a success response.
    pub fn success(id: Option<JsonRpcId>, result: Value) -> Self {
        Self {
            jsonrpc: Cow::Borrowed(JSONRPC_VERSION),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response.
    ///
    /// Pass `id: None` if the request ID could not be determined (e.g.,
    /// parse error); that serializes as `"id": null`.
    pub fn error(id: Option<JsonRpcId>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: Cow::Borrowed(JSONRPC_VERSION),
            id,
            result: None,
            error: Some(error),
        }
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Raw wire shape before classification.
///
/// All fields are optional so malformed envelopes produce useful error
/// messages instead of opaque serde failures.
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    /// Must be "2.0"
    jsonrpc: Option<String>,
    /// Absent for notifications, Some(Null) for explicit null
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    id: Option<JsonRpcId>,
    method: Option<String>,
    params: Option<Value>,
    /// MaybeNull because `"result": null` is a valid success response
    #[serde(default)]
    result: MaybeNull<Value>,
    error: Option<JsonRpcError>,
}

/// A single decoded JSON-RPC message, classified by shape.
///
/// Both transports produce and consume this type, so the relay core never
/// touches raw bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Has `method` and an `id`: expects exactly one response.
    Request(JsonRpcRequest),
    /// Has `method` but no `id`: fire-and-forget.
    Notification(JsonRpcRequest),
    /// Has `result` or `error`: answers a prior request.
    Response(JsonRpcResponse),
}

impl Envelope {
    /// Decode and classify one JSON-RPC message.
    ///
    /// # Returns
    ///
    /// * `Err(CrosswireError::ParseError)` - malformed JSON (-32700)
    /// * `Err(CrosswireError::InvalidEnvelope)` - valid JSON that is not a
    ///   single JSON-RPC 2.0 envelope, including batch arrays (-32600)
    pub fn decode(bytes: &[u8]) -> Result<Envelope, CrosswireError> {
        // Peek at the first non-whitespace byte so batch arrays can be
        // refused without parsing the whole payload into a Value.
        let first_byte = bytes
            .iter()
            .find(|b| !b.is_ascii_whitespace())
            .ok_or_else(|| CrosswireError::ParseError {
                details: "empty input".to_string(),
            })?;

        match first_byte {
            b'{' => {
                let raw: RawEnvelope = serde_json::from_slice(bytes).map_err(|e| {
                    // Distinguish syntax errors (bad JSON) from semantic
                    // errors (valid JSON but invalid field values like
                    // float IDs).
                    if e.is_syntax() || e.is_eof() {
                        CrosswireError::ParseError {
                            details: format!("{}", e),
                        }
                    } else {
                        CrosswireError::InvalidEnvelope {
                            details: format!("{}", e),
                        }
                    }
                })?;
                classify(raw)
            }
            b'[' => Err(CrosswireError::InvalidEnvelope {
                details: "batch envelopes are not supported".to_string(),
            }),
            _ => {
                // Attempt parse to get a proper serde error message
                serde_json::from_slice::<Value>(bytes)
                    .map_err(|e| CrosswireError::ParseError {
                        details: format!("{}", e),
                    })
                    .and_then(|_| {
                        Err(CrosswireError::InvalidEnvelope {
                            details: "message must be a single JSON object".to_string(),
                        })
                    })
            }
        }
    }

    /// Serialize to a single line without the trailing newline.
    ///
    /// Serialization of these types cannot realistically fail; if it ever
    /// does, a static internal-error response line is emitted so the peer
    /// is never left with a half-written frame.
    pub fn to_line(&self) -> String {
        let serialized = match self {
            Envelope::Request(r) | Envelope::Notification(r) => serde_json::to_string(r),
            Envelope::Response(r) => serde_json::to_string(r),
        };
        serialized.unwrap_or_else(|_| {
            r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32603,"message":"Internal error"}}"#
                .to_string()
        })
    }

    /// Method name for requests and notifications, None for responses.
    ///
    /// Used in log fields only.
    pub fn method_name(&self) -> Option<&str> {
        match self {
            Envelope::Request(r) | Envelope::Notification(r) => Some(r.method.as_str()),
            Envelope::Response(_) => None,
        }
    }
}

/// Validate a raw envelope and sort it into one of the three shapes.
fn classify(raw: RawEnvelope) -> Result<Envelope, CrosswireError> {
    match raw.jsonrpc.as_deref() {
        Some("2.0") => {}
        Some(v) => {
            return Err(CrosswireError::InvalidEnvelope {
                details: format!("invalid jsonrpc version: expected \"2.0\", got \"{}\"", v),
            });
        }
        None => {
            return Err(CrosswireError::InvalidEnvelope {
                details: "missing required field: jsonrpc".to_string(),
            });
        }
    }

    // A method field wins classification even if result/error are also
    // present; peers that emit such hybrids get treated as callers.
    if let Some(method) = raw.method {
        let request = JsonRpcRequest {
            jsonrpc: Cow::Borrowed(JSONRPC_VERSION),
            id: raw.id,
            method,
            params: raw.params.map(Arc::new),
        };
        return Ok(if request.is_notification() {
            Envelope::Notification(request)
        } else {
            Envelope::Request(request)
        });
    }

    let result = match raw.result {
        MaybeNull::Absent => None,
        // "result": null is a legitimate success payload
        MaybeNull::Null => Some(Value::Null),
        MaybeNull::Present(v) => Some(v),
    };

    if result.is_none() && raw.error.is_none() {
        return Err(CrosswireError::InvalidEnvelope {
            details: "message has no method, result, or error".to_string(),
        });
    }

    Ok(Envelope::Response(JsonRpcResponse {
        jsonrpc: Cow::Borrowed(JSONRPC_VERSION),
        id: raw.id,
        result,
        error: raw.error,
    }))
}
