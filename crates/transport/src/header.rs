//! Reserved message headers shared by clients and servers.
//!
//! Every header not listed here is request metadata and is passed through
//! untouched.

use serde::{Deserialize, Serialize};

/// Correlates a reply (or stream frame) with the request that opened it
pub const ID: &str = "Waypoint-Id";

/// Logical service the request is addressed to
pub const SERVICE: &str = "Waypoint-Service";

/// Handler name within the service
pub const ENDPOINT: &str = "Waypoint-Endpoint";

/// Encoding of the body
pub const CONTENT_TYPE: &str = "Content-Type";

/// Present with value `"true"` on the message that opens a stream
pub const STREAM: &str = "Waypoint-Stream";

/// Present with value `"true"` when the sender will not send further frames
pub const END: &str = "Waypoint-End";

/// JSON encoded [`ErrorDetail`] when the handler failed
pub const ERROR: &str = "Waypoint-Error";

/// Whether `key` is one of the reserved headers above.
pub fn is_reserved(key: &str) -> bool {
    [ID, SERVICE, ENDPOINT, CONTENT_TYPE, STREAM, END, ERROR]
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(key))
}

/// Application error returned by a remote handler.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ErrorDetail {
    /// Status code chosen by the handler, HTTP-like by convention
    pub code: u16,
    /// Human readable description
    pub detail: String,
}

impl ErrorDetail {
    /// Create a new error detail.
    pub fn new(code: u16, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }

    /// Encode as a header value.
    pub fn to_header(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| format!("{{\"code\":{},\"detail\":\"\"}}", self.code))
    }

    /// Decode a header value, falling back to a generic 500 for malformed input.
    pub fn from_header(value: &str) -> Self {
        serde_json::from_str(value).unwrap_or_else(|_| Self::new(500, value))
    }
}
