//! JSON-RPC 2.0 message model.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TransportError};

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    /// Protocol version, always "2.0".
    pub jsonrpc: &'static str,
    /// Unique request identifier.
    pub id: i64,
    /// The method to invoke.
    pub method: String,
    /// Optional parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    /// Create a request with a caller-supplied id.
    pub fn with_id(id: i64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 notification (no response expected).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// The method name.
    pub method: String,
    /// Parameters, if any.
    #[serde(default)]
    pub params: Option<Value>,
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, Deserialize)]
pub struct Response {
    /// Request identifier this response corresponds to.
    pub id: i64,
    /// The result on success.
    #[serde(default)]
    pub result: Option<Value>,
    /// The error on failure.
    #[serde(default)]
    pub error: Option<ErrorObject>,
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Error code.
    pub code: i64,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Any message the server may send us.
#[derive(Debug, Clone)]
pub enum Incoming {
    /// A reply to one of our requests.
    Response(Response),
    /// A server-initiated notification.
    Notification(Notification),
    /// A server-initiated request (id + method).
    Request {
        /// The server's request id, echoed back in our reply.
        id: Value,
        /// The method the server wants us to handle.
        method: String,
    },
}

/// Classify one decoded frame.
///
/// The discriminating fields follow the JSON-RPC rules: a `method` without an
/// `id` is a notification, `method` plus `id` is a server request, and an
/// `id` without a `method` is a response to us.
pub fn parse_incoming(payload: &[u8]) -> Result<Incoming> {
    let value: Value = serde_json::from_slice(payload)?;
    let Some(object) = value.as_object() else {
        return Err(TransportError::Stream("frame is not a json object".into()));
    };

    match (object.contains_key("method"), object.contains_key("id")) {
        (true, false) => Ok(Incoming::Notification(serde_json::from_value(value)?)),
        (true, true) => {
            let id = object.get("id").cloned().unwrap_or(Value::Null);
            let method = object
                .get("method")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            Ok(Incoming::Request { id, method })
        }
        (false, true) => Ok(Incoming::Response(serde_json::from_value(value)?)),
        (false, false) => Err(TransportError::Stream(
            "frame is neither request, response, nor notification".into(),
        )),
    }
}
