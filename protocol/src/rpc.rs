//! JSON-RPC 2.0 envelope shared by every frame on the wire.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

pub const JSONRPC_VERSION: &str = "2.0";

/// `method not found` per the JSON-RPC spec.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Catch-all code for error objects we could not decode.
pub const INTERNAL_ERROR: i64 = -32603;

/// Outbound request envelope.
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

impl Request {
    #[must_use]
    pub fn new(id: u64, method: &'static str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }

    #[must_use]
    pub fn into_value(self) -> Value {
        let mut frame = json!({
            "jsonrpc": self.jsonrpc,
            "id": self.id,
            "method": self.method,
        });
        if let Some(params) = self.params {
            frame["params"] = params;
        }
        frame
    }
}

/// Outbound notification envelope. No id, no reply.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    jsonrpc: &'static str,
    method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

impl Notification {
    #[must_use]
    pub fn new(method: &'static str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
        }
    }

    #[must_use]
    pub fn into_value(self) -> Value {
        let mut frame = json!({
            "jsonrpc": self.jsonrpc,
            "method": self.method,
        });
        if let Some(params) = self.params {
            frame["params"] = params;
        }
        frame
    }
}

/// Error reply for a server-initiated request this client does not serve.
#[must_use]
pub fn method_not_found(id: &Value, method: &str) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": {
            "code": METHOD_NOT_FOUND,
            "message": format!("method not found: {method}"),
        },
    })
}

/// The `error` member of a JSON-RPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{message} (code {code})")]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    fn undecodable(raw: &Value) -> Self {
        Self {
            code: INTERNAL_ERROR,
            message: raw.to_string(),
            data: None,
        }
    }
}

/// A frame received from the server, classified by shape.
#[derive(Debug)]
pub enum Incoming {
    /// Reply to one of our requests.
    Response {
        id: u64,
        result: Result<Value, ResponseError>,
    },
    /// Server-initiated request that expects a reply.
    Request { id: Value, method: String },
    /// Fire-and-forget notification.
    Notification {
        method: String,
        params: Option<Value>,
    },
}

impl Incoming {
    /// Classifies a decoded frame. Returns `None` when the frame is not a
    /// recognizable JSON-RPC message.
    #[must_use]
    pub fn classify(frame: &Value) -> Option<Self> {
        let obj = frame.as_object()?;
        if let Some(method) = obj.get("method").and_then(Value::as_str) {
            if let Some(id) = obj.get("id") {
                return Some(Self::Request {
                    id: id.clone(),
                    method: method.to_owned(),
                });
            }
            return Some(Self::Notification {
                method: method.to_owned(),
                params: obj.get("params").cloned(),
            });
        }
        // No method: a reply to one of our numeric ids, or noise.
        let id = obj.get("id").and_then(Value::as_u64)?;
        if let Some(raw) = obj.get("error") {
            let error = serde_json::from_value(raw.clone())
                .unwrap_or_else(|_| ResponseError::undecodable(raw));
            return Some(Self::Response {
                id,
                result: Err(error),
            });
        }
        // A missing result (e.g. build/shutdown) decodes as null.
        let result = obj.get("result").cloned().unwrap_or(Value::Null);
        Some(Self::Response {
            id,
            result: Ok(result),
        })
    }
}
