//! JSON-RPC 2.0 message types and newline framing.
//!
//! Both sides of patchbay speak the same wire: the upstream client session on
//! our stdin/stdout, and every downstream server over its child stdio or an
//! HTTP body. One JSON object per line; notifications carry no id and get no
//! response.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// MCP protocol revision patchbay speaks on both surfaces.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    /// Absent for notifications.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: u64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(Value::from(id)),
            method: method.to_string(),
            params: Some(params),
        }
    }

    pub fn notification(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.to_string(),
            params: Some(params),
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(code: i64, message: impl Into<String>, data: Value) -> Self {
        Self {
            code,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("method not found: {}", method))
    }

    pub fn parse_error() -> Self {
        Self::new(PARSE_ERROR, "parse error")
    }
}

/// A frame read off the wire: either side may send requests, responses,
/// or notifications over the same stream.
#[derive(Debug)]
pub enum Incoming {
    Request(Request),
    Response(Response),
}

/// Classify one line of the wire. `result`/`error` presence marks a response;
/// a `method` marks a request or notification.
pub fn parse_line(line: &str) -> Result<Incoming, RpcError> {
    let value: Value =
        serde_json::from_str(line).map_err(|_| RpcError::parse_error())?;
    if value.get("method").is_some() {
        let req: Request = serde_json::from_value(value)
            .map_err(|e| RpcError::new(INVALID_REQUEST, format!("invalid request: {}", e)))?;
        Ok(Incoming::Request(req))
    } else if value.get("result").is_some() || value.get("error").is_some() {
        let resp: Response = serde_json::from_value(value)
            .map_err(|e| RpcError::new(INVALID_REQUEST, format!("invalid response: {}", e)))?;
        Ok(Incoming::Response(resp))
    } else {
        Err(RpcError::new(INVALID_REQUEST, "neither request nor response"))
    }
}

/// Serialise a message to its single-line wire form (no trailing newline).
pub fn to_line<T: Serialize>(msg: &T) -> String {
    // serde_json cannot fail on these in-memory types
    serde_json::to_string(msg).unwrap_or_else(|_| String::from("{}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_roundtrip() {
        let req = Request::new(7, "tools/list", json!({}));
        let line = to_line(&req);
        match parse_line(&line).unwrap() {
            Incoming::Request(parsed) => {
                assert_eq!(parsed.method, "tools/list");
                assert_eq!(parsed.id, Some(json!(7)));
                assert!(!parsed.is_notification());
            }
            Incoming::Response(_) => panic!("expected request"),
        }
    }

    #[test]
    fn notification_has_no_id() {
        let note = Request::notification("notifications/initialized", json!({}));
        assert!(note.is_notification());
        let line = to_line(&note);
        assert!(!line.contains("\"id\""));
    }

    #[test]
    fn response_classified_by_result_field() {
        let line = r#"{"jsonrpc":"2.0","id":3,"result":{"ok":true}}"#;
        match parse_line(line).unwrap() {
            Incoming::Response(resp) => {
                assert_eq!(resp.id, json!(3));
                assert!(resp.error.is_none());
            }
            Incoming::Request(_) => panic!("expected response"),
        }
    }

    #[test]
    fn error_response_classified() {
        let line = r#"{"jsonrpc":"2.0","id":4,"error":{"code":-32601,"message":"nope"}}"#;
        match parse_line(line).unwrap() {
            Incoming::Response(resp) => {
                assert_eq!(resp.error.unwrap().code, METHOD_NOT_FOUND);
            }
            Incoming::Request(_) => panic!("expected response"),
        }
    }

    #[test]
    fn garbage_is_parse_error() {
        let err = parse_line("{not json").unwrap_err();
        assert_eq!(err.code, PARSE_ERROR);
    }

    #[test]
    fn missing_method_and_result_rejected() {
        let err = parse_line(r#"{"jsonrpc":"2.0","id":1}"#).unwrap_err();
        assert_eq!(err.code, INVALID_REQUEST);
    }
}
