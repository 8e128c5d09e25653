//! JSON-RPC 2.0 protocol types.
//!
//! The server calls methods on the device by sending request objects over the
//! attached connection; the device answers each one with a response object on
//! the same connection.

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

pub const JSONRPC_VERSION: &str = "2.0";
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

/// Keys every inbound request must carry, and nothing else.
pub const REQUEST_KEYS: [&str; 4] = ["jsonrpc", "method", "params", "id"];

/// JSON-RPC 2.0 Request ID.
///
/// Numbers keep their JSON representation so an id echoed back to the
/// server is byte-for-byte the one it sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(Number),
    String(String),
}

impl RequestId {
    /// Extract an id from a raw JSON value; only strings and numbers qualify.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => Some(RequestId::Number(n.clone())),
            Value::String(s) => Some(RequestId::String(s.clone())),
            _ => None,
        }
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        RequestId::Number(n.into())
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n.into())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId::String(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

/// JSON-RPC 2.0 Request as accepted by the device.
///
/// Unlike general JSON-RPC, `params` and `id` are mandatory: the server never
/// sends notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    pub params: Value,
    pub id: RequestId,
}

impl Request {
    #[must_use]
    pub fn new(method: impl Into<String>, params: Value, id: RequestId) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id,
        }
    }
}

/// JSON-RPC 2.0 Response
///
/// `id` serializes as `null` when the request was too broken to carry one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Option<RequestId>,
}

impl Response {
    #[must_use]
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id: Some(id),
        }
    }

    #[must_use]
    pub fn error(id: Option<RequestId>, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

/// JSON-RPC 2.0 Error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    #[must_use]
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    #[must_use]
    pub fn parse_error() -> Self {
        Self::new(PARSE_ERROR, "Parse error")
    }

    #[must_use]
    pub fn invalid_request() -> Self {
        Self::new(INVALID_REQUEST, "Invalid Request")
    }

    #[must_use]
    pub fn method_not_found() -> Self {
        Self::new(METHOD_NOT_FOUND, "Method not found")
    }

    #[must_use]
    pub fn invalid_params() -> Self {
        Self::new(INVALID_PARAMS, "Invalid params")
    }

    #[must_use]
    pub fn internal_error() -> Self {
        Self::new(INTERNAL_ERROR, "Internal error")
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RPC error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_has_exactly_four_keys() {
        let req = Request::new("set_telemetry_period", json!({"period": 5}), 1u64.into());
        let value = serde_json::to_value(&req).unwrap();
        let obj = value.as_object().unwrap();

        assert_eq!(obj.len(), REQUEST_KEYS.len());
        assert!(REQUEST_KEYS.iter().all(|key| obj.contains_key(*key)));
        assert_eq!(value["jsonrpc"], JSONRPC_VERSION);
        assert_eq!(value["id"], 1);
    }

    #[test]
    fn test_success_reply_omits_error() {
        let resp = Response::success("abc".into(), json!({"success": true}));
        assert_eq!(
            serde_json::to_string(&resp).unwrap(),
            r#"{"jsonrpc":"2.0","result":{"success":true},"id":"abc"}"#
        );
    }

    #[test]
    fn test_response_error_with_null_id() {
        let resp = Response::error(None, RpcError::parse_error());
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["id"], Value::Null);
        assert_eq!(value["error"]["code"], PARSE_ERROR);
        assert!(value.get("result").is_none());
    }

    #[test]
    fn test_request_id_literals() {
        assert_eq!(serde_json::to_string(&RequestId::from(7u64)).unwrap(), "7");
        assert_eq!(serde_json::to_string(&RequestId::from(-7i64)).unwrap(), "-7");
        assert_eq!(serde_json::to_string(&RequestId::from("7")).unwrap(), "\"7\"");
    }

    #[test]
    fn test_request_id_keeps_number_representation() {
        for literal in ["7", "-3", "2.5", "1e2", "18446744073709551616"] {
            let value: Value = serde_json::from_str(literal).unwrap();
            let id = RequestId::from_value(&value).unwrap();
            assert_eq!(serde_json::to_string(&id).unwrap(), literal);
        }
    }

    #[test]
    fn test_request_id_from_value_rejects_other_types() {
        assert!(RequestId::from_value(&Value::Null).is_none());
        assert!(RequestId::from_value(&json!(true)).is_none());
        assert!(RequestId::from_value(&json!([1])).is_none());
        assert!(RequestId::from_value(&json!({"id": 1})).is_none());
    }

    #[test]
    fn test_numeric_string_id_stays_quoted() {
        let id = RequestId::from_value(&json!("42")).unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"42\"");
    }

    #[test]
    fn test_standard_error_messages() {
        assert_eq!(RpcError::parse_error().message, "Parse error");
        assert_eq!(RpcError::invalid_request().message, "Invalid Request");
        assert_eq!(RpcError::method_not_found().message, "Method not found");
        assert_eq!(RpcError::invalid_params().message, "Invalid params");
        assert_eq!(RpcError::internal_error().message, "Internal error");
        assert_eq!(RpcError::invalid_params().code, INVALID_PARAMS);
        assert_eq!(RpcError::internal_error().code, INTERNAL_ERROR);
    }

    #[test]
    fn test_rpc_error_with_data() {
        let err = RpcError::internal_error().with_data(json!("disk full"));
        assert_eq!(err.data, Some(json!("disk full")));
        assert!(err.to_string().contains("-32603"));
    }
}
