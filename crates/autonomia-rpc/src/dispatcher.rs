//! Method registry and request dispatch.
//!
//! The dispatcher turns one raw inbound frame into one raw reply. It never
//! touches the network and never lets a malformed request or a failing
//! handler escape as anything other than a JSON-RPC error object.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use crate::protocol::{JSONRPC_VERSION, REQUEST_KEYS, RequestId, Response, RpcError};

/// Serialized fallback used if a reply cannot be serialized.
const INTERNAL_ERROR_REPLY: &str =
    r#"{"jsonrpc":"2.0","error":{"code":-32603,"message":"Internal error"},"id":null}"#;

/// Failure reported by a method handler.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The params did not have the shape the method expects.
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// The method ran and failed.
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Failed(e.to_string())
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(e: std::io::Error) -> Self {
        Self::Failed(e.to_string())
    }
}

pub type HandlerResult = Result<Value, HandlerError>;

/// A registered method. Receives the request's `params` untouched.
pub type MethodHandler = Arc<dyn Fn(Value) -> HandlerResult + Send + Sync>;

/// Anything that can answer a raw inbound frame with a raw reply.
///
/// An empty reply means "nothing to send".
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: &[u8]) -> Vec<u8>;
}

impl<F> MessageHandler for F
where
    F: Fn(&[u8]) -> Vec<u8> + Send + Sync,
{
    fn handle(&self, message: &[u8]) -> Vec<u8> {
        self(message)
    }
}

/// Mapping from method name to handler, built before attaching.
#[derive(Clone, Default)]
pub struct MethodRegistry {
    methods: HashMap<String, MethodHandler>,
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.methods.keys().collect();
        names.sort();
        f.debug_struct("MethodRegistry")
            .field("methods", &names)
            .finish()
    }
}

impl MethodRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to a handler working on raw JSON params.
    ///
    /// A later binding with the same name replaces the earlier one.
    #[must_use]
    pub fn method<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value) -> HandlerResult + Send + Sync + 'static,
    {
        let name = name.into();
        if self.methods.insert(name.clone(), Arc::new(handler)).is_some() {
            warn!("RPC method '{}' registered twice, keeping the last", name);
        }
        self
    }

    /// Bind `name` to a handler with typed params and result.
    ///
    /// Params that fail to deserialize are answered with `Invalid params`.
    #[must_use]
    pub fn typed_method<P, R, F>(self, name: impl Into<String>, handler: F) -> Self
    where
        P: DeserializeOwned,
        R: Serialize,
        F: Fn(P) -> Result<R, HandlerError> + Send + Sync + 'static,
    {
        self.method(name, move |params| {
            let params: P = serde_json::from_value(params)
                .map_err(|e| HandlerError::InvalidParams(e.to_string()))?;
            let result = handler(params)?;
            Ok(serde_json::to_value(result)?)
        })
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&MethodHandler> {
        self.methods.get(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Validates inbound requests and routes them to the registry.
#[derive(Debug, Clone, Default)]
pub struct Dispatcher {
    registry: MethodRegistry,
}

impl Dispatcher {
    #[must_use]
    pub fn new(registry: MethodRegistry) -> Self {
        Self { registry }
    }

    #[must_use]
    pub fn registry(&self) -> &MethodRegistry {
        &self.registry
    }

    /// Answer one raw request with one serialized response.
    #[must_use]
    pub fn handle(&self, raw: &[u8]) -> Vec<u8> {
        let response = self.dispatch(raw);
        serde_json::to_vec(&response).unwrap_or_else(|e| {
            error!("Failed to serialize RPC response: {}", e);
            INTERNAL_ERROR_REPLY.as_bytes().to_vec()
        })
    }

    /// Answer one raw request with a response object.
    #[must_use]
    pub fn dispatch(&self, raw: &[u8]) -> Response {
        let value: Value = match serde_json::from_slice(raw) {
            Ok(v) => v,
            Err(e) => {
                debug!("RPC parse error: {}", e);
                return Response::error(None, RpcError::parse_error());
            }
        };

        let (method, params, id) = match validate(value) {
            Ok(parts) => parts,
            Err(Some(id)) => {
                debug!("Malformed RPC request with id {}", id);
                return Response::error(Some(id), RpcError::invalid_params());
            }
            Err(None) => {
                debug!("Malformed RPC request without usable id");
                return Response::error(None, RpcError::invalid_request());
            }
        };

        let Some(handler) = self.registry.get(&method) else {
            debug!("RPC method not found: {}", method);
            return Response::error(Some(id), RpcError::method_not_found());
        };

        debug!("Dispatching RPC '{}' (id {})", method, id);

        match catch_unwind(AssertUnwindSafe(|| handler(params))) {
            Ok(Ok(result)) => Response::success(id, result),
            Ok(Err(HandlerError::InvalidParams(reason))) => {
                debug!("RPC '{}' rejected params: {}", method, reason);
                Response::error(
                    Some(id),
                    RpcError::invalid_params().with_data(Value::String(reason)),
                )
            }
            Ok(Err(HandlerError::Failed(reason))) => {
                warn!("RPC '{}' failed: {}", method, reason);
                Response::error(
                    Some(id),
                    RpcError::internal_error().with_data(Value::String(reason)),
                )
            }
            Err(_) => {
                error!("RPC handler '{}' panicked", method);
                Response::error(Some(id), RpcError::internal_error())
            }
        }
    }
}

impl MessageHandler for Dispatcher {
    fn handle(&self, message: &[u8]) -> Vec<u8> {
        Dispatcher::handle(self, message)
    }
}

/// Check the four-key request shape.
///
/// On failure returns the id worth echoing, if any.
fn validate(value: Value) -> Result<(String, Value, RequestId), Option<RequestId>> {
    let Value::Object(mut obj) = value else {
        return Err(None);
    };

    let id = obj.get("id").and_then(RequestId::from_value);

    if !has_request_shape(&obj) {
        return Err(id);
    }

    let Some(id) = id else {
        return Err(None);
    };

    let Some(Value::String(method)) = obj.remove("method") else {
        return Err(Some(id));
    };
    let params = obj.remove("params").unwrap_or(Value::Null);

    Ok((method, params, id))
}

fn has_request_shape(obj: &Map<String, Value>) -> bool {
    obj.len() == REQUEST_KEYS.len()
        && REQUEST_KEYS.iter().all(|key| obj.contains_key(*key))
        && obj.get("jsonrpc").and_then(Value::as_str) == Some(JSONRPC_VERSION)
}
