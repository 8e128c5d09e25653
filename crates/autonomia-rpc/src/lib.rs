//! Wire framing and JSON-RPC 2.0 dispatch for Autonomia devices.
//!
//! This crate holds everything about the attached connection that does not
//! need a socket: the chunk frame codec and the request dispatcher that
//! answers server-initiated method calls.
//!
//! # Architecture
//!
//! - [`protocol`]: JSON-RPC 2.0 request, response and error types
//! - [`transport`]: Chunk codec for the attached connection
//! - [`dispatcher`]: Method registry and request validation/dispatch
//!
//! # Example
//!
//! ```
//! use autonomia_rpc::{Dispatcher, MethodRegistry};
//! use serde_json::json;
//!
//! let dispatcher = Dispatcher::new(
//!     MethodRegistry::new().method("ping", |_params| Ok(json!("pong"))),
//! );
//!
//! let reply = dispatcher.handle(br#"{"jsonrpc":"2.0","method":"ping","params":{},"id":1}"#);
//! assert_eq!(reply, br#"{"jsonrpc":"2.0","result":"pong","id":1}"#);
//! ```

pub mod dispatcher;
pub mod protocol;
pub mod transport;

// Re-export dispatch types
pub use dispatcher::{
    Dispatcher, HandlerError, HandlerResult, MessageHandler, MethodHandler, MethodRegistry,
};

// Re-export protocol types
pub use protocol::{
    INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, JSONRPC_VERSION, METHOD_NOT_FOUND,
    PARSE_ERROR, Request, RequestId, Response, RpcError,
};

// Re-export transport types
pub use transport::{
    CodecError, Decoded, Frame, FrameCodec, MSG_DATA_EVENT, MSG_HEARTBEAT, ResponseHead,
};
