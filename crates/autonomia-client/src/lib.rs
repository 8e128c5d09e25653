//! Device-side client for the Autonomia cloud service.
//!
//! A device attaches once over HTTP and then keeps that connection open as a
//! bidirectional chunked stream: heartbeats and data events go up, JSON-RPC
//! requests come down and are answered in-band. Lost connections are
//! reattached automatically.
//!
//! # Architecture
//!
//! - [`config`]: Connection settings, loadable from JSON
//! - [`connection`]: TCP/TLS socket setup
//! - [`handshake`]: The attach request and reply
//! - [`session`]: Heartbeat and receive tasks, write lock, reattachment
//! - [`client`]: The public facade
//! - [`video`]: Video streaming collaborator
//! - [`error`]: Error types and the caller-facing error codes

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod session;
pub mod video;

pub use client::AutonomiaClient;
pub use config::{ClientConfig, VideoConfig};
pub use error::{ClientError, ErrorCode, Result};
pub use handshake::{DeviceIdentity, HandshakeReply};
pub use session::{AttachReply, Session, SessionState};
pub use video::{CommandStreamer, StreamHandle, VideoError, VideoStreamer, stream_key};
