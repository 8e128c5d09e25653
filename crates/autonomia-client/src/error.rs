//! Error types for the Autonomia client.

use autonomia_rpc::CodecError;

/// Coarse error taxonomy reported to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    Ok = 0,
    Timeout = 1,
    NetworkError = 2,
    ProtocolError = 3,
    AuthorizationError = 4,
    WrongParameters = 5,
    InternalError = 9,
}

impl ErrorCode {
    #[must_use]
    pub fn text(self) -> &'static str {
        match self {
            ErrorCode::Ok => "ok",
            ErrorCode::Timeout => "timeout",
            ErrorCode::NetworkError => "network error",
            ErrorCode::ProtocolError => "protocol error",
            ErrorCode::AuthorizationError => "authorization error",
            ErrorCode::WrongParameters => "wrong parameters",
            ErrorCode::InternalError => "internal error",
        }
    }

    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ErrorCode::Ok),
            1 => Some(ErrorCode::Timeout),
            2 => Some(ErrorCode::NetworkError),
            3 => Some(ErrorCode::ProtocolError),
            4 => Some(ErrorCode::AuthorizationError),
            5 => Some(ErrorCode::WrongParameters),
            9 => Some(ErrorCode::InternalError),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.text())
    }
}

/// Errors surfaced by the client
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),

    #[error("Timed out while {0}")]
    Timeout(&'static str),

    #[error("Connection closed during handshake")]
    ConnectionClosed,

    #[error("Attach rejected with HTTP {0}")]
    Unauthorized(u16),

    #[error("Unexpected HTTP status {status} {reason}")]
    HttpStatus { status: u16, reason: String },

    #[error("Unexpected attach reply: {0}")]
    UnexpectedReply(String),

    #[error("Device is reattaching")]
    Reattaching,

    #[error("Device is not attached")]
    NotAttached,

    #[error("Device is already attached")]
    AlreadyAttached,

    #[error("Session closed")]
    Closed,

    #[error("Video error: {0}")]
    Video(#[from] crate::video::VideoError),
}

impl ClientError {
    /// Map this error onto the caller-facing taxonomy.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            ClientError::Timeout(_) => ErrorCode::Timeout,
            ClientError::Io(_)
            | ClientError::Codec(CodecError::Io(_))
            | ClientError::ConnectionClosed
            | ClientError::Reattaching
            | ClientError::NotAttached => ErrorCode::NetworkError,
            ClientError::Codec(_) | ClientError::HttpStatus { .. } => ErrorCode::ProtocolError,
            ClientError::Unauthorized(_) => ErrorCode::AuthorizationError,
            ClientError::Config(_)
            | ClientError::InvalidServerName(_)
            | ClientError::UnexpectedReply(_)
            | ClientError::AlreadyAttached => ErrorCode::WrongParameters,
            ClientError::Json(_) | ClientError::Closed | ClientError::Video(_) => {
                ErrorCode::InternalError
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
