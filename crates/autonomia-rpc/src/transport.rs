//! Chunk framing for the attached connection.
//!
//! After the attach handshake the connection stays open as one long HTTP
//! chunked body in each direction. Every frame is a single chunk:
//!
//! ```text
//! +---------------+------+-----------------+------+
//! | hex(len)      | CRLF | payload         | CRLF |
//! +---------------+------+-----------------+------+
//! ```
//!
//! Frames sent by the device prefix their payload with a one byte tag
//! (heartbeat or data event) that counts towards `len`. Replies to server
//! requests carry the raw JSON with no tag.
//!
//! The decoder first consumes the HTTP response head of the attach reply and
//! then yields one chunk body per frame, tolerating frames split across reads
//! and several frames in one read.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Tag byte of a heartbeat frame.
pub const MSG_HEARTBEAT: u8 = 0x06;

/// Tag byte of a data event frame.
pub const MSG_DATA_EVENT: u8 = 0x07;

/// Maximum chunk payload size (16 MB)
const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Maximum size of the HTTP response head
const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Maximum length of a chunk size line, extensions included
const MAX_SIZE_LINE: usize = 1024;

const CRLF: &[u8] = b"\r\n";

/// One outbound unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Keepalive, tag only.
    Heartbeat,
    /// Client-initiated application message.
    DataEvent(Bytes),
    /// Answer to an inbound RPC request, sent untagged.
    RpcReply(Bytes),
}

impl Frame {
    #[must_use]
    pub fn data_event(payload: impl Into<Bytes>) -> Self {
        Frame::DataEvent(payload.into())
    }

    #[must_use]
    pub fn rpc_reply(payload: impl Into<Bytes>) -> Self {
        Frame::RpcReply(payload.into())
    }

    fn tag(&self) -> Option<u8> {
        match self {
            Frame::Heartbeat => Some(MSG_HEARTBEAT),
            Frame::DataEvent(_) => Some(MSG_DATA_EVENT),
            Frame::RpcReply(_) => None,
        }
    }

    fn body(&self) -> &[u8] {
        match self {
            Frame::Heartbeat => &[],
            Frame::DataEvent(b) | Frame::RpcReply(b) => b,
        }
    }

    /// Number of bytes announced in the chunk size line.
    #[must_use]
    pub fn wire_len(&self) -> usize {
        self.body().len() + usize::from(self.tag().is_some())
    }

    /// Encode this frame into a standalone buffer.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::ChunkTooLarge` if the payload exceeds the chunk limit.
    pub fn to_bytes(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        FrameCodec::chunks_only().encode(self.clone(), &mut buf)?;
        Ok(buf.freeze())
    }
}

/// Status line and headers of the attach reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    fn parse(raw: &[u8]) -> Result<Self, CodecError> {
        let text = std::str::from_utf8(raw)?;
        let mut lines = text.split("\r\n");

        let status_line = lines.next().unwrap_or_default();
        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/") {
            return Err(CodecError::MalformedHead(status_line.to_string()));
        }
        let status = parts
            .next()
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| CodecError::MalformedHead(status_line.to_string()))?;
        let reason = parts.next().unwrap_or_default().to_string();

        let mut headers = Vec::new();
        for line in lines.filter(|l| !l.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| CodecError::MalformedHead(line.to_string()))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self {
            status,
            reason,
            headers,
        })
    }
}

/// Items produced by the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// The HTTP head of the attach reply; yielded once per connection.
    Head(ResponseHead),
    /// The payload of one complete chunk. May be empty.
    Chunk(Bytes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Head,
    Chunks,
}

/// Stateful codec for the attached connection.
///
/// A fresh codec must be created for every new socket; its parse state is
/// meaningless on any other connection.
#[derive(Debug)]
pub struct FrameCodec {
    phase: Phase,
    current_length: Option<usize>,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Codec for the device side: expects the HTTP head of the attach reply
    /// before any chunk.
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: Phase::Head,
            current_length: None,
        }
    }

    /// Codec that starts directly at the chunked body, as the server sees
    /// the device's stream after the attach request.
    #[must_use]
    pub fn chunks_only() -> Self {
        Self {
            phase: Phase::Chunks,
            current_length: None,
        }
    }

    #[must_use]
    pub fn head_complete(&self) -> bool {
        self.phase == Phase::Chunks
    }

    fn decode_head(src: &mut BytesMut) -> Result<Option<ResponseHead>, CodecError> {
        let Some(end) = find(src, b"\r\n\r\n") else {
            if src.len() > MAX_HEAD_SIZE {
                return Err(CodecError::HeadTooLarge(src.len()));
            }
            return Ok(None);
        };

        let raw = src.split_to(end + 4);
        ResponseHead::parse(&raw[..end]).map(Some)
    }

    fn decode_size_line(src: &mut BytesMut) -> Result<Option<usize>, CodecError> {
        let Some(end) = find(src, CRLF) else {
            if src.len() > MAX_SIZE_LINE {
                return Err(CodecError::InvalidChunkSize(
                    String::from_utf8_lossy(&src[..MAX_SIZE_LINE]).into_owned(),
                ));
            }
            return Ok(None);
        };

        let line = src.split_to(end);
        src.advance(CRLF.len());

        let text = std::str::from_utf8(&line)?;
        let digits = text.split(';').next().unwrap_or_default().trim();
        let len = usize::from_str_radix(digits, 16)
            .map_err(|_| CodecError::InvalidChunkSize(text.to_string()))?;

        if len > MAX_CHUNK_SIZE {
            return Err(CodecError::ChunkTooLarge(len));
        }

        Ok(Some(len))
    }
}

impl Decoder for FrameCodec {
    type Item = Decoded;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.phase == Phase::Head {
            let Some(head) = Self::decode_head(src)? else {
                return Ok(None);
            };
            self.phase = Phase::Chunks;
            return Ok(Some(Decoded::Head(head)));
        }

        if self.current_length.is_none() {
            let Some(len) = Self::decode_size_line(src)? else {
                return Ok(None);
            };
            self.current_length = Some(len);
        }

        let Some(length) = self.current_length else {
            return Ok(None);
        };

        if src.len() < length + CRLF.len() {
            src.reserve(length + CRLF.len() - src.len());
            return Ok(None);
        }

        let payload = src.split_to(length).freeze();
        if &src[..CRLF.len()] != CRLF {
            return Err(CodecError::MissingDelimiter);
        }
        src.advance(CRLF.len());
        self.current_length = None;

        Ok(Some(Decoded::Chunk(payload)))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = item.wire_len();
        if len > MAX_CHUNK_SIZE {
            return Err(CodecError::ChunkTooLarge(len));
        }

        let size_line = format!("{len:x}\r\n");
        dst.reserve(size_line.len() + len + CRLF.len());
        dst.put_slice(size_line.as_bytes());
        if let Some(tag) = item.tag() {
            dst.put_u8(tag);
        }
        dst.put_slice(item.body());
        dst.put_slice(CRLF);

        Ok(())
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Errors that can occur during codec operations
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("Malformed response head: {0:?}")]
    MalformedHead(String),

    #[error("Response head too large: {0} bytes (max: {MAX_HEAD_SIZE})")]
    HeadTooLarge(usize),

    #[error("Invalid chunk size line: {0:?}")]
    InvalidChunkSize(String),

    #[error("Chunk too large: {0} bytes (max: {MAX_CHUNK_SIZE})")]
    ChunkTooLarge(usize),

    #[error("Chunk not terminated by CRLF")]
    MissingDelimiter,
}
