//! The attach handshake.
//!
//! One HTTP POST announces the device; the server answers with a response
//! head and a first body chunk carrying the heartbeat interval. The same
//! response body then continues as the chunked frame stream, so the decoder
//! and any bytes read past the first chunk are handed on to the session.

use std::time::Duration;

use autonomia_rpc::{Decoded, FrameCodec, ResponseHead};
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Decoder;
use tracing::{debug, trace};

use crate::error::{ClientError, Result};

/// Prefix of every accepted attach reply body.
const SUCCESS_MARKER: &str = r#"{"msg":"200"#;

/// Shortest body that can hold a success reply.
const MIN_REPLY_LEN: usize = 16;

pub(crate) const READ_CHUNK: usize = 1024;

/// Body of a successful attach reply, e.g.
/// `{"msg":"200 OK","heartbeat":60,"timestamp":1441382935}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeReply {
    pub msg: String,
    /// Heartbeat interval in seconds assigned by the server.
    #[serde(default)]
    pub heartbeat: Option<u64>,
    /// Server time in seconds since the epoch.
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// Everything the session needs to continue on an attached connection.
#[derive(Debug)]
pub struct Handshake {
    pub reply: HandshakeReply,
    /// Raw body text of the first chunk.
    pub body: String,
    pub codec: FrameCodec,
    /// Bytes already read past the first chunk.
    pub buffer: BytesMut,
}

/// Identity a device attaches with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub device_info: String,
}

impl DeviceIdentity {
    #[must_use]
    pub fn new(device_id: impl Into<String>, device_info: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            device_info: device_info.into(),
        }
    }
}

/// Build the attach request for `identity`.
#[must_use]
pub fn attach_request(host: &str, app_key: &str, identity: &DeviceIdentity) -> String {
    format!(
        "POST /v1/applications/{app_key}/devices/{device_id} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Content-Length:{len}\r\n\
         \r\n\
         {info}",
        device_id = identity.device_id,
        len = identity.device_info.len(),
        info = identity.device_info,
    )
}

/// Send the attach request and wait for the first body chunk.
///
/// # Errors
///
/// - `ClientError::Timeout` if no reply arrives within `timeout`
/// - `ClientError::Unauthorized` / `ClientError::HttpStatus` for a non-2xx head
/// - `ClientError::UnexpectedReply` if the body lacks the success marker
/// - `ClientError::ConnectionClosed` if the server hangs up first
/// - `ClientError::Io` / `ClientError::Codec` for socket or framing failures
pub async fn perform<C>(conn: &mut C, request: &str, timeout: Duration) -> Result<Handshake>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    conn.write_all(request.as_bytes()).await?;
    conn.flush().await?;
    trace!("Attach request sent ({} bytes)", request.len());

    tokio::time::timeout(timeout, read_reply(conn))
        .await
        .map_err(|_| ClientError::Timeout("waiting for attach reply"))?
}

async fn read_reply<C>(conn: &mut C) -> Result<Handshake>
where
    C: AsyncRead + Unpin,
{
    let mut codec = FrameCodec::new();
    let mut buffer = BytesMut::with_capacity(READ_CHUNK);

    loop {
        while let Some(item) = codec.decode(&mut buffer)? {
            match item {
                Decoded::Head(head) => {
                    check_status(&head)?;
                    debug!("Attach reply head: {} {}", head.status, head.reason);
                }
                Decoded::Chunk(chunk) => {
                    let (reply, body) = parse_body(&chunk)?;
                    return Ok(Handshake {
                        reply,
                        body,
                        codec,
                        buffer,
                    });
                }
            }
        }

        buffer.reserve(READ_CHUNK);
        if conn.read_buf(&mut buffer).await? == 0 {
            return Err(ClientError::ConnectionClosed);
        }
    }
}

fn check_status(head: &ResponseHead) -> Result<()> {
    match head.status {
        401 | 403 => Err(ClientError::Unauthorized(head.status)),
        _ if head.is_success() => Ok(()),
        status => Err(ClientError::HttpStatus {
            status,
            reason: head.reason.clone(),
        }),
    }
}

fn parse_body(chunk: &[u8]) -> Result<(HandshakeReply, String)> {
    let body = String::from_utf8_lossy(chunk).into_owned();
    let trimmed = body.trim_start();

    if trimmed.len() < MIN_REPLY_LEN || !trimmed.starts_with(SUCCESS_MARKER) {
        return Err(ClientError::UnexpectedReply(body));
    }

    let reply = serde_json::from_str(trimmed)
        .map_err(|e| ClientError::UnexpectedReply(format!("{e}: {body}")))?;
    Ok((reply, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use tokio::io::{DuplexStream, duplex};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new("B8AEED7340ED", "ROV")
    }

    async fn serve(mut server: DuplexStream, response: &'static [u8]) -> Vec<u8> {
        let mut request = vec![0u8; 512];
        let n = server.read(&mut request).await.unwrap();
        request.truncate(n);
        server.write_all(response).await.unwrap();
        request
    }

    #[test]
    fn test_attach_request_format() {
        let request = attach_request("api.autonomia.io", "APPKEY", &identity());
        assert_eq!(
            request,
            "POST /v1/applications/APPKEY/devices/B8AEED7340ED HTTP/1.1\r\n\
             Host: api.autonomia.io\r\nContent-Length:3\r\n\r\nROV"
        );
    }

    #[test]
    fn test_content_length_counts_bytes() {
        let request = attach_request("h", "k", &DeviceIdentity::new("d", "Véhicule"));
        assert!(request.contains("Content-Length:9\r\n"));
    }

    #[tokio::test]
    async fn test_successful_handshake() {
        let (mut client, server) = duplex(4096);
        let server = tokio::spawn(serve(
            server,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
              36\r\n{\"msg\":\"200 OK\",\"heartbeat\":60,\"timestamp\":1441382935}\r\n",
        ));

        let request = attach_request("api.autonomia.io", "KEY", &identity());
        let handshake = perform(&mut client, &request, TIMEOUT).await.unwrap();

        assert_eq!(handshake.reply.msg, "200 OK");
        assert_eq!(handshake.reply.heartbeat, Some(60));
        assert_eq!(handshake.reply.timestamp, Some(1_441_382_935));
        assert!(handshake.codec.head_complete());
        assert!(handshake.body.starts_with(r#"{"msg":"200"#));

        let sent = server.await.unwrap();
        assert_eq!(sent, request.as_bytes());
    }

    #[tokio::test]
    async fn test_bytes_after_first_chunk_are_kept() {
        let (mut client, server) = duplex(4096);
        let server = tokio::spawn(serve(
            server,
            b"HTTP/1.1 200 OK\r\n\r\n\
              1b\r\n{\"msg\":\"200\",\"heartbeat\":5}\r\n\
              2\r\n{}\r\n",
        ));

        let mut handshake = perform(&mut client, "POST / HTTP/1.1\r\n\r\n", TIMEOUT)
            .await
            .unwrap();
        server.await.unwrap();

        assert_eq!(handshake.reply.heartbeat, Some(5));
        match handshake.codec.decode(&mut handshake.buffer).unwrap() {
            Some(Decoded::Chunk(next)) => assert_eq!(&next[..], b"{}"),
            other => panic!("Expected buffered chunk, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wrong_marker_is_wrong_parameters() {
        let (mut client, server) = duplex(4096);
        tokio::spawn(serve(
            server,
            b"HTTP/1.1 200 OK\r\n\r\n1e\r\n{\"msg\":\"403 already attached\"}\r\n",
        ));

        let err = perform(&mut client, "POST / HTTP/1.1\r\n\r\n", TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::UnexpectedReply(_)));
        assert_eq!(err.code(), ErrorCode::WrongParameters);
    }

    #[tokio::test]
    async fn test_short_body_is_wrong_parameters() {
        let (mut client, server) = duplex(4096);
        tokio::spawn(serve(server, b"HTTP/1.1 200 OK\r\n\r\n2\r\nok\r\n"));

        let err = perform(&mut client, "POST / HTTP/1.1\r\n\r\n", TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::WrongParameters);
    }

    #[tokio::test]
    async fn test_forbidden_is_authorization_error() {
        let (mut client, server) = duplex(4096);
        tokio::spawn(serve(
            server,
            b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n",
        ));

        let err = perform(&mut client, "POST / HTTP/1.1\r\n\r\n", TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::AuthorizationError);
    }

    #[tokio::test]
    async fn test_server_error_is_protocol_error() {
        let (mut client, server) = duplex(4096);
        tokio::spawn(serve(
            server,
            b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n",
        ));

        let err = perform(&mut client, "POST / HTTP/1.1\r\n\r\n", TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::HttpStatus { status: 503, .. }));
        assert_eq!(err.code(), ErrorCode::ProtocolError);
    }

    #[tokio::test]
    async fn test_closed_before_reply_is_network_error() {
        let (mut client, mut server) = duplex(4096);
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            let _ = server.read(&mut buf).await;
            drop(server);
        });

        let err = perform(&mut client, "POST / HTTP/1.1\r\n\r\n", TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ConnectionClosed));
        assert_eq!(err.code(), ErrorCode::NetworkError);
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let (mut client, _server) = duplex(4096);

        let err = perform(
            &mut client,
            "POST / HTTP/1.1\r\n\r\n",
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Timeout);
    }

    #[test]
    fn test_parse_body_tolerates_leading_whitespace() {
        let (reply, _) = parse_body(b"  {\"msg\":\"200 OK\",\"heartbeat\":30}").unwrap();
        assert_eq!(reply.heartbeat, Some(30));
    }

    #[test]
    fn test_parse_body_without_heartbeat() {
        let (reply, body) = parse_body(b"{\"msg\":\"200 OK\",\"extra\":true}").unwrap();
        assert_eq!(reply.heartbeat, None);
        assert_eq!(reply.timestamp, None);
        assert!(body.contains("extra"));
    }

    #[test]
    fn test_parse_body_marker_without_json() {
        let err = parse_body(b"{\"msg\":\"200 OK\" garbage").unwrap_err();
        assert_eq!(err.code(), ErrorCode::WrongParameters);
    }
}
