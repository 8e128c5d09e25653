//! Client configuration.
//!
//! Loaded from a camelCase JSON file; every field has a default so an empty
//! object is a valid (if useless without an app key) configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{ClientError, Result};

const KNOWN_FIELDS: &[&str] = &[
    "server",
    "port",
    "useTls",
    "appKey",
    "hostHeader",
    "connectTimeoutMs",
    "handshakeTimeoutMs",
    "receivePollMs",
    "reconnectBackoffMs",
    "defaultHeartbeatSecs",
    "maxEmptyTlsReads",
    "video",
];

/// Connection settings for one device session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    #[serde(default = "default_server")]
    pub server: String,

    /// Defaults to 443 with TLS and 80 without.
    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default = "default_true")]
    pub use_tls: bool,

    #[serde(default)]
    pub app_key: String,

    /// Value of the `Host` header in the attach request.
    #[serde(default)]
    pub host_header: Option<String>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    /// Upper bound on one wait for socket readability.
    #[serde(default = "default_receive_poll")]
    pub receive_poll_ms: u64,

    /// Fixed delay between reconnect attempts.
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff_ms: u64,

    /// Heartbeat interval used when the server does not assign one.
    #[serde(default = "default_heartbeat")]
    pub default_heartbeat_secs: u64,

    /// Consecutive empty TLS reads tolerated before the link counts as closed.
    #[serde(default = "default_max_empty_tls_reads")]
    pub max_empty_tls_reads: u32,

    #[serde(default)]
    pub video: VideoConfig,
}

fn default_server() -> String {
    "cometa.vederly.com".to_string()
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_handshake_timeout() -> u64 {
    30_000
}

fn default_receive_poll() -> u64 {
    15_000
}

fn default_reconnect_backoff() -> u64 {
    15_000
}

fn default_heartbeat() -> u64 {
    60
}

fn default_max_empty_tls_reads() -> u32 {
    3
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            port: None,
            use_tls: true,
            app_key: String::new(),
            host_header: None,
            connect_timeout_ms: default_connect_timeout(),
            handshake_timeout_ms: default_handshake_timeout(),
            receive_poll_ms: default_receive_poll(),
            reconnect_backoff_ms: default_reconnect_backoff(),
            default_heartbeat_secs: default_heartbeat(),
            max_empty_tls_reads: default_max_empty_tls_reads(),
            video: VideoConfig::default(),
        }
    }
}

impl ClientConfig {
    #[must_use]
    pub fn new(app_key: impl Into<String>) -> Self {
        Self {
            app_key: app_key.into(),
            ..Self::default()
        }
    }

    /// Load configuration from a JSON file.
    ///
    /// Unknown fields are logged and ignored.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&content)
    }

    /// Parse configuration from JSON text.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` if the text is not a valid configuration.
    pub fn from_json(content: &str) -> Result<Self> {
        warn_unknown_fields(content);
        serde_json::from_str(content).map_err(|e| ClientError::Config(e.to_string()))
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(if self.use_tls { 443 } else { 80 })
    }

    #[must_use]
    pub fn host_header(&self) -> &str {
        self.host_header.as_deref().unwrap_or("api.autonomia.io")
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    #[must_use]
    pub fn receive_poll(&self) -> Duration {
        Duration::from_millis(self.receive_poll_ms)
    }

    #[must_use]
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    /// Check the settings needed before any connection attempt.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` for an empty app key or server name.
    pub fn validate(&self) -> Result<()> {
        if self.app_key.trim().is_empty() {
            return Err(ClientError::Config("appKey is empty".to_string()));
        }
        if self.server.trim().is_empty() {
            return Err(ClientError::Config("server is empty".to_string()));
        }
        Ok(())
    }
}

/// Settings for the video streaming collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoConfig {
    /// `host:port` of the RTMP ingest server.
    #[serde(default = "default_stream_server")]
    pub stream_server: String,

    /// Encoder argv. `{url}` is replaced by the stream URL and `{overlay}`
    /// by the overlay arguments (or dropped when no overlay is requested).
    #[serde(default = "default_command")]
    pub command: Vec<String>,

    #[serde(default = "default_overlay_args")]
    pub overlay_args: Vec<String>,
}

fn default_stream_server() -> String {
    "stream.autonomia.io:12345".to_string()
}

fn default_command() -> Vec<String> {
    [
        "ffmpeg",
        "-r",
        "30",
        "-use_wallclock_as_timestamps",
        "1",
        "-thread_queue_size",
        "512",
        "-f",
        "v4l2",
        "-i",
        "/dev/video0",
        "-maxrate",
        "768k",
        "-bufsize",
        "960k",
        "{overlay}",
        "-threads",
        "4",
        "-r",
        "30",
        "-g",
        "60",
        "-f",
        "flv",
        "{url}",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_overlay_args() -> Vec<String> {
    vec![
        "-vf".to_string(),
        "drawtext=fontfile=/usr/share/fonts/truetype/freefont/FreeSans.ttf: \
         text='%{localtime}':x=0:y=(h-th-2): fontsize=24: fontcolor=white: \
         box=1: boxcolor=black@0.9"
            .to_string(),
    ]
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            stream_server: default_stream_server(),
            command: default_command(),
            overlay_args: default_overlay_args(),
        }
    }
}

fn warn_unknown_fields(content: &str) {
    let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(content) else {
        return;
    };

    for key in obj.keys() {
        if !KNOWN_FIELDS.contains(&key.as_str()) {
            warn!("Unknown config field: {key}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.server, "cometa.vederly.com");
        assert!(config.use_tls);
        assert_eq!(config.port(), 443);
        assert_eq!(config.host_header(), "api.autonomia.io");
        assert_eq!(config.receive_poll(), Duration::from_secs(15));
        assert_eq!(config.reconnect_backoff(), Duration::from_secs(15));
        assert_eq!(config.default_heartbeat_secs, 60);
    }

    #[test]
    fn test_plaintext_default_port() {
        let config = ClientConfig {
            use_tls: false,
            ..ClientConfig::default()
        };
        assert_eq!(config.port(), 80);
    }

    #[test]
    fn test_explicit_port_wins() {
        let config = ClientConfig::from_json(r#"{"port": 8080, "useTls": true}"#).unwrap();
        assert_eq!(config.port(), 8080);
    }

    #[test]
    fn test_empty_object_uses_defaults() {
        let config = ClientConfig::from_json("{}").unwrap();
        assert_eq!(config.server, default_server());
        assert_eq!(config.max_empty_tls_reads, 3);
        assert_eq!(config.video.stream_server, "stream.autonomia.io:12345");
    }

    #[test]
    fn test_camel_case_fields() {
        let config = ClientConfig::from_json(
            r#"{
                "server": "127.0.0.1",
                "useTls": false,
                "appKey": "KEY",
                "hostHeader": "example.test",
                "reconnectBackoffMs": 250,
                "video": {"streamServer": "rtmp.test:1935"}
            }"#,
        )
        .unwrap();
        assert_eq!(config.app_key, "KEY");
        assert_eq!(config.host_header(), "example.test");
        assert_eq!(config.reconnect_backoff(), Duration::from_millis(250));
        assert_eq!(config.video.stream_server, "rtmp.test:1935");
        assert_eq!(config.video.command, default_command());
    }

    #[test]
    fn test_unknown_field_is_not_fatal() {
        let config = ClientConfig::from_json(r#"{"appKey": "k", "colour": "blue"}"#).unwrap();
        assert_eq!(config.app_key, "k");
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let err = ClientConfig::from_json("{").unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }

    #[test]
    fn test_validate() {
        assert!(ClientConfig::default().validate().is_err());
        assert!(ClientConfig::new("  ").validate().is_err());
        assert!(ClientConfig::new("key").validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"appKey": "from-file", "port": 9000}}"#).unwrap();

        let config = ClientConfig::load(file.path()).unwrap();
        assert_eq!(config.app_key, "from-file");
        assert_eq!(config.port(), 9000);
    }

    #[test]
    fn test_load_missing_file() {
        let err = ClientConfig::load(Path::new("/nonexistent/autonomia.json")).unwrap_err();
        assert!(err.to_string().contains("autonomia.json"));
    }
}
