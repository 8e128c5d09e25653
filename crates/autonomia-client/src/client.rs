//! The public client surface.

use std::sync::Arc;

use autonomia_rpc::{MessageHandler, MethodRegistry};
use bytes::Bytes;
use tokio::sync::watch;

use crate::config::ClientConfig;
use crate::error::{ClientError, ErrorCode, Result};
use crate::handshake::DeviceIdentity;
use crate::session::{AttachReply, Session, SessionState};
use crate::video::{CommandStreamer, StreamHandle, VideoStreamer};

/// A device's connection to the Autonomia service.
///
/// ```no_run
/// use autonomia_client::{AutonomiaClient, ClientConfig};
/// use autonomia_rpc::MethodRegistry;
///
/// # async fn run() -> autonomia_client::Result<()> {
/// let client = AutonomiaClient::new(ClientConfig::new("APPKEY"));
/// let methods = MethodRegistry::new().method("ping", |_| Ok("pong".into()));
///
/// client.attach(methods, "B8AEED7340ED", "ROV").await?;
/// client.send(r#"{"speed":3}"#).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct AutonomiaClient {
    session: Session,
    video: Arc<dyn VideoStreamer>,
}

impl std::fmt::Debug for AutonomiaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutonomiaClient")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl AutonomiaClient {
    /// Create a client streaming video with the configured encoder command.
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        let video = Arc::new(CommandStreamer::new(config.video.clone()));
        Self::with_video(config, video)
    }

    #[must_use]
    pub fn with_video(config: ClientConfig, video: Arc<dyn VideoStreamer>) -> Self {
        Self {
            session: Session::new(config),
            video,
        }
    }

    /// Attach the device, serving `methods` for inbound requests.
    ///
    /// Retrying a failed attach is left to the caller.
    ///
    /// # Errors
    ///
    /// See [`Session::attach`]. [`AutonomiaClient::last_error`] reflects the
    /// outcome.
    pub async fn attach(
        &self,
        methods: MethodRegistry,
        device_id: &str,
        device_info: &str,
    ) -> Result<AttachReply> {
        self.session
            .attach(methods, DeviceIdentity::new(device_id, device_info))
            .await
    }

    /// Send a data event. Fails fast while reattaching.
    ///
    /// # Errors
    ///
    /// See [`Session::send`].
    pub async fn send(&self, message: impl Into<Bytes>) -> Result<()> {
        self.session.send(message).await
    }

    /// Replace method dispatch with a raw message handler.
    ///
    /// An empty reply from `handler` sends nothing back.
    pub fn bind_callback<H>(&self, handler: H)
    where
        H: MessageHandler + 'static,
    {
        self.session.bind_callback(Arc::new(handler));
    }

    #[must_use]
    pub fn last_error(&self) -> ErrorCode {
        self.session.last_error()
    }

    #[must_use]
    pub fn last_error_text(&self) -> &'static str {
        self.last_error().text()
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.session.subscribe_state()
    }

    #[must_use]
    pub fn device_id(&self) -> Option<String> {
        self.session.device_id()
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Start streaming video for the attached device.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::NotAttached` before an attach and
    /// `ClientError::Video` if the encoder fails to start.
    pub fn video_start(&self, timestamp_overlay: bool) -> Result<StreamHandle> {
        let device_id = self.device_id().ok_or(ClientError::NotAttached)?;
        let handle = self.video.start(
            &device_id,
            &self.session.config().app_key,
            timestamp_overlay,
        )?;
        Ok(handle)
    }

    /// Stop streaming video. Succeeds when nothing is streaming.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Video` if the encoder cannot be stopped.
    pub fn video_stop(&self) -> Result<()> {
        self.video.stop()?;
        Ok(())
    }

    /// Stop the session for good.
    pub async fn stop(&self) {
        if let Err(e) = self.video.stop() {
            tracing::warn!("Failed to stop video on shutdown: {}", e);
        }
        self.session.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::VideoError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingStreamer {
        calls: Mutex<Vec<String>>,
    }

    impl VideoStreamer for RecordingStreamer {
        fn start(
            &self,
            device_id: &str,
            app_key: &str,
            timestamp_overlay: bool,
        ) -> std::result::Result<StreamHandle, VideoError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("start {device_id} {app_key} {timestamp_overlay}"));
            Ok(StreamHandle {
                pid: None,
                url: format!("rtmp://test/src/{device_id}"),
            })
        }

        fn stop(&self) -> std::result::Result<(), VideoError> {
            self.calls.lock().unwrap().push("stop".to_string());
            Ok(())
        }
    }

    #[test]
    fn test_initial_error_is_internal() {
        let client = AutonomiaClient::new(ClientConfig::new("key"));
        assert_eq!(client.last_error(), ErrorCode::InternalError);
        assert_eq!(client.last_error_text(), "internal error");
        assert_eq!(client.state(), SessionState::Unattached);
    }

    #[test]
    fn test_video_start_requires_attach() {
        let video = Arc::new(RecordingStreamer::default());
        let client = AutonomiaClient::with_video(ClientConfig::new("key"), video.clone());

        let err = client.video_start(false).unwrap_err();
        assert!(matches!(err, ClientError::NotAttached));
        assert!(video.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_video_stop_delegates() {
        let video = Arc::new(RecordingStreamer::default());
        let client = AutonomiaClient::with_video(ClientConfig::new("key"), video.clone());

        client.video_stop().unwrap();
        client.video_stop().unwrap();
        assert_eq!(*video.calls.lock().unwrap(), ["stop", "stop"]);
    }

    #[tokio::test]
    async fn test_failed_attach_reports_error_text() {
        let config = ClientConfig {
            server: "127.0.0.1".to_string(),
            port: Some(1),
            use_tls: false,
            ..ClientConfig::new("key")
        };
        let client = AutonomiaClient::new(config);

        let err = client.attach(MethodRegistry::new(), "dev", "ROV").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NetworkError);
        assert_eq!(client.last_error_text(), "network error");
        assert_eq!(client.device_id().as_deref(), Some("dev"));
        assert_eq!(client.state(), SessionState::Unattached);
    }
}
