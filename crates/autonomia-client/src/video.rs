//! Video streaming collaborator.
//!
//! The session only needs start/stop; [`CommandStreamer`] runs one external
//! encoder process pushing to the RTMP ingest server.

use std::process::Stdio;
use std::sync::{Mutex, MutexGuard, PoisonError};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, info};

use crate::config::VideoConfig;

const URL_PLACEHOLDER: &str = "{url}";
const OVERLAY_PLACEHOLDER: &str = "{overlay}";

/// Hex digits of the MAC kept in the stream key.
const KEY_DIGEST_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum VideoError {
    #[error("Video command is empty")]
    EmptyCommand,

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to stop stream: {0}")]
    Kill(std::io::Error),

    #[error("Invalid stream signing key")]
    Key,
}

/// A running stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHandle {
    pub pid: Option<u32>,
    pub url: String,
}

pub trait VideoStreamer: Send + Sync {
    /// Start streaming, replacing any stream already running.
    ///
    /// # Errors
    ///
    /// Returns `VideoError` if the encoder cannot be started.
    fn start(
        &self,
        device_id: &str,
        app_key: &str,
        timestamp_overlay: bool,
    ) -> Result<StreamHandle, VideoError>;

    /// Stop the running stream. Succeeds when nothing is running.
    ///
    /// # Errors
    ///
    /// Returns `VideoError::Kill` if the encoder cannot be signalled.
    fn stop(&self) -> Result<(), VideoError>;
}

/// Streaming key for a device: `{device_id}:{first 32 hex of HMAC-SHA256}`.
///
/// # Errors
///
/// Returns `VideoError::Key` if the app key is rejected as a MAC key.
pub fn stream_key(device_id: &str, app_key: &str) -> Result<String, VideoError> {
    let digest = hex::encode(sign(app_key.as_bytes(), device_id.as_bytes())?);
    Ok(format!("{device_id}:{}", &digest[..KEY_DIGEST_LEN]))
}

fn sign(key: &[u8], data: &[u8]) -> Result<Vec<u8>, VideoError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| VideoError::Key)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn spawn_stderr_logger(stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("encoder stderr: {}", line);
        }
    });
}

/// Runs the configured encoder command as a child process.
///
/// Must be used from within a tokio runtime.
#[derive(Debug)]
pub struct CommandStreamer {
    config: VideoConfig,
    child: Mutex<Option<Child>>,
}

impl CommandStreamer {
    #[must_use]
    pub fn new(config: VideoConfig) -> Self {
        Self {
            config,
            child: Mutex::new(None),
        }
    }

    /// RTMP ingest URL for the device.
    ///
    /// # Errors
    ///
    /// See [`stream_key`].
    pub fn stream_url(&self, device_id: &str, app_key: &str) -> Result<String, VideoError> {
        Ok(format!(
            "rtmp://{}/src/{}:1",
            self.config.stream_server,
            stream_key(device_id, app_key)?
        ))
    }

    fn build_argv(&self, url: &str, timestamp_overlay: bool) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.config.command.len());
        for arg in &self.config.command {
            if arg == OVERLAY_PLACEHOLDER {
                if timestamp_overlay {
                    argv.extend(self.config.overlay_args.iter().cloned());
                }
            } else {
                argv.push(arg.replace(URL_PLACEHOLDER, url));
            }
        }
        argv
    }

    fn slot(&self) -> MutexGuard<'_, Option<Child>> {
        self.child.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.slot()
            .as_mut()
            .is_some_and(|child| matches!(child.try_wait(), Ok(None)))
    }
}

impl VideoStreamer for CommandStreamer {
    fn start(
        &self,
        device_id: &str,
        app_key: &str,
        timestamp_overlay: bool,
    ) -> Result<StreamHandle, VideoError> {
        self.stop()?;

        let url = self.stream_url(device_id, app_key)?;
        let argv = self.build_argv(&url, timestamp_overlay);
        let (program, args) = argv.split_first().ok_or(VideoError::EmptyCommand)?;

        debug!("Spawning encoder: {}", argv.join(" "));
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| VideoError::Spawn {
                program: program.clone(),
                source,
            })?;

        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_logger(stderr);
        }

        let pid = child.id();
        *self.slot() = Some(child);
        info!("Video stream started (pid {:?}): {}", pid, url);

        Ok(StreamHandle { pid, url })
    }

    fn stop(&self) -> Result<(), VideoError> {
        let Some(mut child) = self.slot().take() else {
            return Ok(());
        };

        if let Ok(Some(status)) = child.try_wait() {
            debug!("Encoder already exited with status: {}", status);
            return Ok(());
        }

        child.start_kill().map_err(VideoError::Kill)?;
        info!("Video stream stopped (pid {:?})", child.id());
        Ok(())
    }
}
