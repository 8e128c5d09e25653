//! Autonomia device entry point.
//!
//! Attaches this device to the Autonomia service, serves remote method calls
//! and sends periodic telemetry until interrupted.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use autonomia_client::{
    AttachReply, AutonomiaClient, ClientConfig, CommandStreamer, VideoStreamer,
};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod device;
mod telemetry;

use device::Device;

const APP_KEY_ENV: &str = "AUTONOMIA_APP_KEY";

/// Delay between attempts until the first attach succeeds.
const ATTACH_RETRY: Duration = Duration::from_secs(10);

/// Autonomia device agent
#[derive(Parser, Debug)]
#[command(name = "autonomia-device")]
#[command(version, about, long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Application key (defaults to `$AUTONOMIA_APP_KEY`)
    #[arg(long)]
    app_key: Option<String>,

    /// Unique device identifier, usually the MAC address
    #[arg(long)]
    device_id: String,

    /// Free-form device description sent when attaching
    #[arg(long, default_value = "ROV")]
    device_info: String,

    /// Server host name
    #[arg(long)]
    server: Option<String>,

    /// Server port
    #[arg(long)]
    port: Option<u16>,

    /// Connect without TLS
    #[arg(long)]
    no_tls: bool,

    /// Seconds between telemetry events
    #[arg(long, default_value_t = 15, value_parser = clap::value_parser!(u64).range(1..))]
    telemetry_period: u64,

    /// Start streaming video once attached
    #[arg(long)]
    video: bool,

    /// Also append logs to this file
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,
}

/// Log to stderr, and also to `log_file` when one is given.
///
/// Debug builds default to the debug level. The returned guard flushes the
/// file writer when dropped.
fn setup_logging(log_file: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let default_level = if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("autonomia={default_level}")));
    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(true);

    let Some(path) = log_file else {
        tracing_subscriber::registry()
            .with(stderr_layer)
            .with(filter)
            .init();
        return Ok(None);
    };

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(file);
    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .with(filter)
        .init();
    Ok(Some(guard))
}

/// Layer the config file, then flags, then the environment app key.
fn build_config(args: &Args, env_app_key: Option<String>) -> anyhow::Result<ClientConfig> {
    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ClientConfig::default(),
    };

    if let Some(server) = &args.server {
        config.server.clone_from(server);
    }
    if args.port.is_some() {
        config.port = args.port;
    }
    if args.no_tls {
        config.use_tls = false;
    }
    if let Some(app_key) = &args.app_key {
        config.app_key.clone_from(app_key);
    }
    if config.app_key.is_empty() {
        config.app_key = env_app_key.unwrap_or_default();
    }

    config
        .validate()
        .with_context(|| format!("No usable app key: pass --app-key or set {APP_KEY_ENV}"))?;
    Ok(config)
}

async fn attach_with_retry(client: &AutonomiaClient, device: &Arc<Device>) -> AttachReply {
    loop {
        match client.attach(device.methods(), device.id(), device.info()).await {
            Ok(reply) => return reply,
            Err(e) => {
                warn!(
                    "Error attaching to Autonomia ({}): {}. Retrying in {:?}",
                    client.last_error_text(),
                    e,
                    ATTACH_RETRY
                );
                tokio::time::sleep(ATTACH_RETRY).await;
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let _log_guard = setup_logging(args.log_file.as_deref())?;

    let config = build_config(&args, std::env::var(APP_KEY_ENV).ok())?;
    let video: Arc<dyn VideoStreamer> = Arc::new(CommandStreamer::new(config.video.clone()));
    let device = Arc::new(Device::new(
        &args.device_id,
        &args.device_info,
        &config.app_key,
        args.telemetry_period,
        Arc::clone(&video),
    ));

    info!(
        "Starting Autonomia device {} ({}:{})",
        device.id(),
        config.server,
        config.port()
    );
    let client = AutonomiaClient::with_video(config, video);

    let attached = tokio::select! {
        reply = attach_with_retry(&client, &device) => reply,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted before attaching");
            return Ok(());
        }
    };
    info!(
        "Device \"{}\" attached to Autonomia. Server timestamp: {:?}",
        device.id(),
        attached.reply.timestamp
    );
    info!("Server returned: {}", attached.body.trim());

    if args.video {
        match client.video_start(false) {
            Ok(handle) => info!("Streaming to {}", handle.url),
            Err(e) => warn!("Failed to start video: {}", e),
        }
    }

    let shutdown = CancellationToken::new();
    let telemetry = tokio::spawn(telemetry::run(
        client.clone(),
        Arc::clone(&device),
        shutdown.clone(),
    ));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down");
    shutdown.cancel();
    if let Err(e) = telemetry.await {
        warn!("Telemetry task failed: {}", e);
    }
    client.stop().await;

    info!("Autonomia device stopped");
    Ok(())
}
