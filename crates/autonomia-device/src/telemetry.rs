//! Periodic telemetry data events.

use std::sync::Arc;

use autonomia_client::AutonomiaClient;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::device::Device;

/// Send one telemetry event per period until `shutdown` fires.
///
/// A failed send is logged and retried on the next period.
pub async fn run(client: AutonomiaClient, device: Arc<Device>, shutdown: CancellationToken) {
    loop {
        let message = device.telemetry_message(chrono::Utc::now().timestamp_millis());
        debug!("Sending telemetry data: {}", message);

        if let Err(e) = client.send(message).await {
            warn!("Error sending telemetry data ({}): {}", e.code(), e);
        }

        tokio::select! {
            () = shutdown.cancelled() => break,
            () = tokio::time::sleep(device.telemetry_period()) => {}
        }
    }

    debug!("Telemetry stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use autonomia_client::{ClientConfig, CommandStreamer, VideoConfig};
    use std::time::Duration;

    #[tokio::test]
    async fn test_unattached_send_does_not_stop_loop_early() {
        let video = Arc::new(CommandStreamer::new(VideoConfig::default()));
        let device = Arc::new(Device::new("dev", "ROV", "key", 1, video));
        let client = AutonomiaClient::new(ClientConfig::new("key"));
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(run(client, device, shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
