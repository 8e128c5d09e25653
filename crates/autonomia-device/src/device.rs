//! Device identity and the RPC methods it serves.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use autonomia_client::VideoStreamer;
use autonomia_rpc::{HandlerError, HandlerResult, MethodRegistry};
use serde_json::{Value, json};
use tracing::info;

pub struct Device {
    device_id: String,
    device_info: String,
    app_key: String,
    telemetry_secs: AtomicU64,
    video: Arc<dyn VideoStreamer>,
}

impl Device {
    pub fn new(
        device_id: &str,
        device_info: &str,
        app_key: &str,
        telemetry_secs: u64,
        video: Arc<dyn VideoStreamer>,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            device_info: device_info.to_string(),
            app_key: app_key.to_string(),
            telemetry_secs: AtomicU64::new(telemetry_secs),
            video,
        }
    }

    pub fn id(&self) -> &str {
        &self.device_id
    }

    pub fn info(&self) -> &str {
        &self.device_info
    }

    pub fn telemetry_period(&self) -> Duration {
        Duration::from_secs(self.telemetry_secs.load(Ordering::Relaxed))
    }

    /// Telemetry data event, `time` in milliseconds since the epoch.
    pub fn telemetry_message(&self, now_ms: i64) -> String {
        json!({
            "time": now_ms.to_string(),
            "device_id": self.device_id,
        })
        .to_string()
    }

    /// Methods the server may call on this device.
    pub fn methods(self: &Arc<Self>) -> MethodRegistry {
        let period = Arc::clone(self);
        let start = Arc::clone(self);
        let stop = Arc::clone(self);
        let about = Arc::clone(self);

        MethodRegistry::new()
            .method("set_telemetry_period", move |params| {
                Ok(json!({ "success": period.set_telemetry_period(&params) }))
            })
            .method("video_start", move |params| start.video_start(&params))
            .method("video_stop", move |_| {
                stop.video
                    .stop()
                    .map_err(|e| HandlerError::failed(e.to_string()))?;
                Ok(json!({ "success": true }))
            })
            .method("device_info", move |_| {
                Ok(json!({
                    "deviceId": about.device_id,
                    "deviceInfo": about.device_info,
                }))
            })
    }

    fn set_telemetry_period(&self, params: &Value) -> bool {
        match params.get("period").and_then(Value::as_u64) {
            Some(secs) if secs > 0 => {
                self.telemetry_secs.store(secs, Ordering::Relaxed);
                info!("Telemetry period set to {}s", secs);
                true
            }
            _ => false,
        }
    }

    fn video_start(&self, params: &Value) -> HandlerResult {
        let Some(timestamp) = params.get("timestamp").and_then(Value::as_bool) else {
            return Ok(json!({ "success": false }));
        };

        let handle = self
            .video
            .start(&self.device_id, &self.app_key, timestamp)
            .map_err(|e| HandlerError::failed(e.to_string()))?;
        Ok(json!({ "success": true, "url": handle.url }))
    }
}
