//! Device event forwarding
//!
//! Devices push events over their WebSocket; the broker shapes them into
//! [`DeviceEvent`]s and hands them to a forwarder. Forwarding is best-effort:
//! errors are logged and never propagate to the connection that produced the
//! event, and nothing is retried.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::Result;
use crate::db::EventLogRepo;

/// An event emitted by a connected device
#[derive(Debug, Clone, Serialize)]
pub struct DeviceEvent {
    /// Device that emitted the event
    pub device_id: String,

    /// Hardware manufacturer, from the session profile
    pub manufacturer: String,

    /// Hardware model, from the session profile
    pub model: String,

    /// OS version, from the session profile
    pub os_version: String,

    /// Event type tag (e.g., `"battery_low"`)
    pub event_type: String,

    /// Event payload as sent by the device
    pub data: serde_json::Value,

    /// Device-reported timestamp (epoch milliseconds)
    pub timestamp: i64,
}

/// Downstream sink for device events
#[async_trait]
pub trait EventForwarder: Send + Sync {
    /// Forward a single event
    ///
    /// # Errors
    ///
    /// Returns error if the sink rejects or cannot reach its target
    async fn forward(&self, event: &DeviceEvent) -> Result<()>;

    /// Forwarder name for log lines
    fn name(&self) -> &'static str;
}

/// Hand an event to a forwarder without waiting for it (fire-and-forget)
pub fn dispatch(forwarder: Arc<dyn EventForwarder>, event: DeviceEvent) {
    drop(tokio::spawn(async move {
        if let Err(e) = forwarder.forward(&event).await {
            tracing::warn!(
                forwarder = forwarder.name(),
                device_id = %event.device_id,
                event_type = %event.event_type,
                error = %e,
                "event forwarding failed"
            );
        } else {
            tracing::debug!(
                forwarder = forwarder.name(),
                device_id = %event.device_id,
                event_type = %event.event_type,
                "event forwarded"
            );
        }
    }));
}

/// Forwards events to an HTTP endpoint as JSON
pub struct WebhookForwarder {
    client: reqwest::Client,
    url: String,
}

impl WebhookForwarder {
    /// Create a forwarder posting to the given URL
    #[must_use]
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl EventForwarder for WebhookForwarder {
    async fn forward(&self, event: &DeviceEvent) -> Result<()> {
        self.client
            .post(&self.url)
            .json(event)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}

/// Persists events to the local device event log
pub struct EventLogForwarder {
    log: EventLogRepo,
}

impl EventLogForwarder {
    /// Create a forwarder writing to the given event log
    #[must_use]
    pub const fn new(log: EventLogRepo) -> Self {
        Self { log }
    }
}

#[async_trait]
impl EventForwarder for EventLogForwarder {
    async fn forward(&self, event: &DeviceEvent) -> Result<()> {
        self.log.insert(
            &event.device_id,
            &event.event_type,
            &event.data,
            event.timestamp,
        )
    }

    fn name(&self) -> &'static str {
        "event_log"
    }
}

/// Fans an event out to several sinks
///
/// Each sink gets the event even when an earlier one fails; per-sink
/// failures are logged here and not surfaced.
pub struct FanoutForwarder {
    sinks: Vec<Arc<dyn EventForwarder>>,
}

impl FanoutForwarder {
    /// Create a fanout over the given sinks
    #[must_use]
    pub fn new(sinks: Vec<Arc<dyn EventForwarder>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl EventForwarder for FanoutForwarder {
    async fn forward(&self, event: &DeviceEvent) -> Result<()> {
        for sink in &self.sinks {
            if let Err(e) = sink.forward(event).await {
                tracing::warn!(
                    forwarder = sink.name(),
                    device_id = %event.device_id,
                    error = %e,
                    "event sink failed"
                );
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "fanout"
    }
}

/// Discards events; default for tests
pub struct NullForwarder;

#[async_trait]
impl EventForwarder for NullForwarder {
    async fn forward(&self, _event: &DeviceEvent) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "null"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::Notify;

    use super::*;
    use crate::broker::{DeviceProfile, Platform};
    use crate::db::{DeviceRepo, init_memory};

    struct RecordingForwarder {
        calls: AtomicUsize,
        notify: Notify,
    }

    impl RecordingForwarder {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                notify: Notify::new(),
            }
        }
    }

    #[async_trait]
    impl EventForwarder for RecordingForwarder {
        async fn forward(&self, _event: &DeviceEvent) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.notify.notify_one();
            Ok(())
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    struct FailingForwarder;

    #[async_trait]
    impl EventForwarder for FailingForwarder {
        async fn forward(&self, _event: &DeviceEvent) -> Result<()> {
            Err(crate::Error::Forward("sink unavailable".to_string()))
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    fn sample_event(device_id: &str) -> DeviceEvent {
        DeviceEvent {
            device_id: device_id.to_string(),
            manufacturer: "Google".to_string(),
            model: "GX7AS".to_string(),
            os_version: "14".to_string(),
            event_type: "battery_low".to_string(),
            data: serde_json::json!({"level": 9}),
            timestamp: 1_700_000_000_000,
        }
    }

    #[tokio::test]
    async fn dispatch_reaches_forwarder() {
        let forwarder = Arc::new(RecordingForwarder::new());
        dispatch(forwarder.clone(), sample_event("dev-1"));

        forwarder.notify.notified().await;
        assert_eq!(forwarder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dispatch_swallows_failures() {
        // Must not panic or propagate anywhere
        dispatch(Arc::new(FailingForwarder), sample_event("dev-1"));
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn event_log_forwarder_persists() {
        let pool = init_memory().unwrap();
        let devices = DeviceRepo::new(pool.clone());
        devices
            .upsert(&DeviceProfile {
                device_id: "dev-1".to_string(),
                device_name: "Pixel 8".to_string(),
                model: "GX7AS".to_string(),
                manufacturer: "Google".to_string(),
                platform: Platform::Android,
                os_version: "14".to_string(),
                app_version: "1.0.0".to_string(),
            })
            .unwrap();

        let log = EventLogRepo::new(pool.clone());
        let forwarder = EventLogForwarder::new(log.clone());
        forwarder.forward(&sample_event("dev-1")).await.unwrap();

        let recent = log.recent("dev-1", 10).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].event_type, "battery_low");
    }

    #[tokio::test]
    async fn fanout_continues_past_failing_sink() {
        let recording = Arc::new(RecordingForwarder::new());
        let fanout = FanoutForwarder::new(vec![Arc::new(FailingForwarder), recording.clone()]);

        fanout.forward(&sample_event("dev-1")).await.unwrap();
        assert_eq!(recording.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn null_forwarder_accepts_everything() {
        NullForwarder.forward(&sample_event("dev-1")).await.unwrap();
    }
}
