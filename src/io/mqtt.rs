//! MQTT client for receiving camera detection data
//!
//! LPR cameras publish detection frames as JSON; each frame carries zero or
//! more plate reads. Reads are normalized here and forwarded to the
//! pipeline via a bounded channel - the MQTT eventloop must never block on
//! a slow consumer.

use crate::domain::session::epoch_ms;
use crate::domain::types::{
    CameraId, CameraMessage, PlateDetectionEvent, PlateNumber, TimestampValue,
};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Start the MQTT client and send parsed detections to the channel
///
/// Events are sent via try_send to avoid blocking the MQTT eventloop.
/// Dropped events are counted in metrics and logged (rate-limited).
pub async fn start_mqtt_client(
    config: &Config,
    event_tx: mpsc::Sender<PlateDetectionEvent>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut mqttoptions = MqttOptions::new("plategate", config.mqtt_host(), config.mqtt_port());
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    // Set credentials if configured
    if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
        mqttoptions.set_credentials(username, password);
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);
    client.subscribe(config.mqtt_topic(), QoS::AtMostOnce).await?;

    info!(topic = %config.mqtt_topic(), host = %config.mqtt_host(), port = %config.mqtt_port(), "MQTT client subscribed");

    // Rate-limit drop warnings to 1 per second
    let mut last_drop_warn = Instant::now() - Duration::from_secs(2);

    loop {
        tokio::select! {
            // Check for shutdown signal
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("mqtt_shutdown");
                    return Ok(());
                }
            }
            // Process MQTT events
            result = eventloop.poll() => {
                match result {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let received_at = Instant::now();
                        let topic = &publish.topic;

                        match std::str::from_utf8(&publish.payload) {
                            Ok(json_str) => {
                                let events = parse_camera_message(json_str, received_at);
                                if !events.is_empty() {
                                    debug!(topic = %topic, event_count = %events.len(), "MQTT message with detections");
                                }
                                for event in events {
                                    debug!(plate = %event.plate, camera = %event.camera, "Parsed detection");
                                    // received-counter is recorded by the pipeline;
                                    // only drops are counted here
                                    if let Err(e) = event_tx.try_send(event) {
                                        match e {
                                            TrySendError::Full(_) => {
                                                metrics.record_detection_dropped();
                                                if last_drop_warn.elapsed() > Duration::from_secs(1) {
                                                    warn!("detection_dropped: channel full");
                                                    last_drop_warn = Instant::now();
                                                }
                                            }
                                            TrySendError::Closed(_) => {
                                                warn!("Detection channel closed");
                                                return Ok(());
                                            }
                                        }
                                    }
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "Invalid UTF-8 in MQTT payload");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("MQTT connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "MQTT error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}

/// Parse a camera JSON message and extract detection events.
///
/// Unparseable frames and empty/garbage plate reads are dropped with a
/// debug log - the raw detection log is a collaborator concern.
pub fn parse_camera_message(json_str: &str, received_at: Instant) -> Vec<PlateDetectionEvent> {
    let message: CameraMessage = match serde_json::from_str(json_str) {
        Ok(m) => m,
        Err(e) => {
            debug!(error = %e, "Failed to parse camera message");
            return Vec::new();
        }
    };

    let mut events = Vec::with_capacity(message.detections.len());
    for detection in message.detections {
        let Some(plate) = PlateNumber::normalize(&detection.plate) else {
            debug!(raw = %detection.plate, "detection_plate_unparseable");
            continue;
        };

        events.push(PlateDetectionEvent {
            plate,
            confidence: detection.confidence.clamp(0.0, 1.0),
            camera: CameraId(detection.camera),
            event_time: timestamp_to_epoch_ms(&detection.time),
            received_at,
            image_ref: detection.image,
        });
    }

    events
}

/// Parse ISO 8601 timestamp to epoch milliseconds
fn parse_iso_time(time_str: &str) -> Option<u64> {
    // Parse "2026-01-05T16:41:30.048+00:00" format (RFC 3339)
    OffsetDateTime::parse(time_str, &Rfc3339)
        .ok()
        .map(|dt| (dt.unix_timestamp_nanos() / 1_000_000) as u64)
}

/// Extract epoch milliseconds from TimestampValue.
/// Unusable timestamps fall back to receive time so the debounce window
/// still has something monotonic-ish to work with.
fn timestamp_to_epoch_ms(ts: &TimestampValue) -> u64 {
    match ts {
        TimestampValue::EpochMs(ms) => *ms,
        TimestampValue::IsoString(s) => parse_iso_time(s).unwrap_or_else(epoch_ms),
        TimestampValue::None => epoch_ms(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_detection() {
        let json = r#"{
            "detections": [{
                "plate": "ab-123",
                "confidence": 0.92,
                "camera": "lane-in",
                "time": "2026-01-05T16:41:30.048+00:00",
                "image": "frame-831.jpg"
            }]
        }"#;

        let events = parse_camera_message(json, Instant::now());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].plate.as_str(), "AB123");
        assert_eq!(events[0].camera, CameraId("lane-in".into()));
        assert!((events[0].confidence - 0.92).abs() < f64::EPSILON);
        assert_eq!(events[0].image_ref.as_deref(), Some("frame-831.jpg"));
        // event_time parsed from ISO 8601
        assert!(events[0].event_time > 1_767_000_000_000);
    }

    #[test]
    fn test_parse_epoch_ms_timestamp() {
        let json = r#"{
            "detections": [{
                "plate": "XYZ1",
                "confidence": 0.7,
                "camera": "lane-out",
                "time": 1736012345678
            }]
        }"#;

        let events = parse_camera_message(json, Instant::now());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_time, 1736012345678);
    }

    #[test]
    fn test_parse_multiple_detections() {
        let json = r#"{
            "detections": [
                {"plate": "AB123", "confidence": 0.9, "camera": "lane-in"},
                {"plate": "CD456", "confidence": 0.8, "camera": "lane-out"}
            ]
        }"#;

        let events = parse_camera_message(json, Instant::now());
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].plate.as_str(), "AB123");
        assert_eq!(events[1].plate.as_str(), "CD456");
    }

    #[test]
    fn test_confidence_clamped() {
        let json = r#"{
            "detections": [{"plate": "AB123", "confidence": 1.7, "camera": "cam"}]
        }"#;

        let events = parse_camera_message(json, Instant::now());
        assert_eq!(events[0].confidence, 1.0);
    }

    #[test]
    fn test_garbage_plate_dropped() {
        let json = r#"{
            "detections": [
                {"plate": "???", "confidence": 0.2, "camera": "cam"},
                {"plate": "OK1", "confidence": 0.9, "camera": "cam"}
            ]
        }"#;

        let events = parse_camera_message(json, Instant::now());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].plate.as_str(), "OK1");
    }

    #[test]
    fn test_parse_invalid_json() {
        assert!(parse_camera_message("not json", Instant::now()).is_empty());
    }

    #[test]
    fn test_parse_empty_detections() {
        assert!(parse_camera_message(r#"{"detections": []}"#, Instant::now()).is_empty());
        assert!(parse_camera_message(r#"{}"#, Instant::now()).is_empty());
    }

    #[test]
    fn test_parse_iso_time() {
        let ts = parse_iso_time("2026-01-05T16:41:30.048+00:00");
        assert!(ts.is_some());
        let ms = ts.unwrap();
        assert!(ms > 1767000000000, "timestamp should be in 2026");
        assert!(ms < 1800000000000, "timestamp should be before 2027");

        assert!(parse_iso_time("not a timestamp").is_none());
        assert!(parse_iso_time("").is_none());
    }
}
