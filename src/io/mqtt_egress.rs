//! MQTT publisher for egress events
//!
//! Publishes domain events to MQTT topics for downstream consumers
//! (web admin, notifications, reporting):
//! - plategate/sessions - Closed session JSONs (QoS 1)
//! - plategate/access   - Live access decisions (QoS 0)
//! - plategate/barrier  - Barrier state changes and faults (QoS 0)
//! - plategate/alerts   - Operator alerts (QoS 1)
//! - plategate/metrics  - Periodic metrics snapshots (QoS 0)

use crate::infra::config::Config;
use crate::io::egress_channel::EgressMessage;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// MQTT publisher actor
///
/// Receives messages from the egress channel and publishes to MQTT topics.
pub struct MqttPublisher {
    client: AsyncClient,
    rx: mpsc::Receiver<EgressMessage>,
    sessions_topic: String,
    access_topic: String,
    barrier_topic: String,
    alerts_topic: String,
    metrics_topic: String,
}

impl MqttPublisher {
    /// Create a new MQTT publisher
    ///
    /// Connects to the broker at the configured MQTT host/port.
    pub fn new(config: &Config, rx: mpsc::Receiver<EgressMessage>) -> Self {
        let client_id = format!("plategate-egress-{}", std::process::id());
        let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
        mqttoptions.set_keep_alive(Duration::from_secs(30));
        mqttoptions.set_clean_session(true);

        // Set credentials if configured
        if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
            mqttoptions.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqttoptions, 100);

        // Spawn the eventloop handler
        tokio::spawn(async move {
            let mut eventloop = eventloop;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_egress_connected");
                    }
                    Ok(Event::Incoming(Packet::PubAck(_))) => {
                        // QoS 1 acknowledgement received
                        debug!("mqtt_egress_puback");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt_egress_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Self {
            client,
            rx,
            sessions_topic: config.mqtt_egress_sessions_topic().to_string(),
            access_topic: config.mqtt_egress_access_topic().to_string(),
            barrier_topic: config.mqtt_egress_barrier_topic().to_string(),
            alerts_topic: config.mqtt_egress_alerts_topic().to_string(),
            metrics_topic: config.mqtt_egress_metrics_topic().to_string(),
        }
    }

    /// Run the publisher loop
    ///
    /// Processes messages from the channel and publishes to MQTT.
    /// Runs until shutdown signal is received.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            sessions = %self.sessions_topic,
            access = %self.access_topic,
            barrier = %self.barrier_topic,
            alerts = %self.alerts_topic,
            metrics = %self.metrics_topic,
            "mqtt_egress_started"
        );

        loop {
            tokio::select! {
                // Check for shutdown
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("mqtt_egress_shutdown");
                        // Drain remaining messages
                        while let Ok(msg) = self.rx.try_recv() {
                            self.publish_message(msg).await;
                        }
                        return;
                    }
                }
                // Process messages
                Some(msg) = self.rx.recv() => {
                    self.publish_message(msg).await;
                }
            }
        }
    }

    async fn publish_message(&self, msg: EgressMessage) {
        match msg {
            EgressMessage::Session(payload) => {
                // Use QoS 1 for session records (at-least-once delivery)
                if let Err(e) = self
                    .client
                    .publish(&self.sessions_topic, QoS::AtLeastOnce, false, payload.json.as_bytes())
                    .await
                {
                    error!(error = %e, "mqtt_egress_session_failed");
                }
            }
            EgressMessage::Access(payload) => {
                // Use QoS 0 for live events (fire-and-forget)
                if let Ok(json) = serde_json::to_string(&payload) {
                    if let Err(e) = self
                        .client
                        .publish(&self.access_topic, QoS::AtMostOnce, false, json.as_bytes())
                        .await
                    {
                        debug!(error = %e, "mqtt_egress_access_failed");
                    }
                }
            }
            EgressMessage::SessionEvent(payload) => {
                // Session lifecycle rides the access topic at QoS 0
                if let Ok(json) = serde_json::to_string(&payload) {
                    if let Err(e) = self
                        .client
                        .publish(&self.access_topic, QoS::AtMostOnce, false, json.as_bytes())
                        .await
                    {
                        debug!(error = %e, "mqtt_egress_session_event_failed");
                    }
                }
            }
            EgressMessage::Barrier(payload) => {
                if let Ok(json) = serde_json::to_string(&payload) {
                    if let Err(e) = self
                        .client
                        .publish(&self.barrier_topic, QoS::AtMostOnce, false, json.as_bytes())
                        .await
                    {
                        debug!(error = %e, "mqtt_egress_barrier_failed");
                    }
                }
            }
            EgressMessage::Alert(payload) => {
                // Operator alerts must not be lost: QoS 1
                if let Ok(json) = serde_json::to_string(&payload) {
                    if let Err(e) = self
                        .client
                        .publish(&self.alerts_topic, QoS::AtLeastOnce, false, json.as_bytes())
                        .await
                    {
                        error!(error = %e, "mqtt_egress_alert_failed");
                    }
                }
            }
            EgressMessage::Metrics(payload) => {
                if let Ok(json) = serde_json::to_string(&payload) {
                    if let Err(e) = self
                        .client
                        .publish(&self.metrics_topic, QoS::AtMostOnce, false, json.as_bytes())
                        .await
                    {
                        debug!(error = %e, "mqtt_egress_metrics_failed");
                    }
                }
            }
        }
    }
}
