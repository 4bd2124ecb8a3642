//! Typed channel for MQTT egress messages
//!
//! Provides a non-blocking way to send domain events to the MQTT publisher.
//! Uses bounded mpsc channels to prevent unbounded memory growth.

use crate::domain::session::{epoch_ms, ParkingSession};
use crate::infra::metrics::{MetricsSummary, METRICS_NUM_BUCKETS};
use serde::Serialize;
use tokio::sync::mpsc;

/// Messages that can be sent to the MQTT publisher
#[derive(Debug)]
pub enum EgressMessage {
    /// Closed session record for persistence
    Session(SessionPayload),
    /// Live access decision (granted/denied)
    Access(AccessEventPayload),
    /// Session lifecycle event (opened, payment due, closed, cancelled)
    SessionEvent(SessionEventPayload),
    /// Barrier state change or fault
    Barrier(BarrierPayload),
    /// Operator-facing alert
    Alert(AlertPayload),
    /// Periodic metrics snapshot
    Metrics(MetricsPayload),
}

/// Payload for closed sessions
#[derive(Debug, Serialize)]
pub struct SessionPayload {
    pub json: String,
}

/// Payload for live access decisions
#[derive(Debug, Clone, Serialize)]
pub struct AccessEventPayload {
    /// Site identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    /// Timestamp (epoch ms)
    pub ts: u64,
    /// Event type (granted, denied)
    pub t: String,
    pub plate: String,
    pub camera: String,
    /// Stable reason code
    pub reason: String,
    /// Resolved direction, if any (entry, exit)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
}

/// Payload for session lifecycle events
#[derive(Debug, Clone, Serialize)]
pub struct SessionEventPayload {
    /// Site identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    /// Timestamp (epoch ms)
    pub ts: u64,
    /// Event type (opened, payment_due, closed, cancelled)
    pub t: String,
    pub sid: String,
    pub plate: String,
    /// Entry time (epoch ms)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_ms: Option<u64>,
    /// Exit time (epoch ms)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_ms: Option<u64>,
    /// Fee due or settled, decimal string
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

/// Payload for barrier state changes and faults
#[derive(Debug, Clone, Serialize)]
pub struct BarrierPayload {
    /// Site identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    /// Timestamp (epoch ms)
    pub ts: u64,
    /// Barrier state (opening, open, closing, closed, fault)
    pub state: String,
    /// Plate that triggered the change, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plate: Option<String>,
    /// Fault reason (fault events only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Payload for operator alerts
#[derive(Debug, Clone, Serialize)]
pub struct AlertPayload {
    /// Site identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    /// Timestamp (epoch ms)
    pub ts: u64,
    /// Alert kind (payment_failed, payment_timeout, fee_manual_entry,
    /// camera_unassigned)
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plate: Option<String>,
    pub detail: String,
}

/// Payload for metrics snapshot
#[derive(Debug, Serialize)]
pub struct MetricsPayload {
    /// Site identifier
    pub site: String,
    /// Timestamp (epoch ms)
    pub ts: u64,
    pub detections_total: u64,
    pub detections_per_sec: f64,
    pub suppressed: u64,
    pub granted: u64,
    pub denied: u64,
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub open_sessions: usize,
    pub payments_requested: u64,
    pub payments_settled: u64,
    pub payments_failed: u64,
    pub barrier_commands: u64,
    pub barrier_faults: u64,
    /// Current barrier state gauge (0=closed .. 4=fault)
    pub barrier_state: u64,
    pub detections_dropped: u64,
    pub avg_latency_us: u64,
    pub max_latency_us: u64,
    /// Decision latency histogram buckets (Prometheus-style exponential)
    pub lat_buckets: [u64; METRICS_NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p95_us: u64,
    pub lat_p99_us: u64,
}

impl MetricsPayload {
    /// Create a metrics payload from a summary
    pub fn from_summary(summary: MetricsSummary, site: String) -> Self {
        Self {
            site,
            ts: epoch_ms(),
            detections_total: summary.detections_total,
            detections_per_sec: summary.detections_per_sec,
            suppressed: summary.detections_suppressed,
            granted: summary.access_granted,
            denied: summary.access_denied,
            sessions_opened: summary.sessions_opened,
            sessions_closed: summary.sessions_closed,
            open_sessions: summary.open_sessions,
            payments_requested: summary.payments_requested,
            payments_settled: summary.payments_settled,
            payments_failed: summary.payments_failed,
            barrier_commands: summary.barrier_commands,
            barrier_faults: summary.barrier_faults,
            barrier_state: summary.barrier_state,
            detections_dropped: summary.detections_dropped,
            avg_latency_us: summary.avg_decision_latency_us,
            max_latency_us: summary.max_decision_latency_us,
            lat_buckets: summary.lat_buckets,
            lat_p50_us: summary.lat_p50_us,
            lat_p95_us: summary.lat_p95_us,
            lat_p99_us: summary.lat_p99_us,
        }
    }
}

/// Sender handle for egress messages
///
/// Clone this to share across multiple producers.
/// Non-blocking - if the channel is full, messages are dropped.
#[derive(Clone)]
pub struct EgressSender {
    tx: mpsc::Sender<EgressMessage>,
    site_id: String,
}

impl EgressSender {
    /// Create a new sender from an mpsc sender
    pub fn new(tx: mpsc::Sender<EgressMessage>, site_id: String) -> Self {
        Self { tx, site_id }
    }

    /// Send a closed session for publishing
    /// Includes site_id in the JSON payload
    pub fn send_session(&self, session: &ParkingSession) {
        let json = session.to_json_with_site(&self.site_id);
        let payload = SessionPayload { json };
        // Use try_send to avoid blocking - drop if channel full
        let _ = self.tx.try_send(EgressMessage::Session(payload));
    }

    /// Send a live access decision
    /// Injects site_id into the payload
    pub fn send_access(&self, mut payload: AccessEventPayload) {
        payload.site = Some(self.site_id.clone());
        let _ = self.tx.try_send(EgressMessage::Access(payload));
    }

    /// Send a session lifecycle event
    /// Injects site_id into the payload
    pub fn send_session_event(&self, mut payload: SessionEventPayload) {
        payload.site = Some(self.site_id.clone());
        let _ = self.tx.try_send(EgressMessage::SessionEvent(payload));
    }

    /// Send a barrier state change or fault
    /// Injects site_id into the payload
    pub fn send_barrier(&self, mut payload: BarrierPayload) {
        payload.site = Some(self.site_id.clone());
        let _ = self.tx.try_send(EgressMessage::Barrier(payload));
    }

    /// Send an operator alert
    /// Injects site_id into the payload
    pub fn send_alert(&self, mut payload: AlertPayload) {
        payload.site = Some(self.site_id.clone());
        let _ = self.tx.try_send(EgressMessage::Alert(payload));
    }

    /// Send a metrics snapshot
    pub fn send_metrics(&self, summary: MetricsSummary) {
        let payload = MetricsPayload::from_summary(summary, self.site_id.clone());
        let _ = self.tx.try_send(EgressMessage::Metrics(payload));
    }
}

/// Create a new egress channel pair
///
/// Returns (sender, receiver) where sender can be cloned and shared.
/// Buffer size determines how many messages can be queued.
/// site_id is included in published payloads for downstream consumers.
pub fn create_egress_channel(
    buffer_size: usize,
    site_id: String,
) -> (EgressSender, mpsc::Receiver<EgressMessage>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (EgressSender::new(tx, site_id), rx)
}
