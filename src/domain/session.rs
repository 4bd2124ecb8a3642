//! Parking session data model
//!
//! A session is the money-bearing record of one vehicle's stay: opened on
//! entry, priced on exit, settled by payment, retained afterwards for
//! reporting. Terminal states are never deleted by the core; archival is an
//! external concern.

use crate::domain::types::{CameraId, PlateNumber};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use smallvec::SmallVec;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a new UUIDv7 (time-sortable)
pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    PendingPayment,
    Paid,
    Cancelled,
}

impl SessionStatus {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::PendingPayment => "pending_payment",
            SessionStatus::Paid => "paid",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    /// Paid and Cancelled are terminal; no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Paid | SessionStatus::Cancelled)
    }

    /// Statuses that count against the one-session-per-plate invariant
    pub fn is_open(&self) -> bool {
        matches!(self, SessionStatus::Active | SessionStatus::PendingPayment)
    }
}

/// How a settled session was paid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentMethod {
    /// Payment terminal transaction
    Terminal,
    /// Operator override (cash, invoice)
    Manual,
    /// Nothing was due
    Free,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Terminal => "terminal",
            PaymentMethod::Manual => "manual",
            PaymentMethod::Free => "free",
        }
    }
}

/// Event types that can occur in a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEventType {
    Entry,
    ExitSeen,
    PaymentRequested,
    PaymentSettled,
    PaymentFailed,
    PaymentTimeout,
    ManualSettle,
    Closed,
}

impl SessionEventType {
    /// Convert to string representation for JSON serialization
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEventType::Entry => "entry",
            SessionEventType::ExitSeen => "exit_seen",
            SessionEventType::PaymentRequested => "payment_requested",
            SessionEventType::PaymentSettled => "payment_settled",
            SessionEventType::PaymentFailed => "payment_failed",
            SessionEventType::PaymentTimeout => "payment_timeout",
            SessionEventType::ManualSettle => "manual_settle",
            SessionEventType::Closed => "closed",
        }
    }
}

/// A single event in a session's history
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub t: SessionEventType,
    pub ts: u64,
    pub extra: Option<String>,
}

impl SessionEvent {
    pub fn new(event_type: SessionEventType, ts: u64) -> Self {
        Self { t: event_type, ts, extra: None }
    }

    pub fn with_extra(mut self, extra: &str) -> Self {
        self.extra = Some(extra.to_string());
        self
    }

    fn to_json_value(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        obj.insert("t".to_string(), serde_json::Value::String(self.t.as_str().to_string()));
        obj.insert("ts".to_string(), serde_json::Value::Number(self.ts.into()));
        if let Some(x) = &self.extra {
            obj.insert("x".to_string(), serde_json::Value::String(x.clone()));
        }
        serde_json::Value::Object(obj)
    }
}

/// One vehicle's stay, entry through settlement
#[derive(Debug, Clone)]
pub struct ParkingSession {
    pub sid: String, // UUIDv7 session ID
    pub plate: PlateNumber,
    pub status: SessionStatus,
    /// False for visitor sessions in public car parks (billing flag)
    pub authorized: bool,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    pub fee: Option<Decimal>,
    pub currency: Option<String>,
    pub payment_method: Option<PaymentMethod>,
    /// Processor transaction reference while a payment is in flight
    pub transaction_id: Option<String>,
    /// When the pending payment was requested (timeout sweep anchor)
    pub payment_requested_at: Option<DateTime<Utc>>,
    pub camera_entry: Option<CameraId>,
    pub camera_exit: Option<CameraId>,
    pub events: SmallVec<[SessionEvent; 4]>,
}

impl ParkingSession {
    /// Open a new session at entry time.
    ///
    /// # Example
    ///
    /// ```
    /// use plategate::domain::session::{ParkingSession, SessionStatus};
    /// use plategate::domain::types::{CameraId, PlateNumber};
    ///
    /// let plate = PlateNumber::normalize("AB123").unwrap();
    /// let session = ParkingSession::open(plate, CameraId("lane-in".into()), true);
    /// assert_eq!(session.status, SessionStatus::Active);
    /// assert!(session.exit_time.is_none());
    /// ```
    pub fn open(plate: PlateNumber, camera: CameraId, authorized: bool) -> Self {
        let now = Utc::now();
        let mut session = Self {
            sid: new_uuid_v7(),
            plate,
            status: SessionStatus::Active,
            authorized,
            entry_time: now,
            exit_time: None,
            fee: None,
            currency: None,
            payment_method: None,
            transaction_id: None,
            payment_requested_at: None,
            camera_entry: Some(camera),
            camera_exit: None,
            events: SmallVec::new(),
        };
        session.add_event(SessionEvent::new(SessionEventType::Entry, epoch_ms()));
        session
    }

    pub fn add_event(&mut self, event: SessionEvent) {
        self.events.push(event);
    }

    /// Entry timestamp as epoch milliseconds
    pub fn entry_ms(&self) -> u64 {
        self.entry_time.timestamp_millis().max(0) as u64
    }

    /// Convert to short-key JSON string (without site)
    pub fn to_json(&self) -> String {
        self.to_json_with_site_opt(None)
    }

    /// Convert to short-key JSON string with site_id included
    pub fn to_json_with_site(&self, site_id: &str) -> String {
        self.to_json_with_site_opt(Some(site_id))
    }

    fn to_json_with_site_opt(&self, site_id: Option<&str>) -> String {
        let mut obj = serde_json::Map::new();

        if let Some(site) = site_id {
            obj.insert("site".to_string(), serde_json::Value::String(site.to_string()));
        }

        obj.insert("sid".to_string(), serde_json::Value::String(self.sid.clone()));
        obj.insert(
            "plate".to_string(),
            serde_json::Value::String(self.plate.as_str().to_string()),
        );
        obj.insert(
            "status".to_string(),
            serde_json::Value::String(self.status.as_str().to_string()),
        );
        obj.insert("auth".to_string(), serde_json::Value::Bool(self.authorized));
        obj.insert("t0".to_string(), serde_json::Value::Number(self.entry_ms().into()));
        if let Some(exit) = self.exit_time {
            let ms = exit.timestamp_millis().max(0) as u64;
            obj.insert("t1".to_string(), serde_json::Value::Number(ms.into()));
        }
        if let Some(fee) = self.fee {
            obj.insert("fee".to_string(), serde_json::Value::String(fee.to_string()));
        }
        if let Some(cur) = &self.currency {
            obj.insert("cur".to_string(), serde_json::Value::String(cur.clone()));
        }
        if let Some(method) = self.payment_method {
            obj.insert(
                "method".to_string(),
                serde_json::Value::String(method.as_str().to_string()),
            );
        }
        if let Some(tx) = &self.transaction_id {
            obj.insert("tx".to_string(), serde_json::Value::String(tx.clone()));
        }
        if let Some(cam) = &self.camera_entry {
            obj.insert("cam_in".to_string(), serde_json::Value::String(cam.0.clone()));
        }
        if let Some(cam) = &self.camera_exit {
            obj.insert("cam_out".to_string(), serde_json::Value::String(cam.0.clone()));
        }

        let events: Vec<serde_json::Value> =
            self.events.iter().map(|e| e.to_json_value()).collect();
        obj.insert("ev".to_string(), serde_json::Value::Array(events));

        serde_json::Value::Object(obj).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn plate(s: &str) -> PlateNumber {
        PlateNumber::normalize(s).unwrap()
    }

    #[test]
    fn test_open_session() {
        let session = ParkingSession::open(plate("AB123"), CameraId("cam-1".into()), true);

        assert!(!session.sid.is_empty());
        assert_eq!(session.status, SessionStatus::Active);
        assert!(session.authorized);
        assert!(session.exit_time.is_none());
        assert!(session.fee.is_none());
        assert_eq!(session.camera_entry, Some(CameraId("cam-1".into())));
        assert_eq!(session.events.len(), 1);
        assert_eq!(session.events[0].t, SessionEventType::Entry);
    }

    #[test]
    fn test_status_predicates() {
        assert!(SessionStatus::Active.is_open());
        assert!(SessionStatus::PendingPayment.is_open());
        assert!(!SessionStatus::Paid.is_open());
        assert!(SessionStatus::Paid.is_terminal());
        assert!(SessionStatus::Cancelled.is_terminal());
        assert!(!SessionStatus::Active.is_terminal());
    }

    #[test]
    fn test_session_event_builder() {
        let event = SessionEvent::new(SessionEventType::PaymentRequested, 1736012345678)
            .with_extra("fee=4.00");

        assert_eq!(event.t, SessionEventType::PaymentRequested);
        assert_eq!(event.ts, 1736012345678);
        assert_eq!(event.extra, Some("fee=4.00".to_string()));
    }

    #[test]
    fn test_session_to_json() {
        let mut session = ParkingSession::open(plate("XYZ1"), CameraId("lane-in".into()), true);
        session.status = SessionStatus::Paid;
        session.exit_time = Some(Utc::now());
        session.fee = Some(dec!(4.00));
        session.currency = Some("USD".to_string());
        session.payment_method = Some(PaymentMethod::Terminal);
        session.transaction_id = Some("tx-42".to_string());
        session.camera_exit = Some(CameraId("lane-out".into()));
        session.add_event(SessionEvent::new(SessionEventType::Closed, epoch_ms()));

        let json = session.to_json_with_site("lot-1");
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed["site"], "lot-1");
        assert_eq!(parsed["sid"], session.sid);
        assert_eq!(parsed["plate"], "XYZ1");
        assert_eq!(parsed["status"], "paid");
        assert_eq!(parsed["auth"], true);
        assert_eq!(parsed["fee"], "4.00");
        assert_eq!(parsed["cur"], "USD");
        assert_eq!(parsed["method"], "terminal");
        assert_eq!(parsed["tx"], "tx-42");
        assert_eq!(parsed["cam_in"], "lane-in");
        assert_eq!(parsed["cam_out"], "lane-out");
        assert!(parsed["t1"].is_number());

        let events = parsed["ev"].as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["t"], "entry");
        assert_eq!(events[1]["t"], "closed");
    }

    #[test]
    fn test_uuid_v7_generation() {
        let uuid1 = new_uuid_v7();
        let uuid2 = new_uuid_v7();

        assert!(!uuid1.is_empty());
        assert_ne!(uuid1, uuid2);
        // UUIDv7 should be 36 chars with hyphens
        assert_eq!(uuid1.len(), 36);
    }
}
