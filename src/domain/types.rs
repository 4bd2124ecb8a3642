//! Shared types for the plate-recognition access core

use serde::{Deserialize, Deserializer, Serialize};
use std::time::Instant;

/// Normalized license plate: uppercase, whitespace and punctuation stripped.
///
/// The raw OCR string never travels past the ingest boundary; everything
/// downstream (debounce keys, session lookups, authorization) works on the
/// normalized form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct PlateNumber(String);

impl PlateNumber {
    /// Normalize a raw OCR reading. Returns `None` when nothing
    /// alphanumeric survives (empty reads are sensor noise, not plates).
    pub fn normalize(raw: &str) -> Option<Self> {
        let cleaned: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_uppercase())
            .collect();
        if cleaned.is_empty() {
            None
        } else {
            Some(Self(cleaned))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PlateNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype wrapper for camera identifiers to provide type safety
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct CameraId(pub String);

impl CameraId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CameraId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Camera message structure for parsing
#[derive(Debug, Deserialize)]
pub struct CameraMessage {
    #[serde(default)]
    pub detections: Vec<WireDetection>,
}

#[derive(Debug, Deserialize)]
pub struct WireDetection {
    pub plate: String,
    pub confidence: f64,
    pub camera: String,
    /// Timestamp - can be ISO 8601 string or epoch milliseconds integer
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub time: TimestampValue,
    #[serde(default)]
    pub image: Option<String>,
}

/// Timestamp that can be either ISO 8601 string or epoch milliseconds
#[derive(Debug, Clone, Default)]
pub enum TimestampValue {
    #[default]
    None,
    IsoString(String),
    EpochMs(u64),
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<TimestampValue, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct TimestampVisitor;

    impl<'de> Visitor<'de> for TimestampVisitor {
        type Value = TimestampValue;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string or integer timestamp")
        }

        fn visit_str<E>(self, value: &str) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::IsoString(value.to_string()))
        }

        fn visit_string<E>(self, value: String) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::IsoString(value))
        }

        fn visit_u64<E>(self, value: u64) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::EpochMs(value))
        }

        fn visit_i64<E>(self, value: i64) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            let epoch_ms = u64::try_from(value).unwrap_or(0);
            Ok(TimestampValue::EpochMs(epoch_ms))
        }
    }

    deserializer.deserialize_any(TimestampVisitor)
}

/// One OCR reading of a plate, normalized and ready for the pipeline.
///
/// Ephemeral: consumed immediately, never persisted by the core (the raw
/// detection log is a collaborator concern).
#[derive(Debug, Clone)]
pub struct PlateDetectionEvent {
    pub plate: PlateNumber,
    /// OCR confidence, clamped to [0, 1] at ingest
    pub confidence: f64,
    pub camera: CameraId,
    /// Epoch ms from the camera frame (0 when the camera sent nothing usable)
    pub event_time: u64,
    pub received_at: Instant,
    /// Opaque handle to the frame snapshot, if the camera supplied one
    pub image_ref: Option<String>,
}

/// Travel direction resolved for a detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Entry,
    Exit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Entry => "entry",
            Direction::Exit => "exit",
        }
    }
}

/// Stable reason code attached to every grant/denial event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    /// Plate is on the authorization list and inside its validity window
    Authorized,
    /// Unauthorized plate admitted to a public pay car park, flagged for billing
    Visitor,
    Unauthorized,
    /// Exit withheld until the session's payment completes
    PaymentDue,
    /// Exit replayed while a payment is already in flight
    PaymentPending,
    /// Exit-camera detection with no session on record
    NoActiveSession,
    /// Entry-camera detection while a session is already active
    SessionConflict,
    /// Detection from a camera assigned to neither lane (manual review)
    CameraUnassigned,
    /// Exit with nothing to collect
    FreeExit,
    /// Deferred grant after payment settled
    PaidExit,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionReason::Authorized => "authorized",
            DecisionReason::Visitor => "visitor",
            DecisionReason::Unauthorized => "unauthorized",
            DecisionReason::PaymentDue => "payment_due",
            DecisionReason::PaymentPending => "payment_pending",
            DecisionReason::NoActiveSession => "no_active_session",
            DecisionReason::SessionConflict => "session_conflict",
            DecisionReason::CameraUnassigned => "camera_unassigned",
            DecisionReason::FreeExit => "free_exit",
            DecisionReason::PaidExit => "paid_exit",
        }
    }
}

/// Session mutation the pipeline must apply for a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    OpenSession,
    CloseSession,
    /// Move the session to pending-payment and request the fee; barrier stays closed
    RequestPayment,
    None,
}

/// Outcome of the access decision for one admitted detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub grant: bool,
    pub reason: DecisionReason,
    pub direction: Option<Direction>,
    pub action: SessionAction,
}

impl Decision {
    pub fn deny(reason: DecisionReason, direction: Option<Direction>) -> Self {
        Self { grant: false, reason, direction, action: SessionAction::None }
    }
}

/// Payment transaction state as reported by the processor collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentState {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl PaymentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentState::Pending => "pending",
            PaymentState::Processing => "processing",
            PaymentState::Completed => "completed",
            PaymentState::Failed => "failed",
            PaymentState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentState::Completed | PaymentState::Failed | PaymentState::Cancelled)
    }
}

impl std::str::FromStr for PaymentState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(PaymentState::Pending),
            "PROCESSING" => Ok(PaymentState::Processing),
            "COMPLETED" => Ok(PaymentState::Completed),
            "FAILED" => Ok(PaymentState::Failed),
            "CANCELLED" => Ok(PaymentState::Cancelled),
            _ => Err(()),
        }
    }
}

/// Terminal notification delivered through the payment listener
#[derive(Debug, Clone)]
pub struct PaymentUpdate {
    pub transaction_id: String,
    pub state: PaymentState,
    pub received_at: Instant,
}
