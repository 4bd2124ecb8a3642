//! Access decision engine
//!
//! Pure decision function: given an admitted detection plus the lookups the
//! pipeline performed under the plate lock (authorization record, active
//! session), produce a grant/deny with a stable reason code and the session
//! mutation to apply. No IO and no clock access - `now` is an argument -
//! so every branch is unit-testable.

use crate::domain::session::{ParkingSession, SessionStatus};
use crate::domain::types::{
    Decision, DecisionReason, Direction, PlateDetectionEvent, SessionAction,
};
use crate::infra::config::{AccessMode, Config, LaneMode, PaymentRequirement};
use crate::services::authorization::AuthorizationRecord;
use chrono::{DateTime, Utc};

pub struct AccessDecisionEngine {
    lane: LaneMode,
    access_mode: AccessMode,
    payment: PaymentRequirement,
    grace_minutes: u64,
}

impl AccessDecisionEngine {
    pub fn new(
        lane: LaneMode,
        access_mode: AccessMode,
        payment: PaymentRequirement,
        grace_minutes: u64,
    ) -> Self {
        Self { lane, access_mode, payment, grace_minutes }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.lane_mode().clone(),
            config.access_mode(),
            config.payment_requirement(),
            config.fee_policy().grace_minutes,
        )
    }

    /// Decide grant/deny for one admitted detection.
    ///
    /// `active` is the plate's open session, if any; the caller holds the
    /// plate lock, so the session cannot change under this decision.
    pub fn decide(
        &self,
        event: &PlateDetectionEvent,
        auth: Option<&AuthorizationRecord>,
        active: Option<&ParkingSession>,
        now: DateTime<Utc>,
    ) -> Decision {
        let authorized = auth.map(|record| record.permits(now)).unwrap_or(false);

        let direction = match &self.lane {
            // Session presence defines direction in single-camera mode
            LaneMode::Single => {
                if active.is_some() {
                    Direction::Exit
                } else {
                    Direction::Entry
                }
            }
            // Camera identity is authoritative in dual mode
            LaneMode::Dual { entry, exit } => {
                if event.camera == *entry {
                    Direction::Entry
                } else if event.camera == *exit {
                    Direction::Exit
                } else {
                    // Assigned to neither lane: manual-review path, never a
                    // guessed direction
                    return Decision::deny(DecisionReason::CameraUnassigned, None);
                }
            }
        };

        match direction {
            Direction::Entry => self.decide_entry(authorized, active),
            Direction::Exit => self.decide_exit(active, now),
        }
    }

    fn decide_entry(&self, authorized: bool, active: Option<&ParkingSession>) -> Decision {
        // Entry camera fired while a session is open: anomaly, not a new
        // session (single-camera mode never reaches this branch)
        if active.is_some() {
            return Decision::deny(DecisionReason::SessionConflict, Some(Direction::Entry));
        }

        if authorized {
            return Decision {
                grant: true,
                reason: DecisionReason::Authorized,
                direction: Some(Direction::Entry),
                action: SessionAction::OpenSession,
            };
        }

        match self.access_mode {
            AccessMode::AuthorizedOnly => {
                Decision::deny(DecisionReason::Unauthorized, Some(Direction::Entry))
            }
            // Public pay car park: admit, flag as visitor for billing
            AccessMode::Public => Decision {
                grant: true,
                reason: DecisionReason::Visitor,
                direction: Some(Direction::Entry),
                action: SessionAction::OpenSession,
            },
        }
    }

    fn decide_exit(&self, active: Option<&ParkingSession>, now: DateTime<Utc>) -> Decision {
        let Some(session) = active else {
            // Exit camera fired with nothing on record: anomaly, denied
            return Decision::deny(DecisionReason::NoActiveSession, Some(Direction::Exit));
        };

        // Replayed exit while a payment is already in flight: no new
        // transaction, no barrier request
        if session.status == SessionStatus::PendingPayment {
            return Decision::deny(DecisionReason::PaymentPending, Some(Direction::Exit));
        }

        let payment_due = match self.payment {
            PaymentRequirement::Never => false,
            PaymentRequirement::Always => true,
            PaymentRequirement::AfterGrace => {
                let elapsed = now.signed_duration_since(session.entry_time);
                elapsed.num_seconds() > (self.grace_minutes * 60) as i64
            }
        };

        if payment_due {
            Decision {
                grant: false,
                reason: DecisionReason::PaymentDue,
                direction: Some(Direction::Exit),
                action: SessionAction::RequestPayment,
            }
        } else {
            Decision {
                grant: true,
                reason: DecisionReason::FreeExit,
                direction: Some(Direction::Exit),
                action: SessionAction::CloseSession,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{CameraId, PlateNumber};
    use chrono::Duration;
    use std::time::Instant;

    fn plate(s: &str) -> PlateNumber {
        PlateNumber::normalize(s).unwrap()
    }

    fn detection(p: &str, camera: &str) -> PlateDetectionEvent {
        PlateDetectionEvent {
            plate: plate(p),
            confidence: 0.9,
            camera: CameraId(camera.to_string()),
            event_time: 1_000_000,
            received_at: Instant::now(),
            image_ref: None,
        }
    }

    fn auth_record(p: &str) -> AuthorizationRecord {
        AuthorizationRecord {
            plate: plate(p),
            owner: "owner".to_string(),
            vehicle_type: None,
            authorized: true,
            valid_from: None,
            valid_until: None,
        }
    }

    fn session(p: &str, minutes_ago: i64) -> ParkingSession {
        let mut s = ParkingSession::open(plate(p), CameraId("lane-in".into()), true);
        s.entry_time = Utc::now() - Duration::minutes(minutes_ago);
        s
    }

    fn single_engine(access: AccessMode, payment: PaymentRequirement) -> AccessDecisionEngine {
        AccessDecisionEngine::new(LaneMode::Single, access, payment, 15)
    }

    fn dual_engine(payment: PaymentRequirement) -> AccessDecisionEngine {
        AccessDecisionEngine::new(
            LaneMode::Dual {
                entry: CameraId("lane-in".into()),
                exit: CameraId("lane-out".into()),
            },
            AccessMode::AuthorizedOnly,
            payment,
            15,
        )
    }

    #[test]
    fn test_single_mode_entry_when_no_session() {
        let engine = single_engine(AccessMode::AuthorizedOnly, PaymentRequirement::Never);
        let record = auth_record("XYZ1");

        let decision = engine.decide(&detection("XYZ1", "cam"), Some(&record), None, Utc::now());

        assert!(decision.grant);
        assert_eq!(decision.reason, DecisionReason::Authorized);
        assert_eq!(decision.direction, Some(Direction::Entry));
        assert_eq!(decision.action, SessionAction::OpenSession);
    }

    #[test]
    fn test_single_mode_exit_when_session_active() {
        let engine = single_engine(AccessMode::AuthorizedOnly, PaymentRequirement::Never);
        let record = auth_record("XYZ1");
        let active = session("XYZ1", 30);

        let decision =
            engine.decide(&detection("XYZ1", "cam"), Some(&record), Some(&active), Utc::now());

        assert!(decision.grant);
        assert_eq!(decision.reason, DecisionReason::FreeExit);
        assert_eq!(decision.action, SessionAction::CloseSession);
    }

    #[test]
    fn test_unauthorized_denied_in_list_only_park() {
        let engine = single_engine(AccessMode::AuthorizedOnly, PaymentRequirement::Never);

        let decision = engine.decide(&detection("ZZ999", "cam"), None, None, Utc::now());

        assert!(!decision.grant);
        assert_eq!(decision.reason, DecisionReason::Unauthorized);
        assert_eq!(decision.action, SessionAction::None);
    }

    #[test]
    fn test_unauthorized_admitted_as_visitor_in_public_park() {
        let engine = single_engine(AccessMode::Public, PaymentRequirement::Always);

        let decision = engine.decide(&detection("ZZ999", "cam"), None, None, Utc::now());

        assert!(decision.grant);
        assert_eq!(decision.reason, DecisionReason::Visitor);
        assert_eq!(decision.action, SessionAction::OpenSession);
    }

    #[test]
    fn test_expired_authorization_is_unauthorized() {
        let engine = single_engine(AccessMode::AuthorizedOnly, PaymentRequirement::Never);
        let mut record = auth_record("XYZ1");
        record.valid_until = Some(Utc::now() - Duration::days(1));

        let decision = engine.decide(&detection("XYZ1", "cam"), Some(&record), None, Utc::now());

        assert!(!decision.grant);
        assert_eq!(decision.reason, DecisionReason::Unauthorized);
    }

    #[test]
    fn test_exit_with_payment_always_withholds_grant() {
        let engine = dual_engine(PaymentRequirement::Always);
        let record = auth_record("XYZ1");
        let active = session("XYZ1", 90);

        let decision = engine.decide(
            &detection("XYZ1", "lane-out"),
            Some(&record),
            Some(&active),
            Utc::now(),
        );

        assert!(!decision.grant);
        assert_eq!(decision.reason, DecisionReason::PaymentDue);
        assert_eq!(decision.action, SessionAction::RequestPayment);
    }

    #[test]
    fn test_exit_within_grace_closes_free() {
        let engine = dual_engine(PaymentRequirement::AfterGrace);
        let active = session("XYZ1", 10);

        let decision =
            engine.decide(&detection("XYZ1", "lane-out"), None, Some(&active), Utc::now());

        assert!(decision.grant);
        assert_eq!(decision.reason, DecisionReason::FreeExit);
        assert_eq!(decision.action, SessionAction::CloseSession);
    }

    #[test]
    fn test_exit_past_grace_requires_payment() {
        let engine = dual_engine(PaymentRequirement::AfterGrace);
        let active = session("XYZ1", 45);

        let decision =
            engine.decide(&detection("XYZ1", "lane-out"), None, Some(&active), Utc::now());

        assert!(!decision.grant);
        assert_eq!(decision.action, SessionAction::RequestPayment);
    }

    #[test]
    fn test_exit_replay_during_pending_payment_is_noop() {
        let engine = dual_engine(PaymentRequirement::Always);
        let mut active = session("XYZ1", 90);
        active.status = SessionStatus::PendingPayment;

        let decision =
            engine.decide(&detection("XYZ1", "lane-out"), None, Some(&active), Utc::now());

        assert!(!decision.grant);
        assert_eq!(decision.reason, DecisionReason::PaymentPending);
        assert_eq!(decision.action, SessionAction::None);
    }

    #[test]
    fn test_dual_mode_exit_camera_without_session_is_anomaly() {
        let engine = dual_engine(PaymentRequirement::Never);

        let decision = engine.decide(&detection("XYZ1", "lane-out"), None, None, Utc::now());

        assert!(!decision.grant);
        assert_eq!(decision.reason, DecisionReason::NoActiveSession);
        assert_eq!(decision.action, SessionAction::None);
    }

    #[test]
    fn test_dual_mode_entry_camera_with_session_is_conflict() {
        let engine = dual_engine(PaymentRequirement::Never);
        let record = auth_record("XYZ1");
        let active = session("XYZ1", 5);

        let decision = engine.decide(
            &detection("XYZ1", "lane-in"),
            Some(&record),
            Some(&active),
            Utc::now(),
        );

        assert!(!decision.grant);
        assert_eq!(decision.reason, DecisionReason::SessionConflict);
    }

    #[test]
    fn test_dual_mode_unassigned_camera_denied() {
        let engine = dual_engine(PaymentRequirement::Never);
        let record = auth_record("XYZ1");

        let decision =
            engine.decide(&detection("XYZ1", "cam-lobby"), Some(&record), None, Utc::now());

        assert!(!decision.grant);
        assert_eq!(decision.reason, DecisionReason::CameraUnassigned);
        assert_eq!(decision.direction, None);
    }
}
