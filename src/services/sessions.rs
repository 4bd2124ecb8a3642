//! Parking session lifecycle management
//!
//! The manager owns every session transition. The decision engine already
//! filtered what should happen; the manager re-validates against the store
//! anyway - the single-open-session-per-plate invariant is enforced twice,
//! once here and once in the repository.
//!
//! Callers hold the per-plate lock across decide-then-mutate; nothing in
//! this module blocks on the payment terminal beyond the initial request.

use crate::domain::session::{
    epoch_ms, ParkingSession, PaymentMethod, SessionEvent, SessionEventType, SessionStatus,
};
use crate::domain::types::{CameraId, PaymentState, PaymentUpdate, PlateNumber};
use crate::infra::error::SessionError;
use crate::services::fees::{self, FeePolicy};
use crate::services::payment::PaymentProcessor;
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Storage seam for sessions.
///
/// `save` must reject a second open session for a plate - the storage-layer
/// half of the invariant (a SQL implementation backs this with a partial
/// unique index on plate for open statuses).
pub trait SessionRepository: Send + Sync {
    fn find_active(&self, plate: &PlateNumber) -> Option<ParkingSession>;
    fn find(&self, session_id: &str) -> Option<ParkingSession>;
    fn save(&self, session: &ParkingSession) -> Result<(), SessionError>;
    /// All sessions awaiting payment (timeout sweep input)
    fn pending_payment(&self) -> Vec<ParkingSession>;
}

/// In-memory repository with a plate index over open sessions
pub struct MemorySessionRepository {
    sessions: RwLock<FxHashMap<String, ParkingSession>>,
    open_by_plate: Mutex<FxHashMap<PlateNumber, String>>,
}

impl MemorySessionRepository {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(FxHashMap::default()),
            open_by_plate: Mutex::new(FxHashMap::default()),
        }
    }

    #[cfg(test)]
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }
}

impl Default for MemorySessionRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRepository for MemorySessionRepository {
    fn find_active(&self, plate: &PlateNumber) -> Option<ParkingSession> {
        let index = self.open_by_plate.lock();
        let sid = index.get(plate)?;
        self.sessions.read().get(sid).cloned()
    }

    fn find(&self, session_id: &str) -> Option<ParkingSession> {
        self.sessions.read().get(session_id).cloned()
    }

    fn save(&self, session: &ParkingSession) -> Result<(), SessionError> {
        let mut index = self.open_by_plate.lock();

        if session.status.is_open() {
            match index.get(&session.plate) {
                Some(sid) if sid != &session.sid => {
                    return Err(SessionError::Conflict {
                        plate: session.plate.clone(),
                        sid: sid.clone(),
                    });
                }
                _ => {
                    index.insert(session.plate.clone(), session.sid.clone());
                }
            }
        } else if index.get(&session.plate) == Some(&session.sid) {
            index.remove(&session.plate);
        }

        self.sessions.write().insert(session.sid.clone(), session.clone());
        Ok(())
    }

    fn pending_payment(&self) -> Vec<ParkingSession> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.status == SessionStatus::PendingPayment)
            .cloned()
            .collect()
    }
}

/// Outcome of an exit that may require payment
#[derive(Debug)]
pub enum PaymentOutcome {
    /// Fee stored, transaction in flight; barrier stays closed
    Requested { session: ParkingSession, fee: Decimal },
    /// Nothing to collect; session closed, grant immediately
    ClosedFree(ParkingSession),
    /// Replay against an in-flight payment; nothing changed
    AlreadyPending(ParkingSession),
    /// Terminal rejected the request; session cancelled, operator alerted
    RequestFailed(ParkingSession),
    /// Fee policy failed at computation time; session left active for
    /// manual fee entry
    FeeUncomputable(ParkingSession),
}

/// Outcome of a terminal notification
#[derive(Debug)]
pub enum SettlementOutcome {
    /// Payment completed: session paid, deferred grant due now
    Settled(ParkingSession),
    /// Payment failed or was cancelled at the terminal
    Failed(ParkingSession),
}

pub struct SessionManager {
    repo: Arc<dyn SessionRepository>,
    payments: Arc<dyn PaymentProcessor>,
    fee_policy: FeePolicy,
    payment_timeout: Duration,
    /// transaction id -> session id for notification routing
    pending_tx: Mutex<FxHashMap<String, String>>,
}

impl SessionManager {
    pub fn new(
        repo: Arc<dyn SessionRepository>,
        payments: Arc<dyn PaymentProcessor>,
        fee_policy: FeePolicy,
        payment_timeout_secs: u64,
    ) -> Self {
        Self {
            repo,
            payments,
            fee_policy,
            payment_timeout: Duration::seconds(payment_timeout_secs as i64),
            pending_tx: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn find_active(&self, plate: &PlateNumber) -> Option<ParkingSession> {
        self.repo.find_active(plate)
    }

    /// Open a session on entry. Re-validates the invariant even though the
    /// engine checked session presence already.
    pub fn open_session(
        &self,
        plate: PlateNumber,
        camera: CameraId,
        authorized: bool,
    ) -> Result<ParkingSession, SessionError> {
        if let Some(existing) = self.repo.find_active(&plate) {
            return Err(SessionError::Conflict { plate, sid: existing.sid });
        }

        let session = ParkingSession::open(plate, camera, authorized);
        self.repo.save(&session)?;

        info!(
            sid = %session.sid,
            plate = %session.plate,
            authorized = %session.authorized,
            "session_opened"
        );
        Ok(session)
    }

    /// Close a session with nothing due: ACTIVE -> PAID, immediate grant.
    /// The recorded fee is zero by definition - every path here (never
    /// policy, free mode, grace window) means nothing was collectable.
    pub fn close_free(
        &self,
        plate: &PlateNumber,
        camera: CameraId,
        now: DateTime<Utc>,
    ) -> Result<ParkingSession, SessionError> {
        let mut session = self
            .repo
            .find_active(plate)
            .ok_or_else(|| SessionError::NotFound(plate.to_string()))?;

        if session.status != SessionStatus::Active {
            return Err(SessionError::InvalidTransition {
                sid: session.sid.clone(),
                from: session.status,
                to: SessionStatus::Paid,
            });
        }

        session.status = SessionStatus::Paid;
        session.exit_time = Some(now);
        session.fee = Some(Decimal::ZERO);
        session.currency = Some(self.fee_policy.currency.clone());
        session.payment_method = Some(PaymentMethod::Free);
        session.camera_exit = Some(camera);
        session.add_event(SessionEvent::new(SessionEventType::Closed, epoch_ms()));
        self.repo.save(&session)?;

        info!(sid = %session.sid, plate = %session.plate, "session_closed_free");
        Ok(session)
    }

    /// Exit with payment required: compute the fee, move to
    /// PENDING_PAYMENT, and request the transaction. Zero fees close
    /// immediately - holding an exit lane for a $0 transaction helps nobody.
    pub async fn begin_payment(
        &self,
        plate: &PlateNumber,
        camera: CameraId,
        now: DateTime<Utc>,
    ) -> Result<PaymentOutcome, SessionError> {
        let mut session = self
            .repo
            .find_active(plate)
            .ok_or_else(|| SessionError::NotFound(plate.to_string()))?;

        // Idempotent replay: a pending payment is already in flight
        if session.status == SessionStatus::PendingPayment {
            debug!(sid = %session.sid, "payment_already_pending");
            return Ok(PaymentOutcome::AlreadyPending(session));
        }

        let fee = match fees::compute(&self.fee_policy, session.entry_time, now) {
            Ok(fee) => fee,
            Err(e) => {
                warn!(sid = %session.sid, error = %e, "fee_computation_failed");
                return Ok(PaymentOutcome::FeeUncomputable(session));
            }
        };

        if fee.is_zero() {
            let closed = self.close_free(plate, camera, now)?;
            return Ok(PaymentOutcome::ClosedFree(closed));
        }

        session.status = SessionStatus::PendingPayment;
        session.fee = Some(fee);
        session.currency = Some(self.fee_policy.currency.clone());
        session.camera_exit = Some(camera);
        session.payment_requested_at = Some(now);
        session.add_event(SessionEvent::new(SessionEventType::ExitSeen, epoch_ms()));
        self.repo.save(&session)?;

        match self.payments.request(&session.sid, fee, &self.fee_policy.currency).await {
            Ok(transaction_id) => {
                session.transaction_id = Some(transaction_id.clone());
                session.add_event(
                    SessionEvent::new(SessionEventType::PaymentRequested, epoch_ms())
                        .with_extra(&format!("fee={fee},tx={transaction_id}")),
                );
                self.repo.save(&session)?;
                self.pending_tx.lock().insert(transaction_id, session.sid.clone());

                info!(
                    sid = %session.sid,
                    plate = %session.plate,
                    fee = %fee,
                    "session_payment_requested"
                );
                Ok(PaymentOutcome::Requested { session, fee })
            }
            Err(e) => {
                warn!(sid = %session.sid, error = %e, "payment_request_failed");
                session.status = SessionStatus::Cancelled;
                session.add_event(
                    SessionEvent::new(SessionEventType::PaymentFailed, epoch_ms())
                        .with_extra(&e.to_string()),
                );
                self.repo.save(&session)?;
                Ok(PaymentOutcome::RequestFailed(session))
            }
        }
    }

    /// Resolve a terminal notification to the session it belongs to,
    /// without mutating anything. The pipeline locks the plate before
    /// calling `apply_payment_update`.
    pub fn resolve_transaction(&self, transaction_id: &str) -> Option<ParkingSession> {
        let sid = self.pending_tx.lock().get(transaction_id).cloned()?;
        self.repo.find(&sid)
    }

    /// Apply a terminal notification. Stale or non-terminal updates are
    /// dropped; completion settles the session (deferred grant), failure
    /// cancels it.
    pub fn apply_payment_update(&self, update: &PaymentUpdate) -> Option<SettlementOutcome> {
        if !update.state.is_terminal() {
            debug!(
                transaction_id = %update.transaction_id,
                state = %update.state.as_str(),
                "payment_update_nonterminal"
            );
            return None;
        }

        let sid = self.pending_tx.lock().remove(&update.transaction_id)?;
        let mut session = self.repo.find(&sid)?;

        if session.status != SessionStatus::PendingPayment {
            debug!(sid = %sid, status = %session.status.as_str(), "payment_update_stale");
            return None;
        }

        let now = Utc::now();
        match update.state {
            PaymentState::Completed => {
                session.status = SessionStatus::Paid;
                session.exit_time = Some(now);
                session.payment_method = Some(PaymentMethod::Terminal);
                session.add_event(SessionEvent::new(SessionEventType::PaymentSettled, epoch_ms()));
                session.add_event(SessionEvent::new(SessionEventType::Closed, epoch_ms()));
                if self.repo.save(&session).is_err() {
                    return None;
                }
                info!(sid = %session.sid, plate = %session.plate, "session_settled");
                Some(SettlementOutcome::Settled(session))
            }
            PaymentState::Failed | PaymentState::Cancelled => {
                session.status = SessionStatus::Cancelled;
                session.add_event(
                    SessionEvent::new(SessionEventType::PaymentFailed, epoch_ms())
                        .with_extra(update.state.as_str()),
                );
                if self.repo.save(&session).is_err() {
                    return None;
                }
                warn!(sid = %session.sid, plate = %session.plate, "session_payment_failed");
                Some(SettlementOutcome::Failed(session))
            }
            _ => None,
        }
    }

    /// Operator override: cash or invoice taken at the booth.
    /// PENDING_PAYMENT -> PAID with the manual method; the outstanding
    /// terminal transaction is cancelled best-effort.
    pub async fn settle_manual(&self, session_id: &str) -> Result<ParkingSession, SessionError> {
        let mut session =
            self.repo.find(session_id).ok_or_else(|| SessionError::NotFound(session_id.into()))?;

        if session.status != SessionStatus::PendingPayment {
            return Err(SessionError::InvalidTransition {
                sid: session.sid.clone(),
                from: session.status,
                to: SessionStatus::Paid,
            });
        }

        if let Some(tx) = session.transaction_id.clone() {
            self.pending_tx.lock().remove(&tx);
            if let Err(e) = self.payments.cancel(&tx).await {
                warn!(sid = %session.sid, error = %e, "manual_settle_cancel_failed");
            }
        }

        session.status = SessionStatus::Paid;
        session.exit_time = Some(Utc::now());
        session.payment_method = Some(PaymentMethod::Manual);
        session.add_event(SessionEvent::new(SessionEventType::ManualSettle, epoch_ms()));
        session.add_event(SessionEvent::new(SessionEventType::Closed, epoch_ms()));
        self.repo.save(&session)?;

        info!(sid = %session.sid, plate = %session.plate, "session_settled_manual");
        Ok(session)
    }

    /// Sessions whose pending payment has exceeded the configured bound.
    /// Read-only; the pipeline locks each plate and calls `cancel_payment`.
    pub fn expired_payments(&self, now: DateTime<Utc>) -> Vec<ParkingSession> {
        self.repo
            .pending_payment()
            .into_iter()
            .filter(|s| {
                s.payment_requested_at
                    .map(|at| now.signed_duration_since(at) > self.payment_timeout)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Cancel a stuck pending payment: PENDING_PAYMENT -> CANCELLED,
    /// barrier stays closed, operator alert follows.
    ///
    /// The terminal is polled once before cancelling: a transaction that
    /// completed while its notification was in flight settles instead -
    /// a paid exit must never be thrown away by the sweep. Callers
    /// distinguish the two by the returned session's status.
    pub async fn cancel_payment(
        &self,
        session_id: &str,
    ) -> Result<ParkingSession, SessionError> {
        let mut session =
            self.repo.find(session_id).ok_or_else(|| SessionError::NotFound(session_id.into()))?;

        if session.status != SessionStatus::PendingPayment {
            return Err(SessionError::InvalidTransition {
                sid: session.sid.clone(),
                from: session.status,
                to: SessionStatus::Cancelled,
            });
        }

        if let Some(tx) = session.transaction_id.clone() {
            if matches!(self.payments.status(&tx).await, Ok(PaymentState::Completed)) {
                self.pending_tx.lock().remove(&tx);
                session.status = SessionStatus::Paid;
                session.exit_time = Some(Utc::now());
                session.payment_method = Some(PaymentMethod::Terminal);
                session
                    .add_event(SessionEvent::new(SessionEventType::PaymentSettled, epoch_ms()));
                session.add_event(SessionEvent::new(SessionEventType::Closed, epoch_ms()));
                self.repo.save(&session)?;
                info!(sid = %session.sid, plate = %session.plate, "session_settled_on_sweep");
                return Ok(session);
            }

            self.pending_tx.lock().remove(&tx);
            if let Err(e) = self.payments.cancel(&tx).await {
                warn!(sid = %session.sid, error = %e, "payment_timeout_cancel_failed");
            }
        }

        session.status = SessionStatus::Cancelled;
        session.add_event(SessionEvent::new(SessionEventType::PaymentTimeout, epoch_ms()));
        self.repo.save(&session)?;

        warn!(sid = %session.sid, plate = %session.plate, "session_payment_timed_out");
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::error::PaymentError;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    struct MockProcessor {
        requests: AtomicU64,
        cancels: AtomicU64,
        fail_requests: AtomicBool,
        completed_on_status: AtomicBool,
    }

    impl MockProcessor {
        fn new() -> Self {
            Self {
                requests: AtomicU64::new(0),
                cancels: AtomicU64::new(0),
                fail_requests: AtomicBool::new(false),
                completed_on_status: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl PaymentProcessor for MockProcessor {
        async fn request(
            &self,
            session_id: &str,
            _amount: Decimal,
            _currency: &str,
        ) -> Result<String, PaymentError> {
            if self.fail_requests.load(Ordering::SeqCst) {
                return Err(PaymentError::Request("terminal offline".into()));
            }
            let n = self.requests.fetch_add(1, Ordering::SeqCst);
            Ok(format!("tx-{session_id}-{n}"))
        }

        async fn status(&self, _transaction_id: &str) -> Result<PaymentState, PaymentError> {
            if self.completed_on_status.load(Ordering::SeqCst) {
                Ok(PaymentState::Completed)
            } else {
                Ok(PaymentState::Processing)
            }
        }

        async fn cancel(&self, _transaction_id: &str) -> Result<(), PaymentError> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn plate(s: &str) -> PlateNumber {
        PlateNumber::normalize(s).unwrap()
    }

    fn cam(s: &str) -> CameraId {
        CameraId(s.to_string())
    }

    fn hourly_policy() -> FeePolicy {
        FeePolicy {
            mode: crate::services::fees::FeeMode::Hourly,
            currency: "USD".to_string(),
            rate: dec!(2.00),
            tiers: Vec::new(),
            grace_minutes: 0,
        }
    }

    fn manager_with(
        policy: FeePolicy,
    ) -> (SessionManager, Arc<MemorySessionRepository>, Arc<MockProcessor>) {
        let repo = Arc::new(MemorySessionRepository::new());
        let processor = Arc::new(MockProcessor::new());
        let manager =
            SessionManager::new(repo.clone(), processor.clone(), policy, 180);
        (manager, repo, processor)
    }

    fn backdate(repo: &MemorySessionRepository, sid: &str, minutes: i64) {
        let mut session = repo.find(sid).unwrap();
        session.entry_time = Utc::now() - Duration::minutes(minutes);
        repo.save(&session).unwrap();
    }

    #[test]
    fn test_open_session() {
        let (manager, _repo, _) = manager_with(FeePolicy::free());

        let session = manager.open_session(plate("AB123"), cam("lane-in"), true).unwrap();

        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(manager.find_active(&plate("AB123")).unwrap().sid, session.sid);
    }

    #[test]
    fn test_second_open_session_conflicts() {
        let (manager, repo, _) = manager_with(FeePolicy::free());

        manager.open_session(plate("AB123"), cam("lane-in"), true).unwrap();
        let err = manager.open_session(plate("AB123"), cam("lane-in"), true).unwrap_err();

        assert!(matches!(err, SessionError::Conflict { .. }));
        assert_eq!(repo.session_count(), 1);
    }

    #[test]
    fn test_repository_rejects_second_open_session() {
        let repo = MemorySessionRepository::new();
        let first = ParkingSession::open(plate("AB123"), cam("lane-in"), true);
        repo.save(&first).unwrap();

        let second = ParkingSession::open(plate("AB123"), cam("lane-in"), true);
        assert!(matches!(repo.save(&second), Err(SessionError::Conflict { .. })));
    }

    #[test]
    fn test_close_free_sets_terminal_state() {
        let (manager, _repo, _) = manager_with(FeePolicy::free());
        manager.open_session(plate("XYZ1"), cam("lane-in"), true).unwrap();

        let closed = manager.close_free(&plate("XYZ1"), cam("lane-in"), Utc::now()).unwrap();

        assert_eq!(closed.status, SessionStatus::Paid);
        assert_eq!(closed.fee, Some(Decimal::ZERO));
        assert_eq!(closed.payment_method, Some(PaymentMethod::Free));
        assert!(closed.exit_time.is_some());
        // plate is free for a new session
        assert!(manager.find_active(&plate("XYZ1")).is_none());
    }

    #[tokio::test]
    async fn test_begin_payment_requests_transaction() {
        let (manager, repo, processor) = manager_with(hourly_policy());
        let opened = manager.open_session(plate("AB123"), cam("lane-in"), true).unwrap();
        backdate(&repo, &opened.sid, 61);

        let outcome =
            manager.begin_payment(&plate("AB123"), cam("lane-out"), Utc::now()).await.unwrap();

        let PaymentOutcome::Requested { session, fee } = outcome else {
            panic!("expected Requested, got {outcome:?}");
        };
        assert_eq!(fee, dec!(4.00));
        assert_eq!(session.status, SessionStatus::PendingPayment);
        assert!(session.transaction_id.is_some());
        assert_eq!(processor.requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_begin_payment_replay_is_idempotent() {
        let (manager, repo, processor) = manager_with(hourly_policy());
        let opened = manager.open_session(plate("AB123"), cam("lane-in"), true).unwrap();
        backdate(&repo, &opened.sid, 61);

        let first =
            manager.begin_payment(&plate("AB123"), cam("lane-out"), Utc::now()).await.unwrap();
        assert!(matches!(first, PaymentOutcome::Requested { .. }));

        let second =
            manager.begin_payment(&plate("AB123"), cam("lane-out"), Utc::now()).await.unwrap();
        assert!(matches!(second, PaymentOutcome::AlreadyPending(_)));

        // one transaction, not two
        assert_eq!(processor.requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_begin_payment_zero_fee_closes_free() {
        let mut policy = hourly_policy();
        policy.grace_minutes = 120;
        let (manager, repo, processor) = manager_with(policy);
        let opened = manager.open_session(plate("AB123"), cam("lane-in"), true).unwrap();
        backdate(&repo, &opened.sid, 30);

        let outcome =
            manager.begin_payment(&plate("AB123"), cam("lane-out"), Utc::now()).await.unwrap();

        let PaymentOutcome::ClosedFree(session) = outcome else {
            panic!("expected ClosedFree, got {outcome:?}");
        };
        assert_eq!(session.status, SessionStatus::Paid);
        assert_eq!(processor.requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_begin_payment_request_failure_cancels() {
        let (manager, repo, processor) = manager_with(hourly_policy());
        processor.fail_requests.store(true, Ordering::SeqCst);
        let opened = manager.open_session(plate("AB123"), cam("lane-in"), true).unwrap();
        backdate(&repo, &opened.sid, 61);

        let outcome =
            manager.begin_payment(&plate("AB123"), cam("lane-out"), Utc::now()).await.unwrap();

        let PaymentOutcome::RequestFailed(session) = outcome else {
            panic!("expected RequestFailed, got {outcome:?}");
        };
        assert_eq!(session.status, SessionStatus::Cancelled);
        assert!(manager.find_active(&plate("AB123")).is_none());
    }

    #[tokio::test]
    async fn test_completed_notification_settles() {
        let (manager, repo, _) = manager_with(hourly_policy());
        let opened = manager.open_session(plate("AB123"), cam("lane-in"), true).unwrap();
        backdate(&repo, &opened.sid, 61);

        let outcome =
            manager.begin_payment(&plate("AB123"), cam("lane-out"), Utc::now()).await.unwrap();
        let PaymentOutcome::Requested { session, .. } = outcome else { panic!() };
        let tx = session.transaction_id.unwrap();

        let update = PaymentUpdate {
            transaction_id: tx.clone(),
            state: PaymentState::Completed,
            received_at: std::time::Instant::now(),
        };
        let settled = manager.apply_payment_update(&update).unwrap();

        let SettlementOutcome::Settled(paid) = settled else { panic!() };
        assert_eq!(paid.status, SessionStatus::Paid);
        assert_eq!(paid.payment_method, Some(PaymentMethod::Terminal));
        assert!(paid.exit_time.is_some());

        // replaying the same notification is a no-op
        assert!(manager.apply_payment_update(&update).is_none());
    }

    #[tokio::test]
    async fn test_failed_notification_cancels() {
        let (manager, repo, _) = manager_with(hourly_policy());
        let opened = manager.open_session(plate("AB123"), cam("lane-in"), true).unwrap();
        backdate(&repo, &opened.sid, 61);

        let outcome =
            manager.begin_payment(&plate("AB123"), cam("lane-out"), Utc::now()).await.unwrap();
        let PaymentOutcome::Requested { session, .. } = outcome else { panic!() };

        let update = PaymentUpdate {
            transaction_id: session.transaction_id.unwrap(),
            state: PaymentState::Failed,
            received_at: std::time::Instant::now(),
        };
        let result = manager.apply_payment_update(&update).unwrap();

        let SettlementOutcome::Failed(cancelled) = result else { panic!() };
        assert_eq!(cancelled.status, SessionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_nonterminal_notification_ignored() {
        let (manager, _, _) = manager_with(hourly_policy());
        let update = PaymentUpdate {
            transaction_id: "tx-unknown".to_string(),
            state: PaymentState::Processing,
            received_at: std::time::Instant::now(),
        };
        assert!(manager.apply_payment_update(&update).is_none());
    }

    #[tokio::test]
    async fn test_settle_manual() {
        let (manager, repo, processor) = manager_with(hourly_policy());
        let opened = manager.open_session(plate("AB123"), cam("lane-in"), true).unwrap();
        backdate(&repo, &opened.sid, 61);

        let outcome =
            manager.begin_payment(&plate("AB123"), cam("lane-out"), Utc::now()).await.unwrap();
        let PaymentOutcome::Requested { session, .. } = outcome else { panic!() };

        let settled = manager.settle_manual(&session.sid).await.unwrap();

        assert_eq!(settled.status, SessionStatus::Paid);
        assert_eq!(settled.payment_method, Some(PaymentMethod::Manual));
        // outstanding terminal transaction was cancelled
        assert_eq!(processor.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_payment_timeout_sweep() {
        let (manager, repo, processor) = manager_with(hourly_policy());
        let opened = manager.open_session(plate("AB123"), cam("lane-in"), true).unwrap();
        backdate(&repo, &opened.sid, 61);

        let outcome =
            manager.begin_payment(&plate("AB123"), cam("lane-out"), Utc::now()).await.unwrap();
        let PaymentOutcome::Requested { session, .. } = outcome else { panic!() };

        // nothing expires inside the bound
        assert!(manager.expired_payments(Utc::now()).is_empty());

        let later = Utc::now() + Duration::seconds(181);
        let expired = manager.expired_payments(later);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].sid, session.sid);

        let cancelled = manager.cancel_payment(&session.sid).await.unwrap();
        assert_eq!(cancelled.status, SessionStatus::Cancelled);
        assert_eq!(processor.cancels.load(Ordering::SeqCst), 1);
        assert!(manager.find_active(&plate("AB123")).is_none());
    }

    #[tokio::test]
    async fn test_sweep_settles_completed_transaction_instead_of_cancelling() {
        let (manager, repo, processor) = manager_with(hourly_policy());
        let opened = manager.open_session(plate("AB123"), cam("lane-in"), true).unwrap();
        backdate(&repo, &opened.sid, 61);

        let outcome =
            manager.begin_payment(&plate("AB123"), cam("lane-out"), Utc::now()).await.unwrap();
        let PaymentOutcome::Requested { session, .. } = outcome else { panic!() };

        // the terminal completed, but the notification was lost
        processor.completed_on_status.store(true, Ordering::SeqCst);

        let settled = manager.cancel_payment(&session.sid).await.unwrap();

        assert_eq!(settled.status, SessionStatus::Paid);
        assert_eq!(settled.payment_method, Some(PaymentMethod::Terminal));
        assert_eq!(processor.cancels.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invariant_one_open_session_per_plate() {
        let (manager, repo, _) = manager_with(hourly_policy());
        let opened = manager.open_session(plate("AB123"), cam("lane-in"), true).unwrap();
        backdate(&repo, &opened.sid, 61);

        manager.begin_payment(&plate("AB123"), cam("lane-out"), Utc::now()).await.unwrap();

        // pending-payment still counts as open: no new session may start
        let err = manager.open_session(plate("AB123"), cam("lane-in"), true).unwrap_err();
        assert!(matches!(err, SessionError::Conflict { .. }));

        let open: Vec<_> = repo.pending_payment();
        assert_eq!(open.len(), 1);
    }
}
