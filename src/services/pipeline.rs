//! Detection pipeline and event orchestration
//!
//! The Pipeline is the central coordinator between:
//! - Debounce filtering (suppressing duplicate plate reads)
//! - Access decisions (authorization, direction, payment policy)
//! - Session lifecycle (open, price, settle, close)
//! - Barrier control (granted opens, deferred grants after payment)
//!
//! Per-plate mutual exclusion: decide-then-mutate runs under a plate-keyed
//! async lock, so duplicate or racing events for one plate serialize while
//! different plates proceed fully in parallel. A global lock would throttle
//! multi-lane throughput for no correctness gain.

use crate::domain::session::{epoch_ms, ParkingSession, SessionStatus};
use crate::domain::types::{
    Decision, DecisionReason, PaymentUpdate, PlateDetectionEvent, PlateNumber, SessionAction,
};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::egress::SessionLog;
use crate::io::egress_channel::{
    AccessEventPayload, AlertPayload, EgressSender, SessionEventPayload,
};
use crate::services::authorization::AuthorizationStore;
use crate::services::barrier::BarrierHandle;
use crate::services::debounce::{Admission, DebounceFilter};
use crate::services::engine::AccessDecisionEngine;
use crate::services::payment::PaymentProcessor;
use crate::services::sessions::{
    PaymentOutcome, SessionManager, SessionRepository, SettlementOutcome,
};
use chrono::Utc;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::OwnedMutexGuard;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

/// Plate-keyed async lock table.
///
/// Entries are created on demand and swept once no task holds them, so the
/// table tracks recently seen plates, not the whole fleet.
struct PlateLocks {
    locks: Mutex<FxHashMap<PlateNumber, Arc<tokio::sync::Mutex<()>>>>,
}

impl PlateLocks {
    fn new() -> Self {
        Self { locks: Mutex::new(FxHashMap::default()) }
    }

    async fn acquire(&self, plate: &PlateNumber) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.locks.lock();
            map.entry(plate.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    fn sweep(&self) {
        // strong_count == 1 means only the table holds the lock
        self.locks.lock().retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

/// Central coordinator for detections, payments and barrier actuation
pub struct Pipeline {
    engine: AccessDecisionEngine,
    debounce: DebounceFilter,
    auth: Arc<dyn AuthorizationStore>,
    sessions: Arc<SessionManager>,
    barrier: BarrierHandle,
    metrics: Arc<Metrics>,
    egress_sender: Option<EgressSender>,
    session_log: SessionLog,
    locks: PlateLocks,
}

impl Pipeline {
    pub fn new(
        config: &Config,
        auth: Arc<dyn AuthorizationStore>,
        repo: Arc<dyn SessionRepository>,
        payments: Arc<dyn PaymentProcessor>,
        barrier: BarrierHandle,
        metrics: Arc<Metrics>,
        egress_sender: Option<EgressSender>,
    ) -> Self {
        let sessions = Arc::new(SessionManager::new(
            repo,
            payments,
            config.fee_policy().clone(),
            config.payment_timeout_secs(),
        ));
        Self {
            engine: AccessDecisionEngine::from_config(config),
            debounce: DebounceFilter::new(
                config.debounce_window_ms(),
                config.debounce_per_camera(),
            ),
            auth,
            sessions,
            barrier,
            metrics,
            egress_sender,
            session_log: SessionLog::new(config.egress_file()),
            locks: PlateLocks::new(),
        }
    }

    /// Session manager accessor for operator surfaces (manual settlement)
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Run the pipeline, consuming detections and payment notifications
    /// until the detection channel closes
    pub async fn run(
        self: Arc<Self>,
        mut detection_rx: mpsc::Receiver<PlateDetectionEvent>,
        mut payment_rx: mpsc::Receiver<PaymentUpdate>,
    ) {
        info!("pipeline_started");
        let mut tick = interval(Duration::from_secs(1));
        let mut payments_open = true;

        loop {
            tokio::select! {
                event = detection_rx.recv() => {
                    match event {
                        Some(event) => {
                            let pipeline = self.clone();
                            tokio::spawn(async move {
                                pipeline.process_detection(event).await;
                            });
                        }
                        None => break, // Channel closed
                    }
                }
                update = payment_rx.recv(), if payments_open => {
                    match update {
                        Some(update) => {
                            let pipeline = self.clone();
                            tokio::spawn(async move {
                                pipeline.process_payment_update(update).await;
                            });
                        }
                        None => payments_open = false,
                    }
                }
                _ = tick.tick() => {
                    let pipeline = self.clone();
                    tokio::spawn(async move {
                        pipeline.maintenance_tick().await;
                    });
                }
            }
        }

        info!("pipeline_stopped");
    }

    /// Process one detection: debounce, decide, mutate the session, drive
    /// the barrier. Holds the plate lock for the whole decide-then-mutate
    /// sequence.
    pub async fn process_detection(&self, event: PlateDetectionEvent) {
        let process_start = Instant::now();
        self.metrics.record_detection_received();

        let _plate_guard = self.locks.acquire(&event.plate).await;

        match self.debounce.admit(&event) {
            Admission::Fresh => {}
            Admission::Override => {
                // Same presentation, better read: the decision already ran;
                // re-running it would re-trigger the barrier or, in
                // single-camera mode, misread the re-read as an exit
                debug!(
                    plate = %event.plate,
                    confidence = %event.confidence,
                    "detection_confidence_upgraded"
                );
                return;
            }
            Admission::Suppressed => {
                self.metrics.record_detection_suppressed();
                return;
            }
        }

        let now = Utc::now();
        let auth = self.auth.lookup(&event.plate);
        let active = self.sessions.find_active(&event.plate);
        let decision = self.engine.decide(&event, auth.as_ref(), active.as_ref(), now);

        debug!(
            plate = %event.plate,
            camera = %event.camera,
            grant = %decision.grant,
            reason = %decision.reason.as_str(),
            "decision_made"
        );

        match decision.action {
            SessionAction::OpenSession => self.apply_entry(&event, decision).await,
            SessionAction::CloseSession => self.apply_free_exit(&event, decision).await,
            SessionAction::RequestPayment => self.apply_paid_exit(&event, decision).await,
            SessionAction::None => {
                self.emit_access(&event, decision);
                if decision.reason == DecisionReason::CameraUnassigned {
                    self.emit_alert(
                        "camera_unassigned",
                        None,
                        Some(&event.plate),
                        &format!("camera {} is assigned to neither lane", event.camera),
                    );
                }
            }
        }

        let latency_us = process_start.elapsed().as_micros() as u64;
        self.metrics.record_decision_latency(latency_us);
    }

    async fn apply_entry(&self, event: &PlateDetectionEvent, decision: Decision) {
        let authorized = decision.reason == DecisionReason::Authorized;
        match self.sessions.open_session(event.plate.clone(), event.camera.clone(), authorized) {
            Ok(session) => {
                self.metrics.record_session_opened();
                self.emit_session_event("opened", &session);
                self.emit_access(event, decision);
                self.barrier.request_open(event.plate.clone());
            }
            Err(e) => {
                // Second line of defense fired: deny instead of fabricating
                warn!(plate = %event.plate, error = %e, "session_open_rejected");
                self.emit_access(
                    event,
                    Decision::deny(DecisionReason::SessionConflict, decision.direction),
                );
            }
        }
    }

    async fn apply_free_exit(&self, event: &PlateDetectionEvent, decision: Decision) {
        match self.sessions.close_free(&event.plate, event.camera.clone(), Utc::now()) {
            Ok(session) => {
                self.finish_session(&session);
                self.emit_access(event, decision);
                self.barrier.request_open(event.plate.clone());
            }
            Err(e) => {
                warn!(plate = %event.plate, error = %e, "free_exit_rejected");
                self.emit_access(
                    event,
                    Decision::deny(DecisionReason::NoActiveSession, decision.direction),
                );
            }
        }
    }

    async fn apply_paid_exit(&self, event: &PlateDetectionEvent, decision: Decision) {
        let outcome =
            match self.sessions.begin_payment(&event.plate, event.camera.clone(), Utc::now()).await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(plate = %event.plate, error = %e, "begin_payment_rejected");
                    self.emit_access(
                        event,
                        Decision::deny(DecisionReason::NoActiveSession, decision.direction),
                    );
                    return;
                }
            };

        match outcome {
            PaymentOutcome::Requested { session, fee } => {
                self.metrics.record_payment_requested();
                self.emit_session_event_with_fee("payment_due", &session, Some(fee.to_string()));
                // Barrier stays closed; the grant is deferred to settlement
                self.emit_access(event, decision);
            }
            PaymentOutcome::ClosedFree(session) => {
                self.finish_session(&session);
                self.emit_access(
                    event,
                    Decision {
                        grant: true,
                        reason: DecisionReason::FreeExit,
                        direction: decision.direction,
                        action: SessionAction::CloseSession,
                    },
                );
                self.barrier.request_open(event.plate.clone());
            }
            PaymentOutcome::AlreadyPending(_) => {
                self.emit_access(
                    event,
                    Decision::deny(DecisionReason::PaymentPending, decision.direction),
                );
            }
            PaymentOutcome::RequestFailed(session) => {
                self.metrics.record_payment_failed();
                self.emit_alert(
                    "payment_failed",
                    Some(&session.sid),
                    Some(&session.plate),
                    "terminal rejected the payment request",
                );
                self.finish_session(&session);
                self.emit_access(event, decision);
            }
            PaymentOutcome::FeeUncomputable(session) => {
                self.emit_alert(
                    "fee_manual_entry",
                    Some(&session.sid),
                    Some(&session.plate),
                    "fee computation failed; manual fee entry required",
                );
                self.emit_access(event, decision);
            }
        }
    }

    /// Apply a payment terminal notification under the owning plate's lock
    pub async fn process_payment_update(&self, update: PaymentUpdate) {
        let Some(snapshot) = self.sessions.resolve_transaction(&update.transaction_id) else {
            debug!(transaction_id = %update.transaction_id, "payment_update_unroutable");
            return;
        };

        let _plate_guard = self.locks.acquire(&snapshot.plate).await;

        match self.sessions.apply_payment_update(&update) {
            Some(SettlementOutcome::Settled(session)) => {
                self.metrics.record_payment_settled();
                self.finish_session(&session);
                // Deferred grant: the barrier opens now, not at decision time
                self.emit_deferred_grant(&session);
                self.barrier.request_open(session.plate.clone());
            }
            Some(SettlementOutcome::Failed(session)) => {
                self.metrics.record_payment_failed();
                self.emit_alert(
                    "payment_failed",
                    Some(&session.sid),
                    Some(&session.plate),
                    "terminal reported the transaction failed",
                );
                self.finish_session(&session);
            }
            None => {}
        }
    }

    /// Periodic maintenance: payment timeout sweep, debounce/lock table GC
    pub async fn maintenance_tick(&self) {
        self.debounce.sweep();
        self.locks.sweep();

        let now = Utc::now();
        for expired in self.sessions.expired_payments(now) {
            let _plate_guard = self.locks.acquire(&expired.plate).await;
            match self.sessions.cancel_payment(&expired.sid).await {
                // The pre-cancel status poll found a completed transaction
                // whose notification never arrived: settle, deferred grant
                Ok(session) if session.status == SessionStatus::Paid => {
                    self.metrics.record_payment_settled();
                    self.finish_session(&session);
                    self.emit_deferred_grant(&session);
                    self.barrier.request_open(session.plate.clone());
                }
                Ok(session) => {
                    self.metrics.record_payment_failed();
                    self.emit_alert(
                        "payment_timeout",
                        Some(&session.sid),
                        Some(&session.plate),
                        "pending payment exceeded the configured bound",
                    );
                    self.finish_session(&session);
                }
                // Raced with a settlement under the plate lock; nothing to do
                Err(e) => debug!(sid = %expired.sid, error = %e, "timeout_cancel_skipped"),
            }
        }
    }

    /// Terminal-state bookkeeping shared by every close path
    fn finish_session(&self, session: &ParkingSession) {
        self.metrics.record_session_closed();
        self.session_log.write_session(session);
        if let Some(ref sender) = self.egress_sender {
            sender.send_session(session);
        }
        self.emit_session_event("closed", session);
    }

    fn emit_access(&self, event: &PlateDetectionEvent, decision: Decision) {
        if decision.grant {
            self.metrics.record_access_granted();
        } else {
            self.metrics.record_access_denied();
        }

        if let Some(ref sender) = self.egress_sender {
            sender.send_access(AccessEventPayload {
                site: None,
                ts: epoch_ms(),
                t: if decision.grant { "granted" } else { "denied" }.to_string(),
                plate: event.plate.to_string(),
                camera: event.camera.to_string(),
                reason: decision.reason.as_str().to_string(),
                direction: decision.direction.map(|d| d.as_str().to_string()),
            });
        }
    }

    /// Grant emitted at settlement time, when the triggering detection is
    /// long gone
    fn emit_deferred_grant(&self, session: &ParkingSession) {
        self.metrics.record_access_granted();
        if let Some(ref sender) = self.egress_sender {
            sender.send_access(AccessEventPayload {
                site: None,
                ts: epoch_ms(),
                t: "granted".to_string(),
                plate: session.plate.to_string(),
                camera: session
                    .camera_exit
                    .as_ref()
                    .map(|c| c.to_string())
                    .unwrap_or_default(),
                reason: DecisionReason::PaidExit.as_str().to_string(),
                direction: Some("exit".to_string()),
            });
        }
    }

    fn emit_session_event(&self, kind: &str, session: &ParkingSession) {
        self.emit_session_event_with_fee(kind, session, session.fee.map(|f| f.to_string()));
    }

    fn emit_session_event_with_fee(
        &self,
        kind: &str,
        session: &ParkingSession,
        fee: Option<String>,
    ) {
        if let Some(ref sender) = self.egress_sender {
            sender.send_session_event(SessionEventPayload {
                site: None,
                ts: epoch_ms(),
                t: kind.to_string(),
                sid: session.sid.clone(),
                plate: session.plate.to_string(),
                entry_ms: Some(session.entry_ms()),
                exit_ms: session.exit_time.map(|t| t.timestamp_millis().max(0) as u64),
                fee,
                currency: session.currency.clone(),
                method: session.payment_method.map(|m| m.as_str().to_string()),
            });
        }
    }

    fn emit_alert(&self, kind: &str, sid: Option<&str>, plate: Option<&PlateNumber>, detail: &str) {
        warn!(kind = %kind, sid = ?sid, detail = %detail, "operator_alert");
        if let Some(ref sender) = self.egress_sender {
            sender.send_alert(AlertPayload {
                site: None,
                ts: epoch_ms(),
                kind: kind.to_string(),
                sid: sid.map(|s| s.to_string()),
                plate: plate.map(|p| p.to_string()),
                detail: detail.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::session::SessionStatus;
    use crate::domain::types::{CameraId, PaymentState};
    use crate::infra::config::{AccessMode, LaneMode, PaymentRequirement};
    use crate::infra::error::PaymentError;
    use crate::io::egress_channel::{create_egress_channel, EgressMessage};
    use crate::services::authorization::{AuthorizationRecord, StaticAuthStore};
    use crate::services::barrier::BarrierCommand;
    use crate::services::fees::{FeeMode, FeePolicy};
    use crate::services::sessions::MemorySessionRepository;
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::tempdir;

    struct ScriptedProcessor {
        requests: AtomicU64,
    }

    #[async_trait]
    impl PaymentProcessor for ScriptedProcessor {
        async fn request(
            &self,
            session_id: &str,
            _amount: Decimal,
            _currency: &str,
        ) -> Result<String, PaymentError> {
            let n = self.requests.fetch_add(1, Ordering::SeqCst);
            Ok(format!("tx-{session_id}-{n}"))
        }

        async fn status(&self, _tx: &str) -> Result<PaymentState, PaymentError> {
            Ok(PaymentState::Processing)
        }

        async fn cancel(&self, _tx: &str) -> Result<(), PaymentError> {
            Ok(())
        }
    }

    struct Harness {
        pipeline: Pipeline,
        processor: Arc<ScriptedProcessor>,
        repo: Arc<MemorySessionRepository>,
        barrier_rx: mpsc::Receiver<BarrierCommand>,
        egress_rx: mpsc::Receiver<EgressMessage>,
        _egress_dir: tempfile::TempDir,
    }

    fn harness(config: Config, authorized: &[&str]) -> Harness {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("sessions.jsonl");
        let config = config.with_egress_file(log_path.to_str().unwrap());

        let records = authorized.iter().map(|p| AuthorizationRecord {
            plate: PlateNumber::normalize(p).unwrap(),
            owner: "owner".to_string(),
            vehicle_type: None,
            authorized: true,
            valid_from: None,
            valid_until: None,
        });
        let auth = Arc::new(StaticAuthStore::from_records(records));
        let repo = Arc::new(MemorySessionRepository::new());
        let processor = Arc::new(ScriptedProcessor { requests: AtomicU64::new(0) });
        let (barrier, barrier_rx) = BarrierHandle::channel(16);
        let (egress_sender, egress_rx) = create_egress_channel(64, "test".to_string());

        let pipeline = Pipeline::new(
            &config,
            auth,
            repo.clone(),
            processor.clone(),
            barrier,
            Arc::new(Metrics::new()),
            Some(egress_sender),
        );

        Harness { pipeline, processor, repo, barrier_rx, egress_rx, _egress_dir: dir }
    }

    fn detection(plate: &str, camera: &str, confidence: f64, ts: u64) -> PlateDetectionEvent {
        PlateDetectionEvent {
            plate: PlateNumber::normalize(plate).unwrap(),
            confidence,
            camera: CameraId(camera.to_string()),
            event_time: ts,
            received_at: Instant::now(),
            image_ref: None,
        }
    }

    fn dual_config(payment: PaymentRequirement) -> Config {
        Config::default()
            .with_lane_mode(LaneMode::Dual {
                entry: CameraId("lane-in".into()),
                exit: CameraId("lane-out".into()),
            })
            .with_payment_requirement(payment)
            .with_fee_policy(FeePolicy {
                mode: FeeMode::Hourly,
                currency: "USD".to_string(),
                rate: dec!(2.00),
                tiers: Vec::new(),
                grace_minutes: 0,
            })
    }

    fn drain_access_events(rx: &mut mpsc::Receiver<EgressMessage>) -> Vec<AccessEventPayload> {
        let mut events = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let EgressMessage::Access(payload) = msg {
                events.push(payload);
            }
        }
        events
    }

    fn backdate_active(repo: &MemorySessionRepository, plate: &str, minutes: i64) {
        let plate = PlateNumber::normalize(plate).unwrap();
        let mut session = repo.find_active(&plate).unwrap();
        session.entry_time = Utc::now() - chrono::Duration::minutes(minutes);
        repo.save(&session).unwrap();
    }

    #[tokio::test]
    async fn test_single_camera_free_parking_round_trip() {
        let mut h = harness(Config::default(), &["XYZ1"]);

        // entry: no session yet
        h.pipeline.process_detection(detection("XYZ1", "cam", 0.9, 1_000_000)).await;

        let plate = PlateNumber::normalize("XYZ1").unwrap();
        let opened = h.repo.find_active(&plate).unwrap();
        assert_eq!(opened.status, SessionStatus::Active);
        assert!(matches!(h.barrier_rx.try_recv(), Ok(BarrierCommand::Open { .. })));

        // exit: outside the debounce window
        h.pipeline.process_detection(detection("XYZ1", "cam", 0.9, 2_000_000)).await;

        assert!(h.repo.find_active(&plate).is_none());
        let closed = h.repo.find(&opened.sid).unwrap();
        assert_eq!(closed.status, SessionStatus::Paid);
        assert_eq!(closed.fee, Some(Decimal::ZERO));
        assert!(matches!(h.barrier_rx.try_recv(), Ok(BarrierCommand::Open { .. })));

        let access = drain_access_events(&mut h.egress_rx);
        assert_eq!(access.len(), 2);
        assert!(access.iter().all(|a| a.t == "granted"));
    }

    #[tokio::test]
    async fn test_unauthorized_plate_denied_and_no_session() {
        let mut h = harness(Config::default(), &[]);

        h.pipeline.process_detection(detection("ZZ999", "cam", 0.9, 1_000_000)).await;

        let plate = PlateNumber::normalize("ZZ999").unwrap();
        assert!(h.repo.find_active(&plate).is_none());
        assert!(h.barrier_rx.try_recv().is_err());

        let access = drain_access_events(&mut h.egress_rx);
        assert_eq!(access.len(), 1);
        assert_eq!(access[0].t, "denied");
        assert_eq!(access[0].reason, "unauthorized");
    }

    #[tokio::test]
    async fn test_debounce_suppresses_duplicate_entry() {
        let mut h = harness(Config::default(), &["XYZ1"]);

        h.pipeline.process_detection(detection("XYZ1", "cam", 0.8, 1_000_000)).await;
        // duplicate read in the window at equal confidence
        h.pipeline.process_detection(detection("XYZ1", "cam", 0.8, 1_001_000)).await;

        assert!(h.barrier_rx.try_recv().is_ok());
        assert!(h.barrier_rx.try_recv().is_err());
        assert_eq!(drain_access_events(&mut h.egress_rx).len(), 1);
    }

    #[tokio::test]
    async fn test_dual_camera_payment_required_exit() {
        let mut h = harness(dual_config(PaymentRequirement::Always), &["AB123"]);
        let plate = PlateNumber::normalize("AB123").unwrap();

        h.pipeline.process_detection(detection("AB123", "lane-in", 0.9, 1_000_000)).await;
        assert!(h.barrier_rx.try_recv().is_ok());
        backdate_active(&h.repo, "AB123", 61);

        // exit camera: payment due, barrier stays closed
        h.pipeline.process_detection(detection("AB123", "lane-out", 0.9, 9_000_000)).await;

        let pending = h.repo.find_active(&plate).unwrap();
        assert_eq!(pending.status, SessionStatus::PendingPayment);
        assert_eq!(pending.fee, Some(dec!(4.00)));
        assert!(h.barrier_rx.try_recv().is_err(), "barrier must stay closed until settlement");

        let access = drain_access_events(&mut h.egress_rx);
        assert_eq!(access.last().unwrap().t, "denied");
        assert_eq!(access.last().unwrap().reason, "payment_due");

        // terminal settles: deferred grant opens the barrier
        let tx = pending.transaction_id.clone().unwrap();
        h.pipeline
            .process_payment_update(PaymentUpdate {
                transaction_id: tx,
                state: PaymentState::Completed,
                received_at: Instant::now(),
            })
            .await;

        assert!(h.repo.find_active(&plate).is_none());
        assert_eq!(h.repo.find(&pending.sid).unwrap().status, SessionStatus::Paid);
        assert!(matches!(h.barrier_rx.try_recv(), Ok(BarrierCommand::Open { .. })));

        let access = drain_access_events(&mut h.egress_rx);
        assert_eq!(access.last().unwrap().t, "granted");
        assert_eq!(access.last().unwrap().reason, "paid_exit");
    }

    #[tokio::test]
    async fn test_exit_replay_during_pending_payment_no_second_transaction() {
        let mut h = harness(dual_config(PaymentRequirement::Always), &["AB123"]);

        h.pipeline.process_detection(detection("AB123", "lane-in", 0.9, 1_000_000)).await;
        backdate_active(&h.repo, "AB123", 61);
        h.pipeline.process_detection(detection("AB123", "lane-out", 0.9, 9_000_000)).await;
        let _ = h.barrier_rx.try_recv();

        // replay past the debounce window while payment is pending
        h.pipeline.process_detection(detection("AB123", "lane-out", 0.9, 20_000_000)).await;

        assert_eq!(h.processor.requests.load(Ordering::SeqCst), 1);
        assert!(h.barrier_rx.try_recv().is_err());

        let access = drain_access_events(&mut h.egress_rx);
        assert_eq!(access.last().unwrap().reason, "payment_pending");
    }

    #[tokio::test]
    async fn test_dual_camera_exit_without_session_is_denied() {
        let mut h = harness(dual_config(PaymentRequirement::Never), &["AB123"]);

        h.pipeline.process_detection(detection("AB123", "lane-out", 0.9, 1_000_000)).await;

        assert!(h.barrier_rx.try_recv().is_err());
        let access = drain_access_events(&mut h.egress_rx);
        assert_eq!(access[0].t, "denied");
        assert_eq!(access[0].reason, "no_active_session");
    }

    #[tokio::test]
    async fn test_payment_timeout_cancels_and_alerts() {
        let config = dual_config(PaymentRequirement::Always).with_payment_timeout_secs(0);
        let mut h = harness(config, &["AB123"]);
        let plate = PlateNumber::normalize("AB123").unwrap();

        h.pipeline.process_detection(detection("AB123", "lane-in", 0.9, 1_000_000)).await;
        backdate_active(&h.repo, "AB123", 61);
        h.pipeline.process_detection(detection("AB123", "lane-out", 0.9, 9_000_000)).await;
        let sid = h.repo.find_active(&plate).unwrap().sid;

        // zero timeout: the next sweep cancels the stuck payment
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        h.pipeline.maintenance_tick().await;

        assert_eq!(h.repo.find(&sid).unwrap().status, SessionStatus::Cancelled);
        assert!(h.repo.find_active(&plate).is_none());

        let mut alert_kinds = Vec::new();
        while let Ok(msg) = h.egress_rx.try_recv() {
            if let EgressMessage::Alert(alert) = msg {
                alert_kinds.push(alert.kind);
            }
        }
        assert_eq!(alert_kinds, vec!["payment_timeout".to_string()]);
    }

    #[tokio::test]
    async fn test_visitor_entry_in_public_park() {
        let config = Config::default()
            .with_access_mode(AccessMode::Public)
            .with_payment_requirement(PaymentRequirement::Always);
        let mut h = harness(config, &[]);
        let plate = PlateNumber::normalize("ZZ999").unwrap();

        h.pipeline.process_detection(detection("ZZ999", "cam", 0.9, 1_000_000)).await;

        let session = h.repo.find_active(&plate).unwrap();
        assert!(!session.authorized, "visitor sessions carry the billing flag");
        assert!(h.barrier_rx.try_recv().is_ok());

        let access = drain_access_events(&mut h.egress_rx);
        assert_eq!(access[0].reason, "visitor");
    }

    #[tokio::test]
    async fn test_confidence_override_does_not_duplicate_session() {
        let mut h = harness(Config::default(), &["XYZ1"]);
        let plate = PlateNumber::normalize("XYZ1").unwrap();

        h.pipeline.process_detection(detection("XYZ1", "cam", 0.6, 1_000_000)).await;
        // higher-confidence re-read upgrades the record without re-running
        // the decision: no exit inference, no second barrier pulse
        h.pipeline.process_detection(detection("XYZ1", "cam", 0.9, 1_001_000)).await;

        assert_eq!(h.repo.session_count(), 1);
        assert!(h.repo.find_active(&plate).is_some());
        assert!(h.barrier_rx.try_recv().is_ok());
        assert!(h.barrier_rx.try_recv().is_err());
    }
}
