//! Typed errors for the decision/session core
//!
//! Errors with a safe local default (deny, keep the barrier closed) are
//! converted into denial or alert events by the pipeline rather than
//! propagated; these types carry the reason across that boundary.

use crate::domain::session::SessionStatus;
use crate::domain::types::PlateNumber;
use thiserror::Error;

/// Session state machine violations
#[derive(Debug, Error)]
pub enum SessionError {
    /// A second open session for the same plate was attempted
    #[error("session conflict: plate {plate} already has an open session {sid}")]
    Conflict { plate: PlateNumber, sid: String },

    #[error("session {0} not found")]
    NotFound(String),

    #[error("invalid session transition {from:?} -> {to:?} for {sid}")]
    InvalidTransition { sid: String, from: SessionStatus, to: SessionStatus },
}

/// Fee policy configuration/computation failures.
///
/// Raised instead of silently computing a wrong amount; the session then
/// surfaces as requiring manual fee entry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FeePolicyError {
    #[error("fee rate must not be negative")]
    NegativeRate,

    #[error("tiered fee policy requires at least one tier")]
    EmptyTiers,

    #[error("tier threshold must be a positive number of hours")]
    NonPositiveTier,

    #[error("duplicate tier threshold: {0} hours")]
    DuplicateTier(u32),

    #[error("exit time precedes entry time")]
    NegativeDuration,
}

/// Payment processor call failures (the transaction itself reports its
/// terminal state separately, through notifications)
#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("payment request failed: {0}")]
    Request(String),

    #[error("payment cancel failed: {0}")]
    Cancel(String),
}
