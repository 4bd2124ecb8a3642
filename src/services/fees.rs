//! Fee policy and calculation
//!
//! Pure functions over a validated policy; no clock access and no IO, so
//! every billing rule is unit-testable. All amounts are `Decimal` - fees
//! never touch floating point.

use crate::infra::error::FeePolicyError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

/// Pricing mode for a car park
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeMode {
    Free,
    Fixed,
    Hourly,
    Tiered,
}

/// One step of a tiered price table: a stay of up to `hours` costs `rate`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FeeTier {
    pub hours: u32,
    pub rate: Decimal,
}

/// Immutable pricing configuration.
///
/// Captured per session at entry; policy changes apply to new sessions only,
/// never retroactively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeePolicy {
    pub mode: FeeMode,
    pub currency: String,
    /// Flat amount (fixed mode) or per-hour rate (hourly mode)
    pub rate: Decimal,
    /// Price table for tiered mode, threshold-ascending
    pub tiers: Vec<FeeTier>,
    /// Stays at or under this length are free regardless of mode
    pub grace_minutes: u64,
}

impl FeePolicy {
    /// Free parking, no grace - the safe default
    pub fn free() -> Self {
        Self {
            mode: FeeMode::Free,
            currency: "USD".to_string(),
            rate: Decimal::ZERO,
            tiers: Vec::new(),
            grace_minutes: 0,
        }
    }

    /// Fail-fast validation, run at configuration load.
    ///
    /// A policy that passes here can still only fail `compute` with
    /// `NegativeDuration` (bad timestamps, not bad configuration).
    pub fn validate(&self) -> Result<(), FeePolicyError> {
        if self.rate.is_sign_negative() {
            return Err(FeePolicyError::NegativeRate);
        }
        if self.mode == FeeMode::Tiered {
            if self.tiers.is_empty() {
                return Err(FeePolicyError::EmptyTiers);
            }
            let mut seen = Vec::with_capacity(self.tiers.len());
            for tier in &self.tiers {
                if tier.hours == 0 {
                    return Err(FeePolicyError::NonPositiveTier);
                }
                if tier.rate.is_sign_negative() {
                    return Err(FeePolicyError::NegativeRate);
                }
                if seen.contains(&tier.hours) {
                    return Err(FeePolicyError::DuplicateTier(tier.hours));
                }
                seen.push(tier.hours);
            }
        }
        Ok(())
    }
}

/// Compute the fee due for a stay from `entry` to `exit`.
///
/// Grace period is a global override evaluated before any mode logic.
/// Hourly mode rounds partial hours up. Tiered mode charges the first tier
/// whose threshold covers the elapsed duration; past the top threshold the
/// top tier's rate applies. Tiers are sorted here even though validation
/// already ran - configuration ordering is never trusted.
pub fn compute(
    policy: &FeePolicy,
    entry: DateTime<Utc>,
    exit: DateTime<Utc>,
) -> Result<Decimal, FeePolicyError> {
    let elapsed = exit.signed_duration_since(entry);
    let secs = elapsed.num_seconds();
    if secs < 0 {
        return Err(FeePolicyError::NegativeDuration);
    }
    let secs = secs as u64;

    if secs <= policy.grace_minutes * 60 {
        return Ok(Decimal::ZERO);
    }

    match policy.mode {
        FeeMode::Free => Ok(Decimal::ZERO),
        FeeMode::Fixed => Ok(policy.rate),
        FeeMode::Hourly => {
            let hours = secs.div_ceil(3600).max(1);
            Ok(Decimal::from(hours) * policy.rate)
        }
        FeeMode::Tiered => {
            if policy.tiers.is_empty() {
                return Err(FeePolicyError::EmptyTiers);
            }
            let mut tiers = policy.tiers.clone();
            tiers.sort_by_key(|t| t.hours);
            let rate = tiers
                .iter()
                .find(|t| secs <= u64::from(t.hours) * 3600)
                .map(|t| t.rate)
                .unwrap_or_else(|| tiers[tiers.len() - 1].rate);
            Ok(rate)
        }
    }
}
