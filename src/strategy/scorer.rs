//! Funding-yield ranking.
//!
//! Normalises each contract's funding rate to an annualized percentage
//! so contracts with different settlement frequencies compare fairly.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::cmp::Ordering;
use tracing::debug;

use crate::types::Contract;

const SECONDS_PER_DAY: Decimal = dec!(86400);
const DAYS_PER_YEAR: Decimal = dec!(365);

/// A contract that passed the rate filter, with its annualized yield.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredContract {
    pub contract: Contract,
    /// Annualized funding yield in percent (821.25 = 821.25 %).
    pub annualized_yield_pct: Decimal,
}

/// `|rate| × 100 × (86400 / interval) × 365`.
///
/// Returns `None` for a zero interval: such a contract has no meaningful
/// settlement cadence.
pub fn annualized_yield_pct(funding_rate: Decimal, interval_secs: u64) -> Option<Decimal> {
    if interval_secs == 0 {
        return None;
    }
    let settlements_per_day = SECONDS_PER_DAY / Decimal::from(interval_secs);
    Some(funding_rate.abs() * dec!(100) * settlements_per_day * DAYS_PER_YEAR)
}

/// Filter by `|rate| >= min_rate`, rank by yield descending (ties by id
/// ascending) and keep at most `max_candidates`.
///
/// Pure: identical input always yields the identical sequence.
pub fn rank(contracts: &[Contract], min_rate: Decimal, max_candidates: usize) -> Vec<ScoredContract> {
    let mut scored: Vec<ScoredContract> = contracts
        .iter()
        .filter(|c| c.funding_rate.abs() >= min_rate)
        .filter_map(|c| {
            annualized_yield_pct(c.funding_rate, c.funding_interval_secs).map(|y| ScoredContract {
                contract: c.clone(),
                annualized_yield_pct: y,
            })
        })
        .collect();

    scored.sort_by(|a, b| match b.annualized_yield_pct.cmp(&a.annualized_yield_pct) {
        Ordering::Equal => a.contract.id.cmp(&b.contract.id),
        other => other,
    });
    scored.truncate(max_candidates);

    debug!(
        contracts_in = contracts.len(),
        candidates = scored.len(),
        top = scored.first().map(|s| s.contract.id.as_str()).unwrap_or("-"),
        "Contracts ranked"
    );
    scored
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
