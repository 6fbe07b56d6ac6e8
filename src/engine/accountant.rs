//! Accountant: session statistics over closed trades.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

use crate::types::ClosedTrade;

/// Running totals for this engine's trading history. Persisted with the
/// engine snapshot so a restart continues the count.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub trades: u64,
    pub wins: u64,
    pub losses: u64,
    pub realized_pnl: Decimal,
    pub fees: Decimal,
    pub funding_income: Decimal,
    /// Entries that ended in a partial failure.
    pub partial_failures: u64,
}

impl SessionStats {
    pub fn win_rate(&self) -> Decimal {
        if self.trades == 0 {
            return Decimal::ZERO;
        }
        Decimal::from(self.wins) / Decimal::from(self.trades)
    }
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} trades ({}W/{}L, {:.1}%), pnl={:.4} fees={:.4} funding={:.4}",
            self.trades,
            self.wins,
            self.losses,
            self.win_rate() * dec!(100),
            self.realized_pnl,
            self.fees,
            self.funding_income,
        )
    }
}

pub struct Accountant;

impl Accountant {
    /// Fold one closed trade into the session totals.
    pub fn record(stats: &mut SessionStats, trade: &ClosedTrade) {
        stats.trades += 1;
        if trade.realized_pnl > Decimal::ZERO {
            stats.wins += 1;
        } else {
            stats.losses += 1;
        }
        stats.realized_pnl += trade.realized_pnl;
        stats.fees += trade.fees;
        stats.funding_income += trade.funding_income;

        info!(
            contract = %trade.contract,
            pnl = %trade.realized_pnl.round_dp(4),
            session_pnl = %stats.realized_pnl.round_dp(4),
            trades = stats.trades,
            "Trade recorded"
        );
    }

    pub fn record_partial_failure(stats: &mut SessionStats) {
        stats.partial_failures += 1;
    }
}
