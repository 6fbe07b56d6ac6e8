//! Close policy.
//!
//! Thresholds are fractions of entry notional: a profit threshold of
//! 0.001 closes once the hedge has earned 0.1 % of what it put on.

use rust_decimal::Decimal;

use crate::config::TradingConfig;
use crate::types::CloseReason;

/// Mark-to-market view of an open hedge.
#[derive(Debug, Clone, PartialEq)]
pub struct Valuation {
    pub futures_pnl: Decimal,
    pub spot_pnl: Decimal,
    pub funding_income: Decimal,
    /// Entry fees paid plus estimated exit fees.
    pub fees: Decimal,
    pub entry_notional: Decimal,
}

impl Valuation {
    pub fn unrealized_pnl(&self) -> Decimal {
        self.futures_pnl + self.spot_pnl + self.funding_income - self.fees
    }

    /// Unrealized PnL over entry notional; zero when nothing was put on.
    pub fn yield_on_notional(&self) -> Decimal {
        if self.entry_notional <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.unrealized_pnl() / self.entry_notional
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExitPolicy {
    pub profit_threshold: Decimal,
    pub loss_threshold: Decimal,
    pub max_holding_secs: u64,
}

impl ExitPolicy {
    pub fn from_config(cfg: &TradingConfig) -> Self {
        Self {
            profit_threshold: cfg.close_profit_threshold,
            loss_threshold: cfg.close_loss_threshold,
            max_holding_secs: cfg.max_holding_secs,
        }
    }

    pub fn holding_expired(&self, holding_secs: u64) -> bool {
        holding_secs >= self.max_holding_secs
    }

    /// First matching trigger: take-profit, stop-loss, then holding time.
    pub fn evaluate(&self, valuation: &Valuation, holding_secs: u64) -> Option<CloseReason> {
        let y = valuation.yield_on_notional();
        if y >= self.profit_threshold {
            Some(CloseReason::TakeProfit)
        } else if y <= self.loss_threshold {
            Some(CloseReason::StopLoss)
        } else if self.holding_expired(holding_secs) {
            Some(CloseReason::MaxHoldingTime)
        } else {
            None
        }
    }
}
