//! Position monitor.
//!
//! Marks the open hedge to market against the prices it would exit at
//! and asks the exit policy whether to close. Never mutates the position.

use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::engine::market_data::fetch_snapshot;
use crate::engine::{bounded, EngineContext};
use crate::strategy::sizing::entry_price;
use crate::strategy::{ExitPolicy, Valuation};
use crate::types::{ArbResult, CloseReason, MarketSnapshot, Position};

pub struct PositionMonitor {
    ctx: EngineContext,
    policy: ExitPolicy,
}

impl PositionMonitor {
    pub fn new(ctx: EngineContext) -> Self {
        let policy = ExitPolicy::from_config(ctx.trading());
        Self { ctx, policy }
    }

    /// One poll. `Ok(None)` means keep holding.
    ///
    /// Holding time is checked first and needs no market data, so an
    /// expired position closes even while reads are failing.
    pub async fn poll(&self, position: &Position) -> ArbResult<Option<CloseReason>> {
        let holding_secs = position.holding_secs(self.ctx.now());
        if self.policy.holding_expired(holding_secs) {
            info!(contract = %position.contract, holding_secs, "Maximum holding time reached");
            return Ok(Some(CloseReason::MaxHoldingTime));
        }

        let snapshot = fetch_snapshot(&self.ctx, &position.contract, &position.spot.instrument).await?;

        let funding = match bounded(
            self.ctx.engine().call_timeout(),
            "fetch_funding_income",
            self.ctx.exchange.fetch_funding_income(&position.contract),
        )
        .await
        {
            Ok(f) => f,
            Err(e) => {
                debug!(contract = %position.contract, error = %e, "Funding income unavailable");
                Decimal::ZERO
            }
        };

        let v = value_position(position, &snapshot, funding, self.ctx.trading().fee_rate);
        let signal = self.policy.evaluate(&v, holding_secs);

        debug!(
            contract = %position.contract,
            futures_pnl = %v.futures_pnl.round_dp(4),
            spot_pnl = %v.spot_pnl.round_dp(4),
            funding = %v.funding_income.round_dp(4),
            fees = %v.fees.round_dp(4),
            unrealized = %v.unrealized_pnl().round_dp(4),
            yield_pct = %(v.yield_on_notional() * Decimal::ONE_HUNDRED).round_dp(4),
            holding_secs,
            "Position marked"
        );
        if let Some(reason) = signal {
            info!(
                contract = %position.contract,
                reason = %reason,
                unrealized = %v.unrealized_pnl().round_dp(4),
                "Close condition met"
            );
        }
        Ok(signal)
    }
}

/// Value `position` at the prices its exit orders would hit, charging
/// entry fees plus estimated exit fees.
pub fn value_position(
    position: &Position,
    snapshot: &MarketSnapshot,
    funding_income: Decimal,
    fee_rate: Decimal,
) -> Valuation {
    let futures_exit = entry_price(position.futures.side.opposite(), snapshot.futures.bid, snapshot.futures.ask);
    let spot_exit = entry_price(position.spot.side.opposite(), snapshot.spot.bid, snapshot.spot.ask);

    let exit_fees = fee_rate
        * (position.futures.base_qty * futures_exit + position.spot.base_qty * spot_exit);

    Valuation {
        futures_pnl: position.futures.pnl_at(futures_exit),
        spot_pnl: position.spot.pnl_at(spot_exit),
        funding_income,
        fees: position.entry_fees() + exit_fees,
        entry_notional: position.entry_notional(),
    }
}
