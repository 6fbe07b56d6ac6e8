//! Delta-neutral leg sizing.
//!
//! Both legs come out of one computation over the same balance and the
//! same snapshot: the futures lot count is derived first, and the spot
//! quantity is the base amount those lots represent, valued at the spot
//! entry price and rounded down to the pair's precision. The residual
//! notional gap is therefore under one spot step.

use rust_decimal::prelude::*;
use tracing::debug;

use crate::types::{
    ArbError, ArbResult, Contract, HedgeDirection, MarketSnapshot, Side, SpotMarketInfo,
};

/// Everything the executor needs to place both legs.
#[derive(Debug, Clone, PartialEq)]
pub struct HedgePlan {
    pub contract: Contract,
    pub direction: HedgeDirection,
    /// Whole futures lots.
    pub futures_lots: Decimal,
    /// Price the futures leg is expected to fill at (bid when selling, ask when buying).
    pub futures_price: Decimal,
    /// Spot base quantity.
    pub spot_qty: Decimal,
    pub spot_price: Decimal,
    pub spot: SpotMarketInfo,
    /// Quote balance the plan was sized from.
    pub balance: Decimal,
}

impl HedgePlan {
    pub fn futures_notional(&self) -> Decimal {
        self.futures_lots * self.contract.multiplier * self.futures_price
    }

    pub fn spot_notional(&self) -> Decimal {
        self.spot_qty * self.spot_price
    }

    /// Largest notional mismatch spot rounding can introduce.
    pub fn delta_tolerance(&self) -> Decimal {
        self.spot.lot_step() * self.spot_price
    }
}

/// Entry price for a side: sells hit the bid, buys lift the ask.
pub fn entry_price(side: Side, bid: Decimal, ask: Decimal) -> Decimal {
    match side {
        Side::Sell => bid,
        Side::Buy => ask,
    }
}

/// Spot base quantity matching `lots` futures lots, rounded down to
/// `precision` decimal places.
pub fn matched_spot_qty(
    lots: Decimal,
    multiplier: Decimal,
    futures_price: Decimal,
    spot_price: Decimal,
    precision: u32,
) -> Decimal {
    if spot_price <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (lots * multiplier * futures_price / spot_price)
        .round_dp_with_strategy(precision, RoundingStrategy::ToZero)
}

/// Size both legs from `balance × leverage` and one snapshot.
pub fn plan_hedge(
    contract: &Contract,
    spot: &SpotMarketInfo,
    snapshot: &MarketSnapshot,
    balance: Decimal,
    leverage: u32,
) -> ArbResult<HedgePlan> {
    let direction = HedgeDirection::from_funding_rate(contract.funding_rate)
        .ok_or_else(|| ArbError::DataUnavailable(format!("{}: zero funding rate", contract.id)))?;

    if !snapshot.futures.is_valid() || !snapshot.spot.is_valid() {
        return Err(ArbError::DataUnavailable(format!(
            "{}: unusable book (futures {:?}, spot {:?})",
            contract.id, snapshot.futures, snapshot.spot
        )));
    }
    if contract.multiplier <= Decimal::ZERO {
        return Err(ArbError::DataUnavailable(format!("{}: zero multiplier", contract.id)));
    }

    let futures_price = entry_price(direction.futures_side(), snapshot.futures.bid, snapshot.futures.ask);
    let spot_price = entry_price(direction.spot_side(), snapshot.spot.bid, snapshot.spot.ask);
    let leverage = Decimal::from(leverage);

    let futures_lots = (balance * leverage / futures_price / contract.multiplier).floor();
    if futures_lots < Decimal::ONE {
        return Err(ArbError::InsufficientBalance {
            needed: (futures_price * contract.multiplier / leverage).round_dp(4),
            available: balance,
        });
    }

    let spot_qty = matched_spot_qty(
        futures_lots,
        contract.multiplier,
        futures_price,
        spot_price,
        spot.amount_precision,
    );
    if spot_qty <= Decimal::ZERO || spot_qty < spot.min_base_amount {
        return Err(ArbError::InsufficientBalance {
            needed: (spot.min_base_amount * spot_price / leverage).round_dp(4),
            available: balance,
        });
    }

    let plan = HedgePlan {
        contract: contract.clone(),
        direction,
        futures_lots,
        futures_price,
        spot_qty,
        spot_price,
        spot: spot.clone(),
        balance,
    };

    debug!(
        contract = %contract.id,
        lots = %plan.futures_lots,
        spot_qty = %plan.spot_qty,
        futures_notional = %plan.futures_notional(),
        spot_notional = %plan.spot_notional(),
        "Hedge sized"
    );
    Ok(plan)
}
