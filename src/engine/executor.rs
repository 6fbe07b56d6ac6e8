//! Hedge executor.
//!
//! Places the futures leg, then the spot leg sized from what the futures
//! leg actually filled. Either both legs end up filled and a `Position`
//! comes back, or every filled quantity is reversed and the caller gets
//! an error. A half-open hedge never leaves this module.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::engine::{bounded, EngineContext};
use crate::strategy::sizing::{matched_spot_qty, HedgePlan};
use crate::types::{
    ArbError, ArbResult, HedgeLeg, OrderRequest, OrderResult, Position, Side, Venue,
};

/// Spot fills below this share of the requested quantity count as failed.
const MIN_SPOT_FILL_RATIO: Decimal = dec!(0.98);

pub struct HedgeExecutor {
    ctx: EngineContext,
}

impl HedgeExecutor {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Open both legs of `plan`.
    ///
    /// Errors:
    /// - `Rejected` / `Transient`: the futures leg never filled; nothing to undo.
    /// - `PartialFailure`: the futures leg filled and the spot leg did not;
    ///   `compensated` is true only when the reversal succeeded and the
    ///   spot outcome is known.
    pub async fn open(&self, plan: &HedgePlan) -> ArbResult<Position> {
        let contract = plan.contract.id.as_str();
        let timeout = self.ctx.engine().call_timeout();
        let retry = self.ctx.retry_policy();
        let leverage = self.ctx.trading().leverage;
        let base_currency = plan.spot.pair.split('_').next().unwrap_or(plan.spot.pair.as_str());

        // Spot side borrows on the unified account, so its leverage goes first
        retry
            .run("set_spot_leverage", |_| {
                bounded(
                    timeout,
                    "set_spot_leverage",
                    self.ctx.exchange.set_spot_leverage(base_currency, leverage),
                )
            })
            .await?;
        retry
            .run("set_leverage", |_| {
                bounded(timeout, "set_leverage", self.ctx.exchange.set_leverage(contract, leverage))
            })
            .await?;

        // Futures first
        let futures_side = plan.direction.futures_side();
        let futures_req = OrderRequest::market(
            Venue::Futures,
            contract,
            futures_side,
            plan.futures_lots,
            plan.futures_price,
        );
        let futures_fill = self.place_futures_entry(&futures_req).await?;
        if !futures_fill.is_filled() {
            return Err(ArbError::Rejected(format!("{contract}: futures order did not fill")));
        }
        let futures_fill = if futures_fill.avg_price > Decimal::ZERO {
            futures_fill
        } else {
            self.price_unpriced_fill(&futures_req, futures_fill).await
        };

        let lots = futures_fill.filled_size.min(plan.futures_lots);
        let spot_qty = if lots < plan.futures_lots {
            warn!(
                contract,
                requested = %plan.futures_lots,
                filled = %lots,
                "Partial futures fill, resizing spot leg"
            );
            matched_spot_qty(
                lots,
                plan.contract.multiplier,
                plan.futures_price,
                plan.spot_price,
                plan.spot.amount_precision,
            )
        } else {
            plan.spot_qty
        };

        info!(
            contract,
            side = %futures_side,
            lots = %lots,
            price = %futures_fill.avg_price,
            order_id = %futures_fill.order_id,
            "Futures leg filled"
        );

        if spot_qty <= Decimal::ZERO || spot_qty < plan.spot.min_base_amount {
            let compensated = self.compensate(plan, lots, None).await;
            return Err(self.partial_failure(
                contract,
                format!("spot quantity {spot_qty} below pair minimum after partial futures fill"),
                compensated,
            ));
        }

        // Spot second; no retry here, a failure is reversed instead
        let spot_side = plan.direction.spot_side();
        let spot_req = OrderRequest::market(
            Venue::Spot,
            &plan.spot.pair,
            spot_side,
            spot_qty,
            plan.spot_price,
        );
        let spot_result = bounded(timeout, "place_order", self.ctx.exchange.place_order(&spot_req)).await;

        let spot_fill = match spot_result {
            Ok(fill) if fill.is_filled() && fill.filled_size >= spot_qty * MIN_SPOT_FILL_RATIO => {
                fill.priced_or(plan.spot_price)
            }
            Ok(fill) => {
                let compensated = self.compensate(plan, lots, Some(&fill)).await;
                return Err(self.partial_failure(
                    contract,
                    format!("spot filled {} of {spot_qty}", fill.filled_size),
                    compensated,
                ));
            }
            Err(e) => {
                // A timed-out spot order may still have filled on the venue
                let reversed = self.compensate(plan, lots, None).await;
                let compensated = reversed && !e.is_transient();
                return Err(self.partial_failure(contract, format!("spot order failed: {e}"), compensated));
            }
        };

        let fee_rate = self.ctx.trading().fee_rate;
        let futures_base = lots * plan.contract.multiplier;
        let futures_fee = futures_fill
            .fee
            .unwrap_or(fee_rate * futures_base * futures_fill.avg_price);
        let spot_fee = spot_fill
            .fee
            .unwrap_or(fee_rate * spot_fill.filled_size * spot_fill.avg_price);

        let position = Position {
            id: uuid::Uuid::new_v4(),
            contract: contract.to_string(),
            direction: plan.direction,
            funding_rate_at_entry: plan.contract.funding_rate,
            multiplier: plan.contract.multiplier,
            futures: HedgeLeg {
                instrument: contract.to_string(),
                side: futures_side,
                size: lots,
                base_qty: futures_base,
                entry_price: futures_fill.avg_price,
                entry_fee: futures_fee,
            },
            spot: HedgeLeg {
                instrument: plan.spot.pair.clone(),
                side: spot_side,
                size: spot_fill.filled_size,
                base_qty: spot_fill.filled_size,
                entry_price: spot_fill.avg_price,
                entry_fee: spot_fee,
            },
            spot_amount_precision: plan.spot.amount_precision,
            spot_min_base_amount: plan.spot.min_base_amount,
            opened_at: self.ctx.now(),
        };

        info!(
            position = %position,
            futures_notional = %position.futures.notional(),
            spot_notional = %position.spot.notional(),
            fees = %position.entry_fees(),
            "Hedge opened"
        );
        Ok(position)
    }

    /// Place the futures entry. A timeout leaves the outcome unknown, so
    /// the account is checked for a fill before anything is retried.
    async fn place_futures_entry(&self, req: &OrderRequest) -> ArbResult<OrderResult> {
        let timeout = self.ctx.engine().call_timeout();
        let retry = self.ctx.retry_policy();
        let mut attempt = 1;

        loop {
            match bounded(timeout, "place_order", self.ctx.exchange.place_order(req)).await {
                Ok(fill) => return Ok(fill),
                Err(e) if e.is_transient() => {
                    match self.fill_from_account(req).await {
                        Ok(Some(fill)) => {
                            warn!(contract = %req.instrument, lots = %fill.filled_size, "Futures fill found after timeout");
                            return Ok(fill);
                        }
                        Ok(None) => {}
                        Err(lookup) => {
                            error!(contract = %req.instrument, error = %lookup, "Futures order outcome unknown");
                            return Err(ArbError::PartialFailure {
                                contract: req.instrument.clone(),
                                detail: format!("futures order outcome unknown after {e}"),
                                compensated: false,
                            });
                        }
                    }
                    if attempt >= retry.max_attempts {
                        return Err(e);
                    }
                    warn!(contract = %req.instrument, attempt, error = %e, "Retrying futures entry");
                    sleep(retry.delay_for(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Price a fill that came back without one: the account's entry
    /// price when it has one, else the planned reference price.
    async fn price_unpriced_fill(&self, req: &OrderRequest, fill: OrderResult) -> OrderResult {
        let account_price = match self.fill_from_account(req).await {
            Ok(Some(found)) => Some(found.avg_price).filter(|p| *p > Decimal::ZERO),
            Ok(None) => None,
            Err(e) => {
                warn!(contract = %req.instrument, error = %e, "Position lookup for fill price failed");
                None
            }
        };
        let price = account_price.unwrap_or(req.reference_price);
        warn!(
            contract = %req.instrument,
            lots = %fill.filled_size,
            price = %price,
            from_account = account_price.is_some(),
            "Futures fill reported without a price"
        );
        fill.priced_or(price)
    }

    /// The position a lost futures order would have produced, if any.
    async fn fill_from_account(&self, req: &OrderRequest) -> ArbResult<Option<OrderResult>> {
        let positions = bounded(
            self.ctx.engine().call_timeout(),
            "fetch_open_positions",
            self.ctx.exchange.fetch_open_positions(),
        )
        .await?;

        Ok(positions
            .into_iter()
            .find(|p| {
                p.contract == req.instrument
                    && match req.side {
                        Side::Buy => p.size > Decimal::ZERO,
                        Side::Sell => p.size < Decimal::ZERO,
                    }
            })
            .map(|p| OrderResult {
                order_id: "reconciled".to_string(),
                filled_size: p.size.abs(),
                avg_price: p.entry_price,
                fee: None,
            }))
    }

    /// Reverse the filled futures lots and any partial spot fill.
    /// Returns true only when nothing is left open.
    async fn compensate(&self, plan: &HedgePlan, lots: Decimal, spot_fill: Option<&OrderResult>) -> bool {
        let contract = plan.contract.id.as_str();
        let mut clean = true;

        let futures_req = OrderRequest::market(
            Venue::Futures,
            contract,
            plan.direction.futures_side().opposite(),
            lots,
            plan.futures_price,
        )
        .reducing();
        match self.reverse(&futures_req).await {
            Ok(filled) if filled >= lots => {
                warn!(contract, lots = %lots, "Futures leg reversed");
            }
            Ok(filled) => {
                error!(contract, reversed = %filled, lots = %lots, "Futures leg only partly reversed");
                clean = false;
            }
            Err(e) => {
                error!(contract, error = %e, "Failed to reverse futures leg");
                clean = false;
            }
        }

        if let Some(fill) = spot_fill {
            let qty = fill.filled_size.round_dp_with_strategy(
                plan.spot.amount_precision,
                rust_decimal::RoundingStrategy::ToZero,
            );
            let dust = plan.spot.lot_step().max(plan.spot.min_base_amount);
            if qty >= dust {
                let spot_req = OrderRequest::market(
                    Venue::Spot,
                    &plan.spot.pair,
                    plan.direction.spot_side().opposite(),
                    qty,
                    plan.spot_price,
                );
                match self.reverse(&spot_req).await {
                    Ok(filled) if filled >= qty * MIN_SPOT_FILL_RATIO => {
                        warn!(contract, qty = %qty, "Partial spot fill reversed");
                    }
                    Ok(filled) => {
                        error!(contract, reversed = %filled, qty = %qty, "Partial spot fill only partly reversed");
                        clean = false;
                    }
                    Err(e) => {
                        error!(contract, error = %e, "Failed to reverse partial spot fill");
                        clean = false;
                    }
                }
            }
        }
        clean
    }

    async fn reverse(&self, req: &OrderRequest) -> ArbResult<Decimal> {
        let timeout = self.ctx.engine().call_timeout();
        let fill = self
            .ctx
            .retry_policy()
            .run("reverse", |_| bounded(timeout, "place_order", self.ctx.exchange.place_order(req)))
            .await?;
        Ok(fill.filled_size)
    }

    fn partial_failure(&self, contract: &str, detail: String, compensated: bool) -> ArbError {
        error!(contract, detail = %detail, compensated, "Hedge entry failed after futures fill");
        ArbError::PartialFailure {
            contract: contract.to_string(),
            detail,
            compensated,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
