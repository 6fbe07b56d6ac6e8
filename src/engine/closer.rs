//! Position closer.
//!
//! Unwinds the futures leg first, then the spot leg, sized from the
//! recorded fills rather than the current balance. Progress is kept per
//! leg in a [`CloseProgress`] owned by the caller, so a retry after an
//! escalation (or a restart) never re-closes a leg that is already flat.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::engine::{bounded, EngineContext};
use crate::strategy::sizing::entry_price;
use crate::types::{
    ArbError, ArbResult, CloseReason, ClosedTrade, HedgeLeg, OrderRequest, OrderResult, Position,
    Venue,
};

/// Fills accumulated while unwinding one leg.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LegProgress {
    /// In order units: lots for futures, base quantity for spot.
    pub filled: Decimal,
    pub base_filled: Decimal,
    /// Σ base × price over the exit fills.
    pub quote_value: Decimal,
    pub fees: Decimal,
}

impl LegProgress {
    pub fn avg_price(&self) -> Decimal {
        if self.base_filled > Decimal::ZERO {
            self.quote_value / self.base_filled
        } else {
            Decimal::ZERO
        }
    }

    fn record(&mut self, fill: &OrderResult, base_per_unit: Decimal, fee_rate: Decimal) {
        let base = fill.filled_size * base_per_unit;
        self.filled += fill.filled_size;
        self.base_filled += base;
        self.quote_value += base * fill.avg_price;
        self.fees += fill.fee.unwrap_or(fee_rate * base * fill.avg_price);
    }
}

/// Persistable state of an in-flight close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseProgress {
    pub reason: CloseReason,
    pub started_at: DateTime<Utc>,
    pub futures: LegProgress,
    pub spot: LegProgress,
    /// Read once, before the futures leg is closed.
    pub funding_income: Option<Decimal>,
    /// Number of close passes that ended escalated.
    pub escalations: u32,
}

impl CloseProgress {
    pub fn new(reason: CloseReason, started_at: DateTime<Utc>) -> Self {
        Self {
            reason,
            started_at,
            futures: LegProgress::default(),
            spot: LegProgress::default(),
            funding_income: None,
            escalations: 0,
        }
    }

    pub fn futures_remaining(&self, position: &Position) -> Decimal {
        (position.futures.size - self.futures.filled).max(Decimal::ZERO)
    }

    /// Spot quantity still to unwind, rounded to a tradable amount.
    /// Anything below the pair's dust size counts as flat.
    pub fn spot_remaining(&self, position: &Position) -> Decimal {
        let raw = (position.spot.size - self.spot.filled)
            .round_dp_with_strategy(position.spot_amount_precision, RoundingStrategy::ToZero);
        if raw < position.spot_dust() {
            Decimal::ZERO
        } else {
            raw
        }
    }
}

pub struct PositionCloser {
    ctx: EngineContext,
}

impl PositionCloser {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Unwind both legs and produce the trade record.
    ///
    /// On `CloseEscalated` the exposure is still (partly) open and
    /// `progress` reflects everything that did fill; call again with the
    /// same progress to resume.
    pub async fn close(&self, position: &Position, progress: &mut CloseProgress) -> ArbResult<ClosedTrade> {
        info!(
            contract = %position.contract,
            reason = %progress.reason,
            futures_left = %progress.futures_remaining(position),
            spot_left = %progress.spot_remaining(position),
            "Closing position"
        );

        if progress.funding_income.is_none() && progress.futures_remaining(position) > Decimal::ZERO {
            match bounded(
                self.ctx.engine().call_timeout(),
                "fetch_funding_income",
                self.ctx.exchange.fetch_funding_income(&position.contract),
            )
            .await
            {
                Ok(funding) => progress.funding_income = Some(funding),
                Err(e) => warn!(contract = %position.contract, error = %e, "Funding income unavailable at close"),
            }
        }

        // Futures before spot: a failed futures unwind keeps the spot hedge in place
        if let Err(e) = self.close_leg(position, Venue::Futures, progress).await {
            progress.escalations += 1;
            return Err(e);
        }
        if let Err(e) = self.close_leg(position, Venue::Spot, progress).await {
            progress.escalations += 1;
            return Err(e);
        }

        let trade = self.settle(position, progress);
        info!(trade = %trade, "Position closed");
        Ok(trade)
    }

    async fn close_leg(&self, position: &Position, venue: Venue, progress: &mut CloseProgress) -> ArbResult<()> {
        let (leg, base_per_unit) = match venue {
            Venue::Futures => (&position.futures, position.multiplier),
            Venue::Spot => (&position.spot, Decimal::ONE),
        };
        let retry = self.ctx.retry_policy();
        let fee_rate = self.ctx.trading().fee_rate;
        let mut failures = 0;

        loop {
            let remaining = match venue {
                Venue::Futures => progress.futures_remaining(position),
                Venue::Spot => progress.spot_remaining(position),
            };
            if remaining <= Decimal::ZERO {
                return Ok(());
            }

            let err = match self.exit_order(leg, venue, remaining).await {
                Ok(fill) if fill.is_filled() => {
                    let leg_progress = match venue {
                        Venue::Futures => &mut progress.futures,
                        Venue::Spot => &mut progress.spot,
                    };
                    leg_progress.record(&fill, base_per_unit, fee_rate);
                    debug!(
                        contract = %position.contract,
                        venue = %venue,
                        filled = %fill.filled_size,
                        price = %fill.avg_price,
                        "Exit fill"
                    );
                    continue;
                }
                Ok(_) => ArbError::Transient(format!("{venue} exit order did not fill")),
                Err(e) => e,
            };

            failures += 1;
            if failures >= retry.max_attempts {
                error!(
                    contract = %position.contract,
                    venue = %venue,
                    remaining = %remaining,
                    attempts = failures,
                    error = %err,
                    "Close retries exhausted"
                );
                return Err(ArbError::CloseEscalated {
                    contract: position.contract.clone(),
                    detail: format!("{venue} leg still open ({remaining} left): {err}"),
                });
            }
            let delay = retry.delay_for(failures);
            warn!(
                contract = %position.contract,
                venue = %venue,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Exit order failed, retrying"
            );
            sleep(delay).await;
        }
    }

    /// One market exit for `size` of `leg`, priced off the current book.
    /// A fill without a price is booked at that book price.
    async fn exit_order(&self, leg: &HedgeLeg, venue: Venue, size: Decimal) -> ArbResult<OrderResult> {
        let timeout = self.ctx.engine().call_timeout();
        let quote = match venue {
            Venue::Futures => {
                bounded(timeout, "fetch_futures_quote", self.ctx.exchange.fetch_futures_quote(&leg.instrument))
                    .await?
            }
            Venue::Spot => {
                bounded(timeout, "fetch_spot_quote", self.ctx.exchange.fetch_spot_quote(&leg.instrument)).await?
            }
        };
        if !quote.is_valid() {
            return Err(ArbError::DataUnavailable(format!(
                "{}: no usable {venue} book for exit",
                leg.instrument
            )));
        }

        let side = leg.side.opposite();
        let price = entry_price(side, quote.bid, quote.ask);
        let mut req = OrderRequest::market(venue, &leg.instrument, side, size, price);
        if venue == Venue::Futures {
            req = req.reducing();
        }
        let fill = bounded(timeout, "place_order", self.ctx.exchange.place_order(&req)).await?;
        Ok(fill.priced_or(price))
    }

    fn settle(&self, position: &Position, progress: &CloseProgress) -> ClosedTrade {
        let closed_at = self.ctx.now();
        let futures_exit_price = progress.futures.avg_price();
        let spot_exit_price = progress.spot.avg_price();
        let futures_pnl = position.futures.pnl_for(futures_exit_price, progress.futures.base_filled);
        let spot_pnl = position.spot.pnl_for(spot_exit_price, progress.spot.base_filled);
        let fees = position.entry_fees() + progress.futures.fees + progress.spot.fees;
        let funding_income = progress.funding_income.unwrap_or(Decimal::ZERO);

        ClosedTrade {
            position_id: position.id,
            contract: position.contract.clone(),
            direction: position.direction,
            reason: progress.reason,
            opened_at: position.opened_at,
            closed_at,
            holding_secs: position.holding_secs(closed_at),
            futures_exit_price,
            spot_exit_price,
            futures_pnl,
            spot_pnl,
            fees,
            funding_income,
            realized_pnl: futures_pnl + spot_pnl - fees + funding_income,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
