//! Shared types for the funding-rate arbitrage engine.
//!
//! These types form the data model used across all modules.
//! They are kept free of I/O so that platform, strategy, and engine
//! modules can depend on them without circular references.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Contract catalog
// ---------------------------------------------------------------------------

/// A perpetual futures contract as reported by the exchange.
///
/// Snapshots are immutable: the catalog replaces the whole list each
/// scan cycle instead of mutating entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    /// Contract identifier, e.g. "BTC_USDT".
    pub id: String,
    /// Spot pair hedging this contract (same naming on Gate).
    pub spot_pair: String,
    /// Current funding rate as a signed fraction (0.0075 = 0.75%).
    pub funding_rate: Decimal,
    /// Seconds between funding settlements.
    pub funding_interval_secs: u64,
    /// Base-asset quantity represented by one contract lot.
    pub multiplier: Decimal,
    pub mark_price: Decimal,
    /// Contract is being delisted; never enter.
    #[serde(default)]
    pub delisting: bool,
}

impl fmt::Display for Contract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} rate={:.4}% every {}h (mult={} mark={})",
            self.id,
            self.funding_rate * dec!(100),
            self.funding_interval_secs / 3600,
            self.multiplier,
            self.mark_price,
        )
    }
}

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// Best bid / best ask of one order book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub bid: Decimal,
    pub ask: Decimal,
}

impl Quote {
    /// A usable book: both sides positive and not crossed.
    pub fn is_valid(&self) -> bool {
        self.bid > Decimal::ZERO && self.ask > Decimal::ZERO && self.ask >= self.bid
    }
}

/// Futures and spot books captured together for one contract.
///
/// Owned by the fetch that produced it; consumed once by sizing or
/// valuation and then dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketSnapshot {
    pub contract: String,
    pub futures: Quote,
    pub spot: Quote,
    pub captured_at: DateTime<Utc>,
}

impl MarketSnapshot {
    /// Age of the snapshot relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.captured_at
    }
}

/// Spot market metadata and recent activity, produced by the
/// availability check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotMarketInfo {
    pub pair: String,
    /// Whether the venue currently accepts orders on this pair.
    pub tradable: bool,
    /// Decimal places allowed in a base-quantity order.
    pub amount_precision: u32,
    pub min_base_amount: Decimal,
    /// Open time of the latest traded candle, if any.
    pub last_trade_at: Option<DateTime<Utc>>,
}

impl SpotMarketInfo {
    /// Smallest representable base-quantity increment.
    pub fn lot_step(&self) -> Decimal {
        Decimal::new(1, self.amount_precision)
    }
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// Which book an order goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Venue {
    Futures,
    Spot,
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Venue::Futures => write!(f, "futures"),
            Venue::Spot => write!(f, "spot"),
        }
    }
}

/// Order direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The opposite side.
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// An immediate-or-cancel market order on one venue.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub venue: Venue,
    /// Contract id (futures) or currency pair (spot).
    pub instrument: String,
    pub side: Side,
    /// Lots for futures, base quantity for spot. Always positive.
    pub size: Decimal,
    /// Only reduce an existing futures position.
    pub reduce_only: bool,
    /// Price the size was derived from; lets the binding express spot
    /// market buys in quote currency.
    pub reference_price: Decimal,
    /// Caller tag echoed back by the venue.
    pub client_tag: String,
}

impl OrderRequest {
    pub fn market(venue: Venue, instrument: &str, side: Side, size: Decimal, reference_price: Decimal) -> Self {
        Self {
            venue,
            instrument: instrument.to_string(),
            side,
            size,
            reduce_only: false,
            reference_price,
            client_tag: format!("t-{}", &Uuid::new_v4().simple().to_string()[..16]),
        }
    }

    pub fn reducing(mut self) -> Self {
        self.reduce_only = true;
        self
    }
}

impl fmt::Display for OrderRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} x{}{} (ref {})",
            self.venue,
            self.side,
            self.instrument,
            self.size,
            if self.reduce_only { " reduce-only" } else { "" },
            self.reference_price,
        )
    }
}

/// What the venue actually executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    /// Executed size in the request's units (lots or base quantity).
    pub filled_size: Decimal,
    /// Volume-weighted fill price; zero when nothing filled or when the
    /// venue omitted it.
    pub avg_price: Decimal,
    /// Fee in quote currency, when the venue reports one we can convert.
    pub fee: Option<Decimal>,
}

impl OrderResult {
    /// Something executed, whether or not a price came back with it.
    pub fn is_filled(&self) -> bool {
        self.filled_size > Decimal::ZERO
    }

    /// This fill, with `fallback` standing in for a missing price.
    pub fn priced_or(mut self, fallback: Decimal) -> Self {
        if self.avg_price <= Decimal::ZERO {
            self.avg_price = fallback;
        }
        self
    }
}

/// A futures position reported by the venue (used for the startup
/// safety check and the per-cycle external-position guard).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenuePosition {
    pub contract: String,
    /// Signed lot count: positive long, negative short.
    pub size: Decimal,
    pub entry_price: Decimal,
}

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// Which way the hedge faces, derived from the funding-rate sign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HedgeDirection {
    /// Positive funding: shorts collect, so short futures and hold spot.
    ShortFuturesLongSpot,
    /// Negative funding: longs collect, so long futures and borrow-sell spot.
    LongFuturesShortSpot,
}

impl HedgeDirection {
    /// `None` for a zero rate: nobody gets paid.
    pub fn from_funding_rate(rate: Decimal) -> Option<Self> {
        if rate > Decimal::ZERO {
            Some(HedgeDirection::ShortFuturesLongSpot)
        } else if rate < Decimal::ZERO {
            Some(HedgeDirection::LongFuturesShortSpot)
        } else {
            None
        }
    }

    pub fn futures_side(&self) -> Side {
        match self {
            HedgeDirection::ShortFuturesLongSpot => Side::Sell,
            HedgeDirection::LongFuturesShortSpot => Side::Buy,
        }
    }

    pub fn spot_side(&self) -> Side {
        self.futures_side().opposite()
    }
}

impl fmt::Display for HedgeDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HedgeDirection::ShortFuturesLongSpot => write!(f, "short futures / long spot"),
            HedgeDirection::LongFuturesShortSpot => write!(f, "long futures / short spot"),
        }
    }
}

/// One executed leg of the hedge: what was actually filled, not what
/// was requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HedgeLeg {
    pub instrument: String,
    pub side: Side,
    /// Lots for futures, base quantity for spot.
    pub size: Decimal,
    /// Base-asset quantity the leg represents.
    pub base_qty: Decimal,
    pub entry_price: Decimal,
    /// Entry fee in quote currency.
    pub entry_fee: Decimal,
}

impl HedgeLeg {
    pub fn notional(&self) -> Decimal {
        self.base_qty * self.entry_price
    }

    /// Price PnL of this leg if unwound at `exit_price`.
    pub fn pnl_at(&self, exit_price: Decimal) -> Decimal {
        self.pnl_for(exit_price, self.base_qty)
    }

    /// Price PnL on `base_qty` of this leg unwound at `exit_price`.
    pub fn pnl_for(&self, exit_price: Decimal, base_qty: Decimal) -> Decimal {
        match self.side {
            Side::Buy => (exit_price - self.entry_price) * base_qty,
            Side::Sell => (self.entry_price - exit_price) * base_qty,
        }
    }
}

/// The single active arbitrage position.
///
/// Created only by the hedge executor after both legs fill and dropped
/// only after both legs are unwound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub contract: String,
    pub direction: HedgeDirection,
    pub funding_rate_at_entry: Decimal,
    pub multiplier: Decimal,
    pub futures: HedgeLeg,
    pub spot: HedgeLeg,
    /// Spot order precision; needed to size the unwind.
    pub spot_amount_precision: u32,
    pub spot_min_base_amount: Decimal,
    pub opened_at: DateTime<Utc>,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] futures {} {} lots @ {} | spot {} {} @ {}",
            self.contract,
            self.direction,
            self.futures.side,
            self.futures.size,
            self.futures.entry_price,
            self.spot.side,
            self.spot.size,
            self.spot.entry_price,
        )
    }
}

impl Position {
    /// Futures notional at entry; the base for yield thresholds.
    pub fn entry_notional(&self) -> Decimal {
        self.futures.notional()
    }

    pub fn entry_fees(&self) -> Decimal {
        self.futures.entry_fee + self.spot.entry_fee
    }

    pub fn holding_secs(&self, now: DateTime<Utc>) -> u64 {
        (now - self.opened_at).num_seconds().max(0) as u64
    }

    /// Quantity below which a spot remainder cannot be traded.
    pub fn spot_dust(&self) -> Decimal {
        Decimal::new(1, self.spot_amount_precision).max(self.spot_min_base_amount)
    }
}

// ---------------------------------------------------------------------------
// Closing
// ---------------------------------------------------------------------------

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    TakeProfit,
    StopLoss,
    MaxHoldingTime,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::TakeProfit => write!(f, "take-profit"),
            CloseReason::StopLoss => write!(f, "stop-loss"),
            CloseReason::MaxHoldingTime => write!(f, "max-holding-time"),
        }
    }
}

/// Append-only record of a completed round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub position_id: Uuid,
    pub contract: String,
    pub direction: HedgeDirection,
    pub reason: CloseReason,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub holding_secs: u64,
    pub futures_exit_price: Decimal,
    pub spot_exit_price: Decimal,
    pub futures_pnl: Decimal,
    pub spot_pnl: Decimal,
    /// Entry plus exit fees on both legs.
    pub fees: Decimal,
    pub funding_income: Decimal,
    pub realized_pnl: Decimal,
}

impl fmt::Display for ClosedTrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} closed ({}) after {}s: futures={:.4} spot={:.4} funding={:.4} fees={:.4} => {:.4}",
            self.contract,
            self.reason,
            self.holding_secs,
            self.futures_pnl,
            self.spot_pnl,
            self.funding_income,
            self.fees,
            self.realized_pnl,
        )
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Error taxonomy shared by the exchange binding and the engine.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ArbError {
    /// Network failure or timeout. Retried on mutating calls, skipped on reads.
    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The venue refused an order; nothing filled.
    #[error("Order rejected: {0}")]
    Rejected(String),

    /// One leg of a two-leg operation executed and the other did not.
    #[error("Partial failure on {contract} (compensated: {compensated}): {detail}")]
    PartialFailure {
        contract: String,
        detail: String,
        compensated: bool,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Empty, crossed or stale market data.
    #[error("Data unavailable: {0}")]
    DataUnavailable(String),

    #[error("Insufficient balance: need {needed}, have {available}")]
    InsufficientBalance { needed: Decimal, available: Decimal },

    #[error("Position not opened by this engine: {0}")]
    ExternalPosition(String),

    /// Close retries exhausted with exposure still open.
    #[error("Close escalated on {contract}: {detail}")]
    CloseEscalated { contract: String, detail: String },

}

impl ArbError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ArbError::Transient(_))
    }

    /// Errors a read path may absorb by skipping the cycle.
    pub fn is_read_skippable(&self) -> bool {
        matches!(
            self,
            ArbError::Transient(_)
                | ArbError::NotFound(_)
                | ArbError::DataUnavailable(_)
                | ArbError::InsufficientBalance { .. }
        )
    }
}

pub type ArbResult<T> = Result<T, ArbError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
