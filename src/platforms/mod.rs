//! Exchange integrations.
//!
//! Defines the `Exchange` trait the engine consumes and provides the
//! Gate.io binding. Every method returns a discriminated `ArbError` so
//! callers can tell "nothing there" from "something went wrong".

pub mod gate;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::types::{
    ArbResult, Contract, OrderRequest, OrderResult, Quote, SpotMarketInfo, VenuePosition,
};

/// Abstraction over a venue offering USDT-settled perpetuals and spot.
///
/// Implementations must be cheap to share: the engine holds one behind an
/// `Arc` and calls it from the validator's worker pool concurrently.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Exchange: Send + Sync {
    /// All perpetual contracts. An empty list is not an error.
    async fn fetch_contracts(&self) -> ArbResult<Vec<Contract>>;

    /// Best bid/ask of a futures contract.
    async fn fetch_futures_quote(&self, contract: &str) -> ArbResult<Quote>;

    /// Best bid/ask of a spot pair.
    async fn fetch_spot_quote(&self, pair: &str) -> ArbResult<Quote>;

    /// Spot pair metadata plus time of its latest trade.
    /// `NotFound` when the pair does not exist.
    async fn fetch_spot_market(&self, pair: &str) -> ArbResult<SpotMarketInfo>;

    /// Place an order. `Rejected` when the venue refuses it.
    async fn place_order(&self, request: &OrderRequest) -> ArbResult<OrderResult>;

    /// Available quote-currency funds.
    async fn fetch_balance(&self) -> ArbResult<Decimal>;

    /// Non-empty futures positions on the account.
    async fn fetch_open_positions(&self) -> ArbResult<Vec<VenuePosition>>;

    /// Funding paid to (positive) or by (negative) the current position.
    async fn fetch_funding_income(&self, contract: &str) -> ArbResult<Decimal>;

    async fn set_leverage(&self, contract: &str, leverage: u32) -> ArbResult<()>;

    /// Borrow leverage on the unified account for one spot currency.
    async fn set_spot_leverage(&self, currency: &str, leverage: u32) -> ArbResult<()>;
}
