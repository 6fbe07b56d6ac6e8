//! Contract catalog.
//!
//! Fetches the perpetual contract list fresh every scan cycle and keeps
//! only contracts the engine could actually trade.

use tracing::debug;

use crate::engine::{bounded, EngineContext};
use crate::types::{ArbResult, Contract};
use rust_decimal::Decimal;

pub struct ContractCatalog;

impl ContractCatalog {
    /// Replace-wholesale snapshot of tradable contracts. An empty
    /// exchange listing is an empty catalog, not an error.
    pub async fn refresh(ctx: &EngineContext) -> ArbResult<Vec<Contract>> {
        let raw = bounded(
            ctx.engine().call_timeout(),
            "fetch_contracts",
            ctx.exchange.fetch_contracts(),
        )
        .await?;

        let listed = raw.len();
        let usable: Vec<Contract> = raw.into_iter().filter(is_tradable).collect();

        debug!(listed, usable = usable.len(), "Contract catalog refreshed");
        Ok(usable)
    }
}

fn is_tradable(c: &Contract) -> bool {
    !c.delisting
        && c.funding_interval_secs > 0
        && c.multiplier > Decimal::ZERO
        && c.mark_price > Decimal::ZERO
}
