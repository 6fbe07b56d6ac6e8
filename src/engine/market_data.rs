//! Paired futures/spot book fetch.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::engine::{bounded, EngineContext};
use crate::types::{ArbError, ArbResult, MarketSnapshot};

/// Fetch both books concurrently and stamp them with one capture time.
pub async fn fetch_snapshot(ctx: &EngineContext, contract: &str, spot_pair: &str) -> ArbResult<MarketSnapshot> {
    let timeout = ctx.engine().call_timeout();
    let (futures, spot) = tokio::try_join!(
        bounded(timeout, "fetch_futures_quote", ctx.exchange.fetch_futures_quote(contract)),
        bounded(timeout, "fetch_spot_quote", ctx.exchange.fetch_spot_quote(spot_pair)),
    )?;

    if !futures.is_valid() {
        return Err(ArbError::DataUnavailable(format!(
            "{contract}: futures book bid={} ask={}",
            futures.bid, futures.ask
        )));
    }
    if !spot.is_valid() {
        return Err(ArbError::DataUnavailable(format!(
            "{spot_pair}: spot book bid={} ask={}",
            spot.bid, spot.ask
        )));
    }

    let snapshot = MarketSnapshot {
        contract: contract.to_string(),
        futures,
        spot,
        captured_at: ctx.now(),
    };
    debug!(
        contract,
        futures_bid = %futures.bid,
        futures_ask = %futures.ask,
        spot_bid = %spot.bid,
        spot_ask = %spot.ask,
        "Snapshot captured"
    );
    Ok(snapshot)
}

/// Reject a snapshot older than `max_age_ms` at `now`.
pub fn ensure_fresh(snapshot: &MarketSnapshot, now: DateTime<Utc>, max_age_ms: u64) -> ArbResult<()> {
    let age = snapshot.age(now).num_milliseconds();
    if age > max_age_ms as i64 {
        return Err(ArbError::DataUnavailable(format!(
            "{}: snapshot is {age}ms old (limit {max_age_ms}ms)",
            snapshot.contract
        )));
    }
    Ok(())
}
