//! Spot availability checks over ranked candidates.
//!
//! Up to `worker_pool_size` checks run at once, each under its own
//! timeout. Completion order is arbitrary; survivors are re-sorted by
//! their original rank before anyone sees them.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tracing::{debug, info};

use crate::engine::{bounded, EngineContext};
use crate::strategy::ScoredContract;
use crate::types::{ArbResult, SpotMarketInfo};

/// A ranked candidate whose spot market passed the checks.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedCandidate {
    /// Position in the scorer's ranking (0 = best).
    pub rank: usize,
    pub scored: ScoredContract,
    pub spot: SpotMarketInfo,
}

pub struct AvailabilityValidator;

impl AvailabilityValidator {
    /// All candidates whose spot pair exists, is tradable and traded
    /// within the activity window, in rank order. A failed or timed-out
    /// check drops its candidate for this cycle only.
    pub async fn validate(ctx: &EngineContext, ranked: &[ScoredContract]) -> Vec<ValidatedCandidate> {
        if ranked.is_empty() {
            return Vec::new();
        }

        let workers = ctx.trading().worker_pool_size.max(1);
        let timeout = ctx.engine().call_timeout();

        let checks: Vec<(usize, &ScoredContract, ArbResult<SpotMarketInfo>)> =
            stream::iter(ranked.iter().enumerate())
                .map(|(rank, scored)| async move {
                    let pair = scored.contract.spot_pair.as_str();
                    let result = bounded(timeout, "fetch_spot_market", ctx.exchange.fetch_spot_market(pair)).await;
                    (rank, scored, result)
                })
                .buffer_unordered(workers)
                .collect()
                .await;

        let now = ctx.now();
        let window = chrono::Duration::seconds(ctx.engine().spot_activity_window_secs as i64);

        let mut validated: Vec<ValidatedCandidate> = checks
            .into_iter()
            .filter_map(|(rank, scored, result)| match result {
                Ok(spot) => match rejection(&spot, now, window) {
                    None => Some(ValidatedCandidate {
                        rank,
                        scored: scored.clone(),
                        spot,
                    }),
                    Some(reason) => {
                        debug!(contract = %scored.contract.id, reason, "Spot market rejected");
                        None
                    }
                },
                Err(e) => {
                    debug!(contract = %scored.contract.id, error = %e, "Spot check failed");
                    None
                }
            })
            .collect();

        validated.sort_by_key(|v| v.rank);

        info!(
            candidates = ranked.len(),
            validated = validated.len(),
            best = validated.first().map(|v| v.scored.contract.id.as_str()).unwrap_or("-"),
            "Availability check complete"
        );
        validated
    }

    /// Highest-ranked validated candidate, if any.
    pub async fn best(ctx: &EngineContext, ranked: &[ScoredContract]) -> Option<ValidatedCandidate> {
        Self::validate(ctx, ranked).await.into_iter().next()
    }
}

fn rejection(spot: &SpotMarketInfo, now: DateTime<Utc>, window: chrono::Duration) -> Option<&'static str> {
    if !spot.tradable {
        return Some("not tradable");
    }
    match spot.last_trade_at {
        None => Some("no recent trades"),
        Some(at) if now - at > window => Some("inactive"),
        Some(_) => None,
    }
}
