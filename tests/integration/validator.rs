//! Concurrent availability checks: rank order, worker bound, timeouts,
//! and the single-position guarantee under uneven latency.

use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

use funding_arb::engine::strategy_loop::TickOutcome;
use funding_arb::engine::validator::AvailabilityValidator;
use funding_arb::engine::{EngineContext, ManualClock};
use funding_arb::strategy::rank;
use funding_arb::types::Contract;

use crate::mock_exchange::{at, engine_with, perp, spot_market, test_config, MockExchange};

const IN_WINDOW: i64 = 28795;

/// Four hedgeable BTC-priced contracts with descending funding rates.
fn four_contracts(mock: &MockExchange) -> Vec<Contract> {
    let contracts = vec![
        perp("AAA_USDT", dec!(0.010), dec!(0.0001), dec!(95000)),
        perp("BBB_USDT", dec!(0.008), dec!(0.0001), dec!(95000)),
        perp("CCC_USDT", dec!(0.006), dec!(0.0001), dec!(95000)),
        perp("DDD_USDT", dec!(0.004), dec!(0.0001), dec!(95000)),
    ];
    for c in &contracts {
        mock.set_spot_market(spot_market(&c.spot_pair, at(IN_WINDOW - 30)));
        mock.set_futures_quote(&c.id, dec!(95000), dec!(95005));
        mock.set_spot_quote(&c.spot_pair, dec!(95008), dec!(95010));
    }
    mock.set_contracts(contracts.clone());
    contracts
}

fn ctx(mock: &Arc<MockExchange>) -> EngineContext {
    EngineContext::with_clock(mock.clone(), test_config(), Arc::new(ManualClock::new(at(IN_WINDOW))))
}

fn ids(validated: &[funding_arb::engine::validator::ValidatedCandidate]) -> Vec<&str> {
    validated.iter().map(|v| v.scored.contract.id.as_str()).collect()
}

#[tokio::test]
async fn test_rank_order_survives_completion_order() {
    let delay_sets: [[u64; 4]; 4] = [[40, 5, 20, 10], [5, 10, 20, 40], [40, 20, 10, 5], [10, 40, 5, 20]];

    for delays in delay_sets {
        let mock = Arc::new(MockExchange::new(at(IN_WINDOW)));
        let contracts = four_contracts(&mock);
        for (c, ms) in contracts.iter().zip(delays) {
            mock.set_spot_delay(&c.spot_pair, Duration::from_millis(ms));
        }

        let ctx = ctx(&mock);
        let ranked = rank(&contracts, ctx.trading().min_funding_rate, 10);
        let validated = AvailabilityValidator::validate(&ctx, &ranked).await;

        assert_eq!(
            ids(&validated),
            vec!["AAA_USDT", "BBB_USDT", "CCC_USDT", "DDD_USDT"],
            "delays {delays:?}"
        );
    }
}

#[tokio::test]
async fn test_rejected_pairs_drop_out_in_place() {
    let mock = Arc::new(MockExchange::new(at(IN_WINDOW)));
    let contracts = four_contracts(&mock);

    // Fastest and highest-ranked, but halted
    let mut halted = spot_market("AAA_USDT", at(IN_WINDOW - 30));
    halted.tradable = false;
    mock.set_spot_market(halted);
    // Last traded an hour ago
    mock.set_spot_market(spot_market("CCC_USDT", at(IN_WINDOW - 3600)));
    mock.set_spot_delay("BBB_USDT", Duration::from_millis(30));

    let ctx = ctx(&mock);
    let ranked = rank(&contracts, ctx.trading().min_funding_rate, 10);
    let validated = AvailabilityValidator::validate(&ctx, &ranked).await;
    assert_eq!(ids(&validated), vec!["BBB_USDT", "DDD_USDT"]);

    let best = AvailabilityValidator::best(&ctx, &ranked).await.unwrap();
    assert_eq!(best.scored.contract.id, "BBB_USDT");
    assert_eq!(best.rank, 1);
}

#[tokio::test]
async fn test_worker_pool_bounds_concurrency() {
    let mock = Arc::new(MockExchange::new(at(IN_WINDOW)));
    let contracts: Vec<Contract> = (0..8)
        .map(|i| perp(&format!("C{i}_USDT"), dec!(0.01), dec!(0.0001), dec!(95000)))
        .collect();
    for c in &contracts {
        mock.set_spot_market(spot_market(&c.spot_pair, at(IN_WINDOW - 30)));
        mock.set_spot_delay(&c.spot_pair, Duration::from_millis(30));
    }

    let mut cfg = test_config();
    cfg.trading.worker_pool_size = 3;
    let ctx = EngineContext::with_clock(mock.clone(), cfg, Arc::new(ManualClock::new(at(IN_WINDOW))));

    let ranked = rank(&contracts, dec!(0.003), 10);
    let validated = AvailabilityValidator::validate(&ctx, &ranked).await;
    assert_eq!(validated.len(), 8);
    assert_eq!(mock.max_in_flight(), 3);
}

#[tokio::test]
async fn test_slow_check_is_dropped_for_the_cycle() {
    let mock = Arc::new(MockExchange::new(at(IN_WINDOW)));
    let contracts = four_contracts(&mock);
    // Exceeds the 1s call timeout
    mock.set_spot_delay("AAA_USDT", Duration::from_millis(1500));

    let ctx = ctx(&mock);
    let ranked = rank(&contracts, ctx.trading().min_funding_rate, 10);
    let best = AvailabilityValidator::best(&ctx, &ranked).await.unwrap();
    assert_eq!(best.scored.contract.id, "BBB_USDT");
}

#[tokio::test]
async fn test_only_one_position_ever_opens() {
    let mock = Arc::new(MockExchange::new(at(IN_WINDOW)));
    four_contracts(&mock);
    for (pair, ms) in [("AAA_USDT", 25), ("BBB_USDT", 5), ("CCC_USDT", 1), ("DDD_USDT", 15)] {
        mock.set_spot_delay(pair, Duration::from_millis(ms));
    }
    let clock = Arc::new(ManualClock::new(at(IN_WINDOW)));
    let mut engine = engine_with(&mock, &clock, test_config());

    let mut opened = Vec::new();
    for _ in 0..5 {
        if let TickOutcome::Opened(position) = engine.tick().await {
            opened.push(position.contract);
        }
        assert!(mock.open_position_count() <= 1);
        clock.advance(chrono::Duration::seconds(1));
    }

    assert_eq!(opened, vec!["AAA_USDT".to_string()]);
    assert_eq!(mock.open_position_count(), 1);
    assert_eq!(mock.orders().len(), 2);
}
