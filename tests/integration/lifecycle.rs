//! End-to-end engine cycles against the stateful mock exchange.

use chrono::Duration;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

use funding_arb::engine::strategy_loop::{EngineState, TickOutcome};
use funding_arb::engine::ManualClock;
use funding_arb::storage;
use funding_arb::types::{ArbError, CloseReason, HedgeDirection, Position, Side, Venue};

use crate::mock_exchange::{at, engine_with, test_config, MockExchange};

/// Five seconds before the 08:00 settlement.
const IN_WINDOW: i64 = 28795;

fn setup() -> (Arc<MockExchange>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(at(IN_WINDOW)));
    let mock = Arc::new(MockExchange::new(at(IN_WINDOW)));
    (mock, clock)
}

fn expect_opened(outcome: TickOutcome) -> Position {
    match outcome {
        TickOutcome::Opened(position) => position,
        other => panic!("expected an opened hedge, got {other:?}"),
    }
}

fn temp_path(ext: &str) -> String {
    let mut p = std::env::temp_dir();
    p.push(format!("funding_arb_it_{}.{ext}", uuid::Uuid::new_v4()));
    p.to_string_lossy().to_string()
}

#[tokio::test]
async fn test_full_cycle_open_hold_close() {
    let (mock, clock) = setup();
    let mut engine = engine_with(&mock, &clock, test_config());

    // -- Enter ---------------------------------------------------------------
    let position = expect_opened(engine.tick().await);
    assert_eq!(position.contract, "BTC_USDT");
    assert_eq!(position.direction, HedgeDirection::ShortFuturesLongSpot);
    // min(200, 400 / 2) × 2 / 95000 / 0.0001 = 42.1 → 42 lots
    assert_eq!(position.futures.size, dec!(42));
    assert_eq!(position.futures.entry_price, dec!(95000));
    assert_eq!(position.spot.size, dec!(0.004199));
    assert_eq!(position.spot.entry_price, dec!(95010));
    assert_eq!(mock.leverage("BTC_USDT"), Some(2));
    assert_eq!(mock.spot_leverage("BTC"), Some(2));
    assert_eq!(mock.position("BTC_USDT").unwrap().size, dec!(-42));
    assert_eq!(mock.spot_holding("BTC_USDT"), dec!(0.004199));

    let orders = mock.orders();
    assert_eq!(orders.len(), 2);
    assert_eq!((orders[0].venue, orders[0].side), (Venue::Futures, Side::Sell));
    assert_eq!((orders[1].venue, orders[1].side), (Venue::Spot, Side::Buy));

    // -- Hold: the gate is still open but the slot is taken -----------------
    assert_eq!(engine.tick().await, TickOutcome::Holding);
    assert_eq!(mock.orders().len(), 2);

    // -- Settlement pays 0.75% on 399 USDT ---------------------------------
    clock.advance(Duration::seconds(10));
    mock.set_funding("BTC_USDT", dec!(2.9925));

    let trade = match engine.tick().await {
        TickOutcome::Closed(trade) => trade,
        other => panic!("expected a close, got {other:?}"),
    };
    assert_eq!(trade.reason, CloseReason::TakeProfit);
    assert_eq!(trade.position_id, position.id);
    assert_eq!(trade.holding_secs, 10);
    assert_eq!(trade.futures_exit_price, dec!(95005));
    assert_eq!(trade.spot_exit_price, dec!(95008));
    assert_eq!(trade.futures_pnl, dec!(-0.021));
    assert_eq!(trade.spot_pnl, dec!(-0.008398));
    assert_eq!(trade.funding_income, dec!(2.9925));
    assert_eq!(trade.realized_pnl, dec!(2.963102));

    // Flat on both venues, futures unwound first
    assert_eq!(mock.open_position_count(), 0);
    assert_eq!(mock.spot_holding("BTC_USDT"), Decimal::ZERO);
    let orders = mock.orders();
    assert_eq!(orders.len(), 4);
    assert_eq!(orders[2].venue, Venue::Futures);
    assert!(orders[2].reduce_only);
    assert_eq!((orders[3].venue, orders[3].side), (Venue::Spot, Side::Sell));

    assert_eq!(engine.state(), &EngineState::Idle);
    assert_eq!(engine.stats().trades, 1);
    assert_eq!(engine.stats().wins, 1);

    // -- Back to scanning: a new interval has begun, so the gate is shut ---
    assert_eq!(
        engine.tick().await,
        TickOutcome::GateClosed {
            contract: "BTC_USDT".to_string(),
            secs_until_settlement: 28795,
        }
    );

    // The ledger round-trips the closed trade
    let ledger = temp_path("jsonl");
    storage::append_trade(&trade, Some(&ledger)).unwrap();
    assert_eq!(storage::load_trades(Some(&ledger)).unwrap(), vec![trade]);
    std::fs::remove_file(&ledger).unwrap();
}

#[tokio::test]
async fn test_spot_rejection_leaves_account_flat() {
    let (mock, clock) = setup();
    mock.reject_spot("mock: pair suspended");
    let mut engine = engine_with(&mock, &clock, test_config());

    match engine.tick().await {
        TickOutcome::EntryFailed(msg) => assert!(msg.contains("compensated: true"), "{msg}"),
        other => panic!("expected entry failure, got {other:?}"),
    }

    assert_eq!(mock.open_position_count(), 0);
    assert_eq!(mock.spot_holding("BTC_USDT"), Decimal::ZERO);
    let orders = mock.orders();
    assert_eq!(orders.len(), 3);
    assert_eq!((orders[2].venue, orders[2].side), (Venue::Futures, Side::Buy));
    assert!(orders[2].reduce_only);
    assert_eq!(orders[2].size, dec!(42));

    assert!(engine.position().is_none());
    // Fully reversed, so entries are not halted
    assert!(engine.halt().is_none());
    assert_eq!(engine.stats().partial_failures, 1);

    // Spot accepted again: the next window tick opens normally
    mock.accept_spot();
    expect_opened(engine.tick().await);
    assert_eq!(mock.open_position_count(), 1);
}

#[tokio::test]
async fn test_short_spot_fill_reverses_both_legs() {
    let (mock, clock) = setup();
    mock.partial_spot_fill(dec!(0.5));
    let mut engine = engine_with(&mock, &clock, test_config());

    assert!(matches!(engine.tick().await, TickOutcome::EntryFailed(_)));

    let orders = mock.orders();
    assert_eq!(orders.len(), 4);
    // 0.004199 × 0.5 rounded down to six places
    assert_eq!((orders[3].venue, orders[3].side), (Venue::Spot, Side::Sell));
    assert_eq!(orders[3].size, dec!(0.002099));

    assert_eq!(mock.open_position_count(), 0);
    assert_eq!(mock.spot_holding("BTC_USDT"), Decimal::ZERO);
    assert!(engine.halt().is_none());
}

#[tokio::test]
async fn test_startup_refuses_external_position() {
    let (mock, clock) = setup();
    mock.add_position("ETH_USDT", dec!(-5), dec!(3300));
    let mut engine = engine_with(&mock, &clock, test_config());

    match engine.reconcile_startup().await {
        Err(ArbError::ExternalPosition(detail)) => assert!(detail.contains("ETH_USDT")),
        other => panic!("expected external position error, got {other:?}"),
    }

    // Even if ticked anyway, the scan refuses to enter next to it
    assert!(matches!(engine.tick().await, TickOutcome::Skipped(_)));
    assert!(mock.orders().is_empty());
}

#[tokio::test]
async fn test_restart_resumes_open_position() {
    let (mock, clock) = setup();
    let state_file = temp_path("json");

    let opened = {
        let mut engine = engine_with(&mock, &clock, test_config());
        let position = expect_opened(engine.tick().await);
        storage::save_state(&engine.snapshot(), Some(&state_file)).unwrap();
        position
    };

    // New process: restore, reconcile, then run out the holding time
    let mut engine = engine_with(&mock, &clock, test_config());
    let snapshot = storage::load_state(Some(&state_file)).unwrap().unwrap();
    engine.restore(snapshot);
    engine.reconcile_startup().await.unwrap();
    assert_eq!(engine.position(), Some(&opened));
    assert!(engine.halt().is_none());

    clock.advance(Duration::hours(9));
    match engine.tick().await {
        TickOutcome::Closed(trade) => {
            assert_eq!(trade.reason, CloseReason::MaxHoldingTime);
            assert_eq!(trade.position_id, opened.id);
        }
        other => panic!("expected a close, got {other:?}"),
    }
    assert_eq!(mock.open_position_count(), 0);

    storage::delete_state(Some(&state_file)).unwrap();
}

#[tokio::test]
async fn test_escalated_close_resumes_next_tick() {
    let (mock, clock) = setup();
    let mut engine = engine_with(&mock, &clock, test_config());
    expect_opened(engine.tick().await);

    // Every futures attempt in the first close pass fails
    mock.fail_futures_orders(test_config().engine.retry_max_attempts as usize);
    mock.set_funding("BTC_USDT", dec!(2.9925));
    clock.advance(Duration::seconds(10));

    assert!(matches!(engine.tick().await, TickOutcome::CloseFailed(_)));
    match engine.state() {
        EngineState::Closing { progress, .. } => {
            assert_eq!(progress.escalations, 1);
            assert_eq!(progress.funding_income, Some(dec!(2.9925)));
        }
        other => panic!("expected CLOSING, got {}", other.name()),
    }
    // Spot hedge stays in place while futures exposure is open
    assert_eq!(mock.position("BTC_USDT").unwrap().size, dec!(-42));
    assert_eq!(mock.spot_holding("BTC_USDT"), dec!(0.004199));
    assert!(engine.halt().is_some());

    match engine.tick().await {
        TickOutcome::Closed(trade) => assert_eq!(trade.realized_pnl, dec!(2.963102)),
        other => panic!("expected a close, got {other:?}"),
    }
    assert_eq!(mock.open_position_count(), 0);
    assert_eq!(mock.spot_holding("BTC_USDT"), Decimal::ZERO);
    // Halt survives the close until an operator clears it
    assert!(engine.halt().is_some());
}

#[tokio::test]
async fn test_slow_scan_hits_cycle_deadline() {
    let (mock, clock) = setup();
    for pair in ["BTC_USDT", "ETH_USDT"] {
        mock.set_spot_delay(pair, std::time::Duration::from_millis(1500));
    }
    let mut cfg = test_config();
    cfg.engine.call_timeout_secs = 5;
    cfg.engine.cycle_deadline_secs = 1;
    let mut engine = engine_with(&mock, &clock, cfg);

    assert_eq!(
        engine.tick().await,
        TickOutcome::Skipped("cycle deadline exceeded".to_string())
    );
    assert_eq!(engine.state(), &EngineState::Idle);
    assert!(mock.orders().is_empty());
    assert_eq!(mock.open_position_count(), 0);
}
