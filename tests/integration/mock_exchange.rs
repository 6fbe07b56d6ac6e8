//! Stateful in-memory exchange for integration testing.
//!
//! Unlike the per-call expectations used in unit tests, this mock keeps a
//! book: futures orders move a signed position, spot orders move a spot
//! holding, and every order request is logged. Failures, partial fills
//! and per-pair latency can be injected from test code.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal::prelude::Signed;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use funding_arb::config::AppConfig;
use funding_arb::engine::strategy_loop::StrategyLoop;
use funding_arb::engine::{EngineContext, ManualClock};
use funding_arb::platforms::Exchange;
use funding_arb::types::*;

/// 2024-01-01T00:00:00Z, an 8h settlement boundary.
pub const BOUNDARY: i64 = 1_704_067_200;

pub fn at(offset_secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(BOUNDARY + offset_secs, 0).unwrap()
}

/// Default config with zero fees (exact PnL arithmetic) and millisecond
/// retry delays.
pub fn test_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.trading.fee_rate = Decimal::ZERO;
    cfg.engine.call_timeout_secs = 1;
    cfg.engine.retry_base_delay_ms = 1;
    cfg.engine.retry_max_delay_ms = 4;
    cfg
}

pub fn engine_with(mock: &Arc<MockExchange>, clock: &Arc<ManualClock>, cfg: AppConfig) -> StrategyLoop {
    let ctx = EngineContext::with_clock(mock.clone(), cfg, clock.clone());
    StrategyLoop::new(ctx)
}

pub fn perp(id: &str, funding_rate: Decimal, multiplier: Decimal, mark_price: Decimal) -> Contract {
    Contract {
        id: id.to_string(),
        spot_pair: id.to_string(),
        funding_rate,
        funding_interval_secs: 28800,
        multiplier,
        mark_price,
        delisting: false,
    }
}

pub fn spot_market(pair: &str, last_trade_at: DateTime<Utc>) -> SpotMarketInfo {
    SpotMarketInfo {
        pair: pair.to_string(),
        tradable: true,
        amount_precision: 6,
        min_base_amount: dec!(0.00001),
        last_trade_at: Some(last_trade_at),
    }
}

#[derive(Default)]
struct Book {
    contracts: Vec<Contract>,
    futures_quotes: HashMap<String, Quote>,
    spot_quotes: HashMap<String, Quote>,
    spot_markets: HashMap<String, SpotMarketInfo>,
    spot_delays: HashMap<String, std::time::Duration>,
    balance: Decimal,
    positions: HashMap<String, VenuePosition>,
    spot_holdings: HashMap<String, Decimal>,
    funding: HashMap<String, Decimal>,
    leverage: HashMap<String, u32>,
    spot_leverage: HashMap<String, u32>,
    orders: Vec<OrderRequest>,
    reject_spot: Option<String>,
    /// Applied to the next spot order only.
    spot_fill_ratio: Option<Decimal>,
    /// Futures orders still to fail with a transient error.
    futures_failures: usize,
}

/// In-memory exchange with a BTC and an ETH perpetual, both hedgeable.
pub struct MockExchange {
    book: Mutex<Book>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Decrements the in-flight counter even when the call is cancelled.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockExchange {
    /// Default book; spot pairs last traded 30s before `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        let traded = now - Duration::seconds(30);
        let mut book = Book {
            contracts: vec![
                perp("BTC_USDT", dec!(0.0075), dec!(0.0001), dec!(95000)),
                perp("ETH_USDT", dec!(0.004), dec!(0.01), dec!(3300)),
            ],
            balance: dec!(400),
            ..Default::default()
        };
        book.futures_quotes.insert("BTC_USDT".into(), Quote { bid: dec!(95000), ask: dec!(95005) });
        book.spot_quotes.insert("BTC_USDT".into(), Quote { bid: dec!(95008), ask: dec!(95010) });
        book.futures_quotes.insert("ETH_USDT".into(), Quote { bid: dec!(3300), ask: dec!(3300.5) });
        book.spot_quotes.insert("ETH_USDT".into(), Quote { bid: dec!(3300.2), ask: dec!(3300.6) });
        for pair in ["BTC_USDT", "ETH_USDT"] {
            book.spot_markets.insert(pair.into(), spot_market(pair, traded));
        }

        Self {
            book: Mutex::new(book),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    fn book(&self) -> MutexGuard<'_, Book> {
        self.book.lock().unwrap()
    }

    // -- Setup -----------------------------------------------------------

    pub fn set_contracts(&self, contracts: Vec<Contract>) {
        self.book().contracts = contracts;
    }

    pub fn set_futures_quote(&self, contract: &str, bid: Decimal, ask: Decimal) {
        self.book().futures_quotes.insert(contract.into(), Quote { bid, ask });
    }

    pub fn set_spot_quote(&self, pair: &str, bid: Decimal, ask: Decimal) {
        self.book().spot_quotes.insert(pair.into(), Quote { bid, ask });
    }

    pub fn set_spot_market(&self, info: SpotMarketInfo) {
        self.book().spot_markets.insert(info.pair.clone(), info);
    }

    pub fn set_spot_delay(&self, pair: &str, delay: std::time::Duration) {
        self.book().spot_delays.insert(pair.into(), delay);
    }

    pub fn set_funding(&self, contract: &str, income: Decimal) {
        self.book().funding.insert(contract.into(), income);
    }

    pub fn add_position(&self, contract: &str, size: Decimal, entry_price: Decimal) {
        self.book().positions.insert(
            contract.into(),
            VenuePosition {
                contract: contract.into(),
                size,
                entry_price,
            },
        );
    }

    pub fn reject_spot(&self, msg: &str) {
        self.book().reject_spot = Some(msg.to_string());
    }

    pub fn accept_spot(&self) {
        self.book().reject_spot = None;
    }

    pub fn partial_spot_fill(&self, ratio: Decimal) {
        self.book().spot_fill_ratio = Some(ratio);
    }

    pub fn fail_futures_orders(&self, n: usize) {
        self.book().futures_failures = n;
    }

    // -- Inspection ------------------------------------------------------

    pub fn orders(&self) -> Vec<OrderRequest> {
        self.book().orders.clone()
    }

    pub fn position(&self, contract: &str) -> Option<VenuePosition> {
        self.book().positions.get(contract).cloned()
    }

    pub fn open_position_count(&self) -> usize {
        self.book().positions.len()
    }

    pub fn spot_holding(&self, pair: &str) -> Decimal {
        self.book().spot_holdings.get(pair).copied().unwrap_or_default()
    }

    pub fn leverage(&self, contract: &str) -> Option<u32> {
        self.book().leverage.get(contract).copied()
    }

    pub fn spot_leverage(&self, currency: &str) -> Option<u32> {
        self.book().spot_leverage.get(currency).copied()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn fill_price(quote: Quote, side: Side) -> Decimal {
        match side {
            Side::Buy => quote.ask,
            Side::Sell => quote.bid,
        }
    }

    fn fill_futures(book: &mut Book, req: &OrderRequest, order_id: String) -> ArbResult<OrderResult> {
        if book.futures_failures > 0 {
            book.futures_failures -= 1;
            return Err(ArbError::Transient("mock: futures gateway unavailable".into()));
        }
        let quote = book
            .futures_quotes
            .get(&req.instrument)
            .copied()
            .ok_or_else(|| ArbError::NotFound(req.instrument.clone()))?;
        let price = Self::fill_price(quote, req.side);
        let delta = match req.side {
            Side::Buy => req.size,
            Side::Sell => -req.size,
        };
        let current = book
            .positions
            .get(&req.instrument)
            .map(|p| p.size)
            .unwrap_or_default();

        if req.reduce_only
            && (current.is_zero() || current.signum() == delta.signum() || delta.abs() > current.abs())
        {
            return Err(ArbError::Rejected("mock: reduce-only order would increase position".into()));
        }

        let size = current + delta;
        if size.is_zero() {
            book.positions.remove(&req.instrument);
        } else {
            let entry_price = if current.is_zero() {
                price
            } else {
                book.positions[&req.instrument].entry_price
            };
            book.positions.insert(
                req.instrument.clone(),
                VenuePosition {
                    contract: req.instrument.clone(),
                    size,
                    entry_price,
                },
            );
        }

        Ok(OrderResult {
            order_id,
            filled_size: req.size,
            avg_price: price,
            fee: None,
        })
    }

    fn fill_spot(book: &mut Book, req: &OrderRequest, order_id: String) -> ArbResult<OrderResult> {
        if let Some(msg) = &book.reject_spot {
            return Err(ArbError::Rejected(msg.clone()));
        }
        let quote = book
            .spot_quotes
            .get(&req.instrument)
            .copied()
            .ok_or_else(|| ArbError::NotFound(req.instrument.clone()))?;
        let precision = book
            .spot_markets
            .get(&req.instrument)
            .map(|m| m.amount_precision)
            .unwrap_or(8);
        let ratio = book.spot_fill_ratio.take().unwrap_or(Decimal::ONE);
        let filled = (req.size * ratio).round_dp_with_strategy(precision, RoundingStrategy::ToZero);

        let holding = book.spot_holdings.entry(req.instrument.clone()).or_default();
        match req.side {
            Side::Buy => *holding += filled,
            Side::Sell => *holding -= filled,
        }

        Ok(OrderResult {
            order_id,
            filled_size: filled,
            avg_price: Self::fill_price(quote, req.side),
            fee: None,
        })
    }
}

#[async_trait]
impl Exchange for MockExchange {
    async fn fetch_contracts(&self) -> ArbResult<Vec<Contract>> {
        Ok(self.book().contracts.clone())
    }

    async fn fetch_futures_quote(&self, contract: &str) -> ArbResult<Quote> {
        self.book()
            .futures_quotes
            .get(contract)
            .copied()
            .ok_or_else(|| ArbError::NotFound(contract.to_string()))
    }

    async fn fetch_spot_quote(&self, pair: &str) -> ArbResult<Quote> {
        self.book()
            .spot_quotes
            .get(pair)
            .copied()
            .ok_or_else(|| ArbError::NotFound(pair.to_string()))
    }

    async fn fetch_spot_market(&self, pair: &str) -> ArbResult<SpotMarketInfo> {
        let delay = self.book().spot_delays.get(pair).copied();

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.book()
            .spot_markets
            .get(pair)
            .cloned()
            .ok_or_else(|| ArbError::NotFound(pair.to_string()))
    }

    async fn place_order(&self, request: &OrderRequest) -> ArbResult<OrderResult> {
        let mut book = self.book();
        book.orders.push(request.clone());
        let order_id = format!("mock-{}", book.orders.len());
        match request.venue {
            Venue::Futures => Self::fill_futures(&mut book, request, order_id),
            Venue::Spot => Self::fill_spot(&mut book, request, order_id),
        }
    }

    async fn fetch_balance(&self) -> ArbResult<Decimal> {
        Ok(self.book().balance)
    }

    async fn fetch_open_positions(&self) -> ArbResult<Vec<VenuePosition>> {
        let mut positions: Vec<VenuePosition> = self.book().positions.values().cloned().collect();
        positions.sort_by(|a, b| a.contract.cmp(&b.contract));
        Ok(positions)
    }

    async fn fetch_funding_income(&self, contract: &str) -> ArbResult<Decimal> {
        Ok(self.book().funding.get(contract).copied().unwrap_or_default())
    }

    async fn set_leverage(&self, contract: &str, leverage: u32) -> ArbResult<()> {
        self.book().leverage.insert(contract.to_string(), leverage);
        Ok(())
    }

    async fn set_spot_leverage(&self, currency: &str, leverage: u32) -> ArbResult<()> {
        self.book().spot_leverage.insert(currency.to_string(), leverage);
        Ok(())
    }
}
