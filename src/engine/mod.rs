//! Core engine: scan → validate → enter → monitor → close.
//!
//! Components receive an [`EngineContext`] instead of reaching for
//! process-wide state. The context is cheap to clone (all `Arc`s) and
//! read-only after construction.

pub mod accountant;
pub mod catalog;
pub mod closer;
pub mod executor;
pub mod market_data;
pub mod monitor;
pub mod retry;
pub mod strategy_loop;
pub mod validator;

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AppConfig, EngineConfig, TradingConfig};
use crate::platforms::Exchange;
use crate::types::{ArbError, ArbResult};
use retry::RetryPolicy;

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Wall-clock source. Settlement timing and holding periods read time
/// only through this trait.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for simulations and tests.
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(start.timestamp_millis()),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        self.millis.store(at.timestamp_millis(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: chrono::Duration) {
        self.millis.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst)).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Everything a component needs, built once at startup.
#[derive(Clone)]
pub struct EngineContext {
    pub exchange: Arc<dyn Exchange>,
    pub config: Arc<AppConfig>,
    pub clock: Arc<dyn Clock>,
}

impl EngineContext {
    pub fn new(exchange: Arc<dyn Exchange>, config: AppConfig) -> Self {
        Self::with_clock(exchange, config, Arc::new(SystemClock))
    }

    pub fn with_clock(exchange: Arc<dyn Exchange>, config: AppConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            exchange,
            config: Arc::new(config),
            clock,
        }
    }

    pub fn trading(&self) -> &TradingConfig {
        &self.config.trading
    }

    pub fn engine(&self) -> &EngineConfig {
        &self.config.engine
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_config(self.engine())
    }
}

/// Run one external call under `timeout`; an elapsed timeout becomes
/// `ArbError::Transient`.
pub async fn bounded<T, F>(timeout: Duration, what: &str, fut: F) -> ArbResult<T>
where
    F: Future<Output = ArbResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ArbError::Transient(format!(
            "{what} timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}
