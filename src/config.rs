//! Configuration loading from TOML with environment overrides.
//!
//! Reads `config.toml` (optional) into strongly-typed structs, applies the
//! `FUNDARB_*` environment overrides, and validates everything once at
//! startup. Secrets are referenced by env-var name in the config and
//! resolved at runtime.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::types::{ArbError, ArbResult};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub exchange: ExchangeConfig,
    pub trading: TradingConfig,
    pub engine: EngineConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Exchange identifier. Only "gate" has a binding.
    pub name: String,
    pub testnet: bool,
    pub api_key_env: String,
    pub api_secret_env: String,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            name: "gate".to_string(),
            testnet: true,
            api_key_env: "GATE_API_KEY".to_string(),
            api_secret_env: "GATE_API_SECRET".to_string(),
        }
    }
}

/// Trading parameters. Read-only after load.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct TradingConfig {
    /// Taker fee per leg, as a fraction of notional.
    pub fee_rate: Decimal,
    /// Upper bound on the quote balance committed per leg.
    pub balance_ceiling: Decimal,
    pub leverage: u32,
    /// Minimum |funding rate| for a contract to be considered.
    pub min_funding_rate: Decimal,
    /// Entry is allowed only this many seconds before settlement.
    pub settlement_buffer_secs: u64,
    pub worker_pool_size: usize,
    /// Close when unrealized yield on entry notional reaches this fraction.
    pub close_profit_threshold: Decimal,
    /// Close when unrealized yield falls to this (negative) fraction.
    pub close_loss_threshold: Decimal,
    pub max_holding_secs: u64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            fee_rate: dec!(0.00062),
            balance_ceiling: dec!(200),
            leverage: 2,
            min_funding_rate: dec!(0.003),
            settlement_buffer_secs: 10,
            worker_pool_size: 5,
            close_profit_threshold: dec!(0.001),
            close_loss_threshold: dec!(-0.02),
            max_holding_secs: 8 * 3600,
        }
    }
}

/// Loop cadence, timeouts and retry budget.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub poll_interval_secs: u64,
    /// Per external call.
    pub call_timeout_secs: u64,
    /// Bounds the whole read phase of a scan cycle.
    pub cycle_deadline_secs: u64,
    /// A spot pair must have traded within this window to be usable.
    pub spot_activity_window_secs: u64,
    pub max_candidates: usize,
    pub max_snapshot_age_ms: u64,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 1,
            call_timeout_secs: 5,
            cycle_deadline_secs: 20,
            spot_activity_window_secs: 300,
            max_candidates: 20,
            max_snapshot_age_ms: 3000,
            retry_max_attempts: 4,
            retry_base_delay_ms: 250,
            retry_max_delay_ms: 4000,
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn cycle_deadline(&self) -> Duration {
        Duration::from_secs(self.cycle_deadline_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub state_file: String,
    pub trades_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_file: "funding_arb_state.json".to_string(),
            trades_file: "closed_trades.jsonl".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration: TOML file (if present), then environment
    /// overrides, then validation.
    pub fn load(path: &str) -> ArbResult<Self> {
        let mut config = if Path::new(path).exists() {
            let contents = fs::read_to_string(path).map_err(|e| {
                ArbError::Configuration(format!("failed to read config file {path}: {e}"))
            })?;
            Self::from_toml(&contents)?
        } else {
            AppConfig::default()
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> ArbResult<Self> {
        toml::from_str(contents)
            .map_err(|e| ArbError::Configuration(format!("failed to parse config: {e}")))
    }

    /// Apply `FUNDARB_*` overrides. `lookup` is `std::env::var` in
    /// production and a map in tests.
    pub fn apply_env<F>(&mut self, lookup: F) -> ArbResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("FUNDARB_EXCHANGE") {
            self.exchange.name = v;
        }
        override_parsed(&lookup, "FUNDARB_TESTNET", &mut self.exchange.testnet)?;

        let t = &mut self.trading;
        override_parsed(&lookup, "FUNDARB_FEE_RATE", &mut t.fee_rate)?;
        override_parsed(&lookup, "FUNDARB_BALANCE_CEILING", &mut t.balance_ceiling)?;
        override_parsed(&lookup, "FUNDARB_LEVERAGE", &mut t.leverage)?;
        override_parsed(&lookup, "FUNDARB_MIN_FUNDING_RATE", &mut t.min_funding_rate)?;
        override_parsed(&lookup, "FUNDARB_SETTLEMENT_BUFFER_SECS", &mut t.settlement_buffer_secs)?;
        override_parsed(&lookup, "FUNDARB_WORKER_POOL_SIZE", &mut t.worker_pool_size)?;
        override_parsed(&lookup, "FUNDARB_CLOSE_PROFIT_THRESHOLD", &mut t.close_profit_threshold)?;
        override_parsed(&lookup, "FUNDARB_CLOSE_LOSS_THRESHOLD", &mut t.close_loss_threshold)?;
        override_parsed(&lookup, "FUNDARB_MAX_HOLDING_SECS", &mut t.max_holding_secs)?;

        override_parsed(&lookup, "FUNDARB_POLL_INTERVAL_SECS", &mut self.engine.poll_interval_secs)?;
        Ok(())
    }

    /// Reject anything that would only blow up deep inside a cycle.
    pub fn validate(&self) -> ArbResult<()> {
        let t = &self.trading;
        let e = &self.engine;

        if self.exchange.name != "gate" {
            return invalid(format!("unsupported exchange '{}'", self.exchange.name));
        }
        if t.fee_rate < Decimal::ZERO || t.fee_rate >= dec!(0.01) {
            return invalid(format!("fee_rate {} outside [0, 0.01)", t.fee_rate));
        }
        if t.balance_ceiling <= Decimal::ZERO {
            return invalid("balance_ceiling must be positive".to_string());
        }
        if !(1..=125).contains(&t.leverage) {
            return invalid(format!("leverage {} outside 1..=125", t.leverage));
        }
        if t.min_funding_rate <= Decimal::ZERO {
            return invalid("min_funding_rate must be positive".to_string());
        }
        if t.settlement_buffer_secs == 0 {
            return invalid("settlement_buffer_secs must be positive".to_string());
        }
        if t.worker_pool_size == 0 {
            return invalid("worker_pool_size must be at least 1".to_string());
        }
        if t.close_profit_threshold <= Decimal::ZERO {
            return invalid("close_profit_threshold must be positive".to_string());
        }
        if t.close_loss_threshold >= Decimal::ZERO {
            return invalid("close_loss_threshold must be negative".to_string());
        }
        if t.max_holding_secs == 0 {
            return invalid("max_holding_secs must be positive".to_string());
        }
        if e.poll_interval_secs == 0 || e.call_timeout_secs == 0 || e.cycle_deadline_secs == 0 {
            return invalid("poll interval, call timeout and cycle deadline must be positive".to_string());
        }
        if e.max_candidates == 0 || e.retry_max_attempts == 0 {
            return invalid("max_candidates and retry_max_attempts must be at least 1".to_string());
        }
        if e.retry_base_delay_ms > e.retry_max_delay_ms {
            return invalid("retry_base_delay_ms exceeds retry_max_delay_ms".to_string());
        }
        Ok(())
    }
}

fn invalid(msg: String) -> ArbResult<()> {
    Err(ArbError::Configuration(msg))
}

fn override_parsed<F, T>(lookup: &F, key: &str, slot: &mut T) -> ArbResult<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|_| ArbError::Configuration(format!("{key}: cannot parse '{raw}'")))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// API credentials resolved from the environment.
pub struct Credentials {
    pub api_key: String,
    pub api_secret: SecretString,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"[redacted]")
            .finish()
    }
}

impl Credentials {
    /// Resolve key and secret through the env-var names in `cfg`.
    pub fn resolve(cfg: &ExchangeConfig) -> ArbResult<Self> {
        Self::resolve_with(cfg, |key| std::env::var(key).ok())
    }

    pub fn resolve_with<F>(cfg: &ExchangeConfig, lookup: F) -> ArbResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = lookup(&cfg.api_key_env)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                ArbError::Configuration(format!("environment variable not set: {}", cfg.api_key_env))
            })?;
        let secret = lookup(&cfg.api_secret_env)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                ArbError::Configuration(format!(
                    "environment variable not set: {}",
                    cfg.api_secret_env
                ))
            })?;
        Ok(Self {
            api_key,
            api_secret: SecretString::new(secret),
        })
    }

    pub fn secret(&self) -> &str {
        self.api_secret.expose_secret()
    }
}
