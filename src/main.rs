//! FUNDING-ARB: delta-neutral funding-rate arbitrage engine
//!
//! Entry point. Loads configuration, initialises structured logging,
//! restores engine state from disk, refuses to start next to positions
//! it did not open, and runs the polling loop with graceful shutdown.

use anyhow::{bail, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

use funding_arb::config::{self, Credentials};
use funding_arb::engine::strategy_loop::{StrategyLoop, TickOutcome};
use funding_arb::engine::EngineContext;
use funding_arb::platforms::gate::GateClient;
use funding_arb::storage;

const BANNER: &str = r#"
  ___ _   _ _  _ ___  ___ _  _  ___     _   ___ ___
 | __| | | | \| |   \|_ _| \| |/ __|   /_\ | _ \ _ )
 | _|| |_| | .` | |) || || .` | (_ |  / _ \|   / _ \
 |_|  \___/|_|\_|___/|___|_|\_|\___| /_/ \_\_|_\___/

  Perpetual / spot funding-rate arbitrage
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    // Load configuration from TOML + FUNDARB_* overrides
    let cfg = config::AppConfig::load("config.toml")?;

    init_logging();

    println!("{BANNER}");
    info!(
        exchange = %cfg.exchange.name,
        testnet = cfg.exchange.testnet,
        balance_ceiling = %cfg.trading.balance_ceiling,
        leverage = cfg.trading.leverage,
        min_funding_rate = %cfg.trading.min_funding_rate,
        settlement_buffer_secs = cfg.trading.settlement_buffer_secs,
        workers = cfg.trading.worker_pool_size,
        "FUNDING-ARB starting up"
    );

    // -- Exchange --------------------------------------------------------

    let credentials = Credentials::resolve(&cfg.exchange)?;
    let gate = GateClient::new(credentials, cfg.exchange.testnet)?;
    gate.set_single_position_mode().await?;

    let state_file = cfg.storage.state_file.clone();
    let trades_file = cfg.storage.trades_file.clone();
    let poll_interval = cfg.engine.poll_interval();
    let ctx = EngineContext::new(Arc::new(gate), cfg);

    // -- Restore state and check the account ------------------------------

    let mut engine = StrategyLoop::new(ctx);
    if let Some(snapshot) = storage::load_state(Some(&state_file))? {
        engine.restore(snapshot);
    }

    if std::env::var("FUNDARB_CLEAR_HALT").is_ok_and(|v| v == "1") {
        engine.clear_halt();
    }

    if let Err(e) = engine.reconcile_startup().await {
        error!(error = %e, "Startup safety check failed");
        bail!("refusing to start: {e}");
    }
    if let Some(halt) = engine.halt() {
        warn!(reason = %halt, "Entries halted; set FUNDARB_CLEAR_HALT=1 after resolving");
    }
    storage::save_state(&engine.snapshot(), Some(&state_file))?;

    // -- Main loop -------------------------------------------------------

    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        interval_secs = poll_interval.as_secs(),
        "Entering main loop. Press Ctrl+C to stop."
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let outcome = engine.tick().await;
                log_outcome(&outcome);

                if let TickOutcome::Closed(trade) = &outcome {
                    if let Err(e) = storage::append_trade(trade, Some(&trades_file)) {
                        error!(error = %e, "Failed to append closed trade");
                    }
                }
                // Persist state after each tick
                if let Err(e) = storage::save_state(&engine.snapshot(), Some(&state_file)) {
                    error!(error = %e, "Failed to save state");
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    // Save final state; an open hedge stays on and is resumed next start
    storage::save_state(&engine.snapshot(), Some(&state_file))?;
    if let Some(position) = engine.position() {
        warn!(position = %position, "Shutting down with an open hedge");
    }
    info!(
        state = engine.state().name(),
        stats = %engine.stats(),
        "FUNDING-ARB shut down cleanly."
    );

    Ok(())
}

/// One log line per notable tick; quiet ticks stay at debug inside the engine.
fn log_outcome(outcome: &TickOutcome) {
    match outcome {
        TickOutcome::Opened(position) => info!(position = %position, "Position opened"),
        TickOutcome::Closed(trade) => info!(trade = %trade, "Position closed"),
        TickOutcome::EntryFailed(reason) => warn!(reason = %reason, "Entry failed"),
        TickOutcome::CloseFailed(reason) => error!(reason = %reason, "Close failed"),
        TickOutcome::Skipped(_)
        | TickOutcome::Halted
        | TickOutcome::NoOpportunity
        | TickOutcome::GateClosed { .. }
        | TickOutcome::Holding => {}
    }
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("funding_arb=info"));

    let json_logging = std::env::var("FUNDARB_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
