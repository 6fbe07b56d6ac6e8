//! Persistence layer.
//!
//! Engine state (position, close progress, halt, session stats) lives in
//! one JSON file rewritten after every tick. Closed trades are appended
//! to a JSON-lines ledger and never rewritten.

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::engine::strategy_loop::EngineSnapshot;
use crate::types::ClosedTrade;

/// Default state file path.
const DEFAULT_STATE_FILE: &str = "funding_arb_state.json";
/// Default trade ledger path.
const DEFAULT_TRADES_FILE: &str = "closed_trades.jsonl";

/// Save the engine snapshot. Written to a sibling temp file first and
/// renamed, so a crash mid-write never leaves a truncated state file.
pub fn save_state(snapshot: &EngineSnapshot, path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_STATE_FILE);
    let json = serde_json::to_string_pretty(snapshot).context("Failed to serialise engine state")?;

    let tmp = format!("{path}.tmp");
    std::fs::write(&tmp, &json).context(format!("Failed to write state to {tmp}"))?;
    std::fs::rename(&tmp, path).context(format!("Failed to move state into {path}"))?;

    debug!(path, state = snapshot.state.name(), "State saved");
    Ok(())
}

/// Load the engine snapshot. Returns None if the file doesn't exist
/// (fresh start).
pub fn load_state(path: Option<&str>) -> Result<Option<EngineSnapshot>> {
    let path = path.unwrap_or(DEFAULT_STATE_FILE);

    if !Path::new(path).exists() {
        info!(path, "No saved state found, starting fresh");
        return Ok(None);
    }

    let json = std::fs::read_to_string(path).context(format!("Failed to read state from {path}"))?;
    let snapshot: EngineSnapshot =
        serde_json::from_str(&json).context(format!("Failed to parse state from {path}"))?;

    info!(
        path,
        state = snapshot.state.name(),
        halted = snapshot.halt.is_some(),
        trades = snapshot.stats.trades,
        saved_at = %snapshot.saved_at,
        "State loaded from disk"
    );
    Ok(Some(snapshot))
}

/// Delete the state file (for testing or reset).
pub fn delete_state(path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_STATE_FILE);
    if Path::new(path).exists() {
        std::fs::remove_file(path).context(format!("Failed to delete state file {path}"))?;
    }
    Ok(())
}

/// Append one closed trade to the ledger.
pub fn append_trade(trade: &ClosedTrade, path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_TRADES_FILE);
    let line = serde_json::to_string(trade).context("Failed to serialise closed trade")?;

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .context(format!("Failed to open trade ledger {path}"))?;
    writeln!(file, "{line}").context(format!("Failed to append to {path}"))?;

    debug!(path, contract = %trade.contract, "Trade appended to ledger");
    Ok(())
}

/// Read every trade in the ledger. Malformed lines are skipped with a
/// warning rather than failing the whole read.
pub fn load_trades(path: Option<&str>) -> Result<Vec<ClosedTrade>> {
    let path = path.unwrap_or(DEFAULT_TRADES_FILE);
    if !Path::new(path).exists() {
        return Ok(Vec::new());
    }

    let contents = std::fs::read_to_string(path).context(format!("Failed to read ledger {path}"))?;
    let mut trades = Vec::new();
    for (n, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ClosedTrade>(line) {
            Ok(t) => trades.push(t),
            Err(e) => warn!(path, line = n + 1, error = %e, "Skipping malformed ledger line"),
        }
    }
    Ok(trades)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
