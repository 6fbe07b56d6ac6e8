//! Strategy loop: the single-writer state machine.
//!
//! ```text
//! IDLE ──tick──▶ SCANNING ──hedge filled──▶ OPEN ──close signal──▶ CLOSING ──unwound──▶ IDLE
//!                    │                                                 │
//!                    └──nothing / gate closed / error──▶ IDLE          └──escalated──▶ CLOSING (retried)
//! ```
//!
//! The position lives inside the state enum, so holding two positions
//! is unrepresentable: SCANNING is only reachable from IDLE.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::engine::accountant::{Accountant, SessionStats};
use crate::engine::catalog::ContractCatalog;
use crate::engine::closer::{CloseProgress, PositionCloser};
use crate::engine::executor::HedgeExecutor;
use crate::engine::market_data::{ensure_fresh, fetch_snapshot};
use crate::engine::monitor::PositionMonitor;
use crate::engine::validator::AvailabilityValidator;
use crate::engine::{bounded, EngineContext};
use crate::strategy::{plan_hedge, rank, HedgePlan, SettlementGate};
use crate::types::{ArbError, ArbResult, ClosedTrade, Position};

/// Ticks between run-statistics log lines.
const STATS_EVERY_TICKS: u64 = 100;
/// Ticks slower than this are logged with their duration.
const SLOW_TICK: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Scanning,
    Open { position: Position },
    Closing { position: Position, progress: CloseProgress },
}

impl EngineState {
    pub fn position(&self) -> Option<&Position> {
        match self {
            EngineState::Open { position } | EngineState::Closing { position, .. } => Some(position),
            EngineState::Idle | EngineState::Scanning => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EngineState::Idle => "IDLE",
            EngineState::Scanning => "SCANNING",
            EngineState::Open { .. } => "OPEN",
            EngineState::Closing { .. } => "CLOSING",
        }
    }
}

/// Why new entries are blocked. Cleared only by an operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HaltReason {
    pub reason: String,
    pub since: DateTime<Utc>,
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (since {})", self.reason, self.since.format("%Y-%m-%d %H:%M:%S UTC"))
    }
}

/// Everything needed to resume after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub state: EngineState,
    pub halt: Option<HaltReason>,
    pub stats: SessionStats,
    pub saved_at: DateTime<Utc>,
}

/// What a single tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Entries halted; nothing attempted.
    Halted,
    /// A read failed or a guard tripped; state unchanged.
    Skipped(String),
    NoOpportunity,
    GateClosed { contract: String, secs_until_settlement: u64 },
    Opened(Position),
    EntryFailed(String),
    Holding,
    Closed(ClosedTrade),
    CloseFailed(String),
}

enum ScanDecision {
    Enter(Box<HedgePlan>),
    Pass(TickOutcome),
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

pub struct StrategyLoop {
    ctx: EngineContext,
    executor: HedgeExecutor,
    monitor: PositionMonitor,
    closer: PositionCloser,
    state: EngineState,
    halt: Option<HaltReason>,
    stats: SessionStats,
    ticks: u64,
    started: Instant,
    busy: Duration,
}

impl StrategyLoop {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            executor: HedgeExecutor::new(ctx.clone()),
            monitor: PositionMonitor::new(ctx.clone()),
            closer: PositionCloser::new(ctx.clone()),
            ctx,
            state: EngineState::Idle,
            halt: None,
            stats: SessionStats::default(),
            ticks: 0,
            started: Instant::now(),
            busy: Duration::ZERO,
        }
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn position(&self) -> Option<&Position> {
        self.state.position()
    }

    pub fn halt(&self) -> Option<&HaltReason> {
        self.halt.as_ref()
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            state: self.state.clone(),
            halt: self.halt.clone(),
            stats: self.stats.clone(),
            saved_at: self.ctx.now(),
        }
    }

    /// Adopt persisted state. A snapshot taken mid-scan resumes as IDLE.
    pub fn restore(&mut self, snapshot: EngineSnapshot) {
        self.state = match snapshot.state {
            EngineState::Scanning => EngineState::Idle,
            other => other,
        };
        self.halt = snapshot.halt;
        self.stats = snapshot.stats;
        info!(
            state = self.state.name(),
            halted = self.halt.is_some(),
            stats = %self.stats,
            "Engine state restored"
        );
    }

    pub fn clear_halt(&mut self) -> Option<HaltReason> {
        let cleared = self.halt.take();
        if let Some(h) = &cleared {
            warn!(reason = %h, "Entry halt cleared by operator");
        }
        cleared
    }

    /// Compare persisted state with the account before the first tick.
    ///
    /// - account position matching ours: resume
    /// - account position we did not open: `ExternalPosition`, refuse to run
    /// - our position missing from the account: halt entries (the spot leg
    ///   may be orphaned) and drop to IDLE
    pub async fn reconcile_startup(&mut self) -> ArbResult<()> {
        let timeout = self.ctx.engine().call_timeout();
        let positions = self
            .ctx
            .retry_policy()
            .run("fetch_open_positions", |_| {
                bounded(timeout, "fetch_open_positions", self.ctx.exchange.fetch_open_positions())
            })
            .await?;

        let ours = self.state.position().map(|p| p.contract.clone());
        let external: Vec<String> = positions
            .iter()
            .filter(|p| Some(&p.contract) != ours.as_ref())
            .map(|p| format!("{} ({} lots)", p.contract, p.size))
            .collect();
        if !external.is_empty() {
            error!(positions = ?external, "Account holds positions this engine did not open");
            return Err(ArbError::ExternalPosition(external.join(", ")));
        }

        let Some(contract) = ours else {
            info!("Startup check passed: no open positions");
            return Ok(());
        };
        let on_account = positions.iter().any(|p| p.contract == contract);

        let futures_already_flat = match &self.state {
            EngineState::Closing { position, progress } => {
                progress.futures_remaining(position) <= Decimal::ZERO
            }
            _ => false,
        };

        if on_account || futures_already_flat {
            info!(contract = %contract, state = self.state.name(), "Resuming persisted position");
            return Ok(());
        }

        let orphan = self.state.position().map(|p| p.to_string()).unwrap_or_default();
        error!(position = %orphan, "Persisted position not found on the account");
        self.halt = Some(HaltReason {
            reason: format!("persisted position missing on account: {orphan}"),
            since: self.ctx.now(),
        });
        self.state = EngineState::Idle;
        Ok(())
    }

    /// Advance the state machine by one step.
    pub async fn tick(&mut self) -> TickOutcome {
        let started = Instant::now();
        self.ticks += 1;

        let outcome = match std::mem::replace(&mut self.state, EngineState::Idle) {
            EngineState::Idle | EngineState::Scanning => match &self.halt {
                Some(h) => {
                    debug!(reason = %h, "Entries halted");
                    TickOutcome::Halted
                }
                None => {
                    self.state = EngineState::Scanning;
                    self.scan_and_enter().await
                }
            },
            EngineState::Open { position } => self.manage_open(position).await,
            EngineState::Closing { position, progress } => self.continue_close(position, progress).await,
        };

        let elapsed = started.elapsed();
        self.busy += elapsed;
        if elapsed > SLOW_TICK {
            info!(elapsed_ms = elapsed.as_millis() as u64, state = self.state.name(), "Slow tick");
        }
        if self.ticks % STATS_EVERY_TICKS == 0 {
            self.log_stats();
        }
        outcome
    }

    fn log_stats(&self) {
        let avg_ms = self.busy.as_millis() as u64 / self.ticks.max(1);
        info!(
            ticks = self.ticks,
            uptime_secs = self.started.elapsed().as_secs(),
            avg_tick_ms = avg_ms,
            state = self.state.name(),
            trades = self.stats.trades,
            realized_pnl = %self.stats.realized_pnl.round_dp(4),
            "Run statistics"
        );
    }

    async fn scan_and_enter(&mut self) -> TickOutcome {
        let deadline = self.ctx.engine().cycle_deadline();

        // Only the read phase sits under the deadline; an order in flight
        // is never abandoned.
        let decision = match tokio::time::timeout(deadline, self.scan()).await {
            Err(_) => {
                warn!(deadline_secs = deadline.as_secs(), "Scan exceeded cycle deadline");
                self.state = EngineState::Idle;
                return TickOutcome::Skipped("cycle deadline exceeded".to_string());
            }
            Ok(Err(e)) => {
                self.state = EngineState::Idle;
                if e.is_read_skippable() {
                    warn!(error = %e, "Scan skipped");
                } else {
                    error!(error = %e, "Scan failed");
                }
                return TickOutcome::Skipped(e.to_string());
            }
            Ok(Ok(ScanDecision::Pass(outcome))) => {
                self.state = EngineState::Idle;
                return outcome;
            }
            Ok(Ok(ScanDecision::Enter(plan))) => plan,
        };

        match self.executor.open(&decision).await {
            Ok(position) => {
                info!(
                    contract = %position.contract,
                    direction = %position.direction,
                    funding_rate = %position.funding_rate_at_entry,
                    "SCANNING -> OPEN"
                );
                self.state = EngineState::Open { position: position.clone() };
                TickOutcome::Opened(position)
            }
            Err(e @ ArbError::PartialFailure { compensated: false, .. }) => {
                Accountant::record_partial_failure(&mut self.stats);
                error!(error = %e, "Entry halted: exposure may be left open");
                self.halt = Some(HaltReason {
                    reason: e.to_string(),
                    since: self.ctx.now(),
                });
                self.state = EngineState::Idle;
                TickOutcome::EntryFailed(e.to_string())
            }
            Err(e @ ArbError::PartialFailure { .. }) => {
                Accountant::record_partial_failure(&mut self.stats);
                warn!(error = %e, "Entry reversed after partial failure");
                self.state = EngineState::Idle;
                TickOutcome::EntryFailed(e.to_string())
            }
            Err(e) => {
                warn!(contract = %decision.contract.id, error = %e, "Entry aborted");
                self.state = EngineState::Idle;
                TickOutcome::EntryFailed(e.to_string())
            }
        }
    }

    /// Read phase: from catalog to a sized plan. No orders are placed here.
    async fn scan(&self) -> ArbResult<ScanDecision> {
        let ctx = &self.ctx;
        let trading = ctx.trading();
        let timeout = ctx.engine().call_timeout();

        let positions = bounded(timeout, "fetch_open_positions", ctx.exchange.fetch_open_positions()).await?;
        if let Some(p) = positions.first() {
            warn!(contract = %p.contract, size = %p.size, "External position on account, not entering");
            return Ok(ScanDecision::Pass(TickOutcome::Skipped(format!(
                "external position on {}",
                p.contract
            ))));
        }

        let contracts = ContractCatalog::refresh(ctx).await?;
        let ranked = rank(&contracts, trading.min_funding_rate, ctx.engine().max_candidates);
        if ranked.is_empty() {
            debug!(contracts = contracts.len(), "No contract above minimum funding rate");
            return Ok(ScanDecision::Pass(TickOutcome::NoOpportunity));
        }

        let Some(best) = AvailabilityValidator::best(ctx, &ranked).await else {
            return Ok(ScanDecision::Pass(TickOutcome::NoOpportunity));
        };
        let contract = &best.scored.contract;

        let now = ctx.now();
        if !SettlementGate::is_open(contract.funding_interval_secs, now.timestamp(), trading.settlement_buffer_secs) {
            let secs = SettlementGate::secs_until_settlement(contract.funding_interval_secs, now.timestamp());
            debug!(contract = %contract.id, secs_until_settlement = secs, "Settlement gate closed");
            return Ok(ScanDecision::Pass(TickOutcome::GateClosed {
                contract: contract.id.clone(),
                secs_until_settlement: secs,
            }));
        }

        let (snapshot, available) = tokio::try_join!(
            fetch_snapshot(ctx, &contract.id, &contract.spot_pair),
            bounded(timeout, "fetch_balance", ctx.exchange.fetch_balance()),
        )?;
        ensure_fresh(&snapshot, ctx.now(), ctx.engine().max_snapshot_age_ms)?;

        // Both legs draw on one wallet
        let balance = trading.balance_ceiling.min(available / Decimal::TWO);
        let plan = plan_hedge(contract, &best.spot, &snapshot, balance, trading.leverage)?;

        info!(
            contract = %contract.id,
            yield_pct = %best.scored.annualized_yield_pct.round_dp(2),
            funding_rate = %contract.funding_rate,
            available = %available,
            balance = %balance,
            lots = %plan.futures_lots,
            spot_qty = %plan.spot_qty,
            "Entering hedge"
        );
        Ok(ScanDecision::Enter(Box::new(plan)))
    }

    async fn manage_open(&mut self, position: Position) -> TickOutcome {
        match self.monitor.poll(&position).await {
            Ok(None) => {
                self.state = EngineState::Open { position };
                TickOutcome::Holding
            }
            Ok(Some(reason)) => {
                info!(contract = %position.contract, reason = %reason, "OPEN -> CLOSING");
                let progress = CloseProgress::new(reason, self.ctx.now());
                self.continue_close(position, progress).await
            }
            Err(e) => {
                warn!(contract = %position.contract, error = %e, "Monitor read failed, holding");
                self.state = EngineState::Open { position };
                TickOutcome::Holding
            }
        }
    }

    async fn continue_close(&mut self, position: Position, mut progress: CloseProgress) -> TickOutcome {
        match self.closer.close(&position, &mut progress).await {
            Ok(trade) => {
                Accountant::record(&mut self.stats, &trade);
                info!(contract = %trade.contract, pnl = %trade.realized_pnl.round_dp(4), "CLOSING -> IDLE");
                self.state = EngineState::Idle;
                TickOutcome::Closed(trade)
            }
            Err(e) => {
                error!(
                    contract = %position.contract,
                    escalations = progress.escalations,
                    error = %e,
                    "Close escalated; exposure still open, retrying next tick"
                );
                if self.halt.is_none() {
                    self.halt = Some(HaltReason {
                        reason: e.to_string(),
                        since: self.ctx.now(),
                    });
                }
                self.state = EngineState::Closing { position, progress };
                TickOutcome::CloseFailed(e.to_string())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
