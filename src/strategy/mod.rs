//! Pure decision logic: yield ranking, settlement timing, leg sizing and
//! the close policy. Nothing here performs I/O.

pub mod exit;
pub mod scorer;
pub mod settlement;
pub mod sizing;

pub use exit::{ExitPolicy, Valuation};
pub use scorer::{rank, ScoredContract};
pub use settlement::SettlementGate;
pub use sizing::{plan_hedge, HedgePlan};
