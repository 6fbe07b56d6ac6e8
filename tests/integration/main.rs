//! Integration tests for the funding-rate arbitrage engine.
//!
//! Everything runs against an in-memory exchange; no network access.

mod lifecycle;
mod mock_exchange;
mod validator;
