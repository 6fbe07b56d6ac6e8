//! Pre-settlement entry window.
//!
//! Funding settles on interval boundaries measured from the Unix epoch.
//! Entry is allowed only in the last `buffer` seconds before a boundary,
//! so the position captures the imminent payment.

pub struct SettlementGate;

impl SettlementGate {
    /// `elapsed = now mod interval`; open iff `elapsed > interval - buffer`.
    ///
    /// A zero interval never opens. A buffer at least as long as the
    /// interval keeps the gate open except exactly on the boundary.
    pub fn is_open(interval_secs: u64, now_unix: i64, buffer_secs: u64) -> bool {
        if interval_secs == 0 {
            return false;
        }
        let interval = interval_secs as i64;
        let elapsed = now_unix.rem_euclid(interval);
        elapsed > interval - buffer_secs.min(interval_secs) as i64
    }

    /// Seconds until the next settlement boundary.
    pub fn secs_until_settlement(interval_secs: u64, now_unix: i64) -> u64 {
        if interval_secs == 0 {
            return 0;
        }
        let interval = interval_secs as i64;
        (interval - now_unix.rem_euclid(interval)) as u64
    }
}
