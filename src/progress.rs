//! Progress accounting for an operation session.
//!
//! Two signals with very different trust levels:
//!
//! * [`UploadProgress`]: **authoritative**. Derived from bytes the
//!   exchange executor actually handed to the transport.
//! * [`ProcessingEstimate`]: **advisory**. There is no push channel from
//!   the backend engines, so server-side progress is a client-side estimate
//!   that grows with elapsed time and never reaches 100 until the exchange
//!   really completes. Do not treat it as backend state, and do not write
//!   tests that expect it to match real work.
//!
//! Both are monotonic: a reading never decreases, it may plateau.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Ceiling of the advisory estimate while the exchange is still running.
pub const ESTIMATE_CEILING: u8 = 95;

/// Bytes-based upload progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadProgress {
    sent: u64,
    total: u64,
    percent: u8,
}

impl UploadProgress {
    /// Record `sent` of `total` bytes. A zero `total` counts as done.
    ///
    /// Returns `true` when the percentage moved.
    pub fn record(&mut self, sent: u64, total: u64) -> bool {
        let computed = if total == 0 {
            100
        } else {
            ((sent.min(total) as u128 * 100) / total as u128) as u8
        };
        self.sent = self.sent.max(sent);
        self.total = self.total.max(total);
        if computed > self.percent {
            self.percent = computed;
            true
        } else {
            false
        }
    }

    /// Mark the upload finished regardless of reported bytes.
    pub fn complete(&mut self) {
        self.sent = self.total;
        self.percent = 100;
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }

    pub fn is_complete(&self) -> bool {
        self.percent >= 100
    }

    pub fn bytes_sent(&self) -> u64 {
        self.sent
    }

    pub fn bytes_total(&self) -> u64 {
        self.total
    }
}

/// Time-based estimate of server-side progress. Advisory only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingEstimate {
    percent: u8,
}

impl ProcessingEstimate {
    /// Estimate for `elapsed` time in processing, given a typical duration.
    ///
    /// Approaches [`ESTIMATE_CEILING`] asymptotically: ~60 % of the ceiling
    /// after `expected`, ~86 % after twice that.
    pub fn estimate(elapsed: Duration, expected: Duration) -> u8 {
        let tau = expected.as_secs_f64().max(0.001);
        let fraction = 1.0 - (-elapsed.as_secs_f64() / tau).exp();
        (f64::from(ESTIMATE_CEILING) * fraction).floor() as u8
    }

    /// Move the estimate forward. Returns `true` when it changed.
    pub fn advance(&mut self, elapsed: Duration, expected: Duration) -> bool {
        let next = Self::estimate(elapsed, expected).min(ESTIMATE_CEILING);
        if next > self.percent {
            self.percent = next;
            true
        } else {
            false
        }
    }

    /// The exchange completed; the estimate is no longer needed.
    pub fn complete(&mut self) {
        self.percent = 100;
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_is_monotonic() {
        let mut p = UploadProgress::default();
        assert!(p.record(50, 100));
        assert_eq!(p.percent(), 50);
        // a late, smaller report never moves it back
        assert!(!p.record(10, 100));
        assert_eq!(p.percent(), 50);
        assert!(p.record(100, 100));
        assert!(p.is_complete());
    }

    #[test]
    fn upload_clamps_overshoot_and_zero_total() {
        let mut p = UploadProgress::default();
        p.record(500, 100);
        assert_eq!(p.percent(), 100);

        let mut empty = UploadProgress::default();
        empty.record(0, 0);
        assert!(empty.is_complete());
    }

    #[test]
    fn upload_plateau_is_not_a_change() {
        let mut p = UploadProgress::default();
        p.record(1, 3);
        assert!(!p.record(1, 3));
        assert_eq!(p.percent(), 33);
    }

    #[test]
    fn estimate_never_reaches_100_on_its_own() {
        let expected = Duration::from_secs(30);
        assert_eq!(ProcessingEstimate::estimate(Duration::ZERO, expected), 0);
        let late = ProcessingEstimate::estimate(Duration::from_secs(3600), expected);
        assert_eq!(late, ESTIMATE_CEILING);
        assert_eq!(ESTIMATE_CEILING, 95);

        let mut e = ProcessingEstimate::default();
        e.advance(Duration::from_secs(3600), expected);
        assert!(e.percent() < 100);
        e.complete();
        assert_eq!(e.percent(), 100);
    }

    #[test]
    fn estimate_is_monotonic() {
        let expected = Duration::from_secs(10);
        let mut e = ProcessingEstimate::default();
        assert!(e.advance(Duration::from_secs(10), expected));
        let at_ten = e.percent();
        assert!(!e.advance(Duration::from_secs(5), expected));
        assert_eq!(e.percent(), at_ten);
    }
}
