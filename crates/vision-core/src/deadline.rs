//! Absolute, monotonic per-request deadlines.
//!
//! The orchestrator computes a single deadline at the start of a request and
//! passes it down to every CPU-bound stage by value. Stages check it at
//! coarse boundaries (before binarization, before contour extraction, before
//! each table cell) and never inside inner pixel loops. An expired deadline
//! is never an error: stages return whatever partial result they have and
//! set `time_budget_exceeded` on the way out.

use std::time::{Duration, Instant};

/// A point in time after which CPU-bound stages should stop doing further
/// work and return their best partial result.
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Instant);

impl Deadline {
    /// A deadline `budget` from now.
    #[must_use]
    pub fn after(budget: Duration) -> Self {
        Self(Instant::now() + budget)
    }

    /// A deadline that has already passed, for tests that want to force the
    /// `time_budget_exceeded` path.
    #[must_use]
    pub fn expired_now() -> Self {
        Self(Instant::now())
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.0
    }

    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn fresh_deadline_is_not_expired() {
        let d = Deadline::after(Duration::from_secs(4));
        assert!(!d.is_expired());
    }

    #[test]
    fn short_deadline_expires() {
        let d = Deadline::after(Duration::from_millis(1));
        sleep(Duration::from_millis(5));
        assert!(d.is_expired());
    }

    #[test]
    fn expired_now_is_expired() {
        assert!(Deadline::expired_now().is_expired());
    }
}
