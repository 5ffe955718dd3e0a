// src/deadline.rs

//! Cooperative deadline for a reconcile pass

use crate::error::{Error, Result};
use std::time::{Duration, Instant};

/// Longest timeout used when the requested one overflows
pub const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Point in time after which work should stop
///
/// Checked before store calls and between installation steps; nothing is
/// interrupted preemptively.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// Deadline `timeout` from now
    ///
    /// A timeout too large to represent is clamped to a day.
    pub fn after(timeout: Duration) -> Self {
        let now = Instant::now();
        let at = now
            .checked_add(timeout)
            .or_else(|| now.checked_add(MAX_TIMEOUT))
            .unwrap_or(now);
        Self { at }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Time left, zero once expired
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// Fail with `DeadlineExceeded` if the deadline has passed
    pub fn check(&self, what: &str) -> Result<()> {
        if self.is_expired() {
            return Err(Error::DeadlineExceeded(what.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_expiry() {
        let deadline = Deadline::after(Duration::from_secs(60));
        assert!(deadline.check("solving").is_ok());
        assert!(deadline.remaining() > Duration::from_secs(50));

        let expired = Deadline::after(Duration::ZERO);
        let err = expired.check("solving").unwrap_err();
        assert_eq!(err.to_string(), "Deadline exceeded while solving");
        assert_eq!(expired.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_huge_timeout_does_not_overflow() {
        let deadline = Deadline::after(Duration::from_secs(u64::MAX));
        assert!(deadline.check("solving").is_ok());
        assert!(deadline.remaining() <= MAX_TIMEOUT);
    }
}
