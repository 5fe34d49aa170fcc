//! Consecutive-failure budget for one relayed request

/// Counts attempts that ended without completing, forgiving them whenever an
/// attempt makes progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    consecutive_failures: u32,
    max: u32,
}

impl RetryBudget {
    pub fn new(max: u32) -> Self {
        Self {
            consecutive_failures: 0,
            max,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    /// An attempt produced text; prior failures are forgiven.
    pub fn record_progress(&mut self) {
        self.consecutive_failures = 0;
    }

    /// An attempt needs a retry.
    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    /// True once the counter exceeds the configured maximum
    pub fn is_exhausted(&self) -> bool {
        self.consecutive_failures > self.max
    }
}
