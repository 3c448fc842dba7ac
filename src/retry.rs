use tracing::warn;

/// Decision returned by the retry policy after a failed read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Failure is within budget: skip this cycle and sample again next time
    /// (includes the 1-based count of consecutive failures so far).
    Retry { attempt: u32 },
    /// Consecutive failures exceeded the ceiling, stop monitoring.
    Abort,
}

/// Ceiling on consecutive read failures.
///
/// Any successful read resets the count, so only an unbroken run of
/// `max_retries + 1` failures aborts the monitor.
pub struct RetryPolicy {
    max_retries: u32,
    consecutive_failures: u32,
}

impl RetryPolicy {
    /// Create a new retry policy from config values.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            consecutive_failures: 0,
        }
    }

    /// Record a failed read and decide whether monitoring can continue.
    pub fn record_failure(&mut self, error: impl std::fmt::Display) -> RetryDecision {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        if self.consecutive_failures <= self.max_retries {
            warn!(
                error = %error,
                attempt = self.consecutive_failures,
                max_retries = self.max_retries,
                "read failed, will retry next cycle"
            );
            RetryDecision::Retry {
                attempt: self.consecutive_failures,
            }
        } else {
            warn!(
                error = %error,
                failures = self.consecutive_failures,
                max_retries = self.max_retries,
                "read failures exceeded retry ceiling"
            );
            RetryDecision::Abort
        }
    }

    /// Record a successful read.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Consecutive failures since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}
