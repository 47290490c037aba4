//! Per-backend circuit breaker state.
//!
//! Pure state machine: callers pass the current instant, so transitions are
//! deterministic under test. The owning wrapper serializes access.

use std::time::{Duration, Instant};

/// Thresholds shared by every breaker of one wrapper instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerPolicy {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// How long an open breaker rejects calls before allowing a trial.
    pub open_timeout: Duration,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            open_timeout: Duration::from_secs(60),
        }
    }
}

/// Failure bookkeeping for one backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CircuitState {
    pub is_open: bool,
    pub failure_count: u32,
    pub last_failure_time: Option<Instant>,
    pub last_success_time: Option<Instant>,
}

impl CircuitState {
    /// Whether calls may be routed to the backend at `now`.
    ///
    /// An open breaker becomes available again (half-open) once the timeout
    /// has elapsed since the last failure. The next outcome decides whether it
    /// closes or stays open.
    pub fn is_available(&self, policy: &BreakerPolicy, now: Instant) -> bool {
        if !self.is_open {
            return true;
        }
        match self.last_failure_time {
            Some(failed_at) => now.saturating_duration_since(failed_at) > policy.open_timeout,
            None => true,
        }
    }

    /// Any success closes the breaker and clears the failure count.
    pub fn record_success(&mut self, now: Instant) {
        self.is_open = false;
        self.failure_count = 0;
        self.last_success_time = Some(now);
    }

    /// Count a failure. Returns true when this failure opened the breaker.
    pub fn record_failure(&mut self, policy: &BreakerPolicy, now: Instant) -> bool {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_time = Some(now);
        let was_open = self.is_open;
        if self.failure_count >= policy.failure_threshold {
            self.is_open = true;
        }
        self.is_open && !was_open
    }
}
