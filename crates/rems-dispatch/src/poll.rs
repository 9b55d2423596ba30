//! Poll pacing for the dispatcher.
//!
//! Status lookups run at a base interval. A failed lookup is transient: it
//! doubles the interval (capped) and the next successful lookup resets it.

use std::time::Duration;

use tracing::{debug, warn};

use rems_core::{ConfigResult, DispatchSettings};

/// Interval bounds and overall time budget for one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_interval: Duration,
    pub budget: Duration,
}

impl PollPolicy {
    pub fn from_settings(settings: &DispatchSettings) -> ConfigResult<Self> {
        Ok(Self {
            interval: settings.poll_interval()?,
            max_interval: settings.max_poll_interval()?,
            budget: settings.timeout()?,
        })
    }

    /// Same intervals with a tighter budget; never extends the configured one.
    pub fn with_budget(self, budget: Duration) -> Self {
        Self {
            budget: budget.min(self.budget),
            ..self
        }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(30),
            budget: Duration::from_secs(14 * 60),
        }
    }
}

/// Outcome of a single status lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollResult {
    /// The provider answered with a non-terminal status.
    Observed,
    /// The lookup failed or timed out.
    LookupFailed,
}

/// Tracks lookup failures and the interval before the next poll.
#[derive(Debug)]
pub struct PollTracker {
    polls: u32,
    consecutive_failures: u32,
    current_interval: Duration,
    base_interval: Duration,
    max_interval: Duration,
}

impl PollTracker {
    pub fn new(policy: &PollPolicy) -> Self {
        Self {
            polls: 0,
            consecutive_failures: 0,
            current_interval: policy.interval,
            base_interval: policy.interval,
            max_interval: policy.max_interval.max(policy.interval),
        }
    }

    /// Record a lookup and return the interval before the next one.
    pub fn record(&mut self, result: PollResult) -> Duration {
        self.polls += 1;
        match result {
            PollResult::Observed => {
                if self.consecutive_failures > 0 {
                    debug!(
                        failures = self.consecutive_failures,
                        "status lookups recovered"
                    );
                }
                self.consecutive_failures = 0;
                self.current_interval = self.base_interval;
            }
            PollResult::LookupFailed => {
                self.consecutive_failures += 1;
                self.current_interval = (self.current_interval * 2).min(self.max_interval);
                if self.consecutive_failures == 3 {
                    warn!(
                        failures = self.consecutive_failures,
                        "status lookups keep failing, still within budget"
                    );
                }
            }
        }
        self.current_interval
    }

    pub fn next_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn polls(&self) -> u32 {
        self.polls
    }
}
