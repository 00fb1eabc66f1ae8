//! Backoff policy for re-establishing a dropped connection
//!
//! `delay(n) = min(unit * base^n, cap)`. The policy never gives up: a long-lived
//! scanner client keeps retrying at the capped interval until told to disconnect.

use crate::transport::Endpoint;
use std::time::Duration;

/// Default exponential base
pub const DEFAULT_BASE: u32 = 2;

/// Default upper bound on a single delay
pub const DEFAULT_CAP: Duration = Duration::from_secs(30);

/// Capped exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    base: u32,
    cap: Duration,
    unit: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE,
            cap: DEFAULT_CAP,
            unit: Duration::from_secs(1),
        }
    }
}

impl ReconnectPolicy {
    /// Create a policy; a base below 1 is clamped to 1
    pub fn new(base: u32, cap: Duration) -> Self {
        Self {
            base: base.max(1),
            cap,
            ..Self::default()
        }
    }

    /// Scale every delay by `unit` instead of one second
    pub fn with_unit(mut self, unit: Duration) -> Self {
        self.unit = unit;
        self
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }

    /// Delay before the retry that follows `attempt` earlier failures
    pub fn delay(&self, attempt: u32) -> Duration {
        u64::from(self.base)
            .checked_pow(attempt)
            .and_then(|factor| u32::try_from(factor).ok())
            .and_then(|factor| self.unit.checked_mul(factor))
            .map_or(self.cap, |delay| delay.min(self.cap))
    }

    /// Whether another attempt should be made; always true
    pub fn should_retry(&self, _attempt: u32) -> bool {
        true
    }
}

/// Retry bookkeeping for one logical client
#[derive(Debug, Clone, Default)]
pub struct ReconnectContext {
    attempt_count: u32,
    target: Option<Endpoint>,
}

impl ReconnectContext {
    /// Start over against a newly requested endpoint
    pub fn retarget(&mut self, endpoint: Endpoint) {
        self.attempt_count = 0;
        self.target = Some(endpoint);
    }

    /// A connection came up; the next failure starts from the first delay again
    pub fn reset(&mut self) {
        self.attempt_count = 0;
    }

    /// Record a failed or closed connection and return how long to wait before retrying
    pub fn record_failure(&mut self, policy: &ReconnectPolicy) -> Duration {
        let delay = policy.delay(self.attempt_count);
        self.attempt_count = self.attempt_count.saturating_add(1);
        delay
    }

    /// Delay the next failure would produce
    pub fn next_delay(&self, policy: &ReconnectPolicy) -> Duration {
        policy.delay(self.attempt_count)
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Last endpoint a caller asked for
    pub fn target(&self) -> Option<&Endpoint> {
        self.target.as_ref()
    }
}
