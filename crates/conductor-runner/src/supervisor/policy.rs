//! Restart budget and delay between root-agent attempts.

use std::time::Duration;

/// Default number of root-agent attempts before giving up.
pub const DEFAULT_MAX_RESTARTS: u32 = 100;

/// Default pause between attempts.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(1);

/// How the pause between attempts evolves.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Same delay after every attempt.
    Fixed(Duration),
    /// `first * factor^attempt`, capped at `max`.
    Exponential {
        first: Duration,
        max: Duration,
        factor: f64,
    },
}

impl Backoff {
    /// Delay to sleep after attempt number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Exponential { first, max, factor } => {
                let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
                let secs = first.as_secs_f64() * factor.powi(exp);
                if !secs.is_finite() || secs < 0.0 || secs > max.as_secs_f64() {
                    max
                } else {
                    Duration::from_secs_f64(secs)
                }
            }
        }
    }
}

/// Bounded restart policy for the root agent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_restarts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_MAX_RESTARTS, DEFAULT_RESTART_DELAY)
    }
}

impl RetryPolicy {
    pub const fn fixed(max_restarts: u32, delay: Duration) -> Self {
        Self {
            max_restarts,
            backoff: Backoff::Fixed(delay),
        }
    }

    /// Whether another attempt may start after `attempts` have run.
    pub const fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_restarts
    }

    /// Pause after attempt number `attempt` (zero-based) before re-checking.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }
}
