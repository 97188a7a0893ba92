//! Retry backoff schedules for transient chain faults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::humantime_serde;

/// Backoff schedule applied between submit retries.
///
/// Only [`ChainError::Unavailable`](crate::chain::ChainError::Unavailable)
/// is ever retried on this schedule; reverts and authorization failures are
/// terminal for the pass regardless of configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// Fixed delay between attempts.
    Fixed {
        /// Delay duration.
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },

    /// Exponential backoff, capped.
    Exponential {
        /// Delay after the first failed attempt.
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,

        /// Upper bound on the delay.
        #[serde(with = "humantime_serde")]
        max_delay: Duration,

        /// Growth factor per attempt.
        #[serde(default = "default_multiplier")]
        multiplier: f64,
    },
}

const fn default_multiplier() -> f64 {
    2.0
}

impl Default for BackoffConfig {
    /// Documented default: exponential, 1s initial, 60s cap, doubling.
    fn default() -> Self {
        Self::Exponential {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Delay to sleep after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => {
                let exp = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
                let secs = initial_delay.as_secs_f64() * multiplier.powi(exp);
                // The product overflows f64 (and Duration) long before the
                // attempt counter does; saturate at the cap instead of
                // letting Duration::from_secs_f64 panic.
                if secs.is_finite() && secs >= 0.0 && secs < max_delay.as_secs_f64() {
                    Duration::from_secs_f64(secs)
                } else {
                    *max_delay
                }
            },
        }
    }
}
