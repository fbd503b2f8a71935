//! # Jitter policy for retry delays.
//!
//! Many Topic/Subscription instances hitting the same broker tend to fail together and
//! retry together. [`JitterPolicy`] spreads those retries out.
//!
//! - [`JitterPolicy::None`] exact delay
//! - [`JitterPolicy::Full`] uniform in `[0, delay]`
//! - [`JitterPolicy::Equal`] `delay/2 + uniform[0, delay/2]`
//! - [`JitterPolicy::Decorrelated`] uniform in `[base, delay * 3]`, capped at max

use rand::Rng;
use std::time::Duration;

/// Policy controlling randomization of retry delays.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum JitterPolicy {
    /// Use the backoff delay as is.
    #[default]
    None,
    /// Uniform delay in `[0, delay]`.
    Full,
    /// Half the delay plus a uniform share of the other half.
    Equal,
    /// Uniform delay in `[base, prev * 3]`, capped at max.
    ///
    /// Needs extra context, see [`apply_decorrelated`](Self::apply_decorrelated).
    Decorrelated,
}

impl JitterPolicy {
    /// Applies jitter to the given delay.
    ///
    /// `Decorrelated` returns the input unchanged here.
    pub fn apply(&self, delay: Duration) -> Duration {
        match self {
            JitterPolicy::None | JitterPolicy::Decorrelated => delay,
            JitterPolicy::Full => uniform_ms(0, millis(delay)),
            JitterPolicy::Equal => {
                let half = millis(delay) / 2;
                Duration::from_millis(half) + uniform_ms(0, half)
            }
        }
    }

    /// Applies decorrelated jitter with full context.
    ///
    /// Falls back to [`apply`](Self::apply) on `prev` for the other policies.
    pub fn apply_decorrelated(&self, base: Duration, prev: Duration, max: Duration) -> Duration {
        if !matches!(self, JitterPolicy::Decorrelated) {
            return self.apply(prev);
        }
        let lower = millis(base);
        let upper = millis(prev).saturating_mul(3).min(millis(max)).max(lower);
        if lower >= upper {
            return base;
        }
        uniform_ms(lower, upper)
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis().min(u128::from(u64::MAX)) as u64
}

fn uniform_ms(lower: u64, upper: u64) -> Duration {
    if upper <= lower {
        return Duration::from_millis(lower);
    }
    Duration::from_millis(rand::rng().random_range(lower..=upper))
}
