//! Retry decisions and backoff delays of the executor.

use std::time::Duration;

use http::StatusCode;
use rand::Rng;

use crate::config::ExponentialBackoff;

/// What the executor does after one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Hand the response to the decoder
    Decode,
    /// Rebuild and send again
    Retry,
    /// Stop with the failure of this attempt
    Fail,
}

/// Attempt outcome classes seen by the retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptResult {
    /// A response arrived with this status
    Status(StatusCode),
    /// Network or timeout failure before a response
    Transport,
    /// TLS trust-chain failure
    Certificate,
    /// Response body over the configured limit
    BodyTooLarge,
}

/// Decide the next step for `attempt` (0-based) under a `max_retries`
/// budget.
///
/// Transport failures and statuses of 500 and above are retried while
/// budget remains;
/// certificate failures and oversized bodies never are; every other status
/// goes to the decoder.
#[must_use]
pub fn decide(result: AttemptResult, attempt: u32, max_retries: u32) -> Outcome {
    match result {
        AttemptResult::Certificate | AttemptResult::BodyTooLarge => Outcome::Fail,
        AttemptResult::Status(status) if status.as_u16() < 500 => Outcome::Decode,
        AttemptResult::Transport | AttemptResult::Status(_) => {
            if attempt < max_retries {
                Outcome::Retry
            } else {
                Outcome::Fail
            }
        }
    }
}

/// Longest delay ever slept between attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Delay before retry number `attempt + 1`:
/// `min(initial * multiplier^attempt, max)`, plus up to 25% jitter, never
/// above `max`.
///
/// A non-finite or negative multiplier counts as 1.
#[must_use]
pub fn calculate_backoff(backoff: &ExponentialBackoff, attempt: u32) -> Duration {
    let cap = backoff.max.min(MAX_BACKOFF);
    let multiplier = if backoff.multiplier.is_finite() && backoff.multiplier >= 0.0 {
        backoff.multiplier
    } else {
        1.0
    };
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let secs = backoff.initial.as_secs_f64() * multiplier.powi(exponent);

    // overflow to infinity lands on the cap
    let delay = Duration::try_from_secs_f64(secs).map_or(cap, |d| d.min(cap));
    if backoff.jitter {
        let factor = rand::rng().random_range(1.0..=1.25);
        delay.mul_f64(factor).min(cap)
    } else {
        delay
    }
}
