//! Reconnect delay calculation.

use std::time::Duration;

use rand::Rng;

use crate::config::RestartPolicy;

/// Delay before reconnect attempt `attempt` (0-based), with ±25%
/// jitter so a pool of failing servers does not retry in lockstep.
pub fn reconnect_delay(policy: &RestartPolicy, attempt: u32) -> Duration {
    let exponent = attempt.min(63) as i32;
    let base = policy.initial_delay_ms as f64 * policy.backoff_factor.powi(exponent);
    let capped = base.min(policy.max_delay_ms as f64);
    let jitter = rand::rng().random_range(0.75..=1.25);
    let delay_ms = (capped * jitter).min(policy.max_delay_ms as f64) as u64;
    Duration::from_millis(delay_ms)
}
