use std::time::Duration;

use rand::Rng;

use crate::flags::SKEIN_BACKOFF_BASE_MS;

const BACKOFF_FACTOR: f64 = 2.0;
const MAX_DELAY_MS: u64 = 16_000;

/// Exponential backoff with ±10% jitter, capped. `attempt` is 1-based.
pub(crate) fn backoff(attempt: u64) -> Duration {
    let exp = BACKOFF_FACTOR.powi(attempt.saturating_sub(1) as i32);
    let base = ((*SKEIN_BACKOFF_BASE_MS as f64 * exp) as u64).min(MAX_DELAY_MS);
    let jitter = rand::rng().random_range(0.9..1.1);
    Duration::from_millis((base as f64 * jitter) as u64)
}
