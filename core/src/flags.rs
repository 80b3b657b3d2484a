use std::time::Duration;

use env_flags::env_flags;

env_flags! {
    /// Retries allowed after a failed or dropped streaming attempt.
    pub SKEIN_STREAM_MAX_RETRIES: u64 = 3;

    /// Base delay for the exponential backoff schedule (1s, 2s, 4s, ...).
    pub SKEIN_BACKOFF_BASE_MS: u64 = 1_000;

    /// A stream with no frame at all for this long is treated as dropped.
    pub SKEIN_STREAM_IDLE_TIMEOUT_MS: Duration = Duration::from_millis(30_000), |value| {
        value.parse().map(Duration::from_millis)
    };

    /// A stream with no terminal signal for this long is treated as
    /// implicitly complete, so the UI never sticks in "generating".
    pub SKEIN_WATCHDOG_MS: Duration = Duration::from_millis(30_000), |value| {
        value.parse().map(Duration::from_millis)
    };
}

/// Return the effective retry budget for streaming attempts.
///
/// `env_flags!` initialises its values lazily and caches them for the
/// remainder of the process. Tests tweak `SKEIN_STREAM_MAX_RETRIES` at
/// runtime to exercise the retry loop deterministically, and a cached
/// value would silently leak between tests. Re-read the raw environment
/// variable on every call and fall back to the cached default.
#[inline]
pub fn stream_max_retries() -> u64 {
    match std::env::var("SKEIN_STREAM_MAX_RETRIES") {
        Ok(s) => s.parse::<u64>().unwrap_or(*SKEIN_STREAM_MAX_RETRIES),
        Err(_) => *SKEIN_STREAM_MAX_RETRIES,
    }
}
