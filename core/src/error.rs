use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SkeinErr>;

/// Error taxonomy for the sync/streaming engine.
///
/// `Interrupted` is deliberately an error *variant* rather than a panic or
/// a silent return so that it can flow through the same channels as
/// transport failures, but callers treat it as a normal termination path.
#[derive(Debug, Error)]
pub enum SkeinErr {
    /// Terminal. Credentials were rejected; retrying cannot help.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Terminal for the current attempt. Surfaced as a distinct
    /// user-facing state, never retried in a loop.
    #[error("rate limited by the service")]
    RateLimited { retry_after: Option<Duration> },

    /// Mid-stream disconnect, idle timeout, or malformed SSE framing.
    #[error("stream disconnected before completion: {0}")]
    Stream(String),

    /// Transient server-side failure (5xx class).
    #[error("server error {status}")]
    ServerError {
        status: StatusCode,
        retry_after: Option<Duration>,
    },

    /// Any other non-success HTTP status. Not retried.
    #[error("unexpected status {0}: {1}")]
    UnexpectedStatus(StatusCode, String),

    /// The retry budget was exhausted without a successful stream.
    #[error("giving up after {attempts} attempts: {last}")]
    RetryLimit {
        attempts: u64,
        #[source]
        last: Box<SkeinErr>,
    },

    /// Incremental sync was requested for an agent with no sync cursor.
    #[error("no sync cursor for agent {0}, full sync required")]
    NoSyncCursor(String),

    /// User-initiated cancellation. A success path, not a failure.
    #[error("interrupted")]
    Interrupted,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
}

impl SkeinErr {
    /// True for failures the retry controller may transparently retry:
    /// network-level errors, 5xx-class responses, and mid-stream drops.
    pub fn is_retryable(&self) -> bool {
        match self {
            SkeinErr::Stream(_) | SkeinErr::ServerError { .. } => true,
            SkeinErr::Reqwest(e) => {
                e.is_connect() || e.is_timeout() || e.is_request() || e.is_body()
            }
            _ => false,
        }
    }

    /// Server-suggested wait before the next attempt, when one was given.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SkeinErr::ServerError { retry_after, .. }
            | SkeinErr::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}
