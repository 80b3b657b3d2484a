//! Retry controller: wraps streaming attempts in a bounded retry loop.
//!
//! Only classified-retryable failures are retried (network-level errors,
//! 5xx responses, mid-stream drops). Auth and rate-limit surface
//! immediately. Before each retry a synthetic `Reset` chunk is emitted,
//! because the reconnect replays the response from the start and any
//! partial content from the failed attempt must be discarded, followed
//! by a `Status` chunk so the caller can render "reconnecting" without
//! knowing retry internals.
//! Cancellation is checked before starting, before each
//! backoff wait, and after it; a cancelled stream closes silently —
//! no further chunks, no error.

use std::sync::Arc;

use skein_protocol::AgentId;
use skein_protocol::StreamChunk;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::error::Result;
use crate::error::SkeinErr;
use crate::flags::stream_max_retries;
use crate::transport::ChunkStream;
use crate::transport::Transport;
use crate::util::backoff;

/// Open a streaming request with automatic reconnection. The returned
/// stream ends with a `Done` chunk, one terminal error, or silently on
/// cancellation.
pub fn open_resilient_stream(
    transport: Arc<dyn Transport>,
    agent: AgentId,
    input: String,
    cancel: CancellationToken,
) -> ChunkStream {
    let (tx_event, rx_event) = mpsc::channel::<Result<StreamChunk>>(64);
    tokio::spawn(run_with_retries(transport, agent, input, tx_event, cancel));
    ChunkStream { rx_event }
}

enum AttemptOutcome {
    Completed,
    Cancelled,
}

async fn run_with_retries(
    transport: Arc<dyn Transport>,
    agent: AgentId,
    input: String,
    tx_event: mpsc::Sender<Result<StreamChunk>>,
    cancel: CancellationToken,
) {
    let max_retries = stream_max_retries();
    let mut attempt: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            return;
        }
        attempt += 1;

        match run_attempt(&*transport, &agent, &input, &tx_event, &cancel).await {
            Ok(AttemptOutcome::Completed) | Ok(AttemptOutcome::Cancelled) => return,
            Err(e) => {
                if !e.is_retryable() {
                    debug!(error = %e, "terminal stream failure");
                    let _ = tx_event.send(Err(e)).await;
                    return;
                }
                if attempt > max_retries {
                    warn!(attempts = attempt, "stream retry budget exhausted");
                    let _ = tx_event
                        .send(Err(SkeinErr::RetryLimit {
                            attempts: attempt,
                            last: Box::new(e),
                        }))
                        .await;
                    return;
                }

                // The reconnect replays the response from the start, so
                // downstream must first discard what the failed attempt
                // already delivered.
                if tx_event.send(Ok(StreamChunk::Reset)).await.is_err() {
                    return;
                }
                let status = StreamChunk::Status {
                    text: format!(
                        "reconnecting (attempt {}/{})",
                        attempt + 1,
                        max_retries + 1
                    ),
                };
                if tx_event.send(Ok(status)).await.is_err() {
                    return;
                }

                if cancel.is_cancelled() {
                    return;
                }
                let delay = e.retry_after().unwrap_or_else(|| backoff(attempt));
                debug!(?delay, attempt, "backing off before reconnect");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                if cancel.is_cancelled() {
                    return;
                }
            }
        }
    }
}

/// Run a single attempt: open the stream, forward chunks until the
/// terminal signal. Returns `Err` only for failures the outer loop may
/// classify; cancellation is an outcome, not an error.
async fn run_attempt(
    transport: &dyn Transport,
    agent: &AgentId,
    input: &str,
    tx_event: &mpsc::Sender<Result<StreamChunk>>,
    cancel: &CancellationToken,
) -> Result<AttemptOutcome> {
    let mut chunks = transport.open_message_stream(agent, input).await?;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(AttemptOutcome::Cancelled),
            next = chunks.next() => match next {
                None => {
                    // Transport closed without an explicit terminal chunk;
                    // synthesize one so downstream always finalizes.
                    let _ = tx_event.send(Ok(StreamChunk::Done)).await;
                    return Ok(AttemptOutcome::Completed);
                }
                Some(Ok(chunk)) => {
                    let done = matches!(chunk, StreamChunk::Done);
                    if tx_event.send(Ok(chunk)).await.is_err() {
                        return Ok(AttemptOutcome::Cancelled);
                    }
                    if done {
                        return Ok(AttemptOutcome::Completed);
                    }
                }
                Some(Err(e)) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicU64;
    use std::sync::atomic::Ordering;

    use assert_matches::assert_matches;
    use serde_json::Value;
    use skein_protocol::StreamChunk;

    use super::*;
    use crate::transport::PageRequest;

    struct AlwaysFailing {
        attempts: AtomicU64,
    }

    #[async_trait::async_trait]
    impl Transport for AlwaysFailing {
        async fn fetch_messages_page(
            &self,
            _agent: &AgentId,
            _page: PageRequest,
        ) -> Result<Vec<Value>> {
            unimplemented!("not used")
        }

        async fn open_message_stream(&self, _agent: &AgentId, _input: &str) -> Result<ChunkStream> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(SkeinErr::ServerError {
                status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                retry_after: None,
            })
        }
    }

    struct AuthFailing {
        attempts: AtomicU64,
    }

    #[async_trait::async_trait]
    impl Transport for AuthFailing {
        async fn fetch_messages_page(
            &self,
            _agent: &AgentId,
            _page: PageRequest,
        ) -> Result<Vec<Value>> {
            unimplemented!("not used")
        }

        async fn open_message_stream(&self, _agent: &AgentId, _input: &str) -> Result<ChunkStream> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(SkeinErr::Auth("bad key".into()))
        }
    }

    async fn drain(mut stream: ChunkStream) -> Vec<Result<StreamChunk>> {
        let mut out = Vec::new();
        while let Some(item) = stream.next().await {
            out.push(item);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failure_attempts_max_plus_one_then_surfaces() {
        let transport = Arc::new(AlwaysFailing {
            attempts: AtomicU64::new(0),
        });
        let max = stream_max_retries();
        let stream = open_resilient_stream(
            transport.clone(),
            AgentId::from("a"),
            "hi".into(),
            CancellationToken::new(),
        );
        let events = drain(stream).await;

        assert_eq!(transport.attempts.load(Ordering::SeqCst), max + 1);
        // One reconnect status per retry, then a single terminal error.
        let statuses = events
            .iter()
            .filter(|e| matches!(e, Ok(StreamChunk::Status { .. })))
            .count();
        assert_eq!(statuses as u64, max);
        let last = events.last().expect("one terminal event");
        assert_matches!(
            last,
            Err(SkeinErr::RetryLimit { attempts, .. }) if *attempts == max + 1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_failure_surfaces_with_zero_retries() {
        let transport = Arc::new(AuthFailing {
            attempts: AtomicU64::new(0),
        });
        let stream = open_resilient_stream(
            transport.clone(),
            AgentId::from("a"),
            "hi".into(),
            CancellationToken::new(),
        );
        let events = drain(stream).await;

        assert_eq!(transport.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(events.len(), 1);
        assert_matches!(events.first(), Some(Err(SkeinErr::Auth(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn mid_stream_failure_replays_behind_a_reset() {
        struct FlakyTransport {
            attempts: AtomicU64,
        }

        #[async_trait::async_trait]
        impl Transport for FlakyTransport {
            async fn fetch_messages_page(
                &self,
                _agent: &AgentId,
                _page: PageRequest,
            ) -> Result<Vec<Value>> {
                unimplemented!("not used")
            }

            async fn open_message_stream(
                &self,
                _agent: &AgentId,
                _input: &str,
            ) -> Result<ChunkStream> {
                let n = self.attempts.fetch_add(1, Ordering::SeqCst);
                let (tx, rx) = mpsc::channel(8);
                tokio::spawn(async move {
                    if n == 0 {
                        let _ = tx
                            .send(Ok(StreamChunk::AssistantDelta { text: "Hel".into() }))
                            .await;
                        let _ = tx
                            .send(Err(SkeinErr::Stream("connection reset".into())))
                            .await;
                    } else {
                        let _ = tx
                            .send(Ok(StreamChunk::AssistantDelta {
                                text: "Hello".into(),
                            }))
                            .await;
                        let _ = tx.send(Ok(StreamChunk::Done)).await;
                    }
                });
                Ok(ChunkStream { rx_event: rx })
            }
        }

        let stream = open_resilient_stream(
            Arc::new(FlakyTransport {
                attempts: AtomicU64::new(0),
            }),
            AgentId::from("a"),
            "hi".into(),
            CancellationToken::new(),
        );
        let events = drain(stream).await;
        let chunks: Vec<StreamChunk> = events
            .into_iter()
            .collect::<std::result::Result<_, _>>()
            .expect("retry absorbs the mid-stream failure");

        // The partial delta is followed by a reset, so consumers drop it
        // before the replay arrives.
        assert_matches!(
            &chunks[..],
            [
                StreamChunk::AssistantDelta { text: partial },
                StreamChunk::Reset,
                StreamChunk::Status { .. },
                StreamChunk::AssistantDelta { text: full },
                StreamChunk::Done,
            ] if partial == "Hel" && full == "Hello"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_closes_silently_mid_stream() {
        struct OneChunkThenHang;

        #[async_trait::async_trait]
        impl Transport for OneChunkThenHang {
            async fn fetch_messages_page(
                &self,
                _agent: &AgentId,
                _page: PageRequest,
            ) -> Result<Vec<Value>> {
                unimplemented!("not used")
            }

            async fn open_message_stream(
                &self,
                _agent: &AgentId,
                _input: &str,
            ) -> Result<ChunkStream> {
                let (tx, rx) = mpsc::channel(8);
                tokio::spawn(async move {
                    let _ = tx
                        .send(Ok(StreamChunk::AssistantDelta { text: "Hel".into() }))
                        .await;
                    // Keep the connection open; only the cancellation
                    // token can end this stream.
                    std::future::pending::<()>().await;
                    drop(tx);
                });
                Ok(ChunkStream { rx_event: rx })
            }
        }

        let cancel = CancellationToken::new();
        let mut stream = open_resilient_stream(
            Arc::new(OneChunkThenHang),
            AgentId::from("a"),
            "hi".into(),
            cancel.clone(),
        );

        // The partial chunk arrives normally.
        assert_matches!(
            stream.next().await,
            Some(Ok(StreamChunk::AssistantDelta { text })) if text == "Hel"
        );

        // After cancellation the stream closes without an error and
        // without a Done.
        cancel.cancel();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_before_start_opens_nothing() {
        let transport = Arc::new(AlwaysFailing {
            attempts: AtomicU64::new(0),
        });
        let cancel = CancellationToken::new();
        cancel.cancel();
        let stream = open_resilient_stream(
            transport.clone(),
            AgentId::from("a"),
            "hi".into(),
            cancel,
        );
        let events = drain(stream).await;
        assert!(events.is_empty());
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 0);
    }
}
