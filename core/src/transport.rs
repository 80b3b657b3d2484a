//! Remote agent transport: paged history fetches and the SSE chunk stream.
//!
//! The engine consumes the [`Transport`] trait; [`HttpTransport`] is the
//! production implementation over `reqwest` + `eventsource-stream`. SSE
//! frames are decoded leniently: an unparseable frame is logged and
//! skipped, never fatal.

use std::pin::Pin;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::Stream;
use futures::StreamExt;
use futures::TryStreamExt;
use reqwest::StatusCode;
use serde_json::Value;
use skein_protocol::AgentId;
use skein_protocol::StreamChunk;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;
use tracing::trace;

use crate::error::Result;
use crate::error::SkeinErr;
use crate::flags::SKEIN_STREAM_IDLE_TIMEOUT_MS;
use crate::normalize::normalize_chunk;

/// Cursor-bounded page request. `before` and `after` are mutually
/// exclusive; the service rejects requests carrying both.
#[derive(Debug, Clone, Default)]
pub struct PageRequest {
    pub before: Option<String>,
    pub after: Option<String>,
    pub limit: usize,
}

impl PageRequest {
    pub fn newest(limit: usize) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    pub fn before(cursor: impl Into<String>, limit: usize) -> Self {
        Self {
            before: Some(cursor.into()),
            after: None,
            limit,
        }
    }

    pub fn after(cursor: impl Into<String>, limit: usize) -> Self {
        Self {
            before: None,
            after: Some(cursor.into()),
            limit,
        }
    }
}

/// Receiver half of one in-flight streamed response.
pub struct ChunkStream {
    pub(crate) rx_event: mpsc::Receiver<Result<StreamChunk>>,
}

impl ChunkStream {
    pub async fn next(&mut self) -> Option<Result<StreamChunk>> {
        self.rx_event.recv().await
    }
}

impl Stream for ChunkStream {
    type Item = Result<StreamChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx_event.poll_recv(cx)
    }
}

/// Contract the engine consumes; scripted implementations drive the
/// integration tests.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch one page of raw history records.
    async fn fetch_messages_page(&self, agent: &AgentId, page: PageRequest) -> Result<Vec<Value>>;

    /// Open a streamed response to `input`. The returned stream ends
    /// naturally on completion; callers abandon it on cancellation.
    async fn open_message_stream(&self, agent: &AgentId, input: &str) -> Result<ChunkStream>;
}

/// Production transport over HTTP + server-sent events.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn messages_url(&self, agent: &AgentId) -> String {
        format!("{}/agents/{}/messages", self.base_url, agent)
    }

    fn apply_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }
}

/// Map a non-success response onto the error taxonomy: 401/403 terminal
/// auth, 429 rate-limited with optional Retry-After, 5xx retryable,
/// anything else fatal with the body preserved for diagnostics.
async fn classify_error_response(res: reqwest::Response) -> SkeinErr {
    let status = res.status();
    let retry_after = res
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = res.text().await.unwrap_or_default();

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SkeinErr::Auth(body),
        StatusCode::TOO_MANY_REQUESTS => SkeinErr::RateLimited { retry_after },
        s if s.is_server_error() => SkeinErr::ServerError {
            status: s,
            retry_after,
        },
        s => SkeinErr::UnexpectedStatus(s, body),
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch_messages_page(&self, agent: &AgentId, page: PageRequest) -> Result<Vec<Value>> {
        let mut query: Vec<(&str, String)> = vec![("limit", page.limit.to_string())];
        if let Some(before) = &page.before {
            query.push(("before", before.clone()));
        }
        if let Some(after) = &page.after {
            query.push(("after", after.clone()));
        }

        let url = self.messages_url(agent);
        debug!(url, "GET messages page");
        let res = self
            .apply_auth(self.client.get(&url))
            .query(&query)
            .send()
            .await?;

        if !res.status().is_success() {
            return Err(classify_error_response(res).await);
        }

        let body: Value = res.json().await?;
        // Either a bare array or a `{ "messages": [...] }` envelope.
        let records = match body {
            Value::Array(items) => items,
            Value::Object(mut obj) => match obj.remove("messages") {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };
        Ok(records)
    }

    async fn open_message_stream(&self, agent: &AgentId, input: &str) -> Result<ChunkStream> {
        let url = format!("{}/stream", self.messages_url(agent));
        debug!(url, "POST stream");
        let res = self
            .apply_auth(self.client.post(&url))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&serde_json::json!({ "input": input }))
            .send()
            .await?;

        if !res.status().is_success() {
            return Err(classify_error_response(res).await);
        }

        let (tx_event, rx_event) = mpsc::channel::<Result<StreamChunk>>(64);
        let stream = res.bytes_stream().map_err(SkeinErr::Reqwest);
        tokio::spawn(process_sse(stream, tx_event, *SKEIN_STREAM_IDLE_TIMEOUT_MS));
        Ok(ChunkStream { rx_event })
    }
}

/// Decode SSE frames into normalized chunks until the stream ends.
///
/// Both the explicit `[DONE]` sentinel and a natural close yield a final
/// `Done` chunk, so downstream code has a single terminal signal.
async fn process_sse<S>(
    stream: S,
    tx_event: mpsc::Sender<Result<StreamChunk>>,
    idle_timeout: Duration,
) where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    let mut stream = stream.eventsource();

    loop {
        let sse = match timeout(idle_timeout, stream.next()).await {
            Ok(Some(Ok(sse))) => sse,
            Ok(Some(Err(e))) => {
                debug!("SSE error: {e:#}");
                let _ = tx_event.send(Err(SkeinErr::Stream(e.to_string()))).await;
                return;
            }
            Ok(None) => {
                let _ = tx_event.send(Ok(StreamChunk::Done)).await;
                return;
            }
            Err(_) => {
                let _ = tx_event
                    .send(Err(SkeinErr::Stream("idle timeout waiting for SSE".into())))
                    .await;
                return;
            }
        };

        if sse.data.trim() == "[DONE]" {
            let _ = tx_event.send(Ok(StreamChunk::Done)).await;
            return;
        }

        let raw: Value = match serde_json::from_str(&sse.data) {
            Ok(v) => v,
            Err(e) => {
                let mut excerpt = sse.data.clone();
                const MAX: usize = 200;
                if excerpt.len() > MAX {
                    excerpt.truncate(MAX);
                }
                debug!("failed to parse SSE frame: {e}, data: {excerpt}");
                continue;
            }
        };

        let Some(chunk) = normalize_chunk(&raw) else {
            trace!("skipping non-renderable SSE frame");
            continue;
        };

        let done = matches!(chunk, StreamChunk::Done);
        if tx_event.send(Ok(chunk)).await.is_err() {
            // Receiver hung up (cancellation); stop decoding.
            return;
        }
        if done {
            return;
        }
    }
}
