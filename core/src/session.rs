//! Session context: the explicitly owned object tying the engine together.
//!
//! One `Session` owns the history store, the active stream assembler, and
//! the current turn token. Nothing here reads ambient global state — the
//! host constructs a session and injects it where needed. All mutation
//! happens on one logical task; ordering across turns is enforced by the
//! generation check in `ingest`, which drops chunks tagged with a stale
//! token before they can touch newer state.

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use skein_protocol::AgentId;
use skein_protocol::CanonicalMessage;
use skein_protocol::MessagePayload;
use skein_protocol::StreamChunk;
use skein_protocol::TurnUpdate;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;
use tracing::warn;
use uuid::Uuid;

use crate::assembler::StreamAssembler;
use crate::config::Config;
use crate::error::Result;
use crate::error::SkeinErr;
use crate::flags::SKEIN_WATCHDOG_MS;
use crate::history::HistoryStore;
use crate::retry::open_resilient_stream;
use crate::transport::Transport;

/// Presentation-layer contract. Implementations must be cheap; calls
/// happen inline on the session task.
pub trait SessionObserver: Send + Sync {
    fn on_history_loaded(&self, messages: &[CanonicalMessage]);
    fn on_older_history_loaded(&self, messages: &[CanonicalMessage]);
    fn on_turn_update(&self, update: &TurnUpdate);
    fn on_turn_finalized(&self, message: &CanonicalMessage);
    fn on_status(&self, text: &str);
}

/// Handle identifying one outbound streaming request. Chunks are only
/// accepted while the token is current; a superseded token's chunks are
/// dropped at the edge.
pub struct TurnToken {
    generation: u64,
    cancel: CancellationToken,
}

impl TurnToken {
    /// Clone of the cancellation handle, for user-initiated stop.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Coalesces chatty cumulative-text updates down to a render-friendly
/// cadence. Batching is a performance measure: updates are cumulative,
/// so skipping an intermediate paint loses nothing.
struct PaintGate {
    min_interval: Duration,
    last: Option<Instant>,
}

impl PaintGate {
    fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
        }
    }

    fn should_paint(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// Roughly one paint per animation frame.
const PAINT_INTERVAL: Duration = Duration::from_millis(33);

struct ActiveTurn {
    agent: AgentId,
    assembler: StreamAssembler,
}

pub struct Session {
    config: Arc<Config>,
    transport: Arc<dyn Transport>,
    history: HistoryStore,
    observer: Arc<dyn SessionObserver>,
    generation: u64,
    current_cancel: CancellationToken,
    active: Option<ActiveTurn>,
    paint_gate: PaintGate,
}

impl Session {
    pub fn new(
        config: Arc<Config>,
        transport: Arc<dyn Transport>,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        let history = HistoryStore::new(transport.clone(), config.clone());
        Self {
            config,
            transport,
            history,
            observer,
            generation: 0,
            current_cancel: CancellationToken::new(),
            active: None,
            paint_gate: PaintGate::new(PAINT_INTERVAL),
        }
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut HistoryStore {
        &mut self.history
    }

    /// Load (or refresh) an agent's conversation and notify the observer.
    pub async fn open_conversation(&mut self, agent: &AgentId, force_refresh: bool) -> Result<()> {
        let messages = self.history.smart_load(agent, force_refresh).await?;
        self.observer.on_history_loaded(&messages);
        Ok(())
    }

    /// Backward pagination; a no-op when no more history is available.
    pub async fn load_older(&mut self, agent: &AgentId) -> Result<()> {
        let page_size = self.config.page_size;
        let older = self.history.load_older(agent, page_size).await?;
        if !older.is_empty() {
            self.observer.on_older_history_loaded(&older);
        }
        Ok(())
    }

    /// Start a new turn for `agent`, superseding any turn still open.
    ///
    /// The superseded turn is force-finalized with whatever partial
    /// content it accumulated — never silently dropped — and its token is
    /// cancelled so in-flight chunks die at the edge.
    pub fn begin_turn(&mut self, agent: &AgentId, cancel: CancellationToken) -> TurnToken {
        if let Some(mut stale) = self.active.take() {
            if !stale.assembler.is_finalized() {
                debug!(agent = %stale.agent, "force-finalizing superseded turn");
                let updates = stale.assembler.finalize(true);
                self.apply_updates(&stale.agent, &updates);
            }
        }
        self.current_cancel.cancel();
        self.current_cancel = cancel;
        self.generation += 1;
        self.active = Some(ActiveTurn {
            agent: agent.clone(),
            assembler: StreamAssembler::new(agent.clone()),
        });
        TurnToken {
            generation: self.generation,
            cancel: self.current_cancel.clone(),
        }
    }

    /// Feed one normalized chunk for the turn identified by `token`.
    /// Returns true once the terminal update has been processed.
    ///
    /// Chunks tagged with a superseded token are dropped here, before
    /// they can reach the assembler or the cache.
    pub fn ingest(&mut self, token: &TurnToken, chunk: StreamChunk) -> bool {
        if token.generation != self.generation {
            trace!("dropping chunk from stale turn");
            return false;
        }
        if let StreamChunk::Status { text } = &chunk {
            self.observer.on_status(text);
            return false;
        }
        let Some(active) = self.active.as_mut() else {
            trace!("dropping chunk with no active turn");
            return false;
        };
        let agent = active.agent.clone();
        let updates = active.assembler.consume(chunk);
        let terminal = updates.iter().any(TurnUpdate::is_terminal);
        self.apply_updates(&agent, &updates);
        if terminal {
            self.active = None;
        }
        terminal
    }

    /// Finalize the turn identified by `token` with whatever content has
    /// accumulated. Idempotent; stale tokens are ignored.
    pub fn finish_turn(&mut self, token: &TurnToken, interrupted: bool) {
        if token.generation != self.generation {
            return;
        }
        let Some(mut active) = self.active.take() else {
            return;
        };
        if active.assembler.is_finalized() {
            return;
        }
        let updates = active.assembler.finalize(interrupted);
        self.apply_updates(&active.agent, &updates);
    }

    /// Submit user input and drive the stream to completion. The caller
    /// keeps `cancel` to implement user-initiated stop; cancellation is a
    /// success path and preserves partial content.
    pub async fn submit(
        &mut self,
        agent: &AgentId,
        input: &str,
        cancel: CancellationToken,
    ) -> Result<()> {
        let token = self.begin_turn(agent, cancel.clone());

        let user_message = CanonicalMessage::new(
            format!("local-{}", Uuid::new_v4()),
            agent.clone(),
            chrono::Utc::now().timestamp_millis(),
            MessagePayload::UserText {
                text: input.to_string(),
            },
        );
        self.history.append_local(agent, user_message);

        let mut stream = open_resilient_stream(
            self.transport.clone(),
            agent.clone(),
            input.to_string(),
            cancel.clone(),
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.finish_turn(&token, true);
                    return Ok(());
                }
                next = timeout(*SKEIN_WATCHDOG_MS, stream.next()) => match next {
                    Err(_elapsed) => {
                        // No terminal signal for the watchdog interval:
                        // treat the stream as implicitly complete rather
                        // than leaving the UI stuck in "generating".
                        warn!(%agent, "stream watchdog fired, finalizing turn");
                        self.finish_turn(&token, false);
                        return Ok(());
                    }
                    Ok(None) => {
                        let interrupted = cancel.is_cancelled();
                        self.finish_turn(&token, interrupted);
                        return Ok(());
                    }
                    Ok(Some(Ok(chunk))) => {
                        if self.ingest(&token, chunk) {
                            return Ok(());
                        }
                    }
                    Ok(Some(Err(e))) => {
                        self.report_failure(&e);
                        self.finish_turn(&token, true);
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Cancel the current turn's token, if any. The in-flight driver
    /// observes the cancellation and finalizes with partial content.
    pub fn interrupt(&mut self) {
        self.current_cancel.cancel();
    }

    /// One clear, distinct message per terminal failure class.
    fn report_failure(&self, err: &SkeinErr) {
        let text = match err {
            SkeinErr::Auth(_) => "authentication failed: check your credentials".to_string(),
            SkeinErr::RateLimited { retry_after } => match retry_after {
                Some(d) => format!("rate limited: retry in {}s", d.as_secs()),
                None => "rate limited: slow down and retry shortly".to_string(),
            },
            other => format!("can't reach the agent service: {other}"),
        };
        self.observer.on_status(&text);
    }

    fn apply_updates(&mut self, agent: &AgentId, updates: &[TurnUpdate]) {
        for update in updates {
            match update {
                TurnUpdate::ToolInteraction { message } => {
                    self.history.append_local(agent, message.clone());
                    self.observer.on_turn_finalized(message);
                }
                TurnUpdate::Completed { message } => {
                    if let Some(message) = message {
                        self.history.append_local(agent, message.clone());
                        self.observer.on_turn_finalized(message);
                    }
                    self.observer.on_turn_update(update);
                }
                TurnUpdate::AssistantDelta { .. } | TurnUpdate::Reasoning { .. } => {
                    // Deltas can arrive well above render cadence; they
                    // carry cumulative text, so coalescing is lossless.
                    if self.paint_gate.should_paint(Instant::now()) {
                        self.observer.on_turn_update(update);
                    }
                }
                TurnUpdate::ToolCallInProgress { .. } => {
                    self.observer.on_turn_update(update);
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU64;
    use std::sync::atomic::Ordering;

    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use skein_protocol::StreamChunk;
    use tokio::sync::mpsc;

    use super::*;
    use crate::transport::ChunkStream;
    use crate::transport::PageRequest;

    #[derive(Default)]
    struct RecordingObserver {
        finalized: Mutex<Vec<CanonicalMessage>>,
        updates: Mutex<Vec<TurnUpdate>>,
        statuses: Mutex<Vec<String>>,
    }

    impl SessionObserver for RecordingObserver {
        fn on_history_loaded(&self, _messages: &[CanonicalMessage]) {}
        fn on_older_history_loaded(&self, _messages: &[CanonicalMessage]) {}
        fn on_turn_update(&self, update: &TurnUpdate) {
            if let Ok(mut u) = self.updates.lock() {
                u.push(update.clone());
            }
        }
        fn on_turn_finalized(&self, message: &CanonicalMessage) {
            if let Ok(mut f) = self.finalized.lock() {
                f.push(message.clone());
            }
        }
        fn on_status(&self, text: &str) {
            if let Ok(mut s) = self.statuses.lock() {
                s.push(text.to_string());
            }
        }
    }

    /// Transport that streams a fixed chunk script, then optionally hangs.
    struct ScriptedStream {
        chunks: Vec<StreamChunk>,
        hang_after: bool,
    }

    #[async_trait::async_trait]
    impl Transport for ScriptedStream {
        async fn fetch_messages_page(
            &self,
            _agent: &AgentId,
            _page: PageRequest,
        ) -> crate::error::Result<Vec<Value>> {
            Ok(Vec::new())
        }

        async fn open_message_stream(
            &self,
            _agent: &AgentId,
            _input: &str,
        ) -> crate::error::Result<ChunkStream> {
            let (tx, rx) = mpsc::channel(32);
            let chunks = self.chunks.clone();
            let hang_after = self.hang_after;
            tokio::spawn(async move {
                for chunk in chunks {
                    if tx.send(Ok(chunk)).await.is_err() {
                        return;
                    }
                }
                if hang_after {
                    std::future::pending::<()>().await;
                }
                drop(tx);
            });
            Ok(ChunkStream { rx_event: rx })
        }
    }

    fn agent() -> AgentId {
        AgentId::from("agent-a")
    }

    fn session_with(
        dir: &tempfile::TempDir,
        transport: Arc<dyn Transport>,
    ) -> (Session, Arc<RecordingObserver>) {
        let config = Arc::new(Config {
            skein_home: dir.path().to_path_buf(),
            ..Config::default()
        });
        let observer = Arc::new(RecordingObserver::default());
        (
            Session::new(config, transport, observer.clone()),
            observer,
        )
    }

    #[tokio::test]
    async fn submit_streams_assembles_and_caches() {
        let dir = tempfile::tempdir().expect("tempdir");
        let transport = Arc::new(ScriptedStream {
            chunks: vec![
                StreamChunk::ReasoningDelta { text: "hmm".into() },
                StreamChunk::AssistantDelta { text: "Hel".into() },
                StreamChunk::AssistantDelta { text: "lo".into() },
                StreamChunk::Done,
            ],
            hang_after: false,
        });
        let (mut session, observer) = session_with(&dir, transport);

        session
            .submit(&agent(), "hi there", CancellationToken::new())
            .await
            .expect("submit");

        let finalized = observer.finalized.lock().expect("finalized");
        assert_eq!(finalized.len(), 1);
        assert_eq!(
            finalized[0].payload,
            MessagePayload::AssistantText {
                text: "Hello".into()
            }
        );
        assert_eq!(finalized[0].reasoning.as_deref(), Some("hmm"));

        // Cache holds the local user message plus the folded turn.
        let cache = session.history().get_cache(&agent()).expect("cache");
        assert_eq!(cache.messages.len(), 2);
        assert_matches!(
            cache.messages[0].payload,
            MessagePayload::UserText { ref text } if text == "hi there"
        );
        assert_eq!(
            cache.newest_seen_id.as_deref(),
            Some(finalized[0].id.as_str())
        );
    }

    #[tokio::test]
    async fn stale_token_chunks_are_dropped_at_the_edge() {
        let dir = tempfile::tempdir().expect("tempdir");
        let transport = Arc::new(ScriptedStream {
            chunks: vec![],
            hang_after: false,
        });
        let (mut session, observer) = session_with(&dir, transport);

        let first = session.begin_turn(&agent(), CancellationToken::new());
        session.ingest(
            &first,
            StreamChunk::AssistantDelta { text: "old ".into() },
        );
        assert!(!first.cancellation().is_cancelled());

        // A second request supersedes the first before it finished.
        let second = session.begin_turn(&agent(), CancellationToken::new());
        assert!(first.cancellation().is_cancelled());

        let updates_before = observer.updates.lock().expect("updates").len();
        let cache_before = session
            .history()
            .get_cache(&agent())
            .map(|c| c.messages.len())
            .unwrap_or(0);

        // Late chunks from the superseded turn: no updates, no mutations.
        assert!(!session.ingest(
            &first,
            StreamChunk::AssistantDelta { text: "ghost".into() },
        ));
        assert!(!session.ingest(&first, StreamChunk::Done));

        assert_eq!(observer.updates.lock().expect("updates").len(), updates_before);
        let cache_after = session
            .history()
            .get_cache(&agent())
            .map(|c| c.messages.len())
            .unwrap_or(0);
        assert_eq!(cache_after, cache_before);

        // The new turn still works.
        assert!(session.ingest(&second, StreamChunk::Done));
    }

    #[tokio::test]
    async fn supersession_force_finalizes_partial_turn() {
        let dir = tempfile::tempdir().expect("tempdir");
        let transport = Arc::new(ScriptedStream {
            chunks: vec![],
            hang_after: false,
        });
        let (mut session, observer) = session_with(&dir, transport);

        let first = session.begin_turn(&agent(), CancellationToken::new());
        session.ingest(
            &first,
            StreamChunk::AssistantDelta { text: "partial answer".into() },
        );
        let _second = session.begin_turn(&agent(), CancellationToken::new());

        let finalized = observer.finalized.lock().expect("finalized");
        assert_eq!(finalized.len(), 1);
        assert!(finalized[0].interrupted);
        assert_eq!(
            finalized[0].payload,
            MessagePayload::AssistantText {
                text: "partial answer".into()
            }
        );
    }

    #[tokio::test]
    async fn cancellation_preserves_partial_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let transport = Arc::new(ScriptedStream {
            chunks: vec![
                StreamChunk::AssistantDelta { text: "Hel".into() },
                StreamChunk::AssistantDelta { text: "lo".into() },
            ],
            hang_after: true,
        });
        let (mut session, observer) = session_with(&dir, transport);

        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            let observer = observer.clone();
            // Stop once some assistant text has been rendered.
            tokio::spawn(async move {
                loop {
                    let seen_text = observer
                        .updates
                        .lock()
                        .map(|u| {
                            u.iter()
                                .any(|up| matches!(up, TurnUpdate::AssistantDelta { .. }))
                        })
                        .unwrap_or(false);
                    if seen_text {
                        cancel.cancel();
                        return;
                    }
                    tokio::task::yield_now().await;
                }
            });
        }

        session
            .submit(&agent(), "hi", cancel)
            .await
            .expect("cancellation is a success path");

        let finalized = observer.finalized.lock().expect("finalized");
        assert_eq!(finalized.len(), 1);
        assert!(finalized[0].interrupted);
        assert_matches!(
            finalized[0].payload,
            MessagePayload::AssistantText { ref text } if text.starts_with("Hel")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_finalizes_a_silent_stream() {
        let dir = tempfile::tempdir().expect("tempdir");
        let transport = Arc::new(ScriptedStream {
            chunks: vec![StreamChunk::AssistantDelta { text: "so far".into() }],
            hang_after: true,
        });
        let (mut session, observer) = session_with(&dir, transport);

        session
            .submit(&agent(), "hi", CancellationToken::new())
            .await
            .expect("watchdog completion is not an error");

        let finalized = observer.finalized.lock().expect("finalized");
        assert_eq!(finalized.len(), 1);
        assert!(!finalized[0].interrupted);
        assert_eq!(
            finalized[0].payload,
            MessagePayload::AssistantText {
                text: "so far".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_reconnect_is_invisible_in_the_final_message() {
        struct FlakyStream {
            attempts: AtomicU64,
        }

        #[async_trait::async_trait]
        impl Transport for FlakyStream {
            async fn fetch_messages_page(
                &self,
                _agent: &AgentId,
                _page: PageRequest,
            ) -> crate::error::Result<Vec<Value>> {
                Ok(Vec::new())
            }

            async fn open_message_stream(
                &self,
                _agent: &AgentId,
                _input: &str,
            ) -> crate::error::Result<ChunkStream> {
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

        let dir = tempfile::tempdir().expect("tempdir");
        let (mut session, observer) = session_with(
            &dir,
            Arc::new(FlakyStream {
                attempts: AtomicU64::new(0),
            }),
        );

        session
            .submit(&agent(), "hi", CancellationToken::new())
            .await
            .expect("submit");

        // The reconnect was surfaced as a status, and the partial "Hel"
        // from the failed attempt never reached the final message.
        let statuses = observer.statuses.lock().expect("statuses");
        assert!(statuses.iter().any(|s| s.contains("reconnecting")));
        let finalized = observer.finalized.lock().expect("finalized");
        assert_eq!(finalized.len(), 1);
        assert!(!finalized[0].interrupted);
        assert_eq!(
            finalized[0].payload,
            MessagePayload::AssistantText {
                text: "Hello".into()
            }
        );
    }

    #[tokio::test]
    async fn terminal_failure_reports_distinct_status() {
        struct AuthFailing;
        #[async_trait::async_trait]
        impl Transport for AuthFailing {
            async fn fetch_messages_page(
                &self,
                _agent: &AgentId,
                _page: PageRequest,
            ) -> crate::error::Result<Vec<Value>> {
                Ok(Vec::new())
            }
            async fn open_message_stream(
                &self,
                _agent: &AgentId,
                _input: &str,
            ) -> crate::error::Result<ChunkStream> {
                Err(SkeinErr::Auth("expired".into()))
            }
        }

        let dir = tempfile::tempdir().expect("tempdir");
        let (mut session, observer) = session_with(&dir, Arc::new(AuthFailing));
        let err = session
            .submit(&agent(), "hi", CancellationToken::new())
            .await
            .expect_err("auth failure surfaces");
        assert_matches!(err, SkeinErr::Auth(_));

        let statuses = observer.statuses.lock().expect("statuses");
        assert!(statuses.iter().any(|s| s.contains("credentials")));
    }

    #[test]
    fn paint_gate_coalesces_within_interval() {
        let mut gate = PaintGate::new(Duration::from_millis(33));
        let t0 = Instant::now();
        assert!(gate.should_paint(t0));
        assert!(!gate.should_paint(t0 + Duration::from_millis(10)));
        assert!(!gate.should_paint(t0 + Duration::from_millis(32)));
        assert!(gate.should_paint(t0 + Duration::from_millis(40)));
    }
}
