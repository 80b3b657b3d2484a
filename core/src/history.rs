//! Per-agent history cache with sync cursors.
//!
//! The remote store is authoritative; this cache minimizes redundant
//! traffic by keeping, per agent, an ordered window of messages plus the
//! cursors needed for incremental sync (newest seen id) and backward
//! pagination (oldest loaded id). All operations preserve the ordering
//! invariant: messages ascending by `created_at`, arrival order kept
//! within a timestamp tie, no two sharing an id.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use skein_protocol::AgentId;
use skein_protocol::CanonicalMessage;
use tracing::debug;
use tracing::warn;

use crate::cache_state;
use crate::cache_state::CacheState;
use crate::config::Config;
use crate::error::Result;
use crate::error::SkeinErr;
use crate::normalize::normalize_message;
use crate::transport::PageRequest;
use crate::transport::Transport;

/// Cached conversation window for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCache {
    pub agent_id: AgentId,
    pub messages: Vec<CanonicalMessage>,
    /// Newest id known to be fully persisted; drives incremental sync.
    pub newest_seen_id: Option<String>,
    /// Oldest id currently loaded; drives backward pagination.
    pub oldest_loaded_id: Option<String>,
    /// Heuristic continuation signal: the last backward page was full.
    pub has_more_older: bool,
    /// Unix ms of the last successful sync, for diagnostics.
    pub last_synced_at: Option<i64>,
}

impl AgentCache {
    pub fn new(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            messages: Vec::new(),
            newest_seen_id: None,
            oldest_loaded_id: None,
            has_more_older: false,
            last_synced_at: None,
        }
    }

    fn refresh_cursors(&mut self) {
        self.newest_seen_id = self.messages.last().map(|m| m.id.clone());
        self.oldest_loaded_id = self.messages.first().map(|m| m.id.clone());
    }
}

/// Owner of all per-agent caches plus their durable persistence.
pub struct HistoryStore {
    transport: Arc<dyn Transport>,
    config: Arc<Config>,
    caches: HashMap<AgentId, AgentCache>,
}

impl HistoryStore {
    /// Load persisted caches from disk; a missing or corrupt state file
    /// degrades to an empty store.
    pub fn new(transport: Arc<dyn Transport>, config: Arc<Config>) -> Self {
        let state = cache_state::load(&config.skein_home);
        let caches = state
            .agents
            .into_values()
            .map(|c| (c.agent_id.clone(), c))
            .collect();
        Self {
            transport,
            config,
            caches,
        }
    }

    /// Read-only view of one agent's cache. No side effects.
    pub fn get_cache(&self, agent: &AgentId) -> Option<&AgentCache> {
        self.caches.get(agent)
    }

    /// Fetch the newest `page_size` messages and replace the cache
    /// wholesale. Used on cache miss or explicit refresh. The in-memory
    /// cache is only touched once the fetch has succeeded.
    pub async fn full_sync(
        &mut self,
        agent: &AgentId,
        page_size: usize,
    ) -> Result<Vec<CanonicalMessage>> {
        let raw = self
            .transport
            .fetch_messages_page(agent, PageRequest::newest(page_size))
            .await?;
        let fetched = raw.len();
        let messages = normalize_batch(agent, &raw);

        let cache = self
            .caches
            .entry(agent.clone())
            .or_insert_with(|| AgentCache::new(agent.clone()));
        cache.messages = messages.clone();
        cache.refresh_cursors();
        cache.has_more_older = fetched == page_size;
        cache.last_synced_at = Some(now_ms());
        debug!(%agent, count = messages.len(), "full sync replaced cache");

        self.trim(agent, self.config.max_cached_messages);
        self.persist();
        Ok(messages)
    }

    /// Fetch only messages strictly after the newest seen id and append
    /// them. Returns an empty list, with no error, when nothing is new.
    pub async fn fetch_incremental(&mut self, agent: &AgentId) -> Result<Vec<CanonicalMessage>> {
        let Some(after) = self
            .caches
            .get(agent)
            .and_then(|c| c.newest_seen_id.clone())
        else {
            return Err(SkeinErr::NoSyncCursor(agent.to_string()));
        };

        let raw = self
            .transport
            .fetch_messages_page(agent, PageRequest::after(after, self.config.page_size))
            .await?;
        let mut fresh = normalize_batch(agent, &raw);

        let cache = self
            .caches
            .entry(agent.clone())
            .or_insert_with(|| AgentCache::new(agent.clone()));
        // A crash-resync can overlap the cached window; drop known ids.
        let known: HashSet<&str> = cache.messages.iter().map(|m| m.id.as_str()).collect();
        fresh.retain(|m| !known.contains(m.id.as_str()));
        let appended = fresh.clone();
        cache.messages.append(&mut fresh);
        cache.refresh_cursors();
        cache.last_synced_at = Some(now_ms());
        if !appended.is_empty() {
            debug!(%agent, count = appended.len(), "incremental sync appended");
            self.trim(agent, self.config.max_cached_messages);
            self.persist();
        }
        Ok(appended)
    }

    /// Fetch the page before the oldest loaded id and prepend it. Returns
    /// empty, without a network call, when no more history is available.
    pub async fn load_older(
        &mut self,
        agent: &AgentId,
        page_size: usize,
    ) -> Result<Vec<CanonicalMessage>> {
        let Some(cache) = self.caches.get(agent) else {
            return Ok(Vec::new());
        };
        if !cache.has_more_older {
            return Ok(Vec::new());
        }
        let Some(before) = cache.oldest_loaded_id.clone() else {
            return Ok(Vec::new());
        };

        let raw = self
            .transport
            .fetch_messages_page(agent, PageRequest::before(before, page_size))
            .await?;
        let fetched = raw.len();
        let mut older = normalize_batch(agent, &raw);

        let cache = self
            .caches
            .entry(agent.clone())
            .or_insert_with(|| AgentCache::new(agent.clone()));
        let known: HashSet<&str> = cache.messages.iter().map(|m| m.id.as_str()).collect();
        older.retain(|m| !known.contains(m.id.as_str()));
        let prepended = older.clone();
        older.append(&mut cache.messages);
        cache.messages = older;
        cache.refresh_cursors();
        cache.has_more_older = fetched == page_size;
        debug!(%agent, count = prepended.len(), "loaded older page");

        self.trim(agent, self.config.max_cached_messages);
        self.persist();
        Ok(prepended)
    }

    /// Primary entry point: cache disabled, empty, or `force_refresh` →
    /// full sync; otherwise incremental. Returns the full merged list.
    pub async fn smart_load(
        &mut self,
        agent: &AgentId,
        force_refresh: bool,
    ) -> Result<Vec<CanonicalMessage>> {
        let cache_usable = self.config.cache_enabled
            && !force_refresh
            && self
                .caches
                .get(agent)
                .is_some_and(|c| !c.messages.is_empty());

        if cache_usable {
            self.fetch_incremental(agent).await?;
        } else {
            self.full_sync(agent, self.config.page_size).await?;
        }
        Ok(self
            .caches
            .get(agent)
            .map(|c| c.messages.clone())
            .unwrap_or_default())
    }

    /// Add a locally produced message (just-sent user input, or a
    /// finalized streamed turn) without a network round trip.
    pub fn append_local(&mut self, agent: &AgentId, message: CanonicalMessage) {
        let cache = self
            .caches
            .entry(agent.clone())
            .or_insert_with(|| AgentCache::new(agent.clone()));
        if cache.messages.iter().any(|m| m.id == message.id) {
            debug!(%agent, id = %message.id, "skipping duplicate local append");
            return;
        }
        // Local messages are expected to be newest; fall back to a sorted
        // insert if a clock skew says otherwise. An equal timestamp is
        // in-order: appends landing in the same millisecond must keep
        // their arrival order, which is the conversational order, not
        // whatever the random local ids happen to sort to.
        let out_of_order = cache
            .messages
            .last()
            .is_some_and(|last| last.created_at > message.created_at);
        if out_of_order {
            let at = cache
                .messages
                .partition_point(|m| m.created_at <= message.created_at);
            cache.messages.insert(at, message);
        } else {
            cache.messages.push(message);
        }
        cache.refresh_cursors();
        self.trim(agent, self.config.max_cached_messages);
        self.persist();
    }

    /// Evict oldest messages down to `max_messages`. Eviction always
    /// implies there might be more to load, so `has_more_older` is set.
    pub fn trim(&mut self, agent: &AgentId, max_messages: usize) {
        let Some(cache) = self.caches.get_mut(agent) else {
            return;
        };
        if cache.messages.len() <= max_messages {
            return;
        }
        let excess = cache.messages.len() - max_messages;
        cache.messages.drain(..excess);
        cache.has_more_older = true;
        cache.refresh_cursors();
        debug!(%agent, evicted = excess, "trimmed cache");
    }

    /// Explicit invalidation of one agent's cache.
    pub fn clear(&mut self, agent: &AgentId) {
        self.caches.remove(agent);
        self.persist();
    }

    /// Explicit invalidation of everything.
    pub fn clear_all(&mut self) {
        self.caches.clear();
        self.persist();
    }

    /// Best-effort durable write. Failure is logged, never propagated:
    /// the remote store is authoritative and the next load re-syncs.
    fn persist(&self) {
        let state = CacheState {
            agents: self
                .caches
                .iter()
                .map(|(id, c)| (id.to_string(), c.clone()))
                .collect(),
        };
        if let Err(e) = cache_state::store(&self.config.skein_home, &state) {
            warn!(error = %e, "failed to persist history cache");
        }
    }
}

/// Normalize a raw page, dropping internal records, then sort ascending
/// and de-duplicate by id.
fn normalize_batch(agent: &AgentId, raw: &[Value]) -> Vec<CanonicalMessage> {
    let mut messages: Vec<CanonicalMessage> = raw
        .iter()
        .filter_map(|r| normalize_message(agent, r))
        .collect();
    messages.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    let mut seen = HashSet::new();
    messages.retain(|m| seen.insert(m.id.clone()));
    messages
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
