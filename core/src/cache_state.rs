//! Persistence layer for the per-agent history cache.
//!
//! The cache state is stored at `<skein_home>/history-cache.json` as one
//! JSON object mapping agent ids to their cached conversations. Writes
//! replace the whole file via a tempfile rename so a crash mid-write can
//! never leave a truncated blob; a crash between a successful fetch and
//! a successful persist simply re-syncs on the next load.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

use crate::history::AgentCache;

/// Filename that stores the cache state inside `$SKEIN_HOME`.
pub const CACHE_STATE_FILENAME: &str = "history-cache.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CacheState {
    pub agents: HashMap<String, AgentCache>,
}

pub(crate) fn cache_state_filepath(skein_home: &Path) -> PathBuf {
    skein_home.join(CACHE_STATE_FILENAME)
}

/// Read the persisted state. Never fails: a missing file is a fresh
/// start, and a corrupt one is logged and discarded — the remote store
/// is authoritative and the next sync rebuilds the cache.
pub(crate) fn load(skein_home: &Path) -> CacheState {
    let path = cache_state_filepath(skein_home);
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return CacheState::default(),
        Err(e) => {
            warn!(error = %e, ?path, "failed to read cache state");
            return CacheState::default();
        }
    };
    match serde_json::from_str(&contents) {
        Ok(state) => state,
        Err(e) => {
            warn!(error = %e, ?path, "discarding corrupt cache state");
            CacheState::default()
        }
    }
}

/// Durable whole-file write: serialize to a tempfile in the same
/// directory, then atomically rename over the previous state.
pub(crate) fn store(skein_home: &Path, state: &CacheState) -> std::io::Result<()> {
    std::fs::create_dir_all(skein_home)?;
    let path = cache_state_filepath(skein_home);
    let json = serde_json::to_string(state)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(skein_home)?;
    tmp.write_all(json.as_bytes())?;
    tmp.persist(&path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use skein_protocol::AgentId;

    use super::*;

    #[test]
    fn round_trip_survives_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut state = CacheState::default();
        state
            .agents
            .insert("a".to_string(), AgentCache::new(AgentId::from("a")));
        store(dir.path(), &state).expect("store");

        let back = load(dir.path());
        assert!(back.agents.contains_key("a"));
    }

    #[test]
    fn corrupt_state_degrades_to_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(cache_state_filepath(dir.path()), "{not json").expect("write");
        let state = load(dir.path());
        assert!(state.agents.is_empty());
    }

    #[test]
    fn missing_state_is_a_fresh_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(load(dir.path()).agents.is_empty());
    }
}
