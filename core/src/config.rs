use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::Result;

/// Name of the optional config file inside `$SKEIN_HOME`.
const CONFIG_TOML_FILE: &str = "skein.toml";

/// Engine configuration. The host application constructs one of these and
/// injects it; nothing in the engine reads ambient global state.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the persisted cache state (and `skein.toml`).
    pub skein_home: PathBuf,

    /// Base URL of the remote agent service.
    pub base_url: String,

    /// When false, `smart_load` always performs a full sync.
    pub cache_enabled: bool,

    /// Cap on cached messages per agent; oldest are evicted beyond it.
    pub max_cached_messages: usize,

    /// Page size used for full syncs and backward pagination.
    pub page_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            skein_home: default_skein_home(),
            base_url: "https://localhost:8787/v1".to_string(),
            cache_enabled: true,
            max_cached_messages: 1_000,
            page_size: 50,
        }
    }
}

/// On-disk override shape. Every field is optional; anything missing
/// falls back to [`Config::default`].
#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigToml {
    base_url: Option<String>,
    cache_enabled: Option<bool>,
    max_cached_messages: Option<usize>,
    page_size: Option<usize>,
}

impl Config {
    /// Load config from `<home>/skein.toml`, falling back to defaults for
    /// a missing file. A present-but-malformed file is an error; silently
    /// ignoring it would mask typos.
    pub fn load(skein_home: impl AsRef<Path>) -> Result<Self> {
        let skein_home = skein_home.as_ref().to_path_buf();
        let path = skein_home.join(CONFIG_TOML_FILE);
        let overrides: ConfigToml = match std::fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ConfigToml::default(),
            Err(e) => return Err(e.into()),
        };

        let defaults = Config::default();
        Ok(Self {
            skein_home,
            base_url: overrides.base_url.unwrap_or(defaults.base_url),
            cache_enabled: overrides.cache_enabled.unwrap_or(defaults.cache_enabled),
            max_cached_messages: overrides
                .max_cached_messages
                .unwrap_or(defaults.max_cached_messages),
            page_size: overrides.page_size.unwrap_or(defaults.page_size),
        })
    }
}

fn default_skein_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".skein")
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = Config::load(dir.path()).expect("load");
        assert_eq!(cfg.page_size, 50);
        assert!(cfg.cache_enabled);
    }

    #[test]
    fn toml_overrides_apply() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join(CONFIG_TOML_FILE),
            "page_size = 20\ncache_enabled = false\n",
        )
        .expect("write");
        let cfg = Config::load(dir.path()).expect("load");
        assert_eq!(cfg.page_size, 20);
        assert!(!cfg.cache_enabled);
        assert_eq!(cfg.max_cached_messages, 1_000);
    }
}
