//! Optional `config.json` overrides.
//!
//! The core never requires this file. Absence, or absence of a given key,
//! falls back to the built-in defaults below.
use std::fs;

use serde::Deserialize;

use crate::paths::PathStore;

pub const DEFAULT_POLL_INTERVAL_SEC: u64 = 5;
pub const DEFAULT_HISTORY_KEEP: usize = 100;

#[derive(Debug, Clone, Copy, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    poll_interval_sec: Option<u64>,
    #[serde(default)]
    history_keep: Option<usize>,
}

impl Config {
    pub fn load(paths: &PathStore) -> Self {
        fs::read(paths.config_file())
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default()
    }

    pub fn poll_interval_sec(&self) -> u64 {
        self.poll_interval_sec.unwrap_or(DEFAULT_POLL_INTERVAL_SEC)
    }

    pub fn history_keep(&self) -> usize {
        self.history_keep.unwrap_or(DEFAULT_HISTORY_KEEP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let paths = PathStore::at(dir.path().to_path_buf()).unwrap();
        let cfg = Config::load(&paths);
        assert_eq!(cfg.poll_interval_sec(), DEFAULT_POLL_INTERVAL_SEC);
        assert_eq!(cfg.history_keep(), DEFAULT_HISTORY_KEEP);
    }

    #[test]
    fn overrides_apply_when_present() {
        let dir = TempDir::new().unwrap();
        let paths = PathStore::at(dir.path().to_path_buf()).unwrap();
        fs::write(paths.config_file(), r#"{"poll_interval_sec": 2, "history_keep": 5}"#).unwrap();
        let cfg = Config::load(&paths);
        assert_eq!(cfg.poll_interval_sec(), 2);
        assert_eq!(cfg.history_keep(), 5);
    }
}
