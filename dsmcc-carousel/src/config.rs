//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Receiver engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding module data, object blobs and the state file.
    pub cache_dir: PathBuf,
    /// Persist state across restarts.
    pub keep_cache: bool,
    /// Wait for the first DSI (milliseconds).
    pub dsi_timeout_ms: u64,
    /// Wait for a DII when the ConnBinder carries no timeout (milliseconds).
    pub dii_timeout_ms: u64,
    /// Module download timeout when ModuleInfo carries none (milliseconds).
    pub module_timeout_ms: u64,
    /// Gap allowed between two blocks of a module (milliseconds).
    pub block_timeout_ms: u64,
    /// Module timeouts tolerated before the carousel times out.
    pub max_module_retries: u32,
    /// Largest section accepted.
    pub max_section_size: usize,
    /// State file name inside `cache_dir`.
    pub state_file: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("dsmcc-cache"),
            keep_cache: false,
            dsi_timeout_ms: 30_000,
            dii_timeout_ms: 30_000,
            module_timeout_ms: 60_000,
            block_timeout_ms: 10_000,
            max_module_retries: 3,
            max_section_size: dsmcc_protocol::MAX_SECTION_SIZE,
            state_file: "state.bin".to_string(),
        }
    }
}

impl EngineConfig {
    /// Configuration for a cache directory with defaults elsewhere.
    pub fn new(cache_dir: impl Into<PathBuf>, keep_cache: bool) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            keep_cache,
            ..Default::default()
        }
    }

    pub fn state_path(&self) -> PathBuf {
        self.cache_dir.join(&self.state_file)
    }

    pub(crate) fn dsi_timeout(&self) -> Duration {
        Duration::from_millis(self.dsi_timeout_ms)
    }

    /// Broadcast timeout in microseconds, or the configured default.
    pub(crate) fn dii_timeout(&self, broadcast_us: u32) -> Duration {
        or_default(broadcast_us, self.dii_timeout_ms)
    }

    pub(crate) fn module_timeout(&self, broadcast_us: u32) -> Duration {
        or_default(broadcast_us, self.module_timeout_ms)
    }

    pub(crate) fn block_timeout(&self, broadcast_us: u32) -> Duration {
        or_default(broadcast_us, self.block_timeout_ms)
    }
}

fn or_default(broadcast_us: u32, default_ms: u64) -> Duration {
    if broadcast_us == 0 || broadcast_us == u32::MAX {
        Duration::from_millis(default_ms)
    } else {
        Duration::from_micros(broadcast_us as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.dsi_timeout_ms, 30_000);
        assert_eq!(config.max_module_retries, 3);
        assert_eq!(config.max_section_size, 4096);
        assert!(!config.keep_cache);
    }

    #[test]
    fn test_broadcast_timeouts_take_precedence() {
        let config = EngineConfig::default();
        assert_eq!(config.module_timeout(2_500_000), Duration::from_millis(2_500));
        assert_eq!(config.module_timeout(0), Duration::from_secs(60));
        assert_eq!(config.block_timeout(u32::MAX), Duration::from_secs(10));
    }
}
