//! Configuration file format.

use std::io;
use std::path::{Path, PathBuf};

use dsmcc_carousel::EngineConfig;
use serde::Deserialize;
use thiserror::Error;

/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "dsmcc-recv.toml";

#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub engine: Option<EngineConfig>,
    #[serde(default)]
    pub carousel: CarouselSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Deserialize, Default)]
pub struct CarouselSection {
    pub pid: Option<u16>,
    pub transaction_id: Option<u32>,
    pub program: Option<u16>,
    pub output: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct LoggingSection {
    pub log_dir: Option<String>,
    pub retention_days: Option<u64>,
    pub level: Option<String>,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

pub fn load_config(path: &Path) -> Result<ConfigFile, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config: ConfigFile = toml::from_str(&contents)?;
    Ok(config)
}

/// Explicit path, or the default file when it exists.
pub fn find_config(explicit: Option<PathBuf>) -> Option<PathBuf> {
    explicit.or_else(|| {
        let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
        default_path.exists().then_some(default_path)
    })
}

/// Parse a number given in decimal or with a `0x` prefix.
pub fn parse_number(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number {:?}: {}", s, e))
}

pub fn parse_pid(s: &str) -> Result<u16, String> {
    let value = parse_number(s)?;
    if value > 0x1FFF {
        return Err(format!("PID {} out of range", s));
    }
    Ok(value as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_sections() {
        let config: ConfigFile = toml::from_str(
            r#"
            [engine]
            cache_dir = "/var/cache/dsmcc"
            keep_cache = true
            module_timeout_ms = 5000

            [carousel]
            pid = 1234
            output = "out"

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();
        let engine = config.engine.unwrap();
        assert_eq!(engine.cache_dir, PathBuf::from("/var/cache/dsmcc"));
        assert!(engine.keep_cache);
        assert_eq!(engine.module_timeout_ms, 5000);
        assert_eq!(engine.dsi_timeout_ms, 30_000);
        assert_eq!(config.carousel.pid, Some(1234));
        assert_eq!(config.logging.level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        assert!(matches!(load_config(&missing), Err(ConfigError::Read { .. })));

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "[engine]\nkeep_cache = \"yes\"\n").unwrap();
        assert!(matches!(load_config(&bad), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_empty_config() {
        let config: ConfigFile = toml::from_str("").unwrap();
        assert!(config.engine.is_none());
        assert!(config.carousel.output.is_none());
    }

    #[test]
    fn test_parse_numbers() {
        assert_eq!(parse_number("0x80000000"), Ok(0x8000_0000));
        assert_eq!(parse_number("42"), Ok(42));
        assert!(parse_number("zz").is_err());
        assert_eq!(parse_pid("0x1FF"), Ok(0x1FF));
        assert!(parse_pid("0x2000").is_err());
    }
}
