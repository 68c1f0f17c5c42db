use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    pub name: String,
    pub transfer: TransferConfig,
    pub cursor: CursorConfig,
    pub logging: LoggingConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes the pipeline may hold before `Sink::write` blocks.
    pub buffer_capacity: usize,
    pub chunk_size: usize,
    /// How long the worker waits for either side to become ready.
    pub wait_budget_ms: u64,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CursorConfig {
    pub dir: PathBuf,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            name: "icsync".into(),
            transfer: TransferConfig::default(),
            cursor: CursorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            buffer_capacity: 128 * 1024,
            chunk_size: 4096,
            wait_budget_ms: 10_000,
        }
    }
}

impl Default for CursorConfig {
    fn default() -> Self {
        CursorConfig {
            dir: PathBuf::from("cursors"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: crate::logs::default_log_level().into(),
        }
    }
}

/// Reads and parses a TOML config file.
pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    parse_config(&raw).with_context(|| format!("parsing config {}", path.display()))
}

pub fn parse_config(raw: &str) -> anyhow::Result<Config> {
    Ok(toml::from_str(raw)?)
}
