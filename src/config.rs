use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::heap::timeline::DEFAULT_CAPACITY;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub period_ms: u64,
    pub initial_delay_ms: u64,
    pub timeline_capacity: usize,
    pub destination_dir: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            period_ms: 2000,
            initial_delay_ms: 0,
            timeline_capacity: DEFAULT_CAPACITY,
            destination_dir: PathBuf::from("./"),
        }
    }
}

impl AgentConfig {
    /// Timer period, never shorter than one millisecond.
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms.max(1))
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }
}

/// Settings for the simulated engine the CLI drives.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 0 derives the limit from host memory.
    pub heap_limit_bytes: u64,
    pub allocation_bytes: u64,
    pub step_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            heap_limit_bytes: 0,
            allocation_bytes: 64 * 1024,
            step_ms: 25,
        }
    }
}

impl EngineConfig {
    pub fn step(&self) -> Duration {
        Duration::from_millis(self.step_ms.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            format: "pretty".to_string(),
            file: None,
        }
    }
}

pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("heapwatch").join("config.toml"))
}

pub fn load_config() -> Config {
    match config_path() {
        Some(path) if path.exists() => load_config_from_path(&path),
        _ => Config::default(),
    }
}

pub fn load_config_from_path(path: &Path) -> Config {
    match std::fs::read_to_string(path) {
        Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
        Err(_) => Config::default(),
    }
}
