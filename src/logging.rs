use std::fs::{self, File};
use std::path::Path;
use std::sync::Mutex;

use color_eyre::eyre::{Result, eyre};
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "heapwatch=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    pub fn from_str_config(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs the global subscriber. Logs go to stderr unless `output` names a
/// file, which is created (with its parent directory) and truncated.
pub fn init(format: LogFormat, output: Option<&Path>) -> Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_thread_names(true);

    let installed = match (format, output) {
        (LogFormat::Pretty, None) => builder.with_writer(std::io::stderr).try_init(),
        (LogFormat::Json, None) => builder.json().with_writer(std::io::stderr).try_init(),
        (LogFormat::Pretty, Some(path)) => builder
            .with_ansi(false)
            .with_writer(Mutex::new(create_log_file(path)?))
            .try_init(),
        (LogFormat::Json, Some(path)) => builder
            .json()
            .with_writer(Mutex::new(create_log_file(path)?))
            .try_init(),
    };
    installed.map_err(|e| eyre!("failed to set tracing subscriber: {e}"))
}

fn create_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    Ok(File::create(path)?)
}
