//! Tracing subscriber setup.
//!
//! Events go to the configured log file through a non-blocking
//! `tracing-appender` writer, or to stderr when no file is configured.
//! `RUST_LOG` overrides the default level.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Default)]
pub struct LogSettings {
    pub log_file: Option<PathBuf>,
    pub verbose: bool,
}

impl LogSettings {
    fn default_directive(&self) -> &'static str {
        if self.verbose { "debug" } else { "info" }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.default_directive()))
    }
}

/// Install the global subscriber.
///
/// The returned guard flushes buffered file output on drop and must be held
/// for the life of the process.
pub fn init(settings: &LogSettings) -> Result<Option<WorkerGuard>> {
    let filter = settings.filter();

    match &settings.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
            let file_name = path
                .file_name()
                .with_context(|| format!("log file path {} has no file name", path.display()))?;

            let appender = tracing_appender::rolling::never(&dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(writer)
                .try_init()
                .map_err(|e| anyhow::anyhow!("installing tracing subscriber: {e}"))?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init()
                .map_err(|e| anyhow::anyhow!("installing tracing subscriber: {e}"))?;
            Ok(None)
        }
    }
}
