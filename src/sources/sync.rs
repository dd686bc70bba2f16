//! Sync engine for pulling demos from game servers.
//!
//! One pass walks the configured servers in order, lists each one's demo
//! directory, keeps the demos not yet present locally, downloads all of
//! them on a shared worker pool, and indexes the ones that arrived.
//!
//! Listing is sequential to keep the number of open connections to small
//! game-server FTP daemons low; downloads are the only parallel phase.
//! A server that can't be listed contributes nothing to the pass but
//! does not stop it. Only a failed index commit fails the pass.
//!
//! # Example
//!
//! ```rust,ignore
//! use demo_sync::config::Config;
//! use demo_sync::sources::{FtpTransport, SyncEngine};
//! use demo_sync::storage::sqlite::SqliteStorage;
//!
//! let config = Config::load(&path)?;
//! let transport = FtpTransport::new(config.general.connect_timeout);
//! let mut store = SqliteStorage::open(&config.general.database)?;
//!
//! let report = SyncEngine::new(&config, &transport).run_pass(&mut store)?;
//! println!("indexed {} new demos", report.persisted);
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;

use super::download::Downloader;
use super::filename;
use super::presence::filter_new;
use super::remote::{RemoteTransport, list_remote_demos};
use crate::config::{Config, ServerConfig};
use crate::model::types::DemoMetadata;
use crate::storage::MetadataStore;

/// Name of the lock file held in `demodir` while a pass runs.
pub const LOCK_FILE_NAME: &str = ".demosync.lock";

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Connection to {server} failed: {message}")]
    Connection { server: String, message: String },

    #[error("Unexpected response from {server}: {message}")]
    Protocol { server: String, message: String },

    #[error("Failed to create directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("Download of {file} from {server} failed: {message}")]
    Transfer {
        server: String,
        file: String,
        message: String,
    },

    #[error("Download of {file} from {server} timed out after {secs} seconds")]
    TransferTimeout {
        server: String,
        file: String,
        secs: u64,
    },

    #[error("Failed to save demo metadata: {0}")]
    Persistence(String),

    #[error(
        "Another sync pass is already running (lock held on {0}); if no pass is running, delete that file"
    )]
    AlreadyRunning(PathBuf),

    #[error("Failed to take run lock {path}: {source}")]
    Lock { path: PathBuf, source: io::Error },
}

/// Per-server counts for one pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerSyncResult {
    pub server: String,
    /// Demo files seen in the remote listing.
    pub discovered: usize,
    /// Demos not present locally that parsed as valid demo names.
    pub new: usize,
    pub downloaded: usize,
    pub failed: usize,
    /// Why the server was skipped, or the last download error.
    pub error: Option<String>,
}

impl ServerSyncResult {
    fn new(server: &str) -> Self {
        Self {
            server: server.to_string(),
            ..Default::default()
        }
    }

    /// Whether listing the server failed.
    pub fn skipped(&self) -> bool {
        self.error.is_some() && self.discovered == 0 && self.new == 0
    }
}

/// Summary of one pass. Not persisted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub servers: Vec<ServerSyncResult>,
    /// Demos committed to the index.
    pub persisted: usize,
    pub duration_ms: u64,
}

impl SyncReport {
    pub fn total_new(&self) -> usize {
        self.servers.iter().map(|s| s.new).sum()
    }

    pub fn total_downloaded(&self) -> usize {
        self.servers.iter().map(|s| s.downloaded).sum()
    }

    pub fn total_failed(&self) -> usize {
        self.servers.iter().map(|s| s.failed).sum()
    }

    pub fn server(&self, name: &str) -> Option<&ServerSyncResult> {
        self.servers.iter().find(|s| s.server == name)
    }

    fn server_mut(&mut self, name: &str) -> Option<&mut ServerSyncResult> {
        self.servers.iter_mut().find(|s| s.server == name)
    }
}

/// Exclusive lock on `demodir` for the duration of a pass.
///
/// Overlapping scheduled runs would otherwise list the same new demos and
/// download them twice. Released on drop.
#[derive(Debug)]
pub struct RunLock {
    _file: File,
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(dir: &Path) -> Result<Self, SyncError> {
        let path = dir.join(LOCK_FILE_NAME);
        let mut file = lock_file(&path)?;
        // Holder's pid, for whoever finds a stale lock file.
        file.set_len(0)
            .and_then(|()| write!(file, "{}", std::process::id()))
            .map_err(|source| SyncError::Lock {
                path: path.clone(),
                source,
            })?;
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        // flock is released with the descriptor; the marker file only
        // needs removing where it is the lock itself.
        #[cfg(not(unix))]
        {
            let _ = fs::remove_file(&self.path);
        }
    }
}

#[cfg(unix)]
fn lock_file(path: &Path) -> Result<File, SyncError> {
    use std::os::unix::io::AsRawFd;

    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .map_err(|source| SyncError::Lock {
            path: path.to_path_buf(),
            source,
        })?;
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        let source = io::Error::last_os_error();
        if source.kind() == io::ErrorKind::WouldBlock {
            return Err(SyncError::AlreadyRunning(path.to_path_buf()));
        }
        return Err(SyncError::Lock {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(file)
}

#[cfg(not(unix))]
fn lock_file(path: &Path) -> Result<File, SyncError> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|source| {
            if source.kind() == io::ErrorKind::AlreadyExists {
                SyncError::AlreadyRunning(path.to_path_buf())
            } else {
                SyncError::Lock {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })
}

fn plural(n: usize) -> &'static str {
    if n == 1 { "" } else { "s" }
}

/// Drives sync passes over a fixed configuration.
pub struct SyncEngine<'a> {
    config: &'a Config,
    transport: &'a dyn RemoteTransport,
}

impl<'a> SyncEngine<'a> {
    pub fn new(config: &'a Config, transport: &'a dyn RemoteTransport) -> Self {
        Self { config, transport }
    }

    /// Run one full pass.
    ///
    /// Per-server listing failures and per-file download failures are
    /// logged and reported in the returned [`SyncReport`]. The pass itself
    /// fails only when the run lock is taken or the index commit fails.
    pub fn run_pass(&self, store: &mut dyn MetadataStore) -> Result<SyncReport, SyncError> {
        let started = Instant::now();
        let demodir = &self.config.general.demodir;
        fs::create_dir_all(demodir).map_err(|source| SyncError::CreateDir {
            path: demodir.clone(),
            source,
        })?;
        let _lock = RunLock::acquire(demodir)?;

        let mut report = SyncReport::default();
        let mut pending = Vec::new();
        for server in &self.config.servers {
            let (result, demos) = self.collect_server(server);
            report.servers.push(result);
            pending.extend(demos);
        }

        if pending.is_empty() {
            tracing::info!("No new demos on the servers");
            report.duration_ms = started.elapsed().as_millis() as u64;
            return Ok(report);
        }

        let outcome = Downloader::new(self.transport)
            .with_workers(self.config.general.workers)
            .with_transfer_timeout(self.config.general.transfer_timeout)
            .download_all(&self.config.servers, pending);

        for demo in &outcome.succeeded {
            if let Some(entry) = report.server_mut(&demo.server) {
                entry.downloaded += 1;
            }
        }
        for failure in &outcome.failed {
            if let Some(entry) = report.server_mut(&failure.demo.server) {
                entry.failed += 1;
                entry.error = Some(failure.error.to_string());
            }
        }

        tracing::info!(
            downloaded = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            "download phase finished"
        );

        if outcome.succeeded.is_empty() {
            tracing::warn!("No demos downloaded; nothing to save");
            report.duration_ms = started.elapsed().as_millis() as u64;
            return Ok(report);
        }

        report.persisted = persist(store, &outcome.succeeded)?;
        report.duration_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }

    /// Listing, presence filtering and parsing for one server.
    fn collect_server(&self, server: &ServerConfig) -> (ServerSyncResult, Vec<DemoMetadata>) {
        let demodir = &self.config.general.demodir;
        let mut result = ServerSyncResult::new(&server.name);
        tracing::info!(server = %server.name, "Updating demos from {} server...", server.name);

        let local_dir = demodir.join(&server.name);
        if let Err(source) = fs::create_dir_all(&local_dir) {
            let err = SyncError::CreateDir {
                path: local_dir,
                source,
            };
            tracing::error!(server = %server.name, error = %err, "skipping server");
            result.error = Some(err.to_string());
            return (result, Vec::new());
        }

        let remote = match list_remote_demos(self.transport, server) {
            Ok(names) => names,
            Err(err) => {
                tracing::error!(server = %server.name, error = %err, "failed to list demos; skipping server");
                result.error = Some(err.to_string());
                return (result, Vec::new());
            }
        };
        result.discovered = remote.len();
        tracing::info!(
            server = %server.name,
            count = remote.len(),
            "Retrieved {} demo{} on the {} server",
            remote.len(),
            plural(remote.len()),
            server.name
        );

        let new = filter_new(&local_dir, &remote);
        let demos = filename::parse_all(&server.name, demodir, &new);
        if demos.len() < new.len() {
            tracing::debug!(
                server = %server.name,
                skipped = new.len() - demos.len(),
                "ignored files with unrecognized names"
            );
        }
        result.new = demos.len();
        tracing::info!(
            server = %server.name,
            count = demos.len(),
            "Got {} new demo{} from {} server",
            demos.len(),
            plural(demos.len()),
            server.name
        );

        (result, demos)
    }
}

/// Commit downloaded demos in one transaction.
fn persist(store: &mut dyn MetadataStore, demos: &[DemoMetadata]) -> Result<usize, SyncError> {
    tracing::info!(count = demos.len(), "Saving new demo entries to DB");
    match store.insert_batch(demos) {
        Ok(ids) => {
            tracing::info!(count = ids.len(), "Saved demos");
            Ok(ids.len())
        }
        Err(e) => {
            let message = format!("{e:#}");
            tracing::error!(
                error = %message,
                count = demos.len(),
                "failed to save demo metadata; downloaded files stay on disk"
            );
            Err(SyncError::Persistence(message))
        }
    }
}
