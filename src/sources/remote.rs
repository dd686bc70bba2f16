//! Remote side of the sync: listing and fetching demos from game servers.
//!
//! [`RemoteTransport`] is the seam between the pipeline and the wire. The
//! production implementation, [`FtpTransport`], is the only code that
//! speaks FTP; tests substitute their own transport.

use std::io::Write;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream};

use super::download::{FetchTask, copy_with_deadline, is_timeout};
use super::filename::DEMO_EXTENSION;
use super::sync::SyncError;
use crate::config::ServerConfig;

/// Access to the files on one kind of remote server.
pub trait RemoteTransport: Send + Sync {
    /// List the raw entry names in the server's demo directory.
    fn list_dir(&self, server: &ServerConfig) -> Result<Vec<String>, SyncError>;

    /// Stream one remote file into `dest`, returning the number of bytes
    /// written. Must give up with [`SyncError::TransferTimeout`] once
    /// `timeout` has elapsed.
    fn fetch(
        &self,
        task: &FetchTask,
        dest: &mut dyn Write,
        timeout: Duration,
    ) -> Result<u64, SyncError>;
}

/// List the demo files on a server.
///
/// Only entries ending in `.dem` are returned, reduced to their basename.
pub fn list_remote_demos(
    transport: &dyn RemoteTransport,
    server: &ServerConfig,
) -> Result<Vec<String>, SyncError> {
    let entries = transport.list_dir(server)?;
    Ok(entries
        .iter()
        .map(|entry| basename(entry))
        .filter(|name| name.ends_with(DEMO_EXTENSION))
        .map(str::to_string)
        .collect())
}

/// Strip any directory prefix some servers include in `NLST` output.
fn basename(entry: &str) -> &str {
    let entry = entry.trim_end_matches(['\r', '\n']);
    entry.rsplit('/').next().unwrap_or(entry)
}

/// Whether the session already sits in `wanted`, ignoring trailing slashes.
fn same_dir(current: &str, wanted: &str) -> bool {
    let norm = |p: &str| {
        let trimmed = p.trim_end_matches('/');
        if trimmed.is_empty() && p.starts_with('/') {
            "/".to_string()
        } else {
            trimmed.to_string()
        }
    };
    norm(current) == norm(wanted)
}

/// Plain FTP transport.
#[derive(Debug, Clone)]
pub struct FtpTransport {
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl FtpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            io_timeout: Duration::from_secs(60),
        }
    }

    /// Set how long a single socket read may stall before the call fails.
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    fn resolve(server: &ServerConfig) -> Result<SocketAddr, SyncError> {
        (server.host.as_str(), server.port)
            .to_socket_addrs()
            .map_err(|e| connection_error(server, e.to_string()))?
            .next()
            .ok_or_else(|| connection_error(server, "host resolved to no addresses".into()))
    }

    /// Open an authenticated control connection.
    fn connect(&self, server: &ServerConfig) -> Result<FtpStream, SyncError> {
        let addr = Self::resolve(server)?;
        let mut ftp = FtpStream::connect_timeout(addr, self.connect_timeout)
            .map_err(|e| connection_error(server, e.to_string()))?;
        ftp.get_ref()
            .set_read_timeout(Some(self.io_timeout))
            .map_err(|e| connection_error(server, e.to_string()))?;
        ftp.login(server.user.as_str(), server.passwd.as_str())
            .map_err(|e| connection_error(server, format!("login rejected: {e}")))?;
        tracing::debug!(server = %server.name, %addr, "ftp session opened");
        Ok(ftp)
    }

    fn list_in_session(ftp: &mut FtpStream, server: &ServerConfig) -> Result<Vec<String>, SyncError> {
        if !server.remote_dir.is_empty() {
            let current = ftp.pwd().map_err(|e| protocol_error(server, e))?;
            if !same_dir(&current, &server.remote_dir) {
                ftp.cwd(server.remote_dir.as_str())
                    .map_err(|e| protocol_error(server, e))?;
            }
        }
        ftp.nlst(None).map_err(|e| protocol_error(server, e))
    }

    fn fetch_in_session(
        &self,
        ftp: &mut FtpStream,
        task: &FetchTask,
        dest: &mut dyn Write,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<u64, SyncError> {
        ftp.transfer_type(FileType::Binary)
            .map_err(|e| ftp_transfer_error(task, e, timeout))?;
        let mut stream = ftp
            .retr_as_stream(task.remote_path.as_str())
            .map_err(|e| ftp_transfer_error(task, e, timeout))?;
        stream
            .get_ref()
            .set_read_timeout(Some(self.io_timeout.min(timeout)))
            .map_err(|e| task.transfer_error(e.to_string()))?;

        let bytes = copy_with_deadline(&mut stream, dest, deadline)
            .map_err(|e| task.io_error(e, timeout))?;

        ftp.finalize_retr_stream(stream)
            .map_err(|e| ftp_transfer_error(task, e, timeout))?;
        Ok(bytes)
    }
}

impl RemoteTransport for FtpTransport {
    fn list_dir(&self, server: &ServerConfig) -> Result<Vec<String>, SyncError> {
        let mut ftp = self.connect(server)?;
        let result = Self::list_in_session(&mut ftp, server);
        if let Err(e) = ftp.quit() {
            tracing::debug!(server = %server.name, error = %e, "ftp quit failed");
        }
        result
    }

    fn fetch(
        &self,
        task: &FetchTask,
        dest: &mut dyn Write,
        timeout: Duration,
    ) -> Result<u64, SyncError> {
        let deadline = Instant::now() + timeout;
        let mut ftp = self
            .connect(&task.server)
            .map_err(|e| task.transfer_error(e.to_string()))?;
        let result = self.fetch_in_session(&mut ftp, task, dest, deadline, timeout);
        if let Err(e) = ftp.quit() {
            tracing::debug!(server = %task.server.name, error = %e, "ftp quit failed");
        }
        result
    }
}

fn connection_error(server: &ServerConfig, message: String) -> SyncError {
    SyncError::Connection {
        server: server.name.clone(),
        message,
    }
}

fn protocol_error(server: &ServerConfig, err: FtpError) -> SyncError {
    match err {
        FtpError::ConnectionError(e) => connection_error(server, e.to_string()),
        other => SyncError::Protocol {
            server: server.name.clone(),
            message: other.to_string(),
        },
    }
}

fn ftp_transfer_error(task: &FetchTask, err: FtpError, timeout: Duration) -> SyncError {
    match err {
        FtpError::ConnectionError(e) if is_timeout(&e) => task.io_error(e, timeout),
        other => task.transfer_error(other.to_string()),
    }
}
