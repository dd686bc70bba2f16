use demo_sync::config::{Config, ServerConfig};
use demo_sync::model::types::DemoMetadata;
use demo_sync::sources::{FetchTask, RemoteTransport, SyncError};
use demo_sync::storage::MetadataStore;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Captures tracing output for tests.
#[allow(dead_code)]
pub struct TestTracing {
    buffer: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
}

#[allow(dead_code)]
impl TestTracing {
    pub fn new() -> Self {
        Self {
            buffer: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.buffer.clone();
        let make_writer = move || TestWriter(writer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_writer(make_writer)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn output(&self) -> String {
        let buf = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Assert that the captured log output contains the provided substring.
    pub fn assert_contains(&self, needle: &str) {
        let out = self.output();
        assert!(
            out.contains(needle),
            "expected logs to contain `{needle}`, got:\n{out}"
        );
    }
}

struct TestWriter(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

impl std::io::Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.0.lock().unwrap();
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Restores the previous working directory on drop.
#[allow(dead_code)]
pub struct CwdGuard {
    prev: std::path::PathBuf,
}

#[allow(dead_code)]
impl CwdGuard {
    pub fn change_to(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let prev = std::env::current_dir()?;
        std::env::set_current_dir(path.as_ref())?;
        Ok(Self { prev })
    }
}

impl Drop for CwdGuard {
    fn drop(&mut self) {
        let _ = std::env::set_current_dir(&self.prev);
    }
}

/// Demo filename for `map` captured on 2024-01-`day` at 20:30.
#[allow(dead_code)]
pub fn demo_name(map: &str, day: u32) -> String {
    format!("pug_{map}_2024-01-{day:02}_20-30.dem")
}

/// Build a config with one `[[servers]]` block per name.
#[allow(dead_code)]
pub fn config_for(root: &Path, servers: &[&str], workers: usize) -> Config {
    let mut toml = format!(
        "[general]\ndemodir = \"demos\"\ndatabase = \"demos.db\"\nworkers = {workers}\ntransfer_timeout_secs = 2\n"
    );
    for name in servers {
        toml.push_str(&format!(
            "\n[[servers]]\nname = \"{name}\"\nhost = \"127.0.0.1\"\nuser = \"demos\"\npasswd = \"secret\"\nremote_dir = \"/cstrike\"\n"
        ));
    }
    Config::from_toml_str(&toml, root).unwrap()
}

/// In-memory transport with scripted listings and per-file behavior.
///
/// Tracks how many fetches run at once so tests can check pool width.
#[allow(dead_code)]
#[derive(Default)]
pub struct FakeTransport {
    listings: HashMap<String, Result<Vec<String>, String>>,
    failing: Mutex<HashSet<String>>,
    stalling: Mutex<HashSet<String>>,
    delay: Duration,
    gate: usize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fetched: Mutex<Vec<String>>,
    listed: Mutex<Vec<String>>,
}

#[allow(dead_code)]
impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listing<I, S>(mut self, server: &str, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.listings.insert(
            server.to_string(),
            Ok(names.into_iter().map(Into::into).collect()),
        );
        self
    }

    pub fn with_unreachable(mut self, server: &str) -> Self {
        self.listings
            .insert(server.to_string(), Err("connection refused".into()));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Each fetch waits (up to two seconds) until `width` fetches have been
    /// in flight at once.
    pub fn with_gate(mut self, width: usize) -> Self {
        self.gate = width;
        self
    }

    /// Fetches of `filename` write a few bytes and then fail.
    pub fn fail(&self, filename: &str) {
        self.failing.lock().unwrap().insert(filename.to_string());
    }

    /// Fetches of `filename` stall until the transfer timeout.
    pub fn stall(&self, filename: &str) {
        self.stalling.lock().unwrap().insert(filename.to_string());
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
        self.stalling.lock().unwrap().clear();
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }

    pub fn listed(&self) -> Vec<String> {
        self.listed.lock().unwrap().clone()
    }

    fn fetch_inner(
        &self,
        task: &FetchTask,
        dest: &mut dyn Write,
        timeout: Duration,
    ) -> Result<u64, SyncError> {
        std::thread::sleep(self.delay);
        let name = &task.demo.filename;

        if self.stalling.lock().unwrap().contains(name) {
            std::thread::sleep(timeout.min(Duration::from_millis(50)));
            return Err(SyncError::TransferTimeout {
                server: task.server.name.clone(),
                file: name.clone(),
                secs: timeout.as_secs(),
            });
        }
        if self.failing.lock().unwrap().contains(name) {
            dest.write_all(b"partial")
                .map_err(|e| task.transfer_error(e.to_string()))?;
            return Err(task.transfer_error("550 Failed to open file".into()));
        }

        let body = format!("DEMO {} {}", task.server.name, task.remote_path);
        dest.write_all(body.as_bytes())
            .map_err(|e| task.transfer_error(e.to_string()))?;
        self.fetched.lock().unwrap().push(name.clone());
        Ok(body.len() as u64)
    }
}

impl RemoteTransport for FakeTransport {
    fn list_dir(&self, server: &ServerConfig) -> Result<Vec<String>, SyncError> {
        self.listed.lock().unwrap().push(server.name.clone());
        match self.listings.get(&server.name) {
            Some(Ok(names)) => Ok(names.clone()),
            Some(Err(message)) => Err(SyncError::Connection {
                server: server.name.clone(),
                message: message.clone(),
            }),
            None => Ok(Vec::new()),
        }
    }

    fn fetch(
        &self,
        task: &FetchTask,
        dest: &mut dyn Write,
        timeout: Duration,
    ) -> Result<u64, SyncError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while self.max_in_flight.load(Ordering::SeqCst) < self.gate
            && std::time::Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(1));
        }
        let result = self.fetch_inner(task, dest, timeout);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Store wrapper that counts calls and can be told to fail commits.
#[allow(dead_code)]
pub struct RecordingStore<S> {
    pub inner: S,
    pub insert_calls: usize,
    pub fail_inserts: bool,
}

#[allow(dead_code)]
impl<S: MetadataStore> RecordingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            insert_calls: 0,
            fail_inserts: false,
        }
    }

    pub fn failing(inner: S) -> Self {
        Self {
            fail_inserts: true,
            ..Self::new(inner)
        }
    }
}

impl<S: MetadataStore> MetadataStore for RecordingStore<S> {
    fn insert_batch(&mut self, demos: &[DemoMetadata]) -> anyhow::Result<Vec<String>> {
        self.insert_calls += 1;
        if self.fail_inserts {
            anyhow::bail!("database is locked");
        }
        self.inner.insert_batch(demos)
    }

    fn list_demos(&self) -> anyhow::Result<Vec<DemoMetadata>> {
        self.inner.list_demos()
    }
}
