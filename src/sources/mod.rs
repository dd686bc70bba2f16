//! Demo ingestion from remote game servers.
//!
//! # Architecture
//!
//! - **filename**: turns remote names like `pug_dust2_2024-01-15_20-30.dem`
//!   into [`DemoMetadata`](crate::model::types::DemoMetadata)
//! - **remote**: the [`RemoteTransport`] seam and its FTP implementation
//! - **presence**: decides which remote demos are missing locally
//! - **download**: bounded worker pool that fetches new demos
//! - **sync**: the [`SyncEngine`] that runs one full pass
//!
//! # Local layout
//!
//! Every demo lives at `demodir/<server>/<filename>`. That path is a pure
//! function of the server name and the remote filename, so a file being
//! present there is the only record needed to skip it on later passes.

pub mod download;
pub mod filename;
pub mod presence;
pub mod remote;
pub mod sync;

pub use download::{DownloadFailure, DownloadOutcome, Downloader, FetchTask};
pub use presence::filter_new;
pub use remote::{FtpTransport, RemoteTransport, list_remote_demos};
pub use sync::{RunLock, ServerSyncResult, SyncEngine, SyncError, SyncReport};
