pub mod config;
pub mod logging;
pub mod model;
pub mod sources;
pub mod storage;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;

use config::Config;
use logging::LogSettings;
use model::types::DemoMetadata;
use sources::{FtpTransport, SyncEngine};
use storage::MetadataStore;
use storage::sqlite::SqliteStorage;

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "demosync",
    version,
    about = "Sync game server demo recordings over FTP into a local index"
)]
pub struct Cli {
    /// Path to the config file (defaults to $DEMOSYNC_CONFIG, then the platform config dir)
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level
    #[arg(long, short, global = true)]
    pub verbose: bool,

    /// Defaults to `sync`
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one sync pass across all configured servers
    Sync {
        /// Print the pass report as JSON on stdout
        #[arg(long)]
        json: bool,
    },
    /// List indexed demos, newest first
    List {
        /// Only demos from this server
        #[arg(long)]
        server: Option<String>,

        /// Output JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Print the local file path of an indexed demo
    Show {
        /// Demo id as printed by `list`
        demo_id: String,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let config_path = config::resolve_config_path(cli.config.clone())?;
    let config = Config::load(&config_path)?;

    match cli.command.unwrap_or(Commands::Sync { json: false }) {
        Commands::Sync { json } => {
            let _guard = logging::init(&LogSettings {
                log_file: config.general.log_file.clone(),
                verbose: cli.verbose,
            })?;
            run_sync(&config, json)
        }
        Commands::List { server, json } => {
            let _guard = logging::init(&LogSettings {
                log_file: None,
                verbose: cli.verbose,
            })?;
            run_list(&config, server.as_deref(), json)
        }
        Commands::Show { demo_id } => {
            let _guard = logging::init(&LogSettings {
                log_file: None,
                verbose: cli.verbose,
            })?;
            run_show(&config, &demo_id)
        }
    }
}

fn run_sync(config: &Config, json: bool) -> Result<()> {
    let transport = FtpTransport::new(config.general.connect_timeout);
    let mut store = SqliteStorage::open(&config.general.database)?;

    let report = SyncEngine::new(config, &transport)
        .run_pass(&mut store)
        .context("sync pass failed")?;

    tracing::info!(
        servers = report.servers.len(),
        new = report.total_new(),
        downloaded = report.total_downloaded(),
        failed = report.total_failed(),
        persisted = report.persisted,
        duration_ms = report.duration_ms,
        "sync pass finished"
    );

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}

/// Row shape for `list --json`.
#[derive(Debug, Serialize)]
struct DemoListing<'a> {
    demo_id: &'a str,
    server: &'a str,
    map: &'a str,
    datetime: String,
    filename: &'a str,
    filepath: String,
}

impl<'a> DemoListing<'a> {
    fn from_demo(demo: &'a DemoMetadata) -> Self {
        Self {
            demo_id: demo.id.as_deref().unwrap_or_default(),
            server: &demo.server,
            map: &demo.map,
            datetime: demo.datetime(),
            filename: &demo.filename,
            filepath: demo.filepath.display().to_string(),
        }
    }
}

fn run_list(config: &Config, server: Option<&str>, json: bool) -> Result<()> {
    let store = SqliteStorage::open(&config.general.database)?;
    let demos = match server {
        Some(name) => {
            if config.server(name).is_none() {
                tracing::warn!(server = name, "server is not in the config; listing stored demos only");
            }
            store.list_demos_for_server(name)?
        }
        None => store.list_demos()?,
    };

    if json {
        let rows: Vec<_> = demos.iter().map(DemoListing::from_demo).collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        for demo in &demos {
            println!(
                "{}  {}  {}  {}",
                demo.id.as_deref().unwrap_or("-"),
                demo.datetime(),
                demo.server,
                demo.map
            );
        }
    }
    Ok(())
}

fn run_show(config: &Config, demo_id: &str) -> Result<()> {
    let store = SqliteStorage::open(&config.general.database)?;
    let demo = store
        .get_demo(demo_id)?
        .ok_or_else(|| anyhow!("demo with id {demo_id} doesn't exist"))?;
    if !demo.filepath.is_file() {
        tracing::warn!(path = %demo.filepath.display(), "indexed demo is missing on disk");
    }
    println!("{}", demo.filepath.display());
    Ok(())
}
