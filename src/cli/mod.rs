//! Command-line interface for offline-sw.

mod progress;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgAction, Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheStorage, DiskStorage, MemoryStorage};
use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::http::Request;
use crate::network::{HttpNetwork, Network, OfflineNetwork};
use crate::worker::{self, FetchOutcome, Worker};

pub use progress::{CliProgress, format_bytes, print_summary};

/// Offline-first caching worker: pre-caches a fixed asset list and answers
/// requests network-first with a cache fallback.
#[derive(Parser, Debug)]
#[command(name = "offline-sw")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "OFFLINE_SW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the cache storage directory
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a configuration file with default values
    Init(InitArgs),

    /// Pre-cache the configured assets
    Install,

    /// Run the fetch handler for one URL
    Fetch(FetchArgs),

    /// List caches and their keys
    Caches,

    /// Install, then serve the origin through the worker
    Serve(ServeArgs),
}

/// Arguments for the init command
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Overwrite an existing file
    #[arg(short, long)]
    pub force: bool,
}

/// Arguments for the fetch command
#[derive(Args, Debug)]
pub struct FetchArgs {
    /// Absolute URL, or a path relative to the configured origin
    pub url: String,

    /// Treat the network as unreachable
    #[arg(long)]
    pub offline: bool,

    /// Write the response body to this file
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Arguments for the serve command
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Bind address
    #[arg(long)]
    pub host: Option<String>,

    /// Bind port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Keep caches in memory instead of on disk
    #[arg(long)]
    pub ephemeral: bool,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();
}

/// Loads the configuration named on the command line, or the default file
/// if it exists, or built-in defaults.
fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => {
            let path = AppConfig::default_path();
            if path.exists() {
                AppConfig::load(&path)?
            } else {
                log::debug!("No config at {}, using defaults", path.display());
                AppConfig::default()
            }
        }
    };
    if let Some(dir) = &cli.cache_dir {
        config.paths.cache_dir.clone_from(dir);
    }
    Ok(config)
}

fn init_config(cli: &Cli, args: &InitArgs) -> Result<()> {
    let path = cli.config.clone().unwrap_or_else(AppConfig::default_path);
    if path.exists() && !args.force {
        return Err(Error::Config(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }
    AppConfig::default().save(&path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

async fn install(config: &AppConfig) -> Result<()> {
    let worker = Worker::from_config(config)?;
    let progress = CliProgress::new();
    let stats = worker.install(&progress).await?;
    drop(progress);
    print_summary(&stats);
    Ok(())
}

async fn fetch(config: &AppConfig, args: &FetchArgs) -> Result<()> {
    config.worker.validate()?;
    let request = Request::get(config.worker.resolve(&args.url)?);
    let storage = DiskStorage::new(&config.paths.cache_dir);
    let network: Box<dyn Network> = if args.offline {
        Box::new(OfflineNetwork)
    } else {
        Box::new(HttpNetwork::new()?)
    };

    let outcome =
        worker::respond(&config.worker.cache_name, &request, &storage, network.as_ref()).await?;
    let source = outcome.source();
    let resp = match outcome {
        FetchOutcome::Network(resp) | FetchOutcome::Cache(resp) => {
            println!(
                "{source} {} {} ({})",
                resp.status,
                request.url,
                format_bytes(resp.body.len() as u64)
            );
            resp
        }
        FetchOutcome::Unresolved(e) => {
            println!("unresolved {}", request.url);
            return Err(e);
        }
    };

    if let Some(path) = &args.output {
        tokio::fs::write(path, &resp.body).await?;
        println!("Wrote {}", path.display());
    }
    Ok(())
}

async fn list_caches(config: &AppConfig) -> Result<()> {
    let storage = DiskStorage::new(&config.paths.cache_dir);
    let names = storage.names().await?;
    if names.is_empty() {
        println!("No caches in {}", storage.root().display());
        return Ok(());
    }
    for name in names {
        let keys = storage.keys(&name).await?;
        println!("{name} ({} entries)", keys.len());
        for key in keys {
            println!("  {key}");
        }
    }
    Ok(())
}

async fn serve_worker<N, S>(worker: Worker<N, S>, config: &AppConfig) -> Result<()>
where
    N: Network + 'static,
    S: CacheStorage + 'static,
{
    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Received SIGINT");
        }
        signal_token.cancel();
    });

    let progress = CliProgress::new();
    crate::server::run(Arc::new(worker), &config.server, &progress, shutdown).await
}

async fn serve(mut config: AppConfig, args: &ServeArgs) -> Result<()> {
    if let Some(host) = &args.host {
        config.server.host.clone_from(host);
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    if args.ephemeral {
        config.worker.validate()?;
        let worker = Worker::new(config.worker.clone(), HttpNetwork::new()?, MemoryStorage::new());
        serve_worker(worker, &config).await
    } else {
        let worker = Worker::from_config(&config)?;
        serve_worker(worker, &config).await
    }
}

/// Parses arguments, initialises logging and runs the selected command.
///
/// # Errors
///
/// Returns an error if the command fails, including a fetch that could be
/// answered neither by the network nor by the cache.
pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Commands::Init(args) = &cli.command {
        return init_config(&cli, args);
    }

    let config = load_config(&cli)?;
    match &cli.command {
        Commands::Init(_) => Ok(()),
        Commands::Install => install(&config).await,
        Commands::Fetch(args) => fetch(&config, args).await,
        Commands::Caches => list_caches(&config).await,
        Commands::Serve(args) => serve(config, args).await,
    }
}
