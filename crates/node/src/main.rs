use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::UnixListener;
use tracing::{info, Level};

use axon_catalog::{ipc, CatalogStore};
use axon_pipeline::{LoopbackRuntime, PipelineHost};

mod config;
mod server;

use config::DaemonConfig;

#[derive(Parser)]
#[command(name = "axond")]
#[command(about = "Axon ML service daemon - system catalog and pipeline host", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Catalog database file (defaults to the per-user data directory)
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// IPC socket path (defaults to the session socket)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Bind the system socket instead of the session one
    #[arg(long, default_value = "false")]
    system: bool,

    /// Log verbosely
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon
    Start,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .with_target(false)
        .init();

    let config = DaemonConfig::new(cli.db_path, cli.socket, cli.system);
    match cli.command {
        Some(Commands::Start) | None => run_daemon(config).await,
    }
}

async fn run_daemon(config: DaemonConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(CatalogStore::open(&config.db_path)?);
    info!("📚 catalog database at {}", config.db_path.display());

    // Pipelines launched by clients run on the in-process runtime; a
    // streaming runtime can be swapped in behind the same host.
    let host = Arc::new(PipelineHost::new(Arc::new(LoopbackRuntime::new())));

    if let Some(dir) = config.socket_path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    // A stale socket from a previous run would block the bind.
    if config.socket_path.exists() {
        std::fs::remove_file(&config.socket_path)?;
    }
    let listener = UnixListener::bind(&config.socket_path)?;
    info!("🔌 listening on {}", config.socket_path.display());

    let handler = server::pipeline_handler(store.clone(), host);
    ipc::serve(listener, store, Some(handler)).await?;
    Ok(())
}
