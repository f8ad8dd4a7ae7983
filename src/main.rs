//! labrelay - experiment orchestration and live log streaming server.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use labrelay::config::{OrchestratorConfig, StorageBackend};
use labrelay::logs::{LogStore, MemoryLogStore};
use labrelay::orchestrator::Orchestrator;
use labrelay::runner::CommandEngine;

#[derive(Debug, Parser)]
#[command(name = "labrelay", version, about = "Experiment orchestration and live log streaming")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true, env = "LABRELAY_CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the HTTP/WebSocket server
    Serve {
        /// Override server.host
        #[arg(long)]
        host: Option<String>,
        /// Override server.port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the effective configuration as JSON
    Config,
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(false))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs);

    let mut config = OrchestratorConfig::load(cli.config.as_deref())
        .context("failed to load configuration")?;

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            serve(config).await
        }
    }
}

async fn serve(config: OrchestratorConfig) -> Result<()> {
    let engine = CommandEngine::from_config(&config.engine)
        .context("engine.command must be configured to launch experiments")?;
    tracing::info!(
        engine = engine.program(),
        storage = ?config.storage.backend,
        "Configuration loaded"
    );

    match config.storage.backend {
        StorageBackend::Memory => run(config, Arc::new(MemoryLogStore::new()), engine).await,
        StorageBackend::Sqlite => {
            #[cfg(feature = "sqlite")]
            {
                let store = labrelay::logs::SqliteLogStore::open(&config.storage.sqlite_path)
                    .with_context(|| {
                        format!("failed to open {}", config.storage.sqlite_path.display())
                    })?;
                run(config, Arc::new(store), engine).await
            }
            #[cfg(not(feature = "sqlite"))]
            {
                anyhow::bail!("storage.backend = \"sqlite\" requires the `sqlite` feature")
            }
        }
    }
}

async fn run<S: LogStore>(
    config: OrchestratorConfig,
    store: Arc<S>,
    engine: CommandEngine,
) -> Result<()> {
    let addr = config.server.bind_addr();
    let orchestrator = Arc::new(Orchestrator::new(config, store, Arc::new(engine)));
    labrelay::server::serve(orchestrator, &addr).await?;
    Ok(())
}
