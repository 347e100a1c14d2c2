use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lorawan_join_server::config;
use lorawan_join_server::engine::JoinEngine;
use lorawan_join_server::registry::in_memory::InMemoryRegistry;
use lorawan_join_server::rpc;

#[derive(Parser)]
#[command(name = "lorawan-join-server")]
#[command(about = "LoRaWAN 1.1 Join Server: join procedure, key derivation and session-key retrieval")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = config::Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Warning: failed to load config from {:?}: {}", cli.config, e);
        eprintln!("Using default configuration");
        config::Config::default()
    });

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level)))
        .init();

    info!("lorawan-join-server v{}", env!("CARGO_PKG_VERSION"));

    let prefixes = config.lorawan.prefix_matcher()?;
    info!("serving {} JoinEUI prefix(es)", config.lorawan.join_eui_prefixes.len());

    let registry = Arc::new(InMemoryRegistry::new());
    let engine = Arc::new(JoinEngine::new(registry, prefixes, None));

    rpc::run_server(&config.rpc.bind, engine).await?;

    Ok(())
}
