//! tossbook: websocket front for the betting ledger.
//!
//! Usage:
//!   tossbook [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>     Config file path (default: tossbook.toml)
//!   --listen <ADDR>         Listen address (overrides config)
//!   --db-endpoint <URL>     surrealdb endpoint, e.g. mem:// or ws://host:8000 (overrides config)

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use server::config::ServerConfig;
use server::connection_manager;
use server::engine::BettingEngine;

#[derive(Parser, Debug)]
#[command(name = "tossbook")]
#[command(about = "Wallet and settlement server for match betting")]
#[command(version)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "tossbook.toml")]
    config: PathBuf,

    /// Listen address (overrides config file)
    #[arg(long)]
    listen: Option<String>,

    /// Database endpoint (overrides config file)
    #[arg(long, env = "TOSSBOOK_DB_ENDPOINT")]
    db_endpoint: Option<String>,

    /// Create this admin on startup if no admin exists
    #[arg(long)]
    bootstrap_admin: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config_found = args.config.exists();
    let mut config = if config_found {
        ServerConfig::from_file(&args.config)?
    } else {
        ServerConfig::default()
    };
    config.apply_env_overrides()?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(endpoint) = args.db_endpoint {
        config.database.endpoint = endpoint;
    }
    if let Some(admin) = args.bootstrap_admin {
        config.bootstrap_admin = Some(admin);
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if !config_found {
        warn!("Config file not found at {:?}, using defaults", args.config);
    }
    info!(
        listen = %config.listen_addr,
        endpoint = %config.database.endpoint,
        "starting tossbook"
    );

    let (engine, tasks) = BettingEngine::start(&config).await?;

    if let Some(name) = &config.bootstrap_admin {
        let admin = engine.bootstrap_admin(name).await?;
        info!(admin_id = %admin.id, name = %admin.name, "admin available");
    }

    tokio::select! {
        result = connection_manager::listen(&config.listen_addr, engine) => {
            if let Err(err) = &result {
                error!(%err, "listener failed");
            }
            tasks.shutdown().await;
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            tasks.shutdown().await;
            Ok(())
        }
    }
}
