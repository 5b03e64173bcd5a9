/*
newsbot - single-binary main.rs
This binary starts the Rocket HTTP server and runs the cache sweeper inside the same process.
*/

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::Notify;
use tokio::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use common::{init_db_pool, Config};

use newsbot::cache;
use newsbot::llm::{remote::RemoteLlmProvider, Analyzer, LlmProvider};
use newsbot::news::NewsClient;
use newsbot::server::{launch_rocket, AppState};
use newsbot::storage;

#[derive(Parser, Debug)]
#[command(name = "newsbot", about = "News summary bot: JSON API server + cache sweeper")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Disable the background cache sweeper
    #[arg(long)]
    no_sweeper: bool,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    // Resolve config paths
    let default_path = PathBuf::from("config.default.toml");
    let override_path = match args.config {
        Some(p) if !p.exists() => {
            error!(path = ?p, "specified config file not found");
            return Err(anyhow::anyhow!("Config file not found: {}", p.display()));
        }
        Some(p) => Some(p),
        None => Some(PathBuf::from("config.toml")).filter(|p| p.exists()),
    };

    let config = Config::load_with_defaults(
        Some(default_path.as_path()).filter(|p| p.exists()),
        override_path.as_deref(),
    )
    .await
    .map_err(|e| {
        error!(%e, "failed to load configuration");
        e
    })?;
    info!(default = ?default_path, override = ?override_path, "configuration loaded");

    // Resolve and log the absolute DB path before connecting
    let db_path = match tokio::fs::canonicalize(&config.database.path).await {
        Ok(p) => p.to_string_lossy().to_string(),
        Err(_) => config.database.path.clone(),
    };
    info!(db_path = %db_path, "resolved DB path");

    let db_pool = init_db_pool(&db_path).await.map_err(|e| {
        error!(%e, db_path = %db_path, "failed to initialize database pool");
        e
    })?;

    if config
        .admin
        .as_ref()
        .and_then(|a| a.auto_migrate)
        .unwrap_or(true)
    {
        storage::ensure_schema(&db_pool)
            .await
            .context("failed to ensure DB schema")?;
    } else {
        info!("admin.auto_migrate = false: skipping schema creation");
    }

    let analyzer = Analyzer::new(create_llm_provider(config.llm.as_ref()));
    let news = NewsClient::from_config(&config.news.clone().unwrap_or_default())?;

    let shutdown_notify = Arc::new(Notify::new());
    let cache_cfg = config.cache_section();

    let state = AppState::new(config, db_pool, analyzer, news);

    let mut sweeper_handle = None;
    if !args.no_sweeper {
        let every = Duration::from_secs(cache_cfg.sweep_interval_seconds.unwrap_or(600).max(1));
        info!("Spawning cache sweeper task");
        sweeper_handle = Some(tokio::spawn(cache::run_sweeper(
            state.cache.clone(),
            every,
            shutdown_notify.clone(),
        )));
    } else {
        info!("Cache sweeper disabled via CLI (--no-sweeper)");
    }

    // Blocks until Rocket shuts down
    info!("Launching Rocket HTTP server");
    let served = launch_rocket(state).await;
    if let Err(e) = &served {
        error!(%e, "Rocket server failed");
    }

    info!("HTTP server stopped; notifying sweeper to shutdown");
    shutdown_notify.notify_waiters();

    if let Some(handle) = sweeper_handle {
        match tokio::time::timeout(Duration::from_secs(20), handle).await {
            Ok(Ok(())) => info!("sweeper exited cleanly"),
            Ok(Err(join_err)) => error!(%join_err, "sweeper task panicked"),
            Err(_) => info!("Timed out waiting for sweeper to exit; continuing shutdown"),
        }
    }

    info!("Shutdown complete");
    served
}

/// Create the LLM provider named by `llm.adapter`. Any problem is logged and the
/// analyzer runs with its local fallbacks.
fn create_llm_provider(llm_config: Option<&common::LlmConfig>) -> Option<Arc<dyn LlmProvider>> {
    let llm_config = llm_config?;
    match llm_config.adapter.as_deref().unwrap_or("none") {
        "remote" => {
            let Some(remote_config) = llm_config.remote.as_ref() else {
                warn!("Remote LLM adapter selected but [llm.remote] is missing");
                return None;
            };
            match RemoteLlmProvider::from_config(remote_config) {
                Ok(provider) => {
                    info!(model = provider.model_name(), "LLM provider initialized: remote");
                    Some(Arc::new(provider) as Arc<dyn LlmProvider>)
                }
                Err(e) => {
                    error!("Failed to initialize LLM provider: {:#}", e);
                    None
                }
            }
        }
        "none" => {
            info!("LLM adapter 'none': using extractive summaries and lexicon sentiment");
            None
        }
        other => {
            warn!("Unknown LLM adapter type: {}", other);
            None
        }
    }
}
