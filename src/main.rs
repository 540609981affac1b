//! Gate: a multi-tenant static site server.
//!
//! This is the application entry point. It loads configuration, initializes
//! tracing, seeds the domain registry from the persisted domain list, starts the
//! access log writer, builds the Axum router, and starts the HTTP(S) server.

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gate::access_log::AccessLog;
use gate::config::{AppConfig, DEFAULT_CONFIG_PATH, DEFAULT_LOG_FILTER};
use gate::http::start_server;
use gate::routes::create_router;
use gate::sites::{DomainRegistry, WatchPolicy};
use gate::state::AppState;

/// Gate: serves static sites for every domain pointed at it
#[derive(Parser, Debug)]
#[command(name = "gate", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Log level filter (e.g., "gate=debug,tower_http=info")
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration and apply environment overrides
    let config_found = Path::new(&args.config).exists();
    let mut config = AppConfig::load_or_default(&args.config)?;
    config.apply_env(|key| std::env::var(key).ok())?;

    // Initialize tracing with priority: CLI > env > default
    let log_filter = args
        .log_level
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

    let subscriber =
        tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::new(&log_filter));
    if config.logging.format == "json" {
        subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        subscriber.with(tracing_subscriber::fmt::layer()).init();
    }

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting gate");
    if config_found {
        tracing::info!(path = %args.config, "Loaded configuration");
    } else {
        tracing::warn!(path = %args.config, "Config file not found, using defaults");
    }

    // Both ring and aws-lc-rs may be linked; pin the provider before any TLS setup
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    // Seed the domain registry; without it certificate policy is undefined
    let (policy, allow_list) = WatchPolicy::new();
    let registry = Arc::new(DomainRegistry::new(Arc::new(policy)));
    registry
        .load_persisted(&config.sites.domains_file, &config.sites.extra_domains)
        .await?;
    tracing::info!(
        sites_dir = %config.sites.sites_dir.display(),
        default_root = %config.sites.default_root.display(),
        domains = ?registry.snapshot(),
        "Initialized domain registry"
    );
    if registry.is_empty() {
        tracing::warn!("No domains registered yet, they will be learned from traffic");
    }

    let access_log = AccessLog::spawn(&config.access_log).await?;

    let state = AppState::new(config.clone(), registry, access_log);
    let app = create_router(state);

    start_server(app, &config, allow_list).await?;

    Ok(())
}
