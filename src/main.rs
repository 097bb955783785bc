use clap::Parser;
use nexus_gateway::config::config_search_paths;
use nexus_gateway::{build_router, AppState, GatewayConfig, SharedLogger};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "nexus",
    about = "Multi-protocol LLM gateway: Anthropic, OpenAI and Codex clients over one backend",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Accounts file (overrides config)
    #[arg(long)]
    accounts: Option<PathBuf>,

    /// Request log file (overrides config)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Log translated payloads at debug level
    #[arg(short, long, env = "NEXUS_VERBOSE")]
    verbose: bool,

    /// Print config search paths and exit
    #[arg(long)]
    show_config_paths: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "nexus_gateway=debug,tower_http=info"
    } else {
        "nexus_gateway=info,tower_http=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if cli.show_config_paths {
        println!("Config search paths:");
        for (i, path) in config_search_paths().iter().enumerate() {
            println!("  {}. {}", i + 1, path.display());
        }
        return Ok(());
    }

    let mut config = GatewayConfig::find_and_load(cli.config.as_deref())?;

    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(accounts) = cli.accounts {
        config.credentials.accounts_file = accounts;
    }
    if let Some(log_file) = cli.log_file {
        config.request_log = log_file;
    }
    config.verbose |= cli.verbose;

    let logger = SharedLogger::new(&config.request_log)?;
    let state = Arc::new(AppState::from_config(config.clone(), logger.clone())?);

    let accounts = state.credentials.snapshot();
    info!("nexus v{}", env!("CARGO_PKG_VERSION"));
    info!("  Accounts:  {} active ({})", accounts.len(), config.credentials.accounts_file.display());
    info!("  Routes:    {} client models", state.router.client_models().len());
    info!("  Codex:     {}", if state.codex.is_some() { "enabled" } else { "disabled" });
    info!("  Port:      {}", config.port);
    info!("  Log file:  {}", config.request_log.display());

    logger.info(
        "startup",
        format!(
            "Starting nexus port={} accounts={} codex={}",
            config.port,
            accounts.len(),
            state.codex.is_some()
        ),
    );

    state
        .credentials
        .clone()
        .spawn_refresh_loop(Duration::from_secs(config.credentials.refresh_interval_secs));

    let app = build_router(state);
    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}", bind_addr);
    info!("  Anthropic: ANTHROPIC_BASE_URL=http://localhost:{}/anthropic", config.port);
    info!("  OpenAI:    OPENAI_BASE_URL=http://localhost:{}/v1", config.port);

    axum::serve(listener, app).await?;

    Ok(())
}
