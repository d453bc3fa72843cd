use clap::Parser;
use mammouth_proxy::{build_router, AppState, ProxyConfig, SharedLogger};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "mammouth-proxy",
    about = "OpenAI-compatible proxy for Mammouth.ai with credential rotation and attachment dedupe",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log file path
    #[arg(long, default_value = "mammouth-proxy.log")]
    log_file: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mammouth_proxy=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = ProxyConfig::find_and_load(cli.config.as_deref())?;

    if let Some(port) = cli.port {
        config.port = port;
    }

    let logger = SharedLogger::new(&cli.log_file)?;

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(300))
        .build()?;

    let state = Arc::new(AppState::from_config(config.clone(), client, logger.clone()));

    info!("mammouth-proxy v{}", env!("CARGO_PKG_VERSION"));
    info!("  Upstream:    {}", config.upstream.base_url);
    info!("  Port:        {}", config.port);
    info!("  Models:      {} mapped", config.models.len());
    info!("  Credentials: {} in pool", state.pool.len());
    info!("  Log file:    {}", cli.log_file.display());

    if state.pool.is_empty() {
        warn!("credential pool is empty; set the {} environment variable", config.credentials_env);
    }

    logger.info(
        "startup",
        format!(
            "starting mammouth-proxy port={} credentials={} models={}",
            config.port,
            state.pool.len(),
            config.models.len()
        ),
    );

    let app = build_router(state);
    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
