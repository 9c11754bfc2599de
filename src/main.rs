use ai_gateway::config::config_search_paths;
use ai_gateway::pricing::bootstrap_prices;
use ai_gateway::{build_router, AppState, GatewayConfig, SharedLogger, SqliteStore};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "ai-gateway",
    about = "Anthropic Messages API gateway in front of an OpenAI-compatible backend, with a request ledger and cost accounting",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// URL of the target API (overrides config)
    #[arg(long)]
    url: Option<String>,

    /// Path to SQLite database file (overrides config)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Event log file path
    #[arg(long, default_value = "ai-gateway.log")]
    log_file: PathBuf,

    /// Print config search paths and exit
    #[arg(long)]
    show_config_paths: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ai_gateway=info,tower_http=info".into()),
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
    if let Some(ref url) = cli.url {
        config.set_target_url(url);
    }
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    let logger = SharedLogger::new(&cli.log_file)?;
    let store = SqliteStore::open(&config.db_path)?;
    let client = reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(30))
        .build()?;

    info!("ai-gateway v{}", env!("CARGO_PKG_VERSION"));
    info!("  Target URL: {}", config.target_url);
    info!("  Database:   {}", config.db_path.display());
    info!("  Port:       {}", config.port);
    info!("  Log file:   {}", cli.log_file.display());

    if config.fetch_pricing {
        match bootstrap_prices(&store, &client, &config.target_url).await {
            Ok(0) => {}
            Ok(n) => logger.info("pricing", format!("Stored pricing for {n} models")),
            Err(e) => logger.warn("pricing", format!("Error fetching model pricing: {e}")),
        }
    }

    logger.info(
        "startup",
        format!(
            "Starting ai-gateway target_url={} port={}",
            config.target_url, config.port
        ),
    );

    let port = config.port;
    let state = Arc::new(AppState::new(config, store, client, logger));
    let app = build_router(state);

    let bind_addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Listening on http://{}", bind_addr);
    info!("  ANTHROPIC_BASE_URL=http://localhost:{} points Anthropic clients here", port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
