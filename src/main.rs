use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::config::TollgateConfig;
use tollgate::http::HttpServer;
use tollgate::ratelimit::{Algorithm, RateLimiter};

/// Command line arguments. Flags override values from the configuration file.
#[derive(Parser, Debug)]
#[command(name = "tollgate", version, about = "Per-key HTTP rate limiting service")]
struct Args {
    /// Path to a configuration file
    #[arg(short, long, env = "TOLLGATE_CONFIG")]
    config: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Rate limiting algorithm: fixed or sliding
    #[arg(short, long, env = "ALGORITHM")]
    algorithm: Option<Algorithm>,

    /// Requests allowed per window
    #[arg(short, long, env = "REQUESTS_LIMIT")]
    limit: Option<u64>,

    /// Window length in seconds
    #[arg(short, long, env = "WINDOW_SECONDS")]
    window: Option<u64>,

    /// Seconds an idle client's record is kept
    #[arg(long, env = "STORE_TTL_SECONDS")]
    store_ttl: Option<u64>,
}

impl Args {
    fn apply(&self, config: &mut TollgateConfig) {
        if let Some(port) = self.port {
            config.server.listen_addr = SocketAddr::new(config.server.listen_addr.ip(), port);
        }
        if let Some(algorithm) = self.algorithm {
            config.rate_limiting.algorithm = algorithm;
        }
        if let Some(limit) = self.limit {
            config.rate_limiting.requests_limit = limit;
        }
        if let Some(window) = self.window {
            config.rate_limiting.window_secs = window;
        }
        if let Some(store_ttl) = self.store_ttl {
            config.rate_limiting.store_ttl_secs = store_ttl;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .init();

    info!("Starting Tollgate Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();
    let mut config = TollgateConfig::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;
    info!(
        listen_addr = %config.server.listen_addr,
        algorithm = %config.rate_limiting.algorithm,
        limit = config.rate_limiting.requests_limit,
        window_secs = config.rate_limiting.window_secs,
        "Configuration loaded"
    );

    // Initialize the rate limiter and its store sweeper
    let rate_limiter = Arc::new(RateLimiter::from_settings(&config.rate_limiting));
    let sweeper = rate_limiter.spawn_sweeper();
    info!("Rate limiter initialized");

    let server = HttpServer::new(config.server.listen_addr, rate_limiter);

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    sweeper.shutdown().await;
    info!("Tollgate Rate Limiting Service stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
