use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;

use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use secure_proxy::config::Config;
use secure_proxy::routes::{self, AppState};
use secure_proxy::services::auth::build_provider;
use secure_proxy::services::cache::build_cache;

const DEFAULT_CONFIG_PATH: &str = "secure-proxy.json";

fn load_config() -> Result<Config, secure_proxy::error::ConfigError> {
    let path =
        std::env::var("SECURE_PROXY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

    if Path::new(&path).exists() {
        tracing::info!("Loading configuration from {}", path);
        return Config::load(&path);
    }

    tracing::warn!("{} not found, configuring from the environment", path);
    let config = Config::from_env();
    config.validate()?;
    Ok(config)
}

async fn shutdown_signal(tx: watch::Sender<bool>) {
    shutdown_on(tokio::signal::ctrl_c(), tx).await
}

/// Resolves once `signal` fires. A signal that cannot be installed keeps the
/// server running instead of shutting it down.
async fn shutdown_on<F>(signal: F, tx: watch::Sender<bool>)
where
    F: Future<Output = std::io::Result<()>>,
{
    if let Err(e) = signal.await {
        tracing::error!("Cannot listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
    tx.send_replace(true);
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "secure_proxy=info,tower_http=info".into()),
        )
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json_logs).then(tracing_subscriber::fmt::layer))
        .init();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let cache = match build_cache(&config.cache, shutdown_rx).await {
        Ok(cache) => cache,
        Err(e) => {
            tracing::error!("Cache initialisation failed: {}", e);
            std::process::exit(1);
        }
    };

    let provider = match build_provider(&config) {
        Ok(provider) => provider,
        Err(e) => {
            tracing::error!("Authentication provider initialisation failed: {}", e);
            std::process::exit(1);
        }
    };

    let listen = config.listen.clone();
    let state = match AppState::new(config, cache, provider) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!("Startup failed: {}", e);
            std::process::exit(1);
        }
    };

    let app = routes::create_router(state)
        .layer(TraceLayer::new_for_http())
        .into_make_service_with_connect_info::<SocketAddr>();

    let listener = match tokio::net::TcpListener::bind(listen.as_str()).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Cannot listen on {}: {}", listen, e);
            std::process::exit(1);
        }
    };

    tracing::info!("========================================");
    tracing::info!("  Secure Proxy v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("========================================");
    tracing::info!("Listening on http://{}", listen);
    tracing::info!("Login page: /secure-proxy/auth");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
    {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}
