use anyhow::{anyhow, Context, Result};
use fedbus::auth::SecretVerifier;
use fedbus::{load_config, Bus, BusConfig, MemoryStore};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fedbus=info".into()),
        )
        .init();

    info!("fedbus starting...");

    // Config file from FEDBUS_CONFIG or the first argument, env on top
    let config_path = std::env::var("FEDBUS_CONFIG")
        .ok()
        .or_else(|| std::env::args().nth(1));
    let config = match config_path {
        Some(path) => load_config(&path)
            .map_err(|e| anyhow!("{}", e))
            .with_context(|| format!("Failed to load config from {}", path))?,
        None => {
            warn!("No config file given, using defaults");
            BusConfig::default()
        }
    }
    .apply_env();

    info!(
        federation_urls = ?config.federation.urls,
        pool_size = config.federation.pool_size,
        listen = ?config.federation.listen,
        path = %config.federation.path,
        "Configuration loaded"
    );

    let listen = config.federation.listen.clone();
    let secret = config.federation.secret.clone();

    let bus = Bus::new(config, Arc::new(MemoryStore::new()));
    bus.connect().await.context("Failed to connect bus")?;
    info!(bus = %bus.id(), "Bus connected");

    let server_handle = match listen {
        Some(addr) => {
            let router = bus.federation_router(SecretVerifier::secret(secret));
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("Failed to bind federation listener on {}", addr))?;
            info!(addr = %addr, "Federation server listening");
            Some(tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, router).await {
                    tracing::error!(error = %e, "Federation server error");
                }
            }))
        }
        None => {
            info!("No federation listener configured");
            None
        }
    };

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    if let Some(handle) = server_handle {
        handle.abort();
    }
    bus.disconnect().await;
    info!("fedbus stopped");

    Ok(())
}
