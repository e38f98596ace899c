//! # Gateway Host - Main Entry Point
//!
//! Loads configuration, builds the process-wide registry, registers the gateway itself,
//! starts health supervision and serves the registry endpoints until SIGINT or SIGTERM.
//! On shutdown the gateway deregisters before supervision stops.

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use service_registry::gateway::server::{GatewayServer, ServerState};
use service_registry::observability::logging::init_logging;
use service_registry::registration::registrar::{Registrar, API_GATEWAY};
use service_registry::{init_global, shutdown_global, RegistryConfig, ServiceRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config().await?;
    init_logging(&config.logging).context("failed to initialize logging")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.service.environment,
        "Starting gateway host"
    );

    let registry = Arc::new(
        ServiceRegistry::from_config(&config).context("failed to build service registry")?,
    );
    init_global(Arc::clone(&registry)).context("failed to install global registry")?;

    let descriptor = Registrar::new(&config.service)
        .build_from_env(API_GATEWAY)
        .context("failed to build gateway descriptor")?;
    let port = descriptor.port;
    let gateway_id = descriptor.id.clone();

    registry
        .register(descriptor)
        .await
        .context("failed to register gateway")?;
    info!(service_id = %gateway_id, port = port, "Gateway registered");

    registry.start();

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let state = ServerState::new(Arc::clone(&registry), config.service.scheme.clone());
    let server = GatewayServer::bind(addr, state).await?;

    if let Err(e) = server.run(shutdown_signal()).await {
        error!(error = %e, "Gateway server failed");
    }

    match registry.deregister(&gateway_id).await {
        Ok(()) => info!(service_id = %gateway_id, "Gateway deregistered"),
        Err(e) => warn!(service_id = %gateway_id, error = %e, "Failed to deregister gateway"),
    }
    shutdown_global().await;

    info!("Gateway host shutdown complete");
    Ok(())
}

/// YAML from `REGISTRY_CONFIG_PATH` when set, defaults plus environment otherwise
async fn load_config() -> anyhow::Result<RegistryConfig> {
    match std::env::var("REGISTRY_CONFIG_PATH") {
        Ok(path) => RegistryConfig::load_from_file(&path)
            .await
            .with_context(|| format!("failed to load configuration from {}", path)),
        Err(_) => RegistryConfig::from_env().context("invalid configuration"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
