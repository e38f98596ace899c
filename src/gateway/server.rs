//! # Gateway Host Server
//!
//! HTTP surface of the gateway process. It exposes the registry to operators and to
//! callers that cannot link the library: listing, discovery with health, selection of
//! a healthy instance, and the supervisor summary.
//!
//! Library errors are answered through `RegistryError`'s `IntoResponse`, so an empty
//! healthy set becomes a 503 naming the service and everything else carries a
//! request id.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, instrument};

use crate::core::error::{RegistryError, RegistryResult};
use crate::core::types::{HealthStatus, HealthSummary, ServiceDescriptor};
use crate::discovery::registry::{RegistryStats, ServiceRegistry};

/// Shared server state
#[derive(Clone)]
pub struct ServerState {
    pub registry: Arc<ServiceRegistry>,

    /// Scheme used when forming the URL of a selected instance
    pub scheme: String,
}

impl ServerState {
    pub fn new(registry: Arc<ServiceRegistry>, scheme: impl Into<String>) -> Self {
        Self {
            registry,
            scheme: scheme.into(),
        }
    }
}

/// Query parameters of the selection endpoint
#[derive(Debug, Default, Deserialize)]
pub struct SelectQuery {
    pub strategy: Option<String>,
    pub key: Option<String>,
}

/// One instance with its current health
#[derive(Debug, Serialize)]
pub struct InstanceView {
    pub service: ServiceDescriptor,
    pub health: HealthStatus,
}

#[derive(Debug, Serialize)]
pub struct ServiceInstances {
    pub service: String,
    pub instances: Vec<InstanceView>,
    pub healthy: usize,
}

#[derive(Debug, Serialize)]
pub struct SelectedInstance {
    pub service: ServiceDescriptor,
    pub url: String,
    pub strategy: String,
}

#[derive(Debug, Serialize)]
pub struct RegistryHealth {
    pub summary: HealthSummary,
    pub stats: RegistryStats,
}

/// Build the router with every host endpoint
pub fn create_router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(gateway_health_check))
        .route("/services", get(list_services))
        .route("/services/:name", get(describe_service))
        .route("/services/:name/select", get(select_instance))
        .route("/registry/health", get(registry_health))
        .with_state(state)
}

/// HTTP server hosting the registry endpoints
pub struct GatewayServer {
    listener: TcpListener,
    app: Router,
}

impl GatewayServer {
    /// Bind `addr`; port 0 picks a free port
    pub async fn bind(addr: SocketAddr, state: ServerState) -> RegistryResult<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            RegistryError::config(format!("Failed to bind gateway server to {}: {}", addr, e))
        })?;
        Ok(Self {
            listener,
            app: create_router(state),
        })
    }

    pub fn local_addr(&self) -> RegistryResult<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| RegistryError::config(format!("Listener has no local address: {}", e)))
    }

    /// Serve until `shutdown` resolves, then finish in-flight requests
    pub async fn run<F>(self, shutdown: F) -> RegistryResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.local_addr()?;
        info!(bind_addr = %addr, "Gateway HTTP server listening");

        axum::serve(self.listener, self.app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| RegistryError::config(format!("Gateway server error: {}", e)))?;

        info!("Gateway HTTP server stopped");
        Ok(())
    }
}

/// Gateway liveness handler
pub async fn gateway_health_check() -> impl IntoResponse {
    let health_info = serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "service": "api-gateway"
    });

    (StatusCode::OK, Json(health_info))
}

async fn list_services(
    State(state): State<ServerState>,
) -> Result<Json<Vec<ServiceDescriptor>>, RegistryError> {
    Ok(Json(state.registry.list_all().await?))
}

#[instrument(skip(state))]
async fn describe_service(
    State(state): State<ServerState>,
    Path(name): Path<String>,
) -> Result<Json<ServiceInstances>, RegistryError> {
    let view = state.registry.view(&name).await?;
    let instances: Vec<InstanceView> = view
        .iter()
        .map(|(service, health)| InstanceView {
            service: service.clone(),
            health: health.clone(),
        })
        .collect();
    let healthy = instances.iter().filter(|i| i.health.is_healthy()).count();

    Ok(Json(ServiceInstances {
        service: name,
        instances,
        healthy,
    }))
}

#[instrument(skip(state))]
async fn select_instance(
    State(state): State<ServerState>,
    Path(name): Path<String>,
    Query(query): Query<SelectQuery>,
) -> Result<Json<SelectedInstance>, RegistryError> {
    let registry = &state.registry;
    let strategy = query
        .strategy
        .unwrap_or_else(|| registry.balancer().default_strategy().to_string());

    let selected = registry
        .select_healthy_with(&name, &strategy, query.key.as_deref())
        .await?;
    debug!(service_name = %name, instance_id = %selected.id, "Served selection");

    Ok(Json(SelectedInstance {
        url: selected.base_url(&state.scheme),
        service: selected,
        strategy,
    }))
}

async fn registry_health(
    State(state): State<ServerState>,
) -> Result<Json<RegistryHealth>, RegistryError> {
    Ok(Json(RegistryHealth {
        summary: state.registry.health_summary(),
        stats: state.registry.stats().await?,
    }))
}
