//! # Discovery & Query Surface
//!
//! [`ServiceRegistry`] ties a backend, the health supervisor and the load balancer
//! together behind the operations services and the gateway call: register,
//! deregister, discover, select a healthy instance, and read health.
//!
//! Selection runs against a [`RegistryView`] built once per call, so a single
//! selection never sees a half-updated set. Supervisor writes are not ordered with
//! registry writes; an instance missing from the supervisor reads as `pending` while
//! the backend still holds it and `unknown` once it is gone.

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::core::config::RegistryConfig;
use crate::core::error::{RegistryError, RegistryResult};
use crate::core::types::{HealthState, HealthStatus, HealthSummary, RegistryView, ServiceDescriptor};
use crate::discovery::backend::{create_backend, RegistryBackend, WatchCallback, WatchHandle};
use crate::load_balancing::balancer::LoadBalancerManager;
use crate::observability::health::HealthSupervisor;

/// Service registry statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub backend: String,
    pub total_services: usize,
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub unhealthy_instances: usize,
}

pub struct ServiceRegistry {
    backend: Arc<dyn RegistryBackend>,
    supervisor: Arc<HealthSupervisor>,
    balancer: LoadBalancerManager,
}

impl ServiceRegistry {
    pub fn new(
        backend: Arc<dyn RegistryBackend>,
        supervisor: Arc<HealthSupervisor>,
        balancer: LoadBalancerManager,
    ) -> Self {
        Self {
            backend,
            supervisor,
            balancer,
        }
    }

    /// Build the backend, supervisor and balancer described by `config`
    pub fn from_config(config: &RegistryConfig) -> RegistryResult<Self> {
        let backend = create_backend(&config.backend, &config.supervisor)?;
        let supervisor = Arc::new(HealthSupervisor::new(
            Arc::clone(&backend),
            config.supervisor.clone(),
        )?);
        let balancer = LoadBalancerManager::from_config(&config.load_balancing)?;

        info!(
            backend = backend.backend_name(),
            default_strategy = balancer.default_strategy(),
            "Service registry created"
        );
        Ok(Self::new(backend, supervisor, balancer))
    }

    pub fn backend(&self) -> &Arc<dyn RegistryBackend> {
        &self.backend
    }

    pub fn supervisor(&self) -> &Arc<HealthSupervisor> {
        &self.supervisor
    }

    pub fn balancer(&self) -> &LoadBalancerManager {
        &self.balancer
    }

    /// Start health supervision
    pub fn start(&self) {
        self.supervisor.start();
    }

    /// Stop health supervision; idempotent
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }

    pub async fn register(&self, descriptor: ServiceDescriptor) -> RegistryResult<()> {
        let id = descriptor.id.clone();
        self.backend.register(descriptor).await?;
        self.supervisor.track(&id);
        Ok(())
    }

    pub async fn deregister(&self, id: &str) -> RegistryResult<()> {
        self.backend.deregister(id).await?;
        self.supervisor.forget(id);
        Ok(())
    }

    pub async fn get_service(&self, id: &str) -> RegistryResult<ServiceDescriptor> {
        self.backend.get_service(id).await
    }

    /// All instances of `name` regardless of health, ordered by id
    pub async fn discover(&self, name: &str) -> RegistryResult<Vec<ServiceDescriptor>> {
        self.backend.discover(name).await
    }

    pub async fn list_all(&self) -> RegistryResult<Vec<ServiceDescriptor>> {
        self.backend.list_all().await
    }

    pub async fn watch(&self, name: &str, callback: WatchCallback) -> RegistryResult<WatchHandle> {
        self.backend.watch(name, callback).await
    }

    /// Snapshot of the instances of `name` paired with their health
    pub async fn view(&self, name: &str) -> RegistryResult<RegistryView> {
        let descriptors = self.backend.discover(name).await?;
        let entries = descriptors
            .into_iter()
            .map(|descriptor| {
                let health = self
                    .supervisor
                    .get_status(&descriptor.id)
                    .unwrap_or_else(HealthStatus::pending);
                (descriptor, health)
            })
            .collect();
        Ok(RegistryView::new(entries))
    }

    /// One healthy instance of `name` chosen by the default strategy
    pub async fn select_healthy(&self, name: &str) -> RegistryResult<ServiceDescriptor> {
        self.select(name, None, None).await
    }

    /// One healthy instance of `name` chosen by `strategy`
    ///
    /// Without a key, the hash strategy hashes the service name.
    pub async fn select_healthy_with(
        &self,
        name: &str,
        strategy: &str,
        key: Option<&str>,
    ) -> RegistryResult<ServiceDescriptor> {
        self.select(name, Some(strategy), key).await
    }

    async fn select(
        &self,
        name: &str,
        strategy: Option<&str>,
        key: Option<&str>,
    ) -> RegistryResult<ServiceDescriptor> {
        let strategy_name = strategy.unwrap_or_else(|| self.balancer.default_strategy());
        // Reject unknown strategies before touching the backend.
        self.balancer.strategy_for(name, strategy_name)?;

        let view = self.view(name).await?;
        let healthy = view.healthy();
        if healthy.is_empty() {
            counter!("registry_no_healthy_instance_total").increment(1);
            debug!(
                service_name = %name,
                instances = view.len(),
                "No healthy instance available"
            );
            return Err(RegistryError::no_healthy_instance(name));
        }

        self.balancer
            .select(name, &healthy, Some(strategy_name), Some(key.unwrap_or(name)))
    }

    /// Report that a connection to a selected instance finished
    pub fn release(&self, name: &str, id: &str) {
        self.balancer.release(name, id);
    }

    pub fn set_weight(&self, name: &str, id: &str, weight: i64) -> RegistryResult<()> {
        self.balancer.set_weight(name, id, weight)
    }

    pub fn get_weight(&self, id: &str) -> u32 {
        self.balancer.get_weight(id)
    }

    /// Health of an instance
    ///
    /// Tracked instances report the supervisor's status; untracked instances still in
    /// the backend are `pending`; anything else is `unknown`.
    pub async fn health_of(&self, id: &str) -> HealthStatus {
        if let Some(status) = self.supervisor.get_status(id) {
            return status;
        }
        match self.backend.get_service(id).await {
            Ok(_) => HealthStatus::pending(),
            Err(_) => HealthStatus::unknown(),
        }
    }

    pub fn health_summary(&self) -> HealthSummary {
        self.supervisor.summary()
    }

    pub async fn stats(&self) -> RegistryResult<RegistryStats> {
        let descriptors = self.backend.list_all().await?;
        let services: BTreeSet<&str> = descriptors.iter().map(|d| d.name.as_str()).collect();

        let mut stats = RegistryStats {
            backend: self.backend.backend_name().to_string(),
            total_services: services.len(),
            total_instances: descriptors.len(),
            healthy_instances: 0,
            unhealthy_instances: 0,
        };
        for descriptor in &descriptors {
            match self.supervisor.get_status(&descriptor.id).map(|s| s.status) {
                Some(HealthState::Healthy) => stats.healthy_instances += 1,
                Some(HealthState::Unhealthy) => stats.unhealthy_instances += 1,
                _ => {}
            }
        }
        Ok(stats)
    }
}
