//! In-process registry backend.
//!
//! Descriptors live in one map keyed by id behind a readers-writer lock. Reads clone
//! out of the map so callers never alias stored descriptors. A version channel bumps
//! on every write and drives [`RegistryBackend::watch`] subscriptions.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::error::{RegistryError, RegistryResult};
use crate::core::types::ServiceDescriptor;
use crate::discovery::backend::{sort_by_id, RegistryBackend, WatchCallback, WatchHandle};
use crate::registration::validation::validate_descriptor;

type DescriptorMap = Arc<RwLock<HashMap<String, ServiceDescriptor>>>;

/// Volatile registry kept in process memory
pub struct InMemoryBackend {
    services: DescriptorMap,
    version: watch::Sender<u64>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            services: Arc::new(RwLock::new(HashMap::new())),
            version,
        }
    }

    /// Number of stored descriptors
    pub fn len(&self) -> usize {
        self.services.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.read().is_empty()
    }

    fn bump_version(&self) {
        self.version.send_modify(|version| *version += 1);
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn snapshot(services: &DescriptorMap, name: Option<&str>) -> Vec<ServiceDescriptor> {
    let mut result: Vec<ServiceDescriptor> = services
        .read()
        .values()
        .filter(|descriptor| name.map_or(true, |name| descriptor.name == name))
        .cloned()
        .collect();
    sort_by_id(&mut result);
    result
}

#[async_trait]
impl RegistryBackend for InMemoryBackend {
    async fn register(&self, mut descriptor: ServiceDescriptor) -> RegistryResult<()> {
        validate_descriptor(&descriptor)?;

        {
            let mut services = self.services.write();
            if services.contains_key(&descriptor.id) {
                return Err(RegistryError::DuplicateId {
                    id: descriptor.id,
                });
            }
            descriptor.registered_at = Some(Utc::now());
            services.insert(descriptor.id.clone(), descriptor.clone());
        }
        self.bump_version();

        metrics::counter!("registry_registrations_total", "backend" => "in-memory").increment(1);
        info!(
            service_id = %descriptor.id,
            service_name = %descriptor.name,
            address = %descriptor.address,
            port = descriptor.port,
            "Registered service instance"
        );
        Ok(())
    }

    async fn deregister(&self, id: &str) -> RegistryResult<()> {
        let removed = self.services.write().remove(id);

        match removed {
            Some(descriptor) => {
                self.bump_version();
                metrics::counter!("registry_deregistrations_total", "backend" => "in-memory")
                    .increment(1);
                info!(
                    service_id = %id,
                    service_name = %descriptor.name,
                    "Deregistered service instance"
                );
                Ok(())
            }
            None => Err(RegistryError::not_found(format!("service id {}", id))),
        }
    }

    async fn get_service(&self, id: &str) -> RegistryResult<ServiceDescriptor> {
        self.services
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::not_found(format!("service id {}", id)))
    }

    async fn discover(&self, name: &str) -> RegistryResult<Vec<ServiceDescriptor>> {
        Ok(snapshot(&self.services, Some(name)))
    }

    async fn list_all(&self) -> RegistryResult<Vec<ServiceDescriptor>> {
        Ok(snapshot(&self.services, None))
    }

    async fn watch(&self, name: &str, callback: WatchCallback) -> RegistryResult<WatchHandle> {
        // Subscribe before the first snapshot so no write slips between them.
        let mut changes = self.version.subscribe();
        let services = self.services.clone();
        let name = name.to_string();

        let mut last = snapshot(&services, Some(&name));
        callback(last.clone());

        let token = CancellationToken::new();
        let cancelled = token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let current = snapshot(&services, Some(&name));
                        if current != last {
                            callback(current.clone());
                            last = current;
                        }
                    }
                }
            }
            debug!(service_name = %name, "Watch subscription stopped");
        });

        Ok(WatchHandle::new(token))
    }

    fn backend_name(&self) -> &'static str {
        "in-memory"
    }
}
