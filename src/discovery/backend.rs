//! # Registry Backend Contract
//!
//! Every backend (the in-process map and the external discovery agent) implements
//! [`RegistryBackend`], so callers never see backend-specific fields.
//!
//! Ordering: `discover` and `list_all` return descriptors sorted by `id` ascending.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::core::config::{BackendConfig, BackendKind, SupervisorConfig};
use crate::core::error::RegistryResult;
use crate::core::types::ServiceDescriptor;
use crate::discovery::agent::ExternalAgentBackend;
use crate::discovery::memory::InMemoryBackend;

/// Callback invoked with the full, id-ordered set of instances of a watched name
pub type WatchCallback = Arc<dyn Fn(Vec<ServiceDescriptor>) + Send + Sync>;

/// Registry backend trait that all storage variants implement
#[async_trait]
pub trait RegistryBackend: Send + Sync {
    /// Validate and store a descriptor; the backend stamps `registered_at`
    async fn register(&self, descriptor: ServiceDescriptor) -> RegistryResult<()>;

    /// Remove a descriptor by id
    async fn deregister(&self, id: &str) -> RegistryResult<()>;

    /// Fetch one descriptor by id
    async fn get_service(&self, id: &str) -> RegistryResult<ServiceDescriptor>;

    /// All descriptors with the given name, ordered by id
    async fn discover(&self, name: &str) -> RegistryResult<Vec<ServiceDescriptor>>;

    /// Every descriptor, ordered by id
    async fn list_all(&self) -> RegistryResult<Vec<ServiceDescriptor>>;

    /// Subscribe to changes of the instance set of `name`
    ///
    /// The callback runs once with the current snapshot, then whenever the set
    /// changes. Rapid changes may be coalesced; the final state is always delivered.
    async fn watch(&self, name: &str, callback: WatchCallback) -> RegistryResult<WatchHandle>;

    /// Short backend label for logs
    fn backend_name(&self) -> &'static str;
}

/// Subscription handle returned by [`RegistryBackend::watch`]
///
/// Dropping the handle cancels the subscription.
#[derive(Debug)]
pub struct WatchHandle {
    token: CancellationToken,
}

impl WatchHandle {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Sort descriptors by id, the order every backend returns
pub(crate) fn sort_by_id(descriptors: &mut [ServiceDescriptor]) {
    descriptors.sort_by(|a, b| a.id.cmp(&b.id));
}

/// Build the backend selected by configuration
pub fn create_backend(
    config: &BackendConfig,
    supervisor: &SupervisorConfig,
) -> RegistryResult<Arc<dyn RegistryBackend>> {
    match config.kind {
        BackendKind::InMemory => Ok(Arc::new(InMemoryBackend::new())),
        BackendKind::External => {
            let backend = ExternalAgentBackend::new(config.agent.clone(), supervisor.clone())?;
            Ok(Arc::new(backend))
        }
    }
}
