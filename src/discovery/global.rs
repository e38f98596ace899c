//! Process-wide registry.
//!
//! Every caller in one process addresses the same logical registry. Initialization
//! and teardown are explicit startup and shutdown steps; nothing is created on first
//! use.

use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

use crate::core::error::{RegistryError, RegistryResult};
use crate::discovery::registry::ServiceRegistry;

static GLOBAL: RwLock<Option<Arc<ServiceRegistry>>> = parking_lot::const_rwlock(None);

/// Install the process-wide registry; fails if one is already installed
pub fn init_global(registry: Arc<ServiceRegistry>) -> RegistryResult<Arc<ServiceRegistry>> {
    let mut slot = GLOBAL.write();
    if slot.is_some() {
        return Err(RegistryError::AlreadyInitialized);
    }
    *slot = Some(Arc::clone(&registry));
    info!("Global service registry initialized");
    Ok(registry)
}

/// The process-wide registry, if initialized
pub fn global() -> Option<Arc<ServiceRegistry>> {
    GLOBAL.read().clone()
}

/// Stop supervision and uninstall the process-wide registry
///
/// Returns `false` when nothing was installed.
pub async fn shutdown_global() -> bool {
    let registry = GLOBAL.write().take();
    match registry {
        Some(registry) => {
            registry.shutdown().await;
            info!("Global service registry shut down");
            true
        }
        None => false,
    }
}
