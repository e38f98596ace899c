pub mod agent;
pub mod backend;
pub mod global;
pub mod memory;
pub mod registry;

pub use agent::{CacheStatus, ExternalAgentBackend};
pub use backend::{create_backend, RegistryBackend, WatchCallback, WatchHandle};
pub use global::{global, init_global, shutdown_global};
pub use memory::InMemoryBackend;
pub use registry::{RegistryStats, ServiceRegistry};
