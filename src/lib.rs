//! # Service Registry Library
//!
//! Service registry and health supervision for the platform's microservices. Services
//! register a descriptor under a canonical name, a background supervisor probes each
//! instance, and callers ask for a healthy instance of a service by name, chosen by a
//! pluggable load balancing strategy.
//!
//! ## Module Layout
//!
//! - `core`: error taxonomy, configuration and the shared data model
//! - `registration`: naming rules, validation and descriptor builders per role
//! - `discovery`: registry backends (in-memory, external agent), the query facade and
//!   the process-wide registry
//! - `load_balancing`: selection strategies and the per-service manager
//! - `observability`: structured logging and the health supervisor
//! - `gateway`: HTTP endpoints of the gateway host process

/// Error types, configuration and the shared data model
pub mod core;

/// Naming rules and descriptor builders
pub mod registration;

/// Registry backends and the discovery surface
pub mod discovery;

/// Selection strategies over healthy instances
pub mod load_balancing;

/// Logging and health supervision
pub mod observability;

/// HTTP endpoints of the gateway host
pub mod gateway;

pub use core::config::RegistryConfig;
pub use core::error::{ProbeError, RegistryError, RegistryResult, ValidationError};
pub use core::types::{
    Environment, HealthState, HealthStatus, HealthSummary, RegistryView, ServiceDescriptor,
    ServiceType,
};
pub use discovery::{
    global, init_global, shutdown_global, InMemoryBackend, RegistryBackend, ServiceRegistry,
    WatchHandle,
};
pub use gateway::server::{GatewayServer, ServerState};
pub use observability::health::HealthSupervisor;
pub use registration::registrar::{Registrar, ServiceRole};
