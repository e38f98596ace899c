// Log configuration
pub mod config;

// Structured logging
pub mod logging;

// Health supervision of registered instances
pub mod health;

pub use config::{LogConfig, LogFormat};
pub use health::{CycleReport, HealthProbe, HealthSupervisor, HttpHealthProbe};
pub use logging::init_logging;
