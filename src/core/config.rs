//! # Configuration Module
//!
//! Configuration for the registry, the health supervisor, the load balancer and the
//! registrar helpers.
//!
//! ## Key Features
//! - YAML configuration parsing with serde, durations written as `10s`, `250ms`
//! - Environment variable overrides for every documented variable
//! - Validation with descriptive errors; misconfiguration is a startup error

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::core::error::{RegistryError, RegistryResult};
use crate::core::types::Environment;
use crate::load_balancing::strategies::normalize_strategy_name;
use crate::observability::config::LogConfig;
use crate::registration::validation::validate_version;

/// Complete registry configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Which backend stores descriptors
    pub backend: BackendConfig,

    /// Health supervisor cadence and thresholds
    pub supervisor: SupervisorConfig,

    /// Default strategy and weights
    pub load_balancing: LoadBalancingConfig,

    /// Process-wide identity used by the registrar helpers
    pub service: ServiceConfig,

    /// Log level and format
    pub logging: LogConfig,
}

/// Registry backend variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    #[default]
    InMemory,
    External,
}

impl std::str::FromStr for BackendKind {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in-memory" | "in_memory" | "memory" => Ok(Self::InMemory),
            "external" => Ok(Self::External),
            other => Err(RegistryError::config(format!(
                "Invalid REGISTRY_BACKEND '{}', expected in-memory or external",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub agent: AgentConfig,
}

/// Discovery agent scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentScheme {
    #[default]
    Http,
    Https,
}

impl AgentScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

impl std::str::FromStr for AgentScheme {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            other => Err(RegistryError::config(format!(
                "Invalid DISCOVERY_SCHEME '{}', expected http or https",
                other
            ))),
        }
    }
}

/// Settings of the external discovery agent backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// `host:port` of the agent
    pub address: String,

    pub scheme: AgentScheme,

    /// Optional token sent as a bearer credential
    pub token: Option<String>,

    /// Bound on every agent call
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// How long a successful discovery result may be served after the agent fails
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,

    /// Poll period of agent-side watches
    #[serde(with = "humantime_serde")]
    pub watch_interval: Duration,

    /// Ask the agent for passing instances only
    pub passing_only: bool,
}

impl AgentConfig {
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme.as_str(), self.address)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            address: "localhost:8500".to_string(),
            scheme: AgentScheme::Http,
            token: None,
            request_timeout: Duration::from_secs(3),
            cache_ttl: Duration::from_secs(5),
            watch_interval: Duration::from_secs(10),
            passing_only: true,
        }
    }
}

/// Health supervisor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    #[serde(with = "humantime_serde")]
    pub probe_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,

    /// Consecutive failures before an instance is marked unhealthy
    pub unhealthy_threshold: u32,

    /// Consecutive successes before an instance is marked healthy
    pub healthy_threshold: u32,

    /// Sustained unhealthy time before the instance is deregistered
    #[serde(with = "humantime_serde")]
    pub evict_after: Duration,

    /// Upper bound of concurrent probes per cycle
    pub max_concurrency: usize,

    /// Scheme used to build probe URLs
    pub probe_scheme: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(3),
            unhealthy_threshold: 3,
            healthy_threshold: 1,
            evict_after: Duration::from_secs(30),
            max_concurrency: 32,
            probe_scheme: "http".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancingConfig {
    /// Strategy used by `select_healthy`
    pub default_strategy: String,

    /// Weighted round-robin weights keyed by service id
    pub weights: HashMap<String, u32>,
}

impl Default for LoadBalancingConfig {
    fn default() -> Self {
        Self {
            default_strategy: "round_robin".to_string(),
            weights: HashMap::new(),
        }
    }
}

/// Identity of the hosting process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub environment: Environment,

    pub version: String,

    /// Host name used in instance tokens
    pub hostname: String,

    /// Address other processes reach this one at
    pub address: String,

    /// Scheme used when forming outbound URLs from selected descriptors
    pub scheme: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            version: "v1.0.0".to_string(),
            hostname: "localhost".to_string(),
            address: "127.0.0.1".to_string(),
            scheme: "http".to_string(),
        }
    }
}

impl RegistryConfig {
    /// Defaults plus environment overrides
    pub fn from_env() -> RegistryResult<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file, then apply environment overrides
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> RegistryResult<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let mut config: RegistryConfig = serde_yaml::from_str(&content)?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> RegistryResult<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    ///
    /// `REGISTRY_BACKEND` wins; without it, a set `DISCOVERY_ADDR` selects the external
    /// backend.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> RegistryResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(addr) = lookup("DISCOVERY_ADDR") {
            self.backend.agent.address = addr;
            self.backend.kind = BackendKind::External;
        }

        if let Some(kind) = lookup("REGISTRY_BACKEND") {
            self.backend.kind = kind.parse()?;
        }

        if let Some(token) = lookup("DISCOVERY_TOKEN") {
            self.backend.agent.token = Some(token);
        }

        if let Some(scheme) = lookup("DISCOVERY_SCHEME") {
            self.backend.agent.scheme = scheme.parse()?;
        }

        if let Some(environment) = lookup("ENVIRONMENT") {
            self.service.environment = environment.parse().map_err(|value| {
                RegistryError::config(format!(
                    "Invalid ENVIRONMENT '{}', expected development, staging or production",
                    value
                ))
            })?;
        }

        if let Some(version) = lookup("VERSION") {
            self.service.version = version;
        }

        if let Some(hostname) = lookup("HOSTNAME") {
            self.service.hostname = hostname;
        }

        if let Some(address) = lookup("SERVICE_ADDRESS") {
            self.service.address = address;
        }

        if let Some(strategy) = lookup("REGISTRY_DEFAULT_STRATEGY") {
            self.load_balancing.default_strategy = strategy;
        }

        if let Some(interval) = lookup("REGISTRY_PROBE_INTERVAL") {
            self.supervisor.probe_interval = parse_duration("REGISTRY_PROBE_INTERVAL", &interval)?;
        }

        if let Some(timeout) = lookup("REGISTRY_PROBE_TIMEOUT") {
            self.supervisor.probe_timeout = parse_duration("REGISTRY_PROBE_TIMEOUT", &timeout)?;
        }

        if let Some(evict) = lookup("REGISTRY_EVICT_AFTER") {
            self.supervisor.evict_after = parse_duration("REGISTRY_EVICT_AFTER", &evict)?;
        }

        if let Some(level) = lookup("REGISTRY_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Some(format) = lookup("REGISTRY_LOG_FORMAT") {
            self.logging.format = format.parse().map_err(RegistryError::config)?;
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> RegistryResult<()> {
        let supervisor = &self.supervisor;

        if supervisor.probe_interval.is_zero() {
            return Err(RegistryError::config("probe_interval must be positive"));
        }
        if supervisor.probe_timeout.is_zero() {
            return Err(RegistryError::config("probe_timeout must be positive"));
        }
        if supervisor.unhealthy_threshold == 0 {
            return Err(RegistryError::config("unhealthy_threshold must be at least 1"));
        }
        if supervisor.healthy_threshold == 0 {
            return Err(RegistryError::config("healthy_threshold must be at least 1"));
        }
        if supervisor.max_concurrency == 0 {
            return Err(RegistryError::config("max_concurrency must be at least 1"));
        }
        if supervisor.probe_scheme != "http" && supervisor.probe_scheme != "https" {
            return Err(RegistryError::config(format!(
                "probe_scheme must be http or https, got '{}'",
                supervisor.probe_scheme
            )));
        }

        if self.backend.kind == BackendKind::External {
            let agent = &self.backend.agent;
            if agent.address.trim().is_empty() {
                return Err(RegistryError::config("discovery agent address is empty"));
            }
            if agent.request_timeout.is_zero() {
                return Err(RegistryError::config("agent request_timeout must be positive"));
            }
            url::Url::parse(&agent.base_url()).map_err(|e| {
                RegistryError::config(format!("Invalid DISCOVERY_ADDR '{}': {}", agent.address, e))
            })?;
        }

        if self.service.scheme != "http" && self.service.scheme != "https" {
            return Err(RegistryError::config(format!(
                "service scheme must be http or https, got '{}'",
                self.service.scheme
            )));
        }

        validate_version(&self.service.version)
            .map_err(|e| RegistryError::config(format!("Invalid VERSION: {}", e)))?;

        if normalize_strategy_name(&self.load_balancing.default_strategy).is_none() {
            return Err(RegistryError::InvalidStrategy {
                name: self.load_balancing.default_strategy.clone(),
            });
        }

        if let Some((id, weight)) = self.load_balancing.weights.iter().find(|(_, w)| **w == 0) {
            return Err(RegistryError::InvalidWeight {
                id: id.clone(),
                weight: i64::from(*weight),
            });
        }

        Ok(())
    }
}

fn parse_duration(key: &str, value: &str) -> RegistryResult<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| RegistryError::config(format!("Invalid {}: {}", key, e)))
}
