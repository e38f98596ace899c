//! # Core Types
//!
//! Data model shared by the backends, the health supervisor and the load balancer:
//! the [`ServiceDescriptor`] that callers register, the per-instance [`HealthStatus`]
//! maintained by the supervisor, and the [`RegistryView`] snapshot that selection runs
//! against.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;

/// Health path probed when a descriptor does not declare one
pub const DEFAULT_HEALTH_PATH: &str = "/health";

/// Description of one registered service instance
///
/// `id` is immutable once registered. `registered_at` is stamped by the backend on
/// `register`; whatever the caller puts there is overwritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Unique instance identifier, `{name}-{instance-token}`
    pub id: String,

    /// Canonical service name, e.g. `user-service`
    pub name: String,

    /// Reachable host name or IP
    pub address: String,

    /// TCP port
    pub port: u16,

    /// Ordered tags; must contain `service_type:<T>` and `version:<v>`
    pub tags: Vec<String>,

    /// Metadata; must contain `version`, `type` and `environment`
    #[serde(rename = "meta")]
    pub metadata: HashMap<String, String>,

    /// Path probed by the health supervisor
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Registration timestamp, set by the registry
    #[serde(default)]
    pub registered_at: Option<DateTime<Utc>>,
}

fn default_health_path() -> String {
    DEFAULT_HEALTH_PATH.to_string()
}

impl ServiceDescriptor {
    /// Create a descriptor with no tags, no metadata and the default health path
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        address: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address: address.into(),
            port,
            tags: Vec::new(),
            metadata: HashMap::new(),
            health_path: default_health_path(),
            registered_at: None,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata<I, K, V>(mut self, metadata: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.metadata = metadata
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }

    pub fn with_health_path(mut self, path: impl Into<String>) -> Self {
        self.health_path = path.into();
        self
    }

    /// Value of the first `prefix:value` tag
    pub fn tag_value(&self, prefix: &str) -> Option<&str> {
        self.tags.iter().find_map(|tag| {
            tag.strip_prefix(prefix)
                .and_then(|rest| rest.strip_prefix(':'))
        })
    }

    /// `scheme://address:port`, the base an embedder forwards requests to
    ///
    /// IPv6 literals are bracketed, `::1` becomes `[::1]`.
    pub fn base_url(&self, scheme: &str) -> String {
        format!("{}://{}:{}", scheme, self.url_host(), self.port)
    }

    /// Address in the form it takes inside a URL authority
    pub fn url_host(&self) -> Cow<'_, str> {
        if self.address.parse::<Ipv6Addr>().is_ok() {
            Cow::Owned(format!("[{}]", self.address))
        } else {
            Cow::Borrowed(&self.address)
        }
    }

    /// Full URL of the health endpoint
    pub fn health_url(&self, scheme: &str) -> String {
        format!("{}{}", self.base_url(scheme), self.health_path)
    }
}

/// Classification of an instance by the health supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Registered, no threshold reached yet
    Pending,
    /// Passing probes
    Healthy,
    /// Failing probes past the unhealthy threshold
    Unhealthy,
    /// In transition between a settled state and its opposite, or not tracked
    Unknown,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health record of one instance
///
/// Invariants kept by the supervisor:
/// - `Healthy` implies an empty `last_error` and zero `consecutive_failures`.
/// - `Unhealthy` implies a non-empty `last_error` and `consecutive_failures >= 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: HealthState,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_response_millis: u64,
    pub last_error: String,
    pub consecutive_failures: u32,
}

impl HealthStatus {
    /// Status of a freshly registered instance
    pub fn pending() -> Self {
        Self::with_state(HealthState::Pending)
    }

    /// Status reported for instances the supervisor does not track
    pub fn unknown() -> Self {
        Self::with_state(HealthState::Unknown)
    }

    fn with_state(status: HealthState) -> Self {
        Self {
            status,
            last_checked_at: None,
            last_response_millis: 0,
            last_error: String::new(),
            consecutive_failures: 0,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthState::Healthy
    }
}

/// Aggregate counts over all tracked instances
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    /// Pending instances are counted here as well
    pub unknown: usize,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

/// Immutable snapshot of descriptors paired with their health
///
/// Selection runs against one view so a single call never sees a half-updated set.
#[derive(Debug, Clone, Default)]
pub struct RegistryView {
    entries: Vec<(ServiceDescriptor, HealthStatus)>,
    taken_at: Option<DateTime<Utc>>,
}

impl RegistryView {
    /// Build a view; entries are ordered by id
    pub fn new(mut entries: Vec<(ServiceDescriptor, HealthStatus)>) -> Self {
        entries.sort_by(|a, b| a.0.id.cmp(&b.0.id));
        Self {
            entries,
            taken_at: Some(Utc::now()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn taken_at(&self) -> Option<DateTime<Utc>> {
        self.taken_at
    }

    pub fn iter(&self) -> impl Iterator<Item = &(ServiceDescriptor, HealthStatus)> {
        self.entries.iter()
    }

    /// Descriptors whose status is healthy, in id order
    pub fn healthy(&self) -> Vec<ServiceDescriptor> {
        self.entries
            .iter()
            .filter(|(_, health)| health.is_healthy())
            .map(|(descriptor, _)| descriptor.clone())
            .collect()
    }
}

/// Accepted values of the `type` metadata key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceType {
    ApiGateway,
    Microservice,
    Database,
    Cache,
    Queue,
}

impl ServiceType {
    pub const ALL: [ServiceType; 5] = [
        Self::ApiGateway,
        Self::Microservice,
        Self::Database,
        Self::Cache,
        Self::Queue,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApiGateway => "api-gateway",
            Self::Microservice => "microservice",
            Self::Database => "database",
            Self::Cache => "cache",
            Self::Queue => "queue",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

/// Accepted values of the `environment` metadata key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    pub const ALL: [Environment; 3] = [Self::Development, Self::Staging, Self::Production];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}
