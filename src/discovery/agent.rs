//! # External Discovery Agent Backend
//!
//! Translates registry operations into calls against a discovery agent's HTTP API:
//!
//! - `PUT /v1/agent/service/register` with the descriptor and its check settings
//! - `PUT /v1/agent/service/deregister/{id}`
//! - `GET /v1/health/service/{name}?passing=true`
//! - `GET /v1/agent/services`
//!
//! Every call is bounded by `request_timeout`; timeouts, transport failures and
//! non-2xx answers surface as [`RegistryError::BackendUnavailable`]. Successful
//! discovery results are cached per key; while an entry is younger than `cache_ttl` it
//! is served when the agent fails, and the fallback is logged with `stale = true`.
//! Health probing is never delegated to the agent.

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::{Client as HttpClient, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::{AgentConfig, SupervisorConfig};
use crate::core::error::{RegistryError, RegistryResult};
use crate::core::types::{ServiceDescriptor, DEFAULT_HEALTH_PATH};
use crate::discovery::backend::{sort_by_id, RegistryBackend, WatchCallback, WatchHandle};
use crate::registration::validation::validate_descriptor;

const CATALOG_CACHE_KEY: &str = "catalog";

/// Registration body sent to the agent
#[derive(Debug, Clone, Serialize)]
struct AgentRegistration<'a> {
    id: &'a str,
    name: &'a str,
    address: &'a str,
    port: u16,
    tags: &'a [String],
    meta: &'a HashMap<String, String>,
    check: AgentCheck,
}

/// Agent-side check settings; the agent's own verdict is never consulted
#[derive(Debug, Clone, Serialize)]
struct AgentCheck {
    http: String,
    interval: String,
    timeout: String,
    deregister_after: String,
}

/// Service record as returned by the agent
#[derive(Debug, Clone, Deserialize)]
struct AgentService {
    #[serde(alias = "ID")]
    id: String,
    #[serde(alias = "Service")]
    name: String,
    #[serde(alias = "Address")]
    address: String,
    #[serde(alias = "Port")]
    port: u16,
    #[serde(default, alias = "Tags")]
    tags: Option<Vec<String>>,
    #[serde(default, alias = "Meta")]
    meta: Option<HashMap<String, String>>,
}

/// One entry of the health endpoint; the agent's `checks` are not consulted
#[derive(Debug, Clone, Deserialize)]
struct AgentHealthEntry {
    #[serde(alias = "Service")]
    service: AgentService,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    descriptors: Vec<ServiceDescriptor>,
    fetched_at: Instant,
}

/// Snapshot of one discovery cache entry
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub key: String,
    pub instances: usize,
    pub age_millis: u64,
    /// Whether the entry may still be served on agent failure
    pub fresh: bool,
}

/// Registry backend delegating storage to an external discovery agent
pub struct ExternalAgentBackend {
    inner: Arc<AgentInner>,
}

struct AgentInner {
    client: HttpClient,
    config: AgentConfig,
    base_url: String,
    check: CheckSettings,
    /// Descriptors registered through this process, keyed by id
    local: DashMap<String, ServiceDescriptor>,
    cache: DashMap<String, CacheEntry>,
}

#[derive(Debug, Clone)]
struct CheckSettings {
    scheme: String,
    interval: Duration,
    timeout: Duration,
    deregister_after: Duration,
}

impl ExternalAgentBackend {
    pub fn new(config: AgentConfig, supervisor: SupervisorConfig) -> RegistryResult<Self> {
        let client = HttpClient::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| RegistryError::config(format!("failed to build agent client: {}", e)))?;

        let base_url = config.base_url();
        info!(
            agent = %base_url,
            timeout_ms = config.request_timeout.as_millis() as u64,
            cache_ttl_ms = config.cache_ttl.as_millis() as u64,
            "Created discovery agent backend"
        );

        Ok(Self {
            inner: Arc::new(AgentInner {
                client,
                base_url,
                check: CheckSettings {
                    scheme: supervisor.probe_scheme,
                    interval: supervisor.probe_interval,
                    timeout: supervisor.probe_timeout,
                    deregister_after: supervisor.evict_after,
                },
                config,
                local: DashMap::new(),
                cache: DashMap::new(),
            }),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    /// Drop every cached discovery result
    pub fn clear_cache(&self) {
        self.inner.cache.clear();
        debug!("Cleared discovery agent cache");
    }

    /// Age and size of every cached discovery result, ordered by key
    pub fn cache_status(&self) -> Vec<CacheStatus> {
        let ttl = self.inner.config.cache_ttl;
        let mut status: Vec<CacheStatus> = self
            .inner
            .cache
            .iter()
            .map(|entry| {
                let age = entry.value().fetched_at.elapsed();
                CacheStatus {
                    key: entry.key().clone(),
                    instances: entry.value().descriptors.len(),
                    age_millis: age.as_millis() as u64,
                    fresh: age < ttl,
                }
            })
            .collect();
        status.sort_by(|a, b| a.key.cmp(&b.key));
        status
    }
}

impl AgentInner {
    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut request = self.client.request(method, format!("{}{}", self.base_url, path));
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }
        request
    }

    async fn send(&self, request: RequestBuilder, operation: &str) -> RegistryResult<Response> {
        request.send().await.map_err(|e| {
            let reason = if e.is_timeout() {
                format!("{} timed out after {:?}", operation, self.config.request_timeout)
            } else {
                format!("{} failed: {}", operation, e)
            };
            RegistryError::backend_unavailable(reason)
        })
    }

    async fn ensure_success(response: Response, operation: &str) -> RegistryResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(RegistryError::backend_unavailable(format!(
            "{} returned HTTP {}: {}",
            operation,
            status.as_u16(),
            body.trim()
        )))
    }

    fn cache_key(name: &str) -> String {
        format!("service:{}", name)
    }

    fn invalidate(&self, name: &str) {
        self.cache.remove(&Self::cache_key(name));
        self.cache.remove(CATALOG_CACHE_KEY);
    }

    fn to_descriptor(&self, service: AgentService) -> ServiceDescriptor {
        let local = self.local.get(&service.id);
        let health_path = local
            .as_ref()
            .map(|d| d.health_path.clone())
            .unwrap_or_else(|| DEFAULT_HEALTH_PATH.to_string());
        let registered_at = local.as_ref().and_then(|d| d.registered_at);
        drop(local);

        let mut descriptor =
            ServiceDescriptor::new(service.id, service.name, service.address, service.port)
                .with_tags(service.tags.unwrap_or_default())
                .with_health_path(health_path);
        descriptor.metadata = service.meta.unwrap_or_default();
        descriptor.registered_at = registered_at;
        descriptor
    }

    /// Run `fetch`; on agent failure serve a cache entry younger than the TTL
    async fn cached<F, Fut>(&self, key: &str, fetch: F) -> RegistryResult<Vec<ServiceDescriptor>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RegistryResult<Vec<ServiceDescriptor>>>,
    {
        match fetch().await {
            Ok(descriptors) => {
                self.cache.insert(
                    key.to_string(),
                    CacheEntry {
                        descriptors: descriptors.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                Ok(descriptors)
            }
            Err(err @ RegistryError::BackendUnavailable { .. }) => {
                if let Some(entry) = self.cache.get(key) {
                    let age = entry.fetched_at.elapsed();
                    if age < self.config.cache_ttl {
                        warn!(
                            cache_key = %key,
                            stale = true,
                            age_ms = age.as_millis() as u64,
                            error = %err,
                            "Discovery agent unavailable, serving cached result"
                        );
                        metrics::counter!("registry_agent_stale_reads_total").increment(1);
                        return Ok(entry.descriptors.clone());
                    }
                }
                metrics::counter!("registry_agent_failures_total").increment(1);
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    async fn fetch_catalog(&self) -> RegistryResult<Vec<ServiceDescriptor>> {
        let response = self
            .send(self.request(Method::GET, "/v1/agent/services"), "list services")
            .await?;
        let response = Self::ensure_success(response, "list services").await?;
        let services: HashMap<String, AgentService> = response.json().await.map_err(|e| {
            RegistryError::backend_unavailable(format!("invalid service list: {}", e))
        })?;

        let mut descriptors: Vec<ServiceDescriptor> = services
            .into_values()
            .map(|service| self.to_descriptor(service))
            .collect();
        sort_by_id(&mut descriptors);
        Ok(descriptors)
    }

    async fn fetch_service(&self, name: &str) -> RegistryResult<Vec<ServiceDescriptor>> {
        let mut path = format!("/v1/health/service/{}", urlencoding::encode(name));
        if self.config.passing_only {
            path.push_str("?passing=true");
        }

        let operation = format!("discover {}", name);
        let response = self.send(self.request(Method::GET, &path), &operation).await?;
        let response = Self::ensure_success(response, &operation).await?;
        let entries: Vec<AgentHealthEntry> = response.json().await.map_err(|e| {
            RegistryError::backend_unavailable(format!("invalid health listing: {}", e))
        })?;

        let mut descriptors: Vec<ServiceDescriptor> = entries
            .into_iter()
            .map(|entry| self.to_descriptor(entry.service))
            .filter(|descriptor| descriptor.name == name)
            .collect();
        sort_by_id(&mut descriptors);
        Ok(descriptors)
    }

    async fn list_all(&self) -> RegistryResult<Vec<ServiceDescriptor>> {
        self.cached(CATALOG_CACHE_KEY, || self.fetch_catalog()).await
    }

    async fn discover(&self, name: &str) -> RegistryResult<Vec<ServiceDescriptor>> {
        self.cached(&Self::cache_key(name), || self.fetch_service(name))
            .await
    }

    async fn register(&self, mut descriptor: ServiceDescriptor) -> RegistryResult<()> {
        validate_descriptor(&descriptor)?;

        // Reserve the id locally so concurrent registrations from this process race here.
        match self.local.entry(descriptor.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(RegistryError::DuplicateId { id: descriptor.id });
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                descriptor.registered_at = Some(chrono::Utc::now());
                slot.insert(descriptor.clone());
            }
        }

        if let Err(err) = self.put_registration(&descriptor).await {
            self.local.remove(&descriptor.id);
            return Err(err);
        }

        self.invalidate(&descriptor.name);
        metrics::counter!("registry_registrations_total", "backend" => "external").increment(1);
        info!(
            service_id = %descriptor.id,
            service_name = %descriptor.name,
            agent = %self.base_url,
            "Registered service instance with discovery agent"
        );
        Ok(())
    }

    async fn put_registration(&self, descriptor: &ServiceDescriptor) -> RegistryResult<()> {
        let existing = self.fetch_catalog().await?;
        if existing.iter().any(|d| d.id == descriptor.id) {
            return Err(RegistryError::DuplicateId {
                id: descriptor.id.clone(),
            });
        }

        let body = AgentRegistration {
            id: &descriptor.id,
            name: &descriptor.name,
            address: &descriptor.address,
            port: descriptor.port,
            tags: &descriptor.tags,
            meta: &descriptor.metadata,
            check: AgentCheck {
                http: descriptor.health_url(&self.check.scheme),
                interval: humantime::format_duration(self.check.interval).to_string(),
                timeout: humantime::format_duration(self.check.timeout).to_string(),
                deregister_after: humantime::format_duration(self.check.deregister_after)
                    .to_string(),
            },
        };

        let response = self
            .send(
                self.request(Method::PUT, "/v1/agent/service/register").json(&body),
                "register",
            )
            .await?;
        Self::ensure_success(response, "register").await?;
        Ok(())
    }

    async fn deregister(&self, id: &str) -> RegistryResult<()> {
        let path = format!("/v1/agent/service/deregister/{}", urlencoding::encode(id));
        let response = self
            .send(self.request(Method::PUT, &path), "deregister")
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            self.local.remove(id);
            return Err(RegistryError::not_found(format!("service id {}", id)));
        }
        Self::ensure_success(response, "deregister").await?;

        match self.local.remove(id) {
            Some((_, descriptor)) => self.invalidate(&descriptor.name),
            None => self.cache.clear(),
        }

        metrics::counter!("registry_deregistrations_total", "backend" => "external").increment(1);
        info!(service_id = %id, agent = %self.base_url, "Deregistered service instance from discovery agent");
        Ok(())
    }
}

/// Identity of a discovered set used to decide whether watchers fire
fn membership(descriptors: &[ServiceDescriptor]) -> Vec<(String, String, u16)> {
    descriptors
        .iter()
        .map(|d| (d.id.clone(), d.address.clone(), d.port))
        .collect()
}

#[async_trait]
impl RegistryBackend for ExternalAgentBackend {
    async fn register(&self, descriptor: ServiceDescriptor) -> RegistryResult<()> {
        self.inner.register(descriptor).await
    }

    async fn deregister(&self, id: &str) -> RegistryResult<()> {
        self.inner.deregister(id).await
    }

    async fn get_service(&self, id: &str) -> RegistryResult<ServiceDescriptor> {
        self.inner
            .list_all()
            .await?
            .into_iter()
            .find(|descriptor| descriptor.id == id)
            .ok_or_else(|| RegistryError::not_found(format!("service id {}", id)))
    }

    async fn discover(&self, name: &str) -> RegistryResult<Vec<ServiceDescriptor>> {
        self.inner.discover(name).await
    }

    async fn list_all(&self) -> RegistryResult<Vec<ServiceDescriptor>> {
        self.inner.list_all().await
    }

    async fn watch(&self, name: &str, callback: WatchCallback) -> RegistryResult<WatchHandle> {
        let initial = self.inner.discover(name).await?;
        let mut last = membership(&initial);
        callback(initial);

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let inner = self.inner.clone();
        let name = name.to_string();
        let period = inner.config.watch_interval;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => break,
                    _ = tokio::time::sleep(period) => {
                        match inner.discover(&name).await {
                            Ok(current) => {
                                let current_membership = membership(&current);
                                if current_membership != last && !cancelled.is_cancelled() {
                                    last = current_membership;
                                    callback(current);
                                }
                            }
                            Err(e) => {
                                warn!(service_name = %name, error = %e, "Watch poll failed");
                            }
                        }
                    }
                }
            }
            debug!(service_name = %name, "Agent watch stopped");
        });

        Ok(WatchHandle::new(token))
    }

    fn backend_name(&self) -> &'static str {
        "external"
    }
}
