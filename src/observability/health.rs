//! # Health Supervision
//!
//! The [`HealthSupervisor`] keeps a current [`HealthStatus`] for every registered
//! instance. Each cycle it snapshots `list_all()` from the backend, probes every
//! instance's health path concurrently (bounded by a worker pool of
//! `min(N, max_concurrency)`), records the outcome under that instance's own mutex and
//! evicts instances that stayed unhealthy for `evict_after`.
//!
//! ## State machine
//!
//! ```text
//! pending   --ok x healthy_threshold-->      healthy
//! pending   --fail x unhealthy_threshold-->  unhealthy
//! healthy   --fail-->                        unknown (suspect)
//! unknown   --fail x unhealthy_threshold-->  unhealthy
//! unhealthy --ok-->                          unknown (recovering)
//! unknown   --ok x healthy_threshold-->      healthy
//! unhealthy --sustained for evict_after-->   deregistered
//! ```
//!
//! `unknown` only appears between two settled states, so `healthy` always carries an
//! empty error with zero failures and `unhealthy` always carries a classified error.
//!
//! Probe failures never propagate: they are classified with [`ProbeError`], written
//! to `last_error`, and logged at warn level.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use metrics::{counter, gauge, histogram};
use parking_lot::{Mutex, RwLock};
use reqwest::Client as HttpClient;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::SupervisorConfig;
use crate::core::error::{ProbeError, RegistryError, RegistryResult};
use crate::core::types::{HealthState, HealthStatus, HealthSummary, ServiceDescriptor};
use crate::discovery::backend::RegistryBackend;

/// One health probe against one instance
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe the instance; `Ok` means healthy
    async fn probe(&self, descriptor: &ServiceDescriptor) -> Result<(), ProbeError>;

    /// Get the probe type name
    fn probe_type(&self) -> &'static str;
}

/// `GET {scheme}://{address}:{port}{health_path}`, 2xx means healthy
///
/// The host name is resolved on every probe, so address changes behind a DNS name
/// are picked up without re-registration.
pub struct HttpHealthProbe {
    client: HttpClient,
    scheme: String,
}

impl HttpHealthProbe {
    pub fn new(probe_timeout: Duration, scheme: impl Into<String>) -> RegistryResult<Self> {
        let client = HttpClient::builder()
            .timeout(probe_timeout)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| RegistryError::config(format!("failed to build probe client: {}", e)))?;

        Ok(Self {
            client,
            scheme: scheme.into(),
        })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, descriptor: &ServiceDescriptor) -> Result<(), ProbeError> {
        let url = descriptor.health_url(&self.scheme);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProbeError::from_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProbeError::Http(status.as_u16()));
        }

        // The body is ignored but must arrive intact.
        response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                ProbeError::ConnectionTimeout
            } else {
                ProbeError::ProbeBodyInvalid
            }
        })?;
        Ok(())
    }

    fn probe_type(&self) -> &'static str {
        "http"
    }
}

/// Last settled classification of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Pending,
    Healthy,
    Unhealthy,
}

/// Status plus the private counters behind it
#[derive(Debug, Clone)]
struct InstanceHealth {
    status: HealthStatus,
    consecutive_successes: u32,
    settled: Settled,
    unhealthy_since: Option<Instant>,
}

impl InstanceHealth {
    fn new() -> Self {
        Self {
            status: HealthStatus::pending(),
            consecutive_successes: 0,
            settled: Settled::Pending,
            unhealthy_since: None,
        }
    }

    /// Apply one probe outcome, returning the previous state
    fn record(
        &mut self,
        outcome: Result<(), ProbeError>,
        elapsed: Duration,
        config: &SupervisorConfig,
        now: Instant,
    ) -> HealthState {
        let previous = self.status.status;
        self.status.last_checked_at = Some(Utc::now());
        self.status.last_response_millis = elapsed.as_millis() as u64;

        match outcome {
            Ok(()) => {
                self.consecutive_successes = self.consecutive_successes.saturating_add(1);
                self.status.consecutive_failures = 0;
                self.status.last_error.clear();

                if self.consecutive_successes >= config.healthy_threshold {
                    self.status.status = HealthState::Healthy;
                    self.settled = Settled::Healthy;
                } else {
                    self.status.status = match self.settled {
                        Settled::Pending => HealthState::Pending,
                        Settled::Healthy => HealthState::Healthy,
                        Settled::Unhealthy => HealthState::Unknown,
                    };
                }
            }
            Err(error) => {
                self.consecutive_successes = 0;
                self.status.consecutive_failures =
                    self.status.consecutive_failures.saturating_add(1);
                self.status.last_error = error.to_string();

                if self.status.consecutive_failures >= config.unhealthy_threshold
                    || self.settled == Settled::Unhealthy
                {
                    self.status.status = HealthState::Unhealthy;
                    self.settled = Settled::Unhealthy;
                } else {
                    self.status.status = match self.settled {
                        Settled::Pending => HealthState::Pending,
                        _ => HealthState::Unknown,
                    };
                }
            }
        }

        if self.status.status == HealthState::Unhealthy {
            self.unhealthy_since.get_or_insert(now);
        } else {
            self.unhealthy_since = None;
        }

        previous
    }

    fn evictable(&self, evict_after: Duration, now: Instant) -> bool {
        self.status.status == HealthState::Unhealthy
            && self
                .unhealthy_since
                .map_or(false, |since| now.saturating_duration_since(since) >= evict_after)
    }
}

/// Result of one supervision cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub probed: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    /// Ids deregistered by TTL eviction, in id order
    pub evicted: Vec<String>,
}

/// Periodic prober maintaining the health of every registered instance
pub struct HealthSupervisor {
    backend: Arc<dyn RegistryBackend>,
    probe: Arc<dyn HealthProbe>,
    config: SupervisorConfig,
    statuses: DashMap<String, Arc<Mutex<InstanceHealth>>>,
    /// Ids forgotten since the backend last listed them; guards against stale snapshots
    forgotten: Mutex<HashSet<String>>,
    last_cycle_at: RwLock<Option<DateTime<Utc>>>,
    /// Serializes cycles so a manual cycle never overlaps the background loop
    cycle_lock: tokio::sync::Mutex<()>,
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthSupervisor {
    /// Create a supervisor probing over HTTP
    pub fn new(backend: Arc<dyn RegistryBackend>, config: SupervisorConfig) -> RegistryResult<Self> {
        let probe = HttpHealthProbe::new(config.probe_timeout, config.probe_scheme.clone())?;
        Ok(Self::with_probe(backend, Arc::new(probe), config))
    }

    /// Create a supervisor with a custom probe
    pub fn with_probe(
        backend: Arc<dyn RegistryBackend>,
        probe: Arc<dyn HealthProbe>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            backend,
            probe,
            config,
            statuses: DashMap::new(),
            forgotten: Mutex::new(HashSet::new()),
            last_cycle_at: RwLock::new(None),
            cycle_lock: tokio::sync::Mutex::new(()),
            token: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Start the background loop; a second call, or a call after shutdown, is a no-op
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() || self.token.is_cancelled() {
            return;
        }

        info!(
            probe = self.probe.probe_type(),
            interval_ms = self.config.probe_interval.as_millis() as u64,
            timeout_ms = self.config.probe_timeout.as_millis() as u64,
            unhealthy_threshold = self.config.unhealthy_threshold,
            healthy_threshold = self.config.healthy_threshold,
            evict_after_ms = self.config.evict_after.as_millis() as u64,
            "Starting health supervisor"
        );

        let supervisor = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            supervisor.run_loop().await;
        }));
    }

    async fn run_loop(&self) {
        let mut ticker = interval(self.config.probe_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        warn!(error = %e, "Health cycle skipped, registry listing failed");
                    }
                }
            }
        }

        debug!("Health supervisor loop stopped");
    }

    /// Stop the loop, waiting up to `probe_timeout` for in-flight probes
    ///
    /// Idempotent.
    pub async fn shutdown(&self) {
        self.token.cancel();

        let handle = self.task.lock().take();
        if let Some(mut handle) = handle {
            if timeout(self.config.probe_timeout, &mut handle).await.is_err() {
                warn!("In-flight probes outlived the grace period, aborting");
                handle.abort();
            }
            info!("Health supervisor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some() && !self.token.is_cancelled()
    }

    /// Track a freshly registered instance as pending
    pub fn track(&self, id: &str) {
        let mut forgotten = self.forgotten.lock();
        forgotten.remove(id);
        self.insert_pending(id);
    }

    /// Drop the status of a deregistered instance
    ///
    /// A cycle whose listing was taken before the deregistration will not bring the
    /// status back.
    pub fn forget(&self, id: &str) {
        let mut forgotten = self.forgotten.lock();
        forgotten.insert(id.to_string());
        self.statuses.remove(id);
    }

    /// Track an id seen in a backend listing unless it was forgotten since
    fn observe(&self, id: &str, forgotten: &HashSet<String>) {
        if !forgotten.contains(id) {
            self.insert_pending(id);
        }
    }

    fn insert_pending(&self, id: &str) {
        self.statuses
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(InstanceHealth::new())));
    }

    /// Run one probe cycle now
    pub async fn run_cycle(&self) -> RegistryResult<CycleReport> {
        let _cycle = self.cycle_lock.lock().await;
        let descriptors = self.backend.list_all().await?;

        let live: HashSet<&str> = descriptors.iter().map(|d| d.id.as_str()).collect();
        {
            let mut forgotten = self.forgotten.lock();
            forgotten.retain(|id| live.contains(id.as_str()));
            self.statuses.retain(|id, _| live.contains(id.as_str()));
            for descriptor in &descriptors {
                self.observe(&descriptor.id, &forgotten);
            }
        }

        let workers = self.config.max_concurrency.min(descriptors.len()).max(1);
        let token = self.token.clone();

        stream::iter(descriptors.iter())
            .take_while(|_| futures::future::ready(!token.is_cancelled()))
            .for_each_concurrent(workers, |descriptor| self.probe_instance(descriptor))
            .await;

        let evicted = self.evict_expired().await;

        let mut report = CycleReport {
            probed: descriptors.len(),
            evicted,
            ..CycleReport::default()
        };
        for entry in self.statuses.iter() {
            match entry.value().lock().status.status {
                HealthState::Healthy => report.healthy += 1,
                HealthState::Unhealthy => report.unhealthy += 1,
                _ => {}
            }
        }

        *self.last_cycle_at.write() = Some(Utc::now());
        gauge!("registry_instances_healthy").set(report.healthy as f64);
        gauge!("registry_instances_unhealthy").set(report.unhealthy as f64);
        debug!(
            probed = report.probed,
            healthy = report.healthy,
            unhealthy = report.unhealthy,
            evicted = report.evicted.len(),
            "Health cycle completed"
        );

        Ok(report)
    }

    async fn probe_instance(&self, descriptor: &ServiceDescriptor) {
        let Some(health) = self.statuses.get(&descriptor.id).map(|e| Arc::clone(e.value())) else {
            return;
        };

        let started = Instant::now();
        let outcome = match timeout(self.config.probe_timeout, self.probe.probe(descriptor)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ProbeError::ConnectionTimeout),
        };
        let elapsed = started.elapsed();

        histogram!("registry_probe_duration_seconds").record(elapsed.as_secs_f64());
        let label = if outcome.is_ok() { "success" } else { "failure" };
        counter!("registry_probes_total", "outcome" => label).increment(1);

        let (previous, status) = {
            let mut health = health.lock();
            let previous = health.record(outcome, elapsed, &self.config, Instant::now());
            (previous, health.status.clone())
        };

        if !status.last_error.is_empty() {
            warn!(
                service_id = %descriptor.id,
                service_name = %descriptor.name,
                error = %status.last_error,
                consecutive_failures = status.consecutive_failures,
                elapsed_ms = status.last_response_millis,
                "Health probe failed"
            );
        }

        if previous != status.status {
            info!(
                service_id = %descriptor.id,
                service_name = %descriptor.name,
                from = %previous,
                to = %status.status,
                "Instance health changed"
            );
        }
    }

    async fn evict_expired(&self) -> Vec<String> {
        let now = Instant::now();
        let mut expired: Vec<String> = self
            .statuses
            .iter()
            .filter(|entry| entry.value().lock().evictable(self.config.evict_after, now))
            .map(|entry| entry.key().clone())
            .collect();
        expired.sort();

        let mut evicted = Vec::with_capacity(expired.len());
        for id in expired {
            match self.backend.deregister(&id).await {
                Ok(()) | Err(RegistryError::NotFound { .. }) => {
                    self.statuses.remove(&id);
                    counter!("registry_evictions_total").increment(1);
                    info!(
                        service_id = %id,
                        evict_after_ms = self.config.evict_after.as_millis() as u64,
                        "Evicted instance after sustained failure"
                    );
                    evicted.push(id);
                }
                Err(e) => {
                    warn!(service_id = %id, error = %e, "Eviction failed, will retry next cycle");
                }
            }
        }
        evicted
    }

    pub fn get_status(&self, id: &str) -> Option<HealthStatus> {
        self.statuses
            .get(id)
            .map(|entry| entry.value().lock().status.clone())
    }

    /// Every tracked status, ordered by id
    pub fn all_statuses(&self) -> BTreeMap<String, HealthStatus> {
        self.statuses
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().lock().status.clone()))
            .collect()
    }

    /// Ids currently classified healthy, in id order
    pub fn healthy_ids(&self) -> Vec<String> {
        self.ids_in(HealthState::Healthy).into_iter().collect()
    }

    pub fn unhealthy_set(&self) -> BTreeSet<String> {
        self.ids_in(HealthState::Unhealthy)
    }

    fn ids_in(&self, state: HealthState) -> BTreeSet<String> {
        self.statuses
            .iter()
            .filter(|entry| entry.value().lock().status.status == state)
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn summary(&self) -> HealthSummary {
        let mut summary = HealthSummary {
            last_cycle_at: *self.last_cycle_at.read(),
            ..HealthSummary::default()
        };

        for entry in self.statuses.iter() {
            summary.total += 1;
            match entry.value().lock().status.status {
                HealthState::Healthy => summary.healthy += 1,
                HealthState::Unhealthy => summary.unhealthy += 1,
                HealthState::Pending | HealthState::Unknown => summary.unknown += 1,
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::memory::InMemoryBackend;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Probe answering from a per-id script; unknown ids pass
    #[derive(Default)]
    struct ScriptedProbe {
        outcomes: Mutex<HashMap<String, Result<(), ProbeError>>>,
    }

    impl ScriptedProbe {
        fn set(&self, id: &str, outcome: Result<(), ProbeError>) {
            self.outcomes.lock().insert(id.to_string(), outcome);
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self, descriptor: &ServiceDescriptor) -> Result<(), ProbeError> {
            self.outcomes
                .lock()
                .get(&descriptor.id)
                .cloned()
                .unwrap_or(Ok(()))
        }

        fn probe_type(&self) -> &'static str {
            "scripted"
        }
    }

    /// Probe that sleeps and records the peak number of concurrent probes
    #[derive(Default)]
    struct SlowProbe {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl HealthProbe for SlowProbe {
        async fn probe(&self, _descriptor: &ServiceDescriptor) -> Result<(), ProbeError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }

        fn probe_type(&self) -> &'static str {
            "slow"
        }
    }

    fn descriptor(id: &str) -> ServiceDescriptor {
        ServiceDescriptor::new(id, "user-service", "127.0.0.1", 7530)
            .with_tags(["service_type:microservice", "version:v1.0.0"])
            .with_metadata([
                ("version", "v1.0.0"),
                ("type", "microservice"),
                ("environment", "development"),
            ])
    }

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(100),
            unhealthy_threshold: 3,
            healthy_threshold: 1,
            evict_after: Duration::from_secs(5),
            ..SupervisorConfig::default()
        }
    }

    async fn setup(
        config: SupervisorConfig,
        ids: &[&str],
    ) -> (Arc<InMemoryBackend>, Arc<ScriptedProbe>, HealthSupervisor) {
        let backend = Arc::new(InMemoryBackend::new());
        for id in ids {
            backend.register(descriptor(id)).await.unwrap();
        }
        let probe = Arc::new(ScriptedProbe::default());
        let supervisor = HealthSupervisor::with_probe(backend.clone(), probe.clone(), config);
        (backend, probe, supervisor)
    }

    fn assert_status_invariants(status: &HealthStatus) {
        match status.status {
            HealthState::Healthy => {
                assert!(status.last_error.is_empty());
                assert_eq!(status.consecutive_failures, 0);
            }
            HealthState::Unhealthy => {
                assert!(!status.last_error.is_empty());
                assert!(status.consecutive_failures >= 1);
            }
            _ => {}
        }
    }

    #[tokio::test]
    async fn test_pending_until_first_cycle() {
        let (_backend, _probe, supervisor) = setup(config(), &["user-service-a"]).await;
        supervisor.track("user-service-a");

        let status = supervisor.get_status("user-service-a").unwrap();
        assert_eq!(status.status, HealthState::Pending);
        assert!(status.last_checked_at.is_none());
        assert_eq!(supervisor.summary().unknown, 1);
    }

    #[tokio::test]
    async fn test_passing_probe_marks_healthy() {
        let (_backend, _probe, supervisor) = setup(config(), &["user-service-a"]).await;

        let report = supervisor.run_cycle().await.unwrap();
        assert_eq!(report.probed, 1);
        assert_eq!(report.healthy, 1);

        let status = supervisor.get_status("user-service-a").unwrap();
        assert_eq!(status.status, HealthState::Healthy);
        assert!(status.last_checked_at.is_some());
        assert_eq!(supervisor.healthy_ids(), vec!["user-service-a".to_string()]);
        assert!(supervisor.summary().last_cycle_at.is_some());
    }

    #[tokio::test]
    async fn test_unhealthy_after_exactly_threshold_failures() {
        let (_backend, probe, supervisor) = setup(config(), &["user-service-a"]).await;
        probe.set("user-service-a", Err(ProbeError::ConnectionRefused));

        for expected_failures in 1..=2 {
            supervisor.run_cycle().await.unwrap();
            let status = supervisor.get_status("user-service-a").unwrap();
            assert_eq!(status.status, HealthState::Pending);
            assert_eq!(status.consecutive_failures, expected_failures);
            assert_eq!(status.last_error, "ConnectionRefused");
        }

        supervisor.run_cycle().await.unwrap();
        let status = supervisor.get_status("user-service-a").unwrap();
        assert_eq!(status.status, HealthState::Unhealthy);
        assert_eq!(status.consecutive_failures, 3);
        assert!(supervisor.unhealthy_set().contains("user-service-a"));
    }

    #[tokio::test]
    async fn test_healthy_instance_degrades_through_unknown() {
        let (_backend, probe, supervisor) = setup(config(), &["user-service-a"]).await;
        supervisor.run_cycle().await.unwrap();

        probe.set("user-service-a", Err(ProbeError::Http(503)));
        supervisor.run_cycle().await.unwrap();
        let status = supervisor.get_status("user-service-a").unwrap();
        assert_eq!(status.status, HealthState::Unknown);
        assert_eq!(status.last_error, "HTTP503");
        assert_status_invariants(&status);

        supervisor.run_cycle().await.unwrap();
        supervisor.run_cycle().await.unwrap();
        let status = supervisor.get_status("user-service-a").unwrap();
        assert_eq!(status.status, HealthState::Unhealthy);
        assert_status_invariants(&status);
    }

    #[tokio::test]
    async fn test_recovery_requires_healthy_threshold() {
        let config = SupervisorConfig {
            healthy_threshold: 2,
            unhealthy_threshold: 1,
            ..config()
        };
        let (_backend, probe, supervisor) = setup(config, &["user-service-a"]).await;

        probe.set("user-service-a", Err(ProbeError::ConnectionTimeout));
        supervisor.run_cycle().await.unwrap();
        assert_eq!(
            supervisor.get_status("user-service-a").unwrap().status,
            HealthState::Unhealthy
        );

        probe.set("user-service-a", Ok(()));
        supervisor.run_cycle().await.unwrap();
        let status = supervisor.get_status("user-service-a").unwrap();
        assert_eq!(status.status, HealthState::Unknown);
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.last_error.is_empty());

        supervisor.run_cycle().await.unwrap();
        let status = supervisor.get_status("user-service-a").unwrap();
        assert_eq!(status.status, HealthState::Healthy);
        assert_status_invariants(&status);
    }

    #[tokio::test]
    async fn test_flap_while_recovering_returns_to_unhealthy() {
        let config = SupervisorConfig {
            healthy_threshold: 3,
            unhealthy_threshold: 2,
            ..config()
        };
        let (_backend, probe, supervisor) = setup(config, &["user-service-a"]).await;

        probe.set("user-service-a", Err(ProbeError::DnsError));
        supervisor.run_cycle().await.unwrap();
        supervisor.run_cycle().await.unwrap();

        probe.set("user-service-a", Ok(()));
        supervisor.run_cycle().await.unwrap();
        probe.set("user-service-a", Err(ProbeError::DnsError));
        supervisor.run_cycle().await.unwrap();

        let status = supervisor.get_status("user-service-a").unwrap();
        assert_eq!(status.status, HealthState::Unhealthy);
        assert_eq!(status.consecutive_failures, 1);
        assert_eq!(status.last_error, "DNSError");
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_after_sustained_failure() {
        let (backend, probe, supervisor) =
            setup(config(), &["user-service-a", "user-service-b"]).await;
        probe.set("user-service-a", Err(ProbeError::ConnectionRefused));

        for _ in 0..3 {
            supervisor.run_cycle().await.unwrap();
        }
        assert!(supervisor.unhealthy_set().contains("user-service-a"));

        tokio::time::advance(Duration::from_secs(4)).await;
        let report = supervisor.run_cycle().await.unwrap();
        assert!(report.evicted.is_empty());
        assert_eq!(backend.list_all().await.unwrap().len(), 2);

        tokio::time::advance(Duration::from_secs(2)).await;
        let report = supervisor.run_cycle().await.unwrap();
        assert_eq!(report.evicted, vec!["user-service-a".to_string()]);

        let remaining: Vec<String> = backend
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(remaining, vec!["user-service-b"]);
        assert!(supervisor.get_status("user-service-a").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_resets_eviction_clock() {
        let config = SupervisorConfig {
            unhealthy_threshold: 1,
            ..config()
        };
        let (backend, probe, supervisor) = setup(config, &["user-service-a"]).await;

        probe.set("user-service-a", Err(ProbeError::ConnectionRefused));
        supervisor.run_cycle().await.unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;

        probe.set("user-service-a", Ok(()));
        supervisor.run_cycle().await.unwrap();
        probe.set("user-service-a", Err(ProbeError::ConnectionRefused));
        supervisor.run_cycle().await.unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        let report = supervisor.run_cycle().await.unwrap();
        assert!(report.evicted.is_empty());
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn test_deregistered_instances_are_dropped() {
        let (backend, _probe, supervisor) =
            setup(config(), &["user-service-a", "user-service-b"]).await;
        supervisor.run_cycle().await.unwrap();
        assert_eq!(supervisor.all_statuses().len(), 2);

        backend.deregister("user-service-a").await.unwrap();
        supervisor.run_cycle().await.unwrap();

        let statuses = supervisor.all_statuses();
        assert_eq!(statuses.keys().collect::<Vec<_>>(), vec!["user-service-b"]);
    }

    /// Backend whose listing can be pinned to an earlier snapshot
    struct PinnedListing {
        inner: InMemoryBackend,
        pinned: Mutex<Option<Vec<ServiceDescriptor>>>,
    }

    #[async_trait]
    impl RegistryBackend for PinnedListing {
        async fn register(&self, descriptor: ServiceDescriptor) -> RegistryResult<()> {
            self.inner.register(descriptor).await
        }

        async fn deregister(&self, id: &str) -> RegistryResult<()> {
            self.inner.deregister(id).await
        }

        async fn get_service(&self, id: &str) -> RegistryResult<ServiceDescriptor> {
            self.inner.get_service(id).await
        }

        async fn discover(&self, name: &str) -> RegistryResult<Vec<ServiceDescriptor>> {
            self.inner.discover(name).await
        }

        async fn list_all(&self) -> RegistryResult<Vec<ServiceDescriptor>> {
            let pinned = self.pinned.lock().clone();
            match pinned {
                Some(snapshot) => Ok(snapshot),
                None => self.inner.list_all().await,
            }
        }

        async fn watch(
            &self,
            name: &str,
            callback: crate::discovery::backend::WatchCallback,
        ) -> RegistryResult<crate::discovery::backend::WatchHandle> {
            self.inner.watch(name, callback).await
        }

        fn backend_name(&self) -> &'static str {
            "pinned"
        }
    }

    #[tokio::test]
    async fn test_stale_listing_does_not_revive_forgotten_instance() {
        let backend = Arc::new(PinnedListing {
            inner: InMemoryBackend::new(),
            pinned: Mutex::new(None),
        });
        for id in ["user-service-a", "user-service-b"] {
            backend.register(descriptor(id)).await.unwrap();
        }
        let supervisor = HealthSupervisor::with_probe(
            backend.clone(),
            Arc::new(ScriptedProbe::default()),
            config(),
        );
        supervisor.run_cycle().await.unwrap();

        // Listing taken before the deregistration lands.
        let snapshot = backend.list_all().await.unwrap();
        *backend.pinned.lock() = Some(snapshot);
        backend.deregister("user-service-a").await.unwrap();
        supervisor.forget("user-service-a");

        supervisor.run_cycle().await.unwrap();
        assert!(supervisor.get_status("user-service-a").is_none());
        assert_eq!(supervisor.summary().total, 1);
        assert_eq!(
            supervisor.all_statuses().keys().collect::<Vec<_>>(),
            vec!["user-service-b"]
        );

        *backend.pinned.lock() = None;
        supervisor.run_cycle().await.unwrap();
        assert_eq!(supervisor.summary().total, 1);

        // Re-registering the same id tracks it again.
        backend.register(descriptor("user-service-a")).await.unwrap();
        supervisor.track("user-service-a");
        supervisor.run_cycle().await.unwrap();
        assert_eq!(
            supervisor.get_status("user-service-a").unwrap().status,
            HealthState::Healthy
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_concurrency_is_bounded() {
        let backend = Arc::new(InMemoryBackend::new());
        for i in 0..40 {
            backend
                .register(descriptor(&format!("user-service-{:02}", i)))
                .await
                .unwrap();
        }
        let probe = Arc::new(SlowProbe::default());
        let supervisor = HealthSupervisor::with_probe(
            backend,
            probe.clone(),
            SupervisorConfig {
                max_concurrency: 4,
                ..config()
            },
        );

        let report = supervisor.run_cycle().await.unwrap();
        assert_eq!(report.healthy, 40);
        assert!(probe.peak.load(Ordering::SeqCst) <= 4);
        assert!(probe.peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_probe_is_classified_as_timeout() {
        struct HangingProbe;

        #[async_trait]
        impl HealthProbe for HangingProbe {
            async fn probe(&self, _descriptor: &ServiceDescriptor) -> Result<(), ProbeError> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }

            fn probe_type(&self) -> &'static str {
                "hanging"
            }
        }

        let backend = Arc::new(InMemoryBackend::new());
        backend.register(descriptor("user-service-a")).await.unwrap();
        let supervisor = HealthSupervisor::with_probe(backend, Arc::new(HangingProbe), config());

        supervisor.run_cycle().await.unwrap();
        let status = supervisor.get_status("user-service-a").unwrap();
        assert_eq!(status.last_error, "ConnectionTimeout");
        assert_eq!(status.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_start_and_idempotent_shutdown() {
        let (_backend, _probe, supervisor) = setup(config(), &["user-service-a"]).await;
        let supervisor = Arc::new(supervisor);

        supervisor.start();
        supervisor.start();
        assert!(supervisor.is_running());

        // The first tick fires immediately.
        let mut healthy = false;
        for _ in 0..50 {
            if supervisor.healthy_ids().len() == 1 {
                healthy = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(healthy);

        supervisor.shutdown().await;
        supervisor.shutdown().await;
        assert!(!supervisor.is_running());

        supervisor.start();
        assert!(!supervisor.is_running());
    }
}
