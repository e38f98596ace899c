//! # Load Balancer Manager
//!
//! Holds one strategy instance per `(service, strategy)` pair, created on first use,
//! so rotation state of one service never leaks into another. The manager owns no
//! counters itself; it only routes to strategies and records metrics.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::{counter, histogram};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::core::config::LoadBalancingConfig;
use crate::core::error::{RegistryError, RegistryResult};
use crate::core::types::ServiceDescriptor;
use crate::load_balancing::strategies::{
    available_strategies, new_strategy, normalize_strategy_name, Strategy, StrategyConfig,
    StrategyStats, LEAST_CONNECTIONS, WEIGHTED_ROUND_ROBIN,
};

/// Statistics of one strategy instance
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStrategyStats {
    pub service: String,
    pub stats: StrategyStats,
}

pub struct LoadBalancerManager {
    default_strategy: RwLock<&'static str>,
    config: RwLock<StrategyConfig>,
    strategies: DashMap<(String, &'static str), Arc<dyn Strategy>>,
}

impl LoadBalancerManager {
    /// Create a manager whose default strategy is `default_strategy`
    pub fn new(default_strategy: &str, config: StrategyConfig) -> RegistryResult<Self> {
        let canonical = canonical(default_strategy)?;
        Ok(Self {
            default_strategy: RwLock::new(canonical),
            config: RwLock::new(config),
            strategies: DashMap::new(),
        })
    }

    pub fn from_config(config: &LoadBalancingConfig) -> RegistryResult<Self> {
        for (id, weight) in &config.weights {
            if *weight == 0 {
                return Err(RegistryError::InvalidWeight {
                    id: id.clone(),
                    weight: 0,
                });
            }
        }
        Self::new(&config.default_strategy, StrategyConfig::from(config))
    }

    pub fn default_strategy(&self) -> &'static str {
        *self.default_strategy.read()
    }

    /// Switch the strategy used when callers do not name one
    pub fn switch_default(&self, name: &str) -> RegistryResult<()> {
        let canonical = canonical(name)?;
        *self.default_strategy.write() = canonical;
        counter!("load_balancer_algorithm_switches").increment(1);
        debug!(algorithm = canonical, "Switched default load balancing strategy");
        Ok(())
    }

    pub fn available_strategies(&self) -> Vec<&'static str> {
        available_strategies().to_vec()
    }

    /// Strategy instance for a service, created on first use
    pub fn strategy_for(&self, service: &str, name: &str) -> RegistryResult<Arc<dyn Strategy>> {
        let canonical = canonical(name)?;
        match self.strategies.entry((service.to_string(), canonical)) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let strategy = new_strategy(canonical, &self.config.read())?;
                entry.insert(Arc::clone(&strategy));
                Ok(strategy)
            }
        }
    }

    /// Select one of `candidates` for `service`
    ///
    /// `strategy` defaults to the configured default. An empty candidate set fails
    /// with `NoHealthyInstance`.
    pub fn select(
        &self,
        service: &str,
        candidates: &[ServiceDescriptor],
        strategy: Option<&str>,
        key: Option<&str>,
    ) -> RegistryResult<ServiceDescriptor> {
        let name = strategy.unwrap_or_else(|| self.default_strategy());
        let strategy = self.strategy_for(service, name)?;
        let algorithm = strategy.algorithm_name();

        let start = Instant::now();
        let selected = strategy.select(candidates, key);
        histogram!("load_balancer_selection_duration").record(start.elapsed().as_secs_f64());

        match selected.and_then(|index| candidates.get(index)) {
            Some(descriptor) => {
                counter!("load_balancer_selections", "algorithm" => algorithm).increment(1);
                debug!(
                    service_name = %service,
                    instance_id = %descriptor.id,
                    algorithm = algorithm,
                    candidates = candidates.len(),
                    "Selected instance"
                );
                Ok(descriptor.clone())
            }
            None => {
                counter!("load_balancer_failed_selections", "algorithm" => algorithm)
                    .increment(1);
                Err(RegistryError::no_healthy_instance(service))
            }
        }
    }

    /// Report a finished connection to `id` of `service`
    pub fn release(&self, service: &str, id: &str) {
        if let Some(strategy) = self
            .strategies
            .get(&(service.to_string(), LEAST_CONNECTIONS))
            .map(|entry| Arc::clone(entry.value()))
        {
            strategy.release(id);
        }
    }

    /// Set the weighted round-robin weight of an instance
    pub fn set_weight(&self, service: &str, id: &str, weight: i64) -> RegistryResult<()> {
        let strategy = self.strategy_for(service, WEIGHTED_ROUND_ROBIN)?;
        strategy.set_weight(id, weight)?;

        // Validated above, so the conversion cannot fail.
        if let Ok(weight) = u32::try_from(weight) {
            self.config.write().weights.insert(id.to_string(), weight);
        }
        Ok(())
    }

    /// Weight of an instance; 1 when none was set
    pub fn get_weight(&self, id: &str) -> u32 {
        self.config.read().weights.get(id).copied().unwrap_or(1)
    }

    /// Statistics of every strategy instance, ordered by service then algorithm
    pub fn stats(&self) -> Vec<ServiceStrategyStats> {
        let mut all: Vec<ServiceStrategyStats> = self
            .strategies
            .iter()
            .map(|entry| ServiceStrategyStats {
                service: entry.key().0.clone(),
                stats: entry.value().stats(),
            })
            .collect();
        all.sort_by(|a, b| {
            (a.service.as_str(), a.stats.algorithm.as_str())
                .cmp(&(b.service.as_str(), b.stats.algorithm.as_str()))
        });
        all
    }

    /// Reset every strategy instance
    pub fn reset(&self) {
        for entry in self.strategies.iter() {
            entry.value().reset();
        }
    }
}

fn canonical(name: &str) -> RegistryResult<&'static str> {
    normalize_strategy_name(name).ok_or_else(|| RegistryError::InvalidStrategy {
        name: name.to_string(),
    })
}
