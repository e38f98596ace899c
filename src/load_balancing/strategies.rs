//! # Selection Strategies
//!
//! Each strategy owns its counters, weights or connection counts behind its own mutex,
//! so concurrent selections serialize only on that brief critical section. Selection
//! never performs I/O.
//!
//! | Strategy | State | Tie-break |
//! |---|---|---|
//! | `round_robin` | counter, never reset | candidates ordered by id |
//! | `random` | seeded RNG | none |
//! | `weighted_round_robin` | weights and current weights per id | highest current, then lowest id |
//! | `least_connections` | live connections per id | lowest count, then lowest id |
//! | `hash` | none | `sha256(key) mod N` over ids in order |
//!
//! Strategies return an index into the candidate slice they were given; callers may
//! pass candidates in any order.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::config::LoadBalancingConfig;
use crate::core::error::{RegistryError, RegistryResult};
use crate::core::types::ServiceDescriptor;

pub const ROUND_ROBIN: &str = "round_robin";
pub const RANDOM: &str = "random";
pub const WEIGHTED_ROUND_ROBIN: &str = "weighted_round_robin";
pub const LEAST_CONNECTIONS: &str = "least_connections";
pub const HASH: &str = "hash";

const AVAILABLE: [&str; 5] = [ROUND_ROBIN, RANDOM, WEIGHTED_ROUND_ROBIN, LEAST_CONNECTIONS, HASH];

/// Canonical names of every strategy
pub fn available_strategies() -> &'static [&'static str] {
    &AVAILABLE
}

/// Map a strategy name or alias to its canonical name
pub fn normalize_strategy_name(name: &str) -> Option<&'static str> {
    match name.trim().to_ascii_lowercase().replace('-', "_").as_str() {
        "round_robin" | "roundrobin" => Some(ROUND_ROBIN),
        "random" => Some(RANDOM),
        "weighted_round_robin" | "weighted" => Some(WEIGHTED_ROUND_ROBIN),
        "least_connections" | "least_conn" => Some(LEAST_CONNECTIONS),
        "hash" | "ip_hash" | "consistent_hash" => Some(HASH),
        _ => None,
    }
}

/// Core trait for selection strategies
pub trait Strategy: Send + Sync {
    /// Pick one candidate, returning its index, or `None` when `candidates` is empty
    fn select(&self, candidates: &[ServiceDescriptor], key: Option<&str>) -> Option<usize>;

    /// Canonical name for metrics and logging
    fn algorithm_name(&self) -> &'static str;

    /// Signal that a connection to `id` finished
    fn release(&self, _id: &str) {}

    /// Set the weight of `id`; only weighted strategies accept weights
    fn set_weight(&self, _id: &str, _weight: i64) -> RegistryResult<()> {
        Err(RegistryError::Unsupported {
            backend: self.algorithm_name().to_string(),
            operation: "set_weight".to_string(),
        })
    }

    /// Snapshot of the strategy's counters
    fn stats(&self) -> StrategyStats;

    /// Clear internal state
    fn reset(&self);
}

/// Strategy statistics for monitoring
#[derive(Debug, Clone, Default, Serialize)]
pub struct StrategyStats {
    pub algorithm: String,
    pub total_selections: u64,
    pub failed_selections: u64,
    pub instances: BTreeMap<String, InstanceStats>,
}

/// Per-instance counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstanceStats {
    pub selections: u64,
    pub active_connections: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
}

/// Selection counters shared by every strategy's state
#[derive(Debug, Default)]
struct Tally {
    total: u64,
    failed: u64,
    per_id: HashMap<String, u64>,
}

impl Tally {
    fn hit(&mut self, id: &str) {
        self.total += 1;
        *self.per_id.entry(id.to_string()).or_default() += 1;
    }

    fn miss(&mut self) {
        self.failed += 1;
    }

    fn snapshot(&self, algorithm: &str) -> StrategyStats {
        StrategyStats {
            algorithm: algorithm.to_string(),
            total_selections: self.total,
            failed_selections: self.failed,
            instances: self
                .per_id
                .iter()
                .map(|(id, selections)| {
                    (
                        id.clone(),
                        InstanceStats {
                            selections: *selections,
                            ..InstanceStats::default()
                        },
                    )
                })
                .collect(),
        }
    }
}

/// Candidate indices ordered by id
fn ordered(candidates: &[ServiceDescriptor]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by(|&a, &b| candidates[a].id.cmp(&candidates[b].id));
    order
}

/// Round-robin over candidates ordered by id
#[derive(Default)]
pub struct RoundRobin {
    state: Mutex<RoundRobinState>,
}

#[derive(Default)]
struct RoundRobinState {
    counter: u64,
    tally: Tally,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Strategy for RoundRobin {
    fn select(&self, candidates: &[ServiceDescriptor], _key: Option<&str>) -> Option<usize> {
        let mut state = self.state.lock();
        if candidates.is_empty() {
            state.tally.miss();
            return None;
        }

        let order = ordered(candidates);
        let index = order[(state.counter % order.len() as u64) as usize];
        state.counter = state.counter.wrapping_add(1);
        state.tally.hit(&candidates[index].id);
        Some(index)
    }

    fn algorithm_name(&self) -> &'static str {
        ROUND_ROBIN
    }

    fn stats(&self) -> StrategyStats {
        self.state.lock().tally.snapshot(ROUND_ROBIN)
    }

    fn reset(&self) {
        self.state.lock().tally = Tally::default();
    }
}

/// Uniform random choice per call
pub struct RandomStrategy {
    state: Mutex<(StdRng, Tally)>,
}

impl RandomStrategy {
    /// Seed from the clock
    pub fn new() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        Self::with_seed(nanos)
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            state: Mutex::new((StdRng::seed_from_u64(seed), Tally::default())),
        }
    }
}

impl Default for RandomStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for RandomStrategy {
    fn select(&self, candidates: &[ServiceDescriptor], _key: Option<&str>) -> Option<usize> {
        let mut state = self.state.lock();
        let (rng, tally) = &mut *state;
        if candidates.is_empty() {
            tally.miss();
            return None;
        }

        let index = rng.gen_range(0..candidates.len());
        tally.hit(&candidates[index].id);
        Some(index)
    }

    fn algorithm_name(&self) -> &'static str {
        RANDOM
    }

    fn stats(&self) -> StrategyStats {
        self.state.lock().1.snapshot(RANDOM)
    }

    fn reset(&self) {
        self.state.lock().1 = Tally::default();
    }
}

/// Smooth weighted round-robin
///
/// Every call adds each candidate's weight to its current value, picks the highest
/// current value and subtracts the total weight from it. Over `sum(weights)` calls each
/// id is picked exactly `weight` times, spread out rather than in bursts.
#[derive(Default)]
pub struct WeightedRoundRobin {
    state: Mutex<WeightedState>,
}

#[derive(Default)]
struct WeightedState {
    weights: HashMap<String, u32>,
    current: HashMap<String, i64>,
    tally: Tally,
}

impl WeightedState {
    fn weight_of(&self, id: &str) -> u32 {
        self.weights.get(id).copied().unwrap_or(1)
    }
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with initial weights; zero weights are ignored
    pub fn with_weights(weights: &HashMap<String, u32>) -> Self {
        let strategy = Self::new();
        {
            let mut state = strategy.state.lock();
            state.weights = weights
                .iter()
                .filter(|(_, weight)| **weight > 0)
                .map(|(id, weight)| (id.clone(), *weight))
                .collect();
        }
        strategy
    }

    /// Weight of `id`; ids without a configured weight count as 1
    pub fn get_weight(&self, id: &str) -> u32 {
        self.state.lock().weight_of(id)
    }
}

impl Strategy for WeightedRoundRobin {
    fn select(&self, candidates: &[ServiceDescriptor], _key: Option<&str>) -> Option<usize> {
        let mut state = self.state.lock();
        if candidates.is_empty() {
            state.tally.miss();
            return None;
        }

        let order = ordered(candidates);
        state
            .current
            .retain(|id, _| candidates.iter().any(|c| &c.id == id));

        let mut total: i64 = 0;
        let mut best: Option<(usize, i64)> = None;
        for &index in &order {
            let id = &candidates[index].id;
            let weight = i64::from(state.weight_of(id));
            total += weight;

            let current = state.current.entry(id.clone()).or_insert(0);
            *current += weight;
            let value = *current;

            // Strictly greater keeps the lowest id on ties.
            if best.map_or(true, |(_, best_value)| value > best_value) {
                best = Some((index, value));
            }
        }

        let (index, _) = best?;
        let id = candidates[index].id.clone();
        if let Some(current) = state.current.get_mut(&id) {
            *current -= total;
        }
        state.tally.hit(&id);
        Some(index)
    }

    fn algorithm_name(&self) -> &'static str {
        WEIGHTED_ROUND_ROBIN
    }

    fn set_weight(&self, id: &str, weight: i64) -> RegistryResult<()> {
        let weight = u32::try_from(weight)
            .ok()
            .filter(|w| *w > 0)
            .ok_or_else(|| RegistryError::InvalidWeight {
                id: id.to_string(),
                weight,
            })?;

        let mut state = self.state.lock();
        state.weights.insert(id.to_string(), weight);
        state.current.remove(id);
        Ok(())
    }

    fn stats(&self) -> StrategyStats {
        let state = self.state.lock();
        let mut stats = state.tally.snapshot(WEIGHTED_ROUND_ROBIN);
        for (id, weight) in &state.weights {
            stats.instances.entry(id.clone()).or_default().weight = Some(*weight);
        }
        stats
    }

    fn reset(&self) {
        let mut state = self.state.lock();
        state.current.clear();
        state.tally = Tally::default();
    }
}

/// Fewest live connections first
#[derive(Default)]
pub struct LeastConnections {
    state: Mutex<LeastConnectionsState>,
}

#[derive(Default)]
struct LeastConnectionsState {
    connections: HashMap<String, u64>,
    tally: Tally,
}

impl LeastConnections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connections(&self, id: &str) -> u64 {
        self.state.lock().connections.get(id).copied().unwrap_or(0)
    }
}

impl Strategy for LeastConnections {
    fn select(&self, candidates: &[ServiceDescriptor], _key: Option<&str>) -> Option<usize> {
        let mut state = self.state.lock();
        if candidates.is_empty() {
            state.tally.miss();
            return None;
        }

        let index = ordered(candidates).into_iter().min_by_key(|&index| {
            state
                .connections
                .get(&candidates[index].id)
                .copied()
                .unwrap_or(0)
        })?;

        let id = &candidates[index].id;
        *state.connections.entry(id.clone()).or_insert(0) += 1;
        state.tally.hit(id);
        Some(index)
    }

    fn algorithm_name(&self) -> &'static str {
        LEAST_CONNECTIONS
    }

    fn release(&self, id: &str) {
        let mut state = self.state.lock();
        if let Some(count) = state.connections.get_mut(id) {
            *count = count.saturating_sub(1);
        }
    }

    fn stats(&self) -> StrategyStats {
        let state = self.state.lock();
        let mut stats = state.tally.snapshot(LEAST_CONNECTIONS);
        for (id, connections) in &state.connections {
            stats.instances.entry(id.clone()).or_default().active_connections = *connections;
        }
        stats
    }

    fn reset(&self) {
        let mut state = self.state.lock();
        state.connections.clear();
        state.tally = Tally::default();
    }
}

/// `candidates[sha256(key) mod N]` over candidates ordered by id
#[derive(Default)]
pub struct HashStrategy {
    tally: Mutex<Tally>,
}

impl HashStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// First eight bytes of the key's SHA-256 digest
    pub fn hash_key(key: &str) -> u64 {
        let digest = Sha256::digest(key.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(bytes)
    }
}

impl Strategy for HashStrategy {
    fn select(&self, candidates: &[ServiceDescriptor], key: Option<&str>) -> Option<usize> {
        let mut tally = self.tally.lock();
        if candidates.is_empty() {
            tally.miss();
            return None;
        }

        let order = ordered(candidates);
        let slot = (Self::hash_key(key.unwrap_or_default()) % order.len() as u64) as usize;
        let index = order[slot];
        tally.hit(&candidates[index].id);
        Some(index)
    }

    fn algorithm_name(&self) -> &'static str {
        HASH
    }

    fn stats(&self) -> StrategyStats {
        self.tally.lock().snapshot(HASH)
    }

    fn reset(&self) {
        *self.tally.lock() = Tally::default();
    }
}

/// Inputs for building strategies
#[derive(Debug, Clone, Default)]
pub struct StrategyConfig {
    /// Initial weights for weighted round-robin
    pub weights: HashMap<String, u32>,
    /// Fixed seed for the random strategy
    pub seed: Option<u64>,
}

impl From<&LoadBalancingConfig> for StrategyConfig {
    fn from(config: &LoadBalancingConfig) -> Self {
        Self {
            weights: config.weights.clone(),
            seed: None,
        }
    }
}

/// Build a strategy by name; unknown names are rejected
pub fn new_strategy(name: &str, config: &StrategyConfig) -> RegistryResult<Arc<dyn Strategy>> {
    let canonical = normalize_strategy_name(name).ok_or_else(|| RegistryError::InvalidStrategy {
        name: name.to_string(),
    })?;

    let strategy: Arc<dyn Strategy> = match canonical {
        ROUND_ROBIN => Arc::new(RoundRobin::new()),
        RANDOM => match config.seed {
            Some(seed) => Arc::new(RandomStrategy::with_seed(seed)),
            None => Arc::new(RandomStrategy::new()),
        },
        WEIGHTED_ROUND_ROBIN => Arc::new(WeightedRoundRobin::with_weights(&config.weights)),
        LEAST_CONNECTIONS => Arc::new(LeastConnections::new()),
        _ => Arc::new(HashStrategy::new()),
    };
    Ok(strategy)
}
