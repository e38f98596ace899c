pub mod balancer;
pub mod strategies;

pub use balancer::{LoadBalancerManager, ServiceStrategyStats};
pub use strategies::{
    available_strategies, new_strategy, HashStrategy, LeastConnections, RandomStrategy,
    RoundRobin, Strategy, StrategyConfig, StrategyStats, WeightedRoundRobin,
};
