// src/load_balancer/mod.rs
mod round_robin;
mod algorithm;

pub use algorithm::LoadBalancer; // trait
pub use round_robin::RoundRobinBalancer;
pub use crate::config::LoadBalancerAlgorithm;

use std::sync::Arc;

pub fn create_load_balancer(algorithm: LoadBalancerAlgorithm) -> Arc<dyn LoadBalancer> {
    match algorithm {
        LoadBalancerAlgorithm::RoundRobin => Arc::new(RoundRobinBalancer::new()),
        other => {
            tracing::warn!(
                "Unsupported load balancing algorithm {:?}, falling back to round robin",
                other
            );
            Arc::new(RoundRobinBalancer::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_falls_back_to_round_robin() {
        for algorithm in [
            LoadBalancerAlgorithm::RoundRobin,
            LoadBalancerAlgorithm::WeightedRandom,
            LoadBalancerAlgorithm::LeastConnections,
        ] {
            assert_eq!(create_load_balancer(algorithm).name(), "round_robin");
        }
    }
}
