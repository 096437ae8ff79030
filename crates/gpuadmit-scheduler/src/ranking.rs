//! Secondary ranking of admissible nodes

use gpuadmit_core::{Node, RankingPolicy, ResourceRequest};
use std::sync::Arc;

/// Scores are per-mille; lower ranks first
pub trait RankingStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Score of placing `request` on `node`
    fn score(&self, node: &Node, request: &ResourceRequest) -> u64;
}

/// Spread load: prefer the node left emptiest after placement
pub struct LeastAllocated;

impl RankingStrategy for LeastAllocated {
    fn name(&self) -> &'static str {
        "least-allocated"
    }

    fn score(&self, node: &Node, request: &ResourceRequest) -> u64 {
        utilization_after(node, request)
    }
}

/// Bin packing: prefer the node left fullest after placement
pub struct MostAllocated;

impl RankingStrategy for MostAllocated {
    fn name(&self) -> &'static str {
        "most-allocated"
    }

    fn score(&self, node: &Node, request: &ResourceRequest) -> u64 {
        1000 - utilization_after(node, request)
    }
}

/// Keep candidate order
pub struct FirstFit;

impl RankingStrategy for FirstFit {
    fn name(&self) -> &'static str {
        "first-fit"
    }

    fn score(&self, _node: &Node, _request: &ResourceRequest) -> u64 {
        0
    }
}

pub fn strategy_for(policy: RankingPolicy) -> Arc<dyn RankingStrategy> {
    match policy {
        RankingPolicy::LeastAllocated => Arc::new(LeastAllocated),
        RankingPolicy::MostAllocated => Arc::new(MostAllocated),
        RankingPolicy::FirstFit => Arc::new(FirstFit),
    }
}

/// Mean per-mille utilization over CPU, memory and the requested
/// accelerators, as it would be after placing `request`. Dimensions the node
/// has no capacity for are skipped.
pub fn utilization_after(node: &Node, request: &ResourceRequest) -> u64 {
    let mut dimensions = vec![
        (node.allocated.cpu_millis, request.cpu_millis, node.capacity.cpu_millis),
        (node.allocated.memory_bytes, request.memory_bytes, node.capacity.memory_bytes),
    ];
    for (name, count) in &request.accelerators {
        dimensions.push((
            u64::from(node.allocated.accelerator(name)),
            u64::from(*count),
            u64::from(node.capacity.accelerator(name)),
        ));
    }

    let ratios: Vec<u128> = dimensions
        .into_iter()
        .filter(|(_, _, capacity)| *capacity > 0)
        .map(|(used, wanted, capacity)| {
            let after = u128::from(used) + u128::from(wanted);
            (after * 1000 / u128::from(capacity)).min(1000)
        })
        .collect();

    if ratios.is_empty() {
        return 0;
    }
    (ratios.iter().sum::<u128>() / ratios.len() as u128) as u64
}
