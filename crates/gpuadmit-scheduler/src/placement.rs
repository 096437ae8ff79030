//! Placement decisions for tasks
//!
//! The engine filters candidate nodes by free capacity and taint admission,
//! ranks the survivors, and commits the request onto the best one through an
//! [`AllocationLedger`]:
//!
//! 1. Resolve the task's tolerations from the policy
//! 2. Drop nodes without enough free capacity
//! 3. Drop nodes with untolerated NoSchedule/NoExecute taints
//! 4. Rank by soft-preference penalty, then by the ranking strategy
//! 5. Commit; on a lost race move on to the next ranked node

use gpuadmit_core::{AdmitError, AdmitResult, Node, ResourceRequest, Toleration};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cluster::{Allocation, AllocationId, AllocationLedger, CommitOutcome};
use crate::matcher::{self, Admission};
use crate::policy::TolerationPolicy;
use crate::ranking::RankingStrategy;

/// Why a task was not placed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RejectReason {
    /// No node has enough free capacity
    InsufficientCapacity,
    /// Nodes with capacity exist but carry taints the task does not tolerate
    TaintMismatch,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::InsufficientCapacity => write!(f, "InsufficientCapacity"),
            RejectReason::TaintMismatch => write!(f, "TaintMismatch"),
        }
    }
}

/// Placement decision for a task
#[derive(Debug, Clone, Serialize)]
pub struct PlacementDecision {
    pub accepted: bool,
    /// Chosen node, when accepted
    pub node_id: Option<String>,
    /// Rejection reason, when not accepted
    pub reason: Option<RejectReason>,
    /// Human readable context for a rejection
    pub detail: Option<String>,
    /// Tolerations to inject into the task's execution unit
    pub tolerations: Vec<Toleration>,
    /// Handle for releasing the committed resources
    pub allocation_id: Option<AllocationId>,
}

impl PlacementDecision {
    fn accepted(allocation: &Allocation, tolerations: Vec<Toleration>) -> Self {
        Self {
            accepted: true,
            node_id: Some(allocation.node_id.clone()),
            reason: None,
            detail: None,
            tolerations,
            allocation_id: Some(allocation.id),
        }
    }

    fn rejected(reason: RejectReason, detail: String, tolerations: Vec<Toleration>) -> Self {
        Self {
            accepted: false,
            node_id: None,
            reason: Some(reason),
            detail: Some(detail),
            tolerations,
            allocation_id: None,
        }
    }

    /// Turn a rejection into the matching error
    pub fn into_result(self) -> AdmitResult<Self> {
        if self.accepted {
            return Ok(self);
        }
        let detail = self.detail.unwrap_or_default();
        match self.reason {
            Some(RejectReason::TaintMismatch) => Err(AdmitError::TaintMismatch(detail)),
            Some(RejectReason::InsufficientCapacity) => {
                Err(AdmitError::InsufficientCapacity(detail))
            }
            None => Err(AdmitError::Internal(
                "rejected placement without a reason".to_string(),
            )),
        }
    }
}

/// Per-node view of why a node would or would not take a task
#[derive(Debug, Clone, Serialize)]
pub struct NodeEvaluation {
    pub node_id: String,
    /// Free capacity covers the request
    pub fits: bool,
    /// Components the node is short of
    pub shortfall: Vec<String>,
    pub admission: Admission,
    /// Ranking strategy score (lower ranks first)
    pub score: u64,
}

impl NodeEvaluation {
    /// Capacity is checked before taints
    pub fn verdict(&self) -> Result<(), RejectReason> {
        if !self.fits {
            Err(RejectReason::InsufficientCapacity)
        } else if !self.admission.admitted {
            Err(RejectReason::TaintMismatch)
        } else {
            Ok(())
        }
    }
}

/// An admissible node in ranking order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedNode {
    pub node_id: String,
    pub penalty: u32,
    pub score: u64,
    /// Position in the candidate list, the final tie-break
    pub index: usize,
}

/// Selects a node for each task and commits the allocation
pub struct PlacementEngine {
    policy: Arc<TolerationPolicy>,
    strategy: Arc<dyn RankingStrategy>,
    max_commit_attempts: u32,
}

impl PlacementEngine {
    pub fn new(policy: Arc<TolerationPolicy>, strategy: Arc<dyn RankingStrategy>) -> Self {
        Self {
            policy,
            strategy,
            max_commit_attempts: 3,
        }
    }

    /// Bound on commits per placement; at least one is always made
    pub fn with_max_commit_attempts(mut self, attempts: u32) -> Self {
        self.max_commit_attempts = attempts.max(1);
        self
    }

    pub fn policy(&self) -> &TolerationPolicy {
        &self.policy
    }

    pub fn strategy(&self) -> &dyn RankingStrategy {
        self.strategy.as_ref()
    }

    /// Evaluate every candidate without filtering
    pub fn evaluate(
        &self,
        request: &ResourceRequest,
        candidates: &[Node],
        tolerations: &[Toleration],
    ) -> Vec<NodeEvaluation> {
        candidates
            .iter()
            .map(|node| {
                let available = node.available();
                NodeEvaluation {
                    node_id: node.id.clone(),
                    fits: request.fits_within(&available),
                    shortfall: request.shortfall(&available),
                    admission: matcher::evaluate(&node.taints, tolerations),
                    score: self.strategy.score(node, request),
                }
            })
            .collect()
    }

    /// Filter and rank candidates.
    ///
    /// On failure returns the most specific reason: `TaintMismatch` when some
    /// node had room but was tainted, `InsufficientCapacity` otherwise.
    pub fn rank(
        &self,
        request: &ResourceRequest,
        candidates: &[Node],
        tolerations: &[Toleration],
    ) -> Result<Vec<RankedNode>, (RejectReason, String)> {
        let mut with_capacity = 0usize;
        let mut ranked = Vec::new();

        for (index, node) in candidates.iter().enumerate() {
            let available = node.available();
            if !request.fits_within(&available) {
                debug!(
                    node = %node.id,
                    shortfall = ?request.shortfall(&available),
                    "Excluded: insufficient capacity"
                );
                continue;
            }
            with_capacity += 1;

            let admission = matcher::evaluate(&node.taints, tolerations);
            if !admission.admitted {
                debug!(
                    node = %node.id,
                    untolerated = ?admission.untolerated,
                    "Excluded: taint mismatch"
                );
                continue;
            }

            ranked.push(RankedNode {
                node_id: node.id.clone(),
                penalty: admission.penalty,
                score: self.strategy.score(node, request),
                index,
            });
        }

        if ranked.is_empty() {
            return Err(if with_capacity > 0 {
                (
                    RejectReason::TaintMismatch,
                    format!(
                        "{} node(s) with free capacity carry taints not tolerated by the task",
                        with_capacity
                    ),
                )
            } else {
                (
                    RejectReason::InsufficientCapacity,
                    format!(
                        "none of {} candidate node(s) can fit {}",
                        candidates.len(),
                        request
                    ),
                )
            });
        }

        ranked.sort_by_key(|r| (r.penalty, r.score, r.index));
        Ok(ranked)
    }

    /// Place `request` onto one of `candidates` and commit it to `ledger`.
    ///
    /// A policy gap is returned as an error; every other failure is a rejected
    /// decision carrying its reason.
    pub async fn place(
        &self,
        request: &ResourceRequest,
        candidates: &[Node],
        ledger: &dyn AllocationLedger,
    ) -> AdmitResult<PlacementDecision> {
        let tolerations = self.policy.resolve(&request.accelerators)?;

        let ranked = match self.rank(request, candidates, &tolerations) {
            Ok(ranked) => ranked,
            Err((reason, detail)) => {
                info!(reason = %reason, detail = %detail, "Placement rejected");
                return Ok(PlacementDecision::rejected(reason, detail, tolerations));
            }
        };

        let mut attempts = 0u32;
        for candidate in &ranked {
            if attempts == self.max_commit_attempts {
                break;
            }
            attempts += 1;

            let outcome = match ledger.try_allocate(&candidate.node_id, request).await {
                Ok(outcome) => outcome,
                Err(AdmitError::NodeNotFound(_)) => {
                    warn!(node = %candidate.node_id, "Candidate node left the cluster, trying next node");
                    continue;
                }
                Err(e) => return Err(e),
            };

            match outcome {
                CommitOutcome::Committed(allocation) => {
                    info!(
                        node = %candidate.node_id,
                        allocation_id = %allocation.id,
                        penalty = candidate.penalty,
                        score = candidate.score,
                        strategy = self.strategy.name(),
                        tolerations = tolerations.len(),
                        "Placement accepted"
                    );
                    return Ok(PlacementDecision::accepted(&allocation, tolerations));
                }
                CommitOutcome::Conflict { available } => {
                    warn!(
                        node = %candidate.node_id,
                        attempt = attempts,
                        available = %available,
                        "Capacity taken by a concurrent placement, trying next node"
                    );
                }
            }
        }

        let detail = format!(
            "capacity taken by concurrent placements after {} commit attempt(s)",
            attempts
        );
        info!(reason = %RejectReason::InsufficientCapacity, detail = %detail, "Placement rejected");
        Ok(PlacementDecision::rejected(
            RejectReason::InsufficientCapacity,
            detail,
            tolerations,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterState;
    use crate::ranking::{FirstFit, LeastAllocated, MostAllocated};
    use gpuadmit_core::{Taint, TaintEffect};

    const GPU: &str = "nvidia.com/gpu";

    fn gpu_taint() -> Taint {
        Taint::new("gpu", "true", TaintEffect::NoSchedule)
    }

    fn gpu_policy() -> Arc<TolerationPolicy> {
        Arc::new(TolerationPolicy::new(true).with_templates(
            GPU,
            vec![Toleration::equal("gpu", "true", TaintEffect::NoSchedule)],
        ))
    }

    fn engine(strategy: Arc<dyn RankingStrategy>) -> PlacementEngine {
        PlacementEngine::new(gpu_policy(), strategy)
    }

    fn cpu_node(id: &str, cpu: u64) -> Node {
        Node::new(id, ResourceRequest::new(cpu, 8 << 30))
    }

    fn gpu_node(id: &str, gpus: u32) -> Node {
        Node::new(id, ResourceRequest::new(8000, 32 << 30).with_accelerator(GPU, gpus))
            .with_taint(gpu_taint())
    }

    async fn place_on(
        engine: &PlacementEngine,
        request: &ResourceRequest,
        nodes: Vec<Node>,
    ) -> PlacementDecision {
        let cluster = ClusterState::from_nodes(nodes.clone()).unwrap();
        engine.place(request, &nodes, &cluster).await.unwrap()
    }

    #[tokio::test]
    async fn test_gpu_task_lands_on_tainted_gpu_node() {
        let request = ResourceRequest::new(1000, 1 << 30).with_accelerator(GPU, 1);
        let decision = place_on(
            &engine(Arc::new(LeastAllocated)),
            &request,
            vec![cpu_node("cpu-1", 8000), gpu_node("gpu-1", 4)],
        )
        .await;

        assert!(decision.accepted);
        assert_eq!(decision.node_id.as_deref(), Some("gpu-1"));
        assert!(decision.allocation_id.is_some());
        assert_eq!(
            decision.tolerations,
            vec![Toleration::equal("gpu", "true", TaintEffect::NoSchedule)]
        );
    }

    #[tokio::test]
    async fn test_cpu_task_rejected_by_gpu_taint() {
        let request = ResourceRequest::new(1000, 1 << 30);
        let decision = place_on(
            &engine(Arc::new(LeastAllocated)),
            &request,
            vec![gpu_node("gpu-1", 4)],
        )
        .await;

        assert!(!decision.accepted);
        assert_eq!(decision.reason, Some(RejectReason::TaintMismatch));
        assert!(matches!(
            decision.into_result(),
            Err(AdmitError::TaintMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_capacity_failure_never_reported_as_taint_mismatch() {
        // Too small and tainted: capacity is checked first
        let request = ResourceRequest::new(1000, 0).with_accelerator(GPU, 8);
        let decision = place_on(
            &engine(Arc::new(LeastAllocated)),
            &request,
            vec![gpu_node("gpu-1", 4), cpu_node("cpu-1", 500)],
        )
        .await;

        assert_eq!(decision.reason, Some(RejectReason::InsufficientCapacity));
        assert!(decision.into_result().unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_taint_mismatch_preferred_over_capacity() {
        // cpu-1 is too small, gpu-1 has room but the task has no gpu toleration
        let request = ResourceRequest::new(2000, 0);
        let decision = place_on(
            &engine(Arc::new(LeastAllocated)),
            &request,
            vec![cpu_node("cpu-1", 1000), gpu_node("gpu-1", 4)],
        )
        .await;

        assert_eq!(decision.reason, Some(RejectReason::TaintMismatch));
    }

    #[tokio::test]
    async fn test_no_candidates_is_insufficient_capacity() {
        let decision = place_on(
            &engine(Arc::new(LeastAllocated)),
            &ResourceRequest::new(1, 1),
            Vec::new(),
        )
        .await;
        assert_eq!(decision.reason, Some(RejectReason::InsufficientCapacity));
    }

    #[tokio::test]
    async fn test_unconfigured_accelerator_propagates() {
        let request = ResourceRequest::new(0, 0).with_accelerator("amd.com/gpu", 1);
        let cluster = ClusterState::new();
        let result = engine(Arc::new(LeastAllocated))
            .place(&request, &[], &cluster)
            .await;
        assert!(matches!(result, Err(AdmitError::UnconfiguredAccelerator(_))));
    }

    #[test]
    fn test_zero_penalty_ranks_first() {
        // The penalized node is emptier, which least-allocated would prefer
        let spot = cpu_node("spot", 64000)
            .with_taint(Taint::new("spot", "true", TaintEffect::PreferNoSchedule));
        let busy = cpu_node("busy", 8000).with_allocated(ResourceRequest::new(6000, 0));

        let ranked = engine(Arc::new(LeastAllocated))
            .rank(&ResourceRequest::new(1000, 0), &[spot, busy], &[])
            .unwrap();
        assert_eq!(ranked[0].node_id, "busy");
        assert_eq!(ranked[1].penalty, 1);
    }

    #[test]
    fn test_secondary_key_orders_by_strategy() {
        let nodes = vec![
            cpu_node("busy", 8000).with_allocated(ResourceRequest::new(6000, 0)),
            cpu_node("idle", 8000),
        ];
        let request = ResourceRequest::new(1000, 0);

        let spread = engine(Arc::new(LeastAllocated)).rank(&request, &nodes, &[]).unwrap();
        assert_eq!(spread[0].node_id, "idle");

        let packed = engine(Arc::new(MostAllocated)).rank(&request, &nodes, &[]).unwrap();
        assert_eq!(packed[0].node_id, "busy");

        let first = engine(Arc::new(FirstFit)).rank(&request, &nodes, &[]).unwrap();
        assert_eq!(first[0].node_id, "busy");
        assert_eq!(first[1].node_id, "idle");
    }

    #[test]
    fn test_ranking_is_deterministic() {
        let nodes: Vec<Node> = (0..5).map(|i| cpu_node(&format!("n{}", i), 4000)).collect();
        let request = ResourceRequest::new(1000, 0);
        let engine = engine(Arc::new(LeastAllocated));

        let first = engine.rank(&request, &nodes, &[]).unwrap();
        for _ in 0..10 {
            assert_eq!(engine.rank(&request, &nodes, &[]).unwrap(), first);
        }
        assert_eq!(first[0].node_id, "n0");
    }

    #[test]
    fn test_evaluate_reports_every_node() {
        let nodes = vec![cpu_node("small", 500), gpu_node("gpu-1", 2)];
        let request = ResourceRequest::new(1000, 0);
        let evaluations = engine(Arc::new(LeastAllocated)).evaluate(&request, &nodes, &[]);

        assert_eq!(evaluations.len(), 2);
        assert_eq!(
            evaluations[0].verdict(),
            Err(RejectReason::InsufficientCapacity)
        );
        assert_eq!(evaluations[0].shortfall.len(), 1);
        assert_eq!(evaluations[1].verdict(), Err(RejectReason::TaintMismatch));
        assert_eq!(evaluations[1].admission.untolerated, vec![gpu_taint()]);
    }

    #[tokio::test]
    async fn test_stale_snapshot_falls_through_to_next_node() {
        let nodes = vec![cpu_node("a", 2000), cpu_node("b", 2000)];
        let cluster = ClusterState::from_nodes(nodes.clone()).unwrap();
        let engine = engine(Arc::new(FirstFit));
        let request = ResourceRequest::new(2000, 0);

        // Fill "a" behind the snapshot's back
        cluster.try_allocate("a", &request).await.unwrap();

        let decision = engine.place(&request, &nodes, &cluster).await.unwrap();
        assert!(decision.accepted);
        assert_eq!(decision.node_id.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_commit_attempts_are_bounded() {
        let nodes: Vec<Node> = (0..4).map(|i| cpu_node(&format!("n{}", i), 1000)).collect();
        let cluster = ClusterState::from_nodes(nodes.clone()).unwrap();
        let request = ResourceRequest::new(1000, 0);
        for node in &nodes {
            cluster.try_allocate(&node.id, &request).await.unwrap();
        }

        let engine = engine(Arc::new(FirstFit)).with_max_commit_attempts(2);
        let decision = engine.place(&request, &nodes, &cluster).await.unwrap();
        assert_eq!(decision.reason, Some(RejectReason::InsufficientCapacity));
        assert!(decision.detail.unwrap().contains("2 commit attempt"));
    }
}
