//! Main scheduler logic

use gpuadmit_core::{AdmitConfig, AdmitResult, RawResourceSpec, ResourceRequest, Toleration};
use std::sync::Arc;
use tracing::{debug, info};

use crate::cluster::{AllocationId, AllocationLedger, ClusterState};
use crate::placement::{NodeEvaluation, PlacementDecision, PlacementEngine};
use crate::policy::TolerationPolicy;
use crate::ranking::strategy_for;

/// Scheduler places tasks onto the nodes of a shared cluster state
pub struct Scheduler {
    /// Nodes and their allocations
    cluster: Arc<ClusterState>,
    /// Filtering, ranking and commit logic
    engine: PlacementEngine,
}

impl Scheduler {
    /// Create a scheduler from its parts
    pub fn new(cluster: Arc<ClusterState>, engine: PlacementEngine) -> Self {
        Self { cluster, engine }
    }

    /// Create a scheduler from configuration
    pub fn from_config(config: &AdmitConfig, cluster: Arc<ClusterState>) -> AdmitResult<Self> {
        let policy = Arc::new(TolerationPolicy::from_config(config.policy())?);
        let strategy = strategy_for(config.scheduler.ranking);

        info!(
            ranking = strategy.name(),
            strict = policy.is_strict(),
            max_commit_attempts = config.scheduler.max_commit_attempts,
            "Scheduler initialized"
        );

        let engine = PlacementEngine::new(policy, strategy)
            .with_max_commit_attempts(config.scheduler.max_commit_attempts);
        Ok(Self::new(cluster, engine))
    }

    pub fn cluster(&self) -> &Arc<ClusterState> {
        &self.cluster
    }

    pub fn engine(&self) -> &PlacementEngine {
        &self.engine
    }

    /// Tolerations a task with this request would be given
    pub fn tolerations_for(&self, request: &ResourceRequest) -> AdmitResult<Vec<Toleration>> {
        self.engine.policy().resolve(&request.accelerators)
    }

    /// Place a task against the current cluster state
    pub async fn schedule(&self, request: &ResourceRequest) -> AdmitResult<PlacementDecision> {
        let snapshot = self.cluster.snapshot().await;
        debug!(
            request = %request,
            candidates = snapshot.len(),
            "Scheduling task"
        );
        self.engine
            .place(request, &snapshot, self.cluster.as_ref())
            .await
    }

    /// Normalize a declared resource spec, then place it
    pub async fn schedule_raw(&self, raw: &RawResourceSpec) -> AdmitResult<PlacementDecision> {
        let request = raw.normalize()?;
        self.schedule(&request).await
    }

    /// Release a committed placement. Releasing twice is a no-op.
    pub async fn release(&self, allocation: AllocationId) -> AdmitResult<bool> {
        self.cluster.release(allocation).await
    }

    /// Per-node evaluation of a request against the current cluster state
    pub async fn explain(&self, request: &ResourceRequest) -> AdmitResult<Vec<NodeEvaluation>> {
        let tolerations = self.tolerations_for(request)?;
        let snapshot = self.cluster.snapshot().await;
        Ok(self.engine.evaluate(request, &snapshot, &tolerations))
    }
}
