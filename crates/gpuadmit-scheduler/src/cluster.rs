//! Cluster state: node capacity tracking and atomic allocation commits

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gpuadmit_core::{AdmitError, AdmitResult, Node, ResourceRequest};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

/// Handle returned by a committed placement, used to release it
pub type AllocationId = Uuid;

/// A committed placement
#[derive(Debug, Clone, Serialize)]
pub struct Allocation {
    pub id: AllocationId,
    pub node_id: String,
    pub request: ResourceRequest,
    pub committed_at: DateTime<Utc>,
}

/// Result of trying to commit a request onto a node
#[derive(Debug, Clone)]
pub enum CommitOutcome {
    /// Capacity was still free and is now allocated
    Committed(Allocation),
    /// A concurrent commit took the capacity since the snapshot was taken
    Conflict { available: ResourceRequest },
}

/// Where the placement engine commits and releases node allocations
#[async_trait]
pub trait AllocationLedger: Send + Sync {
    /// Re-check free capacity and allocate `request` on the node in one step
    async fn try_allocate(&self, node_id: &str, request: &ResourceRequest)
        -> AdmitResult<CommitOutcome>;

    /// Return an allocation's resources to its node.
    ///
    /// Returns `false` if the allocation is unknown or already released.
    async fn release(&self, id: AllocationId) -> AdmitResult<bool>;
}

/// In-memory cluster state
///
/// Each node sits behind its own mutex so that capacity check and increment
/// happen under one lock while commits on different nodes proceed in
/// parallel. The node map lock is held for reading during commits and for
/// writing only when nodes are added or removed.
pub struct ClusterState {
    nodes: RwLock<BTreeMap<String, Arc<Mutex<Node>>>>,
    allocations: Mutex<HashMap<AllocationId, Allocation>>,
}

impl ClusterState {
    /// Create an empty cluster
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(BTreeMap::new()),
            allocations: Mutex::new(HashMap::new()),
        }
    }

    /// Create a cluster from a node list
    pub fn from_nodes(nodes: impl IntoIterator<Item = Node>) -> AdmitResult<Self> {
        let mut map = BTreeMap::new();
        for node in nodes {
            if map.contains_key(&node.id) {
                return Err(AdmitError::DuplicateNode(node.id));
            }
            map.insert(node.id.clone(), Arc::new(Mutex::new(node)));
        }
        info!(nodes = map.len(), "Cluster state initialized");
        Ok(Self {
            nodes: RwLock::new(map),
            allocations: Mutex::new(HashMap::new()),
        })
    }

    /// Register a node
    pub async fn add_node(&self, node: Node) -> AdmitResult<()> {
        let mut nodes = self.nodes.write().await;
        if nodes.contains_key(&node.id) {
            return Err(AdmitError::DuplicateNode(node.id));
        }
        info!(node = %node.id, taints = node.taints.len(), "Node added");
        nodes.insert(node.id.clone(), Arc::new(Mutex::new(node)));
        Ok(())
    }

    /// Remove a node and forget its live allocations
    pub async fn remove_node(&self, id: &str) -> AdmitResult<Node> {
        let mut nodes = self.nodes.write().await;
        let entry = nodes
            .remove(id)
            .ok_or_else(|| AdmitError::NodeNotFound(id.to_string()))?;

        let mut allocations = self.allocations.lock().await;
        let before = allocations.len();
        allocations.retain(|_, a| a.node_id != id);
        info!(node = %id, dropped_allocations = before - allocations.len(), "Node removed");

        let node = entry.lock().await.clone();
        Ok(node)
    }

    /// Copy of every node, ordered by id
    pub async fn snapshot(&self) -> Vec<Node> {
        let nodes = self.nodes.read().await;
        let mut snapshot = Vec::with_capacity(nodes.len());
        for entry in nodes.values() {
            snapshot.push(entry.lock().await.clone());
        }
        snapshot
    }

    /// Copy of one node
    pub async fn node(&self, id: &str) -> AdmitResult<Node> {
        let nodes = self.nodes.read().await;
        let entry = nodes
            .get(id)
            .ok_or_else(|| AdmitError::NodeNotFound(id.to_string()))?;
        let node = entry.lock().await.clone();
        Ok(node)
    }

    pub async fn node_count(&self) -> usize {
        self.nodes.read().await.len()
    }

    /// Live allocations, oldest first
    pub async fn allocations(&self) -> Vec<Allocation> {
        let mut list: Vec<Allocation> = self.allocations.lock().await.values().cloned().collect();
        list.sort_by_key(|a| a.committed_at);
        list
    }
}

impl Default for ClusterState {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AllocationLedger for ClusterState {
    async fn try_allocate(
        &self,
        node_id: &str,
        request: &ResourceRequest,
    ) -> AdmitResult<CommitOutcome> {
        let nodes = self.nodes.read().await;
        let entry = nodes
            .get(node_id)
            .ok_or_else(|| AdmitError::NodeNotFound(node_id.to_string()))?;

        let allocation = {
            let mut node = entry.lock().await;
            if !node.can_fit(request) {
                return Ok(CommitOutcome::Conflict {
                    available: node.available(),
                });
            }
            node.allocated = node.allocated.checked_add(request).ok_or_else(|| {
                AdmitError::Internal(format!("allocation overflow on node {}", node_id))
            })?;

            Allocation {
                id: Uuid::new_v4(),
                node_id: node_id.to_string(),
                request: request.clone(),
                committed_at: Utc::now(),
            }
        };

        self.allocations
            .lock()
            .await
            .insert(allocation.id, allocation.clone());

        info!(
            allocation_id = %allocation.id,
            node = %node_id,
            request = %request,
            "Allocated resources"
        );

        Ok(CommitOutcome::Committed(allocation))
    }

    async fn release(&self, id: AllocationId) -> AdmitResult<bool> {
        let Some(allocation) = self.allocations.lock().await.remove(&id) else {
            debug!(allocation_id = %id, "Release of unknown allocation ignored");
            return Ok(false);
        };

        let nodes = self.nodes.read().await;
        if let Some(entry) = nodes.get(&allocation.node_id) {
            let mut node = entry.lock().await;
            node.allocated = node.allocated.saturating_sub(&allocation.request);
        }

        info!(
            allocation_id = %id,
            node = %allocation.node_id,
            "Released resources"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpu_node(id: &str, gpus: u32) -> Node {
        Node::new(
            id,
            ResourceRequest::new(8000, 32 << 30).with_accelerator("nvidia.com/gpu", gpus),
        )
    }

    #[tokio::test]
    async fn test_empty_cluster() {
        let cluster = ClusterState::new();
        assert_eq!(cluster.node_count().await, 0);
        assert!(cluster.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_node_rejected() {
        let result = ClusterState::from_nodes(vec![gpu_node("a", 1), gpu_node("a", 2)]);
        assert!(matches!(result, Err(AdmitError::DuplicateNode(_))));

        let cluster = ClusterState::from_nodes(vec![gpu_node("a", 1)]).unwrap();
        let result = cluster.add_node(gpu_node("a", 1)).await;
        assert!(matches!(result, Err(AdmitError::DuplicateNode(_))));
    }

    #[tokio::test]
    async fn test_allocate_and_release() {
        let cluster = ClusterState::from_nodes(vec![gpu_node("a", 4)]).unwrap();
        let request = ResourceRequest::new(1000, 1 << 30).with_accelerator("nvidia.com/gpu", 2);

        let allocation = match cluster.try_allocate("a", &request).await.unwrap() {
            CommitOutcome::Committed(a) => a,
            other => panic!("expected commit, got {:?}", other),
        };
        let node = cluster.node("a").await.unwrap();
        assert_eq!(node.allocated.accelerator("nvidia.com/gpu"), 2);
        assert_eq!(cluster.allocations().await.len(), 1);

        assert!(cluster.release(allocation.id).await.unwrap());
        let node = cluster.node("a").await.unwrap();
        assert!(node.allocated.is_empty());
        assert!(cluster.allocations().await.is_empty());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let cluster = ClusterState::from_nodes(vec![gpu_node("a", 4)]).unwrap();
        let request = ResourceRequest::new(1000, 0);
        let CommitOutcome::Committed(allocation) = cluster.try_allocate("a", &request).await.unwrap()
        else {
            panic!("expected commit");
        };

        assert!(cluster.release(allocation.id).await.unwrap());
        assert!(!cluster.release(allocation.id).await.unwrap());
        assert!(!cluster.release(Uuid::new_v4()).await.unwrap());
        assert_eq!(cluster.node("a").await.unwrap().allocated.cpu_millis, 0);
    }

    #[tokio::test]
    async fn test_commit_revalidates_capacity() {
        let cluster = ClusterState::from_nodes(vec![gpu_node("a", 2)]).unwrap();
        let request = ResourceRequest::new(0, 0).with_accelerator("nvidia.com/gpu", 2);

        assert!(matches!(
            cluster.try_allocate("a", &request).await.unwrap(),
            CommitOutcome::Committed(_)
        ));
        match cluster.try_allocate("a", &request).await.unwrap() {
            CommitOutcome::Conflict { available } => {
                assert_eq!(available.accelerator("nvidia.com/gpu"), 0)
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_allocate_unknown_node() {
        let cluster = ClusterState::new();
        let result = cluster.try_allocate("missing", &ResourceRequest::default()).await;
        assert!(matches!(result, Err(AdmitError::NodeNotFound(_))));
    }

    #[tokio::test]
    async fn test_remove_node_drops_allocations() {
        let cluster = ClusterState::from_nodes(vec![gpu_node("a", 1), gpu_node("b", 1)]).unwrap();
        let request = ResourceRequest::new(100, 0);
        cluster.try_allocate("a", &request).await.unwrap();
        cluster.try_allocate("b", &request).await.unwrap();

        let removed = cluster.remove_node("a").await.unwrap();
        assert_eq!(removed.allocated.cpu_millis, 100);

        let remaining = cluster.allocations().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].node_id, "b");
        assert!(matches!(
            cluster.remove_node("a").await,
            Err(AdmitError::NodeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_snapshot_ordered_by_id() {
        let cluster =
            ClusterState::from_nodes(vec![gpu_node("c", 1), gpu_node("a", 1), gpu_node("b", 1)])
                .unwrap();
        let ids: Vec<String> = cluster.snapshot().await.into_iter().map(|n| n.id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
