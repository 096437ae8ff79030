//! gpuadmit-scheduler: GPU-aware admission and placement
//!
//! This crate decides where a task runs:
//! - Toleration policy resolution for accelerator requests
//! - Taint/toleration matching
//! - Node ranking and placement decisions
//! - Cluster state with atomic allocation commits

pub mod cluster;
pub mod matcher;
pub mod placement;
pub mod policy;
pub mod ranking;
pub mod scheduler;

pub use cluster::{Allocation, AllocationId, AllocationLedger, ClusterState, CommitOutcome};
pub use matcher::{admits, Admission};
pub use placement::{NodeEvaluation, PlacementDecision, PlacementEngine, RejectReason};
pub use policy::{resolve_tolerations, TolerationPolicy};
pub use ranking::{strategy_for, RankingStrategy};
pub use scheduler::Scheduler;
