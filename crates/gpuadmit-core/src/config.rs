//! Configuration types for gpuadmit

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::{AdmitError, AdmitResult, Node, RawResourceSpec, RawResources, Taint, Toleration};

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmitConfig {
    /// Placement engine settings
    pub scheduler: SchedulerConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Plugin configuration, laid out like the orchestrator's `plugins.k8s` section
    pub plugins: PluginsConfig,
}

impl AdmitConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> AdmitResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AdmitError::Config(format!("Failed to read config file: {}", e)))?;
        let config = Self::from_toml(&content)?;
        debug!(
            path = %path.display(),
            accelerators = config.plugins.k8s.resource_tolerations.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    pub fn from_toml(content: &str) -> AdmitResult<Self> {
        toml::from_str(content)
            .map_err(|e| AdmitError::Config(format!("Failed to parse config: {}", e)))
    }

    /// The toleration policy section
    pub fn policy(&self) -> &K8sPluginConfig {
        &self.plugins.k8s
    }
}

/// Placement engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Secondary ranking key applied after the soft-preference penalty
    pub ranking: RankingPolicy,
    /// Commit attempts per placement before giving up on lost races
    pub max_commit_attempts: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            ranking: RankingPolicy::LeastAllocated,
            max_commit_attempts: 3,
        }
    }
}

/// Secondary ranking key for admissible nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RankingPolicy {
    /// Prefer the node that stays emptiest after placement (spreading)
    #[default]
    LeastAllocated,
    /// Prefer the node that ends up fullest (bin packing)
    MostAllocated,
    /// Keep the candidate order
    FirstFit,
}

impl std::fmt::Display for RankingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RankingPolicy::LeastAllocated => write!(f, "least-allocated"),
            RankingPolicy::MostAllocated => write!(f, "most-allocated"),
            RankingPolicy::FirstFit => write!(f, "first-fit"),
        }
    }
}

impl std::str::FromStr for RankingPolicy {
    type Err = AdmitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "least-allocated" => Ok(RankingPolicy::LeastAllocated),
            "most-allocated" => Ok(RankingPolicy::MostAllocated),
            "first-fit" => Ok(RankingPolicy::FirstFit),
            other => Err(AdmitError::Config(format!("unknown ranking policy: {}", other))),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or text)
    pub format: String,
    /// Log file path (if any)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    pub k8s: K8sPluginConfig,
}

/// Toleration policy as written by the operator
///
/// ```toml
/// [plugins.k8s.resource-tolerations]
/// "nvidia.com/gpu" = [{ key = "key1", operator = "Equal", value = "value1", effect = "NoSchedule" }]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct K8sPluginConfig {
    /// Fail placements requesting accelerators with no configured tolerations
    pub strict: bool,
    /// Tolerations added to every task
    pub default_tolerations: Vec<Toleration>,
    /// Accelerator resource name to the tolerations a requesting task receives
    pub resource_tolerations: BTreeMap<String, Vec<Toleration>>,
}

impl Default for K8sPluginConfig {
    fn default() -> Self {
        Self {
            strict: true,
            default_tolerations: Vec::new(),
            resource_tolerations: BTreeMap::new(),
        }
    }
}

/// Cluster snapshot file used by the dry-run tooling
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterFile {
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

impl ClusterFile {
    pub fn from_file(path: &Path) -> AdmitResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Normalize every node's resources
    pub fn into_nodes(self) -> AdmitResult<Vec<Node>> {
        self.nodes.into_iter().map(NodeConfig::into_node).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    #[serde(default)]
    pub taints: Vec<Taint>,
    pub capacity: RawResources,
    #[serde(default)]
    pub allocated: RawResources,
}

impl NodeConfig {
    pub fn into_node(self) -> AdmitResult<Node> {
        let capacity = self
            .capacity
            .normalize()
            .map_err(|e| AdmitError::Config(format!("node {}: capacity: {}", self.id, e)))?;
        let allocated = self
            .allocated
            .normalize()
            .map_err(|e| AdmitError::Config(format!("node {}: allocated: {}", self.id, e)))?;
        Ok(Node {
            id: self.id,
            taints: self.taints,
            capacity,
            allocated,
        })
    }
}

/// Batch of task declarations used by the dry-run tooling
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFile {
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

impl TaskFile {
    pub fn from_file(path: &Path) -> AdmitResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub name: String,
    #[serde(flatten)]
    pub resources: RawResourceSpec,
}
