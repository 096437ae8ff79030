//! Error types for gpuadmit

use thiserror::Error;

/// Main error type for gpuadmit
#[derive(Error, Debug)]
pub enum AdmitError {
    /// Malformed resource request, to be corrected by the task submitter
    #[error("Invalid resource spec: {0}")]
    InvalidSpec(String),

    /// An accelerator was requested that the toleration policy does not cover
    #[error("Unconfigured accelerator: {0}")]
    UnconfiguredAccelerator(String),

    /// No node had enough free capacity
    #[error("Insufficient capacity: {0}")]
    InsufficientCapacity(String),

    /// Nodes had capacity but carried taints the task does not tolerate
    #[error("Taint mismatch: {0}")]
    TaintMismatch(String),

    /// Node not found
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Node registered twice
    #[error("Duplicate node: {0}")]
    DuplicateNode(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for gpuadmit operations
pub type AdmitResult<T> = Result<T, AdmitError>;

impl AdmitError {
    /// Whether re-queueing the same attempt against a later cluster state can succeed.
    ///
    /// `UnconfiguredAccelerator` and `TaintMismatch` only clear after an operator
    /// changes the policy or the node pool, so they are not retryable here.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdmitError::InsufficientCapacity(_))
    }

    /// Whether the error is the task submitter's to fix
    pub fn is_user_error(&self) -> bool {
        matches!(self, AdmitError::InvalidSpec(_))
    }

    /// Whether the error points at cluster or policy configuration
    pub fn is_operator_error(&self) -> bool {
        matches!(
            self,
            AdmitError::UnconfiguredAccelerator(_) | AdmitError::TaintMismatch(_) | AdmitError::Config(_)
        )
    }
}

impl From<toml::de::Error> for AdmitError {
    fn from(err: toml::de::Error) -> Self {
        AdmitError::Config(err.to_string())
    }
}
