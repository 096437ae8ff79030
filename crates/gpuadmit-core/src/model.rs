//! Taint, Toleration and Node type definitions

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{AdmitError, AdmitResult, ResourceRequest};

/// Effect of a taint on tasks that do not tolerate it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaintEffect {
    /// Untolerating tasks are never placed on the node
    NoSchedule,
    /// Untolerating tasks are placed there only as a last resort
    PreferNoSchedule,
    /// Untolerating tasks are neither placed nor kept on the node
    NoExecute,
}

impl TaintEffect {
    /// Whether an untolerated taint with this effect blocks admission
    pub fn is_blocking(&self) -> bool {
        matches!(self, TaintEffect::NoSchedule | TaintEffect::NoExecute)
    }
}

impl fmt::Display for TaintEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaintEffect::NoSchedule => write!(f, "NoSchedule"),
            TaintEffect::PreferNoSchedule => write!(f, "PreferNoSchedule"),
            TaintEffect::NoExecute => write!(f, "NoExecute"),
        }
    }
}

impl FromStr for TaintEffect {
    type Err = AdmitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NoSchedule" => Ok(TaintEffect::NoSchedule),
            "PreferNoSchedule" => Ok(TaintEffect::PreferNoSchedule),
            "NoExecute" => Ok(TaintEffect::NoExecute),
            other => Err(AdmitError::Config(format!("unknown taint effect: {}", other))),
        }
    }
}

/// A marker on a node repelling tasks that do not tolerate it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    #[serde(default)]
    pub value: String,
    pub effect: TaintEffect,
}

impl Taint {
    pub fn new(key: impl Into<String>, value: impl Into<String>, effect: TaintEffect) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            effect,
        }
    }
}

impl fmt::Display for Taint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.value.is_empty() {
            write!(f, "{}:{}", self.key, self.effect)
        } else {
            write!(f, "{}={}:{}", self.key, self.value, self.effect)
        }
    }
}

/// How a toleration compares its value with a taint's
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TolerationOperator {
    /// Values must be equal
    #[default]
    Equal,
    /// Any value of the key is tolerated
    Exists,
}

impl fmt::Display for TolerationOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TolerationOperator::Equal => write!(f, "Equal"),
            TolerationOperator::Exists => write!(f, "Exists"),
        }
    }
}

/// A marker on a task permitting placement onto nodes with matching taints
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Toleration {
    pub key: String,
    #[serde(default)]
    pub operator: TolerationOperator,
    #[serde(default)]
    pub value: String,
    /// `None` tolerates every effect
    #[serde(
        default,
        deserialize_with = "wildcard_effect",
        skip_serializing_if = "Option::is_none"
    )]
    pub effect: Option<TaintEffect>,
}

impl Toleration {
    /// Toleration matching one exact taint
    pub fn equal(key: impl Into<String>, value: impl Into<String>, effect: TaintEffect) -> Self {
        Self {
            key: key.into(),
            operator: TolerationOperator::Equal,
            value: value.into(),
            effect: Some(effect),
        }
    }

    /// Toleration matching every value of a key
    pub fn exists(key: impl Into<String>, effect: Option<TaintEffect>) -> Self {
        Self {
            key: key.into(),
            operator: TolerationOperator::Exists,
            value: String::new(),
            effect,
        }
    }

    /// Identity used to de-duplicate toleration sets
    pub fn identity(&self) -> (&str, &str, Option<TaintEffect>) {
        (&self.key, &self.value, self.effect)
    }

    /// Reject templates Kubernetes would refuse as well
    pub fn validate(&self) -> AdmitResult<()> {
        match self.operator {
            TolerationOperator::Exists if !self.value.is_empty() => Err(AdmitError::Config(
                format!(
                    "toleration {:?}: operator Exists must not carry a value (got {:?})",
                    self.key, self.value
                ),
            )),
            TolerationOperator::Equal if self.key.is_empty() => Err(AdmitError::Config(
                "toleration with an empty key requires operator Exists".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Toleration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let effect = self
            .effect
            .map(|e| e.to_string())
            .unwrap_or_else(|| "*".to_string());
        match self.operator {
            TolerationOperator::Exists => write!(f, "{} Exists :{}", self.key, effect),
            TolerationOperator::Equal => {
                write!(f, "{}={} :{}", self.key, self.value, effect)
            }
        }
    }
}

fn wildcard_effect<'de, D>(deserializer: D) -> Result<Option<TaintEffect>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

/// A schedulable node as seen by one placement attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(default)]
    pub taints: Vec<Taint>,
    /// Fixed for the node's lifetime
    pub capacity: ResourceRequest,
    #[serde(default)]
    pub allocated: ResourceRequest,
}

impl Node {
    /// Create an untainted, empty node
    pub fn new(id: impl Into<String>, capacity: ResourceRequest) -> Self {
        Self {
            id: id.into(),
            taints: Vec::new(),
            capacity,
            allocated: ResourceRequest::default(),
        }
    }

    pub fn with_taint(mut self, taint: Taint) -> Self {
        self.taints.push(taint);
        self
    }

    pub fn with_allocated(mut self, allocated: ResourceRequest) -> Self {
        self.allocated = allocated;
        self
    }

    /// Capacity not yet allocated
    pub fn available(&self) -> ResourceRequest {
        self.capacity.saturating_sub(&self.allocated)
    }

    /// Whether the request fits into the free capacity
    pub fn can_fit(&self, request: &ResourceRequest) -> bool {
        request.fits_within(&self.available())
    }
}
