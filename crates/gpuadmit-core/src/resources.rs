//! Resource quantities and request normalization
//!
//! Tasks declare resources the way Kubernetes does: CPU as cores or millicores
//! (`"2"`, `"0.5"`, `"250m"`), memory with binary or decimal suffixes
//! (`"512Mi"`, `"1G"`), and accelerators as a device name with a count
//! (`"nvidia.com/gpu" = 2`). [`normalize`] turns such a declaration into a
//! canonical [`ResourceRequest`] measured in millicores and bytes.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{AdmitError, AdmitResult};

/// Canonical resource amounts
///
/// Also used for node capacity and node allocation, so that the capacity check
/// is a plain componentwise comparison.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// CPU in millicores
    pub cpu_millis: u64,
    /// Memory in bytes
    pub memory_bytes: u64,
    /// Accelerator device counts keyed by resource name (e.g. `nvidia.com/gpu`)
    #[serde(default)]
    pub accelerators: BTreeMap<String, u32>,
}

impl ResourceRequest {
    /// Create a request without accelerators
    pub fn new(cpu_millis: u64, memory_bytes: u64) -> Self {
        Self {
            cpu_millis,
            memory_bytes,
            accelerators: BTreeMap::new(),
        }
    }

    /// Add an accelerator requirement. A zero count removes the entry.
    pub fn with_accelerator(mut self, name: impl Into<String>, count: u32) -> Self {
        let name = name.into();
        if count == 0 {
            self.accelerators.remove(&name);
        } else {
            self.accelerators.insert(name, count);
        }
        self
    }

    /// Number of devices requested for an accelerator name
    pub fn accelerator(&self, name: &str) -> u32 {
        self.accelerators.get(name).copied().unwrap_or(0)
    }

    /// Whether this request needs any accelerator at all
    pub fn wants_accelerators(&self) -> bool {
        self.accelerators.values().any(|c| *c > 0)
    }

    pub fn is_empty(&self) -> bool {
        self.cpu_millis == 0 && self.memory_bytes == 0 && !self.wants_accelerators()
    }

    /// Componentwise `self <= available`
    pub fn fits_within(&self, available: &ResourceRequest) -> bool {
        self.cpu_millis <= available.cpu_millis
            && self.memory_bytes <= available.memory_bytes
            && self
                .accelerators
                .iter()
                .all(|(name, count)| *count <= available.accelerator(name))
    }

    /// Componentwise sum, `None` on overflow
    pub fn checked_add(&self, other: &ResourceRequest) -> Option<ResourceRequest> {
        let mut accelerators = self.accelerators.clone();
        for (name, count) in &other.accelerators {
            let entry = accelerators.entry(name.clone()).or_insert(0);
            *entry = entry.checked_add(*count)?;
        }
        Some(ResourceRequest {
            cpu_millis: self.cpu_millis.checked_add(other.cpu_millis)?,
            memory_bytes: self.memory_bytes.checked_add(other.memory_bytes)?,
            accelerators,
        })
    }

    /// Componentwise difference clamped at zero. Zero accelerator entries are dropped.
    pub fn saturating_sub(&self, other: &ResourceRequest) -> ResourceRequest {
        let accelerators = self
            .accelerators
            .iter()
            .filter_map(|(name, count)| {
                let left = count.saturating_sub(other.accelerator(name));
                (left > 0).then(|| (name.clone(), left))
            })
            .collect();
        ResourceRequest {
            cpu_millis: self.cpu_millis.saturating_sub(other.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes),
            accelerators,
        }
    }

    /// Human readable list of the components `self` does not fit into
    pub fn shortfall(&self, available: &ResourceRequest) -> Vec<String> {
        let mut missing = Vec::new();
        if self.cpu_millis > available.cpu_millis {
            missing.push(format!(
                "cpu requested {}m, free {}m",
                self.cpu_millis, available.cpu_millis
            ));
        }
        if self.memory_bytes > available.memory_bytes {
            missing.push(format!(
                "memory requested {}B, free {}B",
                self.memory_bytes, available.memory_bytes
            ));
        }
        for (name, count) in &self.accelerators {
            let free = available.accelerator(name);
            if *count > free {
                missing.push(format!("{} requested {}, free {}", name, count, free));
            }
        }
        missing
    }
}

impl fmt::Display for ResourceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu={}m memory={}B", self.cpu_millis, self.memory_bytes)?;
        for (name, count) in &self.accelerators {
            write!(f, " {}={}", name, count)?;
        }
        Ok(())
    }
}

/// A quantity as written in a configuration file
///
/// TOML lets operators write `cpu = 2`, `cpu = 0.5` or `cpu = "500m"`; all
/// three are accepted and parsed through the same grammar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawQuantity {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl RawQuantity {
    fn to_text(&self, field: &str) -> AdmitResult<String> {
        match self {
            RawQuantity::Integer(n) if *n < 0 => Err(negative(field, &n.to_string())),
            RawQuantity::Integer(n) => Ok(n.to_string()),
            RawQuantity::Float(x) if !x.is_finite() => Err(AdmitError::InvalidSpec(format!(
                "{}: quantity {} is not a finite number",
                field, x
            ))),
            RawQuantity::Float(x) if *x < 0.0 => Err(negative(field, &x.to_string())),
            RawQuantity::Float(x) => Ok(x.to_string()),
            RawQuantity::Text(s) => Ok(s.clone()),
        }
    }
}

impl From<&str> for RawQuantity {
    fn from(s: &str) -> Self {
        RawQuantity::Text(s.to_string())
    }
}

/// One side (requests or limits) of a declared resource spec
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawResources {
    #[serde(default)]
    pub cpu: Option<RawQuantity>,
    #[serde(default, alias = "mem")]
    pub memory: Option<RawQuantity>,
    /// Signed so that negative counts reach validation
    #[serde(default)]
    pub accelerators: BTreeMap<String, i64>,
}

impl RawResources {
    /// Normalize a standalone set of amounts, e.g. a node's capacity.
    /// Unset CPU and memory count as zero, zero accelerator counts are dropped.
    pub fn normalize(&self) -> AdmitResult<ResourceRequest> {
        let parsed = ParsedResources::parse(self, "resources", true)?;
        Ok(ResourceRequest {
            cpu_millis: parsed.cpu.unwrap_or(0),
            memory_bytes: parsed.memory.unwrap_or(0),
            accelerators: parsed.accelerators,
        })
    }
}

/// Resource declaration of a task: requests with optional limits
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawResourceSpec {
    #[serde(default)]
    pub requests: RawResources,
    #[serde(default)]
    pub limits: Option<RawResources>,
}

impl RawResourceSpec {
    pub fn normalize(&self) -> AdmitResult<ResourceRequest> {
        normalize(self)
    }
}

struct ParsedResources {
    cpu: Option<u64>,
    memory: Option<u64>,
    accelerators: BTreeMap<String, u32>,
}

impl ParsedResources {
    fn parse(raw: &RawResources, side: &str, allow_zero: bool) -> AdmitResult<Self> {
        let cpu = raw
            .cpu
            .as_ref()
            .map(|q| parse_cpu(&q.to_text(&format!("{}.cpu", side))?))
            .transpose()?;
        let memory = raw
            .memory
            .as_ref()
            .map(|q| parse_memory(&q.to_text(&format!("{}.memory", side))?))
            .transpose()?;

        let mut accelerators = BTreeMap::new();
        for (name, count) in &raw.accelerators {
            let name = name.trim();
            if name.is_empty() {
                return Err(AdmitError::InvalidSpec(format!(
                    "{}.accelerators: empty accelerator name with count {}",
                    side, count
                )));
            }
            if *count < 0 {
                return Err(negative(&format!("{}.accelerators.{}", side, name), &count.to_string()));
            }
            if *count == 0 && allow_zero {
                continue;
            }
            if *count == 0 {
                return Err(AdmitError::InvalidSpec(format!(
                    "{}.accelerators.{}: count must be positive",
                    side, name
                )));
            }
            let count = u32::try_from(*count).map_err(|_| {
                AdmitError::InvalidSpec(format!(
                    "{}.accelerators.{}: count {} out of range",
                    side, name, count
                ))
            })?;
            if accelerators.insert(name.to_string(), count).is_some() {
                return Err(AdmitError::InvalidSpec(format!(
                    "{}.accelerators.{}: declared twice",
                    side, name
                )));
            }
        }

        Ok(Self {
            cpu,
            memory,
            accelerators,
        })
    }
}

/// Turn a declared resource spec into a canonical request.
///
/// Unset requests fall back to the matching limit. A request above its limit
/// is rejected, and accelerators may not be overcommitted: when both sides
/// name a device the counts must agree.
pub fn normalize(raw: &RawResourceSpec) -> AdmitResult<ResourceRequest> {
    let requests = ParsedResources::parse(&raw.requests, "requests", false)?;
    let limits = raw
        .limits
        .as_ref()
        .map(|l| ParsedResources::parse(l, "limits", false))
        .transpose()?;

    let Some(limits) = limits else {
        return Ok(ResourceRequest {
            cpu_millis: requests.cpu.unwrap_or(0),
            memory_bytes: requests.memory.unwrap_or(0),
            accelerators: requests.accelerators,
        });
    };

    let cpu_millis = bounded("cpu", requests.cpu, limits.cpu)?;
    let memory_bytes = bounded("memory", requests.memory, limits.memory)?;

    let mut accelerators = requests.accelerators;
    for (name, limit) in limits.accelerators {
        match accelerators.get(&name) {
            Some(request) if *request != limit => {
                return Err(AdmitError::InvalidSpec(format!(
                    "accelerators.{}: request {} differs from limit {}",
                    name, request, limit
                )));
            }
            Some(_) => {}
            None => {
                accelerators.insert(name, limit);
            }
        }
    }

    Ok(ResourceRequest {
        cpu_millis,
        memory_bytes,
        accelerators,
    })
}

fn bounded(field: &str, request: Option<u64>, limit: Option<u64>) -> AdmitResult<u64> {
    match (request, limit) {
        (Some(r), Some(l)) if r > l => Err(AdmitError::InvalidSpec(format!(
            "{}: request {} exceeds limit {}",
            field, r, l
        ))),
        (Some(r), _) => Ok(r),
        (None, Some(l)) => Ok(l),
        (None, None) => Ok(0),
    }
}

/// Parse a CPU quantity into millicores. Fractions of a millicore round up.
pub fn parse_cpu(input: &str) -> AdmitResult<u64> {
    let s = input.trim();
    check_sign("cpu", s)?;
    let (number, per_unit) = match s.strip_suffix('m') {
        Some(number) => (number, 1u128),
        None => (s, 1000u128),
    };
    let (mantissa, scale) = parse_decimal(number).ok_or_else(|| malformed("cpu", input))?;
    scaled("cpu", input, mantissa, scale, per_unit)
}

/// Parse a memory quantity into bytes. Fractions of a byte round up.
pub fn parse_memory(input: &str) -> AdmitResult<u64> {
    let s = input.trim();
    check_sign("memory", s)?;
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    let multiplier: u128 = match suffix {
        "" => 1,
        "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        "E" => 1_000_000_000_000_000_000,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "Pi" => 1 << 50,
        "Ei" => 1 << 60,
        _ => {
            return Err(AdmitError::InvalidSpec(format!(
                "memory: unknown unit {:?} in {:?}",
                suffix, input
            )))
        }
    };
    let (mantissa, scale) = parse_decimal(number).ok_or_else(|| malformed("memory", input))?;
    scaled("memory", input, mantissa, scale, multiplier)
}

fn check_sign(field: &str, s: &str) -> AdmitResult<()> {
    if s.starts_with('-') {
        return Err(negative(field, s));
    }
    Ok(())
}

/// `mantissa / 10^scale * multiplier`, rounded up, as u64
fn scaled(field: &str, input: &str, mantissa: u128, scale: u32, multiplier: u128) -> AdmitResult<u64> {
    let too_large = || {
        AdmitError::InvalidSpec(format!("{}: quantity {:?} is too large", field, input))
    };
    let mut value = match mantissa.checked_mul(multiplier) {
        Some(value) => value,
        None if scale > 0 => {
            return Err(AdmitError::InvalidSpec(format!(
                "{}: quantity {:?} has too many significant digits",
                field, input
            )))
        }
        None => return Err(too_large()),
    };
    // ceil(ceil(x / a) / b) == ceil(x / (a * b)), so divide in steps that fit u128
    let mut remaining = scale;
    while remaining > 0 {
        let step = remaining.min(MAX_POW10);
        value = value.div_ceil(10u128.pow(step));
        remaining -= step;
    }
    u64::try_from(value).map_err(|_| too_large())
}

/// Largest power of ten representable in u128
const MAX_POW10: u32 = 38;

/// Parse `123`, `1.5`, `.5` or `2.` into (digits, number of fraction digits)
fn parse_decimal(s: &str) -> Option<(u128, u32)> {
    let (whole, fraction) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    if !whole.bytes().chain(fraction.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }
    let fraction = fraction.trim_end_matches('0');

    let mut mantissa: u128 = 0;
    for b in whole.bytes().chain(fraction.bytes()) {
        mantissa = mantissa.checked_mul(10)?.checked_add(u128::from(b - b'0'))?;
    }
    Some((mantissa, fraction.len() as u32))
}

fn malformed(field: &str, input: &str) -> AdmitError {
    AdmitError::InvalidSpec(format!("{}: malformed quantity {:?}", field, input))
}

fn negative(field: &str, input: &str) -> AdmitError {
    AdmitError::InvalidSpec(format!("{}: negative quantity {}", field, input))
}
