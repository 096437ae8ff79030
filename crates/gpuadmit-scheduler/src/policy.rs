//! Accelerator toleration policy
//!
//! Operators reserve accelerator nodes by tainting them, then map each
//! accelerator resource name to the tolerations a task requesting it should
//! carry. Resolving a request against the policy yields the tolerations that
//! get injected into the task's execution unit.

use gpuadmit_core::{
    AdmitError, AdmitResult, K8sPluginConfig, TaintEffect, Toleration, TolerationOperator,
};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Immutable accelerator-name to toleration-template mapping
#[derive(Debug, Clone)]
pub struct TolerationPolicy {
    /// Fail on accelerators without templates instead of skipping them
    strict: bool,
    /// Added to every task
    defaults: Vec<Toleration>,
    /// Templates per accelerator resource name
    templates: BTreeMap<String, Vec<Toleration>>,
}

impl TolerationPolicy {
    /// Create an empty policy
    pub fn new(strict: bool) -> Self {
        Self {
            strict,
            defaults: Vec::new(),
            templates: BTreeMap::new(),
        }
    }

    /// Build and validate the policy from its configuration section
    pub fn from_config(config: &K8sPluginConfig) -> AdmitResult<Self> {
        for toleration in &config.default_tolerations {
            toleration.validate()?;
        }
        for (accelerator, templates) in &config.resource_tolerations {
            if accelerator.trim().is_empty() {
                return Err(AdmitError::Config(
                    "resource-tolerations: empty accelerator name".to_string(),
                ));
            }
            for toleration in templates {
                toleration.validate().map_err(|e| {
                    AdmitError::Config(format!("resource-tolerations.{}: {}", accelerator, e))
                })?;
            }
        }

        debug!(
            strict = config.strict,
            accelerators = config.resource_tolerations.len(),
            defaults = config.default_tolerations.len(),
            "Toleration policy loaded"
        );

        Ok(Self {
            strict: config.strict,
            defaults: config.default_tolerations.clone(),
            templates: config.resource_tolerations.clone(),
        })
    }

    pub fn with_templates(mut self, accelerator: impl Into<String>, templates: Vec<Toleration>) -> Self {
        self.templates.insert(accelerator.into(), templates);
        self
    }

    pub fn with_default(mut self, toleration: Toleration) -> Self {
        self.defaults.push(toleration);
        self
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Templates configured for an accelerator
    pub fn templates(&self, accelerator: &str) -> Option<&[Toleration]> {
        self.templates.get(accelerator).map(Vec::as_slice)
    }

    /// Accelerator names the policy covers
    pub fn accelerators(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    /// Tolerations a task requesting `accelerators` must carry.
    ///
    /// Defaults come first, then each requested accelerator's templates in
    /// name order. Duplicates by `(key, value, effect)` keep the position of
    /// their first occurrence, and become `Exists` if any duplicate is. Several
    /// accelerator types contribute the union of their templates.
    pub fn resolve(&self, accelerators: &BTreeMap<String, u32>) -> AdmitResult<Vec<Toleration>> {
        let mut missing = Vec::new();
        let mut selected: Vec<&Toleration> = self.defaults.iter().collect();

        for (name, count) in accelerators {
            if *count == 0 {
                continue;
            }
            match self.templates.get(name) {
                Some(templates) => selected.extend(templates),
                None if self.strict => missing.push(name.as_str()),
                None => {
                    warn!(
                        accelerator = %name,
                        "No tolerations configured for accelerator, continuing without"
                    );
                }
            }
        }

        if !missing.is_empty() {
            return Err(AdmitError::UnconfiguredAccelerator(missing.join(", ")));
        }

        let mut resolved: Vec<Toleration> = Vec::with_capacity(selected.len());
        let mut positions: HashMap<(&str, &str, Option<TaintEffect>), usize> = HashMap::new();
        for toleration in selected {
            match positions.get(&toleration.identity()) {
                // Exists tolerates everything the colliding Equal does
                Some(&index) if toleration.operator == TolerationOperator::Exists => {
                    resolved[index].operator = TolerationOperator::Exists;
                }
                Some(_) => {}
                None => {
                    positions.insert(toleration.identity(), resolved.len());
                    resolved.push(toleration.clone());
                }
            }
        }

        debug!(tolerations = resolved.len(), "Resolved tolerations");
        Ok(resolved)
    }
}

impl Default for TolerationPolicy {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Resolve the tolerations for a request's accelerators under `policy`
pub fn resolve_tolerations(
    accelerators: &BTreeMap<String, u32>,
    policy: &TolerationPolicy,
) -> AdmitResult<Vec<Toleration>> {
    policy.resolve(accelerators)
}
