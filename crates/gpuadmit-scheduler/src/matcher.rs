//! Taint/toleration matching

use gpuadmit_core::{Taint, TaintEffect, Toleration, TolerationOperator};
use serde::Serialize;

/// Outcome of matching a node's taints against a task's tolerations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Admission {
    /// No NoSchedule/NoExecute taint is left untolerated
    pub admitted: bool,
    /// Blocking taints no toleration matched
    pub untolerated: Vec<Taint>,
    /// Number of untolerated PreferNoSchedule taints
    pub penalty: u32,
}

/// Whether `toleration` matches `taint`: same key, value equal unless the
/// operator is `Exists`, and same effect unless the toleration's is a wildcard.
/// An empty key with `Exists` matches every key.
pub fn tolerates(toleration: &Toleration, taint: &Taint) -> bool {
    let any_key =
        toleration.key.is_empty() && toleration.operator == TolerationOperator::Exists;
    if !any_key && toleration.key != taint.key {
        return false;
    }
    let value_matches = match toleration.operator {
        TolerationOperator::Exists => true,
        TolerationOperator::Equal => toleration.value == taint.value,
    };
    let effect_matches = toleration.effect.map_or(true, |e| e == taint.effect);
    value_matches && effect_matches
}

fn tolerated(taint: &Taint, tolerations: &[Toleration]) -> bool {
    tolerations.iter().any(|t| tolerates(t, taint))
}

/// Whether a task carrying `tolerations` may be placed on a node with `taints`
pub fn admits(taints: &[Taint], tolerations: &[Toleration]) -> bool {
    taints
        .iter()
        .filter(|taint| taint.effect.is_blocking())
        .all(|taint| tolerated(taint, tolerations))
}

/// Full match result including the soft-preference penalty
pub fn evaluate(taints: &[Taint], tolerations: &[Toleration]) -> Admission {
    let mut admission = Admission::default();
    for taint in taints {
        if tolerated(taint, tolerations) {
            continue;
        }
        match taint.effect {
            TaintEffect::PreferNoSchedule => admission.penalty += 1,
            TaintEffect::NoSchedule | TaintEffect::NoExecute => {
                admission.untolerated.push(taint.clone())
            }
        }
    }
    admission.admitted = admission.untolerated.is_empty();
    admission
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpu_taint() -> Taint {
        Taint::new("gpu", "true", TaintEffect::NoSchedule)
    }

    #[test]
    fn test_matching_toleration_admits() {
        let tolerations = vec![Toleration::equal("gpu", "true", TaintEffect::NoSchedule)];
        assert!(admits(&[gpu_taint()], &tolerations));
    }

    #[test]
    fn test_no_tolerations_rejects() {
        assert!(!admits(&[gpu_taint()], &[]));
        let admission = evaluate(&[gpu_taint()], &[]);
        assert!(!admission.admitted);
        assert_eq!(admission.untolerated, vec![gpu_taint()]);
    }

    #[test]
    fn test_untainted_node_admits_anything() {
        assert!(admits(&[], &[]));
        assert!(admits(&[], &[Toleration::exists("gpu", None)]));
    }

    #[test]
    fn test_value_mismatch() {
        let tolerations = vec![Toleration::equal("gpu", "false", TaintEffect::NoSchedule)];
        assert!(!admits(&[gpu_taint()], &tolerations));
    }

    #[test]
    fn test_exists_ignores_value() {
        let tolerations = vec![Toleration::exists("gpu", Some(TaintEffect::NoSchedule))];
        assert!(admits(&[gpu_taint()], &tolerations));
    }

    #[test]
    fn test_effect_must_match_unless_wildcard() {
        let wrong_effect = vec![Toleration::equal("gpu", "true", TaintEffect::NoExecute)];
        assert!(!admits(&[gpu_taint()], &wrong_effect));

        let wildcard = vec![Toleration::exists("gpu", None)];
        assert!(admits(&[gpu_taint()], &wildcard));
        assert!(admits(
            &[Taint::new("gpu", "x", TaintEffect::NoExecute)],
            &wildcard
        ));
    }

    #[test]
    fn test_key_must_match() {
        let tolerations = vec![Toleration::exists("other", None)];
        assert!(!admits(&[gpu_taint()], &tolerations));
    }

    #[test]
    fn test_empty_key_exists_tolerates_everything() {
        let taints = vec![
            gpu_taint(),
            Taint::new("dedicated", "ml", TaintEffect::NoExecute),
        ];
        assert!(admits(&taints, &[Toleration::exists("", None)]));
        assert!(!admits(
            &taints,
            &[Toleration::exists("", Some(TaintEffect::NoSchedule))]
        ));
    }

    #[test]
    fn test_every_blocking_taint_needs_a_match() {
        let taints = vec![
            gpu_taint(),
            Taint::new("dedicated", "ml", TaintEffect::NoExecute),
        ];
        let partial = vec![Toleration::equal("gpu", "true", TaintEffect::NoSchedule)];
        assert!(!admits(&taints, &partial));

        let admission = evaluate(&taints, &partial);
        assert_eq!(admission.untolerated.len(), 1);
        assert_eq!(admission.untolerated[0].key, "dedicated");

        let mut full = partial.clone();
        full.push(Toleration::equal("dedicated", "ml", TaintEffect::NoExecute));
        assert!(admits(&taints, &full));
    }

    #[test]
    fn test_prefer_no_schedule_only_penalizes() {
        let taints = vec![
            Taint::new("spot", "true", TaintEffect::PreferNoSchedule),
            Taint::new("old-driver", "", TaintEffect::PreferNoSchedule),
        ];
        assert!(admits(&taints, &[]));

        let admission = evaluate(&taints, &[]);
        assert!(admission.admitted);
        assert_eq!(admission.penalty, 2);

        let admission = evaluate(&taints, &[Toleration::exists("spot", None)]);
        assert_eq!(admission.penalty, 1);
    }

    #[test]
    fn test_admits_agrees_with_evaluate() {
        let taints = vec![
            gpu_taint(),
            Taint::new("spot", "true", TaintEffect::PreferNoSchedule),
            Taint::new("zone", "a", TaintEffect::NoExecute),
        ];
        let candidates = vec![
            Toleration::equal("gpu", "true", TaintEffect::NoSchedule),
            Toleration::exists("zone", None),
            Toleration::exists("spot", Some(TaintEffect::PreferNoSchedule)),
            Toleration::equal("zone", "b", TaintEffect::NoExecute),
        ];

        // Every subset of the candidate tolerations
        for mask in 0u32..(1 << candidates.len()) {
            let subset: Vec<Toleration> = candidates
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << *i) != 0)
                .map(|(_, t)| t.clone())
                .collect();
            let expected = taints
                .iter()
                .filter(|t| t.effect.is_blocking())
                .all(|t| subset.iter().any(|s| tolerates(s, t)));
            assert_eq!(admits(&taints, &subset), expected, "mask {:b}", mask);
            assert_eq!(evaluate(&taints, &subset).admitted, expected, "mask {:b}", mask);
        }
    }
}
