//! Aggregated review results.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;

use crate::policy::EnforcementAction;

/// Distinguishes a policy decision from an evaluation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// The constraint's policy logic flagged the object.
    Policy,
    /// The constraint could not be evaluated; the message carries the
    /// failure reason. Never aborts the review.
    EvaluationError,
}

/// One violation produced by one constraint for one review.
#[derive(Debug, Clone)]
pub struct Violation {
    pub constraint_kind: String,
    pub constraint_name: String,
    pub message: String,
    pub enforcement_action: EnforcementAction,
    pub kind: ViolationKind,
    pub details: Option<Value>,
}

impl Violation {
    pub fn is_error(&self) -> bool {
        self.kind == ViolationKind::EvaluationError
    }

    /// "kind/name" identity of the violated constraint.
    pub fn constraint_identity(&self) -> String {
        format!("{}/{}", self.constraint_kind, self.constraint_name)
    }
}

/// Per-constraint evaluation statistics, collected when requested.
#[derive(Debug, Clone)]
pub struct StatsEntry {
    pub constraint_kind: String,
    pub constraint_name: String,
    pub engine: &'static str,
    pub duration: Duration,
    pub evaluations: u64,
}

/// Results for a single target.
#[derive(Debug, Clone, Default)]
pub struct TargetResponse {
    /// Violations in constraint dispatch order (stable for fixed input).
    pub violations: Vec<Violation>,
    pub trace: Option<String>,
    pub stats: Vec<StatsEntry>,
}

/// Everything one review produced, grouped by target.
#[derive(Debug, Clone, Default)]
pub struct Responses {
    pub by_target: BTreeMap<String, TargetResponse>,
    /// Set when the review was cut short by cancellation; the collected
    /// violations are then a partial result.
    pub cancelled: bool,
}

impl Responses {
    /// All violations across targets.
    pub fn violations(&self) -> impl Iterator<Item = &Violation> {
        self.by_target.values().flat_map(|t| t.violations.iter())
    }

    pub fn total_violations(&self) -> usize {
        self.by_target.values().map(|t| t.violations.len()).sum()
    }

    /// Violations that represent policy decisions, not evaluation errors.
    pub fn policy_violations(&self) -> impl Iterator<Item = &Violation> {
        self.violations().filter(|v| !v.is_error())
    }

    /// Whether any deny-action policy violation was produced.
    pub fn has_deny_violations(&self) -> bool {
        self.policy_violations()
            .any(|v| v.enforcement_action == EnforcementAction::Deny)
    }

    pub fn is_empty(&self) -> bool {
        self.total_violations() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(action: EnforcementAction, kind: ViolationKind) -> Violation {
        Violation {
            constraint_kind: "K8sTest".into(),
            constraint_name: "test".into(),
            message: "msg".into(),
            enforcement_action: action,
            kind,
            details: None,
        }
    }

    #[test]
    fn test_deny_detection() {
        let mut responses = Responses::default();
        let target = responses.by_target.entry("admission".into()).or_default();
        target
            .violations
            .push(violation(EnforcementAction::Warn, ViolationKind::Policy));
        assert!(!responses.has_deny_violations());

        responses
            .by_target
            .get_mut("admission")
            .unwrap()
            .violations
            .push(violation(EnforcementAction::Deny, ViolationKind::Policy));
        assert!(responses.has_deny_violations());
        assert_eq!(responses.total_violations(), 2);
    }

    #[test]
    fn test_error_entries_do_not_deny() {
        let mut responses = Responses::default();
        responses
            .by_target
            .entry("admission".into())
            .or_default()
            .violations
            .push(violation(
                EnforcementAction::Deny,
                ViolationKind::EvaluationError,
            ));
        assert!(!responses.has_deny_violations());
        assert_eq!(responses.policy_violations().count(), 0);
        assert!(!responses.is_empty());
    }
}
