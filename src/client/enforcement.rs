//! Enforcement point registry.
//!
//! An enforcement point is a named phase a constraint opts into. A
//! constraint with no explicit points participates at every registered
//! point.

use std::collections::BTreeSet;

/// The admission webhook.
pub const WEBHOOK_ENFORCEMENT_POINT: &str = "validation.gatekeeper.sh";

/// The periodic audit pass.
pub const AUDIT_ENFORCEMENT_POINT: &str = "audit.gatekeeper.sh";

/// Offline evaluation (this harness).
pub const OFFLINE_ENFORCEMENT_POINT: &str = "gator.gatekeeper.sh";

/// The set of enforcement points the client knows about.
#[derive(Debug, Clone)]
pub struct EnforcementPointRegistry {
    points: BTreeSet<String>,
}

impl Default for EnforcementPointRegistry {
    fn default() -> Self {
        Self {
            points: BTreeSet::from([
                WEBHOOK_ENFORCEMENT_POINT.to_string(),
                AUDIT_ENFORCEMENT_POINT.to_string(),
                OFFLINE_ENFORCEMENT_POINT.to_string(),
            ]),
        }
    }
}

impl EnforcementPointRegistry {
    pub fn is_known(&self, point: &str) -> bool {
        self.points.contains(point)
    }

    pub fn register(&mut self, point: impl Into<String>) {
        self.points.insert(point.into());
    }

    /// Whether a constraint with `constraint_points` participates when the
    /// caller filters on `filter`.
    ///
    /// An empty constraint set means "every registered point". No filter
    /// means "everything participates".
    pub fn applies(&self, constraint_points: &[String], filter: Option<&[String]>) -> bool {
        let Some(filter) = filter else {
            return true;
        };
        if constraint_points.is_empty() {
            return filter.iter().any(|p| self.is_known(p));
        }
        constraint_points
            .iter()
            .any(|p| filter.iter().any(|f| f == p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_registered() {
        let reg = EnforcementPointRegistry::default();
        assert!(reg.is_known(WEBHOOK_ENFORCEMENT_POINT));
        assert!(reg.is_known(AUDIT_ENFORCEMENT_POINT));
        assert!(reg.is_known(OFFLINE_ENFORCEMENT_POINT));
        assert!(!reg.is_known("unknown.example.com"));
    }

    #[test]
    fn test_no_filter_always_applies() {
        let reg = EnforcementPointRegistry::default();
        assert!(reg.applies(&[], None));
        assert!(reg.applies(&["audit.gatekeeper.sh".into()], None));
    }

    #[test]
    fn test_filter_intersection() {
        let reg = EnforcementPointRegistry::default();
        let audit_only = vec![AUDIT_ENFORCEMENT_POINT.to_string()];

        // Empty constraint set participates everywhere.
        assert!(reg.applies(&[], Some(&audit_only)));

        let webhook_constraint = vec![WEBHOOK_ENFORCEMENT_POINT.to_string()];
        assert!(!reg.applies(&webhook_constraint, Some(&audit_only)));
        assert!(reg.applies(&webhook_constraint, Some(&[
            WEBHOOK_ENFORCEMENT_POINT.to_string(),
            AUDIT_ENFORCEMENT_POINT.to_string(),
        ])));
    }

    #[test]
    fn test_unknown_filter_point_matches_nothing_implicit() {
        let reg = EnforcementPointRegistry::default();
        let unknown = vec!["bogus.example.com".to_string()];
        // A constraint with the default (empty) set only participates at
        // registered points.
        assert!(!reg.applies(&[], Some(&unknown)));
        // But an explicit opt-in to the same name still intersects.
        assert!(reg.applies(&unknown, Some(&unknown)));
    }

    #[test]
    fn test_register_custom_point() {
        let mut reg = EnforcementPointRegistry::default();
        reg.register("custom.example.com");
        assert!(reg.is_known("custom.example.com"));
        assert!(reg.applies(&[], Some(&["custom.example.com".to_string()])));
    }
}
