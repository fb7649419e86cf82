//! Policy input documents.
//!
//! Two Kubernetes-style document families drive the harness:
//!
//! - `ConstraintTemplate` (API group `templates.gatekeeper.sh`): a reusable
//!   policy schema carrying per-engine code bodies and an optional parameter
//!   schema.
//! - constraints (API group `constraints.gatekeeper.sh`): instantiations of
//!   a template with match criteria and parameters.
//!
//! Everything else is an inventory/review object.

pub mod constraint;
pub mod schema;
pub mod template;

pub use constraint::{
    Constraint, EnforcementAction, KindsEntry, LabelSelector, Match, Scope, SelectorOperator,
    SelectorRequirement, namespace_pattern_matches,
};
pub use schema::ParamSchema;
pub use template::{CodeEntry, Template};

/// API group of constraint template documents.
pub const TEMPLATE_GROUP: &str = "templates.gatekeeper.sh";

/// API group of constraint documents.
pub const CONSTRAINT_GROUP: &str = "constraints.gatekeeper.sh";

/// Split an `apiVersion` string into (group, version).
///
/// Core-group objects (`v1`) have an empty group.
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

/// Extract the API group of a parsed document, if it has an `apiVersion`.
pub fn document_group(doc: &serde_json::Value) -> Option<&str> {
    doc.get("apiVersion")
        .and_then(|v| v.as_str())
        .map(|av| split_api_version(av).0)
}
