//! Constraint match evaluation.
//!
//! Decides whether a constraint participates in a review. The rules, in
//! order: kinds, excluded namespaces, namespace allow-list, namespace
//! selector, scope. A constraint with no match block matches every object.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::policy::{Match, Scope, namespace_pattern_matches};
use crate::target::ObjectRef;

/// Outcome of matching one constraint against one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Matches,
    DoesNotMatch,
    /// The constraint has a namespaceSelector but the inventory holds no
    /// Namespace object for the subject. Reportable, per the documented
    /// open-question decision.
    MissingNamespaceObject(String),
}

/// Decide whether `m` selects the object.
///
/// `object` is the full object body (consulted when the object is itself a
/// Namespace); `namespace_object` is the resolved Namespace object for
/// namespaced subjects, or null when unknown.
pub fn decide(
    m: &Match,
    obj: &ObjectRef,
    object: &Value,
    namespace_object: &Value,
) -> Decision {
    // Kinds: any entry may select; an empty list selects everything.
    if !m.kinds.is_empty()
        && !m.kinds.iter().any(|entry| entry.selects(&obj.group, &obj.kind))
    {
        return Decision::DoesNotMatch;
    }

    let namespaced = !obj.namespace.is_empty();

    if namespaced {
        if m.excluded_namespaces
            .iter()
            .any(|p| namespace_pattern_matches(p, &obj.namespace))
        {
            return Decision::DoesNotMatch;
        }
        if !m.namespaces.is_empty()
            && !m
                .namespaces
                .iter()
                .any(|p| namespace_pattern_matches(p, &obj.namespace))
        {
            return Decision::DoesNotMatch;
        }
    }

    if let Some(selector) = &m.namespace_selector {
        if obj.group.is_empty() && obj.kind == "Namespace" {
            // A Namespace is matched against its own labels.
            if !selector.matches(&labels_of(object)) {
                return Decision::DoesNotMatch;
            }
        } else if namespaced {
            if namespace_object.is_null() {
                return Decision::MissingNamespaceObject(obj.namespace.clone());
            }
            if !selector.matches(&labels_of(namespace_object)) {
                return Decision::DoesNotMatch;
            }
        }
        // Other cluster-scoped objects have no namespace to select on; the
        // selector does not exclude them.
    }

    match m.scope {
        Scope::Any => {}
        Scope::Cluster if namespaced => return Decision::DoesNotMatch,
        Scope::Namespaced if !namespaced => return Decision::DoesNotMatch,
        _ => {}
    }

    Decision::Matches
}

fn labels_of(object: &Value) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    if let Some(map) = object.pointer("/metadata/labels").and_then(|v| v.as_object()) {
        for (k, v) in map {
            if let Some(s) = v.as_str() {
                labels.insert(k.clone(), s.to_string());
            }
        }
    }
    labels
}
