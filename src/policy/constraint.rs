//! Constraint documents and their match criteria.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

use crate::error::{Error, Result};

/// What the outer system does with a violation of this constraint.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementAction {
    /// Reject the admission request.
    Deny,
    /// Admit, but attach a warning.
    Warn,
    /// Record only; never blocks.
    Dryrun,
    /// Any other action string is carried through untouched.
    #[serde(untagged)]
    Custom(String),
}

impl Default for EnforcementAction {
    fn default() -> Self {
        Self::Deny
    }
}

impl EnforcementAction {
    pub fn parse(s: &str) -> Self {
        match s {
            "deny" => Self::Deny,
            "warn" => Self::Warn,
            "dryrun" => Self::Dryrun,
            other => Self::Custom(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Deny => "deny",
            Self::Warn => "warn",
            Self::Dryrun => "dryrun",
            Self::Custom(s) => s,
        }
    }
}

impl fmt::Display for EnforcementAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Resource scope a constraint applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scope {
    /// Both cluster-scoped and namespaced objects.
    #[default]
    Any,
    /// Only objects without a namespace.
    Cluster,
    /// Only objects with a namespace.
    Namespaced,
}

impl Scope {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "*" | "Any" => Ok(Self::Any),
            "Cluster" => Ok(Self::Cluster),
            "Namespaced" => Ok(Self::Namespaced),
            other => Err(Error::invalid(format!("unknown match scope '{other}'"))),
        }
    }
}

/// One `match.kinds` rule: a set of API groups and kinds.
#[derive(Debug, Clone, Default)]
pub struct KindsEntry {
    /// Empty means "only the core group". `*` matches every group.
    pub api_groups: Vec<String>,
    /// Empty means "any kind". `*` matches every kind.
    pub kinds: Vec<String>,
}

impl KindsEntry {
    /// Whether this rule selects the given (group, kind) pair.
    pub fn selects(&self, group: &str, kind: &str) -> bool {
        let group_ok = if self.api_groups.is_empty() {
            group.is_empty()
        } else {
            self.api_groups.iter().any(|g| g == "*" || g == group)
        };
        let kind_ok =
            self.kinds.is_empty() || self.kinds.iter().any(|k| k == "*" || k == kind);
        group_ok && kind_ok
    }
}

/// A label-selector requirement operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// One `matchExpressions` entry of a label selector.
#[derive(Debug, Clone)]
pub struct SelectorRequirement {
    pub key: String,
    pub operator: SelectorOperator,
    pub values: Vec<String>,
}

impl SelectorRequirement {
    fn satisfied_by(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            SelectorOperator::In => value.is_some_and(|v| self.values.iter().any(|x| x == v)),
            SelectorOperator::NotIn => {
                value.is_none_or(|v| !self.values.iter().any(|x| x == v))
            }
            SelectorOperator::Exists => value.is_some(),
            SelectorOperator::DoesNotExist => value.is_none(),
        }
    }
}

/// A Kubernetes label selector (`matchLabels` + `matchExpressions`).
#[derive(Debug, Clone, Default)]
pub struct LabelSelector {
    pub match_labels: BTreeMap<String, String>,
    pub match_expressions: Vec<SelectorRequirement>,
}

impl LabelSelector {
    /// Whether the given label set satisfies this selector.
    ///
    /// An empty selector matches everything, per Kubernetes semantics.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        for (k, v) in &self.match_labels {
            if labels.get(k) != Some(v) {
                return false;
            }
        }
        self.match_expressions
            .iter()
            .all(|req| req.satisfied_by(labels))
    }

    fn parse(value: &Value) -> Result<Self> {
        let mut selector = Self::default();
        if let Some(map) = value.get("matchLabels").and_then(|v| v.as_object()) {
            for (k, v) in map {
                let v = v
                    .as_str()
                    .ok_or_else(|| Error::invalid(format!("matchLabels['{k}'] is not a string")))?;
                selector.match_labels.insert(k.clone(), v.to_string());
            }
        }
        if let Some(exprs) = value.get("matchExpressions").and_then(|v| v.as_array()) {
            for expr in exprs {
                let key = expr
                    .get("key")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| Error::invalid("matchExpressions entry without a key"))?
                    .to_string();
                let operator = match expr.get("operator").and_then(|v| v.as_str()) {
                    Some("In") => SelectorOperator::In,
                    Some("NotIn") => SelectorOperator::NotIn,
                    Some("Exists") => SelectorOperator::Exists,
                    Some("DoesNotExist") => SelectorOperator::DoesNotExist,
                    other => {
                        return Err(Error::invalid(format!(
                            "unknown selector operator {other:?}"
                        )));
                    }
                };
                let values = expr
                    .get("values")
                    .and_then(|v| v.as_array())
                    .map(|vals| {
                        vals.iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                selector.match_expressions.push(SelectorRequirement {
                    key,
                    operator,
                    values,
                });
            }
        }
        Ok(selector)
    }
}

/// The `spec.match` block of a constraint.
#[derive(Debug, Clone, Default)]
pub struct Match {
    /// Empty means "every object".
    pub kinds: Vec<KindsEntry>,
    /// Namespace allow-list. Entries support a trailing `*` segment
    /// (`kube-*`). Empty means "any namespace".
    pub namespaces: Vec<String>,
    /// Namespaces the constraint never applies in.
    pub excluded_namespaces: Vec<String>,
    /// Selector over the labels of the object's Namespace.
    pub namespace_selector: Option<LabelSelector>,
    pub scope: Scope,
}

/// Match a namespace name against a pattern that may carry a trailing `*`.
pub fn namespace_pattern_matches(pattern: &str, namespace: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        namespace.starts_with(prefix)
    } else {
        pattern == namespace
    }
}

impl Match {
    fn parse(value: &Value) -> Result<Self> {
        let mut m = Self::default();

        if let Some(entries) = value.get("kinds").and_then(|v| v.as_array()) {
            for entry in entries {
                let api_groups = string_list(entry.get("apiGroups"));
                let kinds = string_list(entry.get("kinds"));
                m.kinds.push(KindsEntry { api_groups, kinds });
            }
        }
        m.namespaces = string_list(value.get("namespaces"));
        m.excluded_namespaces = string_list(value.get("excludedNamespaces"));
        if let Some(sel) = value.get("namespaceSelector") {
            m.namespace_selector = Some(LabelSelector::parse(sel)?);
        }
        if let Some(scope) = value.get("scope").and_then(|v| v.as_str()) {
            m.scope = Scope::parse(scope)?;
        }
        Ok(m)
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// A parsed constraint: a bound instance of a template.
#[derive(Debug, Clone)]
pub struct Constraint {
    /// The template kind this constraint instantiates.
    pub kind: String,
    /// The document's `metadata.name`; unique per kind within a client.
    pub name: String,
    pub match_criteria: Match,
    /// Parameters, validated against the template schema at add time.
    pub parameters: Value,
    pub enforcement_action: EnforcementAction,
    /// Enforcement points this constraint opts into. Empty means "all".
    pub enforcement_points: Vec<String>,
}

impl Constraint {
    /// Parse a constraint from a decoded Kubernetes document.
    pub fn from_document(doc: &Value) -> Result<Self> {
        let kind = doc
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::invalid("constraint is missing kind"))?
            .to_string();
        let name = doc
            .pointer("/metadata/name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::invalid(format!("constraint of kind '{kind}' is missing metadata.name")))?
            .to_string();

        let spec = doc.get("spec").cloned().unwrap_or(Value::Null);
        let match_criteria = match spec.get("match") {
            Some(m) => Match::parse(m)?,
            None => Match::default(),
        };
        let parameters = spec.get("parameters").cloned().unwrap_or(Value::Null);
        let enforcement_action = spec
            .get("enforcementAction")
            .and_then(|v| v.as_str())
            .map(EnforcementAction::parse)
            .unwrap_or_default();
        let enforcement_points = string_list(spec.get("enforcementPoints"));

        Ok(Self {
            kind,
            name,
            match_criteria,
            parameters,
            enforcement_action,
            enforcement_points,
        })
    }

    /// "kind/name" identity used in messages and logs.
    pub fn identity(&self) -> String {
        format!("{}/{}", self.kind, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kinds_entry_core_group() {
        // Empty apiGroups matches only the core group.
        let entry = KindsEntry {
            api_groups: vec![],
            kinds: vec!["Pod".into()],
        };
        assert!(entry.selects("", "Pod"));
        assert!(!entry.selects("apps", "Pod"));
    }

    #[test]
    fn test_kinds_entry_wildcards() {
        let entry = KindsEntry {
            api_groups: vec!["*".into()],
            kinds: vec![],
        };
        assert!(entry.selects("apps", "Deployment"));
        assert!(entry.selects("", "Service"));

        let entry = KindsEntry {
            api_groups: vec!["apps".into()],
            kinds: vec!["*".into()],
        };
        assert!(entry.selects("apps", "Anything"));
        assert!(!entry.selects("batch", "Job"));
    }

    #[test]
    fn test_namespace_pattern() {
        assert!(namespace_pattern_matches("default", "default"));
        assert!(!namespace_pattern_matches("default", "default2"));
        assert!(namespace_pattern_matches("kube-*", "kube-system"));
        assert!(namespace_pattern_matches("*", "anything"));
        assert!(!namespace_pattern_matches("kube-*", "default"));
    }

    #[test]
    fn test_label_selector() {
        let mut labels = BTreeMap::new();
        labels.insert("env".to_string(), "prod".to_string());
        labels.insert("team".to_string(), "core".to_string());

        let sel = LabelSelector {
            match_labels: BTreeMap::from([("env".to_string(), "prod".to_string())]),
            match_expressions: vec![SelectorRequirement {
                key: "team".into(),
                operator: SelectorOperator::In,
                values: vec!["core".into(), "infra".into()],
            }],
        };
        assert!(sel.matches(&labels));

        let sel = LabelSelector {
            match_labels: BTreeMap::from([("env".to_string(), "staging".to_string())]),
            match_expressions: vec![],
        };
        assert!(!sel.matches(&labels));

        // Empty selector matches everything.
        assert!(LabelSelector::default().matches(&labels));
        assert!(LabelSelector::default().matches(&BTreeMap::new()));
    }

    #[test]
    fn test_parse_constraint() {
        let doc = json!({
            "apiVersion": "constraints.gatekeeper.sh/v1beta1",
            "kind": "K8sRequiredLabels",
            "metadata": {"name": "require-team"},
            "spec": {
                "match": {
                    "kinds": [{"apiGroups": [""], "kinds": ["Pod"]}],
                    "excludedNamespaces": ["kube-system"],
                    "scope": "Namespaced",
                    "namespaceSelector": {"matchLabels": {"env": "prod"}}
                },
                "parameters": {"labels": ["team"]},
                "enforcementAction": "warn",
                "enforcementPoints": ["audit.gatekeeper.sh"]
            }
        });
        let c = Constraint::from_document(&doc).unwrap();
        assert_eq!(c.kind, "K8sRequiredLabels");
        assert_eq!(c.name, "require-team");
        assert_eq!(c.enforcement_action, EnforcementAction::Warn);
        assert_eq!(c.match_criteria.scope, Scope::Namespaced);
        assert_eq!(c.match_criteria.excluded_namespaces, vec!["kube-system"]);
        assert!(c.match_criteria.namespace_selector.is_some());
        assert_eq!(c.enforcement_points, vec!["audit.gatekeeper.sh"]);
        assert_eq!(c.identity(), "K8sRequiredLabels/require-team");
    }

    #[test]
    fn test_defaults() {
        let doc = json!({
            "kind": "K8sAlwaysDeny",
            "metadata": {"name": "deny-all"}
        });
        let c = Constraint::from_document(&doc).unwrap();
        assert_eq!(c.enforcement_action, EnforcementAction::Deny);
        assert!(c.match_criteria.kinds.is_empty());
        assert!(c.enforcement_points.is_empty());
        assert_eq!(c.match_criteria.scope, Scope::Any);
    }

    #[test]
    fn test_custom_enforcement_action() {
        assert_eq!(
            EnforcementAction::parse("scoped"),
            EnforcementAction::Custom("scoped".into())
        );
        assert_eq!(EnforcementAction::parse("deny"), EnforcementAction::Deny);
    }
}
