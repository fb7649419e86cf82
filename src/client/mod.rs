//! The constraint client.
//!
//! The client is the single public surface of the evaluation pipeline. It
//! owns the template and constraint registries and the driver set, shares
//! the referential cache with concurrent reviews, and dispatches each
//! review to the driver holding the constraint's compiled form.
//!
//! Concurrency: registries sit behind one `RwLock` (one-writer discipline);
//! reviews take the read path, so any `add_*` completed before a review
//! begins is visible to it. Per-driver compiled state is the driver's own
//! concern.

pub mod enforcement;
pub mod matching;
pub mod responses;
mod review;

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::drivers::{CompileOutcome, DEFAULT_COST_BUDGET, Driver, default_drivers};
use crate::error::{Error, Result};
use crate::inventory::{CacheKey, ReferentialCache};
use crate::policy::{Constraint, Template};
use crate::target::AdmissionTarget;

pub use enforcement::EnforcementPointRegistry;
pub use responses::{Responses, StatsEntry, TargetResponse, Violation, ViolationKind};
pub use review::ReviewOpts;

/// Per-driver outcomes of one `add_template` call.
#[derive(Debug)]
pub struct TemplateOutcome {
    /// (engine name, outcome), in driver-priority order.
    pub per_driver: Vec<(&'static str, CompileOutcome)>,
}

impl TemplateOutcome {
    /// Engines that compiled the template.
    pub fn compiled(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.per_driver
            .iter()
            .filter(|(_, o)| o.is_compiled())
            .map(|(name, _)| *name)
    }
}

/// Per-driver outcomes of one `add_constraint` call.
#[derive(Debug)]
pub struct ConstraintOutcome {
    /// Engines the constraint was bound in.
    pub bound: Vec<&'static str>,
    /// Engines that had skipped the template, with the reason the binding
    /// was not made there.
    pub skipped: Vec<(&'static str, String)>,
}

pub(crate) struct TemplateEntry {
    template: Template,
    /// Indices into the driver set, in priority order. The first entry is
    /// the driver that evaluates this template's constraints.
    pub(crate) accepted: Vec<usize>,
}

#[derive(Default)]
pub(crate) struct Registry {
    pub(crate) templates: BTreeMap<String, TemplateEntry>,
    /// kind → name → constraint. BTreeMaps keep dispatch order stable.
    pub(crate) constraints: BTreeMap<String, BTreeMap<String, Arc<Constraint>>>,
}

/// Builds a [`Client`] with a chosen driver lineup and cost budget.
pub struct ClientBuilder {
    drivers: Vec<Driver>,
    budget: u64,
    enforcement_points: EnforcementPointRegistry,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self {
            drivers: default_drivers(),
            budget: DEFAULT_COST_BUDGET,
            enforcement_points: EnforcementPointRegistry::default(),
        }
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the driver lineup. Order is dispatch priority.
    pub fn with_drivers(mut self, drivers: Vec<Driver>) -> Self {
        self.drivers = drivers;
        self
    }

    /// Default per-review cost budget, overridable per review.
    pub fn with_cost_budget(mut self, budget: u64) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_enforcement_points(mut self, registry: EnforcementPointRegistry) -> Self {
        self.enforcement_points = registry;
        self
    }

    pub fn build(self) -> Client {
        Client {
            drivers: self.drivers,
            registry: RwLock::new(Registry::default()),
            inventory: Arc::new(ReferentialCache::new()),
            target: AdmissionTarget,
            enforcement_points: self.enforcement_points,
            default_budget: self.budget,
        }
    }
}

/// The constraint client. See the module docs for the concurrency model.
pub struct Client {
    pub(crate) drivers: Vec<Driver>,
    pub(crate) registry: RwLock<Registry>,
    pub(crate) inventory: Arc<ReferentialCache>,
    pub(crate) target: AdmissionTarget,
    pub(crate) enforcement_points: EnforcementPointRegistry,
    pub(crate) default_budget: u64,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Register a template.
    ///
    /// Each driver is asked whether it accepts the template's code. At
    /// least one must; otherwise this fails with
    /// [`Error::IncompatibleTemplate`] when every driver skipped, or
    /// [`Error::InvalidInput`] when a driver rejected malformed code and
    /// none compiled.
    pub fn add_template(&self, template: Template) -> Result<TemplateOutcome> {
        let mut registry = self.registry.write();
        if registry.templates.contains_key(&template.kind) {
            return Err(Error::invalid(format!(
                "template kind '{}' is already registered; remove it first",
                template.kind
            )));
        }

        let mut per_driver = Vec::with_capacity(self.drivers.len());
        let mut accepted = Vec::new();
        for (idx, driver) in self.drivers.iter().enumerate() {
            let outcome = driver.compile(&template);
            if outcome.is_compiled() {
                accepted.push(idx);
            }
            per_driver.push((driver.name(), outcome));
        }

        if accepted.is_empty() {
            let errors: Vec<&str> = per_driver
                .iter()
                .filter_map(|(_, o)| match o {
                    CompileOutcome::Error(e) => Some(e.as_str()),
                    _ => None,
                })
                .collect();
            if errors.is_empty() {
                return Err(Error::IncompatibleTemplate {
                    kind: template.kind.clone(),
                });
            }
            return Err(Error::invalid(format!(
                "template '{}' failed to compile: {}",
                template.kind,
                errors.join("; ")
            )));
        }

        log::debug!(
            "registered template '{}' (accepted by {:?})",
            template.kind,
            per_driver
                .iter()
                .filter(|(_, o)| o.is_compiled())
                .map(|(n, _)| *n)
                .collect::<Vec<_>>()
        );
        registry.templates.insert(
            template.kind.clone(),
            TemplateEntry { template, accepted },
        );
        Ok(TemplateOutcome { per_driver })
    }

    /// Remove a template and every constraint bound to it. Idempotent.
    pub fn remove_template(&self, kind: &str) {
        let mut registry = self.registry.write();
        if registry.templates.remove(kind).is_none() {
            return;
        }
        if let Some(by_name) = registry.constraints.remove(kind) {
            for (name, _) in by_name {
                for driver in &self.drivers {
                    driver.unbind(kind, &name);
                }
            }
        }
        for driver in &self.drivers {
            driver.uncompile(kind);
        }
        log::debug!("removed template '{kind}' and its constraints");
    }

    /// Register a constraint, replacing a prior version with the same
    /// (kind, name).
    pub fn add_constraint(&self, constraint: Constraint) -> Result<ConstraintOutcome> {
        let mut registry = self.registry.write();
        let entry = registry
            .templates
            .get(&constraint.kind)
            .ok_or_else(|| Error::MissingTemplate {
                kind: constraint.kind.clone(),
            })?;

        if let Some(schema) = &entry.template.schema {
            schema
                .validate(&constraint.parameters)
                .map_err(|reason| Error::SchemaViolation {
                    kind: constraint.kind.clone(),
                    name: constraint.name.clone(),
                    reason,
                })?;
        }

        for point in &constraint.enforcement_points {
            if !self.enforcement_points.is_known(point) {
                log::warn!(
                    "constraint {} opts into unregistered enforcement point '{point}'",
                    constraint.identity()
                );
            }
        }

        let mut bound = Vec::new();
        let mut skipped = Vec::new();
        for (idx, driver) in self.drivers.iter().enumerate() {
            if entry.accepted.contains(&idx) {
                driver.bind(&constraint.kind, &constraint.name)?;
                bound.push(driver.name());
            } else {
                skipped.push((
                    driver.name(),
                    format!("template '{}' is not compiled in this engine", constraint.kind),
                ));
            }
        }

        registry
            .constraints
            .entry(constraint.kind.clone())
            .or_default()
            .insert(constraint.name.clone(), Arc::new(constraint));

        Ok(ConstraintOutcome { bound, skipped })
    }

    /// Remove a constraint. Idempotent.
    pub fn remove_constraint(&self, kind: &str, name: &str) {
        let mut registry = self.registry.write();
        let removed = registry
            .constraints
            .get_mut(kind)
            .and_then(|by_name| by_name.remove(name))
            .is_some();
        if removed {
            for driver in &self.drivers {
                driver.unbind(kind, name);
            }
        }
    }

    /// Add an object to the referential cache. Idempotent; re-adding a key
    /// replaces the prior value.
    pub fn add_data(&self, object: &Value) -> Result<()> {
        let key = CacheKey::for_object(object).ok_or_else(|| {
            Error::invalid("inventory object needs kind and metadata.name")
        })?;
        self.inventory.add(key, object.clone());
        Ok(())
    }

    /// Remove an object from the referential cache. Removing an absent key
    /// is a no-op.
    pub fn remove_data(&self, object: &Value) -> Result<()> {
        let key = CacheKey::for_object(object).ok_or_else(|| {
            Error::invalid("inventory object needs kind and metadata.name")
        })?;
        self.inventory.remove(&key);
        Ok(())
    }

    /// Whether any driver in this client can read the referential cache.
    pub fn supports_referential_data(&self) -> bool {
        self.drivers.iter().any(Driver::supports_referential_data)
    }

    /// Number of cached inventory entries.
    pub fn inventory_len(&self) -> usize {
        self.inventory.len()
    }

    /// Registered template kinds, sorted.
    pub fn template_kinds(&self) -> Vec<String> {
        self.registry.read().templates.keys().cloned().collect()
    }

    /// Total registered constraints.
    pub fn constraint_count(&self) -> usize {
        self.registry
            .read()
            .constraints
            .values()
            .map(BTreeMap::len)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rules_template(kind: &str, source: &str) -> Template {
        Template::from_document(&json!({
            "kind": "ConstraintTemplate",
            "metadata": {"name": kind.to_lowercase()},
            "spec": {
                "crd": {"spec": {"names": {"kind": kind}}},
                "targets": [{"code": [{"engine": "Rules", "source": source}]}]
            }
        }))
        .unwrap()
    }

    fn constraint(kind: &str, name: &str) -> Constraint {
        Constraint::from_document(&json!({
            "kind": kind,
            "metadata": {"name": name}
        }))
        .unwrap()
    }

    #[test]
    fn test_add_template_records_per_driver_outcomes() {
        let client = Client::builder().build();
        let outcome = client
            .add_template(rules_template("K8sAlwaysDeny", "deny \"no\""))
            .unwrap();
        // The rule driver compiled; the expression driver skipped.
        assert_eq!(outcome.compiled().collect::<Vec<_>>(), vec!["Rules"]);
        assert!(
            outcome
                .per_driver
                .iter()
                .any(|(n, o)| *n == "Expr" && matches!(o, CompileOutcome::Skipped(_)))
        );
        assert_eq!(client.template_kinds(), vec!["K8sAlwaysDeny"]);
    }

    #[test]
    fn test_add_template_twice_rejected() {
        let client = Client::builder().build();
        client
            .add_template(rules_template("K8sAlwaysDeny", "deny \"no\""))
            .unwrap();
        let err = client
            .add_template(rules_template("K8sAlwaysDeny", "deny \"no\""))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_incompatible_template() {
        // A template whose only code is for an engine nobody registered.
        let t = Template::from_document(&json!({
            "kind": "ConstraintTemplate",
            "metadata": {"name": "alien"},
            "spec": {
                "crd": {"spec": {"names": {"kind": "Alien"}}},
                "targets": [{"code": [{"engine": "Wasm", "source": "xxx"}]}]
            }
        }))
        .unwrap();
        let client = Client::builder().build();
        let err = client.add_template(t).unwrap_err();
        assert!(err.is_template_skip());
    }

    #[test]
    fn test_compile_error_is_not_a_skip() {
        let client = Client::builder().build();
        let err = client
            .add_template(rules_template("Broken", "deny when"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(client.template_kinds().is_empty());
    }

    #[test]
    fn test_constraint_requires_template() {
        let client = Client::builder().build();
        let err = client
            .add_constraint(constraint("K8sGhost", "c1"))
            .unwrap_err();
        assert!(matches!(err, Error::MissingTemplate { .. }));
    }

    #[test]
    fn test_constraint_schema_violation() {
        let client = Client::builder().build();
        let t = Template::from_document(&json!({
            "kind": "ConstraintTemplate",
            "metadata": {"name": "k8srequiredlabels"},
            "spec": {
                "crd": {"spec": {"names": {"kind": "K8sRequiredLabels"},
                    "validation": {"openAPIV3Schema": {
                        "type": "object",
                        "required": ["labels"],
                        "properties": {"labels": {"type": "array", "items": {"type": "string"}}}
                    }}}},
                "targets": [{"code": [{"engine": "Rules", "source": "deny \"x\""}]}]
            }
        }))
        .unwrap();
        client.add_template(t).unwrap();

        let bad = Constraint::from_document(&json!({
            "kind": "K8sRequiredLabels",
            "metadata": {"name": "bad"},
            "spec": {"parameters": {"labels": "team"}}
        }))
        .unwrap();
        let err = client.add_constraint(bad).unwrap_err();
        assert!(matches!(err, Error::SchemaViolation { .. }));

        let good = Constraint::from_document(&json!({
            "kind": "K8sRequiredLabels",
            "metadata": {"name": "good"},
            "spec": {"parameters": {"labels": ["team"]}}
        }))
        .unwrap();
        let outcome = client.add_constraint(good).unwrap();
        assert_eq!(outcome.bound, vec!["Rules"]);
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].0, "Expr");
    }

    #[test]
    fn test_constraint_replacement_keeps_one() {
        let client = Client::builder().build();
        client
            .add_template(rules_template("K8sAlwaysDeny", "deny \"no\""))
            .unwrap();
        client
            .add_constraint(constraint("K8sAlwaysDeny", "c1"))
            .unwrap();
        client
            .add_constraint(constraint("K8sAlwaysDeny", "c1"))
            .unwrap();
        assert_eq!(client.constraint_count(), 1);
    }

    #[test]
    fn test_remove_template_cascades() {
        let client = Client::builder().build();
        client
            .add_template(rules_template("K8sAlwaysDeny", "deny \"no\""))
            .unwrap();
        client
            .add_constraint(constraint("K8sAlwaysDeny", "c1"))
            .unwrap();

        client.remove_template("K8sAlwaysDeny");
        assert!(client.template_kinds().is_empty());
        assert_eq!(client.constraint_count(), 0);
        // Idempotent.
        client.remove_template("K8sAlwaysDeny");
        // The cascade also dropped the compiled program.
        assert!(!client.drivers[0].has_template("K8sAlwaysDeny"));
    }

    #[test]
    fn test_remove_constraint_idempotent() {
        let client = Client::builder().build();
        client
            .add_template(rules_template("K8sAlwaysDeny", "deny \"no\""))
            .unwrap();
        client
            .add_constraint(constraint("K8sAlwaysDeny", "c1"))
            .unwrap();
        client.remove_constraint("K8sAlwaysDeny", "c1");
        client.remove_constraint("K8sAlwaysDeny", "c1");
        assert_eq!(client.constraint_count(), 0);
    }

    #[test]
    fn test_add_data_idempotent() {
        let client = Client::builder().build();
        let svc = json!({
            "apiVersion": "v1", "kind": "Service",
            "metadata": {"name": "svc-a", "namespace": "default"}
        });
        client.add_data(&svc).unwrap();
        client.add_data(&svc).unwrap();
        assert_eq!(client.inventory_len(), 1);
        client.remove_data(&svc).unwrap();
        client.remove_data(&svc).unwrap();
        assert_eq!(client.inventory_len(), 0);
    }

    #[test]
    fn test_nameless_data_rejected() {
        let client = Client::builder().build();
        let err = client.add_data(&json!({"kind": "Pod"})).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
