//! The general rule engine.
//!
//! Compiles the `Rules` DSL (see [`crate::drivers::lang`]) and evaluates
//! deny rules with full access to the referential cache through the
//! `inventory()` builtin.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::drivers::eval::{
    Bindings, EvalContext, EvalError, EvalStop, eval_expr, render_message, truthy,
};
use crate::drivers::lang::{Stmt, parse_rules};
use crate::drivers::{CompileOutcome, DriverReview, DriverViolation, ReviewEnv};
use crate::policy::{Constraint, Template};

/// Compiled rule program for one template kind.
struct Program {
    stmts: Vec<Stmt>,
}

/// The rule driver. Compile and bind take its internal write path; reviews
/// share read access to the compiled set.
#[derive(Default)]
pub struct RuleDriver {
    programs: RwLock<HashMap<String, Arc<Program>>>,
    bound: RwLock<HashSet<(String, String)>>,
}

impl RuleDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compile(&self, template: &Template) -> CompileOutcome {
        let Some(entry) = template.code_for(crate::drivers::RULE_ENGINE_NAME) else {
            return CompileOutcome::Skipped(format!(
                "template '{}' has no {} code",
                template.kind,
                crate::drivers::RULE_ENGINE_NAME
            ));
        };
        let Some(source) = entry.source.as_str() else {
            return CompileOutcome::Error(format!(
                "template '{}': {} source must be a string",
                template.kind,
                crate::drivers::RULE_ENGINE_NAME
            ));
        };
        match parse_rules(source) {
            Ok(stmts) => {
                self.programs
                    .write()
                    .insert(template.kind.clone(), Arc::new(Program { stmts }));
                CompileOutcome::Compiled
            }
            Err(e) => CompileOutcome::Error(format!("template '{}': {e}", template.kind)),
        }
    }

    pub fn uncompile(&self, kind: &str) {
        self.programs.write().remove(kind);
        self.bound.write().retain(|(k, _)| k != kind);
    }

    pub fn bind(&self, kind: &str, name: &str) {
        self.bound
            .write()
            .insert((kind.to_string(), name.to_string()));
    }

    pub fn unbind(&self, kind: &str, name: &str) {
        self.bound
            .write()
            .remove(&(kind.to_string(), name.to_string()));
    }

    pub fn has_template(&self, kind: &str) -> bool {
        self.programs.read().contains_key(kind)
    }

    pub fn review(
        &self,
        constraint: &Constraint,
        env: &ReviewEnv<'_>,
        ctx: &mut EvalContext<'_>,
    ) -> Result<DriverReview, EvalStop> {
        let program = match self.programs.read().get(&constraint.kind) {
            Some(p) => Arc::clone(p),
            None => {
                // Unbound kinds should have been filtered by the client;
                // report rather than panic if one slips through.
                return Ok(DriverReview {
                    violations: vec![DriverViolation::eval_error(format!(
                        "no compiled template for kind '{}'",
                        constraint.kind
                    ))],
                    evaluations: 0,
                });
            }
        };

        let roots = env.bindings(&constraint.parameters);
        let mut bindings = Bindings::new(&roots);
        let mut review = DriverReview::default();

        for stmt in &program.stmts {
            match eval_stmt(stmt, &mut bindings, ctx, &mut review) {
                Ok(()) => {}
                Err(EvalError::Stop(stop)) => return Err(stop),
                Err(EvalError::Failure(msg)) => {
                    review.violations.push(DriverViolation::eval_error(msg));
                }
            }
        }
        Ok(review)
    }
}

fn eval_stmt(
    stmt: &Stmt,
    bindings: &mut Bindings<'_>,
    ctx: &mut EvalContext<'_>,
    review: &mut DriverReview,
) -> Result<(), EvalError> {
    match stmt {
        Stmt::Deny { message, when } => {
            review.evaluations += 1;
            ctx.step(1)?;
            let fired = match when {
                Some(cond) => truthy(&eval_expr(cond, bindings, ctx)?),
                None => true,
            };
            if fired {
                let msg = render_message(message, bindings, ctx)?;
                review.violations.push(DriverViolation::deny(msg));
            }
            Ok(())
        }
        Stmt::For {
            var,
            iterable,
            body,
        } => {
            let collection = eval_expr(iterable, bindings, ctx)?;
            let items: Vec<Value> = match collection {
                Value::Array(items) => items,
                Value::Object(map) => map.into_iter().map(|(_, v)| v).collect(),
                Value::Null => Vec::new(),
                other => {
                    return Err(EvalError::failure(format!(
                        "cannot iterate over a {}",
                        match other {
                            Value::Bool(_) => "boolean",
                            Value::Number(_) => "number",
                            Value::String(_) => "string",
                            _ => "value",
                        }
                    )));
                }
            };
            for item in items {
                bindings.push(var.clone(), item);
                let result = (|| {
                    for inner in body {
                        eval_stmt(inner, bindings, ctx, review)?;
                    }
                    Ok(())
                })();
                bindings.pop();
                result?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::eval::CostTracker;
    use crate::inventory::{CacheKey, ReferentialCache};
    use crate::target::Operation;
    use serde_json::json;

    static NULL: Value = Value::Null;

    fn template(kind: &str, source: &str) -> Template {
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

    fn constraint(kind: &str, params: Value) -> Constraint {
        Constraint::from_document(&json!({
            "kind": kind,
            "metadata": {"name": "test"},
            "spec": {"parameters": params}
        }))
        .unwrap()
    }

    fn run(
        driver: &RuleDriver,
        c: &Constraint,
        object: &Value,
        inventory: Option<&ReferentialCache>,
    ) -> DriverReview {
        let op = Value::String(Operation::Create.as_str().to_string());
        let env = ReviewEnv {
            object,
            old_object: &NULL,
            namespace: &NULL,
            operation: &op,
        };
        let mut cost = CostTracker::new(1_000_000);
        let mut ctx = EvalContext {
            inventory,
            cost: &mut cost,
            cancel: None,
        };
        driver.review(c, &env, &mut ctx).unwrap()
    }

    #[test]
    fn test_compile_outcomes() {
        let driver = RuleDriver::new();
        assert!(
            driver
                .compile(&template("K8sAlwaysDeny", "deny \"no\""))
                .is_compiled()
        );
        assert!(driver.has_template("K8sAlwaysDeny"));

        // Missing Rules code is a skip, not an error.
        let t = Template::from_document(&json!({
            "kind": "ConstraintTemplate",
            "metadata": {"name": "exproonly"},
            "spec": {
                "crd": {"spec": {"names": {"kind": "ExprOnly"}}},
                "targets": [{"code": [{"engine": "Expr", "source": {"validations": []}}]}]
            }
        }))
        .unwrap();
        assert!(matches!(driver.compile(&t), CompileOutcome::Skipped(_)));

        // Bad source is an error, not a skip.
        assert!(matches!(
            driver.compile(&template("Broken", "deny when")),
            CompileOutcome::Error(_)
        ));
    }

    #[test]
    fn test_required_labels_rules() {
        let driver = RuleDriver::new();
        let source = r#"
            for label in params.labels {
                deny "missing required labels: ${label}" when not object.metadata.labels[label]
            }
        "#;
        driver.compile(&template("K8sRequiredLabels", source));
        let c = constraint("K8sRequiredLabels", json!({"labels": ["team"]}));

        let pod = json!({"kind": "Pod", "metadata": {"name": "web", "labels": {"app": "web"}}});
        let review = run(&driver, &c, &pod, None);
        assert_eq!(review.violations.len(), 1);
        assert!(review.violations[0].message.contains("missing required labels"));
        assert!(review.violations[0].message.contains("team"));
        assert!(!review.violations[0].error);

        let pod = json!({"kind": "Pod", "metadata": {"name": "web", "labels": {"team": "core"}}});
        let review = run(&driver, &c, &pod, None);
        assert!(review.violations.is_empty());
        assert_eq!(review.evaluations, 1);
    }

    #[test]
    fn test_referential_rules() {
        let driver = RuleDriver::new();
        let source = r#"
            for svc in inventory("", "Service", object.metadata.namespace) {
                deny "selector conflicts with service ${svc.metadata.name}"
                    when svc.metadata.name != object.metadata.name
                     and svc.spec.selector == object.spec.selector
            }
        "#;
        driver.compile(&template("K8sUniqueServiceSelector", source));
        let c = constraint("K8sUniqueServiceSelector", Value::Null);

        let cache = ReferentialCache::new();
        let existing = json!({
            "apiVersion": "v1", "kind": "Service",
            "metadata": {"name": "svc-a", "namespace": "default"},
            "spec": {"selector": {"key": "value"}}
        });
        cache.add(CacheKey::for_object(&existing).unwrap(), existing);

        let duplicate = json!({
            "apiVersion": "v1", "kind": "Service",
            "metadata": {"name": "svc-b", "namespace": "default"},
            "spec": {"selector": {"key": "value"}}
        });
        let review = run(&driver, &c, &duplicate, Some(&cache));
        assert_eq!(review.violations.len(), 1);
        assert!(review.violations[0].message.contains("svc-a"));

        let distinct = json!({
            "apiVersion": "v1", "kind": "Service",
            "metadata": {"name": "svc-c", "namespace": "default"},
            "spec": {"selector": {"key": "other"}}
        });
        let review = run(&driver, &c, &distinct, Some(&cache));
        assert!(review.violations.is_empty());
    }

    #[test]
    fn test_runtime_failure_is_reported_not_fatal() {
        let driver = RuleDriver::new();
        let source = r#"
            deny "bad" when nosuchfunc(object)
            deny "always"
        "#;
        driver.compile(&template("Mixed", source));
        let c = constraint("Mixed", Value::Null);
        let review = run(&driver, &c, &json!({}), None);

        // The failing rule became an error entry; the second rule still ran.
        assert_eq!(review.violations.len(), 2);
        assert!(review.violations[0].error);
        assert!(!review.violations[1].error);
        assert_eq!(review.violations[1].message, "always");
    }

    #[test]
    fn test_budget_stop_escapes() {
        let driver = RuleDriver::new();
        driver.compile(&template("Deny", "deny \"x\" when object.a == object.b"));
        let c = constraint("Deny", Value::Null);

        let op = Value::String("CREATE".to_string());
        let obj = json!({"a": 1, "b": 2});
        let env = ReviewEnv {
            object: &obj,
            old_object: &NULL,
            namespace: &NULL,
            operation: &op,
        };
        let mut cost = CostTracker::new(2);
        let mut ctx = EvalContext {
            inventory: None,
            cost: &mut cost,
            cancel: None,
        };
        let err = driver.review(&c, &env, &mut ctx).unwrap_err();
        assert_eq!(err, EvalStop::Budget);
    }

    #[test]
    fn test_uncompile_and_bind_lifecycle() {
        let driver = RuleDriver::new();
        driver.compile(&template("Kind", "deny \"x\""));
        driver.bind("Kind", "c1");
        driver.unbind("Kind", "c1");
        driver.uncompile("Kind");
        assert!(!driver.has_template("Kind"));
        // Uncompile twice is fine.
        driver.uncompile("Kind");
    }
}
