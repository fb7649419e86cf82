//! The constrained expression engine.
//!
//! Compiles a list of validations, each a single boolean expression that
//! must hold for the object to be admitted. The engine is deliberately
//! narrow: no referential data, a hard expression-depth cap, and the same
//! step budget as the rule engine. That narrowness is what makes it cheap.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::drivers::eval::{Bindings, EvalContext, EvalError, EvalStop, eval_expr, truthy};
use crate::drivers::lang::{Expr, parse_expression};
use crate::drivers::{CompileOutcome, DriverReview, DriverViolation, ReviewEnv};
use crate::policy::{Constraint, Template};

/// Maximum expression nesting the engine accepts at compile time.
pub const MAX_EXPRESSION_DEPTH: usize = 32;

/// One compiled validation.
struct Validation {
    expr: Expr,
    message: String,
}

struct Program {
    validations: Vec<Validation>,
}

/// The expression driver.
#[derive(Default)]
pub struct ExprDriver {
    programs: RwLock<HashMap<String, Arc<Program>>>,
    bound: RwLock<HashSet<(String, String)>>,
}

impl ExprDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compile(&self, template: &Template) -> CompileOutcome {
        let Some(entry) = template.code_for(crate::drivers::EXPR_ENGINE_NAME) else {
            return CompileOutcome::Skipped(format!(
                "template '{}' has no {} code",
                template.kind,
                crate::drivers::EXPR_ENGINE_NAME
            ));
        };

        let Some(list) = entry.source.get("validations").and_then(Value::as_array) else {
            return CompileOutcome::Error(format!(
                "template '{}': {} source must be a mapping with a 'validations' list",
                template.kind,
                crate::drivers::EXPR_ENGINE_NAME
            ));
        };

        let mut validations = Vec::with_capacity(list.len());
        for (i, raw) in list.iter().enumerate() {
            let Some(source) = raw.get("expression").and_then(Value::as_str) else {
                return CompileOutcome::Error(format!(
                    "template '{}': validation {i} has no expression",
                    template.kind
                ));
            };
            let expr = match parse_expression(source) {
                Ok(e) => e,
                Err(e) => {
                    return CompileOutcome::Error(format!(
                        "template '{}': validation {i}: {e}",
                        template.kind
                    ));
                }
            };
            if expr.calls("inventory") {
                return CompileOutcome::Error(format!(
                    "template '{}': validation {i}: inventory() is not available to the {} engine",
                    template.kind,
                    crate::drivers::EXPR_ENGINE_NAME
                ));
            }
            if expr.depth() > MAX_EXPRESSION_DEPTH {
                return CompileOutcome::Error(format!(
                    "template '{}': validation {i} exceeds the depth limit of {MAX_EXPRESSION_DEPTH}",
                    template.kind
                ));
            }
            let message = raw
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("validation failed")
                .to_string();
            validations.push(Validation { expr, message });
        }

        self.programs
            .write()
            .insert(template.kind.clone(), Arc::new(Program { validations }));
        CompileOutcome::Compiled
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
                return Ok(DriverReview {
                    violations: vec![DriverViolation::eval_error(format!(
                        "no compiled template for kind '{}'",
                        constraint.kind
                    ))],
                    evaluations: 0,
                });
            }
        };

        // This engine never sees the referential cache, whatever the caller
        // handed us.
        let mut ctx = EvalContext {
            inventory: None,
            cost: &mut *ctx.cost,
            cancel: ctx.cancel,
        };

        let roots = env.bindings(&constraint.parameters);
        let bindings = Bindings::new(&roots);
        let mut review = DriverReview::default();

        for validation in &program.validations {
            review.evaluations += 1;
            match eval_expr(&validation.expr, &bindings, &mut ctx) {
                Ok(v) if truthy(&v) => {}
                Ok(_) => review
                    .violations
                    .push(DriverViolation::deny(validation.message.clone())),
                Err(EvalError::Stop(stop)) => return Err(stop),
                Err(EvalError::Failure(msg)) => {
                    review.violations.push(DriverViolation::eval_error(msg));
                }
            }
        }
        Ok(review)
    }
}
