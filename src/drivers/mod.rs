//! Evaluation drivers.
//!
//! A driver owns one policy engine: it decides at `add_template` time
//! whether it can compile a template's code body, holds the compiled form,
//! and evaluates bound constraints against reviews. The client dispatches
//! over a tagged enum rather than trait objects, keeping the driver set a
//! small, ordered, known list.

pub mod eval;
pub mod expr;
pub mod lang;
pub mod rule;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;

use crate::error::{Error, Result};
use crate::policy::{Constraint, Template};

pub use eval::{Bindings, CostTracker, EvalContext, EvalError, EvalStop};
pub use expr::ExprDriver;
pub use rule::RuleDriver;

/// Engine name of the general rule driver.
pub const RULE_ENGINE_NAME: &str = "Rules";

/// Engine name of the constrained expression driver.
pub const EXPR_ENGINE_NAME: &str = "Expr";

/// Default per-review cost budget, in evaluation steps.
pub const DEFAULT_COST_BUDGET: u64 = 5_000_000;

/// A shared cancellation flag, observed by drivers at bounded intervals.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Per-driver outcome of compiling one template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutcome {
    /// The driver accepted and compiled the template's code.
    Compiled,
    /// The template carries no code for this engine; not an error.
    Skipped(String),
    /// The template carries code for this engine, but it is malformed.
    Error(String),
}

impl CompileOutcome {
    pub fn is_compiled(&self) -> bool {
        matches!(self, Self::Compiled)
    }
}

/// One raw violation produced by a driver, before the client enriches it
/// with constraint identity and enforcement action.
#[derive(Debug, Clone)]
pub struct DriverViolation {
    pub message: String,
    /// True when this entry records an evaluation failure rather than a
    /// policy decision.
    pub error: bool,
}

impl DriverViolation {
    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error: false,
        }
    }

    pub fn eval_error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error: true,
        }
    }
}

/// Result of evaluating one constraint in one driver.
#[derive(Debug, Default)]
pub struct DriverReview {
    pub violations: Vec<DriverViolation>,
    /// Number of rule/validation evaluations performed, for stats.
    pub evaluations: u64,
}

/// The fixed review-scoped variable roots handed to a driver.
///
/// The driver adds the constraint's `params` binding itself.
pub struct ReviewEnv<'a> {
    pub object: &'a Value,
    /// `Value::Null` when the review has no prior state.
    pub old_object: &'a Value,
    /// The Namespace object, or `Value::Null`.
    pub namespace: &'a Value,
    /// Operation name as a string value.
    pub operation: &'a Value,
}

impl<'a> ReviewEnv<'a> {
    /// Assemble the bindings for one constraint evaluation.
    pub fn bindings(&self, params: &'a Value) -> [(&'a str, &'a Value); 5] {
        [
            ("object", self.object),
            ("oldObject", self.old_object),
            ("namespace", self.namespace),
            ("operation", self.operation),
            ("params", params),
        ]
    }
}

/// The polymorphic driver set.
pub enum Driver {
    Rule(RuleDriver),
    Expr(ExprDriver),
}

impl Driver {
    /// Build a fresh driver for an engine name. Unknown names fall back to
    /// the general rule driver.
    pub fn from_engine_name(engine: &str) -> Self {
        if engine == EXPR_ENGINE_NAME {
            Self::Expr(ExprDriver::new())
        } else {
            Self::Rule(RuleDriver::new())
        }
    }

    /// The engine name this driver compiles code for.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Rule(_) => RULE_ENGINE_NAME,
            Self::Expr(_) => EXPR_ENGINE_NAME,
        }
    }

    /// Whether evaluations in this driver may read the referential cache.
    pub fn supports_referential_data(&self) -> bool {
        match self {
            Self::Rule(_) => true,
            Self::Expr(_) => false,
        }
    }

    /// Try to compile a template's code body for this engine.
    pub fn compile(&self, template: &Template) -> CompileOutcome {
        match self {
            Self::Rule(d) => d.compile(template),
            Self::Expr(d) => d.compile(template),
        }
    }

    /// Drop the compiled form of a template. Idempotent.
    pub fn uncompile(&self, kind: &str) {
        match self {
            Self::Rule(d) => d.uncompile(kind),
            Self::Expr(d) => d.uncompile(kind),
        }
    }

    /// Bind a constraint to its compiled template.
    pub fn bind(&self, kind: &str, name: &str) -> Result<()> {
        let known = match self {
            Self::Rule(d) => d.has_template(kind),
            Self::Expr(d) => d.has_template(kind),
        };
        if !known {
            return Err(Error::MissingTemplate {
                kind: kind.to_string(),
            });
        }
        match self {
            Self::Rule(d) => d.bind(kind, name),
            Self::Expr(d) => d.bind(kind, name),
        }
        Ok(())
    }

    /// Release a constraint binding. Idempotent.
    pub fn unbind(&self, kind: &str, name: &str) {
        match self {
            Self::Rule(d) => d.unbind(kind, name),
            Self::Expr(d) => d.unbind(kind, name),
        }
    }

    /// Whether this driver holds a compiled form of the template.
    pub fn has_template(&self, kind: &str) -> bool {
        match self {
            Self::Rule(d) => d.has_template(kind),
            Self::Expr(d) => d.has_template(kind),
        }
    }

    /// Evaluate one bound constraint against a review.
    ///
    /// Runtime failures are reported inside the [`DriverReview`];
    /// only budget exhaustion and cancellation escape as [`EvalStop`].
    pub fn review(
        &self,
        constraint: &Constraint,
        env: &ReviewEnv<'_>,
        ctx: &mut EvalContext<'_>,
    ) -> std::result::Result<DriverReview, EvalStop> {
        match self {
            Self::Rule(d) => d.review(constraint, env, ctx),
            Self::Expr(d) => d.review(constraint, env, ctx),
        }
    }
}

/// The default driver lineup, in dispatch-priority order.
pub fn default_drivers() -> Vec<Driver> {
    vec![
        Driver::Rule(RuleDriver::new()),
        Driver::Expr(ExprDriver::new()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_driver_names_and_capabilities() {
        let drivers = default_drivers();
        assert_eq!(drivers.len(), 2);
        assert_eq!(drivers[0].name(), RULE_ENGINE_NAME);
        assert!(drivers[0].supports_referential_data());
        assert_eq!(drivers[1].name(), EXPR_ENGINE_NAME);
        assert!(!drivers[1].supports_referential_data());
    }

    #[test]
    fn test_bind_unknown_template_is_missing() {
        let driver = Driver::Rule(RuleDriver::new());
        let err = driver.bind("NoSuchKind", "c1").unwrap_err();
        assert!(matches!(err, Error::MissingTemplate { .. }));
    }
}
