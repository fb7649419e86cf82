//! The review pipeline.

use std::time::Instant;

use serde_json::Value;

use crate::client::matching::{self, Decision};
use crate::client::responses::{
    Responses, StatsEntry, TargetResponse, Violation, ViolationKind,
};
use crate::client::Client;
use crate::drivers::{CancelToken, CostTracker, EvalContext, EvalStop, ReviewEnv};
use crate::error::{Error, Result};
use crate::inventory::CacheKey;
use crate::target::{ReviewRequest, TargetHandler};

/// Options for a single review.
#[derive(Debug, Clone, Default)]
pub struct ReviewOpts {
    /// Restrict to constraints whose enforcement-point set intersects this
    /// filter. `None` applies every constraint.
    pub enforcement_points: Option<Vec<String>>,
    /// Collect per-constraint timing and evaluation counts.
    pub gather_stats: bool,
    /// Record a dispatch trace.
    pub trace: bool,
    /// Override the client's default cost budget for this review.
    pub cost_budget: Option<u64>,
    /// External cancellation signal, polled between constraints and at
    /// bounded intervals inside drivers.
    pub cancel: Option<CancelToken>,
}

impl Client {
    /// Evaluate every matching constraint against the request.
    ///
    /// Violations are returned in constraint dispatch order (kind, then
    /// name), which is stable for a fixed registry. Per-constraint
    /// evaluation failures become error-kind entries; only budget
    /// exhaustion escapes as an `Err`. Cancellation is reported through
    /// [`Responses::cancelled`] together with any partial results.
    pub fn review(&self, request: &ReviewRequest, opts: &ReviewOpts) -> Result<Responses> {
        let mut responses = Responses::default();
        let Some(obj) = self.target.handles_review(request) else {
            return Ok(responses);
        };

        let mut target_resp = TargetResponse::default();
        if opts.trace {
            target_resp.trace = Some(String::new());
        }

        static NULL_VALUE: Value = Value::Null;
        let operation = Value::String(request.operation.as_str().to_string());
        let namespace_object = self.resolve_namespace_object(request, &obj.namespace);
        let subject = if request.object.is_null() {
            request.old_object.as_ref().unwrap_or(&NULL_VALUE)
        } else {
            &request.object
        };
        let old_object = request.old_object.as_ref().unwrap_or(&NULL_VALUE);

        let registry = self.registry.read();
        let mut cost = CostTracker::new(opts.cost_budget.unwrap_or(self.default_budget));

        'dispatch: for (kind, by_name) in &registry.constraints {
            let Some(entry) = registry.templates.get(kind) else {
                continue;
            };
            // The first accepting driver holds the compiled form.
            let Some(&driver_idx) = entry.accepted.first() else {
                continue;
            };
            let driver = &self.drivers[driver_idx];

            for constraint in by_name.values() {
                if let Some(token) = &opts.cancel {
                    if token.is_cancelled() {
                        responses.cancelled = true;
                        break 'dispatch;
                    }
                }
                if cost.exhausted() {
                    return Err(Error::BudgetExhausted { spent: cost.spent() });
                }

                if !self.enforcement_points.applies(
                    &constraint.enforcement_points,
                    opts.enforcement_points.as_deref(),
                ) {
                    continue;
                }

                match matching::decide(
                    &constraint.match_criteria,
                    &obj,
                    subject,
                    &namespace_object,
                ) {
                    Decision::Matches => {}
                    Decision::DoesNotMatch => continue,
                    Decision::MissingNamespaceObject(ns) => {
                        target_resp.violations.push(Violation {
                            constraint_kind: constraint.kind.clone(),
                            constraint_name: constraint.name.clone(),
                            message: format!(
                                "namespace '{ns}' was not found in the inventory while \
                                 evaluating the constraint's namespaceSelector"
                            ),
                            enforcement_action: constraint.enforcement_action.clone(),
                            kind: ViolationKind::EvaluationError,
                            details: None,
                        });
                        continue;
                    }
                }

                let env = ReviewEnv {
                    object: subject,
                    old_object,
                    namespace: &namespace_object,
                    operation: &operation,
                };
                let inventory = driver
                    .supports_referential_data()
                    .then_some(&*self.inventory);
                let mut ctx = EvalContext {
                    inventory,
                    cost: &mut cost,
                    cancel: opts.cancel.as_ref(),
                };

                let started = opts.gather_stats.then(Instant::now);
                match driver.review(constraint, &env, &mut ctx) {
                    Ok(driver_review) => {
                        if let Some(started) = started {
                            target_resp.stats.push(StatsEntry {
                                constraint_kind: constraint.kind.clone(),
                                constraint_name: constraint.name.clone(),
                                engine: driver.name(),
                                duration: started.elapsed(),
                                evaluations: driver_review.evaluations,
                            });
                        }
                        if let Some(trace) = target_resp.trace.as_mut() {
                            trace.push_str(&format!(
                                "{} [{}]: {} violation(s)\n",
                                constraint.identity(),
                                driver.name(),
                                driver_review.violations.len(),
                            ));
                        }
                        for v in driver_review.violations {
                            target_resp.violations.push(Violation {
                                constraint_kind: constraint.kind.clone(),
                                constraint_name: constraint.name.clone(),
                                message: v.message,
                                enforcement_action: constraint.enforcement_action.clone(),
                                kind: if v.error {
                                    ViolationKind::EvaluationError
                                } else {
                                    ViolationKind::Policy
                                },
                                details: None,
                            });
                        }
                    }
                    Err(EvalStop::Budget) => {
                        return Err(Error::BudgetExhausted { spent: cost.spent() });
                    }
                    Err(EvalStop::Cancelled) => {
                        responses.cancelled = true;
                        break 'dispatch;
                    }
                }
            }
        }

        responses
            .by_target
            .insert(self.target.name().to_string(), target_resp);
        Ok(responses)
    }

    fn resolve_namespace_object(&self, request: &ReviewRequest, namespace: &str) -> Value {
        if let Some(ns) = &request.namespace_object {
            return ns.clone();
        }
        if namespace.is_empty() {
            return Value::Null;
        }
        self.inventory
            .get(&CacheKey::new("", "Namespace", "", namespace))
            .map(|v| (*v).clone())
            .unwrap_or(Value::Null)
    }
}
