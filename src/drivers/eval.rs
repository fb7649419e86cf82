//! Expression evaluation over decoded Kubernetes objects.
//!
//! Evaluation is total: missing fields read as null, and ordering
//! comparisons against null are false. Only two things stop an evaluation
//! early: the shared cost budget crossing zero, and the external
//! cancellation signal, which is polled at bounded step intervals.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde_json::Value;

use crate::drivers::CancelToken;
use crate::drivers::lang::{CmpOp, Expr, MessagePart, MessageTemplate, Segment};
use crate::inventory::ReferentialCache;

/// How many evaluation steps may pass between cancellation polls.
pub const CANCEL_CHECK_INTERVAL: u64 = 64;

/// Why an evaluation stopped before completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalStop {
    /// The shared per-review cost budget crossed zero.
    Budget,
    /// The external cancellation signal was observed.
    Cancelled,
}

/// An evaluation-level failure.
#[derive(Debug)]
pub enum EvalError {
    /// Resource exhaustion or cancellation; aborts the surrounding review.
    Stop(EvalStop),
    /// A plain runtime failure; reported per constraint, never fatal.
    Failure(String),
}

impl EvalError {
    pub fn failure(msg: impl Into<String>) -> Self {
        Self::Failure(msg.into())
    }
}

/// Tracks evaluation cost against the shared per-review budget.
///
/// The budget intentionally goes negative on exhaustion so later drivers in
/// the same review observe it and skip their work.
#[derive(Debug)]
pub struct CostTracker {
    remaining: i64,
    spent: u64,
    ticks: u64,
}

impl CostTracker {
    pub fn new(budget: u64) -> Self {
        Self {
            remaining: budget as i64,
            spent: 0,
            ticks: 0,
        }
    }

    pub fn spent(&self) -> u64 {
        self.spent
    }

    pub fn remaining(&self) -> i64 {
        self.remaining
    }

    pub fn exhausted(&self) -> bool {
        self.remaining < 0
    }
}

/// Everything a driver needs while evaluating one constraint.
pub struct EvalContext<'a> {
    /// Referential data; `None` for engines without inventory support.
    pub inventory: Option<&'a ReferentialCache>,
    pub cost: &'a mut CostTracker,
    pub cancel: Option<&'a CancelToken>,
}

impl EvalContext<'_> {
    /// Charge `cost` steps, polling cancellation at bounded intervals.
    pub fn step(&mut self, cost: u64) -> Result<(), EvalError> {
        self.cost.spent += cost;
        self.cost.remaining -= cost as i64;
        if self.cost.remaining < 0 {
            return Err(EvalError::Stop(EvalStop::Budget));
        }
        self.cost.ticks += cost;
        if self.cost.ticks >= CANCEL_CHECK_INTERVAL {
            self.cost.ticks = 0;
            if self.cancel.is_some_and(CancelToken::is_cancelled) {
                return Err(EvalError::Stop(EvalStop::Cancelled));
            }
        }
        Ok(())
    }
}

/// Variable bindings visible to an expression.
///
/// Roots (`object`, `params`, ...) are fixed for a constraint evaluation;
/// locals are pushed by `for` loops and shadow roots.
pub struct Bindings<'a> {
    roots: &'a [(&'a str, &'a Value)],
    locals: Vec<(String, Value)>,
}

impl<'a> Bindings<'a> {
    pub fn new(roots: &'a [(&'a str, &'a Value)]) -> Self {
        Self {
            roots,
            locals: Vec::new(),
        }
    }

    pub fn push(&mut self, name: String, value: Value) {
        self.locals.push((name, value));
    }

    pub fn pop(&mut self) {
        self.locals.pop();
    }

    fn lookup(&self, name: &str) -> Option<&Value> {
        if let Some((_, v)) = self.locals.iter().rev().find(|(n, _)| n == name) {
            return Some(v);
        }
        self.roots
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| *v)
    }
}

/// Policy-language truthiness: null and false are false, everything else
/// (any defined value) is true.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        _ => true,
    }
}

/// Deep equality with cross-representation number comparison (1 == 1.0).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|w| values_equal(v, w)))
        }
        _ => a == b,
    }
}

fn compare_order(op: CmpOp, a: &Value, b: &Value) -> bool {
    use std::cmp::Ordering;
    let ord = match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        // Null or mismatched types never order.
        _ => None,
    };
    match ord {
        None => false,
        Some(ord) => match op {
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::Le => ord != Ordering::Greater,
            CmpOp::Gt => ord == Ordering::Greater,
            CmpOp::Ge => ord != Ordering::Less,
            CmpOp::Eq | CmpOp::Ne => unreachable!("handled before ordering"),
        },
    }
}

/// Evaluate an expression to a value.
pub fn eval_expr(
    expr: &Expr,
    bindings: &Bindings<'_>,
    ctx: &mut EvalContext<'_>,
) -> Result<Value, EvalError> {
    ctx.step(1)?;
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Path { root, segments } => {
            let Some(base) = bindings.lookup(root) else {
                return Err(EvalError::failure(format!("unknown variable '{root}'")));
            };
            let mut current = base.clone();
            for segment in segments {
                ctx.step(1)?;
                current = match segment {
                    Segment::Field(name) => current.get(name).cloned().unwrap_or(Value::Null),
                    Segment::Index(idx) => {
                        let idx = eval_expr(idx, bindings, ctx)?;
                        index_value(&current, &idx)
                    }
                };
            }
            Ok(current)
        }
        Expr::Not(e) => {
            let v = eval_expr(e, bindings, ctx)?;
            Ok(Value::Bool(!truthy(&v)))
        }
        Expr::And(a, b) => {
            let va = eval_expr(a, bindings, ctx)?;
            if !truthy(&va) {
                return Ok(Value::Bool(false));
            }
            let vb = eval_expr(b, bindings, ctx)?;
            Ok(Value::Bool(truthy(&vb)))
        }
        Expr::Or(a, b) => {
            let va = eval_expr(a, bindings, ctx)?;
            if truthy(&va) {
                return Ok(Value::Bool(true));
            }
            let vb = eval_expr(b, bindings, ctx)?;
            Ok(Value::Bool(truthy(&vb)))
        }
        Expr::Compare { op, lhs, rhs } => {
            let a = eval_expr(lhs, bindings, ctx)?;
            let b = eval_expr(rhs, bindings, ctx)?;
            let result = match op {
                CmpOp::Eq => values_equal(&a, &b),
                CmpOp::Ne => !values_equal(&a, &b),
                other => compare_order(*other, &a, &b),
            };
            Ok(Value::Bool(result))
        }
        Expr::Call { func, args } => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval_expr(arg, bindings, ctx)?);
            }
            call_builtin(func, &values, ctx)
        }
    }
}

fn index_value(base: &Value, idx: &Value) -> Value {
    match (base, idx) {
        (Value::Object(map), Value::String(key)) => {
            map.get(key).cloned().unwrap_or(Value::Null)
        }
        (Value::Array(items), Value::Number(n)) => n
            .as_u64()
            .and_then(|i| items.get(i as usize))
            .cloned()
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

static REGEX_CACHE: Lazy<RwLock<HashMap<String, Arc<regex::Regex>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

fn cached_regex(pattern: &str) -> Result<Arc<regex::Regex>, EvalError> {
    if let Some(re) = REGEX_CACHE.read().get(pattern) {
        return Ok(Arc::clone(re));
    }
    let re = regex::Regex::new(pattern)
        .map_err(|e| EvalError::failure(format!("invalid regex '{pattern}': {e}")))?;
    let re = Arc::new(re);
    REGEX_CACHE
        .write()
        .insert(pattern.to_string(), Arc::clone(&re));
    Ok(re)
}

fn expect_args(func: &str, args: &[Value], n: usize) -> Result<(), EvalError> {
    if args.len() == n {
        Ok(())
    } else {
        Err(EvalError::failure(format!(
            "{func}() takes {n} arguments, got {}",
            args.len()
        )))
    }
}

fn call_builtin(
    func: &str,
    args: &[Value],
    ctx: &mut EvalContext<'_>,
) -> Result<Value, EvalError> {
    match func {
        "inventory" => {
            expect_args(func, args, 3)?;
            let Some(cache) = ctx.inventory else {
                return Err(EvalError::failure(
                    "referential data is not available to this engine",
                ));
            };
            let group = args[0].as_str().unwrap_or("");
            let Some(kind) = args[1].as_str() else {
                return Err(EvalError::failure("inventory() kind must be a string"));
            };
            let namespace = match &args[2] {
                Value::Null => None,
                Value::String(s) if s.is_empty() => None,
                Value::String(s) => Some(s.as_str()),
                _ => {
                    return Err(EvalError::failure(
                        "inventory() namespace must be a string or null",
                    ));
                }
            };
            let items = cache.list(group, kind, namespace);
            ctx.step(items.len() as u64)?;
            Ok(Value::Array(
                items.iter().map(|v| (**v).clone()).collect(),
            ))
        }
        "count" => {
            expect_args(func, args, 1)?;
            let n = match &args[0] {
                Value::Null => 0,
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                Value::String(s) => s.chars().count(),
                other => {
                    return Err(EvalError::failure(format!(
                        "count() cannot measure a {}",
                        value_kind(other)
                    )));
                }
            };
            Ok(Value::from(n as u64))
        }
        "contains" => {
            expect_args(func, args, 2)?;
            let found = match (&args[0], &args[1]) {
                (Value::Null, _) => false,
                (Value::Array(items), needle) => {
                    items.iter().any(|v| values_equal(v, needle))
                }
                (Value::String(s), Value::String(needle)) => s.contains(needle.as_str()),
                (Value::Object(map), Value::String(key)) => map.contains_key(key),
                _ => false,
            };
            Ok(Value::Bool(found))
        }
        "has" => {
            expect_args(func, args, 1)?;
            Ok(Value::Bool(!args[0].is_null()))
        }
        "startswith" | "endswith" => {
            expect_args(func, args, 2)?;
            let result = match (&args[0], &args[1]) {
                (Value::String(s), Value::String(p)) => {
                    if func == "startswith" {
                        s.starts_with(p.as_str())
                    } else {
                        s.ends_with(p.as_str())
                    }
                }
                _ => false,
            };
            Ok(Value::Bool(result))
        }
        "matches" => {
            expect_args(func, args, 2)?;
            match (&args[0], &args[1]) {
                (Value::String(s), Value::String(pattern)) => {
                    let re = cached_regex(pattern)?;
                    Ok(Value::Bool(re.is_match(s)))
                }
                (Value::Null, _) => Ok(Value::Bool(false)),
                _ => Err(EvalError::failure(
                    "matches() takes a string and a pattern",
                )),
            }
        }
        other => Err(EvalError::failure(format!("unknown function '{other}'"))),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Render a message template, interpolating `${...}` expressions.
pub fn render_message(
    template: &MessageTemplate,
    bindings: &Bindings<'_>,
    ctx: &mut EvalContext<'_>,
) -> Result<String, EvalError> {
    let mut out = String::new();
    for part in &template.parts {
        match part {
            MessagePart::Text(text) => out.push_str(text),
            MessagePart::Expr(expr) => {
                let v = eval_expr(expr, bindings, ctx)?;
                match v {
                    Value::String(s) => out.push_str(&s),
                    Value::Null => out.push_str("<null>"),
                    other => out.push_str(&other.to_string()),
                }
            }
        }
    }
    Ok(out)
}
