//! Error taxonomy for the policy evaluation harness.
//!
//! One crate-wide error enum keeps the failure surface small and lets the
//! binary map every non-recoverable variant onto a single exit code. Two
//! variants deserve a note:
//!
//! - `EvaluationFailure` is only used when a failure has to travel through a
//!   `Result`; during a review, per-constraint evaluation errors are captured
//!   as error-kind entries inside [`crate::client::Responses`] and never
//!   abort the review.
//! - `IncompatibleTemplate` is distinct from a compile error: it means no
//!   registered driver carries code for the template, which the benchmark
//!   harness counts as a skip, not a failure.

use std::path::PathBuf;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All failures the harness can surface to a caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed template, constraint, or object document.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A constraint references a template kind that is not registered.
    #[error("no template registered for kind '{kind}'")]
    MissingTemplate { kind: String },

    /// Constraint parameters do not conform to the template's schema.
    #[error("constraint '{name}' violates the schema of template '{kind}': {reason}")]
    SchemaViolation {
        kind: String,
        name: String,
        reason: String,
    },

    /// No registered driver accepts the template's code bodies.
    #[error("template '{kind}' is not compatible with any registered driver")]
    IncompatibleTemplate { kind: String },

    /// A specific evaluation failed at runtime.
    #[error("evaluation of constraint '{constraint}' failed: {reason}")]
    EvaluationFailure {
        constraint: String,
        reason: String,
    },

    /// The per-review cost ceiling was crossed; the review was aborted.
    #[error("review cost budget exhausted after {spent} evaluation steps")]
    BudgetExhausted { spent: u64 },

    /// The external cancellation signal was observed.
    #[error("review cancelled")]
    Cancelled,

    /// Reading inputs or persisting results failed.
    #[error("i/o failure on {path}: {reason}")]
    IoFailure { path: PathBuf, reason: String },
}

impl Error {
    /// Shorthand for an [`Error::InvalidInput`] with a formatted message.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Build an [`Error::IoFailure`] from a path and an underlying error.
    pub fn io(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::IoFailure {
            path: path.into(),
            reason: err.to_string(),
        }
    }

    /// Whether this error marks a skipped template rather than a hard stop.
    pub fn is_template_skip(&self) -> bool {
        matches!(self, Self::IncompatibleTemplate { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let e = Error::MissingTemplate {
            kind: "K8sRequiredLabels".into(),
        };
        assert!(e.to_string().contains("K8sRequiredLabels"));

        let e = Error::BudgetExhausted { spent: 12_000 };
        assert!(e.to_string().contains("12000"));
    }

    #[test]
    fn test_skip_classification() {
        assert!(
            Error::IncompatibleTemplate {
                kind: "X".into()
            }
            .is_template_skip()
        );
        assert!(!Error::Cancelled.is_template_skip());
    }
}
