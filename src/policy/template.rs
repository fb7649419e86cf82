//! Constraint template documents.

use serde_json::Value;

use crate::error::{Error, Result};
use crate::policy::schema::ParamSchema;

/// One engine-specific code body inside a template.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeEntry {
    /// Engine name (e.g. "Rules", "Expr").
    pub engine: String,
    /// Engine-defined source. The Rules engine expects a string; the Expr
    /// engine expects a mapping with a `validations` list.
    pub source: Value,
}

/// A parsed constraint template.
///
/// Templates are immutable once registered with a client; re-registering a
/// kind requires removing it first.
#[derive(Debug, Clone)]
pub struct Template {
    /// The document's `metadata.name` (lowercased template kind by
    /// convention, but not enforced).
    pub name: String,
    /// The unique constraint kind from `spec.crd.spec.names.kind`.
    pub kind: String,
    /// Parameter schema from `spec.crd.spec.validation.openAPIV3Schema`.
    pub schema: Option<ParamSchema>,
    /// Per-engine code bodies.
    pub code: Vec<CodeEntry>,
}

impl Template {
    /// Parse a template from a decoded Kubernetes document.
    ///
    /// The document must already be known to belong to the template API
    /// group; this only validates structure.
    pub fn from_document(doc: &Value) -> Result<Self> {
        let kind_field = doc.get("kind").and_then(|v| v.as_str()).unwrap_or("");
        if kind_field != "ConstraintTemplate" {
            return Err(Error::invalid(format!(
                "expected kind ConstraintTemplate, got '{kind_field}'"
            )));
        }

        let name = doc
            .pointer("/metadata/name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::invalid("constraint template is missing metadata.name"))?
            .to_string();

        let crd_kind = doc
            .pointer("/spec/crd/spec/names/kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                Error::invalid(format!(
                    "constraint template '{name}' is missing spec.crd.spec.names.kind"
                ))
            })?
            .to_string();

        let schema = match doc.pointer("/spec/crd/spec/validation/openAPIV3Schema") {
            Some(raw) => Some(ParamSchema::parse(raw).map_err(|reason| {
                Error::invalid(format!(
                    "constraint template '{name}' has an invalid parameter schema: {reason}"
                ))
            })?),
            None => None,
        };

        let targets = doc
            .pointer("/spec/targets")
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                Error::invalid(format!(
                    "constraint template '{name}' has no spec.targets"
                ))
            })?;

        let mut code = Vec::new();
        for target in targets {
            if let Some(entries) = target.get("code").and_then(|v| v.as_array()) {
                for entry in entries {
                    let engine = entry
                        .get("engine")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| {
                            Error::invalid(format!(
                                "constraint template '{name}' has a code entry without an engine"
                            ))
                        })?
                        .to_string();
                    let source = entry.get("source").cloned().unwrap_or(Value::Null);
                    code.push(CodeEntry { engine, source });
                }
            }

            // Legacy location: a bare rule-engine source under targets[].rego.
            if let Some(rego) = target.get("rego").and_then(|v| v.as_str()) {
                let already = code
                    .iter()
                    .any(|c| c.engine == crate::drivers::RULE_ENGINE_NAME);
                if !already {
                    code.push(CodeEntry {
                        engine: crate::drivers::RULE_ENGINE_NAME.to_string(),
                        source: Value::String(rego.to_string()),
                    });
                }
            }
        }

        if code.is_empty() {
            return Err(Error::invalid(format!(
                "constraint template '{name}' carries no code for any engine"
            )));
        }

        Ok(Self {
            name,
            kind: crd_kind,
            schema,
            code,
        })
    }

    /// Find the code entry for a given engine, if present.
    pub fn code_for(&self, engine: &str) -> Option<&CodeEntry> {
        self.code.iter().find(|c| c.engine == engine)
    }
}
