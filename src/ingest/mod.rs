//! Input ingestion.
//!
//! Reads policy batches from files and directories: multi-document YAML is
//! split, each document is decoded, and documents are categorized by API
//! group into templates, constraints, and review objects. JSON files are
//! accepted too (YAML is a superset for our purposes).

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::policy::{
    CONSTRAINT_GROUP, Constraint, TEMPLATE_GROUP, Template, document_group,
};

/// A categorized batch of input documents.
#[derive(Debug, Default)]
pub struct DocumentBatch {
    pub templates: Vec<Template>,
    pub constraints: Vec<Constraint>,
    /// Everything that is neither template nor constraint: candidate review
    /// objects, which double as referential inventory.
    pub objects: Vec<Value>,
}

impl DocumentBatch {
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty() && self.constraints.is_empty() && self.objects.is_empty()
    }

    /// Find the Namespace object for `namespace`, if the batch carries one.
    pub fn namespace_object(&self, namespace: &str) -> Option<&Value> {
        self.objects.iter().find(|o| {
            o.get("kind").and_then(Value::as_str) == Some("Namespace")
                && o.pointer("/metadata/name").and_then(Value::as_str) == Some(namespace)
        })
    }

    /// Categorize one decoded document into the batch.
    pub fn push_document(&mut self, doc: Value) -> Result<()> {
        match document_group(&doc) {
            Some(TEMPLATE_GROUP) => {
                self.templates.push(Template::from_document(&doc)?);
            }
            Some(CONSTRAINT_GROUP) => {
                self.constraints.push(Constraint::from_document(&doc)?);
            }
            Some(_) => self.objects.push(doc),
            None => {
                return Err(Error::invalid(
                    "document has no apiVersion; not a Kubernetes object",
                ));
            }
        }
        Ok(())
    }
}

/// Parse multi-document YAML content into decoded JSON values.
///
/// Empty documents and comment-only documents are skipped.
pub fn parse_documents(content: &str) -> Result<Vec<Value>> {
    let mut docs = Vec::new();
    for de in serde_yaml::Deserializer::from_str(content) {
        let value = Value::deserialize(de)
            .map_err(|e| Error::invalid(format!("malformed YAML document: {e}")))?;
        if !value.is_null() {
            docs.push(value);
        }
    }
    Ok(docs)
}

/// Load and categorize every document reachable from the given paths.
///
/// Directories are walked recursively for `.yaml`/`.yml`/`.json` files.
/// A malformed file fails the whole load; benchmark inputs are meant to be
/// curated, so silently dropping documents would skew results.
pub fn load_batch(paths: &[PathBuf]) -> Result<DocumentBatch> {
    let mut batch = DocumentBatch::default();
    for path in paths {
        if path.is_dir() {
            load_dir(path, &mut batch)?;
        } else {
            load_file(path, &mut batch)?;
        }
    }
    Ok(batch)
}

fn load_dir(dir: &Path, batch: &mut DocumentBatch) -> Result<()> {
    for entry in walkdir::WalkDir::new(dir)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let ext = path.extension().and_then(|e| e.to_str());
        if matches!(ext, Some("yaml") | Some("yml") | Some("json")) {
            load_file(path, batch)?;
        }
    }
    Ok(())
}

fn load_file(path: &Path, batch: &mut DocumentBatch) -> Result<()> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    let docs = parse_documents(&content).map_err(|e| {
        Error::invalid(format!("{}: {e}", path.display()))
    })?;
    log::debug!("{}: {} document(s)", path.display(), docs.len());
    for doc in docs {
        batch
            .push_document(doc)
            .map_err(|e| Error::invalid(format!("{}: {e}", path.display())))?;
    }
    Ok(())
}

/// Narrow contract through which OCI policy bundles are supplied.
///
/// Pulling from a registry is an external collaborator's job; the in-tree
/// implementation only reports that no registry client is wired in.
pub trait BundleSource {
    /// Fetch the bundle behind `reference` and return its raw documents.
    fn fetch(&self, reference: &str) -> Result<Vec<String>>;
}

/// The default, registry-less bundle source.
#[derive(Debug, Default)]
pub struct NoBundleSource;

impl BundleSource for NoBundleSource {
    fn fetch(&self, reference: &str) -> Result<Vec<String>> {
        Err(Error::IoFailure {
            path: PathBuf::from(reference),
            reason: "no OCI registry client is configured in this build".to_string(),
        })
    }
}

/// Ingest OCI references through a bundle source into the batch.
pub fn load_images(
    source: &dyn BundleSource,
    references: &[String],
    batch: &mut DocumentBatch,
) -> Result<()> {
    for reference in references {
        for content in source.fetch(reference)? {
            for doc in parse_documents(&content)? {
                batch.push_document(doc)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MIXED: &str = r#"
apiVersion: templates.gatekeeper.sh/v1
kind: ConstraintTemplate
metadata:
  name: k8salwaysdeny
spec:
  crd:
    spec:
      names:
        kind: K8sAlwaysDeny
  targets:
    - target: admission.k8s.gatekeeper.sh
      code:
        - engine: Rules
          source: deny "denied by policy"
---
apiVersion: constraints.gatekeeper.sh/v1beta1
kind: K8sAlwaysDeny
metadata:
  name: deny-all
---
# a plain review object
apiVersion: v1
kind: Pod
metadata:
  name: web
  namespace: default
---
"#;

    #[test]
    fn test_parse_documents_splits_and_skips_empty() {
        let docs = parse_documents(MIXED).unwrap();
        assert_eq!(docs.len(), 3);
    }

    #[test]
    fn test_categorization() {
        let mut batch = DocumentBatch::default();
        for doc in parse_documents(MIXED).unwrap() {
            batch.push_document(doc).unwrap();
        }
        assert_eq!(batch.templates.len(), 1);
        assert_eq!(batch.constraints.len(), 1);
        assert_eq!(batch.objects.len(), 1);
        assert_eq!(batch.templates[0].kind, "K8sAlwaysDeny");
        assert_eq!(batch.constraints[0].name, "deny-all");
    }

    #[test]
    fn test_document_without_api_version_rejected() {
        let mut batch = DocumentBatch::default();
        let err = batch.push_document(json!({"kind": "Pod"})).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_namespace_object_lookup() {
        let mut batch = DocumentBatch::default();
        batch
            .push_document(json!({
                "apiVersion": "v1", "kind": "Namespace",
                "metadata": {"name": "prod", "labels": {"env": "prod"}}
            }))
            .unwrap();
        assert!(batch.namespace_object("prod").is_some());
        assert!(batch.namespace_object("dev").is_none());
    }

    #[test]
    fn test_load_batch_from_files_and_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("policies.yaml"), MIXED).unwrap();
        let sub = dir.path().join("objects");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(
            sub.join("svc.json"),
            serde_json::to_string(&json!({
                "apiVersion": "v1", "kind": "Service",
                "metadata": {"name": "svc-a", "namespace": "default"}
            }))
            .unwrap(),
        )
        .unwrap();
        std::fs::write(sub.join("notes.txt"), "ignored").unwrap();

        let batch = load_batch(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(batch.templates.len(), 1);
        assert_eq!(batch.constraints.len(), 1);
        assert_eq!(batch.objects.len(), 2);
    }

    #[test]
    fn test_malformed_file_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.yaml");
        std::fs::write(&path, "kind: [unclosed").unwrap();
        assert!(load_batch(&[path]).is_err());
    }

    #[test]
    fn test_missing_file_is_io_failure() {
        let err = load_batch(&[PathBuf::from("/no/such/file.yaml")]).unwrap_err();
        assert!(matches!(err, Error::IoFailure { .. }));
    }

    #[test]
    fn test_no_bundle_source_errors() {
        let mut batch = DocumentBatch::default();
        let err = load_images(
            &NoBundleSource,
            &["ghcr.io/example/policies:v1".to_string()],
            &mut batch,
        )
        .unwrap_err();
        assert!(matches!(err, Error::IoFailure { .. }));
    }
}
