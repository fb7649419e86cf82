//! Review targets.
//!
//! A target defines a domain of reviewable objects: how to pull the subject
//! of evaluation out of a review request, and the data path under which its
//! inventory lives. The crate ships exactly one target, Kubernetes
//! admission, but the trait keeps the client target-agnostic.

use serde_json::Value;

use crate::policy::split_api_version;

/// The admission operation under review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    #[default]
    Create,
    Update,
    Delete,
    Connect,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Connect => "CONNECT",
        }
    }
}

/// Whether the reviewed object came in as-is or was produced by expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReviewSource {
    #[default]
    Original,
    Generated,
}

/// A single evaluation request.
#[derive(Debug, Clone)]
pub struct ReviewRequest {
    /// The object under review.
    pub object: Value,
    /// Prior state, for UPDATE operations.
    pub old_object: Option<Value>,
    pub operation: Operation,
    /// The Namespace object the subject lives in, when the caller has it.
    pub namespace_object: Option<Value>,
    pub source: ReviewSource,
}

impl ReviewRequest {
    /// A CREATE review of a bare object.
    pub fn for_object(object: Value) -> Self {
        Self {
            object,
            old_object: None,
            operation: Operation::Create,
            namespace_object: None,
            source: ReviewSource::Original,
        }
    }

    pub fn with_namespace_object(mut self, ns: Value) -> Self {
        self.namespace_object = Some(ns);
        self
    }
}

/// Identity of a reviewable Kubernetes object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub group: String,
    pub kind: String,
    /// Empty for cluster-scoped objects.
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    /// Extract the identity fields from a decoded Kubernetes object.
    ///
    /// Returns `None` when `kind` is absent; missing names are tolerated
    /// (objects under review may be unnamed, e.g. generateName).
    pub fn from_object(object: &Value) -> Option<Self> {
        let kind = object.get("kind")?.as_str()?.to_string();
        let group = object
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .map(|av| split_api_version(av).0)
            .unwrap_or("")
            .to_string();
        let namespace = object
            .pointer("/metadata/namespace")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let name = object
            .pointer("/metadata/name")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        Some(Self {
            group,
            kind,
            namespace,
            name,
        })
    }

    pub fn is_cluster_scoped(&self) -> bool {
        self.namespace.is_empty()
    }
}

/// A review target.
pub trait TargetHandler: Send + Sync {
    /// Stable target name used to key aggregated responses.
    fn name(&self) -> &'static str;

    /// Classify the request and extract the subject of evaluation.
    ///
    /// Returns `None` when the request is not reviewable by this target,
    /// in which case the review yields empty responses for it.
    fn handles_review(&self, request: &ReviewRequest) -> Option<ObjectRef>;

    /// The path prefix under which this target's inventory is stored,
    /// letting multiple targets share one referential cache.
    fn data_prefix(&self) -> &'static [&'static str];
}

/// The Kubernetes admission target.
#[derive(Debug, Default)]
pub struct AdmissionTarget;

/// Target name for Kubernetes admission reviews.
pub const ADMISSION_TARGET_NAME: &str = "admission.k8s.gatekeeper.sh";

impl TargetHandler for AdmissionTarget {
    fn name(&self) -> &'static str {
        ADMISSION_TARGET_NAME
    }

    fn handles_review(&self, request: &ReviewRequest) -> Option<ObjectRef> {
        // DELETE reviews evaluate the prior state when the object is gone.
        let subject = if request.operation == Operation::Delete
            && request.object.is_null()
        {
            request.old_object.as_ref()?
        } else {
            &request.object
        };
        ObjectRef::from_object(subject)
    }

    fn data_prefix(&self) -> &'static [&'static str] {
        &["cluster"]
    }
}
