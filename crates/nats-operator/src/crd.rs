//! Custom Resource Definitions for the NATS Kubernetes Operator
//!
//! This module defines the `NatsCluster` CRD that represents a NATS server
//! cluster in Kubernetes, together with the plain desired-state view the
//! reconciler works on.

use kube::{CustomResource, ResourceExt};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// API group of the NatsCluster resource
pub const GROUP: &str = "nats.io";

/// Served version of the NatsCluster resource
pub const VERSION: &str = "v1alpha2";

/// Kind of the NatsCluster resource
pub const KIND: &str = "NatsCluster";

/// Default server image repository, combined with `spec.version` as the tag
pub const DEFAULT_SERVER_IMAGE: &str = "nats";

/// Label carrying the owning cluster name on every member
pub const CLUSTER_LABEL: &str = "nats_cluster";

/// Label carrying the server version a member was created with
pub const VERSION_LABEL: &str = "nats_version";

/// Regex for validating image tags used as server versions
static VERSION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").unwrap());

/// Validate a server version (used verbatim as the image tag)
fn validate_version(value: &str) -> Result<(), ValidationError> {
    if VERSION_REGEX.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_version")
            .with_message(format!("'{}' is not a valid image tag", value).into()))
    }
}

/// Validate a container image reference
fn validate_image(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Ok(()); // Empty is allowed (uses default)
    }
    if value.len() > 255 {
        return Err(ValidationError::new("image_too_long")
            .with_message("image reference exceeds 255 characters".into()));
    }
    if value.contains("..") || value.starts_with('/') || value.starts_with('-') {
        return Err(ValidationError::new("invalid_image")
            .with_message(format!("'{}' is not a valid container image", value).into()));
    }
    Ok(())
}

/// NatsCluster custom resource definition
///
/// Declares a NATS cluster of `size` members running server `version`.
/// The operator watches these resources and converges the member pods and
/// the shared `nats.conf` secret to match.
#[derive(CustomResource, Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "nats.io",
    version = "v1alpha2",
    kind = "NatsCluster",
    plural = "natsclusters",
    shortname = "nats",
    namespaced,
    status = "NatsClusterStatus",
    printcolumn = r#"{"name":"Size", "type":"integer", "jsonPath":".spec.size"}"#,
    printcolumn = r#"{"name":"Current", "type":"integer", "jsonPath":".status.size"}"#,
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NatsClusterSpec {
    /// Number of cluster members
    #[serde(default)]
    #[validate(range(min = 0, message = "size must not be negative"))]
    pub size: i32,

    /// NATS server version, used as the image tag
    #[validate(length(min = 1, max = 64, message = "version must be 1-64 characters"))]
    #[validate(custom(function = "validate_version"))]
    pub version: String,

    /// Server image repository (defaults to `nats`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_optional_image"))]
    pub server_image: Option<String>,

    /// Suspend membership and configuration changes
    #[serde(default)]
    pub paused: bool,
}

/// Validate optional image reference
fn validate_optional_image(image: &str) -> Result<(), ValidationError> {
    validate_image(image)
}

impl NatsClusterSpec {
    /// Create a spec for `size` members of `version`
    pub fn new(size: i32, version: impl Into<String>) -> Self {
        Self {
            size,
            version: version.into(),
            server_image: None,
            paused: false,
        }
    }

    /// Get the full container image including version
    pub fn get_image(&self) -> String {
        let repo = self
            .server_image
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SERVER_IMAGE);
        format!("{}:{}", repo, self.version)
    }

    /// Get labels for managed resources
    pub fn get_labels(&self, cluster_name: &str) -> BTreeMap<String, String> {
        let mut labels = selector_labels(cluster_name);
        labels.insert(VERSION_LABEL.to_string(), self.version.clone());
        labels.insert(
            "app.kubernetes.io/managed-by".to_string(),
            "nats-operator".to_string(),
        );
        labels
    }

    /// Get selector labels for managed resources
    pub fn get_selector_labels(&self, cluster_name: &str) -> BTreeMap<String, String> {
        selector_labels(cluster_name)
    }
}

/// Labels that scope members to exactly one cluster
pub fn selector_labels(cluster_name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), "nats".to_string());
    labels.insert(CLUSTER_LABEL.to_string(), cluster_name.to_string());
    labels
}

/// Render selector labels as a label-selector query string
pub fn label_selector(cluster_name: &str) -> String {
    selector_labels(cluster_name)
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Status of a NatsCluster resource
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NatsClusterStatus {
    /// Observed number of members
    pub size: i32,

    /// Current phase of the cluster
    pub phase: ClusterPhase,

    /// Version the members were last converged to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_version: Option<String>,

    /// Generation of the spec this status was computed from
    #[serde(default)]
    pub observed_generation: i64,

    /// Human-readable explanation of the phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Last time the status was updated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

/// Phase of the cluster lifecycle
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ClusterPhase {
    /// Members are being created or are not ready yet
    #[default]
    Creating,
    /// All members exist and are ready
    Running,
    /// Reconciliation keeps failing or the spec is invalid
    Degraded,
}

impl fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterPhase::Creating => write!(f, "Creating"),
            ClusterPhase::Running => write!(f, "Running"),
            ClusterPhase::Degraded => write!(f, "Degraded"),
        }
    }
}

/// Identity of a cluster: `(namespace, name)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterKey {
    pub namespace: String,
    pub name: String,
}

impl ClusterKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Desired state of one cluster as read from the API server
///
/// This is read-only input to the reconciler; status never flows back into it.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterDesiredState {
    pub key: ClusterKey,
    pub spec: NatsClusterSpec,
    /// `metadata.generation`, bumped by the API server on every spec change
    pub generation: Option<i64>,
    /// `metadata.uid`, used for owner references on members and artifacts
    pub uid: Option<String>,
}

impl ClusterDesiredState {
    pub fn new(key: ClusterKey, spec: NatsClusterSpec) -> Self {
        Self {
            key,
            spec,
            generation: None,
            uid: None,
        }
    }
}

impl From<&NatsCluster> for ClusterDesiredState {
    fn from(cluster: &NatsCluster) -> Self {
        Self {
            key: ClusterKey::new(
                cluster.namespace().unwrap_or_else(|| "default".to_string()),
                cluster.name_any(),
            ),
            spec: cluster.spec.clone(),
            generation: cluster.metadata.generation,
            uid: cluster.metadata.uid.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::CustomResourceExt;

    #[test]
    fn test_crd_names() {
        let crd = NatsCluster::crd();
        let names = &crd.spec.names;

        assert_eq!(crd.spec.group, GROUP);
        assert_eq!(names.kind, KIND);
        assert_eq!(names.plural, "natsclusters");
        assert_eq!(names.singular.as_deref(), Some("natscluster"));
        assert_eq!(
            names.short_names.as_deref().and_then(|s| s.first()),
            Some(&"nats".to_string())
        );
        assert_eq!(crd.metadata.name.as_deref(), Some("natsclusters.nats.io"));
        assert_eq!(crd.spec.versions[0].name, VERSION);
    }

    #[test]
    fn test_default_image() {
        let spec = NatsClusterSpec::new(3, "1.1.0");
        assert_eq!(spec.get_image(), "nats:1.1.0");
    }

    #[test]
    fn test_custom_image() {
        let mut spec = NatsClusterSpec::new(1, "2.10.7");
        spec.server_image = Some("registry.local/nats".to_string());
        assert_eq!(spec.get_image(), "registry.local/nats:2.10.7");
    }

    #[test]
    fn test_get_labels() {
        let spec = NatsClusterSpec::new(3, "1.1.0");
        let labels = spec.get_labels("c1");
        assert_eq!(labels.get("app"), Some(&"nats".to_string()));
        assert_eq!(labels.get(CLUSTER_LABEL), Some(&"c1".to_string()));
        assert_eq!(labels.get(VERSION_LABEL), Some(&"1.1.0".to_string()));

        let selector = spec.get_selector_labels("c1");
        assert_eq!(selector.len(), 2);
        assert_eq!(label_selector("c1"), "app=nats,nats_cluster=c1");
    }

    #[test]
    fn test_spec_validation() {
        assert!(NatsClusterSpec::new(0, "1.1.0").validate().is_ok());
        assert!(NatsClusterSpec::new(5, "2.10.7-alpine").validate().is_ok());
        assert!(NatsClusterSpec::new(-1, "1.1.0").validate().is_err());
        assert!(NatsClusterSpec::new(3, "").validate().is_err());
        assert!(NatsClusterSpec::new(3, "1.1.0 beta").validate().is_err());

        let mut spec = NatsClusterSpec::new(3, "1.1.0");
        spec.server_image = Some("-bad".to_string());
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_spec_deserializes_camel_case() {
        let spec: NatsClusterSpec = serde_json::from_value(serde_json::json!({
            "size": 3,
            "version": "1.1.0",
            "serverImage": "nats",
        }))
        .unwrap();
        assert_eq!(spec.size, 3);
        assert_eq!(spec.server_image.as_deref(), Some("nats"));
        assert!(!spec.paused);
    }

    #[test]
    fn test_status_serializes_phase() {
        let status = NatsClusterStatus {
            size: 3,
            phase: ClusterPhase::Running,
            ..Default::default()
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["size"], 3);
        assert_eq!(value["phase"], "Running");
    }

    #[test]
    fn test_desired_state_from_resource() {
        let cluster = NatsCluster {
            metadata: ObjectMeta {
                name: Some("c1".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("uid-1".to_string()),
                generation: Some(4),
                ..Default::default()
            },
            spec: NatsClusterSpec::new(3, "1.1.0"),
            status: None,
        };

        let desired = ClusterDesiredState::from(&cluster);
        assert_eq!(desired.key, ClusterKey::new("default", "c1"));
        assert_eq!(desired.key.to_string(), "default/c1");
        assert_eq!(desired.generation, Some(4));
        assert_eq!(desired.uid.as_deref(), Some("uid-1"));
        assert_eq!(desired.spec.size, 3);
    }
}
