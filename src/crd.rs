use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/* ============================= SPEC ============================= */

/// DataPlaneControl declares the desired rollout state for one revision:
/// the sidecar version it should converge to and what fraction of its
/// eligible pods should be running it.
///
/// Cluster-scoped: a revision and its rollout goal are not namespace-local
/// concepts, they span every namespace the revision's webhook reaches.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "mdp.dataplane.io",
    version = "v1",
    kind = "DataPlaneControl",
    plural = "dataplanecontrols",
    status = "DataPlaneControlStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct DataPlaneControlSpec {
    /// Identifier of the control-plane flavor this record governs.
    pub revision: String,

    /// Target sidecar version string pods in this revision should run.
    pub proxy_version: String,

    /// Fraction of eligible pods that should run `proxy_version`, in
    /// basis points of 10,000 (`8000` = 80%).
    pub proxy_target_basis_points: u32,
}

/* ============================= STATUS ============================= */

/// Reconcile outcome for a `DataPlaneControl` record.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ReconcileState {
    #[default]
    Reconciling,
    Ready,
    Error,
}

/// Error classification surfaced on a record's status when `state == Error`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCode {
    InvalidRevision,
    VersionMismatch,
    TooManyEvictions,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataPlaneControlStatus {
    pub state: ReconcileState,
    pub achieved_basis_points: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<ErrorDetails>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
}

impl Default for DataPlaneControlStatus {
    fn default() -> Self {
        Self {
            state: ReconcileState::Reconciling,
            achieved_basis_points: 0,
            observed_generation: None,
            error_details: None,
        }
    }
}

/* ============================= TRI-STATE ENABLEMENT ============================= */

/// Whether a revision/namespace/pod opts into data-plane management.
///
/// Deliberately not a `bool` or `Option<bool>`: enablement precedence
/// depends on distinguishing "explicitly false" from "not set at all",
/// which a nullable boolean collapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enablement {
    Explicit(bool),
    Missing,
}

impl Enablement {
    /// `missing` resolves to `false` wherever a final decision is needed.
    pub fn as_bool(self) -> bool {
        matches!(self, Enablement::Explicit(true))
    }
}

const ENABLEMENT_ANNOTATION: &str = "managed-data-plane/enabled";

/// Parses the `managed-data-plane/enabled` annotation, shaped as
/// `{"managed": "true" | "false"}`. Absent annotation is `Missing`, a
/// malformed one surfaces a JSON error (treated as `Missing` by callers
/// per the error-handling policy, not here).
pub fn parse_enablement_annotation(
    annotations: &BTreeMap<String, String>,
) -> Result<Enablement, serde_json::Error> {
    let Some(raw) = annotations.get(ENABLEMENT_ANNOTATION) else {
        return Ok(Enablement::Missing);
    };

    #[derive(Deserialize)]
    struct Shape {
        managed: String,
    }

    let parsed: Shape = serde_json::from_str(raw)?;
    match parsed.managed.as_str() {
        "true" => Ok(Enablement::Explicit(true)),
        "false" => Ok(Enablement::Explicit(false)),
        _ => Ok(Enablement::Missing),
    }
}

/* ============================= POD WORK ITEMS ============================= */

/// One pod queued for (or in flight for) a sidecar upgrade.
///
/// `from_version` is carried purely for reporting — it plays no role in
/// equality or hashing, since the same pod re-queued at a different
/// observed version is still the same work item.
#[derive(Debug, Clone)]
pub struct PodWorkItem {
    pub namespace: String,
    pub name: String,
    pub from_version: String,
}

impl PodWorkItem {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        from_version: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            from_version: from_version.into(),
        }
    }

    /// Identity used for queue membership and dedup: namespace + name.
    pub fn key(&self) -> (String, String) {
        (self.namespace.clone(), self.name.clone())
    }
}

impl PartialEq for PodWorkItem {
    fn eq(&self, other: &Self) -> bool {
        self.namespace == other.namespace && self.name == other.name
    }
}
impl Eq for PodWorkItem {}

impl std::hash::Hash for PodWorkItem {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.namespace.hash(state);
        self.name.hash(state);
    }
}

/* ============================= EVENTS ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

/* ============================= ELIGIBILITY PREDICATES ============================= */

pub const WEBHOOK_MARKER_LABEL_KEY: &str = "app";
pub const WEBHOOK_MARKER_LABEL_VALUE: &str = "sidecar-injector";
pub const REVISION_LABEL: &str = "istio.io/rev";
pub const INJECTION_ANNOTATION: &str = "sidecar.istio.io/inject";
pub const UPGRADE_FAILED_LABEL: &str = "dataplane-upgrade";

/// Prefix identifying an enablement configmap in the control-plane
/// namespace; the name suffix is the revision it governs.
pub const ENABLEMENT_CONFIGMAP_PREFIX: &str = "managed-data-plane-enablement-";

const RESERVED_NAMESPACES: &[&str] = &["kube-system", "kube-public", "kube-node-lease"];

/// True for the small set of namespaces the rollout engine never touches,
/// regardless of enablement annotations.
pub fn is_reserved_namespace(ns: &str) -> bool {
    RESERVED_NAMESPACES.contains(&ns)
}

/// `sidecar.istio.io/inject` accepts a handful of truthy spellings; an
/// absent annotation defaults to "inject" (the sidecar is assumed wanted
/// unless explicitly suppressed).
pub fn injection_requested(annotations: &BTreeMap<String, String>) -> bool {
    match annotations.get(INJECTION_ANNOTATION) {
        None => true,
        Some(v) => matches!(v.as_str(), "y" | "yes" | "true" | "on" | ""),
    }
}

/// Extracts the sidecar's version tag from a container image reference
/// such as `docker.io/istio/proxyv2:1.21.0` → `"1.21.0"`. Returns `None`
/// when no sidecar container is present.
pub fn derive_proxy_version(
    container_images: &[String],
    sidecar_image_prefix: &str,
) -> Option<String> {
    container_images.iter().find_map(|image| {
        image
            .strip_prefix(sidecar_image_prefix)
            .and_then(|rest| rest.rsplit_once(':'))
            .map(|(_, tag)| tag.to_string())
    })
}

/// True when any of the pod's container images carries the sidecar prefix.
pub fn has_sidecar_container(container_images: &[String], sidecar_image_prefix: &str) -> bool {
    container_images
        .iter()
        .any(|image| image.starts_with(sidecar_image_prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_enablement_missing() {
        let a = annotations(&[]);
        assert_eq!(parse_enablement_annotation(&a).unwrap(), Enablement::Missing);
    }

    #[test]
    fn test_parse_enablement_true() {
        let a = annotations(&[(ENABLEMENT_ANNOTATION, r#"{"managed":"true"}"#)]);
        assert_eq!(
            parse_enablement_annotation(&a).unwrap(),
            Enablement::Explicit(true)
        );
    }

    #[test]
    fn test_parse_enablement_false() {
        let a = annotations(&[(ENABLEMENT_ANNOTATION, r#"{"managed":"false"}"#)]);
        assert_eq!(
            parse_enablement_annotation(&a).unwrap(),
            Enablement::Explicit(false)
        );
    }

    #[test]
    fn test_parse_enablement_malformed_json_errors() {
        let a = annotations(&[(ENABLEMENT_ANNOTATION, "not json")]);
        assert!(parse_enablement_annotation(&a).is_err());
    }

    #[test]
    fn test_enablement_as_bool() {
        assert!(Enablement::Explicit(true).as_bool());
        assert!(!Enablement::Explicit(false).as_bool());
        assert!(!Enablement::Missing.as_bool());
    }

    #[test]
    fn test_injection_requested_defaults_true() {
        assert!(injection_requested(&annotations(&[])));
    }

    #[test]
    fn test_injection_requested_suppressed() {
        assert!(!injection_requested(&annotations(&[(
            INJECTION_ANNOTATION,
            "false"
        )])));
    }

    #[test]
    fn test_injection_requested_truthy_spellings() {
        for v in ["y", "yes", "true", "on", ""] {
            assert!(injection_requested(&annotations(&[(INJECTION_ANNOTATION, v)])));
        }
    }

    #[test]
    fn test_derive_proxy_version() {
        let images = vec!["docker.io/istio/proxyv2:1.21.0".to_string()];
        assert_eq!(
            derive_proxy_version(&images, "docker.io/istio/proxyv2:"),
            Some("1.21.0".to_string())
        );
    }

    #[test]
    fn test_derive_proxy_version_absent() {
        let images = vec!["nginx:1.25".to_string()];
        assert_eq!(
            derive_proxy_version(&images, "docker.io/istio/proxyv2:"),
            None
        );
    }

    #[test]
    fn test_has_sidecar_container() {
        let images = vec!["docker.io/istio/proxyv2:1.21.0".to_string()];
        assert!(has_sidecar_container(&images, "docker.io/istio/proxyv2:"));
        assert!(!has_sidecar_container(&images, "docker.io/other:"));
    }

    #[test]
    fn test_is_reserved_namespace() {
        assert!(is_reserved_namespace("kube-system"));
        assert!(!is_reserved_namespace("default"));
    }

    #[test]
    fn test_pod_work_item_equality_ignores_from_version() {
        let a = PodWorkItem::new("ns", "pod-1", "1.11");
        let b = PodWorkItem::new("ns", "pod-1", "1.12");
        assert_eq!(a, b);
    }

    #[test]
    fn test_status_default_is_reconciling_zero() {
        let status = DataPlaneControlStatus::default();
        assert_eq!(status.state, ReconcileState::Reconciling);
        assert_eq!(status.achieved_basis_points, 0);
    }
}
