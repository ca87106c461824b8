use std::collections::BTreeMap;

use k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, ObjectReference, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::events::{Event as RecordedEvent, EventType as RecordedEventType, Recorder, Reporter};
use kube::{Client, ResourceExt};
use serde_json::json;

use crate::crd::{DataPlaneControl, DataPlaneControlStatus, EventType};
use crate::error::{MdpError, Result};

/// Everything the core reconciliation engine needs from the cluster,
/// narrowed to the handful of operations the mapper, pod cache, update
/// worker, and reconciler actually call. Kept as a trait (rather than a
/// concrete `kube::Client` wrapper used directly) so tests can drive the
/// whole engine against an in-memory fake with no cluster available.
///
/// Uses native async-fn-in-trait; callers take `impl Orchestrator` or are
/// generic over `O: Orchestrator`, never `dyn Orchestrator` — this crate
/// has exactly one production implementation per process, so static
/// dispatch costs nothing and keeps call sites simple.
pub trait Orchestrator: Clone + Send + Sync + 'static {
    /// Webhook configurations carrying the `app=sidecar-injector` marker
    /// label, each with its revision label and namespace/object selectors.
    fn list_webhook_configs(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WebhookConfigInfo>>> + Send;

    fn list_namespaces(&self) -> impl std::future::Future<Output = Result<Vec<NamespaceInfo>>> + Send;

    fn get_namespace(
        &self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<NamespaceInfo>>> + Send;

    fn list_replicasets(
        &self,
        namespace: &str,
    ) -> impl std::future::Future<Output = Result<Vec<ReplicaSetInfo>>> + Send;

    fn get_replicaset(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<ReplicaSetInfo>>> + Send;

    fn list_pods(
        &self,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> impl std::future::Future<Output = Result<Vec<PodInfo>>> + Send;

    /// The version the injection webhook currently installs for `revision`,
    /// read from the `expected-<revision>` configmap.
    fn get_expected_version(
        &self,
        control_plane_namespace: &str,
        revision: &str,
    ) -> impl std::future::Future<Output = Result<Option<String>>> + Send;

    fn evict_pod(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    fn patch_pod_label(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    fn record_pod_event(
        &self,
        namespace: &str,
        pod_name: &str,
        pod_uid: &str,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    fn patch_status(
        &self,
        name: &str,
        status: &DataPlaneControlStatus,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    fn list_desired_states(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<DataPlaneControl>>> + Send;
}

/* ============================= DOMAIN SNAPSHOTS ============================= */

/// Flattened view of a `Pod` carrying only what the mapper / pod cache /
/// eligibility predicates need. Decoupled from `k8s_openapi::api::core::v1::Pod`
/// so the fake orchestrator used in tests doesn't need to construct full
/// API objects.
#[derive(Debug, Clone)]
pub struct PodInfo {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub container_images: Vec<String>,
    pub host_network: bool,
    pub owner_replicaset: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReplicaSetInfo {
    pub namespace: String,
    pub name: String,
    pub replicas: i32,
    pub selector: LabelSelector,
    pub pod_template_labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct NamespaceInfo {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct WebhookConfigInfo {
    pub name: String,
    pub revision: Option<String>,
    pub namespace_selector: LabelSelector,
    pub object_selector: LabelSelector,
}

/* ============================= KUBE IMPLEMENTATION ============================= */

const SIDECAR_INJECTOR_REPORTER: &str = "mdp-controller";

/// Production `Orchestrator` backed by a real `kube::Client`.
#[derive(Clone)]
pub struct KubeOrchestrator {
    client: Client,
}

impl KubeOrchestrator {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Flattens a raw `Pod` into `PodInfo`. Exposed for the pod watcher, which
/// needs the same conversion the `KubeOrchestrator::list_pods` path uses.
pub fn pod_to_info(pod: Pod) -> PodInfo {
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();
    let name = pod.name_any();
    let uid = pod.uid().unwrap_or_default();
    let labels = pod.metadata.labels.clone().unwrap_or_default().into_iter().collect();
    let annotations = pod
        .metadata
        .annotations
        .clone()
        .unwrap_or_default()
        .into_iter()
        .collect();

    let container_images = pod
        .spec
        .as_ref()
        .map(|spec| spec.containers.iter().filter_map(|c| c.image.clone()).collect())
        .unwrap_or_default();

    let host_network = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.host_network)
        .unwrap_or(false);

    let owner_replicaset = pod.metadata.owner_references.as_ref().and_then(|owners| {
        owners
            .iter()
            .find(|o| o.kind == "ReplicaSet")
            .map(|o| o.name.clone())
    });

    PodInfo {
        namespace,
        name,
        uid,
        labels,
        annotations,
        container_images,
        host_network,
        owner_replicaset,
    }
}

/// Flattens a raw `Namespace` into `NamespaceInfo`. Exposed for the
/// namespace watcher, same reasoning as `pod_to_info`.
pub fn namespace_to_info(ns: Namespace) -> NamespaceInfo {
    NamespaceInfo {
        name: ns.name_any(),
        labels: ns.metadata.labels.unwrap_or_default().into_iter().collect(),
        annotations: ns.metadata.annotations.unwrap_or_default().into_iter().collect(),
    }
}

impl Orchestrator for KubeOrchestrator {
    async fn list_webhook_configs(&self) -> Result<Vec<WebhookConfigInfo>> {
        let api: Api<MutatingWebhookConfiguration> = Api::all(self.client.clone());
        let lp = ListParams::default().labels(&format!(
            "{}={}",
            crate::crd::WEBHOOK_MARKER_LABEL_KEY,
            crate::crd::WEBHOOK_MARKER_LABEL_VALUE
        ));
        let list = api.list(&lp).await.map_err(MdpError::TransientOrchestrator)?;

        let mut out = Vec::new();
        for config in list {
            let name = config.name_any();
            for webhook in config.webhooks.unwrap_or_default() {
                let revision = webhook
                    .client_config
                    .service
                    .as_ref()
                    .and_then(|_| config.metadata.labels.as_ref())
                    .and_then(|labels| labels.get(crate::crd::REVISION_LABEL).cloned());

                out.push(WebhookConfigInfo {
                    name: name.clone(),
                    revision,
                    namespace_selector: webhook.namespace_selector.unwrap_or_default(),
                    object_selector: webhook.object_selector.unwrap_or_default(),
                });
            }
        }
        Ok(out)
    }

    async fn list_namespaces(&self) -> Result<Vec<NamespaceInfo>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(MdpError::TransientOrchestrator)?;
        Ok(list.into_iter().map(namespace_to_info).collect())
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<NamespaceInfo>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api
            .get_opt(name)
            .await
            .map_err(MdpError::TransientOrchestrator)?
            .map(namespace_to_info))
    }

    async fn list_replicasets(&self, namespace: &str) -> Result<Vec<ReplicaSetInfo>> {
        let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(MdpError::TransientOrchestrator)?;
        Ok(list
            .into_iter()
            .filter_map(|rs| {
                let spec = rs.spec.clone()?;
                Some(ReplicaSetInfo {
                    namespace: rs.metadata.namespace.clone().unwrap_or_default(),
                    name: rs.name_any(),
                    replicas: spec.replicas.unwrap_or(0),
                    selector: spec.selector,
                    pod_template_labels: spec
                        .template
                        .and_then(|t| t.metadata)
                        .and_then(|m| m.labels)
                        .unwrap_or_default()
                        .into_iter()
                        .collect(),
                })
            })
            .collect())
    }

    async fn get_replicaset(&self, namespace: &str, name: &str) -> Result<Option<ReplicaSetInfo>> {
        let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        let rs = match api.get_opt(name).await.map_err(MdpError::TransientOrchestrator)? {
            Some(rs) => rs,
            None => return Ok(None),
        };
        let Some(spec) = rs.spec.clone() else {
            return Ok(None);
        };
        Ok(Some(ReplicaSetInfo {
            namespace: rs.metadata.namespace.clone().unwrap_or_default(),
            name: rs.name_any(),
            replicas: spec.replicas.unwrap_or(0),
            selector: spec.selector,
            pod_template_labels: spec
                .template
                .and_then(|t| t.metadata)
                .and_then(|m| m.labels)
                .unwrap_or_default()
                .into_iter()
                .collect(),
        }))
    }

    async fn list_pods(&self, namespace: &str, label_selector: Option<&str>) -> Result<Vec<PodInfo>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut lp = ListParams::default();
        if let Some(sel) = label_selector {
            lp = lp.labels(sel);
        }
        let list = api.list(&lp).await.map_err(MdpError::TransientOrchestrator)?;
        Ok(list.into_iter().map(pod_to_info).collect())
    }

    async fn get_expected_version(
        &self,
        control_plane_namespace: &str,
        revision: &str,
    ) -> Result<Option<String>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), control_plane_namespace);
        let name = format!("expected-{revision}");
        match api.get_opt(&name).await.map_err(MdpError::TransientOrchestrator)? {
            Some(cm) => Ok(cm.data.and_then(|d| d.get("version").cloned())),
            None => Ok(None),
        }
    }

    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.evict(name, &Default::default()).await.map_err(|e| {
            if MdpError::is_too_many_requests(&e) {
                MdpError::TooManyRequests {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                }
            } else {
                MdpError::TransientOrchestrator(e)
            }
        })?;
        Ok(())
    }

    async fn patch_pod_label(&self, namespace: &str, name: &str, key: &str, value: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "metadata": { "labels": { key: value } } });
        api.patch(name, &PatchParams::apply(SIDECAR_INJECTOR_REPORTER), &Patch::Merge(patch))
            .await
            .map_err(MdpError::TransientOrchestrator)?;
        Ok(())
    }

    async fn record_pod_event(
        &self,
        namespace: &str,
        pod_name: &str,
        pod_uid: &str,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        let reference = ObjectReference {
            api_version: Some("v1".to_string()),
            kind: Some("Pod".to_string()),
            namespace: Some(namespace.to_string()),
            name: Some(pod_name.to_string()),
            uid: Some(pod_uid.to_string()),
            ..Default::default()
        };

        let recorder = Recorder::new(
            self.client.clone(),
            Reporter::from(SIDECAR_INJECTOR_REPORTER.to_string()),
        );

        recorder
            .publish(
                &RecordedEvent {
                    type_: match event_type {
                        EventType::Normal => RecordedEventType::Normal,
                        EventType::Warning => RecordedEventType::Warning,
                    },
                    reason: reason.to_string(),
                    note: Some(message.to_string()),
                    action: reason.to_string(),
                    secondary: None,
                },
                &reference,
            )
            .await
            .map_err(MdpError::TransientOrchestrator)?;
        Ok(())
    }

    async fn patch_status(&self, name: &str, status: &DataPlaneControlStatus) -> Result<()> {
        let api: Api<DataPlaneControl> = Api::all(self.client.clone());
        let patch = json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(MdpError::TransientOrchestrator)?;
        Ok(())
    }

    async fn list_desired_states(&self) -> Result<Vec<DataPlaneControl>> {
        let api: Api<DataPlaneControl> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(MdpError::TransientOrchestrator)?;
        Ok(list.items)
    }
}
