//! Shared in-memory `Orchestrator` double for integration tests. Mirrors the
//! production `KubeOrchestrator` surface closely enough that the reconciler,
//! mapper, and pod cache can run their real logic against it with no cluster.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use mdp_controller::crd::{DataPlaneControl, DataPlaneControlSpec, DataPlaneControlStatus, EventType};
use mdp_controller::error::{MdpError, Result};
use mdp_controller::orchestrator::{NamespaceInfo, Orchestrator, PodInfo, ReplicaSetInfo, WebhookConfigInfo};

#[derive(Clone, Default)]
pub struct FakeOrchestrator {
    pub webhooks: Arc<Mutex<Vec<WebhookConfigInfo>>>,
    pub namespaces: Arc<Mutex<HashMap<String, NamespaceInfo>>>,
    pub replicasets: Arc<Mutex<HashMap<(String, String), ReplicaSetInfo>>>,
    pub pods: Arc<Mutex<HashMap<String, Vec<PodInfo>>>>,
    pub expected_versions: Arc<Mutex<HashMap<String, String>>>,
    pub desired_states: Arc<Mutex<Vec<DataPlaneControl>>>,
    pub evicted: Arc<Mutex<Vec<(String, String)>>>,
    pub reject_evictions_for: Arc<Mutex<HashSet<(String, String)>>>,
    pub patched_status: Arc<Mutex<Vec<(String, DataPlaneControlStatus)>>>,
    pub events: Arc<Mutex<Vec<(String, String)>>>,
    /// When set, a successful `evict_pod` rewrites the evicted pod's
    /// container image to this version in place, standing in for the
    /// real cluster recreating the pod under its replica set at the
    /// target version.
    pub eviction_replacement_version: Arc<Mutex<Option<String>>>,
}

impl FakeOrchestrator {
    pub fn add_webhook(&self, revision: &str) {
        self.webhooks.lock().unwrap().push(WebhookConfigInfo {
            name: format!("{revision}-injector"),
            revision: Some(revision.to_string()),
            namespace_selector: Default::default(),
            object_selector: Default::default(),
        });
    }

    pub fn add_namespace(&self, name: &str) {
        self.namespaces.lock().unwrap().insert(
            name.to_string(),
            NamespaceInfo {
                name: name.to_string(),
                labels: BTreeMap::new(),
                annotations: BTreeMap::new(),
            },
        );
    }

    pub fn add_replicaset(&self, namespace: &str, name: &str, replicas: i32) {
        self.replicasets.lock().unwrap().insert(
            (namespace.to_string(), name.to_string()),
            ReplicaSetInfo {
                namespace: namespace.to_string(),
                name: name.to_string(),
                replicas,
                selector: Default::default(),
                pod_template_labels: BTreeMap::new(),
            },
        );
    }

    pub fn add_pod(&self, pod: PodInfo) {
        self.pods.lock().unwrap().entry(pod.namespace.clone()).or_default().push(pod);
    }

    pub fn set_expected_version(&self, revision: &str, version: &str) {
        self.expected_versions
            .lock()
            .unwrap()
            .insert(revision.to_string(), version.to_string());
    }

    pub fn add_desired_state(&self, record: DataPlaneControl) {
        self.desired_states.lock().unwrap().push(record);
    }

    /// Replaces the existing record for this revision, if any, rather than
    /// appending a duplicate `desired_record_for` would never see past the
    /// first (oldest) match.
    pub fn update_desired_state(&self, record: DataPlaneControl) {
        let mut states = self.desired_states.lock().unwrap();
        if let Some(existing) = states.iter_mut().find(|r| r.spec.revision == record.spec.revision) {
            *existing = record;
        } else {
            states.push(record);
        }
    }

    pub fn reject_eviction(&self, namespace: &str, name: &str) {
        self.reject_evictions_for
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name.to_string()));
    }

    pub fn evicted_count(&self) -> usize {
        self.evicted.lock().unwrap().len()
    }

    pub fn set_eviction_replacement_version(&self, version: &str) {
        *self.eviction_replacement_version.lock().unwrap() = Some(version.to_string());
    }

    pub fn latest_status(&self, name: &str) -> Option<DataPlaneControlStatus> {
        self.patched_status
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s.clone())
    }
}

impl Orchestrator for FakeOrchestrator {
    async fn list_webhook_configs(&self) -> Result<Vec<WebhookConfigInfo>> {
        Ok(self.webhooks.lock().unwrap().clone())
    }

    async fn list_namespaces(&self) -> Result<Vec<NamespaceInfo>> {
        Ok(self.namespaces.lock().unwrap().values().cloned().collect())
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<NamespaceInfo>> {
        Ok(self.namespaces.lock().unwrap().get(name).cloned())
    }

    async fn list_replicasets(&self, namespace: &str) -> Result<Vec<ReplicaSetInfo>> {
        Ok(self
            .replicasets
            .lock()
            .unwrap()
            .values()
            .filter(|rs| rs.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn get_replicaset(&self, namespace: &str, name: &str) -> Result<Option<ReplicaSetInfo>> {
        Ok(self
            .replicasets
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list_pods(&self, namespace: &str, _label_selector: Option<&str>) -> Result<Vec<PodInfo>> {
        Ok(self.pods.lock().unwrap().get(namespace).cloned().unwrap_or_default())
    }

    async fn get_expected_version(&self, _control_plane_namespace: &str, revision: &str) -> Result<Option<String>> {
        Ok(self.expected_versions.lock().unwrap().get(revision).cloned())
    }

    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<()> {
        if self
            .reject_evictions_for
            .lock()
            .unwrap()
            .contains(&(namespace.to_string(), name.to_string()))
        {
            return Err(MdpError::TooManyRequests {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }
        self.evicted.lock().unwrap().push((namespace.to_string(), name.to_string()));

        if let Some(version) = self.eviction_replacement_version.lock().unwrap().clone() {
            if let Some(pods) = self.pods.lock().unwrap().get_mut(namespace) {
                if let Some(pod) = pods.iter_mut().find(|p| p.name == name) {
                    pod.container_images = vec![format!("docker.io/istio/proxyv2:{version}")];
                }
            }
        }

        Ok(())
    }

    async fn patch_pod_label(&self, _namespace: &str, _name: &str, _key: &str, _value: &str) -> Result<()> {
        Ok(())
    }

    async fn record_pod_event(
        &self,
        namespace: &str,
        pod_name: &str,
        _pod_uid: &str,
        _event_type: EventType,
        reason: &str,
        _message: &str,
    ) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push((format!("{namespace}/{pod_name}"), reason.to_string()));
        Ok(())
    }

    async fn patch_status(&self, name: &str, status: &DataPlaneControlStatus) -> Result<()> {
        self.patched_status.lock().unwrap().push((name.to_string(), status.clone()));
        Ok(())
    }

    async fn list_desired_states(&self) -> Result<Vec<DataPlaneControl>> {
        Ok(self.desired_states.lock().unwrap().clone())
    }
}

/// Pod annotation precedence is checked before namespace or revision
/// enablement, so tests opt every pod in directly rather than reaching
/// into the (crate-private) enablement cache.
pub fn make_pod(namespace: &str, name: &str, rs_name: &str, version: &str) -> PodInfo {
    let mut annotations = BTreeMap::new();
    annotations.insert("managed-data-plane/enabled".to_string(), r#"{"managed":"true"}"#.to_string());

    PodInfo {
        namespace: namespace.to_string(),
        name: name.to_string(),
        uid: format!("{name}-uid"),
        labels: BTreeMap::new(),
        annotations,
        container_images: vec![format!("docker.io/istio/proxyv2:{version}")],
        host_network: false,
        owner_replicaset: Some(rs_name.to_string()),
    }
}

pub fn make_record(revision: &str, proxy_version: &str, target_basis_points: u32, generation: i64) -> DataPlaneControl {
    let mut record = DataPlaneControl::new(
        revision,
        DataPlaneControlSpec {
            revision: revision.to_string(),
            proxy_version: proxy_version.to_string(),
            proxy_target_basis_points: target_basis_points,
        },
    );
    record.metadata.uid = Some(format!("{revision}-uid"));
    record.metadata.generation = Some(generation);
    record
}
