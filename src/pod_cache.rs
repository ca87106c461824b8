use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::crd::{injection_requested, is_reserved_namespace, Enablement, PodWorkItem};
use crate::enablement::EnablementCache;
use crate::error::Result;
use crate::mapper::{object_enablement, Mapper};
use crate::orchestrator::{Orchestrator, PodInfo};

const SIDECAR_IMAGE_PREFIX: &str = "docker.io/istio/proxyv2:";
const REBUILD_INTERVAL: Duration = Duration::from_secs(5 * 60);

type VersionMap = HashMap<String, HashSet<String>>;
type NamespaceMap = HashMap<String, VersionMap>;
type CacheState = HashMap<String, NamespaceMap>;

/// Authoritative in-memory index of eligible, enabled pods, keyed by
/// (revision, namespace, version). Guarded by a reader-writer lock; the
/// dirty flag has its own lock and is never held across an await.
pub struct PodCache<O: Orchestrator> {
    state: RwLock<CacheState>,
    dirty: Mutex<bool>,
    mapper: Arc<Mapper<O>>,
    enablement: Arc<EnablementCache>,
}

impl<O: Orchestrator> PodCache<O> {
    pub fn new(mapper: Arc<Mapper<O>>, enablement: Arc<EnablementCache>) -> Self {
        Self {
            state: RwLock::new(HashMap::new()),
            dirty: Mutex::new(false),
            mapper,
            enablement,
        }
    }

    pub fn mark_dirty(&self) {
        *self.dirty.lock().expect("pod cache dirty-flag mutex poisoned") = true;
    }

    fn is_dirty(&self) -> bool {
        *self.dirty.lock().expect("pod cache dirty-flag mutex poisoned")
    }

    fn clear_dirty(&self) {
        *self.dirty.lock().expect("pod cache dirty-flag mutex poisoned") = false;
    }

    /// Enablement precedence: pod annotation, namespace annotation,
    /// revision enablement — first non-missing value wins, `missing`
    /// throughout resolves to `false`.
    async fn is_enabled(&self, pod: &PodInfo, revision: &str) -> bool {
        let pod_enablement = object_enablement(&pod.annotations);
        if let Enablement::Explicit(v) = pod_enablement {
            return v;
        }

        let ns_enablement = self.mapper.namespace_enablement(&pod.namespace).await;
        if let Enablement::Explicit(v) = ns_enablement {
            return v;
        }

        self.enablement.get(revision).as_bool()
    }

    async fn is_eligible(&self, pod: &PodInfo, revision: &str) -> bool {
        if pod.owner_replicaset.is_none() {
            return false;
        }
        if !crate::crd::has_sidecar_container(&pod.container_images, SIDECAR_IMAGE_PREFIX) {
            return false;
        }
        if !injection_requested(&pod.annotations) {
            return false;
        }
        if pod.host_network {
            return false;
        }
        if is_reserved_namespace(&pod.namespace) {
            return false;
        }
        self.is_enabled(pod, revision).await
    }

    /// Resolves `pod`'s revision, checks eligibility, and inserts it into
    /// the appropriate cell. Returns the resolved revision, or `""` when
    /// the pod has no revision or is not eligible. On a transient Mapper
    /// failure, marks the cache dirty and returns `""`.
    pub async fn add_pod(&self, pod: &PodInfo) -> String {
        let revision = match self.mapper.revision_for_pod(pod).await {
            Ok(r) => r,
            Err(_) => {
                self.mark_dirty();
                return String::new();
            }
        };
        if revision.is_empty() {
            return String::new();
        }
        if !self.is_eligible(pod, &revision).await {
            return String::new();
        }

        let Some(version) = crate::crd::derive_proxy_version(&pod.container_images, SIDECAR_IMAGE_PREFIX) else {
            return String::new();
        };

        let mut state = self.state.write().expect("pod cache lock poisoned");
        state
            .entry(revision.clone())
            .or_default()
            .entry(pod.namespace.clone())
            .or_default()
            .entry(version)
            .or_default()
            .insert(pod.name.clone());

        revision
    }

    pub async fn remove_pod(&self, pod: &PodInfo) {
        let revision = match self.mapper.revision_for_pod(pod).await {
            Ok(r) => r,
            Err(_) => {
                self.mark_dirty();
                return;
            }
        };
        if revision.is_empty() {
            return;
        }
        self.remove_pod_by_name(&revision, &pod.namespace, None, &pod.name);
    }

    /// Removes `name` from the indicated (revision, namespace, version)
    /// cell. With `version = None`, removes it from every version cell
    /// under (revision, namespace). Prunes empty inner maps/sets.
    pub fn remove_pod_by_name(&self, revision: &str, namespace: &str, version: Option<&str>, name: &str) {
        let mut state = self.state.write().expect("pod cache lock poisoned");
        let Some(namespaces) = state.get_mut(revision) else {
            return;
        };
        let Some(versions) = namespaces.get_mut(namespace) else {
            return;
        };

        match version {
            Some(v) => {
                if let Some(names) = versions.get_mut(v) {
                    names.remove(name);
                    if names.is_empty() {
                        versions.remove(v);
                    }
                }
            }
            None => {
                for names in versions.values_mut() {
                    names.remove(name);
                }
                versions.retain(|_, names| !names.is_empty());
            }
        }

        if versions.is_empty() {
            namespaces.remove(namespace);
        }
        if namespaces.is_empty() {
            state.remove(revision);
        }
    }

    /// Drops every entry for (`old_revision`, `namespace`), re-lists every
    /// pod in the namespace, and re-adds each. Returns the distinct
    /// revisions touched by the re-add. If the namespace no longer
    /// exists, the list returns empty and the cache simply ends up
    /// pruned for that cell.
    pub async fn recalculate_namespace_members(&self, namespace: &str, old_revision: &str) -> Result<Vec<String>> {
        {
            let mut state = self.state.write().expect("pod cache lock poisoned");
            if let Some(namespaces) = state.get_mut(old_revision) {
                namespaces.remove(namespace);
                if namespaces.is_empty() {
                    state.remove(old_revision);
                }
            }
        }

        let pods = self.mapper_list_pods(namespace).await?;
        let mut touched = HashSet::new();
        for pod in &pods {
            let revision = self.add_pod(pod).await;
            if !revision.is_empty() {
                touched.insert(revision);
            }
        }
        Ok(touched.into_iter().collect())
    }

    async fn mapper_list_pods(&self, namespace: &str) -> Result<Vec<PodInfo>> {
        self.mapper.orchestrator_list_pods(namespace).await
    }

    /// Namespace-watch entry point: a namespace-level annotation or label
    /// change can flip eligibility for pods under any revision, and the
    /// cache has no reverse index from namespace to the revisions it
    /// previously held entries under. Re-runs `recalculate_namespace_members`
    /// once per known revision instead, which is a no-op for any revision
    /// that held nothing for this namespace.
    pub async fn recalculate_namespace_across_known_revisions(&self, namespace: &str) -> Result<()> {
        let revisions = self.mapper.known_revisions().await?;
        for revision in revisions {
            self.recalculate_namespace_members(namespace, &revision).await?;
        }
        Ok(())
    }

    /// `(version -> count, total)` across every namespace in `revision`.
    pub fn proxy_version_count(&self, revision: &str) -> (HashMap<String, usize>, usize) {
        let state = self.state.read().expect("pod cache lock poisoned");
        let mut counts: HashMap<String, usize> = HashMap::new();
        let mut total = 0;

        if let Some(namespaces) = state.get(revision) {
            for versions in namespaces.values() {
                for (version, names) in versions {
                    *counts.entry(version.clone()).or_insert(0) += names.len();
                    total += names.len();
                }
            }
        }

        (counts, total)
    }

    /// Every cached pod in `revision` whose version differs from `version`,
    /// each carrying its current version as `from_version`.
    pub fn pods_in_revision_out_of_version(&self, revision: &str, version: &str) -> HashSet<PodWorkItem> {
        let state = self.state.read().expect("pod cache lock poisoned");
        let mut out = HashSet::new();

        if let Some(namespaces) = state.get(revision) {
            for (namespace, versions) in namespaces {
                for (observed_version, names) in versions {
                    if observed_version == version {
                        continue;
                    }
                    for name in names {
                        out.insert(PodWorkItem::new(namespace.clone(), name.clone(), observed_version.clone()));
                    }
                }
            }
        }

        out
    }

    /// Spawns the background rebuild task: every `REBUILD_INTERVAL`, if
    /// dirty, rebuilds the whole index from `known_revisions` and
    /// `pods_from_revision` and atomically swaps it in. Any orchestrator
    /// error during rebuild leaves the dirty flag set and the old state
    /// untouched.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("pod_cache_rebuild_task_stopped");
                        return;
                    }
                    _ = tokio::time::sleep(REBUILD_INTERVAL) => {}
                }

                if !this.is_dirty() {
                    continue;
                }

                match this.rebuild().await {
                    Ok(()) => {
                        this.clear_dirty();
                        info!("pod_cache_rebuilt");
                    }
                    Err(err) => {
                        warn!(error = %err, "pod_cache_rebuild_failed");
                    }
                }
            }
        });
    }

    /// Lists every known revision and rebuilds the whole index from
    /// scratch. Exposed (rather than private) so the controller's startup
    /// path can perform one synchronous build before gating readiness on
    /// it, instead of waiting for the background task's first tick.
    pub async fn rebuild(&self) -> Result<()> {
        let revisions = self.mapper.known_revisions().await?;
        let mut fresh: CacheState = HashMap::new();

        for revision in revisions {
            let pods = match self.mapper.pods_from_revision(&revision).await {
                Ok(pods) => pods,
                Err(_) => continue,
            };
            for pod in &pods {
                if !self.is_eligible(pod, &revision).await {
                    continue;
                }
                let Some(version) = crate::crd::derive_proxy_version(&pod.container_images, SIDECAR_IMAGE_PREFIX)
                else {
                    continue;
                };
                fresh
                    .entry(revision.clone())
                    .or_default()
                    .entry(pod.namespace.clone())
                    .or_default()
                    .entry(version)
                    .or_default()
                    .insert(pod.name.clone());
            }
        }

        *self.state.write().expect("pod cache lock poisoned") = fresh;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{NamespaceInfo, ReplicaSetInfo, WebhookConfigInfo};
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;

    #[derive(Default, Clone)]
    struct FakeOrchestrator {
        pods: Arc<StdMutex<HashMap<String, Vec<PodInfo>>>>,
        replicasets: Arc<StdMutex<HashMap<(String, String), ReplicaSetInfo>>>,
        namespaces: Arc<StdMutex<HashMap<String, NamespaceInfo>>>,
        webhooks: Arc<StdMutex<Vec<WebhookConfigInfo>>>,
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
        async fn get_expected_version(&self, _ns: &str, _revision: &str) -> Result<Option<String>> {
            Ok(None)
        }
        async fn evict_pod(&self, _namespace: &str, _name: &str) -> Result<()> {
            Ok(())
        }
        async fn patch_pod_label(&self, _namespace: &str, _name: &str, _key: &str, _value: &str) -> Result<()> {
            Ok(())
        }
        async fn record_pod_event(
            &self,
            _namespace: &str,
            _pod_name: &str,
            _pod_uid: &str,
            _event_type: crate::crd::EventType,
            _reason: &str,
            _message: &str,
        ) -> Result<()> {
            Ok(())
        }
        async fn patch_status(&self, _name: &str, _status: &crate::crd::DataPlaneControlStatus) -> Result<()> {
            Ok(())
        }
        async fn list_desired_states(&self) -> Result<Vec<crate::crd::DataPlaneControl>> {
            Ok(vec![])
        }
    }

    fn eligible_pod(namespace: &str, name: &str, version: &str) -> PodInfo {
        PodInfo {
            namespace: namespace.to_string(),
            name: name.to_string(),
            uid: format!("{name}-uid"),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            container_images: vec![format!("{SIDECAR_IMAGE_PREFIX}{version}")],
            host_network: false,
            owner_replicaset: Some("rs-1".to_string()),
        }
    }

    fn setup() -> (Arc<Mapper<FakeOrchestrator>>, Arc<EnablementCache>, FakeOrchestrator) {
        let orch = FakeOrchestrator::default();
        orch.webhooks.lock().unwrap().push(WebhookConfigInfo {
            name: "sidecar-injector".to_string(),
            revision: Some("rev-a".to_string()),
            namespace_selector: Default::default(),
            object_selector: Default::default(),
        });
        orch.namespaces.lock().unwrap().insert(
            "default".to_string(),
            NamespaceInfo {
                name: "default".to_string(),
                labels: BTreeMap::new(),
                annotations: BTreeMap::new(),
            },
        );
        orch.replicasets.lock().unwrap().insert(
            ("default".to_string(), "rs-1".to_string()),
            ReplicaSetInfo {
                namespace: "default".to_string(),
                name: "rs-1".to_string(),
                replicas: 1,
                selector: Default::default(),
                pod_template_labels: BTreeMap::new(),
            },
        );

        let mapper = Arc::new(Mapper::new(orch.clone()));
        let enablement = Arc::new(EnablementCache::new());
        enablement.set("rev-a", Enablement::Explicit(true));
        (mapper, enablement, orch)
    }

    #[tokio::test]
    async fn test_add_pod_then_remove_restores_cache() {
        let (mapper, enablement, orch) = setup();
        let cache = PodCache::new(mapper, enablement);
        let pod = eligible_pod("default", "pod-1", "1.11");
        orch.pods.lock().unwrap().insert("default".to_string(), vec![pod.clone()]);

        let revision = cache.add_pod(&pod).await;
        assert_eq!(revision, "rev-a");
        let (_, total) = cache.proxy_version_count("rev-a");
        assert_eq!(total, 1);

        cache.remove_pod(&pod).await;
        let (_, total) = cache.proxy_version_count("rev-a");
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn test_pods_in_revision_out_of_version() {
        let (mapper, enablement, orch) = setup();
        let cache = PodCache::new(mapper, enablement);
        let pod = eligible_pod("default", "pod-1", "1.11");
        orch.pods.lock().unwrap().insert("default".to_string(), vec![pod.clone()]);
        cache.add_pod(&pod).await;

        let out_of_version = cache.pods_in_revision_out_of_version("rev-a", "1.12");
        assert_eq!(out_of_version.len(), 1);
        assert_eq!(out_of_version.iter().next().unwrap().from_version, "1.11");
    }

    #[tokio::test]
    async fn test_host_network_pod_ineligible() {
        let (mapper, enablement, orch) = setup();
        let cache = PodCache::new(mapper, enablement);
        let mut pod = eligible_pod("default", "pod-1", "1.11");
        pod.host_network = true;
        orch.pods.lock().unwrap().insert("default".to_string(), vec![pod.clone()]);

        let revision = cache.add_pod(&pod).await;
        assert_eq!(revision, "");
    }
}
