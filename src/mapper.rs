use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};

use crate::crd::{injection_requested, parse_enablement_annotation, DataPlaneControl, Enablement};
use crate::error::{MdpError, Result};
use crate::orchestrator::{Orchestrator, PodInfo};
use crate::pod_cache::PodCache;
use crate::selector::SelectorCache;

const SIDECAR_IMAGE_PREFIX: &str = "docker.io/istio/proxyv2:";

/// Resolves *pod ↔ revision* and *revision ↔ desired-state record*
/// against the orchestrator. Stateless apart from the selector cache and
/// the set of revisions a durable `NoWebhookForRevision` error has been
/// recorded against.
///
/// Holds a late-bound back-reference to the pod cache (wired in via
/// `set_pod_cache`, same break-the-cycle shape as `RevisionHandler`) so a
/// transient orchestrator failure in any lookup here can mark the cache
/// dirty, matching the cache-invalidation contract every Mapper method
/// carries: a failed lookup leaves the cache no worse than stale, and
/// the next rebuild corrects it.
pub struct Mapper<O: Orchestrator> {
    orchestrator: O,
    selectors: SelectorCache,
    durable_errors: Mutex<HashSet<String>>,
    pod_cache: RwLock<Option<Arc<PodCache<O>>>>,
}

impl<O: Orchestrator> Mapper<O> {
    pub fn new(orchestrator: O) -> Self {
        Self {
            orchestrator,
            selectors: SelectorCache::new(),
            durable_errors: Mutex::new(HashSet::new()),
            pod_cache: RwLock::new(None),
        }
    }

    pub fn set_pod_cache(&self, pod_cache: Arc<PodCache<O>>) {
        *self.pod_cache.write().expect("pod cache wiring lock poisoned") = Some(pod_cache);
    }

    fn mark_cache_dirty(&self) {
        if let Some(pod_cache) = self.pod_cache.read().expect("pod cache wiring lock poisoned").as_ref() {
            pod_cache.mark_dirty();
        }
    }

    /// Runs a single orchestrator call, marking the pod cache dirty on
    /// any `Err` before propagating it.
    async fn orch_call<T>(&self, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        let result = fut.await;
        if result.is_err() {
            self.mark_cache_dirty();
        }
        result
    }

    /// True once `pods_from_revision` has recorded a durable
    /// `NoWebhookForRevision` error for this revision.
    pub fn has_durable_error(&self, revision: &str) -> bool {
        self.durable_errors
            .lock()
            .expect("mapper durable-error mutex poisoned")
            .contains(revision)
    }

    pub fn clear_durable_error(&self, revision: &str) {
        self.durable_errors
            .lock()
            .expect("mapper durable-error mutex poisoned")
            .remove(revision);
    }

    /// Identifies the revision that would re-inject `pod` if it were
    /// recreated today. Empty string when the pod isn't owned by a
    /// ReplicaSet, carries no sidecar to re-inject, or has opted out of
    /// injection via `sidecar.istio.io/inject`.
    pub async fn revision_for_pod(&self, pod: &PodInfo) -> Result<String> {
        if pod.owner_replicaset.is_none() {
            return Ok(String::new());
        }
        if !crate::crd::has_sidecar_container(&pod.container_images, SIDECAR_IMAGE_PREFIX) {
            return Ok(String::new());
        }
        if !injection_requested(&pod.annotations) {
            return Ok(String::new());
        }

        let Some(rs_name) = pod.owner_replicaset.as_ref() else {
            return Ok(String::new());
        };
        let Some(rs) = self.orch_call(self.orchestrator.get_replicaset(&pod.namespace, rs_name)).await? else {
            return Ok(String::new());
        };
        let Some(ns) = self.orch_call(self.orchestrator.get_namespace(&pod.namespace)).await? else {
            return Ok(String::new());
        };

        let webhooks = self.orch_call(self.orchestrator.list_webhook_configs()).await?;
        for webhook in &webhooks {
            let Some(revision) = &webhook.revision else { continue };
            let ns_match = self.selectors.matches(&webhook.namespace_selector, &ns.labels);
            let obj_match = self
                .selectors
                .matches(&webhook.object_selector, &rs.pod_template_labels);
            if ns_match && obj_match {
                return Ok(revision.clone());
            }
        }

        Ok(String::new())
    }

    /// Enumerates all pods whose ReplicaSet labels would be matched by any
    /// webhook carrying `revision`. Records a durable error when no
    /// webhook carries the revision at all.
    pub async fn pods_from_revision(&self, revision: &str) -> Result<Vec<PodInfo>> {
        let webhooks = self.orch_call(self.orchestrator.list_webhook_configs()).await?;
        let matching: Vec<_> = webhooks.iter().filter(|w| w.revision.as_deref() == Some(revision)).collect();

        if matching.is_empty() {
            self.durable_errors
                .lock()
                .expect("mapper durable-error mutex poisoned")
                .insert(revision.to_string());
            return Err(MdpError::NoWebhookForRevision {
                revision: revision.to_string(),
            });
        }
        self.clear_durable_error(revision);

        let namespaces = self.orch_call(self.orchestrator.list_namespaces()).await?;
        let mut pods = Vec::new();

        for webhook in &matching {
            for ns in &namespaces {
                if !self.selectors.matches(&webhook.namespace_selector, &ns.labels) {
                    continue;
                }
                let replicasets = self.orch_call(self.orchestrator.list_replicasets(&ns.name)).await?;
                for rs in replicasets.iter().filter(|rs| rs.replicas >= 1) {
                    if !self.selectors.matches(&webhook.object_selector, &rs.pod_template_labels) {
                        continue;
                    }
                    let selector_str = rs
                        .pod_template_labels
                        .iter()
                        .map(|(k, v)| format!("{k}={v}"))
                        .collect::<Vec<_>>()
                        .join(",");
                    let ns_pods = self
                        .orch_call(
                            self.orchestrator
                                .list_pods(&ns.name, (!selector_str.is_empty()).then_some(selector_str.as_str())),
                        )
                        .await?;
                    pods.extend(ns_pods);
                }
            }
        }

        Ok(pods)
    }

    pub async fn desired_record_for(&self, revision: &str) -> Result<Option<DataPlaneControl>> {
        let records = self.orch_call(self.orchestrator.list_desired_states()).await?;
        Ok(records.into_iter().find(|r| r.spec.revision == revision))
    }

    pub fn revision_for(record: &DataPlaneControl) -> String {
        record.spec.revision.clone()
    }

    pub async fn namespace_enablement(&self, namespace: &str) -> Enablement {
        let Ok(Some(ns)) = self.orch_call(self.orchestrator.get_namespace(namespace)).await else {
            return Enablement::Missing;
        };
        parse_enablement_annotation(&ns.annotations).unwrap_or(Enablement::Missing)
    }

    /// Direct passthrough to the orchestrator's pod listing, used by the
    /// pod cache when recalculating a namespace's members wholesale.
    pub async fn orchestrator_list_pods(&self, namespace: &str) -> Result<Vec<PodInfo>> {
        self.orch_call(self.orchestrator.list_pods(namespace, None)).await
    }

    /// Every distinct revision label carried by a marker-labeled webhook.
    pub async fn known_revisions(&self) -> Result<Vec<String>> {
        let webhooks = self.orch_call(self.orchestrator.list_webhook_configs()).await?;
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for w in webhooks {
            if let Some(rev) = w.revision {
                if seen.insert(rev.clone()) {
                    out.push(rev);
                }
            }
        }
        Ok(out)
    }
}

/// Tri-state enablement read directly off an object's own annotations
/// (pod, namespace, revision record — any object carrying the
/// `managed-data-plane/enabled` annotation), with no orchestrator call.
pub fn object_enablement(annotations: &std::collections::BTreeMap<String, String>) -> Enablement {
    parse_enablement_annotation(annotations).unwrap_or(Enablement::Missing)
}
