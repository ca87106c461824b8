use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::info;

use crate::crd::Enablement;
use crate::pod_cache::PodCache;
use crate::orchestrator::Orchestrator;

/// Thread-safe `revision -> tri-state enablement` map.
///
/// Fed by two handlers (see spec.md §4.2): the revision-record handler,
/// which also invalidates the pod cache since revision-level enablement
/// can flip many pods at once, and the enablement-configmap handler,
/// which does not invalidate the cache (rare events, already covered by
/// the revision-record path).
#[derive(Default)]
pub struct EnablementCache {
    state: RwLock<HashMap<String, Enablement>>,
}

impl EnablementCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, revision: &str) -> Enablement {
        self.state
            .read()
            .expect("enablement cache lock poisoned")
            .get(revision)
            .copied()
            .unwrap_or(Enablement::Missing)
    }

    pub(crate) fn set(&self, revision: &str, value: Enablement) {
        self.state
            .write()
            .expect("enablement cache lock poisoned")
            .insert(revision.to_string(), value);
    }
}

/// Handles revision-record and enablement-configmap events.
///
/// Holds a back-reference to the pod cache rather than owning it, to
/// break the cycle: the pod cache's eligibility check needs enablement
/// state this handler maintains, and this handler needs to mark the pod
/// cache dirty on revision-level changes. The reference is wired in after
/// both sides exist (`set_pod_cache`), and this handler never constructs
/// or owns the pod cache.
pub struct RevisionHandler<O: Orchestrator> {
    cache: Arc<EnablementCache>,
    pod_cache: RwLock<Option<Arc<PodCache<O>>>>,
}

impl<O: Orchestrator> RevisionHandler<O> {
    pub fn new(cache: Arc<EnablementCache>) -> Self {
        Self {
            cache,
            pod_cache: RwLock::new(None),
        }
    }

    pub fn set_pod_cache(&self, pod_cache: Arc<PodCache<O>>) {
        *self.pod_cache.write().expect("pod cache wiring lock poisoned") = Some(pod_cache);
    }

    /// Revision record created or updated: store its enablement and mark
    /// the pod cache dirty, since this can flip eligibility for many pods.
    pub fn on_revision_upsert(&self, revision: &str, enablement: Enablement) {
        self.cache.set(revision, enablement);
        info!(revision, enablement = enablement_debug(enablement), "revision_enablement_updated");
        if let Some(pod_cache) = self.pod_cache.read().expect("pod cache wiring lock poisoned").as_ref() {
            pod_cache.mark_dirty();
        }
    }

    /// Revision record deleted: reverts to `Missing`, also pod-cache dirty.
    pub fn on_revision_delete(&self, revision: &str) {
        self.cache.set(revision, Enablement::Missing);
        info!(revision, "revision_enablement_removed");
        if let Some(pod_cache) = self.pod_cache.read().expect("pod cache wiring lock poisoned").as_ref() {
            pod_cache.mark_dirty();
        }
    }

    /// Enablement configmap created/updated/deleted: same tri-state
    /// parsing, no pod-cache invalidation (subsumed by revision records).
    pub fn on_configmap_event(&self, revision: &str, enablement: Enablement) {
        self.cache.set(revision, enablement);
        info!(revision, enablement = enablement_debug(enablement), "configmap_enablement_updated");
    }
}

fn enablement_debug(e: Enablement) -> &'static str {
    match e {
        Enablement::Explicit(true) => "true",
        Enablement::Explicit(false) => "false",
        Enablement::Missing => "missing",
    }
}
