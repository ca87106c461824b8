use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::crd::{EventType, PodWorkItem, UPGRADE_FAILED_LABEL};
use crate::delay_queue::DelayQueue;
use crate::error::MdpError;
use crate::metrics::UPGRADED_PROXIES;
use crate::orchestrator::Orchestrator;
use crate::pod_cache::PodCache;
use crate::rate_limit::{ExponentialBackoff, MaxOf, RateLimiter, TokenBucket};

const BUFFER_CAP: usize = 1000;
const CONSECUTIVE_FAILURE_WARN_THRESHOLD: u32 = 6;
const BACKOFF_BASE: Duration = Duration::from_secs(30);
const BACKOFF_CAP: Duration = Duration::from_secs(60 * 60);

type ItemKey = (String, String);

type SuccessLimiter = MaxOf<Arc<TokenBucket>, Arc<TokenBucket>, PodWorkItem>;
type FailureLimiter = MaxOf<SuccessLimiter, Arc<ExponentialBackoff>, PodWorkItem>;

/// One per revision, created lazily by the reconciler. Owns a
/// rate-limited delay queue and the single-threaded processor loop that
/// drains it: evict, then react to success, disruption-budget rejection,
/// or any other failure.
pub struct UpdateWorker<O: Orchestrator> {
    revision: String,
    orchestrator: O,
    pod_cache: Arc<PodCache<O>>,
    queue: DelayQueue<PodWorkItem>,
    in_queue: Mutex<HashMap<ItemKey, PodWorkItem>>,
    failing_pods: Mutex<HashMap<ItemKey, PodWorkItem>>,
    expected_version: Mutex<String>,
    per_worker: Arc<TokenBucket>,
    backoff: Arc<ExponentialBackoff>,
    success_limiter: SuccessLimiter,
    failure_limiter: FailureLimiter,
    cancel: CancellationToken,
}

impl<O: Orchestrator> UpdateWorker<O> {
    pub fn new(
        revision: impl Into<String>,
        orchestrator: O,
        pod_cache: Arc<PodCache<O>>,
        cluster_cap: Arc<TokenBucket>,
        parent_cancel: &CancellationToken,
    ) -> Self {
        let per_worker = Arc::new(TokenBucket::new(1.0, 1.0));
        let backoff = Arc::new(ExponentialBackoff::new(BACKOFF_BASE, BACKOFF_CAP));
        let success_limiter = MaxOf::new(Arc::clone(&per_worker), Arc::clone(&cluster_cap));
        let failure_limiter = MaxOf::new(
            MaxOf::new(Arc::clone(&per_worker), Arc::clone(&cluster_cap)),
            Arc::clone(&backoff),
        );

        Self {
            revision: revision.into(),
            orchestrator,
            pod_cache,
            queue: DelayQueue::new(),
            in_queue: Mutex::new(HashMap::new()),
            failing_pods: Mutex::new(HashMap::new()),
            expected_version: Mutex::new(String::new()),
            per_worker,
            backoff,
            success_limiter,
            failure_limiter,
            cancel: parent_cancel.child_token(),
        }
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    pub fn expected_version(&self) -> String {
        self.expected_version.lock().expect("expected-version mutex poisoned").clone()
    }

    pub fn set_rate(&self, limit_per_sec: f64, burst: f64) {
        self.per_worker.set_rate(limit_per_sec, burst);
    }

    pub fn len(&self) -> usize {
        self.in_queue.lock().expect("in-queue mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn failing_len(&self) -> usize {
        self.failing_pods.lock().expect("failing-pods mutex poisoned").len()
    }

    fn add_rate_limited(&self, item: PodWorkItem) {
        let delay = self.success_limiter.when(&item);
        self.queue.insert(item, delay);
    }

    /// Failure path: `max(per-worker, cluster cap, backoff delay)`, and
    /// the item's failure counter is bumped.
    fn add_failed(&self, item: PodWorkItem) {
        let delay = self.failure_limiter.when(&item);
        self.queue.insert(item, delay);
    }

    pub fn forget(&self, item: &PodWorkItem) {
        self.backoff.forget(item);
    }

    pub fn num_requeues(&self, item: &PodWorkItem) -> u32 {
        self.backoff.num_requeues(item)
    }

    /// Sets `expected_version`, caps `n` so `len() + n <= 1000`, then
    /// enqueues up to `n` non-failing eligible pods via `add_rate_limited`,
    /// filling any remainder from `failing_pods` via `add_failed`. Returns
    /// the number actually enqueued — callers must check this against
    /// the request and re-queue the reconcile if it's short.
    pub fn enqueue_n_updates(&self, n: usize, target_version: &str) -> usize {
        *self.expected_version.lock().expect("expected-version mutex poisoned") = target_version.to_string();

        let capacity = BUFFER_CAP.saturating_sub(self.len());
        let n = n.min(capacity);
        if n == 0 {
            return 0;
        }

        let candidates = self.pod_cache.pods_in_revision_out_of_version(&self.revision, target_version);

        let (fresh, remaining_after_fresh) = {
            let in_queue = self.in_queue.lock().expect("in-queue mutex poisoned");
            let failing = self.failing_pods.lock().expect("failing-pods mutex poisoned");
            let mut fresh: Vec<PodWorkItem> = candidates
                .into_iter()
                .filter(|item| !in_queue.contains_key(&item.key()) && !failing.contains_key(&item.key()))
                .collect();
            fresh.truncate(n);
            let remaining = n - fresh.len();
            (fresh, remaining)
        };

        let mut enqueued = 0;
        {
            let mut in_queue = self.in_queue.lock().expect("in-queue mutex poisoned");
            for item in &fresh {
                in_queue.insert(item.key(), item.clone());
            }
        }
        for item in fresh {
            self.add_rate_limited(item);
            enqueued += 1;
        }

        if remaining_after_fresh > 0 {
            let backfill: Vec<PodWorkItem> = {
                let mut failing = self.failing_pods.lock().expect("failing-pods mutex poisoned");
                let keys: Vec<ItemKey> = failing.keys().take(remaining_after_fresh).cloned().collect();
                keys.into_iter().filter_map(|k| failing.remove(&k)).collect()
            };
            {
                let mut in_queue = self.in_queue.lock().expect("in-queue mutex poisoned");
                for item in &backfill {
                    in_queue.insert(item.key(), item.clone());
                }
            }
            for item in backfill {
                self.add_failed(item);
                enqueued += 1;
            }
        }

        enqueued
    }

    /// Spawns the single-threaded processor loop. Consumes the queue
    /// until the worker's cancellation token fires.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    _ = this.cancel.cancelled() => {
                        info!(revision = %this.revision, "update_worker_stopped");
                        return;
                    }
                    item = this.queue.pop() => item,
                };
                this.process_item(item).await;
            }
        });
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    async fn process_item(&self, item: PodWorkItem) {
        let expected_version = self.expected_version();
        match self.orchestrator.evict_pod(&item.namespace, &item.name).await {
            Ok(()) => self.on_eviction_success(&item, &expected_version),
            Err(MdpError::TooManyRequests { .. }) => self.on_too_many_requests(item, &expected_version).await,
            Err(err) => {
                warn!(namespace = %item.namespace, pod = %item.name, error = %err, "eviction_error_dropped");
                self.remove_from_in_queue(&item.key());
            }
        }
    }

    fn on_eviction_success(&self, item: &PodWorkItem, expected_version: &str) {
        self.remove_from_in_queue(&item.key());
        self.failing_pods
            .lock()
            .expect("failing-pods mutex poisoned")
            .remove(&item.key());
        self.forget(item);
        self.pod_cache
            .remove_pod_by_name(&self.revision, &item.namespace, None, &item.name);

        UPGRADED_PROXIES
            .with_label_values(&[&item.from_version, expected_version, "success", &self.revision])
            .inc();
        info!(
            namespace = %item.namespace,
            pod = %item.name,
            revision = %self.revision,
            "pod_evicted_for_upgrade"
        );
    }

    async fn on_too_many_requests(&self, item: PodWorkItem, expected_version: &str) {
        self.failing_pods
            .lock()
            .expect("failing-pods mutex poisoned")
            .insert(item.key(), item.clone());

        UPGRADED_PROXIES
            .with_label_values(&[&item.from_version, expected_version, "too_many_requests", &self.revision])
            .inc();

        let message = format!("Eviction failed: disruption budget rejected request for {}/{}", item.namespace, item.name);
        if let Err(err) = self
            .orchestrator
            .record_pod_event(&item.namespace, &item.name, "", EventType::Warning, "UpgradeError", &message)
            .await
        {
            warn!(error = %err, "event_record_failed");
        }
        if let Err(err) = self
            .orchestrator
            .patch_pod_label(&item.namespace, &item.name, UPGRADE_FAILED_LABEL, "failed")
            .await
        {
            warn!(error = %err, "label_patch_failed");
        }

        let excluded: HashSet<ItemKey> = {
            let in_queue = self.in_queue.lock().expect("in-queue mutex poisoned");
            let failing = self.failing_pods.lock().expect("failing-pods mutex poisoned");
            in_queue.keys().chain(failing.keys()).cloned().collect()
        };

        let fresh_candidate = self
            .pod_cache
            .pods_in_revision_out_of_version(&self.revision, expected_version)
            .into_iter()
            .find(|candidate| !excluded.contains(&candidate.key()));

        match fresh_candidate {
            Some(fresh) => {
                self.in_queue
                    .lock()
                    .expect("in-queue mutex poisoned")
                    .insert(fresh.key(), fresh.clone());
                self.add_rate_limited(fresh);
                self.remove_from_in_queue(&item.key());
            }
            None => {
                self.add_failed(item.clone());
            }
        }

        let consecutive = self.num_requeues(&item);
        if consecutive >= CONSECUTIVE_FAILURE_WARN_THRESHOLD {
            warn!(
                namespace = %item.namespace,
                pod = %item.name,
                consecutive_failures = consecutive,
                "pod_eviction_repeatedly_rejected"
            );
        }
    }

    fn remove_from_in_queue(&self, key: &ItemKey) {
        self.in_queue.lock().expect("in-queue mutex poisoned").remove(key);
    }
}
