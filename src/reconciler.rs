use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ControllerConfig;
use crate::crd::{DataPlaneControlStatus, ErrorCode, ErrorDetails, ReconcileState};
use crate::error::{MdpError, Result};
use crate::mapper::Mapper;
use crate::metrics::{PROXIES_TOTAL, PROXY_PERCENTAGE_TARGET, RECONCILE_DURATION, RECONCILE_LOOP_COUNT, RECONCILE_STATE};
use crate::orchestrator::Orchestrator;
use crate::pod_cache::PodCache;
use crate::rate_limit::TokenBucket;
use crate::status_writer::StatusWriter;
use crate::update_worker::UpdateWorker;

/// Default requeue cadence for a record that needs another look (a
/// worker fell short of a requested enqueue, or over-projection fired)
/// without any error having occurred.
const DEFAULT_REQUEUE: Duration = Duration::from_secs(30);
/// Over-projection threshold: a worker is stopped once its queued +
/// in-flight count would put coverage more than 10% past the goal.
const OVER_PROJECTION_RATIO: f64 = 1.1;

pub enum ReconcileOutcome {
    Ready,
    Requeue(Duration),
}

/// Identity of one record's reconcile status, used to dedupe the
/// "first transition to ready" and "first unready timestamp" bookkeeping
/// across repeat invocations of the same generation.
type RecordKey = (String, i64);

/// Drives the 7-step per-invocation reconcile algorithm for one
/// `DataPlaneControl` record: validates the record and its version
/// contract, reads rollout progress from the pod cache, provisions (or
/// retires) the record's `UpdateWorker`, computes the delta of updates
/// to enqueue, and emits status through the `StatusWriter`.
pub struct Reconciler<O: Orchestrator> {
    orchestrator: O,
    mapper: Arc<Mapper<O>>,
    pod_cache: Arc<PodCache<O>>,
    status_writer: Arc<StatusWriter<O>>,
    workers: Mutex<HashMap<String, Arc<UpdateWorker<O>>>>,
    cluster_cap: Arc<TokenBucket>,
    config: ControllerConfig,
    root_cancel: CancellationToken,
    first_unready: Mutex<HashMap<RecordKey, Instant>>,
    ready_recorded: Mutex<HashSet<RecordKey>>,
}

impl<O: Orchestrator> Reconciler<O> {
    pub fn new(
        orchestrator: O,
        mapper: Arc<Mapper<O>>,
        pod_cache: Arc<PodCache<O>>,
        status_writer: Arc<StatusWriter<O>>,
        config: ControllerConfig,
        root_cancel: CancellationToken,
    ) -> Self {
        let cluster_cap = Arc::new(TokenBucket::new(config.cluster_speed_limit_per_sec(), 1.0));
        Self {
            orchestrator,
            mapper,
            pod_cache,
            status_writer,
            workers: Mutex::new(HashMap::new()),
            cluster_cap,
            config,
            root_cancel,
            first_unready: Mutex::new(HashMap::new()),
            ready_recorded: Mutex::new(HashSet::new()),
        }
    }

    fn worker_for(&self, revision: &str) -> Option<Arc<UpdateWorker<O>>> {
        self.workers.lock().expect("reconciler workers mutex poisoned").get(revision).cloned()
    }

    fn stop_worker(&self, revision: &str) {
        let removed = self
            .workers
            .lock()
            .expect("reconciler workers mutex poisoned")
            .remove(revision);
        if let Some(worker) = removed {
            worker.stop();
        }
    }

    fn provision_worker(&self, revision: &str, rate_per_sec: f64) -> Arc<UpdateWorker<O>> {
        let mut workers = self.workers.lock().expect("reconciler workers mutex poisoned");
        let worker = workers
            .entry(revision.to_string())
            .or_insert_with(|| {
                Arc::new(UpdateWorker::new(
                    revision.to_string(),
                    self.orchestrator.clone(),
                    Arc::clone(&self.pod_cache),
                    Arc::clone(&self.cluster_cap),
                    &self.root_cancel,
                ))
            })
            .clone();
        worker.start();
        worker.set_rate(rate_per_sec, rate_per_sec.max(1.0));
        worker
    }

    /// Runs the full per-invocation algorithm for `revision`.
    pub async fn reconcile(&self, revision: &str) -> Result<ReconcileOutcome> {
        RECONCILE_LOOP_COUNT.with_label_values(&["attempted", revision]).inc();

        // Step 1: resource validation.
        let Some(record) = self.mapper.desired_record_for(revision).await? else {
            return Ok(ReconcileOutcome::Ready);
        };
        if self.mapper.has_durable_error(revision) {
            self.emit_status(
                &record_name(&record),
                record_key(&record),
                DataPlaneControlStatus {
                    state: ReconcileState::Error,
                    achieved_basis_points: 0,
                    observed_generation: record.metadata.generation,
                    error_details: Some(ErrorDetails {
                        code: ErrorCode::InvalidRevision,
                        message: format!("no injection webhook carries revision {revision:?}"),
                    }),
                },
            );
            return Ok(ReconcileOutcome::Ready);
        }

        // Step 2: version contract.
        let expected = self
            .orchestrator
            .get_expected_version(&self.config.control_plane_namespace, revision)
            .await;
        let version_ok = matches!(&expected, Ok(Some(v)) if v == &record.spec.proxy_version);
        if !version_ok {
            self.stop_worker(revision);
            self.emit_status(
                &record_name(&record),
                record_key(&record),
                DataPlaneControlStatus {
                    state: ReconcileState::Error,
                    achieved_basis_points: 0,
                    observed_generation: record.metadata.generation,
                    error_details: Some(ErrorDetails {
                        code: ErrorCode::VersionMismatch,
                        message: "desired proxyVersion does not match control-plane expected version".to_string(),
                    }),
                },
            );
            return Err(MdpError::VersionMismatch);
        }

        // Step 3: zero pods.
        let (versions, total) = self.pod_cache.proxy_version_count(revision);
        PROXIES_TOTAL.with_label_values(&[revision, &record.spec.proxy_version]).set(
            *versions.get(&record.spec.proxy_version).unwrap_or(&0) as i64,
        );
        PROXY_PERCENTAGE_TARGET
            .with_label_values(&[&record.spec.proxy_version, revision, &record.spec.proxy_target_basis_points.to_string()])
            .set(record.spec.proxy_target_basis_points as i64);

        if total == 0 {
            let failing = self.worker_for(revision).map(|w| w.failing_len()).unwrap_or(0);
            let status = self.compute_status(&record, 0, total, failing);
            self.emit_status(&record_name(&record), record_key(&record), status);
            return Ok(ReconcileOutcome::Ready);
        }

        // Step 4: zero goal.
        let desired = ceil_basis_points(total, record.spec.proxy_target_basis_points);
        if desired < 1 {
            self.stop_worker(revision);
            return Ok(ReconcileOutcome::Ready);
        }

        // Step 5: provision worker.
        let rate_per_sec = total as f64 / self.config.max_reconcile_time.as_secs_f64().max(1.0);
        let worker = self.provision_worker(revision, rate_per_sec);
        // Stamps expectedVersion even when step 6 below enqueues nothing.
        worker.enqueue_n_updates(0, &record.spec.proxy_version);

        // Step 6: delta.
        let actual = *versions.get(&record.spec.proxy_version).unwrap_or(&0);
        let projected = actual + worker.len();
        let mut needs_requeue = false;

        if projected < desired {
            let requested = desired - projected;
            let enqueued = worker.enqueue_n_updates(requested, &record.spec.proxy_version);
            if enqueued < requested {
                needs_requeue = true;
            }
        } else if worker.len() > 0
            && desired > 0
            && (projected as f64 / desired as f64) > OVER_PROJECTION_RATIO
            && record.spec.proxy_target_basis_points < 10_000
        {
            warn!(revision, projected, desired, "rollout_over_projected_stopping_worker");
            self.stop_worker(revision);
            needs_requeue = true;
        }

        // Step 7: status.
        let failing = worker.failing_len();
        let status = self.compute_status(&record, actual, total, failing);
        RECONCILE_STATE.with_label_values(&[revision, status_label(&status.state)]).set(1);
        self.emit_status(&record_name(&record), record_key(&record), status);

        RECONCILE_LOOP_COUNT.with_label_values(&["completed", revision]).inc();

        if needs_requeue {
            Ok(ReconcileOutcome::Requeue(DEFAULT_REQUEUE))
        } else {
            Ok(ReconcileOutcome::Ready)
        }
    }

    /// Status calculation rules from the rollout's basis-point goal.
    fn compute_status(
        &self,
        record: &crate::crd::DataPlaneControl,
        actual: usize,
        total: usize,
        failing: usize,
    ) -> DataPlaneControlStatus {
        let target = record.spec.proxy_target_basis_points;
        let achieved = if total == 0 {
            10_000
        } else {
            (actual * 10_000 / total) as u32
        };
        let key = record_key(record);

        if achieved >= target {
            if self.ready_recorded.lock().expect("ready-recorded mutex poisoned").insert(key.clone()) {
                RECONCILE_DURATION.observe(
                    self.first_unready
                        .lock()
                        .expect("first-unready mutex poisoned")
                        .remove(&key)
                        .map(|t| t.elapsed().as_secs_f64())
                        .unwrap_or(0.0),
                );
            }
            return DataPlaneControlStatus {
                state: ReconcileState::Ready,
                achieved_basis_points: achieved,
                observed_generation: record.metadata.generation,
                error_details: None,
            };
        }

        self.ready_recorded.lock().expect("ready-recorded mutex poisoned").remove(&key);

        let coverage_without_failing = if total == 0 {
            10_000
        } else {
            ((total - failing.min(total)) * 10_000 / total) as u32
        };
        if coverage_without_failing < target {
            return DataPlaneControlStatus {
                state: ReconcileState::Error,
                achieved_basis_points: achieved,
                observed_generation: record.metadata.generation,
                error_details: Some(ErrorDetails {
                    code: ErrorCode::TooManyEvictions,
                    message: "disruption budgets are preventing rollout progress".to_string(),
                }),
            };
        }

        self.first_unready
            .lock()
            .expect("first-unready mutex poisoned")
            .entry(key)
            .or_insert_with(Instant::now);

        DataPlaneControlStatus {
            state: ReconcileState::Reconciling,
            achieved_basis_points: achieved,
            observed_generation: record.metadata.generation,
            error_details: None,
        }
    }

    fn emit_status(&self, name: &str, _key: RecordKey, status: DataPlaneControlStatus) {
        info!(record = %name, state = ?status.state, achieved = status.achieved_basis_points, "reconcile_status_computed");
        self.status_writer.enqueue(name, status);
    }
}

fn record_name(record: &crate::crd::DataPlaneControl) -> String {
    record.name_any()
}

fn record_key(record: &crate::crd::DataPlaneControl) -> RecordKey {
    (record.uid().unwrap_or_default(), record.metadata.generation.unwrap_or(0))
}

fn status_label(state: &ReconcileState) -> &'static str {
    match state {
        ReconcileState::Reconciling => "reconciling",
        ReconcileState::Ready => "ready",
        ReconcileState::Error => "error",
    }
}

/// `ceil(total * target_basis_points / 10000)`.
fn ceil_basis_points(total: usize, target_basis_points: u32) -> usize {
    let numerator = total as u128 * target_basis_points as u128;
    ((numerator + 9_999) / 10_000) as usize
}
