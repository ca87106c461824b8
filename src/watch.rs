//! Event-driven cache invalidation: one `kube_runtime::watcher` stream
//! per watched kind (pods, namespaces, revision records, enablement
//! configmaps), each pushing its events straight into the in-memory
//! caches the reconciler reads from.
//!
//! Grounded on the teacher's own `commands/watch.rs::watch_loop` (a
//! `watcher` stream matched on `Event::Applied`/`Deleted`/`Restarted`);
//! shutdown here uses this crate's `CancellationToken` convention rather
//! than the teacher's broadcast channel, to stay consistent with
//! `pod_cache.rs` and `update_worker.rs`.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod};
use kube::{Api, Client, ResourceExt};
use kube_runtime::watcher::{watcher, Config, Event};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::crd::{DataPlaneControl, ENABLEMENT_CONFIGMAP_PREFIX};
use crate::enablement::RevisionHandler;
use crate::mapper::object_enablement;
use crate::orchestrator::{namespace_to_info, pod_to_info, Orchestrator};
use crate::pod_cache::PodCache;
use crate::reconciler::Reconciler;

/// Applies every `Applied`/`Deleted` pod event straight to the pod cache.
/// A `Restarted` relist triggers a full `rebuild` rather than replaying
/// the given list through `add_pod`, since `rebuild` is already the
/// from-scratch entry point and keeps this one code path authoritative.
pub fn spawn_pod_watcher<O: Orchestrator>(
    client: Client,
    pod_cache: Arc<PodCache<O>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let api: Api<Pod> = Api::all(client);
        let mut stream = watcher(api, Config::default()).boxed();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("pod_watcher_stopped");
                    return;
                }
                next = stream.next() => {
                    match next {
                        Some(Ok(Event::Applied(pod))) => {
                            pod_cache.add_pod(&pod_to_info(pod)).await;
                        }
                        Some(Ok(Event::Deleted(pod))) => {
                            pod_cache.remove_pod(&pod_to_info(pod)).await;
                        }
                        Some(Ok(Event::Restarted(pods))) => {
                            info!(count = pods.len(), "pod_watch_restarted");
                            if let Err(err) = pod_cache.rebuild().await {
                                warn!(error = %err, "pod_cache_rebuild_on_restart_failed");
                            }
                        }
                        Some(Err(err)) => {
                            warn!(error = %err, "pod_watch_stream_error");
                        }
                        None => {
                            warn!("pod_watch_stream_ended");
                            return;
                        }
                    }
                }
            }
        }
    })
}

/// Namespace annotation/label changes can flip eligibility for pods
/// under any revision; re-derives the affected cells via
/// `recalculate_namespace_across_known_revisions` rather than a blanket
/// dirty mark, so the fix is visible before the next periodic rebuild.
pub fn spawn_namespace_watcher<O: Orchestrator>(
    client: Client,
    pod_cache: Arc<PodCache<O>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let api: Api<Namespace> = Api::all(client);
        let mut stream = watcher(api, Config::default()).boxed();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("namespace_watcher_stopped");
                    return;
                }
                next = stream.next() => {
                    match next {
                        Some(Ok(Event::Applied(ns))) | Some(Ok(Event::Deleted(ns))) => {
                            let info_ = namespace_to_info(ns);
                            if let Err(err) = pod_cache.recalculate_namespace_across_known_revisions(&info_.name).await {
                                warn!(namespace = %info_.name, error = %err, "namespace_recalculation_failed");
                                pod_cache.mark_dirty();
                            }
                        }
                        Some(Ok(Event::Restarted(namespaces))) => {
                            info!(count = namespaces.len(), "namespace_watch_restarted");
                            if let Err(err) = pod_cache.rebuild().await {
                                warn!(error = %err, "pod_cache_rebuild_on_restart_failed");
                            }
                        }
                        Some(Err(err)) => {
                            warn!(error = %err, "namespace_watch_stream_error");
                        }
                        None => {
                            warn!("namespace_watch_stream_ended");
                            return;
                        }
                    }
                }
            }
        }
    })
}

/// Revision-record events update the enablement cache and, since a
/// spec/enablement change on the record itself is exactly what the
/// reconciler needs to act on, immediately nudge `Reconciler::reconcile`
/// rather than waiting for the next periodic sweep.
pub fn spawn_revision_watcher<O: Orchestrator>(
    client: Client,
    revision_handler: Arc<RevisionHandler<O>>,
    reconciler: Arc<Reconciler<O>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let api: Api<DataPlaneControl> = Api::all(client);
        let mut stream = watcher(api, Config::default()).boxed();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("revision_watcher_stopped");
                    return;
                }
                next = stream.next() => {
                    match next {
                        Some(Ok(Event::Applied(record))) => {
                            let revision = record.spec.revision.clone();
                            let enablement = object_enablement(
                                &record.metadata.annotations.clone().unwrap_or_default().into_iter().collect(),
                            );
                            revision_handler.on_revision_upsert(&revision, enablement);
                            if let Err(err) = reconciler.reconcile(&revision).await {
                                warn!(revision = %revision, error = %err, "reconcile_on_revision_event_failed");
                            }
                        }
                        Some(Ok(Event::Deleted(record))) => {
                            revision_handler.on_revision_delete(&record.spec.revision);
                        }
                        Some(Ok(Event::Restarted(records))) => {
                            info!(count = records.len(), "revision_watch_restarted");
                            for record in records {
                                let enablement = object_enablement(
                                    &record.metadata.annotations.clone().unwrap_or_default().into_iter().collect(),
                                );
                                revision_handler.on_revision_upsert(&record.spec.revision, enablement);
                            }
                        }
                        Some(Err(err)) => {
                            warn!(error = %err, "revision_watch_stream_error");
                        }
                        None => {
                            warn!("revision_watch_stream_ended");
                            return;
                        }
                    }
                }
            }
        }
    })
}

/// Enablement configmaps in the control-plane namespace: name prefix
/// identifies the kind, name suffix is the revision it governs.
pub fn spawn_configmap_watcher<O: Orchestrator>(
    client: Client,
    revision_handler: Arc<RevisionHandler<O>>,
    control_plane_namespace: String,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let api: Api<ConfigMap> = Api::namespaced(client, &control_plane_namespace);
        let mut stream = watcher(api, Config::default()).boxed();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("configmap_watcher_stopped");
                    return;
                }
                next = stream.next() => {
                    match next {
                        Some(Ok(Event::Applied(cm))) => {
                            handle_configmap_upsert(&revision_handler, cm);
                        }
                        Some(Ok(Event::Deleted(cm))) => {
                            if let Some(revision) = cm.name_any().strip_prefix(ENABLEMENT_CONFIGMAP_PREFIX) {
                                revision_handler.on_configmap_event(revision, crate::crd::Enablement::Missing);
                            }
                        }
                        Some(Ok(Event::Restarted(configmaps))) => {
                            info!(count = configmaps.len(), "configmap_watch_restarted");
                            for cm in configmaps {
                                handle_configmap_upsert(&revision_handler, cm);
                            }
                        }
                        Some(Err(err)) => {
                            warn!(error = %err, "configmap_watch_stream_error");
                        }
                        None => {
                            warn!("configmap_watch_stream_ended");
                            return;
                        }
                    }
                }
            }
        }
    })
}

fn handle_configmap_upsert<O: Orchestrator>(revision_handler: &RevisionHandler<O>, cm: ConfigMap) {
    let name = cm.name_any();
    let Some(revision) = name.strip_prefix(ENABLEMENT_CONFIGMAP_PREFIX) else {
        return;
    };
    let annotations = cm.metadata.annotations.unwrap_or_default().into_iter().collect();
    revision_handler.on_configmap_event(revision, object_enablement(&annotations));
}
