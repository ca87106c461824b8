use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::crd::DataPlaneControlStatus;
use crate::orchestrator::Orchestrator;

const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// External collaborator the reconciler hands status updates to rather
/// than writing them back itself: a bounded-rate queue that coalesces
/// repeat updates for the same record (latest write wins) and flushes
/// them through the orchestrator on a timer, so a record re-reconciled
/// many times in quick succession produces one `patch_status` call
/// instead of one per invocation.
pub struct StatusWriter<O: Orchestrator> {
    orchestrator: O,
    pending: Mutex<HashMap<String, DataPlaneControlStatus>>,
}

impl<O: Orchestrator> StatusWriter<O> {
    pub fn new(orchestrator: O) -> Self {
        Self {
            orchestrator,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Queues `status` for `name`, replacing any update already pending
    /// for it.
    pub fn enqueue(&self, name: &str, status: DataPlaneControlStatus) {
        self.pending
            .lock()
            .expect("status writer pending mutex poisoned")
            .insert(name.to_string(), status);
    }

    /// Spawns the flush task: every `FLUSH_INTERVAL`, drains whatever is
    /// pending and writes each through `patch_status`.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        this.flush().await;
                        return;
                    }
                    _ = tokio::time::sleep(FLUSH_INTERVAL) => {}
                }
                this.flush().await;
            }
        });
    }

    async fn flush(&self) {
        let batch: HashMap<String, DataPlaneControlStatus> = std::mem::take(
            &mut *self.pending.lock().expect("status writer pending mutex poisoned"),
        );
        for (name, status) in batch {
            if let Err(err) = self.orchestrator.patch_status(&name, &status).await {
                warn!(record = %name, error = %err, "status_patch_failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{DataPlaneControl, ErrorDetails, EventType, ReconcileState};
    use crate::orchestrator::{NamespaceInfo, PodInfo, ReplicaSetInfo, WebhookConfigInfo};
    use std::sync::Mutex as StdMutex;

    #[derive(Default, Clone)]
    struct FakeOrchestrator {
        patched: Arc<StdMutex<Vec<(String, DataPlaneControlStatus)>>>,
    }

    impl Orchestrator for FakeOrchestrator {
        async fn list_webhook_configs(&self) -> crate::error::Result<Vec<WebhookConfigInfo>> {
            Ok(vec![])
        }
        async fn list_namespaces(&self) -> crate::error::Result<Vec<NamespaceInfo>> {
            Ok(vec![])
        }
        async fn get_namespace(&self, _name: &str) -> crate::error::Result<Option<NamespaceInfo>> {
            Ok(None)
        }
        async fn list_replicasets(&self, _namespace: &str) -> crate::error::Result<Vec<ReplicaSetInfo>> {
            Ok(vec![])
        }
        async fn get_replicaset(
            &self,
            _namespace: &str,
            _name: &str,
        ) -> crate::error::Result<Option<ReplicaSetInfo>> {
            Ok(None)
        }
        async fn list_pods(
            &self,
            _namespace: &str,
            _label_selector: Option<&str>,
        ) -> crate::error::Result<Vec<PodInfo>> {
            Ok(vec![])
        }
        async fn get_expected_version(
            &self,
            _control_plane_namespace: &str,
            _revision: &str,
        ) -> crate::error::Result<Option<String>> {
            Ok(None)
        }
        async fn evict_pod(&self, _namespace: &str, _name: &str) -> crate::error::Result<()> {
            Ok(())
        }
        async fn patch_pod_label(
            &self,
            _namespace: &str,
            _name: &str,
            _key: &str,
            _value: &str,
        ) -> crate::error::Result<()> {
            Ok(())
        }
        async fn record_pod_event(
            &self,
            _namespace: &str,
            _pod_name: &str,
            _pod_uid: &str,
            _event_type: EventType,
            _reason: &str,
            _message: &str,
        ) -> crate::error::Result<()> {
            Ok(())
        }
        async fn patch_status(&self, name: &str, status: &DataPlaneControlStatus) -> crate::error::Result<()> {
            self.patched.lock().unwrap().push((name.to_string(), status.clone()));
            Ok(())
        }
        async fn list_desired_states(&self) -> crate::error::Result<Vec<DataPlaneControl>> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_coalesces_repeated_updates_for_same_record() {
        let orch = FakeOrchestrator::default();
        let writer = StatusWriter::new(orch.clone());

        writer.enqueue(
            "rev-a",
            DataPlaneControlStatus {
                state: ReconcileState::Reconciling,
                achieved_basis_points: 1000,
                observed_generation: Some(1),
                error_details: None,
            },
        );
        writer.enqueue(
            "rev-a",
            DataPlaneControlStatus {
                state: ReconcileState::Ready,
                achieved_basis_points: 10000,
                observed_generation: Some(1),
                error_details: None,
            },
        );

        writer.flush().await;

        let patched = orch.patched.lock().unwrap();
        assert_eq!(patched.len(), 1);
        assert_eq!(patched[0].0, "rev-a");
        assert_eq!(patched[0].1.state, ReconcileState::Ready);
    }

    #[tokio::test]
    async fn test_flush_with_no_pending_updates_is_a_noop() {
        let orch = FakeOrchestrator::default();
        let writer = StatusWriter::new(orch.clone());
        writer.flush().await;
        assert!(orch.patched.lock().unwrap().is_empty());
    }

    #[test]
    fn test_error_details_carried_through() {
        let status = DataPlaneControlStatus {
            state: ReconcileState::Error,
            achieved_basis_points: 4000,
            observed_generation: Some(2),
            error_details: Some(ErrorDetails {
                code: crate::crd::ErrorCode::TooManyEvictions,
                message: "disruption budget blocked progress".to_string(),
            }),
        };
        assert_eq!(status.state, ReconcileState::Error);
        assert!(status.error_details.is_some());
    }
}
