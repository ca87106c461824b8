use thiserror::Error;

/// Errors produced by the reconciliation and rollout engine.
///
/// This is the library-internal error type; the CLI layer (`src/commands`)
/// wraps these in `anyhow::Error` at its boundary.
#[derive(Error, Debug)]
pub enum MdpError {
    /// The orchestrator (API server) failed on a get/list/patch/update/delete.
    /// Callers that touch the pod cache must mark it dirty on receipt of this.
    #[error("orchestrator request failed: {0}")]
    TransientOrchestrator(#[source] kube::Error),

    /// An eviction was rejected by a pod-disruption-budget policy.
    #[error("eviction rejected by disruption budget for {namespace}/{name}")]
    TooManyRequests { namespace: String, name: String },

    /// The `managed-data-plane/enabled` annotation did not parse as the
    /// expected tri-state JSON shape.
    #[error("enablement annotation is not valid JSON: {0}")]
    JsonParse(#[source] serde_json::Error),

    /// No injection webhook configuration carries the given revision label.
    #[error("no injection webhook carries revision {revision:?}")]
    NoWebhookForRevision { revision: String },

    /// `proxyVersion` does not match the control plane's expected version.
    #[error("desired proxyVersion does not match control-plane expected version")]
    VersionMismatch,

    /// The update worker's projected coverage would overshoot the goal.
    #[error("projected coverage for revision {revision:?} overshoots target")]
    OverProjection { revision: String },

    /// Pass-through for orchestrator errors not otherwise classified.
    #[error(transparent)]
    Kube(#[from] kube::Error),
}

impl MdpError {
    /// True when the underlying orchestrator error is an HTTP 429
    /// ("too many requests"), the signal used to reject an eviction
    /// because of an active disruption budget.
    pub fn is_too_many_requests(err: &kube::Error) -> bool {
        matches!(err, kube::Error::Api(resp) if resp.code == 429)
    }
}

pub type Result<T> = std::result::Result<T, MdpError>;
