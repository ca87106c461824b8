use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use kube::Client;
use prometheus::{Encoder, TextEncoder};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use mdp_controller::config::ControllerConfig;
use mdp_controller::enablement::{EnablementCache, RevisionHandler};
use mdp_controller::mapper::Mapper;
use mdp_controller::metrics::{self, REGISTRY};
use mdp_controller::orchestrator::{KubeOrchestrator, Orchestrator};
use mdp_controller::pod_cache::PodCache;
use mdp_controller::reconciler::{ReconcileOutcome, Reconciler};
use mdp_controller::status_writer::StatusWriter;
use mdp_controller::watch;

/// Resync fallback only: the revision watcher already nudges a reconcile
/// on every upsert, this sweep just catches whatever that stream missed
/// (a dropped watch connection, an orchestrator error mid-event).
const RECONCILE_POLL_INTERVAL: Duration = Duration::from_secs(5 * 60);

struct ReadyState(AtomicBool);

pub async fn run() -> Result<()> {
    println!("Starting managed data plane controller...\n");

    let config = ControllerConfig::from_env();

    let client = Client::try_default().await.context("Failed to load kubeconfig")?;

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    metrics::init();

    let orchestrator = KubeOrchestrator::new(client.clone());
    let mapper = Arc::new(Mapper::new(orchestrator.clone()));
    let enablement = Arc::new(EnablementCache::new());
    let pod_cache = Arc::new(PodCache::new(Arc::clone(&mapper), Arc::clone(&enablement)));
    mapper.set_pod_cache(Arc::clone(&pod_cache));

    let revision_handler = Arc::new(RevisionHandler::new(Arc::clone(&enablement)));
    revision_handler.set_pod_cache(Arc::clone(&pod_cache));

    let root_cancel = CancellationToken::new();

    let status_writer = Arc::new(StatusWriter::new(orchestrator.clone()));
    status_writer.start(root_cancel.child_token());

    let reconciler = Arc::new(Reconciler::new(
        orchestrator.clone(),
        Arc::clone(&mapper),
        Arc::clone(&pod_cache),
        Arc::clone(&status_writer),
        config.clone(),
        root_cancel.child_token(),
    ));

    let ready = Arc::new(ReadyState(AtomicBool::new(false)));

    println!(
        "  Control plane namespace ..... {}",
        config.control_plane_namespace
    );
    println!("  Max reconcile time ........... {}s", config.max_reconcile_time.as_secs());
    println!(
        "  Cluster eviction speed limit . {:.3}/s",
        config.cluster_speed_limit_per_sec()
    );
    println!("  Metrics server .............. http://{}", config.metrics_addr);
    println!();
    println!("  Available endpoints:");
    println!("    GET /healthz .............. Liveness probe (always 200 OK)");
    println!("    GET /readyz ............... Readiness probe (503 until first pod-cache build)");
    println!("    GET /metrics .............. Prometheus metrics scrape endpoint");
    println!();

    let http_ready = Arc::clone(&ready);
    let http_cancel = root_cancel.child_token();
    let metrics_addr = config.metrics_addr;
    let http_handle = tokio::spawn(async move { start_metrics_server(http_ready, http_cancel, metrics_addr).await });

    info!("mdp_controller_started");

    if let Err(err) = pod_cache.rebuild().await {
        warn!(error = %err, "initial_pod_cache_build_failed");
    }
    ready.0.store(true, Ordering::SeqCst);
    pod_cache.start(root_cancel.child_token());

    println!("Controller running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    let poll_cancel = root_cancel.child_token();
    let poll_handle = tokio::spawn(reconcile_loop(orchestrator.clone(), Arc::clone(&reconciler), poll_cancel));

    let pod_watch_handle = watch::spawn_pod_watcher(client.clone(), Arc::clone(&pod_cache), root_cancel.child_token());
    let namespace_watch_handle =
        watch::spawn_namespace_watcher(client.clone(), Arc::clone(&pod_cache), root_cancel.child_token());
    let revision_watch_handle = watch::spawn_revision_watcher(
        client.clone(),
        Arc::clone(&revision_handler),
        Arc::clone(&reconciler),
        root_cancel.child_token(),
    );
    let configmap_watch_handle = watch::spawn_configmap_watcher(
        client.clone(),
        Arc::clone(&revision_handler),
        config.control_plane_namespace.clone(),
        root_cancel.child_token(),
    );

    signal::ctrl_c().await.context("failed to listen for shutdown signal")?;

    println!("\n{}", "=".repeat(70));
    println!("Shutdown signal received. Stopping controller...");
    println!("{}", "=".repeat(70));
    info!("shutdown_signal_received");

    root_cancel.cancel();
    let _ = poll_handle.await;
    let _ = pod_watch_handle.await;
    let _ = namespace_watch_handle.await;
    let _ = revision_watch_handle.await;
    let _ = configmap_watch_handle.await;
    let _ = http_handle.await?;

    info!("mdp_controller_stopped");
    println!("Controller stopped.");

    Ok(())
}

/// Resync fallback: periodically sweeps every desired-state record
/// through the reconciler. The revision watcher already reconciles on
/// every upsert; `Reconciler::reconcile` is idempotent per revision, so
/// this sweep only needs to run far less often, to catch whatever the
/// watch stream missed.
async fn reconcile_loop<O: Orchestrator>(orchestrator: O, reconciler: Arc<Reconciler<O>>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("reconcile_loop_stopped");
                return;
            }
            _ = tokio::time::sleep(RECONCILE_POLL_INTERVAL) => {}
        }

        let records = match orchestrator.list_desired_states().await {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "list_desired_states_failed");
                continue;
            }
        };

        for record in records {
            let revision = record.spec.revision.clone();
            match reconciler.reconcile(&revision).await {
                Ok(ReconcileOutcome::Ready) => {}
                Ok(ReconcileOutcome::Requeue(_)) => {
                    info!(revision = %revision, "reconcile_requested_requeue");
                }
                Err(err) => {
                    warn!(revision = %revision, error = %err, "reconcile_failed");
                }
            }
        }
    }
}

/* ============================= HTTP SERVER ============================= */

fn build_router(ready: Arc<ReadyState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route("/readyz", get(move || ready_handler(ready.clone())))
}

async fn start_metrics_server(ready: Arc<ReadyState>, cancel: CancellationToken, addr: std::net::SocketAddr) -> Result<()> {
    let app = build_router(ready);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics server on {addr}"))?;

    info!(%addr, "metrics_server_started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
        })
        .await?;

    Ok(())
}

async fn ready_handler(ready: Arc<ReadyState>) -> impl IntoResponse {
    if ready.0.load(Ordering::SeqCst) {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
        },
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
    }
}
