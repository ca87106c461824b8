use std::sync::LazyLock;

use prometheus::{Histogram, HistogramOpts, IntCounterVec, IntGaugeVec, Opts, Registry};

/// Process-wide Prometheus registry, scraped by `GET /metrics`.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Count of proxies observed per revision/version, refreshed each reconcile.
pub static PROXIES_TOTAL: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let g = IntGaugeVec::new(
        Opts::new("proxies_total", "Proxies observed per revision and version"),
        &["revision", "version"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

/// Outcome of each attempted proxy upgrade.
pub static UPGRADED_PROXIES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        Opts::new("upgraded_proxies", "Proxy upgrade attempts by outcome"),
        &["from", "to", "result", "revision"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

/// Count of completed reconcile loops per revision and result.
pub static RECONCILE_LOOP_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        Opts::new("reconcile_loop_count", "Reconcile loops by revision and result"),
        &["result", "revision"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

/// Current status state per revision (0=Reconciling, 1=Ready, 2=Error), so
/// a single gauge value can be graphed per revision/state pair.
pub static RECONCILE_STATE: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let g = IntGaugeVec::new(
        Opts::new("reconcile_state", "Current reconcile status per revision"),
        &["revision", "state"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

/// Wall-clock time from a record's first unready observation to its
/// first transition to `Ready`, recorded once per (uid, generation).
pub static RECONCILE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(
        HistogramOpts::new(
            "reconcile_duration_seconds",
            "Duration of each reconcile cycle in seconds",
        )
        .const_label("revision", "all"),
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(h.clone()))
        .expect("metric not yet registered");
    h
});

/// Desired rollout percentage (in basis points) per control-plane version
/// and revision, as last accepted from a `DataPlaneControl` spec.
pub static PROXY_PERCENTAGE_TARGET: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let g = IntGaugeVec::new(
        Opts::new(
            "proxy_percentage_target",
            "Desired proxy rollout percentage in basis points",
        ),
        &["cp_version", "revision", "basis_points"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

/// Force-initializes every metric so it appears on `/metrics` even before
/// the first reconcile runs. Mirrors the teacher's `LazyLock::force` block
/// at the top of `run()`.
pub fn init() {
    LazyLock::force(&PROXIES_TOTAL);
    LazyLock::force(&UPGRADED_PROXIES);
    LazyLock::force(&RECONCILE_LOOP_COUNT);
    LazyLock::force(&RECONCILE_STATE);
    LazyLock::force(&RECONCILE_DURATION);
    LazyLock::force(&PROXY_PERCENTAGE_TARGET);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_registers_all_metrics() {
        init();
        let families = REGISTRY.gather();
        let names: Vec<_> = families.iter().map(|f| f.name().to_string()).collect();
        assert!(names.contains(&"proxies_total".to_string()));
        assert!(names.contains(&"upgraded_proxies".to_string()));
        assert!(names.contains(&"reconcile_loop_count".to_string()));
        assert!(names.contains(&"reconcile_state".to_string()));
        assert!(names.contains(&"reconcile_duration_seconds".to_string()));
        assert!(names.contains(&"proxy_percentage_target".to_string()));
    }

    #[test]
    fn test_upgraded_proxies_increments() {
        init();
        UPGRADED_PROXIES
            .with_label_values(&["1.20", "1.21", "success", "rev-a"])
            .inc();
        let metric = UPGRADED_PROXIES.with_label_values(&["1.20", "1.21", "success", "rev-a"]);
        assert_eq!(metric.get(), 1);
    }
}
