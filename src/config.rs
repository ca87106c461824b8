use std::net::SocketAddr;
use std::time::Duration;

/// Controller configuration, read once from the environment at startup.
///
/// Mirrors the teacher crate's convention of binding configuration inline
/// at the top of `commands::*::run()`, pulled out here into a typed struct
/// since the reconciliation engine (unlike the teacher's CLI commands) is
/// a long-lived library consumed from more than one entrypoint.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Target time for one full rollout to complete (`MAX_RECONCILE_TIME`).
    pub max_reconcile_time: Duration,
    /// Namespace holding the leader-election lease and the expected-version
    /// configmaps (`MDP_LEADER_ELECTION_NAMESPACE`).
    pub control_plane_namespace: String,
    /// Name of the leader-election lease (`MDP_LEADER_ELECTION_LOCK_NAME`).
    pub leader_lock_name: String,
    /// Bind address for the `/metrics`, `/healthz`, `/readyz` server.
    pub metrics_addr: SocketAddr,
    /// Used to derive the cluster-wide eviction speed limit: no more than
    /// `24h / (max_pods_per_node * max_nodes_per_cluster)` evictions/sec.
    pub max_pods_per_node: u32,
    pub max_nodes_per_cluster: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_reconcile_time: Duration::from_secs(24 * 3600),
            control_plane_namespace: "istio-system".to_string(),
            leader_lock_name: "mdp-controller-leader".to_string(),
            metrics_addr: "0.0.0.0:9090".parse().expect("static addr parses"),
            max_pods_per_node: 250,
            max_nodes_per_cluster: 1000,
        }
    }
}

impl ControllerConfig {
    /// Build config from environment variables, falling back to defaults
    /// for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let max_reconcile_time = std::env::var("MAX_RECONCILE_TIME")
            .ok()
            .and_then(|v| parse_duration(&v))
            .unwrap_or(defaults.max_reconcile_time);

        let control_plane_namespace = std::env::var("MDP_LEADER_ELECTION_NAMESPACE")
            .unwrap_or(defaults.control_plane_namespace);

        let leader_lock_name =
            std::env::var("MDP_LEADER_ELECTION_LOCK_NAME").unwrap_or(defaults.leader_lock_name);

        let metrics_addr = std::env::var("MDP_METRICS_ADDR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.metrics_addr);

        let max_pods_per_node = std::env::var("MDP_MAX_PODS_PER_NODE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_pods_per_node);

        let max_nodes_per_cluster = std::env::var("MDP_MAX_NODES_PER_CLUSTER")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_nodes_per_cluster);

        Self {
            max_reconcile_time,
            control_plane_namespace,
            leader_lock_name,
            metrics_addr,
            max_pods_per_node,
            max_nodes_per_cluster,
        }
    }

    /// The cluster-wide eviction speed limit in evictions/sec, derived from
    /// `max_reconcile_time / (max_pods_per_node * max_nodes_per_cluster)`.
    pub fn cluster_speed_limit_per_sec(&self) -> f64 {
        let capacity = (self.max_pods_per_node as f64) * (self.max_nodes_per_cluster as f64);
        if capacity <= 0.0 {
            return 1.0;
        }
        capacity / self.max_reconcile_time.as_secs_f64()
    }
}

/// Parse durations of the form `"24h"`, `"30m"`, `"45s"`, or a bare integer
/// of seconds. Not a general-purpose parser — just enough for the handful
/// of env-configurable durations this controller accepts.
fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let (number, unit) = raw.split_at(raw.len() - 1);
    let (value, multiplier) = match unit {
        "h" => (number, 3600u64),
        "m" => (number, 60u64),
        "s" => (number, 1u64),
        _ => (raw, 1u64),
    };

    value
        .parse::<u64>()
        .ok()
        .map(|v| Duration::from_secs(v * multiplier))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_hours() {
        assert_eq!(parse_duration("24h"), Some(Duration::from_secs(86400)));
    }

    #[test]
    fn test_parse_duration_minutes() {
        assert_eq!(parse_duration("30m"), Some(Duration::from_secs(1800)));
    }

    #[test]
    fn test_parse_duration_seconds_suffixed() {
        assert_eq!(parse_duration("45s"), Some(Duration::from_secs(45)));
    }

    #[test]
    fn test_parse_duration_bare_integer() {
        assert_eq!(parse_duration("120"), Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_parse_duration_empty() {
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn test_parse_duration_garbage() {
        assert_eq!(parse_duration("abc"), None);
    }

    #[test]
    fn test_default_config() {
        let cfg = ControllerConfig::default();
        assert_eq!(cfg.max_reconcile_time, Duration::from_secs(86400));
        assert_eq!(cfg.control_plane_namespace, "istio-system");
    }

    #[test]
    fn test_cluster_speed_limit() {
        let cfg = ControllerConfig {
            max_reconcile_time: Duration::from_secs(86400),
            max_pods_per_node: 250,
            max_nodes_per_cluster: 1000,
            ..ControllerConfig::default()
        };
        let limit = cfg.cluster_speed_limit_per_sec();
        // 250_000 pods / 86400s ≈ 2.89/s
        assert!((limit - 2.8935).abs() < 0.01);
    }
}
