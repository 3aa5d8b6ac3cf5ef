use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use metrics::Unit;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")?;
    describe_metrics();
    Ok(handle)
}

fn describe_metrics() {
    metrics::describe_gauge!("exposehost_tunnels_active", "Tunnels currently active on this worker");
    metrics::describe_counter!(
        "exposehost_pairings_total",
        "Public connections paired with a host callback"
    );
    metrics::describe_counter!(
        "exposehost_callback_timeouts_total",
        "Public connections whose host never called back"
    );
    metrics::describe_counter!(
        "exposehost_bytes_ingress_total",
        Unit::Bytes,
        "Bytes relayed from public peers to hosts"
    );
    metrics::describe_counter!(
        "exposehost_bytes_egress_total",
        Unit::Bytes,
        "Bytes relayed from hosts to public peers"
    );
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Process-unique control session id ("s1", "s2", ...).
pub fn new_session_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(1);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("s{n}")
}

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_unique() {
        let a = new_session_id();
        let b = new_session_id();
        assert_ne!(a, b);
        assert!(a.starts_with('s') && b.starts_with('s'));
    }
}
