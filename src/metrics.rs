//! Metric names and recording helpers for the resolver and the operator.
//!
//! Every family is described once through a lazily initialised block, then
//! recorded through the `metrics` facade. [`install_prometheus_recorder`]
//! plugs in a Prometheus exposition recorder whose output backs `/metrics`.
//!
//! Resolver families:
//! * `elasti_resolver_incoming_requests_seconds` (histogram)
//! * `elasti_resolver_queued_count` (gauge)
//! * `elasti_resolver_host_extraction_count` (counter)
//! * `elasti_resolver_traffic_switch_count` (counter)
//! * `elasti_resolver_operator_rpc_count` (counter)
//!
//! Operator families:
//! * `elasti_operator_reconcile_total` / `elasti_operator_reconcile_seconds`
//! * `elasti_operator_mode` (gauge, 1 for proxy, 0 for serve)
//! * `elasti_operator_informer_count` (gauge)
//! * `elasti_operator_scale_count` (counter)
//! * `elasti_operator_scaler_evaluation_count` (counter)
use std::time::{Duration, Instant};

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::{Lazy, OnceCell};

pub const RESOLVER_INCOMING_REQUESTS: &str = "elasti_resolver_incoming_requests_seconds";
pub const RESOLVER_QUEUED_COUNT: &str = "elasti_resolver_queued_count";
pub const RESOLVER_HOST_EXTRACTION: &str = "elasti_resolver_host_extraction_count";
pub const RESOLVER_TRAFFIC_SWITCH: &str = "elasti_resolver_traffic_switch_count";
pub const RESOLVER_OPERATOR_RPC: &str = "elasti_resolver_operator_rpc_count";

pub const OPERATOR_RECONCILE_TOTAL: &str = "elasti_operator_reconcile_total";
pub const OPERATOR_RECONCILE_SECONDS: &str = "elasti_operator_reconcile_seconds";
pub const OPERATOR_MODE: &str = "elasti_operator_mode";
pub const OPERATOR_INFORMER_COUNT: &str = "elasti_operator_informer_count";
pub const OPERATOR_SCALE_COUNT: &str = "elasti_operator_scale_count";
pub const OPERATOR_SCALER_EVALUATION: &str = "elasti_operator_scaler_evaluation_count";

static DESCRIPTIONS: Lazy<()> = Lazy::new(|| {
    describe_histogram!(
        RESOLVER_INCOMING_REQUESTS,
        Unit::Seconds,
        "Latency of every request the resolver handled."
    );
    describe_gauge!(
        RESOLVER_QUEUED_COUNT,
        "Requests currently held by the resolver while their target is cold."
    );
    describe_counter!(
        RESOLVER_HOST_EXTRACTION,
        Unit::Count,
        "Host lookups by outcome (cache-hit, cache-miss, error)."
    );
    describe_counter!(
        RESOLVER_TRAFFIC_SWITCH,
        Unit::Count,
        "Traffic gate transitions per route."
    );
    describe_counter!(
        RESOLVER_OPERATOR_RPC,
        Unit::Count,
        "Incoming-request notifications sent to the operator."
    );
    describe_counter!(
        OPERATOR_RECONCILE_TOTAL,
        Unit::Count,
        "Reconcile passes per ElastiService."
    );
    describe_histogram!(
        OPERATOR_RECONCILE_SECONDS,
        Unit::Seconds,
        "Duration of reconcile passes."
    );
    describe_gauge!(
        OPERATOR_MODE,
        "Current mode per ElastiService (1 proxy, 0 serve)."
    );
    describe_gauge!(OPERATOR_INFORMER_COUNT, "Active watch sessions.");
    describe_counter!(
        OPERATOR_SCALE_COUNT,
        Unit::Count,
        "Scale actions on scale targets."
    );
    describe_counter!(
        OPERATOR_SCALER_EVALUATION,
        Unit::Count,
        "Scaler evaluations by trigger type and outcome."
    );
});

static PROMETHEUS: OnceCell<PrometheusHandle> = OnceCell::new();

fn error_label(error: Option<&str>) -> String {
    error.unwrap_or_default().to_string()
}

/// Install the Prometheus recorder once per process and return its handle.
pub fn install_prometheus_recorder() -> eyre::Result<PrometheusHandle> {
    let handle = PROMETHEUS.get_or_try_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| eyre::eyre!("Failed to install Prometheus recorder: {}", e))
    })?;
    Lazy::force(&DESCRIPTIONS);
    Ok(handle.clone())
}

/// Render the current exposition text, empty when no recorder is installed.
pub fn render() -> String {
    PROMETHEUS.get().map(|h| h.render()).unwrap_or_default()
}

/// Initialize metric descriptions (idempotent).
pub fn init_metrics() -> eyre::Result<()> {
    tracing::info!("Initializing elasti metrics");
    install_prometheus_recorder()?;
    Ok(())
}

pub fn record_incoming_request(
    source: &str,
    namespace: &str,
    method: &str,
    status: u16,
    error: Option<&str>,
    duration: Duration,
) {
    histogram!(
        RESOLVER_INCOMING_REQUESTS,
        "source" => source.to_string(),
        "namespace" => namespace.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string(),
        "error" => error_label(error)
    )
    .record(duration.as_secs_f64());
}

pub fn set_queued_requests(count: i64) {
    gauge!(RESOLVER_QUEUED_COUNT).set(count as f64);
}

pub fn increment_host_extraction(outcome: &str, error: Option<&str>) {
    counter!(
        RESOLVER_HOST_EXTRACTION,
        "extraction_type" => outcome.to_string(),
        "error" => error_label(error)
    )
    .increment(1);
}

pub fn increment_traffic_switch(source: &str, enabled: bool) {
    counter!(
        RESOLVER_TRAFFIC_SWITCH,
        "source" => source.to_string(),
        "enabled" => enabled.to_string()
    )
    .increment(1);
}

pub fn increment_operator_rpc(error: Option<&str>) {
    counter!(RESOLVER_OPERATOR_RPC, "error" => error_label(error)).increment(1);
}

pub fn set_mode(crd: &str, proxy: bool) {
    gauge!(OPERATOR_MODE, "crd_name" => crd.to_string()).set(if proxy { 1.0 } else { 0.0 });
}

pub fn set_informer_count(count: usize) {
    gauge!(OPERATOR_INFORMER_COUNT).set(count as f64);
}

pub fn increment_scale(service: &str, target: &str, error: Option<&str>) {
    counter!(
        OPERATOR_SCALE_COUNT,
        "service_name" => service.to_string(),
        "target" => target.to_string(),
        "error" => error_label(error)
    )
    .increment(1);
}

pub fn increment_scaler_evaluation(trigger_type: &str, outcome: &str) {
    counter!(
        OPERATOR_SCALER_EVALUATION,
        "trigger_type" => trigger_type.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// RAII helper measuring one reconcile pass.
pub struct ReconcileTimer {
    start: Instant,
    crd: String,
    error: Option<String>,
}

impl ReconcileTimer {
    pub fn new(crd: &str) -> Self {
        Self {
            start: Instant::now(),
            crd: crd.to_string(),
            error: None,
        }
    }

    /// Mark the pass as failed; the error text becomes a label.
    pub fn fail(&mut self, error: &str) {
        self.error = Some(error.to_string());
    }
}

impl Drop for ReconcileTimer {
    fn drop(&mut self) {
        let error = error_label(self.error.as_deref());
        counter!(
            OPERATOR_RECONCILE_TOTAL,
            "crd_name" => self.crd.clone(),
            "error" => error.clone()
        )
        .increment(1);
        histogram!(
            OPERATOR_RECONCILE_SECONDS,
            "crd_name" => self.crd.clone(),
            "error" => error
        )
        .record(self.start.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconcile_timer_records_on_drop() {
        let mut timer = ReconcileTimer::new("shop/orders");
        timer.fail("boom");
        drop(timer);
    }

    #[test]
    fn test_recorder_installs_once_and_renders() {
        let first = install_prometheus_recorder();
        let second = install_prometheus_recorder();
        assert!(first.is_ok());
        assert!(second.is_ok());

        increment_operator_rpc(None);
        increment_traffic_switch("orders.shop", false);
        let text = render();
        assert!(text.contains(RESOLVER_OPERATOR_RPC));
        assert!(text.contains(RESOLVER_TRAFFIC_SWITCH));
    }
}
