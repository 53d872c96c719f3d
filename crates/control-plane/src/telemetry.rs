use metrics::counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::error;

static METRICS_HANDLE: std::sync::OnceLock<PrometheusHandle> = std::sync::OnceLock::new();

pub fn init_metrics_recorder() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .add_global_label("app_version", env!("CARGO_PKG_VERSION"))
                .install_recorder()
                .expect("metrics recorder already installed")
        })
        .clone()
}

pub(crate) fn record_internal_error_metrics(err: &anyhow::Error) {
    counter!("aero_cp_internal_errors_total").increment(1);
    error!(?err, "internal error");
}
