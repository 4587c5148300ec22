//! Prometheus metrics

use crate::models::ComponentKind;
use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder.
/// Returns a handle that renders the current metrics in text format.
pub fn setup_metrics() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;

    tracing::info!("Prometheus metrics recorder installed");

    Ok(handle)
}

/// Record a weight download handed to the backend
pub fn record_download_started(model_id: &str, component: ComponentKind) {
    metrics::counter!("asset_manager_downloads_started_total",
        "model" => model_id.to_string(),
        "component" => component.to_string()
    )
    .increment(1);
}

pub fn record_download_completed(model_id: &str, component: ComponentKind) {
    metrics::counter!("asset_manager_downloads_completed_total",
        "model" => model_id.to_string(),
        "component" => component.to_string()
    )
    .increment(1);
}

pub fn record_download_failed(model_id: &str, component: ComponentKind) {
    metrics::counter!("asset_manager_downloads_failed_total",
        "model" => model_id.to_string(),
        "component" => component.to_string()
    )
    .increment(1);
}

/// Record statuses corrected by reconciliation
pub fn record_status_corrected(count: usize) {
    metrics::counter!("asset_manager_status_corrections_total").increment(count as u64);
}

/// Record one provider artifact written to disk
pub fn record_artifact_fetched(bytes: u64) {
    metrics::counter!("asset_manager_artifacts_fetched_total").increment(1);
    metrics::counter!("asset_manager_artifact_bytes_total").increment(bytes);
}

/// Update the gauge of models whose selected files are all on disk
pub fn update_ready_models(count: usize) {
    metrics::gauge!("asset_manager_ready_models").set(count as f64);
}
