//! Run metrics
//!
//! A sync run is a batch job with no scrape endpoint, so counters are
//! rendered once at the end into a Prometheus textfile snapshot:
//!
//! - `bigin_sync_module_records_total` (counter): label `module`
//! - `bigin_sync_module_fetch_total` (counter): labels `module`, `outcome`

use std::path::Path;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::error::{Error, Result};

/// File name of the snapshot inside the output directory.
pub const SNAPSHOT_FILE: &str = "bigin-sync.prom";

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> std::result::Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Record the end of one module fetch.
pub fn record_module_fetch(module: &str, outcome: &str, records: usize) {
    metrics::counter!(
        "bigin_sync_module_fetch_total",
        "module" => module.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    metrics::counter!("bigin_sync_module_records_total", "module" => module.to_string())
        .increment(records as u64);
}

/// Render all recorded metrics into `dir/bigin-sync.prom`.
pub fn write_snapshot(handle: &PrometheusHandle, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .map_err(|e| Error::Export(format!("creating {}: {e}", dir.display())))?;
    let path = dir.join(SNAPSHOT_FILE);
    std::fs::write(&path, handle.render())
        .map_err(|e| Error::Export(format!("writing {}: {e}", path.display())))
}
