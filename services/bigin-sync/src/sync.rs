//! One sync run over the configured modules
//!
//! Modules are fetched strictly one after another. A module counts as
//! synced when it produced at least one record; the run fails only when
//! none did.

use std::path::{Path, PathBuf};

use crm_fetch::{FetchOutcome, PagedFetcher};
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::export;
use crate::flatten::{FlatRow, flatten_record};
use crate::metrics;

/// Result of one module within a run.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleSummary {
    pub module: String,
    pub records: usize,
    pub outcome: FetchOutcome,
    /// Export file, when the module produced records
    pub path: Option<PathBuf>,
}

/// Per-module results of a run, in fetch order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub modules: Vec<ModuleSummary>,
}

impl RunSummary {
    /// Modules that produced at least one record.
    pub fn synced(&self) -> usize {
        self.modules.iter().filter(|m| m.records > 0).count()
    }
}

/// Fetch, flatten and export every module in order.
///
/// Returns `Error::NoData` when no module produced a record, and
/// `Error::Export` as soon as a file cannot be written.
pub async fn run_sync(
    fetcher: &PagedFetcher,
    modules: &[String],
    output_dir: &Path,
    timestamp: &str,
) -> Result<RunSummary> {
    let mut summary = RunSummary::default();

    for module in modules.iter().map(|m| m.trim()).filter(|m| !m.is_empty()) {
        let fetched = fetcher.fetch_module_report(module).await;
        let records = fetched.records.len();
        metrics::record_module_fetch(module, fetched.outcome.as_str(), records);

        let path = if records == 0 {
            match fetched.outcome {
                FetchOutcome::Failed => warn!(module, "module fetch failed, skipping export"),
                _ => info!(module, "module has no records, skipping export"),
            }
            None
        } else {
            let rows: Vec<FlatRow> = fetched.records.iter().map(flatten_record).collect();
            let path = export::write_module(output_dir, module, timestamp, &rows)?;
            info!(
                module,
                records,
                outcome = fetched.outcome.as_str(),
                path = %path.display(),
                "module exported"
            );
            Some(path)
        };

        summary.modules.push(ModuleSummary {
            module: module.to_owned(),
            records,
            outcome: fetched.outcome,
            path,
        });
    }

    let attempted = summary.modules.len();
    let synced = summary.synced();
    info!("fetched {synced}/{attempted} modules");

    if synced == 0 {
        error!(attempted, "no data fetched");
        return Err(Error::NoData { attempted });
    }

    Ok(summary)
}
