//! Service-specific error types

use thiserror::Error;

/// Run-level failures of a sync run.
///
/// Per-page and per-refresh failures never get here: the fetch layer turns
/// them into empty or partial module results.
#[derive(Error, Debug)]
pub enum Error {
    #[error("no module produced any records ({attempted} attempted)")]
    NoData { attempted: usize },

    #[error("export failed: {0}")]
    Export(String),
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;
