//! Error types for fetcher construction
//!
//! Fetching itself never fails with an error: exhausted retries surface as an
//! empty or partial record list. These cover setup only.

/// Errors from building a page source.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),

    #[error("invalid auth scheme: {0}")]
    InvalidAuthScheme(String),
}

/// Result alias for fetch setup.
pub type Result<T> = std::result::Result<T, Error>;
