//! Paginated, retrying record fetch for Bigin modules
//!
//! Turns a rate-limited, page-oriented HTTP API into one ordered record list
//! per module:
//!
//! 1. `PagedFetcher` asks `TokenAuthority` for a bearer token per attempt
//! 2. `PageSource` issues the request and hands back a classified `PageOutcome`
//! 3. The fetcher retries, backs off, or forces a token refresh per outcome
//! 4. Pages are appended in order until the API reports no more records
//!
//! A failed first page yields an empty result; a failed later page yields the
//! records gathered so far. Neither is an error to the caller.

pub mod classify;
pub mod error;
pub mod fetcher;
pub mod source;

pub use classify::{Page, PageOutcome, classify_response, parse_retry_after};
pub use error::{Error, Result};
pub use fetcher::{FetchOutcome, FetchPolicy, ModuleFetch, PagedFetcher, backoff_delay};
pub use source::{DEFAULT_AUTH_SCHEME, HttpPageSource, PageRequest, PageSource};
