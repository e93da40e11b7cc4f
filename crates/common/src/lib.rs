//! Types shared by the bigin-sync crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
