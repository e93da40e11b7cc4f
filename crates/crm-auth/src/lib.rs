//! OAuth credential lifecycle for the Bigin sync job
//!
//! Owns everything between "a refresh token exists somewhere" and "here is a
//! bearer token for the next API call":
//!
//! 1. `CredentialStore` persists one credential row per service id
//! 2. `TokenExchange` trades a refresh token for a new access token
//! 3. `TokenAuthority` decides when to refresh, serializes refreshes, and
//!    writes every successful refresh back through the store
//!
//! The authority never returns an error to callers asking for a token. A
//! failed refresh hands back the last known access token; the API rejects it
//! with 401 and the fetch layer forces another refresh.

pub mod authority;
pub mod constants;
pub mod credentials;
pub mod error;
pub mod token;

pub use authority::{SeedCredential, TokenAuthority};
pub use constants::*;
pub use credentials::{
    Credential, CredentialStore, FileCredentialStore, MemoryCredentialStore, StoreFuture,
};
pub use error::{Error, Result};
pub use token::{HttpTokenExchange, OAuthClient, TokenExchange, TokenResponse, refresh_token};
