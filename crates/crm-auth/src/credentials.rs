//! Credential storage for OAuth tokens
//!
//! One row per service id holding the access token, refresh token and expiry.
//! Writes are idempotent upserts keyed by service id, and an absent or empty
//! refresh token never replaces a stored one.
//!
//! `FileCredentialStore` keeps the rows in a JSON file. All writes use atomic
//! temp-file + rename so a crash mid-write leaves the previous file intact. A
//! tokio Mutex serializes concurrent writers.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// A single service's OAuth credentials.
///
/// `expires_at` is a unix timestamp in milliseconds (absolute, not a delta).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub service_id: String,
    /// Current access token (sent with every API call)
    pub access_token: String,
    /// Long-lived token used to mint new access tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Expiration as unix timestamp in milliseconds, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Durable key-value persistence for per-service OAuth state.
///
/// Uses `Pin<Box<dyn Future>>` return types so the authority can hold an
/// `Arc<dyn CredentialStore>`.
pub trait CredentialStore: Send + Sync {
    /// Fetch the row for `service_id`, if one exists.
    fn get_row<'a>(&'a self, service_id: &'a str) -> StoreFuture<'a, Option<Credential>>;

    /// Insert or update the row for `service_id`.
    ///
    /// `refresh_token` of `None` (or an empty string) keeps the stored value.
    /// `expires_at` replaces the stored value as given.
    fn upsert<'a>(
        &'a self,
        service_id: &'a str,
        access_token: &'a str,
        refresh_token: Option<&'a str>,
        expires_at: Option<u64>,
    ) -> StoreFuture<'a, ()>;
}

/// Apply upsert semantics to an in-memory row map.
fn apply_upsert(
    rows: &mut HashMap<String, Credential>,
    service_id: &str,
    access_token: &str,
    refresh_token: Option<&str>,
    expires_at: Option<u64>,
) {
    let refresh_token = refresh_token.filter(|r| !r.is_empty()).map(str::to_owned);
    match rows.get_mut(service_id) {
        Some(row) => {
            row.access_token = access_token.to_owned();
            if refresh_token.is_some() {
                row.refresh_token = refresh_token;
            }
            row.expires_at = expires_at;
        }
        None => {
            rows.insert(
                service_id.to_owned(),
                Credential {
                    service_id: service_id.to_owned(),
                    access_token: access_token.to_owned(),
                    refresh_token,
                    expires_at,
                },
            );
        }
    }
}

/// JSON file backed credential store.
///
/// The Mutex serializes all writes. Reads acquire the lock briefly to clone a
/// row out of the in-memory map.
pub struct FileCredentialStore {
    path: PathBuf,
    state: Mutex<HashMap<String, Credential>>,
}

impl FileCredentialStore {
    /// Load credentials from the given file path.
    ///
    /// If the file doesn't exist, creates it as `{}`. The first run then falls
    /// back to seed tokens from configuration and persists after the first
    /// successful refresh.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
            let rows: HashMap<String, Credential> = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;
            info!(path = %path.display(), services = rows.len(), "loaded credentials");
            rows
        } else {
            info!(path = %path.display(), "credential file not found, starting with empty store");
            let rows = HashMap::new();
            write_atomic(&path, &rows).await?;
            rows
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Number of stored rows.
    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl CredentialStore for FileCredentialStore {
    fn get_row<'a>(&'a self, service_id: &'a str) -> StoreFuture<'a, Option<Credential>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.get(service_id).cloned())
        })
    }

    fn upsert<'a>(
        &'a self,
        service_id: &'a str,
        access_token: &'a str,
        refresh_token: Option<&'a str>,
        expires_at: Option<u64>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            // Write a candidate map first so a failed write leaves memory and disk in agreement
            let mut next = state.clone();
            apply_upsert(&mut next, service_id, access_token, refresh_token, expires_at);
            write_atomic(&self.path, &next).await?;
            *state = next;
            debug!(service_id, "upserted credential");
            Ok(())
        })
    }
}

/// In-process credential store with the same upsert semantics.
///
/// Nothing survives the process; useful for one-shot runs and tests.
#[derive(Default)]
pub struct MemoryCredentialStore {
    state: Mutex<HashMap<String, Credential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with one row.
    pub fn with_row(credential: Credential) -> Self {
        let mut rows = HashMap::new();
        rows.insert(credential.service_id.clone(), credential);
        Self {
            state: Mutex::new(rows),
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get_row<'a>(&'a self, service_id: &'a str) -> StoreFuture<'a, Option<Credential>> {
        Box::pin(async move { Ok(self.state.lock().await.get(service_id).cloned()) })
    }

    fn upsert<'a>(
        &'a self,
        service_id: &'a str,
        access_token: &'a str,
        refresh_token: Option<&'a str>,
        expires_at: Option<u64>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            apply_upsert(&mut state, service_id, access_token, refresh_token, expires_at);
            Ok(())
        })
    }
}

/// Write credentials to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over the
/// target. Sets file permissions to 0600 since the file holds OAuth tokens.
async fn write_atomic(path: &Path, data: &HashMap<String, Credential>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;

    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d,
        Some(_) => Path::new("."),
        None => return Err(Error::Io("credential path has no parent directory".into())),
    };

    let file_name = path
        .file_name()
        .ok_or_else(|| Error::Io("credential path has no file name".into()))?
        .to_string_lossy();
    // Temp name is per target file so stores sharing a directory never collide
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credentials");
    Ok(())
}
