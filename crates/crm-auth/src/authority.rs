//! Access-token authority for one OAuth service
//!
//! Holds the in-memory credential, decides when it must be refreshed, and
//! writes every successful refresh back through the `CredentialStore`.
//!
//! Refresh happens in two ways:
//! - proactively, when `get_valid_token()` sees the expiry within
//!   `REFRESH_MARGIN` (or no expiry recorded at all)
//! - reactively, when the fetch layer receives 401 and calls `refresh()`
//!
//! All state lives behind one tokio Mutex held across the whole exchange and
//! persist, so two callers can never refresh concurrently and lose a rotated
//! refresh token.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::constants::REFRESH_MARGIN;
use crate::credentials::CredentialStore;
use crate::error::Result;
use crate::token::TokenExchange;

/// Static fallback tokens used when the store has no row for the service.
#[derive(Debug, Clone, Default)]
pub struct SeedCredential {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

#[derive(Debug)]
struct TokenState {
    access_token: String,
    refresh_token: Option<String>,
    /// Unix milliseconds
    expires_at: Option<u64>,
    /// A refresh succeeded but its store write has not landed yet
    persist_pending: bool,
}

/// Supplies a currently-valid bearer token, refreshing transparently.
pub struct TokenAuthority {
    service_id: String,
    store: Arc<dyn CredentialStore>,
    exchange: Arc<dyn TokenExchange>,
    state: Mutex<TokenState>,
}

impl TokenAuthority {
    /// Seed the authority from the store row for `service_id`.
    ///
    /// Falls back to `seed` when no row exists. A store read error is
    /// returned; there is nothing sensible to fall back to when the store
    /// itself is broken.
    pub async fn load(
        service_id: impl Into<String>,
        store: Arc<dyn CredentialStore>,
        exchange: Arc<dyn TokenExchange>,
        seed: SeedCredential,
    ) -> Result<Self> {
        let service_id = service_id.into();
        let state = match store.get_row(&service_id).await? {
            Some(row) => {
                info!(
                    service_id,
                    has_refresh_token = row.refresh_token.is_some(),
                    has_expiry = row.expires_at.is_some(),
                    "loaded stored credential"
                );
                TokenState {
                    access_token: row.access_token,
                    refresh_token: non_empty(row.refresh_token),
                    expires_at: row.expires_at,
                    persist_pending: false,
                }
            }
            None => {
                warn!(
                    service_id,
                    "no stored credential, falling back to configured seed tokens"
                );
                TokenState {
                    access_token: seed.access_token.unwrap_or_default(),
                    refresh_token: non_empty(seed.refresh_token),
                    expires_at: None,
                    persist_pending: false,
                }
            }
        };

        Ok(Self {
            service_id,
            store,
            exchange,
            state: Mutex::new(state),
        })
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Recorded expiry in unix milliseconds, if known.
    pub async fn expires_at(&self) -> Option<u64> {
        self.state.lock().await.expires_at
    }

    /// Return an access token, refreshing first if it is expired or close to it.
    ///
    /// Without a refresh token the current access token is returned as-is. A
    /// failed refresh also returns the current (stale) token; the API will
    /// reject it with 401 and the caller forces a refresh then.
    pub async fn get_valid_token(&self) -> String {
        let mut state = self.state.lock().await;

        if state.persist_pending {
            // Retry the store write left over from an earlier refresh
            let _ = self.persist(&mut state).await;
        }

        if state.refresh_token.is_none() {
            return state.access_token.clone();
        }

        if needs_refresh(state.expires_at, now_millis()) {
            debug!(service_id = %self.service_id, "access token expired or expiring, refreshing");
            self.refresh_locked(&mut state).await;
        }

        state.access_token.clone()
    }

    /// Force a refresh regardless of the recorded expiry.
    ///
    /// Returns whether a new access token was obtained. Never errors; failures
    /// are logged and leave the in-memory credential unchanged.
    pub async fn refresh(&self) -> bool {
        let mut state = self.state.lock().await;
        self.refresh_locked(&mut state).await
    }

    /// Retry a pending store write, if any.
    ///
    /// Call before exiting so a rotated refresh token is not lost with the
    /// process.
    pub async fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.persist_pending {
            return Ok(());
        }
        self.persist(&mut state).await
    }

    async fn refresh_locked(&self, state: &mut TokenState) -> bool {
        let Some(current_refresh) = state.refresh_token.clone() else {
            warn!(service_id = %self.service_id, "no refresh token held, cannot refresh");
            return false;
        };

        let response = match self.exchange.refresh(&current_refresh).await {
            Ok(r) => r,
            Err(e) => {
                warn!(service_id = %self.service_id, error = %e, "token refresh failed");
                return false;
            }
        };

        let now = now_millis();
        state.access_token = response.access_token;
        state.expires_at = Some(now.saturating_add(response.expires_in.saturating_mul(1000)));
        if let Some(rotated) = non_empty(response.refresh_token) {
            if rotated != current_refresh {
                info!(service_id = %self.service_id, "refresh token rotated");
            }
            state.refresh_token = Some(rotated);
        }
        state.persist_pending = true;

        info!(
            service_id = %self.service_id,
            expires_in_secs = response.expires_in,
            "access token refreshed"
        );

        // The new token is usable even if this write fails; it stays pending
        let _ = self.persist(state).await;
        true
    }

    async fn persist(&self, state: &mut TokenState) -> Result<()> {
        match self
            .store
            .upsert(
                &self.service_id,
                &state.access_token,
                state.refresh_token.as_deref(),
                state.expires_at,
            )
            .await
        {
            Ok(()) => {
                state.persist_pending = false;
                debug!(service_id = %self.service_id, "persisted refreshed credential");
                Ok(())
            }
            Err(e) => {
                error!(
                    service_id = %self.service_id,
                    error = %e,
                    "failed to persist refreshed credential, will retry"
                );
                Err(e)
            }
        }
    }
}

/// Whether a token with the given expiry must be refreshed at `now_ms`.
///
/// Unknown expiry always refreshes.
pub fn needs_refresh(expires_at: Option<u64>, now_ms: u64) -> bool {
    match expires_at {
        None => true,
        Some(exp) => now_ms >= exp.saturating_sub(REFRESH_MARGIN.as_millis() as u64),
    }
}

fn non_empty(token: Option<String>) -> Option<String> {
    token.filter(|t| !t.is_empty())
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
