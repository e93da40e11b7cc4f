//! OAuth refresh-token exchange
//!
//! Zoho's token endpoint takes the refresh grant as query parameters on a
//! POST and answers with `{ access_token, expires_in, refresh_token? }`. Some
//! rejections arrive as HTTP 200 with an `error` field instead of a token, so
//! the body is checked before it is trusted.

use std::future::Future;
use std::pin::Pin;

use common::Secret;
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_EXPIRES_IN_SECS, TOKEN_REQUEST_TIMEOUT};
use crate::error::{Error, Result};

/// Successful response from the token endpoint.
///
/// `expires_in` is a delta in seconds from the response time. The refresh
/// token is present only when the server rotates it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    /// Seconds until the access token expires (delta, not absolute)
    #[serde(default = "default_expires_in")]
    pub expires_in: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

fn default_expires_in() -> u64 {
    DEFAULT_EXPIRES_IN_SECS
}

/// Raw endpoint body, before we know whether it is a token or an error.
#[derive(Debug, Deserialize)]
struct RawTokenBody {
    access_token: Option<String>,
    expires_in: Option<u64>,
    refresh_token: Option<String>,
    error: Option<String>,
}

/// Registered OAuth client credentials.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: Secret<String>,
}

/// Trades a refresh token for a new access token.
///
/// The authority depends on this trait rather than on reqwest so tests can
/// count and script refresh attempts.
pub trait TokenExchange: Send + Sync {
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TokenResponse>> + Send + 'a>>;
}

/// Token exchange against a real OAuth token endpoint.
pub struct HttpTokenExchange {
    http: reqwest::Client,
    token_url: String,
    client: OAuthClient,
}

impl HttpTokenExchange {
    pub fn new(http: reqwest::Client, token_url: impl Into<String>, client: OAuthClient) -> Self {
        Self {
            http,
            token_url: token_url.into(),
            client,
        }
    }
}

impl TokenExchange for HttpTokenExchange {
    fn refresh<'a>(
        &'a self,
        refresh: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TokenResponse>> + Send + 'a>> {
        Box::pin(refresh_token(
            &self.http,
            &self.token_url,
            &self.client,
            refresh,
        ))
    }
}

/// Refresh an access token using a refresh token.
///
/// Called proactively when the stored expiry is near and reactively when the
/// API answers 401.
pub async fn refresh_token(
    http: &reqwest::Client,
    token_url: &str,
    client: &OAuthClient,
    refresh: &str,
) -> Result<TokenResponse> {
    let response = http
        .post(token_url)
        .query(&[
            ("refresh_token", refresh),
            ("client_id", client.client_id.as_str()),
            ("client_secret", client.client_secret.expose().as_str()),
            ("grant_type", "refresh_token"),
        ])
        .timeout(TOKEN_REQUEST_TIMEOUT)
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        let body = truncate(&body, 200);

        // 401/403 means the refresh token or client is revoked or invalid
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::InvalidCredentials(format!(
                "refresh token rejected ({status}): {body}"
            )));
        }

        return Err(Error::TokenExchange(format!(
            "token refresh returned {status}: {body}"
        )));
    }

    let raw = response
        .json::<RawTokenBody>()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid refresh response: {e}")))?;

    match raw {
        RawTokenBody {
            access_token: Some(access_token),
            expires_in,
            refresh_token,
            ..
        } if !access_token.is_empty() => Ok(TokenResponse {
            access_token,
            expires_in: expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS),
            refresh_token,
        }),
        RawTokenBody {
            error: Some(error), ..
        } => Err(Error::TokenExchange(format!(
            "token endpoint reported error: {error}"
        ))),
        _ => Err(Error::TokenExchange(
            "token response carried no access_token".into(),
        )),
    }
}

/// Clip a response body for log and error messages.
fn truncate(body: &str, max_chars: usize) -> String {
    body.chars().take(max_chars).collect()
}
