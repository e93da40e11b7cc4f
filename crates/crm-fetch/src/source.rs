//! HTTP access to the Bigin list and field-metadata endpoints
//!
//! `PageSource` is the seam between the retry loop and the network. The
//! reqwest implementation issues exactly one request per call and converts
//! whatever happens into a `PageOutcome`; it never retries on its own.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, HeaderValue, RETRY_AFTER};
use serde::Deserialize;
use tracing::debug;

use crate::classify::{PageOutcome, classify_response};
use crate::error::{Error, Result};

/// Authorization scheme Zoho expects in front of the access token.
pub const DEFAULT_AUTH_SCHEME: &str = "Zoho-oauthtoken";

/// Timeout for the best-effort field list lookup.
const FIELDS_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Parameters of one list request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest<'a> {
    pub module: &'a str,
    /// 1-based page number
    pub page: u32,
    pub per_page: u32,
    /// Comma-separated API field names; `None` means the API's default set
    pub fields: Option<&'a str>,
}

/// Source of module pages and field metadata.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn PageSource>`).
pub trait PageSource: Send + Sync {
    /// Comma-separated field names for `module`, or `None` on any failure.
    fn module_fields<'a>(
        &'a self,
        module: &'a str,
        token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Option<String>> + Send + 'a>>;

    /// Issue one list request and classify the result.
    fn request_page<'a>(
        &'a self,
        request: PageRequest<'a>,
        token: &'a str,
    ) -> Pin<Box<dyn Future<Output = PageOutcome> + Send + 'a>>;
}

#[derive(Debug, Deserialize)]
struct FieldsBody {
    #[serde(default)]
    fields: Vec<FieldMeta>,
}

#[derive(Debug, Deserialize)]
struct FieldMeta {
    api_name: Option<String>,
}

/// reqwest-backed page source for `{base_url}/{module}`.
pub struct HttpPageSource {
    http: reqwest::Client,
    base_url: String,
    auth_scheme: String,
    timeout: Duration,
}

impl HttpPageSource {
    /// Build a source for `base_url` (e.g. `https://www.zohoapis.in/bigin/v2`).
    ///
    /// `timeout` applies to each list request.
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        auth_scheme: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let base_url = base_url.into();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(Error::InvalidBaseUrl(format!(
                "must start with http:// or https://, got: {base_url}"
            )));
        }
        let auth_scheme = auth_scheme.into();
        if auth_scheme.trim().is_empty() || HeaderValue::from_str(&auth_scheme).is_err() {
            return Err(Error::InvalidAuthScheme(auth_scheme));
        }
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
            auth_scheme,
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorization(&self, token: &str) -> String {
        format!("{} {}", self.auth_scheme, token)
    }

    async fn fetch_fields(&self, module: &str, token: &str) -> Option<String> {
        let url = format!("{}/settings/fields", self.base_url);
        let response = match self
            .http
            .get(&url)
            .query(&[("module", module)])
            .header(AUTHORIZATION, self.authorization(token))
            .timeout(FIELDS_REQUEST_TIMEOUT)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                debug!(module, error = %e, "field list request failed");
                return None;
            }
        };

        if response.status().as_u16() != 200 {
            debug!(module, status = response.status().as_u16(), "field list unavailable");
            return None;
        }

        let body = match response.json::<FieldsBody>().await {
            Ok(b) => b,
            Err(e) => {
                debug!(module, error = %e, "field list body unreadable");
                return None;
            }
        };

        let names: Vec<String> = body
            .fields
            .into_iter()
            .filter_map(|f| f.api_name)
            .filter(|n| !n.is_empty())
            .collect();
        if names.is_empty() {
            None
        } else {
            Some(names.join(","))
        }
    }

    async fn fetch_page(&self, request: PageRequest<'_>, token: &str) -> PageOutcome {
        let url = format!("{}/{}", self.base_url, request.module);
        let mut builder = self
            .http
            .get(&url)
            .query(&[
                ("page", request.page.to_string()),
                ("per_page", request.per_page.to_string()),
            ])
            .header(AUTHORIZATION, self.authorization(token))
            .timeout(self.timeout);
        if let Some(fields) = request.fields {
            builder = builder.query(&[("fields", fields)]);
        }

        let response = match builder.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return PageOutcome::Timeout,
            Err(e) => return PageOutcome::Transport(e.to_string()),
        };

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let body = match response.text().await {
            Ok(b) => b,
            Err(e) if e.is_timeout() => return PageOutcome::Timeout,
            Err(e) => return PageOutcome::Transport(format!("reading response body: {e}")),
        };

        classify_response(status, retry_after.as_deref(), &body)
    }
}

impl PageSource for HttpPageSource {
    fn module_fields<'a>(
        &'a self,
        module: &'a str,
        token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Option<String>> + Send + 'a>> {
        Box::pin(self.fetch_fields(module, token))
    }

    fn request_page<'a>(
        &'a self,
        request: PageRequest<'a>,
        token: &'a str,
    ) -> Pin<Box<dyn Future<Output = PageOutcome> + Send + 'a>> {
        Box::pin(self.fetch_page(request, token))
    }
}
