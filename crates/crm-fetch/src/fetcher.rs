//! Page loop and per-page retry policy

use std::sync::Arc;
use std::time::Duration;

use crm_auth::TokenAuthority;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::classify::{Page, PageOutcome};
use crate::source::{PageRequest, PageSource};

/// Retry and pacing knobs for one fetcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPolicy {
    pub per_page: u32,
    /// Attempts per page, including the first
    pub max_retries: u32,
    /// Pause between consecutive successful pages
    pub inter_page_delay: Duration,
    /// Wait after a timeout or connection failure
    pub transport_retry_delay: Duration,
    /// Wait after a 429 that carried no usable `Retry-After`
    pub default_retry_after: Duration,
    /// Ceiling on any rate-limit wait, whatever `Retry-After` asks for
    pub max_retry_after: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            per_page: 200,
            max_retries: 3,
            inter_page_delay: Duration::from_millis(500),
            transport_retry_delay: Duration::from_secs(2),
            default_retry_after: Duration::from_secs(60),
            max_retry_after: Duration::from_secs(300),
        }
    }
}

/// Exponential backoff for generic retryable statuses: `2^attempt` seconds,
/// with `attempt` counted from zero.
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.min(16))
}

/// How a module fetch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Every page was fetched
    Complete,
    /// `failed_page` exhausted its retries; earlier pages are kept
    Partial { failed_page: u32 },
    /// The first page exhausted its retries
    Failed,
}

impl FetchOutcome {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Partial { .. } => "partial",
            Self::Failed => "failed",
        }
    }
}

/// Records gathered for one module plus how the fetch ended.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleFetch {
    pub records: Vec<Value>,
    /// Pages successfully fetched
    pub pages: u32,
    pub outcome: FetchOutcome,
}

/// Fetches every page of a module, one request in flight at a time.
pub struct PagedFetcher {
    source: Arc<dyn PageSource>,
    authority: Arc<TokenAuthority>,
    policy: FetchPolicy,
}

impl PagedFetcher {
    pub fn new(
        source: Arc<dyn PageSource>,
        authority: Arc<TokenAuthority>,
        policy: FetchPolicy,
    ) -> Self {
        Self {
            source,
            authority,
            policy,
        }
    }

    /// All records of `module` in page order; empty when the first page fails.
    pub async fn fetch_module(&self, module: &str) -> Vec<Value> {
        self.fetch_module_report(module).await.records
    }

    /// Same as `fetch_module`, also reporting page count and outcome.
    pub async fn fetch_module_report(&self, module: &str) -> ModuleFetch {
        let fields = {
            let token = self.authority.get_valid_token().await;
            self.source.module_fields(module, &token).await
        };
        match &fields {
            Some(f) => debug!(
                module,
                field_count = f.split(',').count(),
                "using explicit field list"
            ),
            None => debug!(module, "field list unavailable, using default fields"),
        }

        let mut records = Vec::new();
        let mut page = 1u32;

        loop {
            let Some(fetched) = self.fetch_page(module, page, fields.as_deref()).await else {
                if page == 1 {
                    error!(module, "first page failed, no records fetched");
                    return ModuleFetch {
                        records,
                        pages: 0,
                        outcome: FetchOutcome::Failed,
                    };
                }
                warn!(
                    module,
                    failed_page = page,
                    records = records.len(),
                    "page failed, returning partial result"
                );
                return ModuleFetch {
                    records,
                    pages: page - 1,
                    outcome: FetchOutcome::Partial { failed_page: page },
                };
            };

            let count = fetched.records.len();
            records.extend(fetched.records);
            debug!(module, page, count, has_more = fetched.has_more, "page fetched");

            if !fetched.has_more {
                info!(module, pages = page, records = records.len(), "module fetched");
                return ModuleFetch {
                    records,
                    pages: page,
                    outcome: FetchOutcome::Complete,
                };
            }

            tokio::time::sleep(self.policy.inter_page_delay).await;
            page += 1;
        }
    }

    /// Fetch one page, retrying up to `max_retries` attempts.
    ///
    /// Returns `None` once every attempt has failed.
    #[instrument(skip(self, fields))]
    pub async fn fetch_page(
        &self,
        module: &str,
        page: u32,
        fields: Option<&str>,
    ) -> Option<Page> {
        let attempts = self.policy.max_retries;

        for attempt in 0..attempts {
            let token = self.authority.get_valid_token().await;
            let request = PageRequest {
                module,
                page,
                per_page: self.policy.per_page,
                fields,
            };

            let delay = match self.source.request_page(request, &token).await {
                PageOutcome::Success(p) => return Some(p),
                PageOutcome::AuthExpired => {
                    warn!(attempt, "access token rejected, forcing refresh");
                    self.authority.refresh().await;
                    None
                }
                PageOutcome::RateLimited { retry_after } => {
                    let requested = retry_after.unwrap_or(self.policy.default_retry_after);
                    let wait = requested.min(self.policy.max_retry_after);
                    if wait < requested {
                        warn!(
                            attempt,
                            requested_secs = requested.as_secs(),
                            wait_secs = wait.as_secs(),
                            "Retry-After above ceiling, clamping"
                        );
                    }
                    warn!(attempt, wait_secs = wait.as_secs_f64(), "rate limited");
                    Some(wait)
                }
                PageOutcome::Timeout => {
                    warn!(attempt, "request timed out");
                    Some(self.policy.transport_retry_delay)
                }
                PageOutcome::Transport(e) => {
                    warn!(attempt, error = %e, "request failed");
                    Some(self.policy.transport_retry_delay)
                }
                PageOutcome::Retryable { status, body } => {
                    warn!(attempt, status, body = %body, "unexpected status");
                    Some(backoff_delay(attempt))
                }
            };

            match delay {
                Some(delay) if attempt + 1 < attempts => tokio::time::sleep(delay).await,
                _ => {}
            }
        }

        error!(attempts, "page retries exhausted");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crm_auth::{
        Credential, MemoryCredentialStore, SeedCredential, TokenExchange, TokenResponse,
    };
    use serde_json::json;
    use std::collections::{HashMap, VecDeque};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    #[derive(Debug, Clone)]
    struct SeenRequest {
        page: u32,
        per_page: u32,
        fields: Option<String>,
        token: String,
        at: Instant,
    }

    /// Page source answering from a per-page script.
    ///
    /// An exhausted script answers 500.
    #[derive(Default)]
    struct ScriptedSource {
        fields: Option<String>,
        script: std::sync::Mutex<HashMap<u32, VecDeque<PageOutcome>>>,
        seen: std::sync::Mutex<Vec<SeenRequest>>,
    }

    impl ScriptedSource {
        fn new() -> Self {
            Self::default()
        }

        fn with_fields(mut self, fields: &str) -> Self {
            self.fields = Some(fields.into());
            self
        }

        fn on_page(self, page: u32, outcomes: Vec<PageOutcome>) -> Self {
            self.script
                .lock()
                .unwrap()
                .entry(page)
                .or_default()
                .extend(outcomes);
            self
        }

        fn seen(&self) -> Vec<SeenRequest> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl PageSource for ScriptedSource {
        fn module_fields<'a>(
            &'a self,
            _module: &'a str,
            _token: &'a str,
        ) -> Pin<Box<dyn Future<Output = Option<String>> + Send + 'a>> {
            let fields = self.fields.clone();
            Box::pin(async move { fields })
        }

        fn request_page<'a>(
            &'a self,
            request: PageRequest<'a>,
            token: &'a str,
        ) -> Pin<Box<dyn Future<Output = PageOutcome> + Send + 'a>> {
            self.seen.lock().unwrap().push(SeenRequest {
                page: request.page,
                per_page: request.per_page,
                fields: request.fields.map(str::to_owned),
                token: token.to_owned(),
                at: Instant::now(),
            });
            let outcome = self
                .script
                .lock()
                .unwrap()
                .get_mut(&request.page)
                .and_then(VecDeque::pop_front)
                .unwrap_or(PageOutcome::Retryable {
                    status: 500,
                    body: "unscripted".into(),
                });
            Box::pin(async move { outcome })
        }
    }

    /// Exchange handing out `at_1`, `at_2`, ... and counting calls.
    #[derive(Default)]
    struct CountingExchange {
        calls: AtomicUsize,
    }

    impl TokenExchange for CountingExchange {
        fn refresh<'a>(
            &'a self,
            _refresh_token: &'a str,
        ) -> Pin<Box<dyn Future<Output = crm_auth::Result<TokenResponse>> + Send + 'a>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Box::pin(async move {
                Ok(TokenResponse {
                    access_token: format!("at_{n}"),
                    expires_in: 3600,
                    refresh_token: None,
                })
            })
        }
    }

    fn records(ids: std::ops::Range<usize>) -> Vec<Value> {
        ids.map(|i| json!({ "id": i.to_string() })).collect()
    }

    fn page(ids: std::ops::Range<usize>, has_more: bool) -> PageOutcome {
        PageOutcome::Success(Page {
            records: records(ids),
            has_more,
        })
    }

    fn server_error() -> PageOutcome {
        PageOutcome::Retryable {
            status: 500,
            body: "internal".into(),
        }
    }

    /// Authority holding a token valid for an hour, so only forced refreshes hit the exchange.
    async fn authority(exchange: Arc<CountingExchange>) -> Arc<TokenAuthority> {
        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;
        let store = Arc::new(MemoryCredentialStore::with_row(Credential {
            service_id: "zoho_bigin".into(),
            access_token: "at_0".into(),
            refresh_token: Some("rt".into()),
            expires_at: Some(now_ms + 3_600_000),
        }));
        Arc::new(
            TokenAuthority::load("zoho_bigin", store, exchange, SeedCredential::default())
                .await
                .unwrap(),
        )
    }

    async fn fetcher(source: Arc<ScriptedSource>) -> (PagedFetcher, Arc<CountingExchange>) {
        let exchange = Arc::new(CountingExchange::default());
        let auth = authority(exchange.clone()).await;
        (
            PagedFetcher::new(source, auth, FetchPolicy::default()),
            exchange,
        )
    }

    fn ids(records: &[Value]) -> Vec<String> {
        records
            .iter()
            .map(|r| r["id"].as_str().unwrap().to_owned())
            .collect()
    }

    #[test]
    fn backoff_doubles_from_one_second() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(100), Duration::from_secs(1 << 16));
    }

    #[test]
    fn default_policy_values() {
        let policy = FetchPolicy::default();
        assert_eq!(policy.per_page, 200);
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.inter_page_delay, Duration::from_millis(500));
        assert_eq!(policy.transport_retry_delay, Duration::from_secs(2));
        assert_eq!(policy.default_retry_after, Duration::from_secs(60));
        assert_eq!(policy.max_retry_after, Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn pages_are_concatenated_in_order() {
        let source = Arc::new(
            ScriptedSource::new()
                .on_page(1, vec![page(0..200, true)])
                .on_page(2, vec![page(200..300, true)])
                .on_page(3, vec![page(0..0, false)]),
        );
        let (fetcher, _) = fetcher(source.clone()).await;

        let result = fetcher.fetch_module_report("Contacts").await;
        assert_eq!(result.outcome, FetchOutcome::Complete);
        assert_eq!(result.pages, 3);
        assert_eq!(result.records.len(), 300);
        let expected: Vec<String> = (0..300).map(|i| i.to_string()).collect();
        assert_eq!(ids(&result.records), expected);

        let pages: Vec<u32> = source.seen().iter().map(|r| r.page).collect();
        assert_eq!(pages, vec![1, 2, 3]);
        assert!(source.seen().iter().all(|r| r.per_page == 200));
    }

    #[tokio::test(start_paused = true)]
    async fn pages_are_spaced_by_inter_page_delay() {
        let source = Arc::new(
            ScriptedSource::new()
                .on_page(1, vec![page(0..1, true)])
                .on_page(2, vec![page(1..2, false)]),
        );
        let (fetcher, _) = fetcher(source.clone()).await;
        fetcher.fetch_module("Contacts").await;

        let seen = source.seen();
        assert_eq!(seen[1].at - seen[0].at, Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_forces_one_refresh_then_succeeds() {
        let source = Arc::new(
            ScriptedSource::new().on_page(1, vec![PageOutcome::AuthExpired, page(0..5, false)]),
        );
        let (fetcher, exchange) = fetcher(source.clone()).await;

        let records = fetcher.fetch_module("Contacts").await;
        assert_eq!(records.len(), 5);
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 1);

        let seen = source.seen();
        assert_eq!(seen[0].token, "at_0");
        assert_eq!(seen[1].token, "at_1");
        // Retry after a refresh is immediate
        assert_eq!(seen[1].at, seen[0].at);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_waits_for_retry_after() {
        let source = Arc::new(ScriptedSource::new().on_page(
            1,
            vec![
                PageOutcome::RateLimited {
                    retry_after: Some(Duration::from_secs(3)),
                },
                page(0..1, false),
            ],
        ));
        let (fetcher, _) = fetcher(source.clone()).await;

        assert_eq!(fetcher.fetch_module("Calls").await.len(), 1);
        let seen = source.seen();
        assert!(seen[1].at - seen[0].at >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_without_header_waits_default() {
        let source = Arc::new(ScriptedSource::new().on_page(
            1,
            vec![
                PageOutcome::RateLimited { retry_after: None },
                page(0..1, false),
            ],
        ));
        let (fetcher, _) = fetcher(source.clone()).await;

        fetcher.fetch_module("Calls").await;
        let seen = source.seen();
        assert_eq!(seen[1].at - seen[0].at, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_retry_after_is_clamped_to_ceiling() {
        let source = Arc::new(ScriptedSource::new().on_page(
            1,
            vec![
                PageOutcome::RateLimited {
                    retry_after: Some(Duration::from_secs(u64::MAX)),
                },
                page(0..1, false),
            ],
        ));
        let (fetcher, _) = fetcher(source.clone()).await;

        assert_eq!(fetcher.fetch_module("Calls").await.len(), 1);
        let seen = source.seen();
        assert_eq!(seen[1].at - seen[0].at, Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failures_wait_fixed_delay() {
        let source = Arc::new(ScriptedSource::new().on_page(
            1,
            vec![
                PageOutcome::Timeout,
                PageOutcome::Transport("connection reset".into()),
                page(0..2, false),
            ],
        ));
        let (fetcher, _) = fetcher(source.clone()).await;

        assert_eq!(fetcher.fetch_module("Tasks").await.len(), 2);
        let seen = source.seen();
        assert_eq!(seen[1].at - seen[0].at, Duration::from_secs(2));
        assert_eq!(seen[2].at - seen[1].at, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_first_page_yields_empty_result() {
        let source = Arc::new(
            ScriptedSource::new().on_page(1, vec![server_error(), server_error(), server_error()]),
        );
        let (fetcher, _) = fetcher(source.clone()).await;

        let started = Instant::now();
        let result = fetcher.fetch_module_report("Notes").await;
        assert!(result.records.is_empty());
        assert_eq!(result.pages, 0);
        assert_eq!(result.outcome, FetchOutcome::Failed);

        let seen = source.seen();
        assert_eq!(seen.len(), 3, "one request per attempt");
        assert_eq!(seen[1].at - seen[0].at, Duration::from_secs(1));
        assert_eq!(seen[2].at - seen[1].at, Duration::from_secs(2));
        // No sleep after the last attempt
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_later_page_keeps_earlier_records() {
        let source = Arc::new(
            ScriptedSource::new()
                .on_page(1, vec![page(0..50, true)])
                .on_page(2, vec![server_error(), server_error(), server_error()]),
        );
        let (fetcher, _) = fetcher(source.clone()).await;

        let result = fetcher.fetch_module_report("Accounts").await;
        assert_eq!(result.records.len(), 50);
        assert_eq!(result.pages, 1);
        assert_eq!(result.outcome, FetchOutcome::Partial { failed_page: 2 });
        assert!(source.seen().iter().all(|r| r.page <= 2));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_unauthorized_exhausts_attempts() {
        let source = Arc::new(ScriptedSource::new().on_page(
            1,
            vec![
                PageOutcome::AuthExpired,
                PageOutcome::AuthExpired,
                PageOutcome::AuthExpired,
            ],
        ));
        let (fetcher, exchange) = fetcher(source.clone()).await;

        assert!(fetcher.fetch_module("Events").await.is_empty());
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn field_list_is_sent_when_available() {
        let source = Arc::new(
            ScriptedSource::new()
                .with_fields("Last_Name,Email")
                .on_page(1, vec![page(0..1, false)]),
        );
        let (fetcher, _) = fetcher(source.clone()).await;
        fetcher.fetch_module("Contacts").await;
        assert_eq!(source.seen()[0].fields.as_deref(), Some("Last_Name,Email"));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_field_list_uses_default_fields() {
        let source = Arc::new(ScriptedSource::new().on_page(1, vec![page(0..1, false)]));
        let (fetcher, _) = fetcher(source.clone()).await;
        fetcher.fetch_module("Contacts").await;
        assert!(source.seen()[0].fields.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_first_page_is_complete() {
        let source = Arc::new(ScriptedSource::new().on_page(1, vec![page(0..0, false)]));
        let (fetcher, _) = fetcher(source).await;

        let result = fetcher.fetch_module_report("Pipelines").await;
        assert!(result.records.is_empty());
        assert_eq!(result.outcome, FetchOutcome::Complete);
    }

    #[test]
    fn outcome_labels() {
        assert_eq!(FetchOutcome::Complete.as_str(), "complete");
        assert_eq!(FetchOutcome::Partial { failed_page: 4 }.as_str(), "partial");
        assert_eq!(FetchOutcome::Failed.as_str(), "failed");
    }
}
