//! Classification of list-API responses
//!
//! Every page attempt ends in exactly one `PageOutcome`. The fetcher's retry
//! loop matches on it instead of on transport errors, so expected conditions
//! (expired token, rate limit) are plain values.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

/// Longest response body excerpt carried in a `Retryable` outcome.
const BODY_EXCERPT_CHARS: usize = 200;

/// One page of records and whether the API holds more.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Page {
    pub records: Vec<Value>,
    pub has_more: bool,
}

/// Result of a single page attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum PageOutcome {
    /// 200 with a parsed body, or 204 (empty, no more pages)
    Success(Page),
    /// 401: the access token is stale, refresh and retry
    AuthExpired,
    /// 429: wait `retry_after` (or the policy default when absent)
    RateLimited { retry_after: Option<Duration> },
    /// Request timed out before a response arrived
    Timeout,
    /// Connection failure or unreadable response
    Transport(String),
    /// Any other status, retried with exponential backoff
    Retryable { status: u16, body: String },
}

#[derive(Debug, Deserialize)]
struct ListBody {
    #[serde(default)]
    data: Vec<Value>,
    #[serde(default)]
    info: ListInfo,
}

#[derive(Debug, Default, Deserialize)]
struct ListInfo {
    #[serde(default)]
    more_records: bool,
}

/// Classify a list response by HTTP status, `Retry-After` header and body.
pub fn classify_response(status: u16, retry_after: Option<&str>, body: &str) -> PageOutcome {
    match status {
        200 => match parse_page(body) {
            Ok(page) => PageOutcome::Success(page),
            Err(e) => PageOutcome::Transport(format!("invalid page body: {e}")),
        },
        204 => PageOutcome::Success(Page::default()),
        401 => PageOutcome::AuthExpired,
        429 => PageOutcome::RateLimited {
            retry_after: parse_retry_after(retry_after),
        },
        _ => PageOutcome::Retryable {
            status,
            body: body.chars().take(BODY_EXCERPT_CHARS).collect(),
        },
    }
}

/// Parse a `Retry-After` header given in whole seconds.
///
/// HTTP-date values and garbage yield `None`, leaving the wait to the
/// caller's default.
pub fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Parse `{ data: [...], info: { more_records } }`; missing parts mean empty / false.
pub fn parse_page(body: &str) -> Result<Page, serde_json::Error> {
    let parsed: ListBody = serde_json::from_str(body)?;
    Ok(Page {
        records: parsed.data,
        has_more: parsed.info.more_records,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ok_body_yields_records_and_more_flag() {
        let body = json!({
            "data": [{"id": "1"}, {"id": "2"}],
            "info": {"more_records": true, "page": 1, "per_page": 2}
        })
        .to_string();

        match classify_response(200, None, &body) {
            PageOutcome::Success(page) => {
                assert_eq!(page.records.len(), 2);
                assert_eq!(page.records[0]["id"], "1");
                assert!(page.has_more);
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn ok_body_without_info_means_last_page() {
        let outcome = classify_response(200, None, r#"{"data":[{"id":"1"}]}"#);
        match outcome {
            PageOutcome::Success(page) => {
                assert_eq!(page.records.len(), 1);
                assert!(!page.has_more);
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn ok_body_without_data_is_empty_page() {
        let outcome = classify_response(200, None, r#"{"info":{"more_records":false}}"#);
        assert_eq!(outcome, PageOutcome::Success(Page::default()));
    }

    #[test]
    fn unparseable_ok_body_is_transport_failure() {
        let outcome = classify_response(200, None, "<html>maintenance</html>");
        assert!(matches!(outcome, PageOutcome::Transport(_)), "{outcome:?}");
    }

    #[test]
    fn no_content_is_final_empty_page() {
        assert_eq!(
            classify_response(204, None, ""),
            PageOutcome::Success(Page {
                records: vec![],
                has_more: false
            })
        );
    }

    #[test]
    fn unauthorized_is_auth_expired() {
        assert_eq!(
            classify_response(401, None, r#"{"code":"INVALID_TOKEN"}"#),
            PageOutcome::AuthExpired
        );
    }

    #[test]
    fn too_many_requests_carries_retry_after() {
        assert_eq!(
            classify_response(429, Some("3"), ""),
            PageOutcome::RateLimited {
                retry_after: Some(Duration::from_secs(3))
            }
        );
        assert_eq!(
            classify_response(429, None, ""),
            PageOutcome::RateLimited { retry_after: None }
        );
    }

    #[test]
    fn retry_after_rejects_non_numeric_values() {
        assert_eq!(parse_retry_after(Some(" 12 ")), Some(Duration::from_secs(12)));
        assert_eq!(parse_retry_after(Some("Wed, 21 Oct 2015 07:28:00 GMT")), None);
        assert_eq!(parse_retry_after(Some("-1")), None);
        assert_eq!(parse_retry_after(None), None);
    }

    #[test]
    fn other_statuses_are_retryable_with_excerpt() {
        for status in [400, 403, 404, 500, 502, 503] {
            let outcome = classify_response(status, None, "error");
            assert_eq!(
                outcome,
                PageOutcome::Retryable {
                    status,
                    body: "error".into()
                }
            );
        }

        let long = "x".repeat(1000);
        match classify_response(500, None, &long) {
            PageOutcome::Retryable { body, .. } => assert_eq!(body.len(), 200),
            other => panic!("expected retryable, got {other:?}"),
        }
    }
}
