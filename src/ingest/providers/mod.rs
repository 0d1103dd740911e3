// src/ingest/providers/mod.rs
//! Concrete source adapters. Adding a platform means adding a module here,
//! not touching the pipeline.

pub mod http_json;
pub mod rss;

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;

use crate::error::FetchError;

pub use http_json::{HttpJsonSource, IdWatermark};
pub use rss::{RssCursor, RssSource};

/// Default timeout for a single HTTP fetch.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(20);

pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .user_agent(concat!("social-sentiment-analyzer/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "falling back to default http client");
            reqwest::Client::new()
        })
}

/// Map a non-success HTTP status to the fetch taxonomy.
pub(crate) fn classify_status(source_id: &str, status: StatusCode, headers: &HeaderMap) -> FetchError {
    let source_id = source_id.to_string();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FetchError::AuthFailure {
            source_id,
            reason: format!("http {status}"),
        },
        StatusCode::TOO_MANY_REQUESTS => FetchError::RateLimited {
            source_id,
            retry_after: parse_retry_after(headers),
        },
        s if s.is_server_error() || s == StatusCode::REQUEST_TIMEOUT => {
            FetchError::SourceUnavailable {
                source_id,
                reason: format!("http {status}"),
            }
        }
        _ => FetchError::Protocol {
            source_id,
            reason: format!("unexpected http {status}"),
        },
    }
}

/// Transport errors (connect, timeout, reset) are transient.
pub(crate) fn classify_transport(source_id: &str, err: &reqwest::Error) -> FetchError {
    if err.is_decode() || err.is_builder() {
        return FetchError::Protocol {
            source_id: source_id.to_string(),
            reason: err.to_string(),
        };
    }
    FetchError::SourceUnavailable {
        source_id: source_id.to_string(),
        reason: err.to_string(),
    }
}

/// `Retry-After` as delta-seconds or an HTTP date.
pub(crate) fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = chrono::DateTime::parse_from_rfc2822(raw).ok()?;
    let delta = at.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn status_mapping() {
        let h = HeaderMap::new();
        assert!(matches!(
            classify_status("s", StatusCode::UNAUTHORIZED, &h),
            FetchError::AuthFailure { .. }
        ));
        assert!(matches!(
            classify_status("s", StatusCode::FORBIDDEN, &h),
            FetchError::AuthFailure { .. }
        ));
        assert!(matches!(
            classify_status("s", StatusCode::SERVICE_UNAVAILABLE, &h),
            FetchError::SourceUnavailable { .. }
        ));
        assert!(matches!(
            classify_status("s", StatusCode::NOT_FOUND, &h),
            FetchError::Protocol { .. }
        ));
    }

    #[test]
    fn retry_after_seconds() {
        let mut h = HeaderMap::new();
        h.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        let e = classify_status("s", StatusCode::TOO_MANY_REQUESTS, &h);
        assert_eq!(e.retry_after(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn retry_after_past_date_is_zero() {
        let mut h = HeaderMap::new();
        h.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&h), Some(Duration::ZERO));
    }
}
