//! Upstream HTTP client
//!
//! Everything the gateway fetches from the modern web goes through the
//! [`Fetcher`] trait:
//! - pages and feeds for passthrough and site rewriters
//! - images for the re-encoder
//! - archive lookups and language-model calls
//!
//! [`UpstreamClient`] is the reqwest-backed implementation: TLS (the legacy
//! client never sees it), transparent decompression, cookies and fixed
//! timeouts. No retries.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use http::{Method, StatusCode};
use reqwest::Client;
use tracing::{debug, info, instrument};

use crate::error::{GatewayError, Result};

/// Default upstream timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Request headers copied from the legacy client to the upstream.
pub const FORWARDED_HEADERS: &[&str] = &[
    "accept",
    "accept-language",
    "referer",
    "user-agent",
    "cookie",
    "content-type",
];

/// An outbound request.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UpstreamRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn post_json(url: impl Into<String>, body: &serde_json::Value) -> Self {
        let mut request = Self {
            method: Method::POST,
            url: url.into(),
            headers: HeaderMap::new(),
            body: Bytes::from(body.to_string()),
        };
        request
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        request
    }

    /// Add a header. Invalid names or values are skipped.
    #[must_use]
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }
}

/// A fully buffered upstream response.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// URL after redirects.
    pub final_url: String,
}

impl UpstreamResponse {
    /// `Content-Type` without parameters, lowercased.
    pub fn content_type(&self) -> Option<String> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or_default().trim().to_ascii_lowercase())
    }

    /// Body decoded as UTF-8, invalid sequences replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Fail on non-2xx statuses.
    pub fn error_for_status(self) -> Result<Self> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(GatewayError::UpstreamStatus {
                url: self.final_url,
                status: self.status,
            })
        }
    }
}

/// Performs upstream fetches.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: UpstreamRequest) -> Result<UpstreamResponse>;
}

/// reqwest-backed [`Fetcher`].
pub struct UpstreamClient {
    client: Client,
    user_agent: Option<HeaderValue>,
}

impl UpstreamClient {
    /// Build a client. `user_agent` replaces whatever the legacy client sent.
    pub fn new(user_agent: Option<&str>, timeout: Duration) -> std::result::Result<Self, reqwest::Error> {
        let client = Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .use_rustls_tls()
            .brotli(true)
            .zstd(true)
            .gzip(true)
            .deflate(true)
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .cookie_store(true)
            .build()?;

        Ok(Self {
            client,
            user_agent: user_agent.and_then(|ua| HeaderValue::from_str(ua).ok()),
        })
    }
}

#[async_trait]
impl Fetcher for UpstreamClient {
    #[instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn fetch(&self, request: UpstreamRequest) -> Result<UpstreamResponse> {
        debug!("Fetching upstream");
        let mut headers = request.headers;
        if let Some(ua) = &self.user_agent {
            headers.insert(USER_AGENT, ua.clone());
        }

        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .headers(headers);
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| GatewayError::upstream(&request.url, e))?;

        let status = response.status();
        let final_url = response.url().to_string();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| GatewayError::upstream(&request.url, e))?;

        info!(
            status = %status,
            bytes = body.len(),
            content_type = ?headers.get(CONTENT_TYPE),
            "Response received"
        );

        Ok(UpstreamResponse {
            status,
            headers,
            body,
            final_url,
        })
    }
}

/// Lowercased host of an absolute URL.
pub fn host_of(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
}

/// Whether `host` is `domain` or one of its subdomains.
pub fn host_matches(host: &str, domain: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    let domain = domain.trim_start_matches('.').to_ascii_lowercase();
    if domain.is_empty() {
        return false;
    }
    host == domain
        || host
            .strip_suffix(domain.as_str())
            .is_some_and(|rest| rest.ends_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_matching_respects_dot_boundary() {
        assert!(host_matches("reddit.com", "reddit.com"));
        assert!(host_matches("old.reddit.com", "reddit.com"));
        assert!(host_matches("WWW.Reddit.com.", "reddit.com"));
        assert!(!host_matches("notreddit.com", "reddit.com"));
        assert!(!host_matches("reddit.com.evil", "reddit.com"));
        assert!(!host_matches("reddit.com", ""));
    }

    #[test]
    fn host_extraction() {
        assert_eq!(host_of("http://Example.COM:8080/x").as_deref(), Some("example.com"));
        assert_eq!(host_of("/relative"), None);
    }

    #[test]
    fn builder_headers() {
        let request = UpstreamRequest::get("http://example.com/")
            .header("Accept", "text/html")
            .header("bad header", "x");
        assert_eq!(request.headers.len(), 1);
        assert_eq!(request.headers["accept"], "text/html");
    }

    #[test]
    fn content_type_drops_parameters() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("Text/HTML; charset=utf-8"));
        let response = UpstreamResponse {
            status: StatusCode::OK,
            headers,
            body: Bytes::from_static(b"hi"),
            final_url: "http://example.com/".into(),
        };
        assert_eq!(response.content_type().as_deref(), Some("text/html"));
        assert_eq!(response.text(), "hi");
        assert!(response.error_for_status().is_ok());
    }

    #[test]
    fn non_success_status_is_an_error() {
        let response = UpstreamResponse {
            status: StatusCode::BAD_GATEWAY,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            final_url: "http://example.com/".into(),
        };
        let err = response.error_for_status().unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamStatus { status, .. } if status == StatusCode::BAD_GATEWAY));
    }

    #[tokio::test]
    async fn client_builds() {
        let client = UpstreamClient::new(Some("Mozilla/1.1"), Duration::from_secs(5));
        assert!(client.is_ok());
    }
}
