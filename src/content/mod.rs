//! Content-type-aware post-processing.
//!
//! Whatever produced a response (a site rewriter or a plain passthrough
//! fetch), the router hands it here before it goes back to the legacy
//! client. Each handler implements [`ContentHandler`] for a set of MIME
//! types.
//!
//! # Handlers
//!
//! | Type | Handler |
//! |------|---------|
//! | `text/html`, `application/xhtml+xml` | [`HtmlHandler`](html::HtmlHandler) |
//! | `image/*` | [`ImageHandler`](images::ImageHandler) |
//! | `text/css`, JavaScript types | [`ScriptHandler`](script::ScriptHandler) |
//! | anything else | [`PassthroughHandler`](plain::PassthroughHandler) |

pub mod html;
pub mod images;
pub mod plain;
pub mod script;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use http::StatusCode;
use tracing::debug;

use crate::image::ImageCache;
use crate::transcode::Transcoder;

/// Headers never copied from an upstream response to the legacy client.
///
/// Bodies are re-encoded and re-framed, and the client has no TLS.
const HOP_HEADERS: &[&str] = &[
    "connection",
    "content-encoding",
    "content-length",
    "keep-alive",
    "transfer-encoding",
    "strict-transport-security",
    "content-security-policy",
    "alt-svc",
    "upgrade",
];

/// A response on its way back to the legacy client.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl GatewayResponse {
    pub fn new(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Self {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(content_type) {
            headers.insert(CONTENT_TYPE, value);
        }
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    pub fn html(status: StatusCode, body: impl Into<String>) -> Self {
        Self::new(status, "text/html", body.into())
    }

    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self::new(status, "text/plain", body.into())
    }

    /// Build from an upstream response, dropping hop-by-hop headers.
    pub fn from_upstream(status: StatusCode, upstream_headers: &HeaderMap, body: Bytes) -> Self {
        let mut headers = HeaderMap::new();
        for (name, value) in upstream_headers {
            if !HOP_HEADERS.contains(&name.as_str()) {
                headers.append(name.clone(), value.clone());
            }
        }
        Self {
            status,
            headers,
            body,
        }
    }

    /// `Content-Type` without parameters, lowercased.
    pub fn content_type(&self) -> Option<String> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or_default().trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty())
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    /// Replace the body and content type, keeping status and other headers.
    #[must_use]
    pub fn with_body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self.headers.remove(CONTENT_LENGTH);
        if let Ok(value) = HeaderValue::from_str(content_type) {
            self.headers.insert(CONTENT_TYPE, value);
        }
        self
    }

    /// Body as text, invalid UTF-8 replaced.
    pub fn text_body(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Post-processes one family of content types.
#[async_trait]
pub trait ContentHandler: Send + Sync {
    /// MIME types handled. A trailing `/*` matches the whole top-level type.
    fn supported_types(&self) -> &[&str];

    /// Rewrite `response`, which was fetched for `source_url`.
    async fn process(&self, response: GatewayResponse, source_url: &str) -> Result<GatewayResponse>;
}

fn type_matches(pattern: &str, mime: &str) -> bool {
    match pattern.strip_suffix("/*") {
        Some(top) => mime.split('/').next() == Some(top),
        None => pattern == mime,
    }
}

/// Routes responses to the handler for their content type.
///
/// Falls back to HTML when the body looks like HTML (common for responses
/// with a missing `Content-Type`), and to passthrough otherwise.
pub struct ContentRouter {
    handlers: Vec<Box<dyn ContentHandler>>,
}

impl ContentRouter {
    pub fn new(transcoder: Transcoder, images: Arc<ImageCache>) -> Self {
        let handlers: Vec<Box<dyn ContentHandler>> = vec![
            Box::new(html::HtmlHandler::new(transcoder)),
            Box::new(images::ImageHandler::new(images)),
            Box::new(script::ScriptHandler),
            Box::new(plain::PassthroughHandler),
        ];
        Self { handlers }
    }

    pub async fn process(&self, response: GatewayResponse, source_url: &str) -> Result<GatewayResponse> {
        let mime = response.content_type();

        if let Some(mime) = &mime {
            for handler in &self.handlers {
                if handler.supported_types().iter().any(|t| type_matches(t, mime)) {
                    debug!(mime = %mime, "post-processing");
                    return handler.process(response, source_url).await;
                }
            }
        } else if looks_like_html(&response.body) {
            if let Some(handler) = self
                .handlers
                .iter()
                .find(|h| h.supported_types().contains(&"text/html"))
            {
                return handler.process(response, source_url).await;
            }
        }

        plain::PassthroughHandler.process(response, source_url).await
    }
}

fn looks_like_html(body: &[u8]) -> bool {
    let start = body
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map_or(&body[..0], |i| &body[i..]);
    let probe: Vec<u8> = start.iter().take(16).map(u8::to_ascii_lowercase).collect();
    probe.starts_with(b"<!doctype") || probe.starts_with(b"<html") || probe.starts_with(b"<!--")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::{Fetcher, UpstreamRequest, UpstreamResponse};
    use crate::image::ImageOptions;
    use crate::transcode::TranscodeConfig;

    struct Offline;

    #[async_trait]
    impl Fetcher for Offline {
        async fn fetch(&self, request: UpstreamRequest) -> crate::error::Result<UpstreamResponse> {
            Err(crate::error::GatewayError::upstream(&request.url, "offline"))
        }
    }

    fn router(dir: &std::path::Path) -> ContentRouter {
        let cache = Arc::new(ImageCache::new(dir, ImageOptions::default(), Arc::new(Offline)));
        cache.clear().unwrap();
        ContentRouter::new(Transcoder::new(TranscodeConfig::default()), cache)
    }

    #[tokio::test]
    async fn html_is_transcoded() {
        let tmp = tempfile::tempdir().unwrap();
        let response = GatewayResponse::new(
            StatusCode::OK,
            "text/html; charset=utf-8",
            r#"<p class="x">Hi<script>x()</script></p>"#,
        );
        let out = router(tmp.path()).process(response, "http://example.com/").await.unwrap();
        assert_eq!(out.text_body(), "<p>Hi</p>");
        assert_eq!(out.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn css_is_downgraded() {
        let tmp = tempfile::tempdir().unwrap();
        let response = GatewayResponse::new(StatusCode::OK, "text/css", "a{background:url(https://x/y.png)}");
        let out = router(tmp.path()).process(response, "http://example.com/a.css").await.unwrap();
        assert_eq!(out.text_body(), "a{background:url(http://x/y.png)}");
    }

    #[tokio::test]
    async fn unknown_types_pass_through() {
        let tmp = tempfile::tempdir().unwrap();
        let response = GatewayResponse::new(StatusCode::OK, "application/zip", &b"PK\x03\x04https://"[..]);
        let out = router(tmp.path()).process(response.clone(), "http://example.com/z.zip").await.unwrap();
        assert_eq!(out.body, response.body);
        assert_eq!(out.content_type().as_deref(), Some("application/zip"));
    }

    #[tokio::test]
    async fn untyped_html_is_detected() {
        let tmp = tempfile::tempdir().unwrap();
        let mut response = GatewayResponse::html(StatusCode::OK, "  <!DOCTYPE html><p style=x>t");
        response.headers.clear();
        let out = router(tmp.path()).process(response, "http://example.com/").await.unwrap();
        assert!(out.text_body().contains("<p>t</p>"));
    }

    #[test]
    fn hop_headers_are_dropped() {
        let mut upstream = HeaderMap::new();
        upstream.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
        upstream.insert("content-encoding", HeaderValue::from_static("br"));
        upstream.insert("strict-transport-security", HeaderValue::from_static("max-age=1"));
        upstream.insert("set-cookie", HeaderValue::from_static("a=b"));
        let response = GatewayResponse::from_upstream(StatusCode::OK, &upstream, Bytes::new());
        assert!(response.headers.get("content-encoding").is_none());
        assert!(response.headers.get("strict-transport-security").is_none());
        assert_eq!(response.headers["set-cookie"], "a=b");
    }

    #[test]
    fn wildcard_types() {
        assert!(type_matches("image/*", "image/png"));
        assert!(!type_matches("image/*", "text/plain"));
        assert!(type_matches("text/css", "text/css"));
    }
}
