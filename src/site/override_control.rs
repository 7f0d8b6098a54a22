//! `override.test`: manual override switch.
//!
//! Useful for checking that override routing works: once enabled, every
//! request lands here and the page echoes the URL that was captured.

use async_trait::async_trait;
use html_escape::encode_text;
use http::{Method, StatusCode};

use super::pages::{action_button, page};
use super::{Extension, ExtensionServices, RewriteContext};
use crate::content::GatewayResponse;
use crate::error::Result;

pub const DOMAIN: &str = "override.test";
const NAME: &str = "override";

pub struct OverrideControl {
    domains: Vec<String>,
}

impl OverrideControl {
    pub fn new() -> Self {
        Self {
            domains: vec![DOMAIN.to_string()],
        }
    }
}

impl Default for OverrideControl {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Extension for OverrideControl {
    fn name(&self) -> &str {
        NAME
    }

    fn domains(&self) -> &[String] {
        &self.domains
    }

    async fn handle(&self, ctx: &RewriteContext, services: &ExtensionServices) -> Result<GatewayResponse> {
        if ctx.method == Method::POST {
            match ctx.form_value("action").as_deref() {
                Some("Enable Override") => {
                    services.session.enable(NAME).await;
                }
                Some("Disable Override") => {
                    services.session.disable(NAME).await;
                }
                _ => {}
            }
        }

        let active = services.session.is_held_by(NAME).await;
        let status = if active { "Override Active" } else { "Override Inactive" };
        let mut body = format!(
            "<h1>Override Control</h1>\n<form method=\"post\">\n{}\n{}\n</form>\n<p>Current status: {status}</p>",
            action_button("Enable Override"),
            action_button("Disable Override"),
        );
        if active {
            body.push_str(&format!("\n<p>Requested URL: {}</p>", encode_text(&ctx.url)));
        }
        Ok(GatewayResponse::html(StatusCode::OK, page("Override Control", &body)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::{Fetcher, UpstreamRequest, UpstreamResponse};
    use crate::session::OverrideSession;
    use bytes::Bytes;
    use http::HeaderMap;
    use std::sync::Arc;

    struct Offline;

    #[async_trait]
    impl Fetcher for Offline {
        async fn fetch(&self, request: UpstreamRequest) -> Result<UpstreamResponse> {
            Err(crate::error::GatewayError::upstream(&request.url, "offline"))
        }
    }

    fn post(action: &str) -> RewriteContext {
        let body = format!("action={}", urlencoding::encode(action));
        RewriteContext::new(Method::POST, "http://override.test/", HeaderMap::new(), Bytes::from(body)).unwrap()
    }

    #[tokio::test]
    async fn toggles_the_session() {
        let services = ExtensionServices {
            fetcher: Arc::new(Offline),
            session: OverrideSession::new(),
        };
        let ext = OverrideControl::new();

        let page = ext.handle(&post("Enable Override"), &services).await.unwrap();
        assert!(page.text_body().contains("Override Active"));
        assert_eq!(services.session.active().await.as_deref(), Some("override"));

        let page = ext.handle(&post("Disable Override"), &services).await.unwrap();
        assert!(page.text_body().contains("Override Inactive"));
        assert_eq!(services.session.active().await, None);
    }

    #[tokio::test]
    async fn echoes_captured_urls() {
        let services = ExtensionServices {
            fetcher: Arc::new(Offline),
            session: OverrideSession::new(),
        };
        services.session.enable("override").await;
        let ctx = RewriteContext::get("http://anything.example/x?a=<b>").unwrap();
        let page = OverrideControl::new().handle(&ctx, &services).await.unwrap();
        assert!(page.text_body().contains("Requested URL: http://anything.example/x?a=%3Cb%3E"));
    }
}
