//! CSS and JavaScript: protocol downgrade only.

use anyhow::Result;
use async_trait::async_trait;

use super::{ContentHandler, GatewayResponse};
use crate::transcode::downgrade::{downgrade_text, DOWNGRADE_CONTENT_TYPES};

pub struct ScriptHandler;

#[async_trait]
impl ContentHandler for ScriptHandler {
    fn supported_types(&self) -> &[&str] {
        DOWNGRADE_CONTENT_TYPES
    }

    async fn process(&self, mut response: GatewayResponse, _source_url: &str) -> Result<GatewayResponse> {
        let text = response.text_body();
        if let std::borrow::Cow::Owned(fixed) = downgrade_text(&text) {
            response.body = fixed.into();
            response.headers.remove(http::header::CONTENT_LENGTH);
        }
        Ok(response)
    }
}
