//! Passthrough for everything without a dedicated handler.

use anyhow::Result;
use async_trait::async_trait;

use super::{ContentHandler, GatewayResponse};

/// Returns the response unmodified.
///
/// Registered for common text and binary download types, and used as the
/// fallback for anything unrecognized.
pub struct PassthroughHandler;

#[async_trait]
impl ContentHandler for PassthroughHandler {
    fn supported_types(&self) -> &[&str] {
        &[
            "text/plain",
            "application/json",
            "text/xml",
            "application/xml",
            "application/octet-stream",
        ]
    }

    async fn process(&self, response: GatewayResponse, _source_url: &str) -> Result<GatewayResponse> {
        Ok(response)
    }
}
