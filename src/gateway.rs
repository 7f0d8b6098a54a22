//! Request router.
//!
//! Every inbound request takes the same path:
//!
//! 1. `/cached_image/<file>` on any host is served from the image cache.
//! 2. The override session holder, if any, gets the request when it
//!    accepts the URL scheme.
//! 3. The first extension whose domain matches the host.
//! 4. Image URLs go straight to the re-encoder.
//! 5. Anything else is fetched as is.
//!
//! Responses from steps 2, 3 and 5 then go through the [`ContentRouter`]
//! so extensions never transcode themselves. Errors become pages here and
//! nowhere else.

use std::sync::Arc;

use http::{Method, StatusCode};
use tracing::{debug, info, instrument, warn};

use crate::config::GatewayConfig;
use crate::content::{ContentRouter, GatewayResponse};
use crate::error::{ConfigError, GatewayError, Result};
use crate::http_client::{Fetcher, UpstreamRequest};
use crate::image::{is_image_url, ImageCache, CACHE_ROUTE};
use crate::session::OverrideSession;
use crate::site::pages::error_response;
use crate::site::{ChatModel, ExtensionRegistry, ExtensionServices, OpenAiChat, RewriteContext};
use crate::transcode::{InlineImageSink, Transcoder};

/// Which part of the router answered.
enum Dispatch {
    /// Still needs content post-processing.
    Raw(GatewayResponse),
    /// Ready to send.
    Final(GatewayResponse),
}

pub struct Gateway {
    registry: ExtensionRegistry,
    services: ExtensionServices,
    content: ContentRouter,
    images: Arc<ImageCache>,
}

impl Gateway {
    pub fn new(
        registry: ExtensionRegistry,
        services: ExtensionServices,
        content: ContentRouter,
        images: Arc<ImageCache>,
    ) -> Self {
        Self {
            registry,
            services,
            content,
            images,
        }
    }

    /// Wire up a gateway from configuration.
    ///
    /// Clears the image cache directory, builds the transcoder and enables
    /// the configured extensions. Every failure here is fatal.
    pub fn from_config(config: &GatewayConfig, fetcher: Arc<dyn Fetcher>) -> std::result::Result<Self, ConfigError> {
        let images = Arc::new(ImageCache::new(
            config.images.cache_dir(),
            config.images.options.clone(),
            fetcher.clone(),
        ));
        images.clear()?;

        let sink: Arc<dyn InlineImageSink> = images.clone();
        let transcoder = Transcoder::new(config.transcode_config()).with_inline_images(sink);
        let content = ContentRouter::new(transcoder, images.clone());

        let chat_model: Arc<dyn ChatModel> = Arc::new(OpenAiChat::new(fetcher.clone(), config.llm.clone()));
        let registry = ExtensionRegistry::from_config(config, chat_model)?;
        info!(extensions = ?registry.names(), "Extensions enabled");

        let services = ExtensionServices {
            fetcher,
            session: OverrideSession::new(),
        };
        Ok(Self::new(registry, services, content, images))
    }

    pub fn session(&self) -> &OverrideSession {
        &self.services.session
    }

    pub fn registry(&self) -> &ExtensionRegistry {
        &self.registry
    }

    /// Answer one request. Never fails: errors are rendered.
    #[instrument(skip(self, ctx), fields(method = %ctx.method, url = %ctx.url))]
    pub async fn handle(&self, ctx: &RewriteContext) -> GatewayResponse {
        match self.route(ctx).await {
            Ok(response) => response,
            Err(err) => {
                if err.is_plain_text() {
                    debug!(error = %err, "Request rejected");
                } else {
                    warn!(error = %err, "Request failed");
                }
                error_response(&err)
            }
        }
    }

    async fn route(&self, ctx: &RewriteContext) -> Result<GatewayResponse> {
        match self.dispatch(ctx).await? {
            Dispatch::Final(response) => Ok(response),
            Dispatch::Raw(response) => self
                .content
                .process(response, &ctx.url)
                .await
                .map_err(|e| GatewayError::Transcode(format!("{e:#}"))),
        }
    }

    async fn dispatch(&self, ctx: &RewriteContext) -> Result<Dispatch> {
        if let Some(file_name) = ctx.path.strip_prefix(CACHE_ROUTE) {
            return self.serve_cached(ctx, file_name).await.map(Dispatch::Final);
        }

        if let Some(owner) = self.services.session.active().await {
            match self.registry.get(&owner) {
                Some(extension) if extension.override_schemes().contains(&ctx.scheme.as_str()) => {
                    debug!(extension = %owner, "Captured by override session");
                    return extension.handle(ctx, &self.services).await.map(Dispatch::Raw);
                }
                Some(_) => debug!(extension = %owner, scheme = %ctx.scheme, "Scheme not captured"),
                None => {
                    warn!(extension = %owner, "Override holder is not enabled, releasing");
                    self.services.session.disable(&owner).await;
                }
            }
        }

        if let Some(extension) = self.registry.for_host(&ctx.host) {
            debug!(extension = extension.name(), "Matched by host");
            return extension.handle(ctx, &self.services).await.map(Dispatch::Raw);
        }

        if ctx.method == Method::GET && is_image_url(&ctx.url) {
            if let Some(entry) = self.images.fetch_and_cache(&ctx.url).await {
                let (bytes, mime) = self.images.read(&entry.file_name).await?;
                return Ok(Dispatch::Final(GatewayResponse::new(StatusCode::OK, &mime, bytes)));
            }
            debug!("Image route failed, falling back to passthrough");
        }

        self.passthrough(ctx).await.map(Dispatch::Raw)
    }

    async fn serve_cached(&self, ctx: &RewriteContext, file_name: &str) -> Result<GatewayResponse> {
        if ctx.method != Method::GET && ctx.method != Method::HEAD {
            return Err(GatewayError::MethodNotAllowed(ctx.method.clone()));
        }
        let (bytes, mime) = self.images.read(file_name).await?;
        Ok(GatewayResponse::new(StatusCode::OK, &mime, bytes))
    }

    /// Fetch the requested URL and mirror the upstream status.
    async fn passthrough(&self, ctx: &RewriteContext) -> Result<GatewayResponse> {
        let request = UpstreamRequest {
            method: ctx.method.clone(),
            url: ctx.url.clone(),
            headers: ctx.forwarded_headers(),
            body: ctx.body.clone(),
        };
        let response = self.services.fetcher.fetch(request).await?;
        Ok(GatewayResponse::from_upstream(response.status, &response.headers, response.body))
    }
}
