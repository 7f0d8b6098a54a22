//! Site-specific rewriting.
//!
//! An [`Extension`] owns every request for its domains: it builds the
//! upstream request, fetches, reshapes the result and returns a
//! [`GatewayResponse`]. The router post-processes whatever comes back
//! (HTML simplifier, image cache), so extensions never transcode.
//!
//! # Architecture
//!
//! - [`Extension`]: async trait every site module implements
//! - [`ExtensionRegistry`]: enabled extensions in registration order
//! - [`RewriteContext`]: the inbound request, unmodified
//! - [`declarative`]: sites described as data (routes + DOM rules)
//!
//! Extensions that hold the [`OverrideSession`] receive all traffic
//! regardless of host until they release it.

pub mod chat;
pub mod declarative;
pub mod override_control;
pub mod pages;
pub mod reddit;
pub mod rules;
pub mod simulator;
pub mod wayback;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::HeaderMap;
use http::Method;
use tracing::debug;

use crate::config::GatewayConfig;
use crate::content::GatewayResponse;
use crate::error::{ConfigError, GatewayError, Result};
use crate::http_client::{host_matches, Fetcher, FORWARDED_HEADERS};
use crate::session::OverrideSession;

pub use chat::{ChatMessage, ChatModel, OpenAiChat, Role};
pub use declarative::DeclarativeSite;

/// The inbound request as the legacy client sent it.
#[derive(Debug, Clone)]
pub struct RewriteContext {
    pub method: Method,
    /// Absolute URL, always `http://` or whatever scheme the client used.
    pub url: String,
    pub scheme: String,
    /// Lowercased, without port.
    pub host: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RewriteContext {
    pub fn new(method: Method, url: &str, headers: HeaderMap, body: Bytes) -> Result<Self> {
        let parsed = url::Url::parse(url).map_err(|e| GatewayError::BadRequest(format!("{url}: {e}")))?;
        let host = parsed
            .host_str()
            .map(str::to_ascii_lowercase)
            .ok_or_else(|| GatewayError::BadRequest(format!("{url}: no host")))?;
        Ok(Self {
            method,
            url: parsed.to_string(),
            scheme: parsed.scheme().to_string(),
            host,
            path: parsed.path().to_string(),
            query: parsed.query().map(str::to_string),
            headers,
            body,
        })
    }

    /// A body-less GET, for tests and internal dispatch.
    pub fn get(url: &str) -> Result<Self> {
        Self::new(Method::GET, url, HeaderMap::new(), Bytes::new())
    }

    /// `/path?query`
    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{q}", self.path),
            None => self.path.clone(),
        }
    }

    pub fn query_pairs(&self) -> Vec<(String, String)> {
        self.query
            .as_deref()
            .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default()
    }

    pub fn query_param(&self, name: &str) -> Option<String> {
        self.query_pairs().into_iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    /// `application/x-www-form-urlencoded` body fields.
    pub fn form(&self) -> Vec<(String, String)> {
        url::form_urlencoded::parse(&self.body).into_owned().collect()
    }

    pub fn form_value(&self, name: &str) -> Option<String> {
        self.form().into_iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    /// The subset of client headers worth forwarding upstream.
    pub fn forwarded_headers(&self) -> HeaderMap {
        let mut out = HeaderMap::new();
        for (name, value) in &self.headers {
            if FORWARDED_HEADERS.contains(&name.as_str()) {
                out.append(name.clone(), value.clone());
            }
        }
        out
    }
}

/// Shared collaborators handed to every dispatch.
#[derive(Clone)]
pub struct ExtensionServices {
    pub fetcher: Arc<dyn Fetcher>,
    pub session: OverrideSession,
}

/// A per-site rewriter.
#[async_trait]
pub trait Extension: Send + Sync {
    /// Name used in `[extensions] enabled` and by the override session.
    fn name(&self) -> &str;

    /// Domains this extension answers for, subdomains included.
    fn domains(&self) -> &[String];

    fn matches_host(&self, host: &str) -> bool {
        self.domains().iter().any(|d| host_matches(host, d))
    }

    /// URL schemes accepted while this extension holds the override session.
    fn override_schemes(&self) -> &[&str] {
        &["http"]
    }

    /// Satisfy the request. Upstream failures come back as errors and are
    /// rendered by the router.
    async fn handle(&self, ctx: &RewriteContext, services: &ExtensionServices) -> Result<GatewayResponse>;
}

/// Enabled extensions. First host match wins.
#[derive(Default)]
pub struct ExtensionRegistry {
    extensions: Vec<Arc<dyn Extension>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, extension: Arc<dyn Extension>) {
        debug!(extension = extension.name(), "Registered extension");
        self.extensions.push(extension);
    }

    /// Build the enabled set from configuration.
    ///
    /// Unknown names and invalid site definitions are fatal here, never at
    /// request time. Sites from `sites_file` are always enabled.
    pub fn from_config(config: &GatewayConfig, chat_model: Arc<dyn ChatModel>) -> std::result::Result<Self, ConfigError> {
        let mut builtin_sites = declarative::builtin_sites()?;
        let extra_sites = match &config.extensions.sites_file {
            Some(path) => declarative::load_sites_file(path)?,
            None => Vec::new(),
        };

        let mut registry = Self::new();
        for name in &config.extensions.enabled {
            let extension: Arc<dyn Extension> = match name.as_str() {
                "override" => Arc::new(override_control::OverrideControl::new()),
                "waybackmachine" => Arc::new(wayback::WaybackMachine::new()),
                "websimulator" => Arc::new(simulator::WebSimulator::new(
                    chat_model.clone(),
                    &config.simulator_prompt_addendum,
                )),
                "chat" => Arc::new(chat::ChatExtension::new(chat_model.clone(), &config.chat)),
                "reddit" => Arc::new(reddit::Reddit::new()),
                other => {
                    let position = builtin_sites.iter().position(|s| s.name() == other);
                    match position {
                        Some(i) => Arc::new(builtin_sites.swap_remove(i)),
                        None => return Err(ConfigError::UnknownExtension(other.to_string())),
                    }
                }
            };
            registry.register(extension);
        }
        for site in extra_sites {
            registry.register(Arc::new(site));
        }
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Extension>> {
        self.extensions.iter().find(|e| e.name() == name).cloned()
    }

    pub fn for_host(&self, host: &str) -> Option<Arc<dyn Extension>> {
        self.extensions.iter().find(|e| e.matches_host(host)).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.extensions.iter().map(|e| e.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExtensionsConfig;

    struct Silent;

    #[async_trait]
    impl ChatModel for Silent {
        async fn complete(&self, _model: Option<&str>, _messages: &[ChatMessage]) -> Result<String> {
            Ok(String::new())
        }
    }

    #[test]
    fn context_parses_the_request() {
        let ctx = RewriteContext::new(
            Method::POST,
            "http://WWW.Example.com:8080/a/b?x=1&y=two%20words",
            HeaderMap::new(),
            Bytes::from_static(b"action=set+date&day=31"),
        )
        .unwrap();
        assert_eq!(ctx.host, "www.example.com");
        assert_eq!(ctx.path, "/a/b");
        assert_eq!(ctx.path_and_query(), "/a/b?x=1&y=two%20words");
        assert_eq!(ctx.query_param("y").as_deref(), Some("two words"));
        assert_eq!(ctx.form_value("action").as_deref(), Some("set date"));
        assert_eq!(ctx.form_value("missing"), None);
    }

    #[test]
    fn context_rejects_relative_urls() {
        let err = RewriteContext::get("/relative").unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest(_)));
    }

    #[test]
    fn only_listed_headers_are_forwarded() {
        let mut headers = HeaderMap::new();
        headers.insert("accept", "text/html".parse().unwrap());
        headers.insert("proxy-connection", "keep-alive".parse().unwrap());
        let ctx = RewriteContext::new(Method::GET, "http://example.com/", headers, Bytes::new()).unwrap();
        let forwarded = ctx.forwarded_headers();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded["accept"], "text/html");
    }

    #[test]
    fn registry_from_default_config() {
        let registry = ExtensionRegistry::from_config(&GatewayConfig::default(), Arc::new(Silent)).unwrap();
        assert_eq!(registry.len(), crate::config::DEFAULT_EXTENSIONS.len());
        assert_eq!(registry.for_host("old.reddit.com").unwrap().name(), "reddit");
        assert_eq!(registry.for_host("text.npr.org").unwrap().name(), "npr");
        assert_eq!(registry.for_host("chatgpt.com").unwrap().name(), "chat");
        assert!(registry.for_host("example.com").is_none());
        assert!(registry.get("waybackmachine").is_some());
    }

    #[test]
    fn unknown_extension_is_fatal() {
        let config = GatewayConfig {
            extensions: ExtensionsConfig {
                enabled: vec!["gopher".to_string()],
                sites_file: None,
            },
            ..GatewayConfig::default()
        };
        let err = ExtensionRegistry::from_config(&config, Arc::new(Silent)).err().unwrap();
        assert!(matches!(err, ConfigError::UnknownExtension(name) if name == "gopher"));
    }
}
