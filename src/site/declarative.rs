//! Sites described as data.
//!
//! A [`SiteDef`] maps a set of domains onto an upstream, picks a route per
//! request (rewrite, follow a meta refresh, redirect or pass through) and,
//! for rewritten HTML, runs an ordered list of DOM [`rules`](super::rules).
//! The built-in definitions live in `sites.toml` next to this file.

use std::path::Path;

use async_trait::async_trait;
use http::{Method, StatusCode};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, instrument};

use super::rules::{apply_rules, Rule, RuleDef};
use super::{Extension, ExtensionServices, RewriteContext};
use crate::content::GatewayResponse;
use crate::error::{ConfigError, GatewayError, Result};
use crate::http_client::{UpstreamRequest, UpstreamResponse};
use crate::transcode::dom::{elements_named, get_attr, Document};
use crate::transcode::serialize::{serialize, OutputFormat};

const BUILTIN_SITES: &str = include_str!("sites.toml");

static REFRESH_URL: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(?i)url\s*=\s*['"]?([^'"\s]+)"#).unwrap());

/// A sites file: one or more `[[site]]` tables.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SitesFile {
    #[serde(rename = "site", default)]
    pub sites: Vec<SiteDef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SiteDef {
    pub name: String,
    pub domains: Vec<String>,
    /// Base URL requests are mapped onto. Without it the requested URL is
    /// fetched as is.
    #[serde(default)]
    pub upstream: Option<String>,
    #[serde(default = "default_methods")]
    pub methods: Vec<String>,
    #[serde(rename = "route", default)]
    pub routes: Vec<RouteDef>,
    #[serde(rename = "rule", default)]
    pub rules: Vec<RuleDef>,
}

fn default_methods() -> Vec<String> {
    vec!["GET".to_string()]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteAction {
    /// Fetch, apply the rules to HTML.
    Rewrite,
    /// Fetch and answer with a redirect to the page's meta refresh target.
    FollowRefresh,
    /// Answer with a redirect to `target`, no fetch.
    Redirect,
    /// Fetch, return unmodified.
    Passthrough,
}

/// First matching route wins. No match means `rewrite`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteDef {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    pub action: RouteAction,
    /// URL template with `{host}`, `{path}` and `{query}` (including `?`).
    #[serde(default)]
    pub target: Option<String>,
}

#[derive(Debug)]
struct Route {
    host: Option<Regex>,
    path: Option<Regex>,
    action: RouteAction,
    target: Option<String>,
}

impl Route {
    fn matches(&self, ctx: &RewriteContext) -> bool {
        self.host.as_ref().map_or(true, |re| re.is_match(&ctx.host))
            && self.path.as_ref().map_or(true, |re| re.is_match(&ctx.path))
    }
}

/// A compiled site.
#[derive(Debug)]
pub struct DeclarativeSite {
    name: String,
    domains: Vec<String>,
    upstream: Option<String>,
    methods: Vec<Method>,
    routes: Vec<Route>,
    rules: Vec<Rule>,
}

fn compile_pattern(site: &str, pattern: Option<String>) -> std::result::Result<Option<Regex>, ConfigError> {
    pattern
        .map(|pattern| {
            Regex::new(&pattern).map_err(|source| ConfigError::Pattern {
                site: site.to_string(),
                pattern,
                source,
            })
        })
        .transpose()
}

impl DeclarativeSite {
    pub fn compile(def: SiteDef) -> std::result::Result<Self, ConfigError> {
        let site_error = |reason: String| ConfigError::Site {
            site: def.name.clone(),
            reason,
        };
        if def.domains.is_empty() {
            return Err(site_error("no domains".to_string()));
        }
        if let Some(upstream) = &def.upstream {
            url::Url::parse(upstream).map_err(|e| site_error(format!("upstream '{upstream}': {e}")))?;
        }

        let methods = def
            .methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                    .map_err(|_| site_error(format!("invalid method '{m}'")))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut routes = Vec::with_capacity(def.routes.len());
        for route in def.routes {
            if route.action == RouteAction::Redirect && route.target.is_none() {
                return Err(site_error("redirect route without target".to_string()));
            }
            routes.push(Route {
                host: compile_pattern(&def.name, route.host)?,
                path: compile_pattern(&def.name, route.path)?,
                action: route.action,
                target: route.target,
            });
        }

        let rules = def
            .rules
            .into_iter()
            .map(|rule| Rule::compile(&def.name, rule))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        debug!(site = %def.name, routes = routes.len(), rules = rules.len(), "Compiled site");
        Ok(Self {
            name: def.name,
            domains: def.domains.iter().map(|d| d.to_ascii_lowercase()).collect(),
            upstream: def.upstream.map(|u| u.trim_end_matches('/').to_string()),
            methods,
            routes,
            rules,
        })
    }

    fn route_for(&self, ctx: &RewriteContext) -> (RouteAction, Option<&str>) {
        self.routes
            .iter()
            .find(|r| r.matches(ctx))
            .map_or((RouteAction::Rewrite, None), |r| (r.action, r.target.as_deref()))
    }

    /// Where `ctx` is fetched from.
    fn upstream_url(&self, ctx: &RewriteContext, target: Option<&str>) -> String {
        if let Some(template) = target {
            return expand_target(template, ctx);
        }
        match &self.upstream {
            Some(base) => format!("{base}{}", ctx.path_and_query()),
            None => ctx.url.clone(),
        }
    }

    async fn fetch(&self, ctx: &RewriteContext, url: String, services: &ExtensionServices) -> Result<UpstreamResponse> {
        let request = UpstreamRequest {
            method: ctx.method.clone(),
            url,
            headers: ctx.forwarded_headers(),
            body: ctx.body.clone(),
        };
        services.fetcher.fetch(request).await
    }

    /// Run the rules over an HTML page fetched for `path`.
    pub fn rewrite_html(&self, html: &str, path: &str) -> String {
        let doc = Document::parse(html);
        let edits = apply_rules(&doc.root(), &self.rules, path);
        debug!(site = %self.name, edits, "Rules applied");
        serialize(&doc, OutputFormat::Minimal)
    }
}

fn expand_target(template: &str, ctx: &RewriteContext) -> String {
    let query = ctx.query.as_ref().map(|q| format!("?{q}")).unwrap_or_default();
    template
        .replace("{host}", &ctx.host)
        .replace("{path}", &ctx.path)
        .replace("{query}", &query)
}

/// Target of the first `<meta http-equiv="refresh">` in `html`.
pub fn meta_refresh_target(html: &str) -> Option<String> {
    let doc = Document::parse(html);
    elements_named(&doc.root(), &["meta"])
        .into_iter()
        .filter(|m| get_attr(m, "http-equiv").is_some_and(|v| v.eq_ignore_ascii_case("refresh")))
        .find_map(|m| {
            let content = get_attr(&m, "content")?;
            REFRESH_URL.captures(&content).map(|c| c[1].to_string())
        })
}

fn redirect(location: &str) -> GatewayResponse {
    let body = format!(
        "<html><body><a href=\"{}\">Moved</a></body></html>",
        html_escape::encode_double_quoted_attribute(location)
    );
    GatewayResponse::html(StatusCode::FOUND, body).with_header("location", location)
}

fn is_html(response: &UpstreamResponse) -> bool {
    response
        .content_type()
        .is_some_and(|ct| ct == "text/html" || ct == "application/xhtml+xml")
}

#[async_trait]
impl Extension for DeclarativeSite {
    fn name(&self) -> &str {
        &self.name
    }

    fn domains(&self) -> &[String] {
        &self.domains
    }

    #[instrument(skip(self, ctx, services), fields(site = %self.name, url = %ctx.url))]
    async fn handle(&self, ctx: &RewriteContext, services: &ExtensionServices) -> Result<GatewayResponse> {
        if !self.methods.contains(&ctx.method) {
            return Err(GatewayError::MethodNotAllowed(ctx.method.clone()));
        }

        let (action, target) = self.route_for(ctx);
        if action == RouteAction::Redirect {
            let location = self.upstream_url(ctx, target);
            info!(location = %location, "Redirecting");
            return Ok(redirect(&location));
        }

        let url = self.upstream_url(ctx, target);
        let response = self.fetch(ctx, url, services).await?;

        match action {
            RouteAction::FollowRefresh => {
                if response.status.is_success() {
                    if let Some(location) = meta_refresh_target(&response.text()) {
                        info!(location = %location, "Following meta refresh");
                        return Ok(redirect(&location));
                    }
                }
                Ok(GatewayResponse::from_upstream(response.status, &response.headers, response.body))
            }
            RouteAction::Rewrite if is_html(&response) => {
                let html = self.rewrite_html(&response.text(), &ctx.path);
                Ok(GatewayResponse::from_upstream(response.status, &response.headers, response.body)
                    .with_body("text/html", html))
            }
            _ => Ok(GatewayResponse::from_upstream(response.status, &response.headers, response.body)),
        }
    }
}

/// Parse and compile every site in a sites file's content.
pub fn parse_sites(content: &str, path: &Path) -> std::result::Result<Vec<DeclarativeSite>, ConfigError> {
    let file: SitesFile = toml::from_str(content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    file.sites.into_iter().map(DeclarativeSite::compile).collect()
}

/// The sites shipped with the gateway.
pub fn builtin_sites() -> std::result::Result<Vec<DeclarativeSite>, ConfigError> {
    parse_sites(BUILTIN_SITES, Path::new("<builtin sites.toml>"))
}

/// Load extra sites from `path`.
pub fn load_sites_file(path: &Path) -> std::result::Result<Vec<DeclarativeSite>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let sites = parse_sites(&content, path)?;
    info!(path = %path.display(), sites = sites.len(), "Loaded site definitions");
    Ok(sites)
}
