//! Error taxonomy for the gateway.
//!
//! [`GatewayError`] covers everything that can go wrong while serving a
//! request and knows how to render itself for a legacy client. Startup
//! problems live in [`ConfigError`] and are fatal before the listener binds.

use std::path::PathBuf;

use http::{Method, StatusCode};
use thiserror::Error;

/// Request-time errors.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("upstream request to {url} failed: {reason}")]
    Upstream { url: String, reason: String },

    #[error("upstream returned {status} for {url}")]
    UpstreamStatus { url: String, status: StatusCode },

    #[error("language model request failed: {0}")]
    Llm(String),

    #[error("{0}")]
    Extension(String),

    #[error("content processing failed: {0}")]
    Transcode(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("method {0} not allowed")]
    MethodNotAllowed(Method),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Status code sent to the client for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Upstream { .. }
            | Self::UpstreamStatus { .. }
            | Self::Llm(_)
            | Self::Extension(_)
            | Self::Transcode(_)
            | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Routing errors are answered in plain text, everything else gets a page.
    pub fn is_plain_text(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::MethodNotAllowed(_) | Self::BadRequest(_)
        )
    }

    pub(crate) fn upstream(url: &str, reason: impl std::fmt::Display) -> Self {
        Self::Upstream {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Startup errors. Never deferred to request time.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("preset '{name}' not found (looked in built-ins and {searched})")]
    PresetNotFound { name: String, searched: String },

    #[error("invalid preset '{name}': {source}")]
    InvalidPreset {
        name: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("unknown extension '{0}'")]
    UnknownExtension(String),

    #[error("invalid selector '{selector}': {reason}")]
    Selector { selector: String, reason: String },

    #[error("invalid pattern '{pattern}' in site '{site}': {source}")]
    Pattern {
        site: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid site definition '{site}': {reason}")]
    Site { site: String, reason: String },

    #[error("failed to prepare image cache at {path}: {source}")]
    Cache {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to build upstream client: {0}")]
    Client(#[from] reqwest::Error),
}
