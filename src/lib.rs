//! `retrogate` - modern web for vintage browsers
//!
//! A proxy-style gateway: legacy clients send plain HTTP requests, the
//! gateway fetches the real resource over modern TLS and rewrites it into
//! something a 1990s browser can render.
//!
//! # Features
//!
//! - **HTML transcoding**: ordered passes for character conversion, protocol
//!   downgrade, tag/attribute stripping and legacy serialization
//! - **Image re-encoding**: resize, dither and convert into a
//!   content-addressed cache served from `/cached_image/`
//! - **Site extensions**: per-site rewriters, declarative rule sets and
//!   override modes (archive time travel, simulated web)
//! - **Presets**: bundled profiles for specific legacy browsers
//!
//! # Example
//!
//! ```rust
//! use retrogate::{TranscodeConfig, Transcoder};
//!
//! let transcoder = Transcoder::new(TranscodeConfig::default());
//! let html = transcoder.transcode_str(
//!     r#"<p class="x">Caf&eacute; <a href="https://example.com/">link</a></p>"#,
//!     None,
//! );
//! assert_eq!(html, r#"<p>Cafe <a href="http://example.com/">link</a></p>"#);
//! ```

pub mod charset;
pub mod config;
pub mod content;
pub mod error;
pub mod gateway;
pub mod http_client;
pub mod image;
pub mod server;
pub mod session;
pub mod site;
pub mod transcode;

pub use charset::ConversionTable;
pub use config::{load_config, CliOverrides, GatewayConfig};
pub use content::{ContentRouter, GatewayResponse};
pub use error::{ConfigError, GatewayError};
pub use gateway::Gateway;
pub use http_client::{Fetcher, UpstreamClient, UpstreamRequest, UpstreamResponse};
pub use image::{ImageCache, ImageOptions};
pub use session::OverrideSession;
pub use site::{Extension, ExtensionRegistry, RewriteContext};
pub use transcode::{simplify, OutputFormat, TranscodeConfig, Transcoder};

/// Version of retrogate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
