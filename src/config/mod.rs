//! Gateway configuration loaded from `~/.config/retrogate/config.toml`.
//!
//! Every section is optional and falls back to built-in defaults. A
//! [preset](preset) named by `preset = "..."` (or `--preset`) is applied on
//! top of the file, and command-line flags on top of that.

pub mod preset;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::charset::ConversionTable;
use crate::error::ConfigError;
use crate::http_client::DEFAULT_TIMEOUT_SECS;
use crate::image::ImageOptions;
use crate::transcode::{OutputFormat, TranscodeConfig};

/// Built-in extensions enabled when the file does not list any.
pub const DEFAULT_EXTENSIONS: &[&str] = &[
    "override",
    "waybackmachine",
    "websimulator",
    "chat",
    "reddit",
    "hackaday",
    "npr",
    "wiby",
];

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Preset applied on top of this file.
    pub preset: Option<String>,
    /// Extra directory searched for `<name>.toml` presets.
    pub presets_dir: Option<PathBuf>,
    /// Appended to the web simulator's system prompt. Usually set by a preset.
    pub simulator_prompt_addendum: String,
    pub server: ServerConfig,
    pub transcode: TranscodeSettings,
    pub images: ImageSettings,
    pub extensions: ExtensionsConfig,
    pub llm: LlmConfig,
    pub chat: ChatConfig,
}

/// `[server]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Replaces the legacy client's `User-Agent` on upstream requests.
    pub user_agent: Option<String>,
    pub output: OutputFormat,
    pub timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5001,
            user_agent: None,
            output: OutputFormat::Minimal,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

/// `[transcode]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeSettings {
    pub simplify_html: bool,
    pub tags_to_unwrap: Vec<String>,
    pub tags_to_strip: Vec<String>,
    pub attributes_to_strip: Vec<String>,
    pub convert_characters: bool,
    /// Added to (or overriding) the built-in conversion table.
    pub conversion_table: BTreeMap<String, String>,
    pub whitelisted_domains: Vec<String>,
    pub can_render_inline_images: bool,
}

impl Default for TranscodeSettings {
    fn default() -> Self {
        let defaults = TranscodeConfig::default();
        Self {
            simplify_html: defaults.simplify_html,
            tags_to_unwrap: defaults.tags_to_unwrap,
            tags_to_strip: defaults.tags_to_strip,
            attributes_to_strip: defaults.attributes_to_strip,
            convert_characters: defaults.convert_characters,
            conversion_table: BTreeMap::new(),
            whitelisted_domains: defaults.whitelisted_domains,
            can_render_inline_images: defaults.can_render_inline_images,
        }
    }
}

/// `[images]`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageSettings {
    /// Cleared at startup. Defaults to the user cache directory.
    pub cache_dir: Option<PathBuf>,
    #[serde(flatten)]
    pub options: ImageOptions,
}

impl ImageSettings {
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("retrogate")
                .join("cached_images")
        })
    }
}

/// `[extensions]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionsConfig {
    pub enabled: Vec<String>,
    /// Extra declarative site definitions.
    pub sites_file: Option<PathBuf>,
}

impl Default for ExtensionsConfig {
    fn default() -> Self {
        Self {
            enabled: DEFAULT_EXTENSIONS.iter().map(|s| (*s).to_string()).collect(),
            sites_file: None,
        }
    }
}

/// `[llm]`: an OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub endpoint: String,
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
        }
    }
}

impl LlmConfig {
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env).ok().filter(|k| !k.is_empty())
    }
}

/// `[chat]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub domains: Vec<String>,
    pub title: String,
    /// Model id and display label, in menu order. The first is the default.
    pub models: Vec<ChatModelOption>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatModelOption {
    pub id: String,
    pub label: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        let models = [
            ("gpt-4o", "GPT-4o"),
            ("gpt-4o-mini", "GPT-4o Mini"),
            ("gpt-4-turbo", "GPT-4"),
            ("gpt-3.5-turbo", "GPT-3.5"),
        ]
        .into_iter()
        .map(|(id, label)| ChatModelOption {
            id: id.to_string(),
            label: label.to_string(),
        })
        .collect();
        Self {
            domains: vec!["chatgpt.com".to_string()],
            title: "ChatGPT".to_string(),
            models,
        }
    }
}

/// Command-line values that win over the file and the preset.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user_agent: Option<String>,
    pub output: Option<OutputFormat>,
    pub preset: Option<String>,
}

impl GatewayConfig {
    /// Parse a TOML document.
    pub fn from_toml(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply the configured preset, if any. Unknown presets are fatal.
    pub fn apply_preset(&mut self) -> Result<(), ConfigError> {
        let Some(name) = self.preset.clone() else {
            return Ok(());
        };
        let preset = preset::load_preset(&name, self.presets_dir.as_deref())?;
        let changed = preset.apply(&name, self);
        info!(preset = %name, changed = changed.len(), "Preset applied");
        Ok(())
    }

    /// Layer command-line flags on top.
    pub fn apply_cli(&mut self, cli: CliOverrides) {
        if let Some(host) = cli.host {
            self.server.host = host;
        }
        if let Some(port) = cli.port {
            self.server.port = port;
        }
        if cli.user_agent.is_some() {
            self.server.user_agent = cli.user_agent;
        }
        if let Some(output) = cli.output {
            self.server.output = output;
        }
        if cli.preset.is_some() {
            self.preset = cli.preset;
        }
    }

    /// The simplifier configuration these settings describe.
    pub fn transcode_config(&self) -> TranscodeConfig {
        let t = &self.transcode;
        let conversion_table = if t.conversion_table.is_empty() {
            ConversionTable::builtin()
        } else {
            ConversionTable::builtin_with(t.conversion_table.clone())
        };
        TranscodeConfig {
            simplify_html: t.simplify_html,
            tags_to_unwrap: t.tags_to_unwrap.clone(),
            tags_to_strip: t.tags_to_strip.clone(),
            attributes_to_strip: t.attributes_to_strip.clone(),
            convert_characters: t.convert_characters,
            conversion_table: Arc::new(conversion_table),
            whitelisted_domains: t.whitelisted_domains.clone(),
            can_render_inline_images: t.can_render_inline_images,
            output: self.server.output,
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Load the configuration file, then its preset, then `cli`.
///
/// Without an explicit `path` the default location is used and a missing
/// file means defaults. An explicit path that does not exist is an error.
pub fn load_config(path: Option<&Path>, cli: CliOverrides) -> Result<GatewayConfig, ConfigError> {
    let mut config = match path {
        Some(path) => read_file(path)?,
        None => {
            let path = default_config_path();
            if path.exists() {
                read_file(&path)?
            } else {
                debug!(path = %path.display(), "No config file, using defaults");
                GatewayConfig::default()
            }
        }
    };
    config.apply_cli(cli);
    config.apply_preset()?;
    Ok(config)
}

fn read_file(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    info!(path = %path.display(), "Loaded configuration");
    GatewayConfig::from_toml(&content, path)
}

/// Return the path to the default config file.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("retrogate")
        .join("config.toml")
}
