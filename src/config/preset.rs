//! Presets: named overlays that retarget the gateway at one legacy client.
//!
//! A preset is a TOML file whose keys override the transcode and image
//! settings (and the simulator prompt addendum). Built-in presets are
//! compiled in. `<presets_dir>/<name>.toml` takes precedence over a built-in
//! of the same name.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::Path;

use serde::Deserialize;
use tracing::info;

use super::GatewayConfig;
use crate::error::ConfigError;
use crate::image::{Dithering, TargetFormat};

/// Built-in presets: name and TOML source.
pub const BUILTIN_PRESETS: &[(&str, &str)] = &[
    ("macweb2", include_str!("presets/macweb2.toml")),
    ("wii_internet_channel", include_str!("presets/wii_internet_channel.toml")),
];

/// Longest value rendered in a change log line.
const LOG_VALUE_LIMIT: usize = 100;

/// Every key is optional. Absent keys leave the configuration alone.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Preset {
    pub description: Option<String>,

    pub simplify_html: Option<bool>,
    pub tags_to_unwrap: Option<Vec<String>>,
    pub tags_to_strip: Option<Vec<String>>,
    pub attributes_to_strip: Option<Vec<String>>,
    pub can_render_inline_images: Option<bool>,
    pub convert_characters: Option<bool>,
    pub conversion_table: Option<BTreeMap<String, String>>,
    pub whitelisted_domains: Option<Vec<String>>,

    pub resize: Option<bool>,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub convert: Option<bool>,
    pub target_format: Option<TargetFormat>,
    pub dithering: Option<Dithering>,

    pub simulator_prompt_addendum: Option<String>,
}

impl Preset {
    pub fn parse(name: &str, content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::InvalidPreset {
            name: name.to_string(),
            source,
        })
    }

    /// Overlay onto `config`. Returns the names of the variables that changed.
    pub fn apply(&self, name: &str, config: &mut GatewayConfig) -> Vec<&'static str> {
        let mut changed = Vec::new();
        let t = &mut config.transcode;
        let i = &mut config.images.options;

        overlay(name, "simplify_html", &self.simplify_html, &mut t.simplify_html, &mut changed);
        overlay(name, "tags_to_unwrap", &self.tags_to_unwrap, &mut t.tags_to_unwrap, &mut changed);
        overlay(name, "tags_to_strip", &self.tags_to_strip, &mut t.tags_to_strip, &mut changed);
        overlay(
            name,
            "attributes_to_strip",
            &self.attributes_to_strip,
            &mut t.attributes_to_strip,
            &mut changed,
        );
        overlay(
            name,
            "can_render_inline_images",
            &self.can_render_inline_images,
            &mut t.can_render_inline_images,
            &mut changed,
        );
        overlay(
            name,
            "convert_characters",
            &self.convert_characters,
            &mut t.convert_characters,
            &mut changed,
        );
        overlay(name, "conversion_table", &self.conversion_table, &mut t.conversion_table, &mut changed);
        overlay(
            name,
            "whitelisted_domains",
            &self.whitelisted_domains,
            &mut t.whitelisted_domains,
            &mut changed,
        );

        overlay(name, "resize", &self.resize, &mut i.resize, &mut changed);
        overlay(name, "max_width", &self.max_width, &mut i.max_width, &mut changed);
        overlay(name, "max_height", &self.max_height, &mut i.max_height, &mut changed);
        overlay(name, "convert", &self.convert, &mut i.convert, &mut changed);
        overlay(name, "target_format", &self.target_format, &mut i.target_format, &mut changed);
        overlay(name, "dithering", &self.dithering, &mut i.dithering, &mut changed);

        overlay(
            name,
            "simulator_prompt_addendum",
            &self.simulator_prompt_addendum,
            &mut config.simulator_prompt_addendum,
            &mut changed,
        );
        changed
    }
}

fn overlay<T: Clone + PartialEq + Debug>(
    preset: &str,
    var: &'static str,
    value: &Option<T>,
    target: &mut T,
    changed: &mut Vec<&'static str>,
) {
    let Some(value) = value else {
        return;
    };
    if value == target {
        return;
    }
    info!(
        "Preset '{preset}' changed {var} from {} to {}",
        truncate_for_log(target),
        truncate_for_log(value)
    );
    *target = value.clone();
    changed.push(var);
}

fn truncate_for_log<T: Debug>(value: &T) -> String {
    let rendered = format!("{value:?}");
    match rendered.char_indices().nth(LOG_VALUE_LIMIT) {
        Some((cut, _)) => format!("{}...", &rendered[..cut]),
        None => rendered,
    }
}

/// Find and parse the preset `name`.
pub fn load_preset(name: &str, presets_dir: Option<&Path>) -> Result<Preset, ConfigError> {
    if let Some(dir) = presets_dir {
        let path = dir.join(format!("{name}.toml"));
        if path.is_file() {
            let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            info!(preset = name, path = %path.display(), "Loading preset");
            return Preset::parse(name, &content);
        }
    }

    match BUILTIN_PRESETS.iter().find(|(builtin, _)| *builtin == name) {
        Some((_, content)) => Preset::parse(name, content),
        None => Err(ConfigError::PresetNotFound {
            name: name.to_string(),
            searched: presets_dir.map_or_else(|| "no presets directory".to_string(), |d| d.display().to_string()),
        }),
    }
}

/// Names and descriptions of the built-in presets.
pub fn builtin_presets() -> Vec<(&'static str, String)> {
    BUILTIN_PRESETS
        .iter()
        .map(|(name, content)| {
            let description = Preset::parse(name, content)
                .ok()
                .and_then(|p| p.description)
                .unwrap_or_default();
            (*name, description)
        })
        .collect()
}
