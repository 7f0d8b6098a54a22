//! DOM rewrite rules for declarative sites.
//!
//! A rule pairs a selector with one tree edit. Rules run in order over the
//! parsed page; each sees the tree the previous rules left behind.
//!
//! ```toml
//! [[site.rule]]
//! select = "h1.entry-title"
//! action = "rename"
//! tag = "b"
//! ```
//!
//! Templates in `html` fields may use `{text}` (escaped text of the
//! matched element), `{html}` (its inner markup), `{attr:NAME}` and
//! `{year}`.

use chrono::Datelike;
use html_escape::{encode_double_quoted_attribute, encode_text};
use kuchikikiki::Selectors;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Deserialize;
use tracing::trace;

use crate::error::ConfigError;
use crate::transcode::dom::{self, get_attr, is_attached_to, parse_nodes, text_content, NodeRef};
use crate::transcode::serialize::{serialize_children, OutputFormat};

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{(text|html|year|attr:[A-Za-z0-9_:.-]+)\}").unwrap());

/// Tree edit applied to every matched element.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RuleAction {
    /// Remove the element and its subtree.
    Decompose,
    /// Remove the element, keep its children.
    Unwrap,
    Rename { tag: String },
    InsertBefore { html: String },
    InsertAfter { html: String },
    Prepend { html: String },
    Append { html: String },
    Replace { html: String },
    Wrap { tag: String },
    /// Replace the content with at most `limit` characters of its text.
    Truncate { limit: usize },
    RemoveAttr { attr: String },
    SetAttr { attr: String, value: String },
}

/// A rule as written in a sites file.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleDef {
    pub select: String,
    #[serde(flatten)]
    pub action: RuleAction,
    /// Only run on request paths matching this pattern.
    #[serde(default)]
    pub paths: Option<String>,
    /// Only match elements whose trimmed text starts with this.
    #[serde(default)]
    pub text_prefix: Option<String>,
    #[serde(default)]
    pub text_contains: Option<String>,
    /// Stop after the first matching element.
    #[serde(default)]
    pub first_only: bool,
}

/// A compiled rule.
pub struct Rule {
    select: String,
    selector: Selectors,
    action: RuleAction,
    paths: Option<Regex>,
    text_prefix: Option<String>,
    text_contains: Option<String>,
    first_only: bool,
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("select", &self.select)
            .field("action", &self.action)
            .finish_non_exhaustive()
    }
}

impl Rule {
    /// Compile `def`. Bad selectors and patterns are startup errors.
    pub fn compile(site: &str, def: RuleDef) -> Result<Self, ConfigError> {
        let selector = Selectors::compile(&def.select).map_err(|_| ConfigError::Selector {
            selector: def.select.clone(),
            reason: "unsupported or malformed selector".to_string(),
        })?;
        let paths = def
            .paths
            .map(|pattern| {
                Regex::new(&pattern).map_err(|source| ConfigError::Pattern {
                    site: site.to_string(),
                    pattern,
                    source,
                })
            })
            .transpose()?;
        match &def.action {
            RuleAction::Rename { tag } | RuleAction::Wrap { tag } if !is_tag_name(tag) => {
                return Err(ConfigError::Site {
                    site: site.to_string(),
                    reason: format!("'{tag}' is not a tag name"),
                });
            }
            RuleAction::Truncate { limit: 0 } => {
                return Err(ConfigError::Site {
                    site: site.to_string(),
                    reason: "truncate limit must be positive".to_string(),
                });
            }
            _ => {}
        }
        Ok(Self {
            select: def.select,
            selector,
            action: def.action,
            paths,
            text_prefix: def.text_prefix,
            text_contains: def.text_contains,
            first_only: def.first_only,
        })
    }

    /// The selector as written.
    pub fn selector(&self) -> &str {
        &self.select
    }

    pub fn applies_to(&self, path: &str) -> bool {
        self.paths.as_ref().map_or(true, |re| re.is_match(path))
    }

    fn accepts(&self, node: &NodeRef) -> bool {
        if self.text_prefix.is_none() && self.text_contains.is_none() {
            return true;
        }
        let text = text_content(node);
        let text = text.trim();
        self.text_prefix.as_deref().map_or(true, |p| text.starts_with(p))
            && self.text_contains.as_deref().map_or(true, |c| text.contains(c))
    }

    /// Run against the tree under `root`. Returns the number of edits.
    pub fn apply(&self, root: &NodeRef) -> usize {
        let mut targets: Vec<NodeRef> = root
            .descendants()
            .filter_map(NodeRef::into_element_ref)
            .filter(|el| self.selector.matches(el))
            .map(|el| el.as_node().clone())
            .filter(|n| self.accepts(n))
            .collect();
        if self.first_only {
            targets.truncate(1);
        }

        let mut edits = 0;
        for node in &targets {
            // An earlier match in this pass may have removed it.
            if !is_attached_to(node, root) {
                continue;
            }
            apply_action(&self.action, node);
            edits += 1;
        }
        edits
    }
}

fn is_tag_name(tag: &str) -> bool {
    !tag.is_empty() && tag.chars().all(|c| c.is_ascii_alphanumeric())
}

fn apply_action(action: &RuleAction, node: &NodeRef) {
    match action {
        RuleAction::Decompose => dom::detach(node),
        RuleAction::Unwrap => dom::unwrap(node),
        RuleAction::Rename { tag } => {
            dom::rename(node, tag);
        }
        RuleAction::InsertBefore { html } => dom::insert_before(node, parse_nodes(&render(html, node))),
        RuleAction::InsertAfter { html } => dom::insert_after(node, parse_nodes(&render(html, node))),
        RuleAction::Prepend { html } => dom::prepend_children(node, parse_nodes(&render(html, node))),
        RuleAction::Append { html } => dom::append_children(node, parse_nodes(&render(html, node))),
        RuleAction::Replace { html } => dom::replace_with(node, parse_nodes(&render(html, node))),
        RuleAction::Wrap { tag } => {
            dom::wrap(node, tag);
        }
        RuleAction::Truncate { limit } => {
            let text = collapse_whitespace(&text_content(node));
            if text.chars().count() > *limit {
                dom::set_text(node, &truncate_words(&text, *limit));
            }
        }
        RuleAction::RemoveAttr { attr } => {
            dom::remove_attr(node, attr);
        }
        RuleAction::SetAttr { attr, value } => dom::set_attr(node, attr, value),
    }
}

/// Expand template placeholders against `node`.
pub fn render(template: &str, node: &NodeRef) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| {
            let key = &caps[1];
            match key {
                "text" => encode_text(text_content(node).trim()).into_owned(),
                "html" => serialize_children(node, OutputFormat::Minimal),
                "year" => chrono::Local::now().year().to_string(),
                _ => {
                    let name = key.trim_start_matches("attr:");
                    get_attr(node, name)
                        .map(|v| encode_double_quoted_attribute(&v).into_owned())
                        .unwrap_or_default()
                }
            }
        })
        .into_owned()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cut `text` to at most `limit` characters on a word boundary and append `...`.
pub fn truncate_words(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let cut = text.char_indices().nth(limit).map_or(text.len(), |(i, _)| i);
    let head = &text[..cut];
    // Keep the whole head when the limit falls at the end of a word.
    let next_is_break = text[cut..].starts_with(char::is_whitespace);
    let head = if next_is_break {
        head
    } else {
        head.rfind(char::is_whitespace).map_or(head, |i| &head[..i])
    };
    format!("{}...", head.trim_end())
}

/// Run every rule that applies to `path`. Returns the number of edits.
pub fn apply_rules(root: &NodeRef, rules: &[Rule], path: &str) -> usize {
    let mut edits = 0;
    for rule in rules.iter().filter(|r| r.applies_to(path)) {
        let n = rule.apply(root);
        if n > 0 {
            trace!(selector = %rule.select, edits = n, "Rule applied");
        }
        edits += n;
    }
    edits
}
