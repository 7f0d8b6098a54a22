//! Secure-to-insecure URL rewriting.
//!
//! Legacy clients speak plain HTTP only, so every `https://` or
//! protocol-relative `//` reference is rewritten to `http://`. The same rule
//! is applied to URL attributes, meta refresh targets, inline CSS and
//! standalone CSS/JS bodies.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::Regex;

static HTTPS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)https://").unwrap());

static CSS_PROTOCOL_RELATIVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)url\(\s*(['"]?)//"#).unwrap());

static REFRESH_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)^(\s*\d*\s*[;,]\s*url\s*=\s*['"]?)(.*?)(['"]?\s*)$"#).unwrap());

/// Content types whose bodies get [`downgrade_text`] treatment.
pub const DOWNGRADE_CONTENT_TYPES: &[&str] = &[
    "text/css",
    "text/javascript",
    "application/javascript",
    "application/x-javascript",
];

/// Rewrite one URL. Relative and already-insecure URLs are returned as-is.
pub fn downgrade_url(url: &str) -> Cow<'_, str> {
    let trimmed = url.trim_start();
    if trimmed
        .get(..8)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("https://"))
    {
        Cow::Owned(format!("http://{}", &trimmed[8..]))
    } else if trimmed.starts_with("//") {
        Cow::Owned(format!("http:{trimmed}"))
    } else {
        Cow::Borrowed(url)
    }
}

/// Whether a URL still needs rewriting.
pub fn is_secure_reference(url: &str) -> bool {
    matches!(downgrade_url(url), Cow::Owned(_))
}

/// Rewrite the target of a `<meta http-equiv="refresh" content="...">`.
pub fn downgrade_refresh(content: &str) -> Cow<'_, str> {
    let Some(caps) = REFRESH_URL.captures(content) else {
        return Cow::Borrowed(content);
    };
    let target = &caps[2];
    match downgrade_url(target) {
        Cow::Borrowed(_) => Cow::Borrowed(content),
        Cow::Owned(url) => Cow::Owned(format!("{}{}{}", &caps[1], url, &caps[3])),
    }
}

/// Rewrite secure references inside CSS or script text, `url(...)` included.
pub fn downgrade_text(text: &str) -> Cow<'_, str> {
    if !HTTPS.is_match(text) && !CSS_PROTOCOL_RELATIVE.is_match(text) {
        return Cow::Borrowed(text);
    }
    let relative_fixed = CSS_PROTOCOL_RELATIVE.replace_all(text, "url(${1}http://");
    Cow::Owned(HTTPS.replace_all(&relative_fixed, "http://").into_owned())
}

/// Whether a response of this content type is rewritten by [`downgrade_text`].
pub fn is_downgradable(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    DOWNGRADE_CONTENT_TYPES.contains(&essence.as_str())
}
