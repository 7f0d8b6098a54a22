//! Glyph and entity substitution for clients without Unicode fonts.
//!
//! A [`ConversionTable`] maps short source strings (a Unicode glyph, a named
//! entity such as `&rsquo;`, or a numeric entity such as `&#8217;`) to ASCII
//! replacements. Substitution happens in a single left-to-right pass that
//! always takes the longest key starting at the current position, so the
//! result never depends on the order in which keys were registered.

use std::borrow::Cow;
use std::collections::HashMap;

use tracing::warn;

/// Built-in substitutions: glyph, its named entity (if any), replacement.
///
/// Numeric entity forms (`&#N;`, `&#xH;`) are derived automatically for every
/// glyph, so all spellings of one character convert identically.
const BUILTIN: &[(&str, Option<&str>, &str)] = &[
    // Currency
    ("¢", Some("cent"), "cent"),
    ("€", Some("euro"), "EUR"),
    ("¥", Some("yen"), "YEN"),
    ("£", Some("pound"), "GBP"),
    // Quotes and guillemets
    ("«", Some("laquo"), "'"),
    ("»", Some("raquo"), "'"),
    ("‹", Some("lsaquo"), "<"),
    ("›", Some("rsaquo"), ">"),
    ("‘", Some("lsquo"), "'"),
    ("’", Some("rsquo"), "'"),
    ("“", Some("ldquo"), "''"),
    ("”", Some("rdquo"), "''"),
    ("‚", Some("sbquo"), ","),
    ("„", Some("bdquo"), ",,"),
    ("′", Some("prime"), "'"),
    ("″", Some("Prime"), "''"),
    // Dashes, bullets, spacing
    ("–", Some("ndash"), "-"),
    ("—", Some("mdash"), "--"),
    ("―", Some("horbar"), "-"),
    ("·", Some("middot"), "-"),
    ("•", Some("bull"), "*"),
    ("…", Some("hellip"), "..."),
    ("†", Some("dagger"), "*"),
    ("‡", Some("Dagger"), "**"),
    ("\u{00A0}", Some("nbsp"), " "),
    ("\u{200B}", Some("ZeroWidthSpace"), ""),
    ("\u{200C}", Some("zwnj"), ""),
    ("\u{200D}", Some("zwj"), ""),
    ("\u{FEFF}", None, ""),
    // Math
    ("±", Some("plusmn"), "+/-"),
    ("≈", Some("asymp"), "~"),
    ("≠", Some("ne"), "!="),
    ("×", Some("times"), "x"),
    ("⁄", Some("frasl"), "/"),
    ("°", Some("deg"), "*"),
    ("½", Some("frac12"), "1/2"),
    ("¼", Some("frac14"), "1/4"),
    ("¾", Some("frac34"), "3/4"),
    // Marks
    ("™", Some("trade"), "(tm)"),
    ("®", Some("reg"), "(R)"),
    ("©", Some("copy"), "(c)"),
    // Latin letters outside the common legacy code pages
    ("é", Some("eacute"), "e"),
    ("á", Some("aacute"), "a"),
    ("â", Some("acirc"), "a"),
    ("ó", Some("oacute"), "o"),
    ("ø", Some("oslash"), "o"),
    ("ō", None, "o"),
    ("ū", None, "u"),
    ("Å", Some("Aring"), "A"),
    ("Æ", Some("AElig"), "AE"),
    ("æ", Some("aelig"), "ae"),
    // Arrows and angle brackets
    ("⟨", Some("lang"), "<"),
    ("⟩", Some("rang"), ">"),
    ("←", Some("larr"), "<"),
    ("→", Some("rarr"), ">"),
    ("↑", Some("uarr"), "^"),
    ("↓", Some("darr"), "v"),
    ("↖", Some("nwarr"), "\\"),
    ("↗", Some("nearr"), "/"),
    ("↘", Some("searr"), "\\"),
    ("↙", Some("swarr"), "/"),
    ("▾", Some("dtrif"), "v"),
    // Box drawing and blocks
    ("─", Some("boxh"), "-"),
    ("│", Some("boxv"), "|"),
    ("┌", Some("boxdr"), "+"),
    ("┐", Some("boxdl"), "+"),
    ("└", Some("boxur"), "+"),
    ("┘", Some("boxul"), "+"),
    ("├", Some("boxvr"), "+"),
    ("┤", Some("boxvl"), "+"),
    ("┬", Some("boxhd"), "+"),
    ("┴", Some("boxhu"), "+"),
    ("┼", Some("boxvh"), "+"),
    ("█", Some("block"), "#"),
    ("▌", None, "|"),
    ("▐", None, "|"),
    ("▀", Some("uhblk"), "-"),
    ("▄", Some("lhblk"), "_"),
    // Symbols with no sensible ASCII form
    ("♫", None, ""),
    ("♠", Some("spades"), ""),
];

/// Mapping from glyphs/entities to ASCII replacements.
#[derive(Debug, Clone)]
pub struct ConversionTable {
    entries: HashMap<String, String>,
    /// Longest key in bytes, bounds the match window.
    max_key_len: usize,
    /// First bytes of all keys; positions starting elsewhere are skipped.
    first_bytes: [bool; 256],
}

impl Default for ConversionTable {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            max_key_len: 0,
            first_bytes: [false; 256],
        }
    }
}

impl ConversionTable {
    /// Build a table from explicit pairs.
    ///
    /// Single-character keys also get their decimal and hexadecimal numeric
    /// entity spellings unless those are listed explicitly. A key listed twice
    /// with different replacements keeps the last one and logs a warning.
    pub fn new<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut table = Self::default();
        let mut derived = Vec::new();
        for (key, value) in pairs {
            let key = key.into();
            let value = value.into();
            let mut chars = key.chars();
            if let (Some(ch), None) = (chars.next(), chars.next()) {
                if !ch.is_ascii() {
                    derived.push((numeric_entity(ch), value.clone()));
                    derived.push((hex_entity(ch, false), value.clone()));
                    derived.push((hex_entity(ch, true), value.clone()));
                }
            }
            table.insert(key, value);
        }
        for (key, value) in derived {
            if !table.entries.contains_key(&key) {
                table.insert(key, value);
            }
        }
        table
    }

    /// The table used when the configuration does not supply one.
    pub fn builtin() -> Self {
        let pairs = BUILTIN.iter().flat_map(|(glyph, entity, replacement)| {
            let named = entity.map(|name| (format!("&{name};"), (*replacement).to_string()));
            std::iter::once(((*glyph).to_string(), (*replacement).to_string())).chain(named)
        });
        Self::new(pairs)
    }

    /// Builtin table extended (and overridden) by `overrides`.
    pub fn builtin_with<K, V, I>(overrides: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut table = Self::builtin();
        for (key, value) in Self::new(overrides).entries {
            table.entries.remove(&key);
            table.insert(key, value);
        }
        table
    }

    fn insert(&mut self, key: String, value: String) {
        if key.is_empty() {
            return;
        }
        if let Some(previous) = self.entries.get(&key) {
            if *previous != value {
                warn!(key = %key, previous = %previous, replacement = %value, "Duplicate conversion key, keeping the last replacement");
            }
        }
        self.max_key_len = self.max_key_len.max(key.len());
        self.first_bytes[usize::from(key.as_bytes()[0])] = true;
        self.entries.insert(key, value);
    }

    /// Replacement for an exact key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replace every table key in `text` with its ASCII replacement.
    ///
    /// Characters without an entry pass through unchanged. Already escaped
    /// entities (`&amp;rsquo;`) are left alone because no key starts inside
    /// them.
    pub fn convert<'a>(&self, text: &'a str) -> Cow<'a, str> {
        if self.entries.is_empty() {
            return Cow::Borrowed(text);
        }

        let bytes = text.as_bytes();
        let mut out: Option<String> = None;
        let mut copied_up_to = 0;
        let mut pos = 0;

        while pos < bytes.len() {
            if !self.first_bytes[usize::from(bytes[pos])] {
                pos += 1;
                continue;
            }
            match self.longest_match(text, pos) {
                Some((len, replacement)) => {
                    let buf = out.get_or_insert_with(|| String::with_capacity(text.len()));
                    buf.push_str(&text[copied_up_to..pos]);
                    buf.push_str(replacement);
                    pos += len;
                    copied_up_to = pos;
                }
                None => pos += 1,
            }
        }

        match out {
            Some(mut buf) => {
                buf.push_str(&text[copied_up_to..]);
                Cow::Owned(buf)
            }
            None => Cow::Borrowed(text),
        }
    }

    fn longest_match(&self, text: &str, pos: usize) -> Option<(usize, &str)> {
        if !text.is_char_boundary(pos) {
            return None;
        }
        let window = self.max_key_len.min(text.len() - pos);
        (1..=window)
            .rev()
            .filter(|len| text.is_char_boundary(pos + len))
            .find_map(|len| {
                self.entries
                    .get(&text[pos..pos + len])
                    .map(|replacement| (len, replacement.as_str()))
            })
    }
}

fn numeric_entity(ch: char) -> String {
    format!("&#{};", u32::from(ch))
}

fn hex_entity(ch: char, upper: bool) -> String {
    if upper {
        format!("&#x{:X};", u32::from(ch))
    } else {
        format!("&#x{:x};", u32::from(ch))
    }
}
