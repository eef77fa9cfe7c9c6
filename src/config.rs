//! Run configuration documents.
//!
//! Operators describe a run in a plain-text document made of `[section]` headers
//! and `key = value` lines. The orchestrator ships the whole document to every
//! peer with the CONFIG command; each peer then scopes it to its own section
//! (`Producer.tlu`, `DataCollector`, ...).
//!
//! Parsing rules:
//!
//! - blank lines and lines starting with `;` or `#` are ignored;
//! - a value wrapped in matching `'` or `"` is taken verbatim without the quotes;
//! - otherwise anything after an inline `;` or `#` is dropped;
//! - keys and values are trimmed;
//! - keys before the first header belong to the unnamed section `""`, which is
//!   kept even when the document is scoped to another section.
//!
//! Typed getters parse on every read and fall back to the supplied default when
//! the key is missing or does not parse.

use crate::error::{AppResult, DaqError};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

type Section = BTreeMap<String, String>;

/// Key name holding the document name in the unnamed section.
pub const NAME_KEY: &str = "Name";

/// A sectioned key/value document with a current section.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Configuration {
    sections: BTreeMap<String, Section>,
    current: String,
}

fn parse_sections(text: &str) -> BTreeMap<String, Section> {
    let mut sections: BTreeMap<String, Section> = BTreeMap::new();
    sections.insert(String::new(), Section::new());
    let mut current = String::new();

    for raw in text.lines() {
        let Some((key, value)) = raw.split_once('=') else {
            let line = raw.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if line.len() >= 2 && line.starts_with('[') && line.ends_with(']') {
                current = line[1..line.len() - 1].to_string();
                sections.entry(current.clone()).or_default();
            }
            continue;
        };
        let key = key.trim();
        if key.starts_with(';') || key.starts_with('#') {
            continue;
        }
        let value = unquote(value.trim());
        sections
            .entry(current.clone())
            .or_default()
            .insert(key.to_string(), value);
    }
    sections
}

fn unquote(value: &str) -> String {
    let quoted = value.len() >= 2
        && ((value.starts_with('\'') && value.ends_with('\''))
            || (value.starts_with('"') && value.ends_with('"')));
    if quoted {
        return value[1..value.len() - 1].to_string();
    }
    match value.find([';', '#']) {
        Some(idx) => value[..idx].trim().to_string(),
        None => value.to_string(),
    }
}

fn parse_int(text: &str) -> Option<i64> {
    let text = text.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let magnitude = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()?
    } else {
        digits.parse::<i64>().ok()?
    };
    Some(if negative { -magnitude } else { magnitude })
}

fn parse_uint(text: &str) -> Option<u64> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Configuration {
    /// Empty document.
    pub fn new() -> Self {
        Self::parse("")
    }

    /// Parse a whole document. The current section is the unnamed one.
    pub fn parse(text: &str) -> Self {
        Self {
            sections: parse_sections(text),
            current: String::new(),
        }
    }

    /// Parse and keep only the unnamed section and `section`, which becomes current.
    pub fn parse_with_section(text: &str, section: &str) -> Self {
        if section.is_empty() {
            return Self::parse(text);
        }
        let mut all = parse_sections(text);
        let mut sections = BTreeMap::new();
        sections.insert(String::new(), all.remove("").unwrap_or_default());
        if let Some(wanted) = all.remove(section) {
            sections.insert(section.to_string(), wanted);
            return Self {
                sections,
                current: section.to_string(),
            };
        }
        Self {
            sections,
            current: String::new(),
        }
    }

    /// Read a document from disk and record its path under [`NAME_KEY`].
    pub fn from_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| {
            DaqError::Configuration(format!("cannot read {}: {err}", path.display()))
        })?;
        let mut conf = Self::parse(&text);
        conf.sections
            .entry(String::new())
            .or_default()
            .insert(NAME_KEY.to_string(), path.display().to_string());
        Ok(conf)
    }

    /// Copy of this document scoped to `section` (unnamed section kept).
    pub fn scoped(&self, section: &str) -> Self {
        let mut sections = BTreeMap::new();
        sections.insert(String::new(), self.sections.get("").cloned().unwrap_or_default());
        let mut current = String::new();
        if let Some(wanted) = self.sections.get(section) {
            sections.insert(section.to_string(), wanted.clone());
            current = section.to_string();
        }
        Self { sections, current }
    }

    /// Document name, empty when unset.
    pub fn name(&self) -> &str {
        self.sections
            .get("")
            .and_then(|s| s.get(NAME_KEY))
            .map_or("", String::as_str)
    }

    /// Switch the current section, creating it when missing.
    pub fn set_section(&mut self, section: &str) {
        self.sections.entry(section.to_string()).or_default();
        self.current = section.to_string();
    }

    /// Switch to an existing section. Returns `false` and stays put otherwise.
    pub fn select_section(&mut self, section: &str) -> bool {
        if self.sections.contains_key(section) {
            self.current = section.to_string();
            true
        } else {
            false
        }
    }

    /// Name of the current section.
    pub fn current_section(&self) -> &str {
        &self.current
    }

    /// Whether a section exists.
    pub fn has_section(&self, section: &str) -> bool {
        self.sections.contains_key(section)
    }

    /// All section names, the unnamed one first.
    pub fn sections(&self) -> Vec<&str> {
        self.sections.keys().map(String::as_str).collect()
    }

    /// Keys of the current section.
    pub fn keys(&self) -> Vec<&str> {
        self.current_map().map_or_else(Vec::new, |s| s.keys().map(String::as_str).collect())
    }

    /// Whether the current section has `key`.
    pub fn has(&self, key: &str) -> bool {
        self.raw(key).is_some()
    }

    fn current_map(&self) -> Option<&Section> {
        self.sections.get(&self.current)
    }

    /// Raw string value in the current section.
    pub fn raw(&self, key: &str) -> Option<&str> {
        self.current_map().and_then(|s| s.get(key)).map(String::as_str)
    }

    /// Set a value in the current section.
    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) {
        self.sections
            .entry(self.current.clone())
            .or_default()
            .insert(key.into(), value.to_string());
    }

    /// String value or `default`.
    pub fn get_str(&self, key: &str, default: &str) -> String {
        self.raw(key).unwrap_or(default).to_string()
    }

    /// Boolean value (`1/0`, `true/false`, `yes/no`, `on/off`) or `default`.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.raw(key).and_then(parse_bool).unwrap_or(default)
    }

    /// Signed integer (decimal or `0x` hex) or `default`.
    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        self.raw(key).and_then(parse_int).unwrap_or(default)
    }

    /// Unsigned integer (decimal or `0x` hex) or `default`.
    pub fn get_uint(&self, key: &str, default: u64) -> u64 {
        self.raw(key).and_then(parse_uint).unwrap_or(default)
    }

    /// Floating point value or `default`.
    pub fn get_float(&self, key: &str, default: f64) -> f64 {
        self.raw(key)
            .and_then(|v| f64::from_str(v.trim()).ok())
            .unwrap_or(default)
    }

    /// Strict variant of [`get_uint`](Self::get_uint) for required settings.
    pub fn require_uint(&self, key: &str) -> AppResult<u64> {
        let raw = self.raw(key).ok_or_else(|| {
            DaqError::Configuration(format!("missing key '{key}' in section [{}]", self.current))
        })?;
        parse_uint(raw).ok_or_else(|| {
            DaqError::Configuration(format!("'{key}' = '{raw}' is not an unsigned integer"))
        })
    }
}

impl FromStr for Configuration {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

/// Re-serialises every section; parsing the output yields an equal document.
impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, section) in &self.sections {
            if !name.is_empty() {
                writeln!(f, "[{name}]")?;
            }
            for (key, value) in section {
                if value.contains([';', '#']) || value.trim() != value {
                    writeln!(f, "{key} = \"{value}\"")?;
                } else {
                    writeln!(f, "{key} = {value}")?;
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
