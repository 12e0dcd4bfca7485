//! Minimal reader for Git's config file syntax.
//!
//! Supports `[section]`, `[section "subsection"]`, the legacy
//! `[section.subsection]` form, quoted values with escapes, and `#` / `;`
//! comments. `include.path` directives are not followed.

use std::path::Path;

use crate::error::{GitError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
struct ConfigEntry {
    section: String,
    subsection: Option<String>,
    key: String,
    value: Option<String>,
}

/// Parsed configuration; later entries override earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitConfig {
    entries: Vec<ConfigEntry>,
}

impl GitConfig {
    /// Loads a config file; a missing file is an empty config.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text).map_err(|detail| {
                GitError::corrupt(format!("config {}", path.display()), detail)
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(GitError::io(format!("reading {}", path.display()), e)),
        }
    }

    /// Parses config text.
    pub fn parse(text: &str) -> std::result::Result<Self, String> {
        let mut entries = Vec::new();
        let mut section: Option<(String, Option<String>)> = None;

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(rest) = line.strip_prefix('[') {
                let close = rest
                    .find(']')
                    .ok_or_else(|| format!("line {}: unterminated section header", lineno + 1))?;
                section = Some(parse_section_header(&rest[..close]));
                continue;
            }

            let (name, subsection) = section
                .clone()
                .ok_or_else(|| format!("line {}: key outside of a section", lineno + 1))?;
            let (key, value) = match line.split_once('=') {
                Some((key, value)) => (key.trim(), Some(parse_value(value))),
                None => (strip_comment(line).trim(), None),
            };
            if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
                return Err(format!("line {}: invalid key '{key}'", lineno + 1));
            }

            entries.push(ConfigEntry {
                section: name,
                subsection,
                key: key.to_ascii_lowercase(),
                value,
            });
        }

        Ok(Self { entries })
    }

    fn lookup(&self, section: &str, subsection: Option<&str>, key: &str) -> Option<&ConfigEntry> {
        self.entries.iter().rev().find(|e| {
            e.section.eq_ignore_ascii_case(section)
                && e.subsection.as_deref() == subsection
                && e.key.eq_ignore_ascii_case(key)
        })
    }

    /// Last value for `section[.subsection].key`.
    pub fn get(&self, section: &str, subsection: Option<&str>, key: &str) -> Option<&str> {
        self.lookup(section, subsection, key)
            .and_then(|e| e.value.as_deref())
    }

    /// Boolean value; a bare key counts as true.
    pub fn get_bool(&self, section: &str, subsection: Option<&str>, key: &str) -> Option<bool> {
        let entry = self.lookup(section, subsection, key)?;
        match entry.value.as_deref() {
            None => Some(true),
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Some(true),
                "false" | "no" | "off" | "0" | "" => Some(false),
                _ => None,
            },
        }
    }
}

fn parse_section_header(header: &str) -> (String, Option<String>) {
    let header = header.trim();
    if let Some((name, rest)) = header.split_once(char::is_whitespace) {
        let sub = rest.trim().trim_matches('"').replace("\\\"", "\"").replace("\\\\", "\\");
        return (name.to_ascii_lowercase(), Some(sub));
    }
    match header.split_once('.') {
        Some((name, sub)) => (name.to_ascii_lowercase(), Some(sub.to_ascii_lowercase())),
        None => (header.to_ascii_lowercase(), None),
    }
}

fn strip_comment(text: &str) -> &str {
    text.find(['#', ';']).map_or(text, |i| &text[..i])
}

fn parse_value(raw: &str) -> String {
    let mut out = String::new();
    let mut in_quotes = false;
    let mut chars = raw.trim().chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => in_quotes = !in_quotes,
            '\\' => match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => {}
            },
            '#' | ';' if !in_quotes => break,
            other => out.push(other),
        }
    }

    if in_quotes {
        out
    } else {
        out.trim_end().to_string()
    }
}
