//! Ignore rules from `.gitignore`, `info/exclude` and `core.excludesFile`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use globset::{GlobBuilder, GlobMatcher};
use tracing::debug;

use super::config::GitConfig;
use crate::error::{GitError, Result};

#[derive(Debug, Clone)]
struct IgnorePattern {
    matcher: GlobMatcher,
    negated: bool,
    dir_only: bool,
    /// No `/` except a trailing one: match the final path component only.
    basename_only: bool,
}

/// Patterns from one ignore file, relative to the directory holding it.
#[derive(Debug, Clone, Default)]
pub struct IgnoreFile {
    base: Vec<u8>,
    patterns: Vec<IgnorePattern>,
}

impl IgnoreFile {
    /// Parses ignore-file text whose patterns apply below `base`
    /// (a work-tree relative directory, empty for the root).
    pub fn parse(base: &[u8], text: &str) -> Self {
        let patterns = text.lines().filter_map(parse_line).collect();
        Self {
            base: base.to_vec(),
            patterns,
        }
    }

    /// Loads an ignore file; `Ok(None)` if it does not exist.
    pub fn load(base: &[u8], path: &Path) -> Result<Option<Self>> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(Self::parse(base, &String::from_utf8_lossy(&bytes)))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(GitError::io(format!("reading {}", path.display()), e)),
        }
    }

    /// True when the file holds no usable pattern.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Verdict of the last matching pattern: `Some(true)` ignored,
    /// `Some(false)` re-included, `None` no opinion.
    pub fn matches(&self, path: &[u8], is_dir: bool) -> Option<bool> {
        let relative = if self.base.is_empty() {
            path
        } else {
            path.strip_prefix(self.base.as_slice())?.strip_prefix(b"/")?
        };
        let relative = String::from_utf8_lossy(relative);
        let basename = relative.rsplit('/').next().unwrap_or(&relative);

        self.patterns.iter().rev().find_map(|pattern| {
            if pattern.dir_only && !is_dir {
                return None;
            }
            let candidate = if pattern.basename_only { basename } else { &relative };
            pattern
                .matcher
                .is_match(candidate)
                .then_some(!pattern.negated)
        })
    }
}

fn parse_line(line: &str) -> Option<IgnorePattern> {
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let mut pattern = trim_trailing_spaces(line);
    let negated = pattern.starts_with('!');
    if negated {
        pattern = &pattern[1..];
    } else if pattern.starts_with("\\!") || pattern.starts_with("\\#") {
        pattern = &pattern[1..];
    }

    let dir_only = pattern.ends_with('/');
    let pattern = pattern.trim_end_matches('/');
    if pattern.is_empty() {
        return None;
    }
    let basename_only = !pattern.contains('/');
    let pattern = pattern.strip_prefix('/').unwrap_or(pattern);

    match GlobBuilder::new(pattern)
        .literal_separator(true)
        .backslash_escape(true)
        .build()
    {
        Ok(glob) => Some(IgnorePattern {
            matcher: glob.compile_matcher(),
            negated,
            dir_only,
            basename_only,
        }),
        Err(e) => {
            debug!(pattern, error = %e, "skipping unparsable ignore pattern");
            None
        }
    }
}

/// Drops trailing spaces unless escaped with a backslash.
fn trim_trailing_spaces(line: &str) -> &str {
    let mut end = line.len();
    while end > 0 && line.as_bytes()[end - 1] == b' ' {
        if end >= 2 && line.as_bytes()[end - 2] == b'\\' {
            break;
        }
        end -= 1;
    }
    &line[..end]
}

/// Repository-wide ignore sources, lowest precedence first.
#[derive(Debug, Clone, Default)]
pub struct IgnoreMatcher {
    globals: Vec<Arc<IgnoreFile>>,
}

impl IgnoreMatcher {
    /// Loads `core.excludesFile` (or the XDG default) and `info/exclude`.
    pub fn load(common_dir: &Path, config: &GitConfig) -> Result<Self> {
        let mut globals = Vec::new();
        if let Some(path) = excludes_file(config) {
            if let Some(file) = IgnoreFile::load(b"", &path)? {
                debug!(path = %path.display(), "loaded global excludes");
                globals.push(Arc::new(file));
            }
        }
        if let Some(file) = IgnoreFile::load(b"", &common_dir.join("info").join("exclude"))? {
            globals.push(Arc::new(file));
        }
        Ok(Self { globals })
    }

    /// Builds a matcher from already parsed files.
    pub fn from_files(globals: Vec<IgnoreFile>) -> Self {
        Self {
            globals: globals.into_iter().map(Arc::new).collect(),
        }
    }

    /// Decides `path` against the per-directory `chain` (root first) and
    /// then the global sources. Deeper files win over shallower ones.
    pub fn is_ignored(&self, chain: &[Arc<IgnoreFile>], path: &[u8], is_dir: bool) -> bool {
        chain
            .iter()
            .rev()
            .chain(self.globals.iter().rev())
            .find_map(|file| file.matches(path, is_dir))
            .unwrap_or(false)
    }
}

fn excludes_file(config: &GitConfig) -> Option<PathBuf> {
    match config.get("core", None, "excludesfile") {
        Some(value) => Some(expand_home(value)),
        None => dirs::config_dir().map(|dir| dir.join("git").join("ignore")),
    }
}

fn expand_home(value: &str) -> PathBuf {
    match value.strip_prefix("~/") {
        Some(rest) => dirs::home_dir().map_or_else(|| PathBuf::from(value), |home| home.join(rest)),
        None => PathBuf::from(value),
    }
}
