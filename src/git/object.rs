//! Object kinds and parsers for commit, tree and tag bodies.

use std::fmt;

use chrono::{DateTime, FixedOffset};
use serde::Serialize;
use tracing::debug;

use super::object_id::{ObjectFormat, ObjectId};
use crate::error::{GitError, Result};

/// Regular file mode.
pub const MODE_FILE: u32 = 0o100_644;
/// Executable file mode.
pub const MODE_EXECUTABLE: u32 = 0o100_755;
/// Symbolic link mode.
pub const MODE_SYMLINK: u32 = 0o120_000;
/// Subdirectory (tree) mode.
pub const MODE_TREE: u32 = 0o040_000;
/// Gitlink (submodule commit) mode.
pub const MODE_GITLINK: u32 = 0o160_000;

/// The four storable object kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    /// Commit object.
    Commit,
    /// Tree object.
    Tree,
    /// File contents.
    Blob,
    /// Annotated tag.
    Tag,
}

impl ObjectKind {
    /// Name used in loose object headers.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Tree => "tree",
            Self::Blob => "blob",
            Self::Tag => "tag",
        }
    }

    /// Parses a loose object header name.
    pub fn from_name(name: &[u8]) -> Option<Self> {
        match name {
            b"commit" => Some(Self::Commit),
            b"tree" => Some(Self::Tree),
            b"blob" => Some(Self::Blob),
            b"tag" => Some(Self::Tag),
            _ => None,
        }
    }

    /// Maps the 3-bit pack entry type (1..=4).
    pub const fn from_pack_type(ty: u8) -> Option<Self> {
        match ty {
            1 => Some(Self::Commit),
            2 => Some(Self::Tree),
            3 => Some(Self::Blob),
            4 => Some(Self::Tag),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded object body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Object {
    /// Object kind.
    pub kind: ObjectKind,
    /// Body bytes (without the `<kind> <size>\0` header).
    pub data: Vec<u8>,
}

/// Computes the id Git would assign to `data` stored as `kind`.
pub fn hash_object(format: ObjectFormat, kind: ObjectKind, data: &[u8]) -> ObjectId {
    let mut hasher = format.hasher();
    hasher.update(format!("{} {}\0", kind.as_str(), data.len()).as_bytes());
    hasher.update(data);
    hasher.finalize()
}

/// Author or committer line.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Signature {
    /// Display name.
    pub name: String,
    /// Email address without angle brackets.
    pub email: String,
    /// Timestamp with the recorded timezone offset.
    pub when: DateTime<FixedOffset>,
}

impl Signature {
    /// Parses `Name <email> seconds tz`; `None` if any part is malformed.
    fn parse(line: &[u8]) -> Option<Self> {
        let text = String::from_utf8_lossy(line);

        let open = text.find('<')?;
        let close = text[open..].find('>').map(|i| open + i)?;
        let name = text[..open].trim().to_string();
        let email = text[open + 1..close].to_string();

        let mut rest = text[close + 1..].split_whitespace();
        let seconds: i64 = rest.next()?.parse().ok()?;
        let offset = rest.next().map_or(Some(0), parse_tz_offset)?;

        let tz = FixedOffset::east_opt(offset)?;
        let when = DateTime::from_timestamp(seconds, 0)?.with_timezone(&tz);

        Some(Self { name, email, when })
    }

    /// Lenient header parse: a malformed identity is logged and dropped.
    fn parse_header(id: ObjectId, key: &str, line: &[u8]) -> Option<Self> {
        let parsed = Self::parse(line);
        if parsed.is_none() {
            debug!(%id, header = key, line = %String::from_utf8_lossy(line), "ignoring malformed signature");
        }
        parsed
    }
}

/// Parses `+hhmm` / `-hhmm` into seconds east of UTC.
fn parse_tz_offset(tz: &str) -> Option<i32> {
    let (sign, digits) = match tz.as_bytes().first()? {
        b'+' => (1, &tz[1..]),
        b'-' => (-1, &tz[1..]),
        _ => (1, tz),
    };
    if digits.len() != 4 {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    Some(sign * (hours * 3600 + minutes * 60))
}

/// Parsed commit object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commit {
    /// Id of this commit.
    pub id: ObjectId,
    /// Root tree.
    pub tree: ObjectId,
    /// Parents in recorded order; empty for root commits.
    pub parents: Vec<ObjectId>,
    /// Author line.
    pub author: Option<Signature>,
    /// Committer line.
    pub committer: Option<Signature>,
    /// Message body.
    pub message: String,
}

impl Commit {
    /// Parses a commit body.
    pub fn parse(id: ObjectId, data: &[u8]) -> Result<Self> {
        let mut tree = None;
        let mut parents = Vec::new();
        let mut author = None;
        let mut committer = None;

        let mut pos = 0;
        while pos < data.len() {
            let end = data[pos..]
                .iter()
                .position(|b| *b == b'\n')
                .map_or(data.len(), |i| pos + i);
            let line = &data[pos..end];
            pos = end + 1;

            if line.is_empty() {
                break;
            }
            // Continuation of a multi-line header such as gpgsig.
            if line[0] == b' ' {
                continue;
            }

            let (key, value) = split_header(line);
            match key {
                b"tree" => tree = Some(parse_hex_field(value, id)?),
                b"parent" => parents.push(parse_hex_field(value, id)?),
                b"author" => author = Signature::parse_header(id, "author", value),
                b"committer" => committer = Signature::parse_header(id, "committer", value),
                _ => {}
            }
        }

        let tree = tree
            .ok_or_else(|| GitError::corrupt(format!("commit {id}"), "missing tree header"))?;
        let message = if pos < data.len() {
            String::from_utf8_lossy(&data[pos..]).into_owned()
        } else {
            String::new()
        };

        Ok(Self {
            id,
            tree,
            parents,
            author,
            committer,
            message,
        })
    }

    /// First line of the message.
    pub fn summary(&self) -> &str {
        self.message.lines().next().unwrap_or("")
    }
}

/// Parsed annotated tag; only the fields needed for peeling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    /// Tagged object.
    pub target: ObjectId,
    /// Kind of the tagged object.
    pub target_kind: ObjectKind,
    /// Tag name.
    pub name: String,
}

impl Tag {
    /// Parses a tag body.
    pub fn parse(id: ObjectId, data: &[u8]) -> Result<Self> {
        let mut target = None;
        let mut target_kind = None;
        let mut name = String::new();

        for line in data.split(|b| *b == b'\n') {
            if line.is_empty() {
                break;
            }
            let (key, value) = split_header(line);
            match key {
                b"object" => target = Some(parse_hex_field(value, id)?),
                b"type" => target_kind = ObjectKind::from_name(value),
                b"tag" => name = String::from_utf8_lossy(value).into_owned(),
                _ => {}
            }
        }

        match (target, target_kind) {
            (Some(target), Some(target_kind)) => Ok(Self {
                target,
                target_kind,
                name,
            }),
            _ => Err(GitError::corrupt(
                format!("tag {id}"),
                "missing object or type header",
            )),
        }
    }
}

/// One entry of a tree object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeEntry {
    /// File mode (octal as stored).
    pub mode: u32,
    /// Entry name; never contains `/`.
    pub name: Vec<u8>,
    /// Blob, tree or gitlink commit id.
    pub id: ObjectId,
}

impl TreeEntry {
    /// True when the entry is a subtree.
    pub fn is_tree(&self) -> bool {
        self.mode == MODE_TREE
    }
}

/// Parses a tree body into its entries, preserving stored order.
pub fn parse_tree(id: ObjectId, data: &[u8], format: ObjectFormat) -> Result<Vec<TreeEntry>> {
    let oid_len = format.oid_len();
    let what = || format!("tree {id}");
    let mut entries = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        let space = data[pos..]
            .iter()
            .position(|b| *b == b' ')
            .ok_or_else(|| GitError::corrupt(what(), "entry without mode"))?;
        let mode = parse_octal(&data[pos..pos + space])
            .ok_or_else(|| GitError::corrupt(what(), "invalid mode"))?;
        pos += space + 1;

        let nul = data[pos..]
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| GitError::corrupt(what(), "unterminated entry name"))?;
        let name = data[pos..pos + nul].to_vec();
        pos += nul + 1;

        if name.is_empty() || name.contains(&b'/') {
            return Err(GitError::corrupt(what(), "invalid entry name"));
        }
        let raw = data
            .get(pos..pos + oid_len)
            .ok_or_else(|| GitError::corrupt(what(), "truncated entry id"))?;
        let entry_id = ObjectId::from_bytes(raw)
            .ok_or_else(|| GitError::corrupt(what(), "invalid entry id"))?;
        pos += oid_len;

        entries.push(TreeEntry {
            mode,
            name,
            id: entry_id,
        });
    }

    Ok(entries)
}

fn split_header(line: &[u8]) -> (&[u8], &[u8]) {
    match line.iter().position(|b| *b == b' ') {
        Some(i) => (&line[..i], &line[i + 1..]),
        None => (line, &[]),
    }
}

fn parse_hex_field(value: &[u8], owner: ObjectId) -> Result<ObjectId> {
    let text = std::str::from_utf8(value)
        .map_err(|_| GitError::corrupt(format!("object {owner}"), "non-ASCII object id"))?;
    ObjectId::from_hex(text.trim())
}

fn parse_octal(digits: &[u8]) -> Option<u32> {
    if digits.is_empty() || digits.len() > 7 {
        return None;
    }
    digits.iter().try_fold(0u32, |acc, d| match d {
        b'0'..=b'7' => Some(acc * 8 + u32::from(d - b'0')),
        _ => None,
    })
}
