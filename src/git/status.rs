//! Working-tree status: HEAD tree vs index vs files on disk.
//!
//! The three inputs are each sorted by path bytes, so classification is a
//! single merge-walk that never holds more than one path from each stream.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::Serialize;
use tracing::{debug, trace};

use super::index::{Index, IndexEntry, StatTime};
use super::object::{MODE_GITLINK, MODE_SYMLINK};
use super::object_id::{ObjectFormat, ObjectId};
use super::odb::ObjectStore;
use super::refs::RefStore;
use super::repository::read_gitfile;
use super::tree::{TreeFile, TreeWalker};
use super::worktree::{os_bytes, WorktreeEntry, WorktreeKind, WorktreeScanner};
use crate::config::EngineOptions;
use crate::error::{GitError, Result};

const MODE_TYPE_MASK: u32 = 0o170_000;

/// Per-path change flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct StatusFlags {
    /// Staged addition.
    pub index_new: bool,
    /// Staged content or mode change, or an unmerged path.
    pub index_modified: bool,
    /// Staged removal.
    pub index_deleted: bool,
    /// Untracked file.
    pub wt_new: bool,
    /// Unstaged modification.
    pub wt_modified: bool,
    /// Tracked file missing from disk.
    pub wt_deleted: bool,
}

impl StatusFlags {
    /// True when no flag is set.
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }

    /// Two-character porcelain code such as `"M "`, `" D"` or `"??"`.
    pub fn short_code(&self) -> String {
        let staged = if self.index_new {
            'A'
        } else if self.index_modified {
            'M'
        } else if self.index_deleted {
            'D'
        } else {
            ' '
        };

        if self.wt_new && staged == ' ' {
            return "??".to_string();
        }

        let unstaged = if self.wt_new {
            '?'
        } else if self.wt_modified {
            'M'
        } else if self.wt_deleted {
            'D'
        } else {
            ' '
        };
        [staged, unstaged].iter().collect()
    }
}

/// A path with at least one flag set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusEntry {
    /// Work-tree relative path.
    pub path: String,
    /// What changed.
    #[serde(flatten)]
    pub flags: StatusFlags,
}

/// Changed paths in path order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct StatusList {
    entries: Vec<StatusEntry>,
}

impl StatusList {
    /// Entries in path order.
    pub fn iter(&self) -> std::slice::Iter<'_, StatusEntry> {
        self.entries.iter()
    }

    /// Number of changed paths.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing changed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when no path carries a flag.
    pub fn is_clean(&self) -> bool {
        self.entries.iter().all(|e| e.flags.is_clean())
    }

    /// Flags for `path`, or `None` if it is unchanged.
    pub fn get(&self, path: &str) -> Option<StatusFlags> {
        self.entries
            .binary_search_by(|e| e.path.as_bytes().cmp(path.as_bytes()))
            .ok()
            .map(|i| self.entries[i].flags)
    }
}

impl IntoIterator for StatusList {
    type Item = StatusEntry;
    type IntoIter = std::vec::IntoIter<StatusEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl FromIterator<StatusEntry> for StatusList {
    fn from_iter<T: IntoIterator<Item = StatusEntry>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Knobs for a status run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusOptions {
    /// Hash every tracked file regardless of stat data.
    pub force_rehash: bool,
    /// Report untracked files.
    pub include_untracked: bool,
    /// Compare the executable bit (`core.fileMode`).
    pub trust_filemode: bool,
}

impl Default for StatusOptions {
    fn default() -> Self {
        Self {
            force_rehash: false,
            include_untracked: true,
            trust_filemode: true,
        }
    }
}

impl StatusOptions {
    /// Defaults with `force_rehash` taken from engine options.
    pub fn from_engine(options: &EngineOptions) -> Self {
        Self {
            force_rehash: options.force_rehash,
            ..Self::default()
        }
    }
}

/// Holds one look-ahead item of a fallible sorted stream.
struct Cursor<T, I> {
    iter: I,
    head: Option<T>,
}

impl<T, I: Iterator<Item = Result<T>>> Cursor<T, I> {
    fn new(mut iter: I) -> Result<Self> {
        let head = iter.next().transpose()?;
        Ok(Self { iter, head })
    }

    fn peek(&self) -> Option<&T> {
        self.head.as_ref()
    }

    fn take(&mut self) -> Result<Option<T>> {
        let current = self.head.take();
        self.head = self.iter.next().transpose()?;
        Ok(current)
    }
}

/// Lazy merge-walk yielding only changed paths.
pub struct StatusWalk<'a> {
    format: ObjectFormat,
    options: StatusOptions,
    tree: Cursor<TreeFile, TreeWalker<'a>>,
    index: &'a Index,
    index_pos: usize,
    worktree: Option<Cursor<WorktreeEntry, WorktreeScanner<'a>>>,
}

impl<'a> StatusWalk<'a> {
    /// Prepares a walk. `head_tree` is `None` on an unborn branch and
    /// `worktree` is `None` for bare repositories.
    pub fn new(
        store: &'a ObjectStore,
        head_tree: Option<&ObjectId>,
        index: &'a Index,
        worktree: Option<WorktreeScanner<'a>>,
        options: StatusOptions,
    ) -> Result<Self> {
        Ok(Self {
            format: store.format(),
            options,
            tree: Cursor::new(TreeWalker::new(store, head_tree)?)?,
            index,
            index_pos: 0,
            worktree: worktree.map(Cursor::new).transpose()?,
        })
    }

    fn next_path(&self) -> Option<Vec<u8>> {
        [
            self.tree.peek().map(|f| f.path.as_slice()),
            self.index.entries.get(self.index_pos).map(|e| e.path.as_slice()),
            self.worktree
                .as_ref()
                .and_then(Cursor::peek)
                .map(|e| e.path.as_slice()),
        ]
        .into_iter()
        .flatten()
        .min()
        .map(<[u8]>::to_vec)
    }

    fn step(&mut self) -> Result<Option<StatusEntry>> {
        while let Some(path) = self.next_path() {
            let head = if self.tree.peek().is_some_and(|f| f.path == path) {
                self.tree.take()?
            } else {
                None
            };

            let index = self.index;
            let start = self.index_pos;
            while index
                .entries
                .get(self.index_pos)
                .is_some_and(|e| e.path == path)
            {
                self.index_pos += 1;
            }
            let staged = &index.entries[start..self.index_pos];

            let on_disk = match &mut self.worktree {
                Some(cursor) if cursor.peek().is_some_and(|e| e.path == path) => cursor.take()?,
                _ => None,
            };

            let flags = self.classify(head.as_ref(), staged, on_disk.as_ref())?;
            if !flags.is_clean() {
                let path = String::from_utf8_lossy(&path).into_owned();
                trace!(path = %path, code = %flags.short_code(), "changed path");
                return Ok(Some(StatusEntry { path, flags }));
            }
        }
        Ok(None)
    }

    fn classify(
        &self,
        head: Option<&TreeFile>,
        staged: &[IndexEntry],
        on_disk: Option<&WorktreeEntry>,
    ) -> Result<StatusFlags> {
        let mut flags = StatusFlags::default();

        if staged.iter().any(|e| e.stage > 0) {
            flags.index_modified = true;
            return Ok(flags);
        }
        let entry = staged.first();

        match (head, entry) {
            (None, Some(e)) if !e.intent_to_add => flags.index_new = true,
            (Some(_), None) => flags.index_deleted = true,
            (Some(h), Some(e)) if !e.intent_to_add => {
                flags.index_modified = h.id != e.id || h.mode != e.mode;
            }
            _ => {}
        }

        if self.worktree.is_none() {
            return Ok(flags);
        }
        match (entry, on_disk) {
            (Some(e), None) => flags.wt_deleted = !e.skip_worktree,
            (None, Some(_)) => flags.wt_new = self.options.include_untracked,
            (Some(e), Some(_)) if e.intent_to_add => flags.wt_new = true,
            (Some(e), Some(w)) => flags.wt_modified = self.worktree_modified(e, w)?,
            (None, None) => {}
        }
        Ok(flags)
    }

    fn worktree_modified(&self, entry: &IndexEntry, file: &WorktreeEntry) -> Result<bool> {
        if entry.assume_valid || entry.skip_worktree {
            return Ok(false);
        }

        let is_gitlink = entry.mode == MODE_GITLINK;
        if is_gitlink || file.kind == WorktreeKind::NestedRepository {
            if is_gitlink != (file.kind == WorktreeKind::NestedRepository) {
                return Ok(true);
            }
            return Ok(submodule_head(&file.full_path).is_some_and(|id| id != entry.id));
        }

        if entry.mode & MODE_TYPE_MASK != file.mode & MODE_TYPE_MASK {
            return Ok(true);
        }
        if self.options.trust_filemode && entry.mode != file.mode {
            return Ok(true);
        }
        // A zero size means the stat data was never filled in, so only the
        // content can decide.
        let size_matches = entry.size == file.size as u32;
        if !size_matches && entry.size != 0 {
            return Ok(true);
        }

        let stat_matches = size_matches && entry.mtime.matches(&file.mtime);
        if stat_matches && !self.options.force_rehash && !self.is_racy(entry) {
            return Ok(false);
        }

        let id = match hash_worktree_file(self.format, file) {
            Ok(Some(id)) => id,
            Ok(None) => return Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => {
                return Err(GitError::io(format!("hashing {}", file.full_path.display()), e));
            }
        };
        trace!(path = %file.full_path.display(), "rehashed file");
        Ok(id != entry.id)
    }

    /// Entry written in the same second the index was, so its stat data
    /// cannot prove the content is unchanged.
    fn is_racy(&self, entry: &IndexEntry) -> bool {
        self.index
            .file_mtime
            .is_some_and(|index_time: StatTime| entry.mtime.secs >= index_time.secs)
    }
}

impl Iterator for StatusWalk<'_> {
    type Item = Result<StatusEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.step().transpose()
    }
}

/// Blob id of a file or symlink on disk; `None` if it changed size while
/// being read.
fn hash_worktree_file(format: ObjectFormat, file: &WorktreeEntry) -> std::io::Result<Option<ObjectId>> {
    let mut hasher = format.hasher();
    if file.mode == MODE_SYMLINK {
        let target = os_bytes(std::fs::read_link(&file.full_path)?.as_os_str());
        hasher.update(format!("blob {}\0", target.len()).as_bytes());
        hasher.update(&target);
        return Ok(Some(hasher.finalize()));
    }

    let mut handle = File::open(&file.full_path)?;
    let len = handle.metadata()?.len();
    hasher.update(format!("blob {len}\0").as_bytes());
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = handle.read(&mut buf)?;
        if n == 0 {
            break;
        }
        total += n as u64;
        hasher.update(&buf[..n]);
    }
    Ok((total == len).then(|| hasher.finalize()))
}

/// HEAD commit of a checked-out submodule, if readable.
fn submodule_head(path: &Path) -> Option<ObjectId> {
    let git_dir = match read_gitfile(&path.join(".git")) {
        Ok(Some(dir)) => dir,
        Ok(None) => return None,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "unreadable submodule");
            return None;
        }
    };
    RefStore::new(&git_dir, &git_dir, EngineOptions::default())
        .resolve("HEAD")
        .map_err(|e| debug!(path = %path.display(), error = %e, "submodule HEAD unresolved"))
        .ok()
}
