//! Lazy working-tree scanner.
//!
//! Produces files in the same full-path byte order as the index and tree
//! walks so the status engine can merge the three streams in one pass.

use std::fs::{self, Metadata};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::trace;

use super::ignore::{IgnoreFile, IgnoreMatcher};
use super::index::{Index, StatTime};
use super::object::{MODE_EXECUTABLE, MODE_FILE, MODE_GITLINK, MODE_SYMLINK};
use crate::error::{GitError, Result};

/// What kind of filesystem object a [`WorktreeEntry`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorktreeKind {
    /// Regular file (possibly executable).
    File,
    /// Symbolic link; never followed.
    Symlink,
    /// Directory holding its own repository.
    NestedRepository,
}

/// One file (or nested repository) found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    /// Work-tree relative path, `/`-separated.
    pub path: Vec<u8>,
    /// Absolute filesystem path.
    pub full_path: PathBuf,
    /// Entry kind.
    pub kind: WorktreeKind,
    /// Git mode derived from the file type and executable bit.
    pub mode: u32,
    /// File size, or the link target length for symlinks.
    pub size: u64,
    /// Modification time.
    pub mtime: StatTime,
}

struct Child {
    name: Vec<u8>,
    /// `name` plus `/` for directories that will be descended into, so
    /// siblings sort in full-path order. Nested repositories are emitted as
    /// a single path and keep the bare name, matching gitlink order.
    sort_key: Vec<u8>,
    nested: bool,
    path: PathBuf,
    metadata: Metadata,
}

struct Frame {
    rel: Vec<u8>,
    children: std::vec::IntoIter<Child>,
    ignores: Vec<Arc<IgnoreFile>>,
    ignored: bool,
}

/// Explicit-stack directory walker; see the module docs for ordering.
///
/// Untracked ignored paths are skipped. Tracked paths are always reported
/// and directories containing tracked paths are always entered.
pub struct WorktreeScanner<'a> {
    root: PathBuf,
    ignore: &'a IgnoreMatcher,
    tracked: &'a Index,
    stack: Vec<Frame>,
    started: bool,
}

impl<'a> WorktreeScanner<'a> {
    /// Creates a scanner; nothing is read until the first `next()`.
    pub fn new(root: &Path, ignore: &'a IgnoreMatcher, tracked: &'a Index) -> Self {
        Self {
            root: root.to_path_buf(),
            ignore,
            tracked,
            stack: Vec::new(),
            started: false,
        }
    }

    fn is_tracked(&self, path: &[u8]) -> bool {
        let entries = &self.tracked.entries;
        let at = entries.partition_point(|e| e.path.as_slice() < path);
        entries.get(at).is_some_and(|e| e.path == path)
    }

    fn tracked_mode(&self, path: &[u8]) -> Option<u32> {
        let entries = &self.tracked.entries;
        let at = entries.partition_point(|e| e.path.as_slice() < path);
        entries.get(at).filter(|e| e.path == path).map(|e| e.mode)
    }

    /// A directory is reported as one entry when the index records a
    /// gitlink there or it holds its own `.git`.
    fn is_nested(&self, parent: &[u8], name: &[u8], path: &Path) -> bool {
        let mut rel = parent.to_vec();
        if !rel.is_empty() {
            rel.push(b'/');
        }
        rel.extend_from_slice(name);
        self.tracked_mode(&rel) == Some(MODE_GITLINK) || path.join(".git").exists()
    }

    fn push_dir(&mut self, dir: &Path, rel: Vec<u8>, mut ignores: Vec<Arc<IgnoreFile>>, ignored: bool) -> Result<()> {
        let listing = match fs::read_dir(dir) {
            Ok(listing) => listing,
            // Removed while we were walking.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(GitError::io(format!("listing {}", dir.display()), e)),
        };

        let mut children = Vec::new();
        for entry in listing {
            let entry = entry.map_err(|e| GitError::io(format!("listing {}", dir.display()), e))?;
            let name = os_bytes(&entry.file_name());
            if name == b".git" {
                continue;
            }
            let path = entry.path();
            let metadata = match fs::symlink_metadata(&path) {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(GitError::io(format!("stat {}", path.display()), e)),
            };
            let nested = metadata.is_dir() && self.is_nested(&rel, &name, &path);
            let mut sort_key = name.clone();
            if metadata.is_dir() && !nested {
                sort_key.push(b'/');
            }
            children.push(Child {
                name,
                sort_key,
                nested,
                path,
                metadata,
            });
        }
        children.sort_unstable_by(|a, b| a.sort_key.cmp(&b.sort_key));

        if !ignored {
            if let Some(file) = IgnoreFile::load(&rel, &dir.join(".gitignore"))? {
                if !file.is_empty() {
                    ignores.push(Arc::new(file));
                }
            }
        }

        trace!(dir = %dir.display(), entries = children.len(), "scanned directory");
        self.stack.push(Frame {
            rel,
            children: children.into_iter(),
            ignores,
            ignored,
        });
        Ok(())
    }

    fn advance(&mut self) -> Result<Option<WorktreeEntry>> {
        if !self.started {
            self.started = true;
            let root = self.root.clone();
            self.push_dir(&root, Vec::new(), Vec::new(), false)?;
        }

        loop {
            let Some(frame) = self.stack.last_mut() else {
                return Ok(None);
            };
            let Some(child) = frame.children.next() else {
                self.stack.pop();
                continue;
            };

            let mut rel = frame.rel.clone();
            if !rel.is_empty() {
                rel.push(b'/');
            }
            rel.extend_from_slice(&child.name);
            let parent_ignored = frame.ignored;
            let ignores = frame.ignores.clone();

            let file_type = child.metadata.file_type();
            if file_type.is_dir() {
                if child.nested {
                    if !self.is_tracked(&rel)
                        && (parent_ignored || self.ignore.is_ignored(&ignores, &rel, true))
                    {
                        continue;
                    }
                    return Ok(Some(WorktreeEntry {
                        path: rel,
                        full_path: child.path,
                        kind: WorktreeKind::NestedRepository,
                        mode: MODE_GITLINK,
                        size: 0,
                        mtime: mtime_of(&child.metadata),
                    }));
                }

                let ignored = parent_ignored || self.ignore.is_ignored(&ignores, &rel, true);
                if ignored && !self.tracked.has_entries_under(&rel) {
                    continue;
                }
                self.push_dir(&child.path, rel, ignores, ignored)?;
                continue;
            }

            let (kind, mode, size) = if file_type.is_symlink() {
                let target = match fs::read_link(&child.path) {
                    Ok(target) => target,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(GitError::io(format!("readlink {}", child.path.display()), e)),
                };
                let len = os_bytes(target.as_os_str()).len() as u64;
                (WorktreeKind::Symlink, MODE_SYMLINK, len)
            } else if file_type.is_file() {
                (WorktreeKind::File, file_mode(&child.metadata), child.metadata.len())
            } else {
                // Sockets, fifos and devices are invisible to Git.
                continue;
            };

            if !self.is_tracked(&rel) && (parent_ignored || self.ignore.is_ignored(&ignores, &rel, false)) {
                continue;
            }

            return Ok(Some(WorktreeEntry {
                path: rel,
                full_path: child.path,
                kind,
                mode,
                size,
                mtime: mtime_of(&child.metadata),
            }));
        }
    }
}

impl Iterator for WorktreeScanner<'_> {
    type Item = Result<WorktreeEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => {
                self.stack.clear();
                Some(Err(e))
            }
        }
    }
}

fn mtime_of(metadata: &Metadata) -> StatTime {
    metadata
        .modified()
        .map(StatTime::from_system_time)
        .unwrap_or_default()
}

#[cfg(unix)]
fn file_mode(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    if metadata.permissions().mode() & 0o111 != 0 {
        MODE_EXECUTABLE
    } else {
        MODE_FILE
    }
}

#[cfg(not(unix))]
fn file_mode(_metadata: &Metadata) -> u32 {
    MODE_FILE
}

/// Raw bytes of an OS string (lossy off Unix).
pub(crate) fn os_bytes(s: &std::ffi::OsStr) -> Vec<u8> {
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        s.as_bytes().to_vec()
    }
    #[cfg(not(unix))]
    {
        s.to_string_lossy().into_owned().into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::index::IndexEntry;
    use crate::git::object_id::{ObjectFormat, ObjectId};

    fn tracked(paths: &[&str]) -> Index {
        let mut paths = paths.to_vec();
        paths.sort_unstable();
        Index {
            version: 2,
            entries: paths
                .into_iter()
                .map(|p| IndexEntry {
                    path: p.as_bytes().to_vec(),
                    mode: MODE_FILE,
                    size: 0,
                    mtime: StatTime::default(),
                    ctime: StatTime::default(),
                    id: ObjectId::null(ObjectFormat::Sha1),
                    stage: 0,
                    assume_valid: false,
                    skip_worktree: false,
                    intent_to_add: false,
                })
                .collect(),
            file_mtime: None,
        }
    }

    fn scan(root: &Path, index: &Index) -> Vec<String> {
        let ignore = IgnoreMatcher::default();
        WorktreeScanner::new(root, &ignore, index)
            .map(|e| String::from_utf8(e.unwrap().path).unwrap())
            .collect()
    }

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, rel).unwrap();
    }

    #[test]
    fn yields_full_path_byte_order() {
        let dir = tempfile::tempdir().unwrap();
        for rel in ["a0", "a/b.txt", "a-b", "z", "a/c/d"] {
            touch(dir.path(), rel);
        }
        fs::create_dir_all(dir.path().join(".git/objects")).unwrap();
        fs::create_dir_all(dir.path().join("empty")).unwrap();

        assert_eq!(scan(dir.path(), &tracked(&[])), ["a-b", "a/b.txt", "a/c/d", "a0", "z"]);
    }

    #[test]
    fn ignored_paths_hidden_unless_tracked() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), ".gitignore");
        fs::write(dir.path().join(".gitignore"), "*.log\nbuild/\n!keep.log\n").unwrap();
        for rel in ["app.log", "keep.log", "tracked.log", "build/out", "build/kept", "src/x.log", "src/main.rs"] {
            touch(dir.path(), rel);
        }

        let index = tracked(&["build/kept", "tracked.log"]);
        assert_eq!(
            scan(dir.path(), &index),
            [".gitignore", "build/kept", "keep.log", "src/main.rs", "tracked.log"]
        );
    }

    #[test]
    fn nested_ignore_files_apply_below_their_directory() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "sub/.gitignore");
        fs::write(dir.path().join("sub/.gitignore"), "*.tmp\n").unwrap();
        touch(dir.path(), "sub/a.tmp");
        touch(dir.path(), "b.tmp");

        assert_eq!(scan(dir.path(), &tracked(&[])), ["b.tmp", "sub/.gitignore"]);
    }

    #[test]
    fn nested_repository_is_a_single_entry() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "vendor/lib/.git/HEAD");
        touch(dir.path(), "vendor/lib/src.rs");

        let ignore = IgnoreMatcher::default();
        let index = tracked(&[]);
        let entries: Vec<WorktreeEntry> = WorktreeScanner::new(dir.path(), &ignore, &index)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, b"vendor/lib");
        assert_eq!(entries[0].kind, WorktreeKind::NestedRepository);
    }

    #[test]
    fn nested_repositories_sort_like_gitlinks() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "lib/.git/HEAD");
        touch(dir.path(), "lib.rs");
        touch(dir.path(), "sub/empty.txt");
        touch(dir.path(), "sub-a");

        // `sub` has no `.git` of its own but the index records a gitlink there.
        let mut index = tracked(&["lib.rs"]);
        let mut gitlink = index.entries[0].clone();
        gitlink.path = b"sub".to_vec();
        gitlink.mode = MODE_GITLINK;
        index.entries.push(gitlink);

        assert_eq!(scan(dir.path(), &index), ["lib", "lib.rs", "sub", "sub-a"]);
    }

    #[cfg(unix)]
    #[test]
    fn reports_symlinks_and_executables() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "run.sh");
        fs::set_permissions(dir.path().join("run.sh"), fs::Permissions::from_mode(0o755)).unwrap();
        std::os::unix::fs::symlink("run.sh", dir.path().join("link")).unwrap();

        let ignore = IgnoreMatcher::default();
        let index = tracked(&[]);
        let entries: Vec<WorktreeEntry> = WorktreeScanner::new(dir.path(), &ignore, &index)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(entries[0].path, b"link");
        assert_eq!(entries[0].mode, MODE_SYMLINK);
        assert_eq!(entries[0].size, 6);
        assert_eq!(entries[1].mode, MODE_EXECUTABLE);
    }
}
