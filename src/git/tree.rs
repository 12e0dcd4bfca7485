//! Lazy, depth-first flattening of a tree object into its file entries.

use std::vec::IntoIter;

use super::object::TreeEntry;
use super::object_id::ObjectId;
use super::odb::ObjectStore;
use crate::error::{GitError, Result};

/// A non-tree entry reached from the root tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeFile {
    /// Path from the root, `/`-separated.
    pub path: Vec<u8>,
    /// Entry mode (blob, executable, symlink or gitlink).
    pub mode: u32,
    /// Blob or (for gitlinks) commit id.
    pub id: ObjectId,
}

struct Level {
    prefix: Vec<u8>,
    entries: IntoIter<TreeEntry>,
}

/// Yields every file below a tree in full-path byte order.
///
/// Sub-trees are loaded only when the walk reaches them.
pub struct TreeWalker<'a> {
    store: &'a ObjectStore,
    stack: Vec<Level>,
    last: Option<Vec<u8>>,
}

impl<'a> TreeWalker<'a> {
    /// Starts a walk at `root`; `None` walks an empty tree (unborn HEAD).
    pub fn new(store: &'a ObjectStore, root: Option<&ObjectId>) -> Result<Self> {
        let mut stack = Vec::new();
        if let Some(root) = root {
            stack.push(Level {
                prefix: Vec::new(),
                entries: store.read_tree(root)?.into_iter(),
            });
        }
        Ok(Self {
            store,
            stack,
            last: None,
        })
    }

    fn advance(&mut self) -> Result<Option<TreeFile>> {
        while let Some(level) = self.stack.last_mut() {
            let Some(entry) = level.entries.next() else {
                self.stack.pop();
                continue;
            };

            let mut path = level.prefix.clone();
            if !path.is_empty() {
                path.push(b'/');
            }
            path.extend_from_slice(&entry.name);

            if entry.is_tree() {
                let entries = self.store.read_tree(&entry.id)?.into_iter();
                self.stack.push(Level {
                    prefix: path,
                    entries,
                });
                continue;
            }

            if let Some(last) = &self.last {
                if last.as_slice() >= path.as_slice() {
                    return Err(GitError::corrupt(
                        format!("tree {}", entry.id),
                        format!("entry '{}' is out of order", String::from_utf8_lossy(&path)),
                    ));
                }
            }
            self.last = Some(path.clone());
            return Ok(Some(TreeFile {
                path,
                mode: entry.mode,
                id: entry.id,
            }));
        }
        Ok(None)
    }
}

impl Iterator for TreeWalker<'_> {
    type Item = Result<TreeFile>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(Some(file)) => Some(Ok(file)),
            Ok(None) => None,
            Err(e) => {
                self.stack.clear();
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineOptions;
    use crate::git::loose::tests::write_loose;
    use crate::git::object::{ObjectKind, MODE_FILE, MODE_TREE};
    use crate::git::object_id::ObjectFormat;

    fn tree_bytes(entries: &[(u32, &str, ObjectId)]) -> Vec<u8> {
        let mut out = Vec::new();
        for (mode, name, id) in entries {
            out.extend(format!("{mode:o} {name}\0").into_bytes());
            out.extend_from_slice(id.as_bytes());
        }
        out
    }

    #[test]
    fn walks_nested_trees_in_path_order() {
        let dir = tempfile::tempdir().unwrap();
        let objects = dir.path().join("objects");
        let blob = write_loose(&objects, ObjectKind::Blob, b"x\n");
        let inner = write_loose(
            &objects,
            ObjectKind::Tree,
            &tree_bytes(&[(MODE_FILE, "b.txt", blob)]),
        );
        // Git orders "a-b" before the tree "a" (compared as "a/").
        let root = write_loose(
            &objects,
            ObjectKind::Tree,
            &tree_bytes(&[
                (MODE_FILE, "a-b", blob),
                (MODE_TREE, "a", inner),
                (MODE_FILE, "a0", blob),
            ]),
        );

        let store = ObjectStore::open(&objects, ObjectFormat::Sha1, EngineOptions::default()).unwrap();
        let paths: Vec<String> = TreeWalker::new(&store, Some(&root))
            .unwrap()
            .map(|f| String::from_utf8(f.unwrap().path).unwrap())
            .collect();
        assert_eq!(paths, ["a-b", "a/b.txt", "a0"]);
    }

    #[test]
    fn unsorted_tree_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let objects = dir.path().join("objects");
        let blob = write_loose(&objects, ObjectKind::Blob, b"x\n");
        let root = write_loose(
            &objects,
            ObjectKind::Tree,
            &tree_bytes(&[(MODE_FILE, "b", blob), (MODE_FILE, "a", blob)]),
        );

        let store = ObjectStore::open(&objects, ObjectFormat::Sha1, EngineOptions::default()).unwrap();
        let results: Vec<_> = TreeWalker::new(&store, Some(&root)).unwrap().collect();
        assert_eq!(results.len(), 2);
        assert!(results[1].as_ref().unwrap_err().is_corrupt());
    }

    #[test]
    fn empty_walk_without_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(dir.path(), ObjectFormat::Sha1, EngineOptions::default()).unwrap();
        assert_eq!(TreeWalker::new(&store, None).unwrap().count(), 0);
    }
}
