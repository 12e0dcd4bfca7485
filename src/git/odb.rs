//! Object database: loose objects, packs and alternates behind one lookup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace};

use super::delta::apply_delta;
use super::loose::LooseStore;
use super::object::{hash_object, parse_tree, Commit, Object, ObjectKind, Tag, TreeEntry};
use super::object_id::{ObjectFormat, ObjectId};
use super::pack::{discover_packs, DeltaBase, Pack, PackEntry};
use crate::config::EngineOptions;
use crate::error::{GitError, Result};

/// Annotated tags pointing at tags are followed at most this many times.
const MAX_TAG_DEPTH: usize = 32;

/// Content-addressed object lookup for one repository.
///
/// Objects are immutable, so parsed commits are cached for the life of the
/// store. The pack list is rescanned once when a lookup misses, to pick up
/// packs written by a concurrent `git gc`.
#[derive(Debug)]
pub struct ObjectStore {
    format: ObjectFormat,
    options: EngineOptions,
    object_dirs: Vec<PathBuf>,
    loose: Vec<LooseStore>,
    packs: RwLock<Vec<Arc<Pack>>>,
    commits: RwLock<HashMap<ObjectId, Arc<Commit>>>,
}

impl ObjectStore {
    /// Opens the store rooted at `objects_dir`, following `info/alternates`.
    pub fn open(objects_dir: &Path, format: ObjectFormat, options: EngineOptions) -> Result<Self> {
        let mut object_dirs = vec![objects_dir.to_path_buf()];
        object_dirs.extend(read_alternates(objects_dir)?);

        let loose = object_dirs
            .iter()
            .map(|dir| LooseStore::new(dir, format))
            .collect();
        let store = Self {
            format,
            options,
            object_dirs,
            loose,
            packs: RwLock::new(Vec::new()),
            commits: RwLock::new(HashMap::new()),
        };
        store.refresh_packs()?;
        Ok(store)
    }

    /// Hash function of this repository.
    pub fn format(&self) -> ObjectFormat {
        self.format
    }

    /// Rescans pack directories; returns the number of packs now known.
    pub fn refresh_packs(&self) -> Result<usize> {
        let mut packs = Vec::new();
        for dir in &self.object_dirs {
            packs.extend(discover_packs(dir, self.format)?.into_iter().map(Arc::new));
        }

        let mut current = self.packs.write();
        // Keep already-mapped packs so their indexes are not parsed twice.
        let merged: Vec<Arc<Pack>> = packs
            .into_iter()
            .map(|fresh| {
                current
                    .iter()
                    .find(|known| known.pack_path() == fresh.pack_path())
                    .map_or(fresh, Arc::clone)
            })
            .collect();
        debug!(packs = merged.len(), "scanned pack directories");
        *current = merged;
        Ok(current.len())
    }

    /// Reads and verifies an object.
    pub fn read(&self, id: &ObjectId) -> Result<Object> {
        if let Some(object) = self.try_read(id)? {
            return Ok(object);
        }
        if self.refresh_packs()? > 0 {
            if let Some(object) = self.read_packed(id)? {
                return Ok(object);
            }
        }
        Err(GitError::NotFound(*id))
    }

    /// True if the object exists in any backing store.
    pub fn contains(&self, id: &ObjectId) -> Result<bool> {
        if self.loose.iter().any(|store| store.contains(id)) {
            return Ok(true);
        }
        Ok(self.locate_packed(id)?.is_some())
    }

    fn try_read(&self, id: &ObjectId) -> Result<Option<Object>> {
        if let Some(object) = self.read_loose(id)? {
            return Ok(Some(object));
        }
        self.read_packed(id)
    }

    fn read_loose(&self, id: &ObjectId) -> Result<Option<Object>> {
        for store in &self.loose {
            if let Some(object) = store.read(id, self.options.max_object_size)? {
                return Ok(Some(object));
            }
        }
        Ok(None)
    }

    fn locate_packed(&self, id: &ObjectId) -> Result<Option<(Arc<Pack>, u64)>> {
        let packs = self.packs.read().clone();
        for pack in packs {
            if let Some(offset) = pack.find(id)? {
                return Ok(Some((pack, offset)));
            }
        }
        Ok(None)
    }

    fn read_packed(&self, id: &ObjectId) -> Result<Option<Object>> {
        let Some((pack, offset)) = self.locate_packed(id)? else {
            return Ok(None);
        };
        let object = self.resolve_packed(pack, offset)?;
        let actual = hash_object(self.format, object.kind, &object.data);
        if actual != *id {
            return Err(GitError::corrupt(
                format!("packed object {id}"),
                format!("content hashes to {actual}"),
            ));
        }
        trace!(%id, kind = %object.kind, "read packed object");
        Ok(Some(object))
    }

    /// Follows a delta chain down to its base, then applies deltas upward.
    fn resolve_packed(&self, mut pack: Arc<Pack>, mut offset: u64) -> Result<Object> {
        let max = self.options.max_object_size;
        let mut deltas = Vec::new();

        let base = loop {
            if deltas.len() > self.options.max_delta_depth {
                return Err(GitError::corrupt(
                    format!("pack {}", pack.pack_path().display()),
                    format!(
                        "delta chain longer than {} at offset {offset}",
                        self.options.max_delta_depth
                    ),
                ));
            }
            match pack.entry_at(offset, max)? {
                PackEntry::Full(object) => break object,
                PackEntry::Delta { base, delta } => {
                    deltas.push(delta);
                    match base {
                        DeltaBase::Offset(base_offset) => offset = base_offset,
                        DeltaBase::Id(base_id) => match self.locate_packed(&base_id)? {
                            Some((base_pack, base_offset)) => {
                                pack = base_pack;
                                offset = base_offset;
                            }
                            None => match self.read_loose(&base_id)? {
                                Some(object) => break object,
                                None => {
                                    return Err(GitError::corrupt(
                                        format!("pack {}", pack.pack_path().display()),
                                        format!("delta base {base_id} is missing"),
                                    ))
                                }
                            },
                        },
                    }
                }
            }
        };

        let kind = base.kind;
        let mut data = base.data;
        for delta in deltas.iter().rev() {
            data = apply_delta(&data, delta, max).map_err(|e| {
                GitError::corrupt(format!("pack {}", pack.pack_path().display()), e.to_string())
            })?;
        }
        Ok(Object { kind, data })
    }

    /// Reads an object and checks its kind.
    pub fn read_kind(&self, id: &ObjectId, kind: ObjectKind) -> Result<Vec<u8>> {
        let object = self.read(id)?;
        if object.kind != kind {
            return Err(GitError::corrupt(
                format!("object {id}"),
                format!("expected {kind}, found {}", object.kind),
            ));
        }
        Ok(object.data)
    }

    /// Reads a commit, serving repeats from the cache.
    pub fn read_commit(&self, id: &ObjectId) -> Result<Arc<Commit>> {
        if let Some(commit) = self.commits.read().get(id) {
            return Ok(Arc::clone(commit));
        }
        let object = self.read(id).map_err(GitError::into_commit_error)?;
        if object.kind != ObjectKind::Commit {
            return Err(GitError::CommitFailed(format!(
                "{id} is a {}, not a commit",
                object.kind
            )));
        }
        let commit = Arc::new(Commit::parse(*id, &object.data)?);
        self.commits.write().insert(*id, Arc::clone(&commit));
        Ok(commit)
    }

    /// Reads and parses a tree.
    pub fn read_tree(&self, id: &ObjectId) -> Result<Vec<TreeEntry>> {
        let data = self.read_kind(id, ObjectKind::Tree)?;
        parse_tree(*id, &data, self.format)
    }

    /// Follows annotated tags until a commit is reached.
    pub fn peel_to_commit(&self, id: &ObjectId) -> Result<Arc<Commit>> {
        let mut current = *id;
        for _ in 0..MAX_TAG_DEPTH {
            let object = self.read(&current).map_err(GitError::into_commit_error)?;
            match object.kind {
                ObjectKind::Commit => {
                    if let Some(commit) = self.commits.read().get(&current) {
                        return Ok(Arc::clone(commit));
                    }
                    let commit = Arc::new(Commit::parse(current, &object.data)?);
                    self.commits.write().insert(current, Arc::clone(&commit));
                    return Ok(commit);
                }
                ObjectKind::Tag => current = Tag::parse(current, &object.data)?.target,
                other => {
                    return Err(GitError::CommitFailed(format!(
                        "{id} peels to a {other}, not a commit"
                    )))
                }
            }
        }
        Err(GitError::CommitFailed(format!(
            "{id} is nested in more than {MAX_TAG_DEPTH} tags"
        )))
    }

    /// Number of commits parsed and cached so far.
    pub fn cached_commits(&self) -> usize {
        self.commits.read().len()
    }
}

/// Reads `objects/info/alternates`; relative entries resolve against `objects_dir`.
fn read_alternates(objects_dir: &Path) -> Result<Vec<PathBuf>> {
    let path = objects_dir.join("info").join("alternates");
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(GitError::io(format!("reading {}", path.display()), e)),
    };
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| objects_dir.join(line))
        .filter(|dir| dir.is_dir())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::loose::tests::write_loose;
    use crate::git::pack::tests::{write_pack, PackInput};

    fn store(dir: &Path) -> ObjectStore {
        ObjectStore::open(dir, ObjectFormat::Sha1, EngineOptions::default()).unwrap()
    }

    #[test]
    fn reads_loose_and_packed_objects() {
        let dir = tempfile::tempdir().unwrap();
        let loose_id = write_loose(dir.path(), ObjectKind::Blob, b"loose\n");
        let packed = write_pack(
            &dir.path().join("pack"),
            &[PackInput::Full(ObjectKind::Blob, b"packed\n".to_vec())],
        );
        let odb = store(dir.path());

        assert_eq!(odb.read(&loose_id).unwrap().data, b"loose\n");
        assert_eq!(odb.read(&packed[0]).unwrap().data, b"packed\n");
        assert!(odb.contains(&packed[0]).unwrap());
    }

    #[test]
    fn resolves_ofs_delta_chains() {
        let dir = tempfile::tempdir().unwrap();
        let ids = write_pack(
            &dir.path().join("pack"),
            &[
                PackInput::Full(ObjectKind::Blob, b"line one\n".to_vec()),
                PackInput::OfsDelta(0, b"line two\n".to_vec()),
                PackInput::OfsDelta(1, b"line three\n".to_vec()),
            ],
        );
        let odb = store(dir.path());
        let object = odb.read(&ids[2]).unwrap();
        assert_eq!(object.kind, ObjectKind::Blob);
        assert_eq!(object.data, b"line one\nline two\nline three\n");
    }

    #[test]
    fn resolves_ref_delta_against_loose_base() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_loose(dir.path(), ObjectKind::Blob, b"base\n");
        let ids = write_pack(
            &dir.path().join("pack"),
            &[PackInput::RefDelta(
                base,
                ObjectKind::Blob,
                b"base\n".to_vec(),
                b"tail\n".to_vec(),
            )],
        );
        let odb = store(dir.path());
        assert_eq!(odb.read(&ids[0]).unwrap().data, b"base\ntail\n");
    }

    #[test]
    fn delta_depth_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let ids = write_pack(
            &dir.path().join("pack"),
            &[
                PackInput::Full(ObjectKind::Blob, b"a".to_vec()),
                PackInput::OfsDelta(0, b"b".to_vec()),
                PackInput::OfsDelta(1, b"c".to_vec()),
            ],
        );
        let options = EngineOptions {
            max_delta_depth: 1,
            ..EngineOptions::default()
        };
        let odb = ObjectStore::open(dir.path(), ObjectFormat::Sha1, options).unwrap();
        assert!(odb.read(&ids[1]).is_ok());
        assert!(odb.read(&ids[2]).unwrap_err().is_corrupt());
    }

    #[test]
    fn missing_object_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let odb = store(dir.path());
        let id = ObjectId::from_bytes(&[9; 20]).unwrap();
        assert!(matches!(odb.read(&id), Err(GitError::NotFound(_))));
        assert!(matches!(
            odb.read_commit(&id),
            Err(GitError::CommitFailed(_))
        ));
    }

    #[test]
    fn commits_are_cached_and_tags_peeled() {
        let dir = tempfile::tempdir().unwrap();
        let tree = write_loose(dir.path(), ObjectKind::Tree, b"");
        let commit_body = format!("tree {tree}\nauthor a <a@x> 1 +0000\ncommitter a <a@x> 1 +0000\n\nmsg\n");
        let commit = write_loose(dir.path(), ObjectKind::Commit, commit_body.as_bytes());
        let tag_body = format!("object {commit}\ntype commit\ntag v1\n\nrelease\n");
        let tag = write_loose(dir.path(), ObjectKind::Tag, tag_body.as_bytes());

        let odb = store(dir.path());
        assert_eq!(odb.peel_to_commit(&tag).unwrap().id, commit);
        assert_eq!(odb.read_commit(&commit).unwrap().tree, tree);
        assert_eq!(odb.cached_commits(), 1);
        assert!(odb.read_tree(&tree).unwrap().is_empty());
        assert!(matches!(
            odb.read_commit(&tree),
            Err(GitError::CommitFailed(_))
        ));
    }

    #[test]
    fn follows_alternates() {
        let shared = tempfile::tempdir().unwrap();
        let id = write_loose(shared.path(), ObjectKind::Blob, b"shared\n");
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("info")).unwrap();
        std::fs::write(
            dir.path().join("info").join("alternates"),
            format!("{}\n", shared.path().display()),
        )
        .unwrap();

        let odb = store(dir.path());
        assert_eq!(odb.read(&id).unwrap().data, b"shared\n");
    }
}
