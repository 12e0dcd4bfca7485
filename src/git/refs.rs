//! Reference resolution over loose ref files and `packed-refs`.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use tracing::{debug, trace};

use super::config::GitConfig;
use super::object_id::ObjectId;
use crate::config::EngineOptions;
use crate::error::{GitError, Result};
use crate::utils::read_optional;

/// Prefixes stripped by [`shorthand`], most specific first.
const SHORTHAND_PREFIXES: [&str; 3] = ["refs/heads/", "refs/tags/", "refs/remotes/"];

/// Value stored in a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefTarget {
    /// Points straight at an object.
    Direct(ObjectId),
    /// Names another reference.
    Symbolic(String),
}

/// State of HEAD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Head {
    /// HEAD names a branch (which may not exist yet).
    Branch(String),
    /// HEAD holds a commit id.
    Detached(ObjectId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PackedRef {
    id: ObjectId,
    peeled: Option<ObjectId>,
}

#[derive(Debug, Default)]
struct PackedRefsCache {
    stamp: Option<(SystemTime, u64)>,
    refs: HashMap<String, PackedRef>,
}

/// Strips `refs/heads/`, `refs/tags/` or `refs/remotes/` for display.
pub fn shorthand(name: &str) -> &str {
    SHORTHAND_PREFIXES
        .iter()
        .find_map(|prefix| name.strip_prefix(prefix))
        .unwrap_or(name)
}

/// Rejects names that could escape the control directory or that Git
/// itself refuses (`..`, `.lock` suffix, control characters, ...).
pub fn is_valid_ref_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('/')
        && !name.ends_with('/')
        && !name.ends_with(".lock")
        && !name.contains("..")
        && !name.contains("//")
        && !name.contains("@{")
        && !name
            .chars()
            .any(|c| c.is_ascii_control() || matches!(c, ' ' | '~' | '^' | ':' | '?' | '*' | '[' | '\\'))
        && name.split('/').all(|part| !part.starts_with('.'))
}

/// Reads references from a control directory.
///
/// `HEAD` and other top-level pseudo refs come from the per-worktree
/// `git_dir`; everything under `refs/` and `packed-refs` comes from the
/// shared `common_dir`. The two are the same outside linked worktrees.
#[derive(Debug)]
pub struct RefStore {
    git_dir: PathBuf,
    common_dir: PathBuf,
    options: EngineOptions,
    packed: RwLock<PackedRefsCache>,
}

impl RefStore {
    /// Creates a store over the given directories.
    pub fn new(git_dir: impl Into<PathBuf>, common_dir: impl Into<PathBuf>, options: EngineOptions) -> Self {
        Self {
            git_dir: git_dir.into(),
            common_dir: common_dir.into(),
            options,
            packed: RwLock::new(PackedRefsCache::default()),
        }
    }

    fn backoff(&self) -> Duration {
        Duration::from_millis(self.options.retry_backoff_ms)
    }

    fn loose_path(&self, name: &str) -> PathBuf {
        if name.starts_with("refs/") {
            self.common_dir.join(name)
        } else {
            self.git_dir.join(name)
        }
    }

    /// Reads one reference without following it.
    pub fn read(&self, name: &str) -> Result<Option<RefTarget>> {
        if !is_valid_ref_name(name) {
            return Err(GitError::reference(name, "invalid reference name"));
        }

        let path = self.loose_path(name);
        // A directory of the same name (e.g. refs/heads/feature/) is not a ref.
        if !path.is_dir() {
            if let Some(bytes) = read_optional(&path, self.options.io_retries, self.backoff())
                .map_err(|e| GitError::io(format!("reading {}", path.display()), e))?
            {
                return parse_loose_ref(name, &bytes).map(Some);
            }
        }

        Ok(self
            .packed_lookup(name)?
            .map(|packed| RefTarget::Direct(packed.id)))
    }

    /// Follows symbolic references until an object id is reached.
    ///
    /// A chain of exactly `max_symref_hops` symbolic links resolves; one
    /// more fails with `ReferenceFailed`, as do cycles and dangling targets.
    pub fn resolve(&self, name: &str) -> Result<ObjectId> {
        let max_hops = self.options.max_symref_hops;
        let mut current = name.to_string();
        let mut seen = HashSet::new();

        for _ in 0..=max_hops {
            if !seen.insert(current.clone()) {
                return Err(GitError::reference(
                    name,
                    format!("symbolic reference cycle through '{current}'"),
                ));
            }
            match self.read(&current)? {
                Some(RefTarget::Direct(id)) => {
                    trace!(name, %id, "resolved reference");
                    return Ok(id);
                }
                Some(RefTarget::Symbolic(target)) => current = target,
                None => {
                    return Err(GitError::reference(
                        name,
                        format!("'{current}' does not exist"),
                    ))
                }
            }
        }

        Err(GitError::reference(
            name,
            format!("more than {max_hops} symbolic hops"),
        ))
    }

    /// Reads HEAD.
    pub fn head(&self) -> Result<Head> {
        match self.read("HEAD")? {
            Some(RefTarget::Symbolic(target)) => Ok(Head::Branch(target)),
            Some(RefTarget::Direct(id)) => Ok(Head::Detached(id)),
            None => Err(GitError::reference("HEAD", "HEAD is missing")),
        }
    }

    /// Peeled target recorded in `packed-refs` for an annotated tag.
    pub fn peeled(&self, name: &str) -> Result<Option<ObjectId>> {
        Ok(self.packed_lookup(name)?.and_then(|packed| packed.peeled))
    }

    /// Expands a short name in Git's lookup order and resolves it.
    pub fn dwim(&self, short: &str) -> Result<Option<(String, ObjectId)>> {
        let candidates = [
            short.to_string(),
            format!("refs/{short}"),
            format!("refs/tags/{short}"),
            format!("refs/heads/{short}"),
            format!("refs/remotes/{short}"),
            format!("refs/remotes/{short}/HEAD"),
        ];
        for candidate in candidates {
            if !is_valid_ref_name(&candidate) {
                continue;
            }
            // Only full names or pseudo refs like HEAD / FETCH_HEAD match as-is.
            if candidate == short
                && !short.starts_with("refs/")
                && !short.chars().all(|c| c.is_ascii_uppercase() || c == '_')
            {
                continue;
            }
            if self.read(&candidate)?.is_some() {
                let id = self.resolve(&candidate)?;
                return Ok(Some((candidate, id)));
            }
        }
        Ok(None)
    }

    /// Full name of the branch `branch` tracks, from `branch.<b>.remote/merge`.
    pub fn upstream(&self, config: &GitConfig, branch: &str) -> Option<String> {
        let short = branch.strip_prefix("refs/heads/").unwrap_or(branch);
        let remote = config.get("branch", Some(short), "remote")?;
        let merge = config.get("branch", Some(short), "merge")?;
        if remote == "." {
            return Some(merge.to_string());
        }
        let merged_branch = merge.strip_prefix("refs/heads/").unwrap_or(merge);
        Some(format!("refs/remotes/{remote}/{merged_branch}"))
    }

    fn packed_lookup(&self, name: &str) -> Result<Option<PackedRef>> {
        let path = self.common_dir.join("packed-refs");
        let stamp = std::fs::metadata(&path)
            .ok()
            .and_then(|m| Some((m.modified().ok()?, m.len())));

        {
            let cache = self.packed.read();
            if cache.stamp == stamp {
                return Ok(cache.refs.get(name).cloned());
            }
        }

        let refs = match read_optional(&path, self.options.io_retries, self.backoff())
            .map_err(|e| GitError::io(format!("reading {}", path.display()), e))?
        {
            Some(bytes) => parse_packed_refs(&bytes)?,
            None => HashMap::new(),
        };
        debug!(refs = refs.len(), "loaded packed-refs");

        let mut cache = self.packed.write();
        let found = refs.get(name).cloned();
        cache.stamp = stamp;
        cache.refs = refs;
        Ok(found)
    }

    /// Control directory holding HEAD.
    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }
}

fn parse_loose_ref(name: &str, bytes: &[u8]) -> Result<RefTarget> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| GitError::reference(name, "reference file is not UTF-8"))?
        .trim();
    if let Some(target) = text.strip_prefix("ref:") {
        let target = target.trim();
        if !is_valid_ref_name(target) {
            return Err(GitError::reference(
                name,
                format!("invalid symbolic target '{target}'"),
            ));
        }
        return Ok(RefTarget::Symbolic(target.to_string()));
    }
    // FETCH_HEAD and friends carry extra text after the id.
    let hex = text.split_whitespace().next().unwrap_or("");
    ObjectId::from_hex(hex)
        .map(RefTarget::Direct)
        .map_err(|_| GitError::reference(name, format!("malformed reference content '{text}'")))
}

fn parse_packed_refs(bytes: &[u8]) -> Result<HashMap<String, PackedRef>> {
    let text = String::from_utf8_lossy(bytes);
    let mut refs: HashMap<String, PackedRef> = HashMap::new();
    let mut last: Option<String> = None;

    for (lineno, line) in text.lines().enumerate() {
        let corrupt = |detail: &str| {
            GitError::corrupt("packed-refs", format!("line {}: {detail}", lineno + 1))
        };
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(peeled) = line.strip_prefix('^') {
            let id = ObjectId::from_hex(peeled.trim()).map_err(|_| corrupt("bad peeled id"))?;
            let owner = last
                .as_ref()
                .and_then(|name| refs.get_mut(name))
                .ok_or_else(|| corrupt("peeled line without a reference"))?;
            owner.peeled = Some(id);
            continue;
        }
        let (hex, name) = line.split_once(' ').ok_or_else(|| corrupt("missing name"))?;
        let id = ObjectId::from_hex(hex).map_err(|_| corrupt("bad id"))?;
        refs.insert(name.to_string(), PackedRef { id, peeled: None });
        last = Some(name.to_string());
    }

    Ok(refs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn hex(byte: u8) -> String {
        format!("{byte:02x}").repeat(20)
    }

    fn store(dir: &Path) -> RefStore {
        RefStore::new(dir, dir, EngineOptions::default())
    }

    fn write_ref(dir: &Path, name: &str, content: &str) {
        let path = dir.join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn resolves_symbolic_head() {
        let dir = tempfile::tempdir().unwrap();
        write_ref(dir.path(), "HEAD", "ref: refs/heads/main\n");
        write_ref(dir.path(), "refs/heads/main", &format!("{}\n", hex(1)));

        let refs = store(dir.path());
        assert_eq!(refs.resolve("HEAD").unwrap().to_hex(), hex(1));
        assert_eq!(refs.head().unwrap(), Head::Branch("refs/heads/main".into()));
    }

    #[test]
    fn falls_back_to_packed_refs() {
        let dir = tempfile::tempdir().unwrap();
        write_ref(
            dir.path(),
            "packed-refs",
            &format!(
                "# pack-refs with: peeled fully-peeled sorted \n{} refs/heads/main\n{} refs/tags/v1\n^{}\n",
                hex(2),
                hex(3),
                hex(4)
            ),
        );
        let refs = store(dir.path());
        assert_eq!(refs.resolve("refs/heads/main").unwrap().to_hex(), hex(2));
        assert_eq!(refs.resolve("refs/tags/v1").unwrap().to_hex(), hex(3));
        assert_eq!(refs.peeled("refs/tags/v1").unwrap().unwrap().to_hex(), hex(4));

        // A loose ref shadows the packed one.
        write_ref(dir.path(), "refs/heads/main", &hex(5));
        assert_eq!(refs.resolve("refs/heads/main").unwrap().to_hex(), hex(5));
    }

    #[test]
    fn orphan_peeled_line_is_corrupt() {
        let text = format!("^{}\n{} refs/tags/v1\n", hex(4), hex(3));
        let err = parse_packed_refs(text.as_bytes()).unwrap_err();
        assert!(err.is_corrupt(), "{err}");
    }

    fn chain(dir: &Path, depth: usize) {
        // refs/chain/0 -> refs/chain/1 -> ... -> refs/chain/<depth> (direct)
        for i in 0..depth {
            write_ref(dir, &format!("refs/chain/{i}"), &format!("ref: refs/chain/{}\n", i + 1));
        }
        write_ref(dir, &format!("refs/chain/{depth}"), &hex(7));
    }

    #[test]
    fn hop_limit_is_inclusive() {
        let dir = tempfile::tempdir().unwrap();
        chain(dir.path(), 10);
        assert_eq!(store(dir.path()).resolve("refs/chain/0").unwrap().to_hex(), hex(7));
    }

    #[test]
    fn exceeding_hop_limit_fails() {
        let dir = tempfile::tempdir().unwrap();
        chain(dir.path(), 11);
        let err = store(dir.path()).resolve("refs/chain/0").unwrap_err();
        assert!(matches!(err, GitError::ReferenceFailed { .. }), "{err}");
    }

    #[test]
    fn cycles_and_dangling_targets_fail() {
        let dir = tempfile::tempdir().unwrap();
        write_ref(dir.path(), "refs/heads/a", "ref: refs/heads/b\n");
        write_ref(dir.path(), "refs/heads/b", "ref: refs/heads/a\n");
        write_ref(dir.path(), "refs/heads/c", "ref: refs/heads/missing\n");
        let refs = store(dir.path());
        assert!(matches!(
            refs.resolve("refs/heads/a"),
            Err(GitError::ReferenceFailed { .. })
        ));
        assert!(matches!(
            refs.resolve("refs/heads/c"),
            Err(GitError::ReferenceFailed { .. })
        ));
    }

    #[test]
    fn shorthand_strips_known_prefixes() {
        assert_eq!(shorthand("refs/heads/main"), "main");
        assert_eq!(shorthand("refs/tags/v1.0"), "v1.0");
        assert_eq!(shorthand("refs/remotes/origin/main"), "origin/main");
        assert_eq!(shorthand("HEAD"), "HEAD");
    }

    #[test]
    fn validates_names() {
        assert!(is_valid_ref_name("refs/heads/feature/x"));
        assert!(!is_valid_ref_name("refs/../config"));
        assert!(!is_valid_ref_name("refs/heads/.hidden"));
        assert!(!is_valid_ref_name("refs/heads/x.lock"));
        assert!(!is_valid_ref_name("/etc/passwd"));
    }

    #[test]
    fn dwim_follows_git_order() {
        let dir = tempfile::tempdir().unwrap();
        write_ref(dir.path(), "refs/heads/main", &hex(1));
        write_ref(dir.path(), "refs/tags/main", &hex(2));
        write_ref(dir.path(), "refs/remotes/origin/dev", &hex(3));
        let refs = store(dir.path());

        let (name, id) = refs.dwim("main").unwrap().unwrap();
        assert_eq!(name, "refs/tags/main");
        assert_eq!(id.to_hex(), hex(2));
        assert_eq!(refs.dwim("origin/dev").unwrap().unwrap().0, "refs/remotes/origin/dev");
        assert!(refs.dwim("nothing").unwrap().is_none());
    }

    #[test]
    fn upstream_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = GitConfig::parse(
            "[branch \"main\"]\nremote = origin\nmerge = refs/heads/trunk\n[branch \"local\"]\nremote = .\nmerge = refs/heads/main\n",
        )
        .unwrap();
        let refs = store(dir.path());
        assert_eq!(
            refs.upstream(&config, "refs/heads/main").as_deref(),
            Some("refs/remotes/origin/trunk")
        );
        assert_eq!(refs.upstream(&config, "local").as_deref(), Some("refs/heads/main"));
        assert_eq!(refs.upstream(&config, "other"), None);
    }

    #[test]
    fn detached_head() {
        let dir = tempfile::tempdir().unwrap();
        write_ref(dir.path(), "HEAD", &format!("{}\n", hex(9)));
        match store(dir.path()).head().unwrap() {
            Head::Detached(id) => assert_eq!(id.to_hex(), hex(9)),
            Head::Branch(name) => panic!("unexpected branch {name}"),
        }
    }
}
