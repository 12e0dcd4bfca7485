//! Git repository operations

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::config::GitConfig;
use super::graph::{self, AheadBehind};
use super::ignore::IgnoreMatcher;
use super::index::{Index, IndexCache};
use super::object::Object;
use super::object_id::{ObjectFormat, ObjectId};
use super::odb::ObjectStore;
use super::refs::{shorthand, Head, RefStore};
use super::status::{StatusList, StatusOptions, StatusWalk};
use super::worktree::WorktreeScanner;
use crate::config::EngineOptions;
use crate::error::{GitError, Result};

/// An open repository: control directory, object store, refs and caches.
///
/// All caches are internally synchronized, so a `Repository` can be shared
/// between threads behind an `Arc`.
#[derive(Debug)]
pub struct Repository {
    git_dir: PathBuf,
    common_dir: PathBuf,
    workdir: Option<PathBuf>,
    format: ObjectFormat,
    options: EngineOptions,
    config: GitConfig,
    odb: ObjectStore,
    refs: RefStore,
    index: IndexCache,
    ignore: IgnoreMatcher,
}

impl Repository {
    /// Opens the repository at `path` without searching parent directories.
    ///
    /// `path` may be a work tree root, a `.git` directory, a bare repository
    /// or a directory holding a `gitdir:` file.
    pub fn open(path: impl AsRef<Path>, options: EngineOptions) -> Result<Self> {
        let path = path.as_ref();
        let start = canonical(path)?;
        let (git_dir, workdir) = locate(&start)
            .map_err(|e| open_failed(path, e.to_string()))?
            .ok_or_else(|| open_failed(path, "not a git repository".to_string()))?;
        Self::load(path, git_dir, workdir, options)
    }

    /// Opens the repository containing `path`, walking up to the filesystem root.
    pub fn discover(path: impl AsRef<Path>, options: EngineOptions) -> Result<Self> {
        let path = path.as_ref();
        let start = canonical(path)?;
        for candidate in start.ancestors() {
            if let Some((git_dir, workdir)) =
                locate(candidate).map_err(|e| open_failed(path, e.to_string()))?
            {
                return Self::load(path, git_dir, workdir, options);
            }
        }
        Err(open_failed(
            path,
            "not a git repository (or any parent directory)".to_string(),
        ))
    }

    fn load(
        requested: &Path,
        git_dir: PathBuf,
        workdir: Option<PathBuf>,
        options: EngineOptions,
    ) -> Result<Self> {
        Self::load_inner(git_dir, workdir, options)
            .map_err(|e| open_failed(requested, e.to_string()))
    }

    fn load_inner(git_dir: PathBuf, workdir: Option<PathBuf>, options: EngineOptions) -> Result<Self> {
        let common_dir = common_dir(&git_dir)?;
        let config = GitConfig::load(&common_dir.join("config"))?;

        let version = config
            .get("core", None, "repositoryformatversion")
            .unwrap_or("0");
        if !matches!(version.trim(), "0" | "1") {
            return Err(GitError::corrupt(
                "config",
                format!("unsupported repositoryformatversion {version}"),
            ));
        }
        let format = match config.get("extensions", None, "objectformat") {
            None => ObjectFormat::Sha1,
            Some(name) => name
                .parse()
                .map_err(|_| GitError::corrupt("config", format!("unknown object format '{name}'")))?,
        };

        let workdir = if config.get_bool("core", None, "bare") == Some(true) {
            None
        } else if let Some(worktree) = config.get("core", None, "worktree") {
            let dir = git_dir.join(worktree);
            Some(dir.canonicalize().unwrap_or(dir))
        } else {
            workdir
        };

        let odb = ObjectStore::open(&common_dir.join("objects"), format, options.clone())?;
        let refs = RefStore::new(&git_dir, &common_dir, options.clone());
        let index = IndexCache::new(git_dir.join("index"), format, options.clone());
        let ignore = IgnoreMatcher::load(&common_dir, &config)?;

        info!(
            git_dir = %git_dir.display(),
            bare = workdir.is_none(),
            format = ?format,
            "opened repository"
        );
        Ok(Self {
            git_dir,
            common_dir,
            workdir,
            format,
            options,
            config,
            odb,
            refs,
            index,
            ignore,
        })
    }

    /// True when there is no work tree.
    pub fn is_bare(&self) -> bool {
        self.workdir.is_none()
    }

    /// Work tree root, `None` for bare repositories.
    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_deref()
    }

    /// Control directory (`.git`, a linked worktree's private directory, or
    /// the bare repository itself).
    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    /// Directory holding objects and shared refs.
    pub fn common_dir(&self) -> &Path {
        &self.common_dir
    }

    /// Hash function in use.
    pub fn object_format(&self) -> ObjectFormat {
        self.format
    }

    /// Repository configuration.
    pub fn config(&self) -> &GitConfig {
        &self.config
    }

    /// Engine options this repository was opened with.
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Object database.
    pub fn objects(&self) -> &ObjectStore {
        &self.odb
    }

    /// Reference store.
    pub fn refs(&self) -> &RefStore {
        &self.refs
    }

    /// Short name of HEAD: the branch name, or `HEAD` when detached.
    ///
    /// Fails with `ReferenceFailed` on an unborn branch.
    pub fn head_name(&self) -> Result<String> {
        match self.refs.head()? {
            Head::Detached(_) => Ok("HEAD".to_string()),
            Head::Branch(name) => {
                self.refs.resolve(&name)?;
                Ok(shorthand(&name).to_string())
            }
        }
    }

    /// Commit HEAD points at.
    pub fn head_id(&self) -> Result<ObjectId> {
        self.refs.resolve("HEAD")
    }

    /// HEAD's commit, or `None` when the current branch has no commits yet.
    fn head_commit_id(&self) -> Result<Option<ObjectId>> {
        if let Head::Branch(name) = self.refs.head()? {
            if self.refs.read(&name)?.is_none() {
                return Ok(None);
            }
        }
        self.head_id().map(Some)
    }

    /// Resolves a full reference name such as `refs/heads/main` or `HEAD`.
    pub fn resolve_reference(&self, name: &str) -> Result<ObjectId> {
        self.refs.resolve(name)
    }

    /// Resolves a hex id or a short ref name using Git's lookup order.
    pub fn resolve_revision(&self, rev: &str) -> Result<ObjectId> {
        if rev.len() == self.format.hex_len() && rev.bytes().all(|b| b.is_ascii_hexdigit()) {
            return ObjectId::from_hex(rev);
        }
        self.refs
            .dwim(rev)?
            .map(|(_, id)| id)
            .ok_or_else(|| GitError::reference(rev, "no such reference"))
    }

    /// Current staged snapshot.
    pub fn index(&self) -> Result<std::sync::Arc<Index>> {
        self.index.load()
    }

    /// Status with default options (`force_rehash` from engine options,
    /// `core.fileMode` from config).
    pub fn status(&self) -> Result<StatusList> {
        self.status_with(self.default_status_options())
    }

    /// Status with explicit options.
    pub fn status_with(&self, options: StatusOptions) -> Result<StatusList> {
        self.walk_status(options, |walk| walk.collect())
            .map_err(GitError::into_status_error)
    }

    /// True when no path is staged, modified, deleted or untracked.
    ///
    /// Stops at the first changed path.
    pub fn is_clean(&self) -> Result<bool> {
        self.walk_status(self.default_status_options(), |mut walk| {
            walk.next().transpose().map(|first| first.is_none())
        })
        .map_err(GitError::into_status_error)
    }

    fn default_status_options(&self) -> StatusOptions {
        StatusOptions {
            trust_filemode: self
                .config
                .get_bool("core", None, "filemode")
                .unwrap_or(true),
            ..StatusOptions::from_engine(&self.options)
        }
    }

    fn walk_status<T>(
        &self,
        options: StatusOptions,
        consume: impl FnOnce(StatusWalk<'_>) -> Result<T>,
    ) -> Result<T> {
        let index = self.index.load()?;
        let head_tree = match self.head_commit_id()? {
            Some(id) => Some(self.odb.peel_to_commit(&id)?.tree),
            None => None,
        };
        let scanner = self
            .workdir
            .as_deref()
            .map(|root| WorktreeScanner::new(root, &self.ignore, &index));
        let walk = StatusWalk::new(&self.odb, head_tree.as_ref(), &index, scanner, options)?;
        consume(walk)
    }

    /// Commits reachable only from `local` and only from `remote`.
    pub fn ahead_behind(&self, local: &ObjectId, remote: &ObjectId) -> Result<AheadBehind> {
        graph::ahead_behind(&self.odb, local, remote)
    }

    /// Ahead/behind of HEAD's branch against its configured upstream.
    ///
    /// Returns `None` when HEAD is detached, the branch has no upstream, or
    /// either side has not been created or fetched yet.
    pub fn ahead_behind_upstream(&self) -> Result<Option<(String, AheadBehind)>> {
        let Head::Branch(branch) = self.refs.head()? else {
            return Ok(None);
        };
        let Some(upstream) = self.refs.upstream(&self.config, &branch) else {
            return Ok(None);
        };
        if self.refs.read(&branch)?.is_none() || self.refs.read(&upstream)?.is_none() {
            debug!(branch = %branch, upstream = %upstream, "branch or upstream not present");
            return Ok(None);
        }
        let local = self.refs.resolve(&branch)?;
        let remote = self.refs.resolve(&upstream)?;
        let counts = self.ahead_behind(&local, &remote)?;
        Ok(Some((shorthand(&upstream).to_string(), counts)))
    }

    /// Best common ancestor of two commits.
    pub fn merge_base(&self, a: &ObjectId, b: &ObjectId) -> Result<Option<ObjectId>> {
        graph::merge_base(&self.odb, a, b)
    }

    /// True if `ancestor` is reachable from `descendant`.
    pub fn is_descendant_of(&self, descendant: &ObjectId, ancestor: &ObjectId) -> Result<bool> {
        graph::is_descendant_of(&self.odb, descendant, ancestor)
    }

    /// Reads and verifies any object.
    pub fn read_object(&self, id: &ObjectId) -> Result<Object> {
        self.odb.read(id)
    }

    /// Releases the repository, unmapping its pack files.
    pub fn close(self) {
        debug!(git_dir = %self.git_dir.display(), "closing repository");
    }
}

fn open_failed(path: &Path, reason: String) -> GitError {
    GitError::OpenFailed {
        path: path.to_path_buf(),
        reason,
    }
}

fn canonical(path: &Path) -> Result<PathBuf> {
    path.canonicalize()
        .map_err(|e| open_failed(path, e.to_string()))
}

/// Finds the control directory for `dir`: its `.git` entry, or `dir`
/// itself when it is a control directory.
fn locate(dir: &Path) -> Result<Option<(PathBuf, Option<PathBuf>)>> {
    if let Some(git_dir) = read_gitfile(&dir.join(".git"))? {
        if is_git_dir(&git_dir) {
            let git_dir = git_dir.canonicalize().unwrap_or(git_dir);
            return Ok(Some((git_dir, Some(dir.to_path_buf()))));
        }
    }

    if is_git_dir(dir) {
        let workdir = if dir.file_name().is_some_and(|name| name == ".git") {
            dir.parent().map(Path::to_path_buf)
        } else {
            None
        };
        return Ok(Some((dir.to_path_buf(), workdir)));
    }
    Ok(None)
}

fn is_git_dir(dir: &Path) -> bool {
    let shared = dir.join("commondir").is_file();
    dir.join("HEAD").is_file()
        && (shared || (dir.join("objects").is_dir() && dir.join("refs").is_dir()))
}

fn common_dir(git_dir: &Path) -> Result<PathBuf> {
    let path = git_dir.join("commondir");
    match fs::read_to_string(&path) {
        Ok(text) => Ok(git_dir.join(text.trim())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(git_dir.to_path_buf()),
        Err(e) => Err(GitError::io(format!("reading {}", path.display()), e)),
    }
}

/// Resolves a `.git` entry: a directory is returned as is, a file must
/// hold `gitdir: <path>` (relative paths are taken from the file's
/// directory). `Ok(None)` if nothing exists at `dot_git`.
pub(crate) fn read_gitfile(dot_git: &Path) -> Result<Option<PathBuf>> {
    let metadata = match fs::metadata(dot_git) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(GitError::io(format!("stat {}", dot_git.display()), e)),
    };
    if metadata.is_dir() {
        return Ok(Some(dot_git.to_path_buf()));
    }

    let text = fs::read_to_string(dot_git)
        .map_err(|e| GitError::io(format!("reading {}", dot_git.display()), e))?;
    let target = text
        .lines()
        .next()
        .and_then(|line| line.strip_prefix("gitdir:"))
        .map(str::trim)
        .filter(|target| !target.is_empty())
        .ok_or_else(|| GitError::corrupt(dot_git.display().to_string(), "expected 'gitdir: <path>'"))?;
    let base = dot_git.parent().unwrap_or_else(|| Path::new(""));
    Ok(Some(base.join(target)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_layout(git_dir: &Path) {
        fs::create_dir_all(git_dir.join("objects")).unwrap();
        fs::create_dir_all(git_dir.join("refs/heads")).unwrap();
        fs::write(git_dir.join("HEAD"), "ref: refs/heads/main\n").unwrap();
    }

    #[test]
    fn repository_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Repository>();
    }

    #[test]
    fn discovers_from_subdirectory() {
        let dir = tempfile::tempdir().unwrap();
        init_layout(&dir.path().join(".git"));
        fs::create_dir_all(dir.path().join("src/deep")).unwrap();

        let repo = Repository::discover(dir.path().join("src/deep"), EngineOptions::default()).unwrap();
        assert!(!repo.is_bare());
        assert_eq!(repo.workdir().unwrap(), dir.path().canonicalize().unwrap());
        assert_eq!(repo.object_format(), ObjectFormat::Sha1);

        let err = Repository::open(dir.path().join("src"), EngineOptions::default()).unwrap_err();
        assert!(matches!(err, GitError::OpenFailed { .. }), "{err}");
    }

    #[test]
    fn opens_control_directory_and_bare_repositories() {
        let dir = tempfile::tempdir().unwrap();
        init_layout(&dir.path().join("work/.git"));
        let repo = Repository::open(dir.path().join("work/.git"), EngineOptions::default()).unwrap();
        assert_eq!(repo.workdir().unwrap(), dir.path().join("work").canonicalize().unwrap());

        let bare = dir.path().join("bare.git");
        init_layout(&bare);
        fs::write(bare.join("config"), "[core]\n\tbare = true\n").unwrap();
        let repo = Repository::open(&bare, EngineOptions::default()).unwrap();
        assert!(repo.is_bare());
        assert!(repo.status().unwrap().is_empty());
    }

    #[test]
    fn follows_gitdir_files() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("store/real.git");
        init_layout(&real);
        fs::create_dir_all(dir.path().join("checkout")).unwrap();
        fs::write(dir.path().join("checkout/.git"), "gitdir: ../store/real.git\n").unwrap();

        let repo = Repository::open(dir.path().join("checkout"), EngineOptions::default()).unwrap();
        assert_eq!(repo.git_dir(), real.canonicalize().unwrap());
        assert_eq!(repo.workdir().unwrap(), dir.path().join("checkout").canonicalize().unwrap());
    }

    #[test]
    fn core_worktree_points_at_a_separate_tree() {
        let dir = tempfile::tempdir().unwrap();
        let meta = dir.path().join("meta.git");
        init_layout(&meta);
        fs::create_dir_all(dir.path().join("tree")).unwrap();
        fs::write(meta.join("config"), "[core]\n\tworktree = ../tree\n").unwrap();

        let repo = Repository::open(&meta, EngineOptions::default()).unwrap();
        assert_eq!(repo.workdir().unwrap(), dir.path().join("tree").canonicalize().unwrap());
    }

    #[test]
    fn reads_sha256_format() {
        let dir = tempfile::tempdir().unwrap();
        let git_dir = dir.path().join(".git");
        init_layout(&git_dir);
        fs::write(
            git_dir.join("config"),
            "[core]\n\trepositoryformatversion = 1\n[extensions]\n\tobjectformat = sha256\n",
        )
        .unwrap();
        let repo = Repository::open(dir.path(), EngineOptions::default()).unwrap();
        assert_eq!(repo.object_format(), ObjectFormat::Sha256);
    }

    #[test]
    fn unborn_head_has_no_name_but_status_works() {
        let dir = tempfile::tempdir().unwrap();
        init_layout(&dir.path().join(".git"));
        fs::write(dir.path().join("new.txt"), "x").unwrap();

        let repo = Repository::open(dir.path(), EngineOptions::default()).unwrap();
        assert!(matches!(repo.head_name(), Err(GitError::ReferenceFailed { .. })));
        let status = repo.status().unwrap();
        assert_eq!(status.get("new.txt").unwrap().short_code(), "??");
        assert!(!repo.is_clean().unwrap());
    }

    #[test]
    fn unsupported_format_version_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let git_dir = dir.path().join(".git");
        init_layout(&git_dir);
        fs::write(git_dir.join("config"), "[core]\n\trepositoryformatversion = 2\n").unwrap();
        let err = Repository::open(dir.path(), EngineOptions::default()).unwrap_err();
        assert!(matches!(err, GitError::OpenFailed { .. }));
    }
}
