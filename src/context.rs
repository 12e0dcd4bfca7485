//! Handle-based access to open repositories.
//!
//! A [`Context`] owns a table of open repositories and hands out
//! [`RepoHandle`]s: slot indices paired with a generation counter. Closing a
//! handle bumps its slot's generation, so stale copies are rejected with
//! [`GitError::InvalidHandle`] instead of reaching whatever opens next in
//! the same slot.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::EngineOptions;
use crate::error::{GitError, Result};
use crate::git::{AheadBehind, ObjectId, Repository, StatusList};
use crate::utils::Settings;

static GLOBAL: OnceLock<Context> = OnceLock::new();

/// Opaque reference to a repository opened through a [`Context`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RepoHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    repo: Option<Arc<Repository>>,
}

#[derive(Debug, Default)]
struct SlotTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

/// Table of open repositories plus the options they are opened with.
#[derive(Debug)]
pub struct Context {
    options: EngineOptions,
    table: RwLock<SlotTable>,
}

impl Context {
    /// Creates a context from user settings and environment overrides.
    pub fn new() -> Result<Self> {
        let options = Settings::load()
            .and_then(|settings| settings.engine_options())
            .map_err(|e| GitError::InitFailed(format!("{e:#}")))?;
        Ok(Self::with_options(options))
    }

    /// Creates a context with explicit options.
    pub fn with_options(options: EngineOptions) -> Self {
        Self {
            options,
            table: RwLock::new(SlotTable::default()),
        }
    }

    /// Process-wide default context, created on first use.
    ///
    /// A failed initialization is returned to the caller and retried on
    /// the next call.
    pub fn global() -> Result<&'static Context> {
        if let Some(context) = GLOBAL.get() {
            return Ok(context);
        }
        let context = Self::new()?;
        Ok(GLOBAL.get_or_init(|| context))
    }

    /// Options repositories are opened with.
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Opens the repository containing `path`.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<RepoHandle> {
        let repo = Arc::new(Repository::discover(path, self.options.clone())?);

        let mut table = self.table.write();
        let index = match table.free.pop() {
            Some(index) => index,
            None => {
                let index = u32::try_from(table.slots.len()).map_err(|_| GitError::AllocationFailed {
                    requested: table.slots.len() as u64 + 1,
                    detail: "repository handle table is full".to_string(),
                })?;
                table.slots.push(Slot::default());
                index
            }
        };
        let slot = &mut table.slots[index as usize];
        slot.repo = Some(repo);
        let handle = RepoHandle {
            index,
            generation: slot.generation,
        };
        debug!(index, generation = handle.generation, "opened handle");
        Ok(handle)
    }

    /// Closes a handle. The repository is released once in-flight
    /// operations holding it finish.
    pub fn close(&self, handle: RepoHandle) -> Result<()> {
        let mut table = self.table.write();
        let slot = table
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation && slot.repo.is_some())
            .ok_or(GitError::InvalidHandle)?;
        slot.repo = None;
        slot.generation = slot.generation.wrapping_add(1);
        table.free.push(handle.index);
        debug!(index = handle.index, "closed handle");
        Ok(())
    }

    /// Repository behind a live handle.
    pub fn repository(&self, handle: RepoHandle) -> Result<Arc<Repository>> {
        let table = self.table.read();
        table
            .slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.repo.clone())
            .ok_or(GitError::InvalidHandle)
    }

    /// Number of open handles.
    pub fn open_count(&self) -> usize {
        self.table
            .read()
            .slots
            .iter()
            .filter(|slot| slot.repo.is_some())
            .count()
    }

    /// True for repositories without a work tree.
    pub fn is_bare(&self, handle: RepoHandle) -> Result<bool> {
        Ok(self.repository(handle)?.is_bare())
    }

    /// Work tree root.
    pub fn workdir(&self, handle: RepoHandle) -> Result<Option<PathBuf>> {
        Ok(self.repository(handle)?.workdir().map(Path::to_path_buf))
    }

    /// Clean check that reports any failure as "not clean".
    ///
    /// A status failure or an invalid handle is logged at `warn` and
    /// collapsed to `false`. Use [`Context::try_is_clean`] to tell a failure
    /// apart from a dirty tree.
    pub fn is_clean(&self, handle: RepoHandle) -> bool {
        match self.try_is_clean(handle) {
            Ok(clean) => clean,
            Err(e) => {
                warn!(error = %e, ?handle, "status failed; reporting repository as not clean");
                false
            }
        }
    }

    /// Clean check that keeps failures distinguishable.
    pub fn try_is_clean(&self, handle: RepoHandle) -> Result<bool> {
        self.repository(handle)?.is_clean()
    }

    /// Full status list.
    pub fn status(&self, handle: RepoHandle) -> Result<StatusList> {
        self.repository(handle)?.status()
    }

    /// Short name of HEAD.
    pub fn head_name(&self, handle: RepoHandle) -> Result<String> {
        self.repository(handle)?.head_name()
    }

    /// Commits reachable only from `local` and only from `remote`.
    pub fn ahead_behind(&self, handle: RepoHandle, local: &ObjectId, remote: &ObjectId) -> Result<(usize, usize)> {
        let AheadBehind { ahead, behind } = self.repository(handle)?.ahead_behind(local, remote)?;
        Ok((ahead, behind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo(root: &Path) {
        let git_dir = root.join(".git");
        std::fs::create_dir_all(git_dir.join("objects")).unwrap();
        std::fs::create_dir_all(git_dir.join("refs/heads")).unwrap();
        std::fs::write(git_dir.join("HEAD"), "ref: refs/heads/main\n").unwrap();
    }

    #[test]
    fn stale_handles_are_rejected_after_reuse() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let context = Context::with_options(EngineOptions::default());

        let first = context.open(dir.path()).unwrap();
        context.close(first).unwrap();
        assert!(matches!(context.is_bare(first), Err(GitError::InvalidHandle)));
        assert!(matches!(context.close(first), Err(GitError::InvalidHandle)));

        let second = context.open(dir.path()).unwrap();
        assert_eq!(second.index, first.index);
        assert_ne!(second.generation, first.generation);
        assert!(matches!(context.repository(first), Err(GitError::InvalidHandle)));
        assert!(!context.is_bare(second).unwrap());
        assert_eq!(context.open_count(), 1);
    }

    #[test]
    fn is_clean_collapses_failures_to_false() {
        let context = Context::with_options(EngineOptions::default());
        let bogus = RepoHandle {
            index: 7,
            generation: 0,
        };
        assert!(!context.is_clean(bogus));
        assert!(matches!(context.try_is_clean(bogus), Err(GitError::InvalidHandle)));
    }

    #[test]
    fn open_failure_is_open_failed() {
        let dir = tempfile::tempdir().unwrap();
        let context = Context::with_options(EngineOptions::default());
        let err = context.open(dir.path().join("missing")).unwrap_err();
        assert!(matches!(err, GitError::OpenFailed { .. }), "{err}");
        assert_eq!(context.open_count(), 0);
    }

    #[test]
    fn empty_unborn_repository_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let context = Context::with_options(EngineOptions::default());
        let handle = context.open(dir.path()).unwrap();
        assert!(context.is_clean(handle));
        assert!(context.try_is_clean(handle).unwrap());
        assert_eq!(
            context.workdir(handle).unwrap().unwrap(),
            dir.path().canonicalize().unwrap()
        );
        std::fs::write(dir.path().join("scratch.txt"), "x").unwrap();
        assert!(!context.is_clean(handle));
    }
}
