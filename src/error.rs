//! Error types for repository access.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::git::ObjectId;

/// Errors raised by the repository-reading core.
///
/// "Dirty" is never an error: a working tree with changes produces a
/// successful status result. Format violations surface as [`GitError::Corrupt`]
/// and are never retried.
#[derive(Error, Debug)]
pub enum GitError {
    /// One-time environment setup failed.
    #[error("Initialization failed: {0}")]
    InitFailed(String),

    /// No repository could be found at or above the path, or it is unreadable.
    #[error("Failed to open repository at {}: {reason}", path.display())]
    OpenFailed {
        /// Path the caller asked to open.
        path: PathBuf,
        /// Why discovery or validation failed.
        reason: String,
    },

    /// I/O failure while computing working-tree status.
    #[error("Failed to compute status: {detail}")]
    StatusFailed {
        /// What the engine was doing when the failure happened.
        detail: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// An identifier does not resolve to a commit, or the commit graph is broken.
    #[error("Commit lookup failed: {0}")]
    CommitFailed(String),

    /// Symbolic reference cycle, missing target or too many hops.
    #[error("Failed to resolve reference '{name}': {reason}")]
    ReferenceFailed {
        /// Reference being resolved.
        name: String,
        /// Why resolution stopped.
        reason: String,
    },

    /// An object or buffer exceeded the configured size cap or could not be allocated.
    #[error("Allocation of {requested} bytes failed: {detail}")]
    AllocationFailed {
        /// Number of bytes requested.
        requested: u64,
        /// What the buffer was for.
        detail: String,
    },

    /// An on-disk structure violates its format or checksum.
    #[error("Corrupt {what}: {detail}")]
    Corrupt {
        /// Which structure is broken (e.g. "index", "loose object <id>").
        what: String,
        /// Description of the violation.
        detail: String,
    },

    /// No loose object or pack entry matches the id.
    #[error("Object not found: {0}")]
    NotFound(ObjectId),

    /// A repository handle is stale, closed or was never issued.
    #[error("Invalid repository handle")]
    InvalidHandle,

    /// Filesystem error outside status computation.
    #[error("I/O error while {context}")]
    Io {
        /// What was being read.
        context: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}

impl GitError {
    /// Builds a [`GitError::Corrupt`].
    pub fn corrupt(what: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Corrupt {
            what: what.into(),
            detail: detail.into(),
        }
    }

    /// Builds a [`GitError::Io`].
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Builds a [`GitError::ReferenceFailed`].
    pub fn reference(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ReferenceFailed {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Returns true for corruption errors.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }

    /// Re-labels plain I/O failures as [`GitError::StatusFailed`].
    ///
    /// Parse and format errors pass through unchanged so callers can still
    /// tell corruption apart from a failed read.
    pub(crate) fn into_status_error(self) -> Self {
        match self {
            Self::Io { context, source } => Self::StatusFailed {
                detail: context,
                source,
            },
            other => other,
        }
    }

    /// Re-labels lookup failures as [`GitError::CommitFailed`].
    pub(crate) fn into_commit_error(self) -> Self {
        match self {
            Self::NotFound(id) => Self::CommitFailed(format!("{id} does not exist")),
            other => other,
        }
    }
}

/// Result alias used throughout the library.
pub type Result<T, E = GitError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_become_status_failures() {
        let err = GitError::io("reading a.txt", io::Error::other("boom")).into_status_error();
        assert!(matches!(err, GitError::StatusFailed { .. }));
        assert_eq!(err.to_string(), "Failed to compute status: reading a.txt");
    }

    #[test]
    fn corruption_survives_status_relabeling() {
        let err = GitError::corrupt("index", "bad checksum").into_status_error();
        assert!(err.is_corrupt());
    }

    #[test]
    fn missing_objects_become_commit_failures() {
        let err = GitError::NotFound(ObjectId::null(crate::git::ObjectFormat::Sha1))
            .into_commit_error();
        assert!(matches!(err, GitError::CommitFailed(_)));
    }
}
