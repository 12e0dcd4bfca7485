//! Report types rendered by the command line.

use serde::Serialize;

use crate::git::{AheadBehind, ObjectFormat, ObjectId, StatusList};

pub mod yaml;

pub use yaml::*;

/// Output of `gitprobe status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Short HEAD name; absent on an unborn branch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head: Option<String>,
    /// Whether no path carries a flag.
    pub clean: bool,
    /// Changed paths with their flags.
    pub changes: StatusList,
}

/// Upstream tracking summary.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamInfo {
    /// Short name of the remote-tracking branch.
    pub name: String,
    /// Commit counts relative to it.
    #[serde(flatten)]
    pub counts: AheadBehind,
}

/// Output of `gitprobe info`.
#[derive(Debug, Clone, Serialize)]
pub struct RepositoryInfo {
    /// Control directory.
    pub git_dir: String,
    /// Work tree root, absent for bare repositories.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    /// Whether the repository has no work tree.
    pub bare: bool,
    /// Hash function in use.
    pub object_format: ObjectFormat,
    /// Short HEAD name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head: Option<String>,
    /// Commit HEAD points at.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head_id: Option<ObjectId>,
    /// Whether the work tree is clean.
    pub clean: bool,
    /// Tracking information for the current branch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream: Option<UpstreamInfo>,
}
