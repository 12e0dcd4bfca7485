//! Info command - prints a YAML summary of the repository.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::debug;

use super::open_repository;
use crate::data::{RepositoryInfo, UpstreamInfo};

/// Info command options.
#[derive(Parser)]
pub struct InfoCommand {}

impl InfoCommand {
    /// Executes the info command.
    pub fn execute(self, path: &Path) -> Result<()> {
        let repo = open_repository(path)?;

        let head = repo
            .head_name()
            .map_err(|e| debug!(error = %e, "HEAD has no name"))
            .ok();
        let head_id = repo.head_id().ok();
        let clean = repo.is_clean().context("Failed to compute repository status")?;
        let upstream = repo
            .ahead_behind_upstream()
            .context("Failed to compare with upstream")?
            .map(|(name, counts)| UpstreamInfo { name, counts });

        let info = RepositoryInfo {
            git_dir: repo.git_dir().display().to_string(),
            workdir: repo.workdir().map(|dir| dir.display().to_string()),
            bare: repo.is_bare(),
            object_format: repo.object_format(),
            head,
            head_id,
            clean,
            upstream,
        };
        println!("{}", crate::data::to_yaml(&info)?);
        Ok(())
    }
}
