//! Ahead-behind command - counts commits unique to each side.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;

use super::open_repository;

/// Ahead-behind command options.
#[derive(Parser)]
pub struct AheadBehindCommand {
    /// Local revision (branch, tag, ref or full hex id).
    #[arg(value_name = "LOCAL")]
    pub local: String,

    /// Revision to compare against.
    #[arg(value_name = "REMOTE")]
    pub remote: String,
}

impl AheadBehindCommand {
    /// Executes the ahead-behind command.
    pub fn execute(self, path: &Path) -> Result<()> {
        let repo = open_repository(path)?;
        let local = repo
            .resolve_revision(&self.local)
            .with_context(|| format!("Failed to resolve '{}'", self.local))?;
        let remote = repo
            .resolve_revision(&self.remote)
            .with_context(|| format!("Failed to resolve '{}'", self.remote))?;

        let counts = repo
            .ahead_behind(&local, &remote)
            .with_context(|| format!("Failed to compare {} with {}", self.local, self.remote))?;
        println!("{}\t{}", counts.ahead, counts.behind);
        Ok(())
    }
}
