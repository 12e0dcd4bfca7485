//! Head command - prints the current branch.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;

use super::open_repository;

/// Head command options.
#[derive(Parser)]
pub struct HeadCommand {
    /// Also print the commit id HEAD points at.
    #[arg(long)]
    pub id: bool,
}

impl HeadCommand {
    /// Executes the head command.
    pub fn execute(self, path: &Path) -> Result<()> {
        let repo = open_repository(path)?;
        let name = repo.head_name().context("Failed to resolve HEAD")?;
        if self.id {
            let id = repo.head_id().context("Failed to resolve HEAD")?;
            println!("{name} {id}");
        } else {
            println!("{name}");
        }
        Ok(())
    }
}
