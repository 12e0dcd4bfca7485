//! CLI interface for gitprobe.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use crate::git::Repository;
use crate::utils::Settings;

mod ahead_behind;
mod head;
mod info;
mod status;

pub use ahead_behind::AheadBehindCommand;
pub use head::HeadCommand;
pub use info::InfoCommand;
pub use status::StatusCommand;

/// gitprobe: inspect Git repository state without shelling out to git.
#[derive(Parser)]
#[command(name = "gitprobe")]
#[command(about = "Reads Git repository state: status, HEAD and ahead/behind counts", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Run as if started in this directory.
    #[arg(short = 'C', global = true, value_name = "PATH")]
    pub repo: Option<PathBuf>,

    /// The main command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Main command categories.
#[derive(Subcommand)]
pub enum Commands {
    /// Shows changed paths.
    Status(StatusCommand),
    /// Prints the current branch name.
    Head(HeadCommand),
    /// Counts commits unique to each of two revisions.
    AheadBehind(AheadBehindCommand),
    /// Prints a YAML summary of the repository.
    Info(InfoCommand),
}

/// Structured output formats.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Porcelain-style lines.
    #[default]
    Short,
    /// YAML document.
    Yaml,
    /// JSON document.
    Json,
}

impl Cli {
    /// Executes the CLI command.
    pub fn execute(self) -> Result<()> {
        let path = self.repo.unwrap_or_else(|| PathBuf::from("."));
        match self.command {
            Commands::Status(cmd) => cmd.execute(&path),
            Commands::Head(cmd) => cmd.execute(&path),
            Commands::AheadBehind(cmd) => cmd.execute(&path),
            Commands::Info(cmd) => cmd.execute(&path),
        }
    }
}

/// Opens the repository containing `path` with options from user settings.
pub(crate) fn open_repository(path: &Path) -> Result<Repository> {
    let options = Settings::load()
        .and_then(|settings| settings.engine_options())
        .context("Failed to load gitprobe settings")?;
    Repository::discover(path, options)
        .with_context(|| format!("Failed to open git repository at {}", path.display()))
}
