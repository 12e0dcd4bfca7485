//! Status command - lists changed paths.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

use super::{open_repository, OutputFormat};
use crate::data::StatusReport;
use crate::git::{StatusList, StatusOptions};

/// Status command options.
#[derive(Parser)]
pub struct StatusCommand {
    /// Output format.
    #[arg(long, value_enum, default_value_t = OutputFormat::Short)]
    pub format: OutputFormat,

    /// Re-hash every tracked file instead of trusting cached stat data.
    #[arg(long)]
    pub rehash: bool,

    /// Leave untracked files out of the report.
    #[arg(long)]
    pub no_untracked: bool,
}

impl StatusCommand {
    /// Executes the status command.
    pub fn execute(self, path: &Path) -> Result<()> {
        let repo = open_repository(path)?;
        let mut options = StatusOptions::from_engine(repo.options());
        options.force_rehash |= self.rehash;
        options.include_untracked = !self.no_untracked;
        if let Some(filemode) = repo.config().get_bool("core", None, "filemode") {
            options.trust_filemode = filemode;
        }

        let changes = repo
            .status_with(options)
            .context("Failed to compute repository status")?;

        match self.format {
            OutputFormat::Short => {
                let mut stdout = StandardStream::stdout(ColorChoice::Auto);
                write_short(&mut stdout, &changes)?;
            }
            OutputFormat::Yaml | OutputFormat::Json => {
                let report = StatusReport {
                    head: repo.head_name().ok(),
                    clean: changes.is_clean(),
                    changes,
                };
                if self.format == OutputFormat::Yaml {
                    println!("{}", crate::data::to_yaml(&report)?);
                } else {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&report)
                            .context("Failed to serialize status to JSON")?
                    );
                }
            }
        }
        Ok(())
    }
}

/// Writes `XY path` lines, staged codes in green and unstaged in red.
pub(crate) fn write_short<W: WriteColor>(out: &mut W, changes: &StatusList) -> Result<()> {
    for entry in changes.iter() {
        let code: Vec<char> = entry.flags.short_code().chars().collect();
        let (staged, unstaged) = (code[0], code[1]);

        if code == ['?', '?'] {
            out.set_color(ColorSpec::new().set_fg(Some(Color::Red)))?;
            write!(out, "??")?;
        } else {
            out.set_color(ColorSpec::new().set_fg(Some(Color::Green)))?;
            write!(out, "{staged}")?;
            out.set_color(ColorSpec::new().set_fg(Some(Color::Red)))?;
            write!(out, "{unstaged}")?;
        }
        out.reset()?;
        writeln!(out, " {}", entry.path)?;
    }
    Ok(())
}
