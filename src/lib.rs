//! # gitprobe
//!
//! Reads Git repository state directly from the on-disk formats: loose and
//! packed objects, references, the index and the working tree.
//!
//! ## Features
//!
//! - Working-tree status with per-path flags and a fast clean check
//! - HEAD and reference resolution, including `packed-refs`
//! - Ahead/behind counts and merge bases over the commit graph
//! - Generation-checked handles for callers that manage many repositories
//!
//! ## Quick Start
//!
//! ```no_run
//! use gitprobe::{EngineOptions, Repository};
//!
//! let repo = Repository::discover(".", EngineOptions::default())?;
//! println!("on {}, clean: {}", repo.head_name()?, repo.is_clean()?);
//! # Ok::<(), gitprobe::GitError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod cli;
pub mod config;
pub mod context;
pub mod data;
pub mod error;
pub mod git;
pub mod utils;

pub use crate::cli::Cli;
pub use crate::config::EngineOptions;
pub use crate::context::{Context, RepoHandle};
pub use crate::error::{GitError, Result};
pub use crate::git::{ObjectId, Repository, StatusFlags, StatusList};

/// The current version of gitprobe.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
