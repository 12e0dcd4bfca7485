//! Git repository reading: objects, refs, index, working tree and history.

pub mod config;
pub mod delta;
pub mod graph;
pub mod ignore;
pub mod index;
pub mod loose;
pub mod object;
pub mod object_id;
pub mod odb;
pub mod pack;
pub mod refs;
pub mod repository;
pub mod status;
pub mod tree;
pub mod worktree;

pub use graph::AheadBehind;
pub use object::{Commit, Object, ObjectKind};
pub use object_id::{ObjectFormat, ObjectId};
pub use refs::{shorthand, Head};
pub use repository::Repository;
pub use status::{StatusEntry, StatusFlags, StatusList, StatusOptions};
