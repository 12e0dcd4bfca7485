//! Engine tuning options.
//!
//! These bound the work the engine is willing to do on untrusted or corrupt
//! input and control retry behaviour for files another Git process may be
//! rewriting. Values come from [`crate::utils::settings`] or defaults.

use serde::{Deserialize, Serialize};

/// Default hop limit for symbolic reference chains.
pub const DEFAULT_MAX_SYMREF_HOPS: usize = 10;

/// Default delta chain bound; `git pack-objects` never exceeds 4095.
pub const DEFAULT_MAX_DELTA_DEPTH: usize = 4096;

/// Default per-object size cap (1 GiB).
pub const DEFAULT_MAX_OBJECT_SIZE: u64 = 1 << 30;

/// Tuning knobs shared by every component of an open repository.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineOptions {
    /// Maximum symbolic reference hops before `ReferenceFailed`.
    pub max_symref_hops: usize,

    /// Maximum pack delta chain length before `Corrupt`.
    pub max_delta_depth: usize,

    /// Largest object the engine will inflate, in bytes.
    pub max_object_size: u64,

    /// Extra attempts for transient I/O failures on index and ref files.
    pub io_retries: u32,

    /// Initial backoff between retries, doubled on each attempt.
    pub retry_backoff_ms: u64,

    /// Re-hash every tracked file instead of trusting stat data.
    pub force_rehash: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_symref_hops: DEFAULT_MAX_SYMREF_HOPS,
            max_delta_depth: DEFAULT_MAX_DELTA_DEPTH,
            max_object_size: DEFAULT_MAX_OBJECT_SIZE,
            io_retries: 3,
            retry_backoff_ms: 5,
            force_rehash: false,
        }
    }
}
