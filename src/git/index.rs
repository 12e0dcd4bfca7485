//! Reader for the staging-area file (`.git/index`), versions 2 to 4.
//!
//! Entries are returned in file order, which Git keeps sorted by path bytes
//! and then by stage. The status merge-walk relies on that order, so the
//! reader rejects any file that breaks it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use tracing::debug;

use super::object_id::{ObjectFormat, ObjectId};
use crate::config::EngineOptions;
use crate::error::{GitError, Result};
use crate::utils::read_optional;

const SIGNATURE: &[u8; 4] = b"DIRC";
const HEADER_LEN: usize = 12;
/// ctime, mtime, dev, ino, mode, uid, gid, size: ten 32-bit fields.
const STAT_LEN: usize = 40;

const FLAG_ASSUME_VALID: u16 = 0x8000;
const FLAG_EXTENDED: u16 = 0x4000;
const FLAG_STAGE_MASK: u16 = 0x3000;
const EXT_FLAG_SKIP_WORKTREE: u16 = 0x4000;
const EXT_FLAG_INTENT_TO_ADD: u16 = 0x2000;

/// Seconds and nanoseconds as stored in index stat data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StatTime {
    /// Seconds since the epoch, truncated to 32 bits like Git does.
    pub secs: u32,
    /// Nanosecond part; zero when the writer did not record it.
    pub nanos: u32,
}

impl StatTime {
    /// Converts a filesystem timestamp.
    pub fn from_system_time(time: SystemTime) -> Self {
        let since = time.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
        Self {
            secs: since.as_secs() as u32,
            nanos: since.subsec_nanos(),
        }
    }

    /// Equality that tolerates writers which do not record nanoseconds.
    pub fn matches(&self, other: &Self) -> bool {
        self.secs == other.secs && (self.nanos == 0 || other.nanos == 0 || self.nanos == other.nanos)
    }
}

/// One staged path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    /// Path relative to the work tree, `/`-separated.
    pub path: Vec<u8>,
    /// File mode (regular, executable, symlink or gitlink).
    pub mode: u32,
    /// File size truncated to 32 bits.
    pub size: u32,
    /// Last modification time when the entry was staged.
    pub mtime: StatTime,
    /// Inode change time when the entry was staged.
    pub ctime: StatTime,
    /// Staged content.
    pub id: ObjectId,
    /// Merge stage; 0 for normal entries.
    pub stage: u8,
    /// `assume-unchanged` bit.
    pub assume_valid: bool,
    /// Sparse-checkout `skip-worktree` bit.
    pub skip_worktree: bool,
    /// `git add -N` placeholder.
    pub intent_to_add: bool,
}

impl IndexEntry {
    /// Lossy UTF-8 path for display.
    pub fn path_str(&self) -> String {
        String::from_utf8_lossy(&self.path).into_owned()
    }
}

/// Parsed index file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Index {
    /// Format version (2, 3 or 4); 0 when no index file exists.
    pub version: u32,
    /// Entries in path order.
    pub entries: Vec<IndexEntry>,
    /// Modification time of the index file, used for racy-clean detection.
    pub file_mtime: Option<StatTime>,
}

impl Index {
    /// Parses raw index bytes.
    pub fn parse(bytes: &[u8], format: ObjectFormat) -> Result<Self> {
        let oid_len = format.oid_len();
        let corrupt = |detail: String| GitError::corrupt("index", detail);

        if bytes.len() < HEADER_LEN + oid_len {
            return Err(corrupt("file too small".into()));
        }
        let (body, trailer) = bytes.split_at(bytes.len() - oid_len);
        verify_checksum(body, trailer, format)?;

        if &body[..4] != SIGNATURE {
            return Err(corrupt("bad signature".into()));
        }
        let version = read_u32(body, 4);
        if !(2..=4).contains(&version) {
            return Err(corrupt(format!("unsupported version {version}")));
        }
        let count = read_u32(body, 8) as usize;

        let mut entries: Vec<IndexEntry> = Vec::new();
        entries
            .try_reserve_exact(count.min(body.len() / (STAT_LEN + oid_len + 2)))
            .map_err(|e| GitError::AllocationFailed {
                requested: count as u64,
                detail: format!("index entries: {e}"),
            })?;

        let mut pos = HEADER_LEN;
        let mut previous_path: Vec<u8> = Vec::new();
        for n in 0..count {
            let start = pos;
            let fixed_end = start + STAT_LEN + oid_len + 2;
            if fixed_end > body.len() {
                return Err(corrupt(format!("entry {n} truncated")));
            }

            let ctime = StatTime {
                secs: read_u32(body, start),
                nanos: read_u32(body, start + 4),
            };
            let mtime = StatTime {
                secs: read_u32(body, start + 8),
                nanos: read_u32(body, start + 12),
            };
            let mode = read_u32(body, start + 24);
            let size = read_u32(body, start + 36);
            let id = ObjectId::from_bytes(&body[start + STAT_LEN..start + STAT_LEN + oid_len])
                .ok_or_else(|| corrupt(format!("entry {n} has a bad id")))?;
            let flags = read_u16(body, start + STAT_LEN + oid_len);
            pos = fixed_end;

            let mut extended = 0u16;
            if flags & FLAG_EXTENDED != 0 {
                if version < 3 {
                    return Err(corrupt(format!("entry {n} uses extended flags in v2")));
                }
                if pos + 2 > body.len() {
                    return Err(corrupt(format!("entry {n} truncated")));
                }
                extended = read_u16(body, pos);
                pos += 2;
            }

            let path = if version == 4 {
                let strip = read_offset_varint(body, &mut pos)
                    .ok_or_else(|| corrupt(format!("entry {n} has a bad path prefix")))?;
                if strip > previous_path.len() {
                    return Err(corrupt(format!("entry {n} strips past the previous path")));
                }
                let nul = find_nul(body, pos).ok_or_else(|| corrupt(format!("entry {n} path unterminated")))?;
                let mut path = previous_path[..previous_path.len() - strip].to_vec();
                path.extend_from_slice(&body[pos..nul]);
                pos = nul + 1;
                path
            } else {
                let nul = find_nul(body, pos).ok_or_else(|| corrupt(format!("entry {n} path unterminated")))?;
                let path = body[pos..nul].to_vec();
                // Entries are NUL padded to a multiple of eight bytes.
                let entry_len = nul - start;
                pos = start + (entry_len + 8) / 8 * 8;
                if pos > body.len() {
                    return Err(corrupt(format!("entry {n} padding truncated")));
                }
                path
            };

            if path.is_empty() {
                return Err(corrupt(format!("entry {n} has an empty path")));
            }
            let stage = ((flags & FLAG_STAGE_MASK) >> 12) as u8;
            if let Some(prev) = entries.last() {
                match prev.path.cmp(&path).then(prev.stage.cmp(&stage)) {
                    std::cmp::Ordering::Less => {}
                    std::cmp::Ordering::Equal => {
                        return Err(corrupt(format!(
                            "duplicate entry '{}'",
                            String::from_utf8_lossy(&path)
                        )))
                    }
                    std::cmp::Ordering::Greater => {
                        return Err(corrupt(format!(
                            "entry '{}' is out of order",
                            String::from_utf8_lossy(&path)
                        )))
                    }
                }
            }

            previous_path.clone_from(&path);
            entries.push(IndexEntry {
                path,
                mode,
                size,
                mtime,
                ctime,
                id,
                stage,
                assume_valid: flags & FLAG_ASSUME_VALID != 0,
                skip_worktree: extended & EXT_FLAG_SKIP_WORKTREE != 0,
                intent_to_add: extended & EXT_FLAG_INTENT_TO_ADD != 0,
            });
        }

        // Extensions: 4-byte signature, 4-byte length, payload. None are needed here.
        while pos < body.len() {
            if pos + 8 > body.len() {
                return Err(corrupt("truncated extension header".into()));
            }
            let len = read_u32(body, pos + 4) as usize;
            pos = pos
                .checked_add(8 + len)
                .filter(|end| *end <= body.len())
                .ok_or_else(|| corrupt("extension exceeds file size".into()))?;
        }

        Ok(Self {
            version,
            entries,
            file_mtime: None,
        })
    }

    /// Reads the index at `path`; a missing file is an empty index.
    pub fn read(path: &Path, format: ObjectFormat, options: &EngineOptions) -> Result<Self> {
        let backoff = Duration::from_millis(options.retry_backoff_ms);
        let bytes = read_optional(path, options.io_retries, backoff)
            .map_err(|e| GitError::io(format!("reading {}", path.display()), e))?;
        let Some(bytes) = bytes else {
            return Ok(Self::default());
        };
        let mut index = Self::parse(&bytes, format)?;
        index.file_mtime = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .map(StatTime::from_system_time);
        Ok(index)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry for `path` at stage 0.
    pub fn get(&self, path: &[u8]) -> Option<&IndexEntry> {
        self.entries
            .binary_search_by(|e| e.path.as_slice().cmp(path).then(e.stage.cmp(&0)))
            .ok()
            .map(|i| &self.entries[i])
    }

    /// True if `dir` (without trailing slash) contains any staged path.
    pub fn has_entries_under(&self, dir: &[u8]) -> bool {
        let mut prefix = dir.to_vec();
        prefix.push(b'/');
        let start = self.entries.partition_point(|e| e.path.as_slice() < prefix.as_slice());
        self.entries
            .get(start)
            .is_some_and(|e| e.path.starts_with(&prefix))
    }
}

fn verify_checksum(body: &[u8], trailer: &[u8], format: ObjectFormat) -> Result<()> {
    // index.skipHash writes an all-zero trailer.
    if trailer.iter().all(|b| *b == 0) {
        return Ok(());
    }
    let mut hasher = format.hasher();
    hasher.update(body);
    let actual = hasher.finalize();
    if actual.as_bytes() != trailer {
        return Err(GitError::corrupt("index", "checksum mismatch"));
    }
    Ok(())
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

fn find_nul(bytes: &[u8], from: usize) -> Option<usize> {
    bytes.get(from..)?.iter().position(|b| *b == 0).map(|i| from + i)
}

/// Big-endian offset varint used by index v4 (same scheme as OFS_DELTA).
fn read_offset_varint(bytes: &[u8], pos: &mut usize) -> Option<usize> {
    let mut c = *bytes.get(*pos)?;
    *pos += 1;
    let mut value = usize::from(c & 0x7f);
    let mut used = 1;
    while c & 0x80 != 0 {
        if used >= 10 {
            return None;
        }
        c = *bytes.get(*pos)?;
        *pos += 1;
        used += 1;
        value = value.checked_add(1)?.checked_shl(7)? | usize::from(c & 0x7f);
    }
    Some(value)
}

/// Caches the parsed index keyed on the file's mtime and size.
#[derive(Debug)]
pub struct IndexCache {
    path: PathBuf,
    format: ObjectFormat,
    options: EngineOptions,
    cached: RwLock<Option<((SystemTime, u64), Arc<Index>)>>,
}

impl IndexCache {
    /// Creates a cache for the index file at `path`.
    pub fn new(path: PathBuf, format: ObjectFormat, options: EngineOptions) -> Self {
        Self {
            path,
            format,
            options,
            cached: RwLock::new(None),
        }
    }

    /// Path of the index file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current snapshot, re-read if the file changed since the last call.
    pub fn load(&self) -> Result<Arc<Index>> {
        let stamp = std::fs::metadata(&self.path)
            .ok()
            .and_then(|m| Some((m.modified().ok()?, m.len())));

        if let (Some(stamp), Some((cached_stamp, index))) = (stamp, self.cached.read().as_ref()) {
            if stamp == *cached_stamp {
                return Ok(Arc::clone(index));
            }
        }

        let index = Arc::new(Index::read(&self.path, self.format, &self.options)?);
        debug!(entries = index.len(), version = index.version, "loaded index");
        if let Some(stamp) = stamp {
            *self.cached.write() = Some((stamp, Arc::clone(&index)));
        }
        Ok(index)
    }

    /// Drops the cached snapshot.
    pub fn invalidate(&self) {
        *self.cached.write() = None;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal entry description for [`build_index`].
    pub(crate) struct RawEntry<'a> {
        pub path: &'a str,
        pub id: ObjectId,
        pub mode: u32,
        pub size: u32,
        pub mtime: StatTime,
        pub stage: u8,
    }

    impl<'a> RawEntry<'a> {
        pub(crate) fn new(path: &'a str, id: ObjectId) -> Self {
            Self {
                path,
                id,
                mode: 0o100_644,
                size: 0,
                mtime: StatTime::default(),
                stage: 0,
            }
        }
    }

    fn offset_varint(mut n: usize) -> Vec<u8> {
        let mut bytes = vec![(n & 0x7f) as u8];
        n >>= 7;
        while n != 0 {
            n -= 1;
            bytes.push(0x80 | (n & 0x7f) as u8);
            n >>= 7;
        }
        bytes.reverse();
        bytes
    }

    /// Serializes entries as a SHA-1 index of the given version.
    pub(crate) fn build_index(version: u32, entries: &[RawEntry<'_>]) -> Vec<u8> {
        let mut out = SIGNATURE.to_vec();
        out.extend(version.to_be_bytes());
        out.extend((entries.len() as u32).to_be_bytes());

        let mut previous: &[u8] = b"";
        for entry in entries {
            let start = out.len();
            for value in [
                entry.mtime.secs,
                entry.mtime.nanos,
                entry.mtime.secs,
                entry.mtime.nanos,
                0,
                0,
                entry.mode,
                0,
                0,
                entry.size,
            ] {
                out.extend(value.to_be_bytes());
            }
            out.extend_from_slice(entry.id.as_bytes());
            let name_len = entry.path.len().min(0xfff) as u16;
            out.extend((name_len | (u16::from(entry.stage) << 12)).to_be_bytes());

            let path = entry.path.as_bytes();
            if version == 4 {
                let common = previous
                    .iter()
                    .zip(path)
                    .take_while(|(a, b)| a == b)
                    .count();
                out.extend(offset_varint(previous.len() - common));
                out.extend_from_slice(&path[common..]);
                out.push(0);
            } else {
                out.extend_from_slice(path);
                let len = out.len() - start;
                let padded = (len + 8) / 8 * 8;
                out.resize(start + padded, 0);
            }
            previous = path;
        }

        let mut hasher = ObjectFormat::Sha1.hasher();
        hasher.update(&out);
        out.extend_from_slice(hasher.finalize().as_bytes());
        out
    }

    fn id(byte: u8) -> ObjectId {
        ObjectId::from_bytes(&[byte; 20]).unwrap()
    }

    #[test]
    fn parses_v2_entries_in_order() {
        let mut a = RawEntry::new("a.txt", id(1));
        a.size = 6;
        a.mtime = StatTime { secs: 100, nanos: 5 };
        let bytes = build_index(2, &[a, RawEntry::new("dir/b.txt", id(2))]);

        let index = Index::parse(&bytes, ObjectFormat::Sha1).unwrap();
        assert_eq!(index.version, 2);
        assert_eq!(index.len(), 2);
        assert_eq!(index.entries[0].path, b"a.txt");
        assert_eq!(index.entries[0].size, 6);
        assert_eq!(index.entries[0].mtime, StatTime { secs: 100, nanos: 5 });
        assert_eq!(index.entries[1].id, id(2));
        assert!(index.get(b"dir/b.txt").is_some());
        assert!(index.has_entries_under(b"dir"));
        assert!(!index.has_entries_under(b"di"));
    }

    #[test]
    fn parses_v4_prefix_compression() {
        let entries = [
            RawEntry::new("src/git/index.rs", id(1)),
            RawEntry::new("src/git/refs.rs", id(2)),
            RawEntry::new("src/lib.rs", id(3)),
        ];
        let index = Index::parse(&build_index(4, &entries), ObjectFormat::Sha1).unwrap();
        let paths: Vec<String> = index.entries.iter().map(IndexEntry::path_str).collect();
        assert_eq!(paths, ["src/git/index.rs", "src/git/refs.rs", "src/lib.rs"]);
    }

    #[test]
    fn checksum_mismatch_is_corrupt() {
        let mut bytes = build_index(2, &[RawEntry::new("a", id(1))]);
        bytes[20] ^= 0xff;
        assert!(Index::parse(&bytes, ObjectFormat::Sha1).unwrap_err().is_corrupt());
    }

    #[test]
    fn duplicate_paths_are_corrupt() {
        let bytes = build_index(2, &[RawEntry::new("a", id(1)), RawEntry::new("a", id(2))]);
        let err = Index::parse(&bytes, ObjectFormat::Sha1).unwrap_err();
        assert!(err.to_string().contains("duplicate"), "{err}");
    }

    #[test]
    fn out_of_order_paths_are_corrupt() {
        let bytes = build_index(2, &[RawEntry::new("b", id(1)), RawEntry::new("a", id(2))]);
        assert!(Index::parse(&bytes, ObjectFormat::Sha1).unwrap_err().is_corrupt());
    }

    #[test]
    fn conflict_stages_share_a_path() {
        let mut ours = RawEntry::new("c", id(2));
        ours.stage = 2;
        let mut theirs = RawEntry::new("c", id(3));
        theirs.stage = 3;
        let index = Index::parse(&build_index(2, &[ours, theirs]), ObjectFormat::Sha1).unwrap();
        assert_eq!(index.len(), 2);
        assert!(index.get(b"c").is_none());
    }

    #[test]
    fn missing_index_is_empty_and_cache_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index");
        let cache = IndexCache::new(path.clone(), ObjectFormat::Sha1, EngineOptions::default());
        assert!(cache.load().unwrap().is_empty());

        std::fs::write(&path, build_index(2, &[RawEntry::new("a", id(1))])).unwrap();
        let first = cache.load().unwrap();
        assert_eq!(first.len(), 1);
        assert!(first.file_mtime.is_some());
        assert!(Arc::ptr_eq(&first, &cache.load().unwrap()));

        cache.invalidate();
        assert!(!Arc::ptr_eq(&first, &cache.load().unwrap()));
    }

    #[test]
    fn stat_time_tolerates_missing_nanos() {
        let a = StatTime { secs: 5, nanos: 0 };
        let b = StatTime { secs: 5, nanos: 7 };
        assert!(a.matches(&b));
        assert!(!b.matches(&StatTime { secs: 5, nanos: 8 }));
        assert!(!a.matches(&StatTime { secs: 6, nanos: 0 }));
    }
}
