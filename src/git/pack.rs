//! Pack files and their version 2 indexes.
//!
//! A [`Pack`] is discovered cheaply (two paths) and mapped on first lookup.
//! The mapping happens once per pack under a mutex; afterwards the parsed
//! index and data are shared read-only through an `Arc`.
//!
//! Layout of an index v2 file:
//! `magic | version | fanout[256] | oids[n] | crc32[n] | offset32[n] |
//! offset64[m] | pack checksum | index checksum`.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use flate2::bufread::ZlibDecoder;
use memmap2::Mmap;
use parking_lot::Mutex;
use tracing::debug;

use super::object::{Object, ObjectKind};
use super::object_id::{ObjectFormat, ObjectId};
use crate::error::{GitError, Result};

const IDX_MAGIC: [u8; 4] = [0xff, b't', b'O', b'c'];
const IDX_VERSION: u32 = 2;
const IDX_HEADER_LEN: usize = 8;
const FANOUT_LEN: usize = 256 * 4;
const LARGE_OFFSET_FLAG: u32 = 0x8000_0000;
const PACK_HEADER_LEN: usize = 12;
/// Upper bound on bytes in a type/size header or OFS_DELTA offset.
const MAX_VARINT_BYTES: usize = 10;

/// Maps a whole file read-only.
#[allow(unsafe_code)]
fn map_file(path: &Path) -> Result<Mmap> {
    let file = File::open(path).map_err(|e| GitError::io(format!("opening {}", path.display()), e))?;
    // SAFETY: pack and index files are immutable once written; Git replaces
    // them by rename rather than rewriting in place.
    unsafe { Mmap::map(&file) }.map_err(|e| GitError::io(format!("mapping {}", path.display()), e))
}

fn be_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn be_u64(bytes: &[u8], at: usize) -> u64 {
    (u64::from(be_u32(bytes, at)) << 32) | u64::from(be_u32(bytes, at + 4))
}

/// Parsed view of a `.idx` file.
#[derive(Debug)]
pub struct PackIndex {
    bytes: Mmap,
    oid_len: usize,
    count: usize,
    oids_at: usize,
    offsets_at: usize,
    large_at: usize,
    large_count: usize,
}

impl PackIndex {
    fn parse(bytes: Mmap, format: ObjectFormat, what: &str) -> Result<Self> {
        let oid_len = format.oid_len();
        let corrupt = |detail: &str| GitError::corrupt(what, detail);

        if bytes.len() < IDX_HEADER_LEN + FANOUT_LEN + 2 * oid_len {
            return Err(corrupt("file too small"));
        }
        if bytes[..4] != IDX_MAGIC {
            return Err(corrupt("not a version 2 index (bad magic)"));
        }
        let version = be_u32(&bytes, 4);
        if version != IDX_VERSION {
            return Err(GitError::corrupt(
                what,
                format!("unsupported index version {version}"),
            ));
        }

        let mut prev = 0;
        for bucket in 0..256 {
            let value = be_u32(&bytes, IDX_HEADER_LEN + bucket * 4);
            if value < prev {
                return Err(corrupt("fanout table is not monotonic"));
            }
            prev = value;
        }
        let count = prev as usize;

        let oids_at = IDX_HEADER_LEN + FANOUT_LEN;
        let crc_at = oids_at + count * oid_len;
        let offsets_at = crc_at + count * 4;
        let large_at = offsets_at + count * 4;
        let trailer = 2 * oid_len;
        if bytes.len() < large_at + trailer {
            return Err(corrupt("tables exceed file size"));
        }
        let large_bytes = bytes.len() - large_at - trailer;
        if large_bytes % 8 != 0 {
            return Err(corrupt("large offset table is not a multiple of 8"));
        }

        Ok(Self {
            oid_len,
            count,
            oids_at,
            offsets_at,
            large_at,
            large_count: large_bytes / 8,
            bytes,
        })
    }

    /// Number of objects listed.
    pub fn len(&self) -> usize {
        self.count
    }

    /// True when the index lists no objects.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn fanout(&self, bucket: usize) -> usize {
        be_u32(&self.bytes, IDX_HEADER_LEN + bucket * 4) as usize
    }

    fn oid_at(&self, i: usize) -> &[u8] {
        let start = self.oids_at + i * self.oid_len;
        &self.bytes[start..start + self.oid_len]
    }

    fn offset_at(&self, i: usize, what: &str) -> Result<u64> {
        let raw = be_u32(&self.bytes, self.offsets_at + i * 4);
        if raw & LARGE_OFFSET_FLAG == 0 {
            return Ok(u64::from(raw));
        }
        let slot = (raw & !LARGE_OFFSET_FLAG) as usize;
        if slot >= self.large_count {
            return Err(GitError::corrupt(what, "large offset index out of bounds"));
        }
        Ok(be_u64(&self.bytes, self.large_at + slot * 8))
    }

    /// Binary search within the fanout bucket of `id`'s first byte.
    pub fn lookup(&self, id: &ObjectId, what: &str) -> Result<Option<u64>> {
        let key = id.as_bytes();
        if key.len() != self.oid_len {
            return Ok(None);
        }
        let first = usize::from(key[0]);
        let mut lo = if first == 0 { 0 } else { self.fanout(first - 1) };
        let mut hi = self.fanout(first);

        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.oid_at(mid).cmp(key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return self.offset_at(mid, what).map(Some),
            }
        }
        Ok(None)
    }
}

/// Where a delta entry finds its base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaBase {
    /// OFS_DELTA: absolute offset in the same pack.
    Offset(u64),
    /// REF_DELTA: base named by id, possibly outside this pack.
    Id(ObjectId),
}

/// Decoded pack entry before delta resolution.
#[derive(Debug)]
pub enum PackEntry {
    /// Complete object.
    Full(Object),
    /// Delta instructions against a base.
    Delta {
        /// Base location.
        base: DeltaBase,
        /// Inflated delta stream.
        delta: Vec<u8>,
    },
}

#[derive(Debug)]
struct LoadedPack {
    index: PackIndex,
    data: Mmap,
}

/// One pack file with its index, mapped lazily.
#[derive(Debug)]
pub struct Pack {
    pack_path: PathBuf,
    idx_path: PathBuf,
    format: ObjectFormat,
    loaded: OnceLock<Arc<LoadedPack>>,
    init: Mutex<()>,
}

impl Pack {
    /// Describes the pack whose index lives at `idx_path`.
    pub fn new(idx_path: PathBuf, format: ObjectFormat) -> Self {
        Self {
            pack_path: idx_path.with_extension("pack"),
            idx_path,
            format,
            loaded: OnceLock::new(),
            init: Mutex::new(()),
        }
    }

    /// Path of the `.pack` file.
    pub fn pack_path(&self) -> &Path {
        &self.pack_path
    }

    fn what(&self) -> String {
        format!("pack {}", self.pack_path.display())
    }

    fn loaded(&self) -> Result<Arc<LoadedPack>> {
        if let Some(loaded) = self.loaded.get() {
            return Ok(Arc::clone(loaded));
        }
        let _guard = self.init.lock();
        if let Some(loaded) = self.loaded.get() {
            return Ok(Arc::clone(loaded));
        }

        let what = self.what();
        let index = PackIndex::parse(map_file(&self.idx_path)?, self.format, &what)?;
        let data = map_file(&self.pack_path)?;
        if data.len() < PACK_HEADER_LEN + self.format.oid_len() || &data[..4] != b"PACK" {
            return Err(GitError::corrupt(&what, "bad pack header"));
        }
        let version = be_u32(&data, 4);
        if version != 2 && version != 3 {
            return Err(GitError::corrupt(
                &what,
                format!("unsupported pack version {version}"),
            ));
        }
        let count = be_u32(&data, 8) as usize;
        if count != index.len() {
            return Err(GitError::corrupt(
                &what,
                format!("pack holds {count} objects but index lists {}", index.len()),
            ));
        }
        debug!(pack = %self.pack_path.display(), objects = count, "mapped pack");

        let loaded = Arc::new(LoadedPack { index, data });
        let _ = self.loaded.set(Arc::clone(&loaded));
        Ok(loaded)
    }

    /// Offset of `id` in this pack, if present.
    pub fn find(&self, id: &ObjectId) -> Result<Option<u64>> {
        self.loaded()?.index.lookup(id, &self.what())
    }

    /// Number of objects in the pack.
    pub fn object_count(&self) -> Result<usize> {
        Ok(self.loaded()?.index.len())
    }

    /// Decodes the entry at `offset` without resolving deltas.
    pub fn entry_at(&self, offset: u64, max_size: u64) -> Result<PackEntry> {
        let loaded = self.loaded()?;
        let what = self.what();
        let data = &loaded.data[..];
        let data_end = data.len() - self.format.oid_len();
        let corrupt = |detail: String| GitError::corrupt(&what, detail);

        let mut pos = usize::try_from(offset).map_err(|_| corrupt(format!("offset {offset}")))?;
        if pos < PACK_HEADER_LEN || pos >= data_end {
            return Err(corrupt(format!("offset {offset} out of range")));
        }

        let first = data[pos];
        pos += 1;
        let ty = (first >> 4) & 0x07;
        let mut size = u64::from(first & 0x0f);
        let mut shift = 4;
        let mut byte = first;
        let mut used = 1;
        while byte & 0x80 != 0 {
            if used >= MAX_VARINT_BYTES || pos >= data_end {
                return Err(corrupt(format!("entry header at {offset} too long")));
            }
            byte = data[pos];
            pos += 1;
            used += 1;
            size |= u64::from(byte & 0x7f) << shift;
            shift += 7;
        }
        if size > max_size {
            return Err(GitError::AllocationFailed {
                requested: size,
                detail: format!("entry at {offset} in {what} exceeds the object size cap"),
            });
        }

        let base = match ty {
            6 => {
                let mut c = *data.get(pos).ok_or_else(|| corrupt("truncated".into()))?;
                pos += 1;
                let mut distance = u64::from(c & 0x7f);
                let mut used = 1;
                while c & 0x80 != 0 {
                    if used >= MAX_VARINT_BYTES || pos >= data_end {
                        return Err(corrupt(format!("delta offset at {offset} too long")));
                    }
                    c = data[pos];
                    pos += 1;
                    used += 1;
                    distance = ((distance + 1) << 7) | u64::from(c & 0x7f);
                }
                if distance == 0 || distance > offset {
                    return Err(corrupt(format!("delta base before pack start at {offset}")));
                }
                Some(DeltaBase::Offset(offset - distance))
            }
            7 => {
                let raw = data
                    .get(pos..pos + self.format.oid_len())
                    .filter(|_| pos + self.format.oid_len() <= data_end)
                    .ok_or_else(|| corrupt("truncated base id".into()))?;
                pos += raw.len();
                let id = ObjectId::from_bytes(raw).ok_or_else(|| corrupt("bad base id".into()))?;
                Some(DeltaBase::Id(id))
            }
            _ => None,
        };

        let body = inflate_exact(&data[pos..data_end], size)
            .map_err(|detail| corrupt(format!("entry at {offset}: {detail}")))?;

        match base {
            Some(base) => Ok(PackEntry::Delta { base, delta: body }),
            None => {
                let kind = ObjectKind::from_pack_type(ty)
                    .ok_or_else(|| corrupt(format!("invalid object type {ty} at {offset}")))?;
                Ok(PackEntry::Full(Object { kind, data: body }))
            }
        }
    }
}

/// Inflates a zlib stream that must produce exactly `size` bytes.
fn inflate_exact(input: &[u8], size: u64) -> std::result::Result<Vec<u8>, String> {
    let mut out = Vec::new();
    out.try_reserve_exact(size as usize)
        .map_err(|e| format!("cannot reserve {size} bytes: {e}"))?;
    ZlibDecoder::new(input)
        .take(size + 1)
        .read_to_end(&mut out)
        .map_err(|e| format!("zlib stream: {e}"))?;
    if out.len() as u64 != size {
        return Err(format!("inflated {} bytes, expected {size}", out.len()));
    }
    Ok(out)
}

/// Lists the packs under `objects/pack`, newest modification first.
pub fn discover_packs(objects_dir: &Path, format: ObjectFormat) -> Result<Vec<Pack>> {
    let pack_dir = objects_dir.join("pack");
    let entries = match std::fs::read_dir(&pack_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(GitError::io(format!("listing {}", pack_dir.display()), e)),
    };

    let mut found = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| GitError::io(format!("listing {}", pack_dir.display()), e))?;
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "idx") && path.with_extension("pack").is_file()
        {
            let mtime = entry.metadata().and_then(|m| m.modified()).ok();
            found.push((mtime, path));
        }
    }
    found.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    Ok(found
        .into_iter()
        .map(|(_, path)| Pack::new(path, format))
        .collect())
}
