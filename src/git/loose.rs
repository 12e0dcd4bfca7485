//! Loose object storage: one zlib stream per object under `objects/xx/`.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use flate2::read::ZlibDecoder;
use tracing::trace;

use super::object::{hash_object, Object, ObjectKind};
use super::object_id::{ObjectFormat, ObjectId};
use crate::error::{GitError, Result};

/// Longest header Git writes: `commit 18446744073709551615\0`.
const MAX_HEADER_LEN: u64 = 32;

/// Reader for one `objects/` directory.
#[derive(Debug, Clone)]
pub struct LooseStore {
    objects_dir: PathBuf,
    format: ObjectFormat,
}

impl LooseStore {
    /// Creates a reader rooted at `objects_dir`.
    pub fn new(objects_dir: impl Into<PathBuf>, format: ObjectFormat) -> Self {
        Self {
            objects_dir: objects_dir.into(),
            format,
        }
    }

    /// Directory this store reads from.
    pub fn objects_dir(&self) -> &Path {
        &self.objects_dir
    }

    /// File that would hold `id`.
    pub fn path_for(&self, id: &ObjectId) -> PathBuf {
        let hex = id.to_hex();
        self.objects_dir.join(&hex[..2]).join(&hex[2..])
    }

    /// True if a loose file exists for `id`.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.path_for(id).is_file()
    }

    /// Reads and verifies `id`; `Ok(None)` when there is no loose file.
    ///
    /// The recomputed hash of the inflated stream must equal `id`, so a
    /// flipped byte anywhere in the file surfaces as [`GitError::Corrupt`].
    pub fn read(&self, id: &ObjectId, max_size: u64) -> Result<Option<Object>> {
        let path = self.path_for(id);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(GitError::io(format!("opening {}", path.display()), e)),
        };

        let what = || format!("loose object {id}");
        let limit = max_size.saturating_add(MAX_HEADER_LEN);
        let mut inflated = Vec::new();
        ZlibDecoder::new(file)
            .take(limit + 1)
            .read_to_end(&mut inflated)
            .map_err(|e| match e.kind() {
                io::ErrorKind::InvalidInput
                | io::ErrorKind::InvalidData
                | io::ErrorKind::UnexpectedEof
                | io::ErrorKind::Other => {
                    GitError::corrupt(what(), format!("zlib stream: {e}"))
                }
                _ => GitError::io(format!("reading {}", path.display()), e),
            })?;
        if inflated.len() as u64 > limit {
            return Err(GitError::AllocationFailed {
                requested: inflated.len() as u64,
                detail: format!("{} exceeds the object size cap", what()),
            });
        }

        let object = parse_loose(&inflated).map_err(|detail| GitError::corrupt(what(), detail))?;
        let actual = hash_object(self.format, object.kind, &object.data);
        if actual != *id {
            return Err(GitError::corrupt(
                what(),
                format!("content hashes to {actual}"),
            ));
        }
        trace!(%id, kind = %object.kind, size = object.data.len(), "read loose object");
        Ok(Some(object))
    }
}

/// Splits `<kind> <size>\0<body>` and checks the declared size.
fn parse_loose(inflated: &[u8]) -> std::result::Result<Object, String> {
    let nul = inflated
        .iter()
        .take(MAX_HEADER_LEN as usize)
        .position(|b| *b == 0)
        .ok_or("missing header terminator")?;
    let header = &inflated[..nul];
    let space = header
        .iter()
        .position(|b| *b == b' ')
        .ok_or("header without size")?;

    let kind = ObjectKind::from_name(&header[..space]).ok_or("unknown object kind")?;
    let size: usize = std::str::from_utf8(&header[space + 1..])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or("invalid size")?;

    let data = &inflated[nul + 1..];
    if data.len() != size {
        return Err(format!(
            "declared size {size} but body has {} bytes",
            data.len()
        ));
    }
    Ok(Object {
        kind,
        data: data.to_vec(),
    })
}
