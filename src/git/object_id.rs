//! Object identifiers and the hash functions that produce them.
//!
//! An [`ObjectId`] stores up to 32 bytes inline with a length tag so SHA-1
//! and SHA-256 repositories share one type. Only `bytes[..len]` is
//! meaningful; the tail is always zero so derived equality and hashing
//! stay correct.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::error::{GitError, Result};

/// Hash function used by a repository.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectFormat {
    /// 20-byte SHA-1 ids.
    #[default]
    Sha1,
    /// 32-byte SHA-256 ids.
    Sha256,
}

impl ObjectFormat {
    /// Raw id length in bytes.
    pub const fn oid_len(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
        }
    }

    /// Id length in hex characters.
    pub const fn hex_len(self) -> usize {
        self.oid_len() * 2
    }

    /// Infers the format from a raw id length.
    pub const fn from_oid_len(len: usize) -> Option<Self> {
        match len {
            20 => Some(Self::Sha1),
            32 => Some(Self::Sha256),
            _ => None,
        }
    }

    /// Starts an incremental hash in this format.
    pub fn hasher(self) -> ObjectHasher {
        match self {
            Self::Sha1 => ObjectHasher::Sha1(Sha1::new()),
            Self::Sha256 => ObjectHasher::Sha256(Sha256::new()),
        }
    }
}

impl FromStr for ObjectFormat {
    type Err = GitError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            other => Err(GitError::corrupt(
                "config",
                format!("unknown object format '{other}'"),
            )),
        }
    }
}

/// Incremental hasher producing an [`ObjectId`].
pub enum ObjectHasher {
    /// SHA-1 state.
    Sha1(Sha1),
    /// SHA-256 state.
    Sha256(Sha256),
}

impl ObjectHasher {
    /// Feeds bytes into the hash.
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
        }
    }

    /// Finishes the hash.
    pub fn finalize(self) -> ObjectId {
        match self {
            Self::Sha1(h) => ObjectId::from_array_20(h.finalize().into()),
            Self::Sha256(h) => ObjectId::from_array_32(h.finalize().into()),
        }
    }
}

/// Content hash of a Git object.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId {
    len: u8,
    bytes: [u8; 32],
}

impl ObjectId {
    fn from_array_20(raw: [u8; 20]) -> Self {
        let mut bytes = [0u8; 32];
        bytes[..20].copy_from_slice(&raw);
        Self { len: 20, bytes }
    }

    fn from_array_32(bytes: [u8; 32]) -> Self {
        Self { len: 32, bytes }
    }

    /// Builds an id from raw bytes; `None` unless the slice is 20 or 32 bytes.
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        ObjectFormat::from_oid_len(raw.len())?;
        let mut bytes = [0u8; 32];
        bytes[..raw.len()].copy_from_slice(raw);
        Some(Self {
            len: raw.len() as u8,
            bytes,
        })
    }

    /// Parses a full-length lowercase or uppercase hex id.
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let format = ObjectFormat::from_oid_len(hex_str.len() / 2)
            .filter(|f| f.hex_len() == hex_str.len())
            .ok_or_else(|| {
                GitError::corrupt("object id", format!("'{hex_str}' has the wrong length"))
            })?;
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(hex_str, &mut bytes[..format.oid_len()])
            .map_err(|e| GitError::corrupt("object id", format!("'{hex_str}': {e}")))?;
        Ok(Self {
            len: format.oid_len() as u8,
            bytes,
        })
    }

    /// The all-zero id of the given format.
    pub fn null(format: ObjectFormat) -> Self {
        Self {
            len: format.oid_len() as u8,
            bytes: [0u8; 32],
        }
    }

    /// True for the all-zero id.
    pub fn is_null(&self) -> bool {
        self.as_bytes().iter().all(|b| *b == 0)
    }

    /// Raw id bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Format implied by the id length.
    pub fn format(&self) -> ObjectFormat {
        if self.len == 32 {
            ObjectFormat::Sha256
        } else {
            ObjectFormat::Sha1
        }
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }
}

impl Ord for ObjectId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_bytes().cmp(other.as_bytes())
    }
}

impl PartialOrd for ObjectId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = GitError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_BLOB_SHA1: &str = "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391";

    #[test]
    fn hex_round_trip() {
        let id = ObjectId::from_hex(EMPTY_BLOB_SHA1).unwrap();
        assert_eq!(id.to_string(), EMPTY_BLOB_SHA1);
        assert_eq!(id.format(), ObjectFormat::Sha1);
        assert_eq!(id.as_bytes().len(), 20);
    }

    #[test]
    fn rejects_bad_hex() {
        assert!(ObjectId::from_hex("abc").is_err());
        assert!(ObjectId::from_hex(&"zz".repeat(20)).is_err());
    }

    #[test]
    fn hasher_matches_git_empty_blob() {
        let mut hasher = ObjectFormat::Sha1.hasher();
        hasher.update(b"blob 0\0");
        assert_eq!(hasher.finalize().to_hex(), EMPTY_BLOB_SHA1);
    }

    #[test]
    fn sha256_ids_are_32_bytes() {
        let mut hasher = ObjectFormat::Sha256.hasher();
        hasher.update(b"blob 0\0");
        let id = hasher.finalize();
        assert_eq!(id.format(), ObjectFormat::Sha256);
        assert_eq!(id.to_hex().len(), 64);
        assert_eq!(ObjectId::from_hex(&id.to_hex()).unwrap(), id);
    }

    #[test]
    fn ordering_is_bytewise() {
        let a = ObjectId::from_hex(&"00".repeat(20)).unwrap();
        let b = ObjectId::from_hex(&format!("{}01", "00".repeat(19))).unwrap();
        assert!(a < b);
        assert!(a.is_null());
        assert_eq!(a, ObjectId::null(ObjectFormat::Sha1));
    }
}
