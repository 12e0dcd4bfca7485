//! Git delta decoding (`copy` / `insert` instruction streams).

use thiserror::Error;

/// Ways a delta stream can be malformed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaError {
    /// Stream ended inside a varint or instruction.
    #[error("delta truncated")]
    Truncated,
    /// Varint wider than 64 bits.
    #[error("delta size varint overflow")]
    VarintOverflow,
    /// Header base size disagrees with the actual base.
    #[error("delta base size {expected} but base has {actual} bytes")]
    BaseSizeMismatch {
        /// Size recorded in the delta.
        expected: u64,
        /// Size of the supplied base.
        actual: u64,
    },
    /// Result would exceed the caller's cap.
    #[error("delta result of {0} bytes exceeds the cap")]
    TooLarge(u64),
    /// Copy instruction reaches past the end of the base.
    #[error("delta copy out of range")]
    CopyOutOfRange,
    /// Instruction byte 0 is reserved.
    #[error("reserved delta instruction 0")]
    ReservedInstruction,
    /// Output length disagrees with the header.
    #[error("delta produced {actual} bytes, header says {expected}")]
    ResultSizeMismatch {
        /// Size recorded in the delta.
        expected: u64,
        /// Bytes actually produced.
        actual: u64,
    },
}

/// Reads a little-endian base-128 varint.
fn read_varint(data: &[u8], pos: &mut usize) -> Result<u64, DeltaError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *data.get(*pos).ok_or(DeltaError::Truncated)?;
        *pos += 1;
        if shift > 63 {
            return Err(DeltaError::VarintOverflow);
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// Applies `delta` to `base`, refusing results larger than `max_out`.
pub fn apply_delta(base: &[u8], delta: &[u8], max_out: u64) -> Result<Vec<u8>, DeltaError> {
    let mut pos = 0;
    let base_size = read_varint(delta, &mut pos)?;
    let result_size = read_varint(delta, &mut pos)?;

    if base_size != base.len() as u64 {
        return Err(DeltaError::BaseSizeMismatch {
            expected: base_size,
            actual: base.len() as u64,
        });
    }
    if result_size > max_out {
        return Err(DeltaError::TooLarge(result_size));
    }

    let mut out = Vec::with_capacity(result_size as usize);
    while pos < delta.len() {
        let cmd = delta[pos];
        pos += 1;

        if cmd & 0x80 != 0 {
            let mut offset = 0usize;
            for (bit, shift) in [(0x01, 0), (0x02, 8), (0x04, 16), (0x08, 24)] {
                if cmd & bit != 0 {
                    let b = *delta.get(pos).ok_or(DeltaError::Truncated)?;
                    offset |= usize::from(b) << shift;
                    pos += 1;
                }
            }
            let mut size = 0usize;
            for (bit, shift) in [(0x10, 0), (0x20, 8), (0x40, 16)] {
                if cmd & bit != 0 {
                    let b = *delta.get(pos).ok_or(DeltaError::Truncated)?;
                    size |= usize::from(b) << shift;
                    pos += 1;
                }
            }
            if size == 0 {
                size = 0x10000;
            }

            let end = offset
                .checked_add(size)
                .filter(|end| *end <= base.len())
                .ok_or(DeltaError::CopyOutOfRange)?;
            if (out.len() + size) as u64 > result_size {
                return Err(DeltaError::ResultSizeMismatch {
                    expected: result_size,
                    actual: (out.len() + size) as u64,
                });
            }
            out.extend_from_slice(&base[offset..end]);
        } else if cmd != 0 {
            let size = usize::from(cmd);
            let literal = delta.get(pos..pos + size).ok_or(DeltaError::Truncated)?;
            if (out.len() + size) as u64 > result_size {
                return Err(DeltaError::ResultSizeMismatch {
                    expected: result_size,
                    actual: (out.len() + size) as u64,
                });
            }
            out.extend_from_slice(literal);
            pos += size;
        } else {
            return Err(DeltaError::ReservedInstruction);
        }
    }

    if out.len() as u64 != result_size {
        return Err(DeltaError::ResultSizeMismatch {
            expected: result_size,
            actual: out.len() as u64,
        });
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn varint(mut value: u64) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let mut byte = (value & 0x7f) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            out.push(byte);
            if value == 0 {
                return out;
            }
        }
    }

    /// Delta that copies all of `base` and appends `suffix`.
    pub(crate) fn append_delta(base: &[u8], suffix: &[u8]) -> Vec<u8> {
        assert!(base.len() < 256 && !suffix.is_empty() && suffix.len() < 128);
        let mut delta = varint(base.len() as u64);
        delta.extend(varint((base.len() + suffix.len()) as u64));
        delta.extend([0x90, base.len() as u8]);
        delta.push(suffix.len() as u8);
        delta.extend_from_slice(suffix);
        delta
    }

    #[test]
    fn copies_and_inserts() {
        let out = apply_delta(b"abc", &append_delta(b"abc", b"XYZ"), 64).unwrap();
        assert_eq!(out, b"abcXYZ");
    }

    #[test]
    fn copy_with_offset() {
        let base = b"0123456789";
        let mut delta = varint(10);
        delta.extend(varint(4));
        // offset 3 (one offset byte), size 4 (one size byte)
        delta.extend([0x91, 3, 4]);
        assert_eq!(apply_delta(base, &delta, 64).unwrap(), b"3456");
    }

    #[test]
    fn rejects_base_size_mismatch() {
        let delta = append_delta(b"abcd", b"x");
        assert!(matches!(
            apply_delta(b"abc", &delta, 64),
            Err(DeltaError::BaseSizeMismatch { .. })
        ));
    }

    #[test]
    fn rejects_out_of_range_copy() {
        let mut delta = varint(3);
        delta.extend(varint(5));
        delta.extend([0x91, 1, 5]);
        assert_eq!(
            apply_delta(b"abc", &delta, 64),
            Err(DeltaError::CopyOutOfRange)
        );
    }

    #[test]
    fn rejects_reserved_and_truncated() {
        let mut delta = varint(3);
        delta.extend(varint(1));
        delta.push(0);
        assert_eq!(
            apply_delta(b"abc", &delta, 64),
            Err(DeltaError::ReservedInstruction)
        );

        let mut delta = varint(3);
        delta.extend(varint(4));
        delta.extend([4, b'a']);
        assert_eq!(apply_delta(b"abc", &delta, 64), Err(DeltaError::Truncated));
    }

    #[test]
    fn enforces_cap() {
        let delta = append_delta(b"abc", b"XYZ");
        assert_eq!(apply_delta(b"abc", &delta, 5), Err(DeltaError::TooLarge(6)));
    }
}
