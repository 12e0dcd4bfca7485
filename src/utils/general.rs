//! Utility functions and helpers.

use std::io;
use std::path::Path;
use std::thread;
use std::time::Duration;

use tracing::debug;

/// Returns true for I/O errors worth retrying.
///
/// Git rewrites the index and refs by writing a `.lock` file and renaming
/// it into place; readers racing that rename can briefly see these kinds.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::PermissionDenied
            | io::ErrorKind::UnexpectedEof
    )
}

/// Runs `op`, retrying transient failures up to `retries` extra times with
/// exponential backoff starting at `backoff`.
pub fn retry_io<T>(
    retries: u32,
    backoff: Duration,
    mut op: impl FnMut() -> io::Result<T>,
) -> io::Result<T> {
    let mut delay = backoff;
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if attempt < retries && is_transient(&err) => {
                attempt += 1;
                debug!(attempt, error = %err, "retrying transient I/O failure");
                thread::sleep(delay);
                delay = delay.saturating_mul(2);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Reads a whole file with [`retry_io`]; `Ok(None)` if it does not exist.
pub fn read_optional(path: &Path, retries: u32, backoff: Duration) -> io::Result<Option<Vec<u8>>> {
    match retry_io(retries, backoff, || std::fs::read(path)) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn retries_transient_errors() {
        let calls = Cell::new(0);
        let result = retry_io(3, Duration::ZERO, || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(io::Error::from(io::ErrorKind::Interrupted))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn gives_up_after_budget() {
        let calls = Cell::new(0);
        let result: io::Result<()> = retry_io(2, Duration::ZERO, || {
            calls.set(calls.get() + 1);
            Err(io::Error::from(io::ErrorKind::WouldBlock))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn does_not_retry_permanent_errors() {
        let calls = Cell::new(0);
        let result: io::Result<()> = retry_io(5, Duration::ZERO, || {
            calls.set(calls.get() + 1);
            Err(io::Error::from(io::ErrorKind::NotFound))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let missing = read_optional(&dir.path().join("nope"), 1, Duration::ZERO).unwrap();
        assert!(missing.is_none());
    }
}
