//! Errors raised while producing a dump.
//!
//! Writers latch the first error they see and keep accepting (and discarding) writes, so the
//! heap walk never has to check for failure after each record. The first latched error of any
//! writer becomes the result of the dump.

use std::{io, path, sync::Arc};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DumpError>;

/// `Clone` so that one latched error can be reported by both a shard writer and the session.
#[derive(Debug, Clone, Error)]
pub enum DumpError {
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("heap dump file {} already exists", .0.display())]
    FileExists(path::PathBuf),

    #[error("cannot allocate {size} byte write buffer")]
    BufferAllocation { size: usize },

    #[error("only {completed} of {expected} dumpers completed")]
    Incomplete { completed: usize, expected: usize },

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<io::Error> for DumpError {
    fn from(e: io::Error) -> Self {
        DumpError::Io(Arc::new(e))
    }
}

impl DumpError {
    /// Maps `AlreadyExists` from a create-new open to `FileExists` for `path`.
    pub(crate) fn from_open(e: io::Error, path: &path::Path) -> DumpError {
        match e.kind() {
            io::ErrorKind::AlreadyExists => DumpError::FileExists(path.to_path_buf()),
            _ => DumpError::from(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_exists_becomes_file_exists() {
        let e = DumpError::from_open(
            io::Error::new(io::ErrorKind::AlreadyExists, "exists"),
            path::Path::new("/tmp/x.hprof"),
        );

        assert_eq!("heap dump file /tmp/x.hprof already exists", e.to_string());
    }

    #[test]
    fn other_open_errors_stay_io() {
        let e = DumpError::from_open(
            io::Error::new(io::ErrorKind::PermissionDenied, "nope"),
            path::Path::new("/tmp/x.hprof"),
        );

        assert!(matches!(e, DumpError::Io(_)));
        assert_eq!("I/O error: nope", e.to_string());
    }
}
