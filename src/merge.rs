//! Concatenation of worker shards into the final file.

use crate::error::{DumpError, Result};
use crate::heap_dump;
use crate::writer::RecordWriter;
use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// `<path>.p<ordinal>`
pub fn shard_path(path: &Path, ordinal: usize) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(format!(".p{}", ordinal));
    PathBuf::from(name)
}

pub struct DumpMerger<'a> {
    path: &'a Path,
    /// Ordinals of the shards this dump created
    ordinals: Vec<usize>,
}

impl<'a> DumpMerger<'a> {
    pub fn new(path: &'a Path, mut ordinals: Vec<usize>) -> DumpMerger<'a> {
        ordinals.sort_unstable();
        DumpMerger { path, ordinals }
    }

    /// Appends every shard, in ordinal order, to `writer`, then the HEAP_DUMP_END record.
    ///
    /// Every shard is attempted and then deleted even after a failure; the first failure is
    /// returned once all of them have been handled. Shards are already compressed, so they are
    /// copied verbatim with the compressor set aside.
    pub fn merge<W: Write>(&self, writer: &mut RecordWriter<W>) -> Result<()> {
        writer.flush();
        let compressor = writer.take_compressor();
        let mut first_error = None;

        for ordinal in self.ordinals.iter().copied() {
            let path = shard_path(self.path, ordinal);
            if !writer.has_error() {
                match merge_shard(writer, &path) {
                    Ok(bytes) => log::debug!("Merged {} ({} bytes)", path.display(), bytes),
                    Err(e) => {
                        log::warn!("Failed to merge heap dump shard {}: {}", path.display(), e);
                        first_error.get_or_insert(e);
                    }
                }
            }

            if let Err(e) = fs::remove_file(&path) {
                log::warn!("Cannot remove heap dump shard {}: {}", path.display(), e);
            }
        }

        writer.set_compressor(compressor);
        heap_dump::write_heap_dump_end(writer);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn merge_shard<W: Write>(writer: &mut RecordWriter<W>, path: &Path) -> Result<u64> {
    let mut shard = fs::File::open(path)?;
    let expected = shard.metadata()?.len();
    let copied = writer.copy_from(&mut shard)?;

    if copied != expected {
        return Err(DumpError::Internal(format!(
            "copied {} of {} bytes from {}",
            copied,
            expected,
            path.display()
        )));
    }

    Ok(copied)
}
