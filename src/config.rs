use crate::introspect::MethodInfo;
use crate::writer;
use crate::Id;
use getset::{CopyGetters, Getters};
use std::path;

/// Where and how to write one dump.
///
/// ```
/// use jvm_hprof_writer::DumpConfig;
///
/// let config = DumpConfig::new("/tmp/heap.hprof")
///     .with_compression_level(Some(6))
///     .with_parallelism(4);
/// assert_eq!(Some(6), config.compression_level());
/// ```
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct DumpConfig {
    #[get = "pub"]
    path: path::PathBuf,
    /// Replace an existing file instead of failing
    #[get_copy = "pub"]
    overwrite: bool,
    /// gzip level 1..=9; None writes an uncompressed file
    #[get_copy = "pub"]
    compression_level: Option<u32>,
    /// Number of heap-walking workers; 1 disables shard files
    #[get_copy = "pub"]
    parallelism: usize,
    /// Size of each writer's segment buffer
    #[get_copy = "pub"]
    buffer_size: usize,
    #[get_copy = "pub"]
    out_of_memory: Option<OutOfMemoryContext>,
}

/// The in-flight allocation failure that triggered the dump. Its thread's stack gets an extra
/// top frame for `constructor`, so tools can show where the failure was being constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfMemoryContext {
    /// Thread object of the failing thread
    pub thread: Id,
    pub constructor: MethodInfo,
}

impl DumpConfig {
    pub fn new<P: Into<path::PathBuf>>(path: P) -> DumpConfig {
        DumpConfig {
            path: path.into(),
            overwrite: false,
            compression_level: None,
            parallelism: rayon::current_num_threads(),
            buffer_size: writer::DEFAULT_BUFFER_SIZE,
            out_of_memory: None,
        }
    }

    #[must_use]
    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    #[must_use]
    pub fn with_compression_level(mut self, level: Option<u32>) -> Self {
        self.compression_level = level;
        self
    }

    /// At least 1
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// At least `writer::MIN_BUFFER_SIZE`
    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(writer::MIN_BUFFER_SIZE);
        self
    }

    #[must_use]
    pub fn with_out_of_memory(mut self, context: Option<OutOfMemoryContext>) -> Self {
        self.out_of_memory = context;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = DumpConfig::new("heap.hprof");

        assert_eq!(path::Path::new("heap.hprof"), config.path());
        assert!(!config.overwrite());
        assert_eq!(None, config.compression_level());
        assert!(config.parallelism() >= 1);
        assert_eq!(writer::DEFAULT_BUFFER_SIZE, config.buffer_size());
        assert!(config.out_of_memory().is_none());
    }

    #[test]
    fn builders_clamp_to_minimums() {
        let config = DumpConfig::new("heap.hprof")
            .with_parallelism(0)
            .with_buffer_size(1);

        assert_eq!(1, config.parallelism());
        assert_eq!(writer::MIN_BUFFER_SIZE, config.buffer_size());
    }
}
