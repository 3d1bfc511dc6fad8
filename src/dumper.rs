//! Orchestration of one dump: the pause, the workers, and the final merge.
//!
//! With a single worker everything is written straight into the output file. With more, worker
//! 0 (the leader) writes the file preamble (header, symbols, LOAD_CLASS records and the traces
//! of platform threads) to the output file while every worker, leader included, walks its own
//! partition of the heap into a shard file `<path>.p<N>`. Traces of unmounted virtual threads
//! are found during the heap walk and go to the output file as well, so the output writer is
//! shared behind a lock. Once all workers have reported, the shards are appended to the output
//! file in ordinal order.

use crate::compression::{Compressor, GzipCompressor};
use crate::config::DumpConfig;
use crate::error::{DumpError, Result};
use crate::heap_dump::{self, ObjectGraphEncoder};
use crate::introspect::{ClassInfo, ClassKind, HeapIntrospector, StackIntrospector, WorldPause};
use crate::merge::{self, DumpMerger};
use crate::thread_dump::{self, SerialAllocator, ThreadSnapshot};
use crate::writer::RecordWriter;
use crate::{Id, IdSize, Serial};
use getset::{CopyGetters, Getters};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Summary of a successful dump.
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct DumpOutcome {
    #[get = "pub"]
    path: PathBuf,
    /// Size of the final file
    #[get_copy = "pub"]
    bytes_written: u64,
    #[get_copy = "pub"]
    workers: usize,
    /// Instances and arrays written; classes are not counted
    #[get_copy = "pub"]
    objects: usize,
}

/// Writes heap dumps of `runtime` according to a [`DumpConfig`].
///
/// `dump` may be called repeatedly; with `overwrite` disabled each call needs a fresh path.
pub struct HeapDumper<'r, R: ?Sized> {
    runtime: &'r R,
    config: DumpConfig,
    pool: Option<&'r rayon::ThreadPool>,
}

impl<'r, R> HeapDumper<'r, R>
where
    R: HeapIntrospector + StackIntrospector + WorldPause + ?Sized,
{
    pub fn new(runtime: &'r R, config: DumpConfig) -> HeapDumper<'r, R> {
        HeapDumper {
            runtime,
            config,
            pool: None,
        }
    }

    /// Run workers on `pool` instead of the global rayon pool. The pool's size caps the number
    /// of workers.
    #[must_use]
    pub fn with_thread_pool(mut self, pool: &'r rayon::ThreadPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn config(&self) -> &DumpConfig {
        &self.config
    }

    fn worker_count(&self) -> usize {
        let available = self
            .pool
            .map(|p| p.current_num_threads())
            .unwrap_or_else(rayon::current_num_threads);
        self.config.parallelism().min(available).max(1)
    }

    pub fn dump(&self) -> Result<DumpOutcome> {
        let started_at = Instant::now();
        let path = self.config.path();
        let workers = self.worker_count();
        log::info!(
            "Dumping heap to {} with {} worker(s){}",
            path.display(),
            workers,
            self.config
                .compression_level()
                .map(|l| format!(", gzip level {}", l))
                .unwrap_or_default()
        );

        let compressor = self
            .config
            .compression_level()
            .map(|level| Arc::new(GzipCompressor::new(level)) as Arc<dyn Compressor>);
        let file = open_dump_file(path, self.config.overwrite())?;
        let writer = RecordWriter::new(
            file,
            self.runtime.id_size(),
            self.config.buffer_size(),
            compressor.clone(),
        );

        let session = DumpSession {
            runtime: self.runtime,
            config: &self.config,
            compressor,
            id_size: self.runtime.id_size(),
            global: Mutex::new(GlobalWriter {
                writer,
                class_serials: HashMap::new(),
            }),
            controller: DumperController::new(workers),
            serials: SerialAllocator::new(),
            next_ordinal: AtomicUsize::new(0),
            worker_count: workers,
            timestamp_millis: now_millis(),
        };

        let pause = self.runtime.stop_the_world();
        let dumped = if workers == 1 {
            session.dump_serial()
        } else {
            session.controller.set_phase(DumpPhase::Electing);
            let run_workers = || {
                rayon::scope(|s| {
                    for _ in 0..workers {
                        s.spawn(|_| session.work());
                    }
                })
            };
            match self.pool {
                Some(pool) => pool.install(run_workers),
                None => run_workers(),
            }
            session.controller.wait_all()
        };
        drop(pause);
        log::debug!("Heap walk finished in {:?}", started_at.elapsed());

        let mut guard = lock(&session.global);
        let writer = &mut guard.writer;
        let merged = if workers > 1 {
            session.controller.set_phase(DumpPhase::Merging);
            DumpMerger::new(path, session.controller.created_shards()).merge(writer)
        } else {
            heap_dump::write_heap_dump_end(writer);
            Ok(())
        };
        let finished = writer.finish();
        session.controller.set_phase(DumpPhase::Done);

        // worker errors come first: they usually explain a failed merge
        let objects = dumped?;
        merged?;
        let bytes_written = finished?;

        log::info!(
            "Heap dump of {} objects ({} bytes) written to {} in {:?}",
            objects,
            bytes_written,
            path.display(),
            started_at.elapsed()
        );

        Ok(DumpOutcome {
            path: path.to_path_buf(),
            bytes_written,
            workers,
            objects,
        })
    }
}

fn open_dump_file(path: &Path, overwrite: bool) -> Result<fs::File> {
    let mut options = fs::OpenOptions::new();
    options.write(true);
    if overwrite {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }
    options.open(path).map_err(|e| DumpError::from_open(e, path))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // a panicking worker takes the whole scope down anyway; the data is still consistent
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The output file's writer, and what the preamble learned that later traces need.
struct GlobalWriter {
    writer: RecordWriter<fs::File>,
    class_serials: HashMap<Id, Serial>,
}

/// Where traces of unmounted virtual threads go
enum TraceTarget<'a> {
    /// The output file, while workers write shards
    Shared(&'a Mutex<GlobalWriter>),
    /// The writer the heap walk itself uses
    Inline(&'a HashMap<Id, Serial>),
}

struct DumpSession<'s, R: ?Sized> {
    runtime: &'s R,
    config: &'s DumpConfig,
    compressor: Option<Arc<dyn Compressor>>,
    id_size: IdSize,
    global: Mutex<GlobalWriter>,
    controller: DumperController,
    serials: SerialAllocator,
    next_ordinal: AtomicUsize,
    worker_count: usize,
    timestamp_millis: u64,
}

impl<'s, R> DumpSession<'s, R>
where
    R: HeapIntrospector + StackIntrospector + ?Sized,
{
    /// Single worker: preamble, roots and heap all go to the output file.
    fn dump_serial(&self) -> Result<usize> {
        let mut guard = lock(&self.global);
        let GlobalWriter {
            writer,
            class_serials,
        } = &mut *guard;

        self.controller.set_phase(DumpPhase::Preamble);
        let threads = self.write_preamble(writer, class_serials);
        self.controller.set_phase(DumpPhase::HeapIterating);
        self.write_global_roots(writer, &threads);
        let objects = self.dump_partition(writer, 0, 1, TraceTarget::Inline(class_serials));
        self.controller.set_phase(DumpPhase::AllComplete);

        match writer.error() {
            Some(e) => Err(e.clone()),
            None => Ok(objects),
        }
    }

    /// Body of each parallel worker.
    fn work(&self) {
        let ordinal = self.next_ordinal.fetch_add(1, Ordering::SeqCst);
        let mut threads = Vec::new();

        if ordinal == 0 {
            let mut guard = lock(&self.global);
            // holding the lock; others may start and will block on it for virtual thread traces
            self.controller.signal_start();
            let GlobalWriter {
                writer,
                class_serials,
            } = &mut *guard;
            threads = self.write_preamble(writer, class_serials);
            self.controller.set_phase(DumpPhase::HeapIterating);
        } else {
            self.controller.wait_for_start_signal();
        }

        let result = self.dump_shard(ordinal, &threads);
        self.controller.dumper_complete(ordinal, result);
    }

    fn dump_shard(&self, ordinal: usize, threads: &[ThreadSnapshot]) -> Result<usize> {
        let path = merge::shard_path(self.config.path(), ordinal);
        let file = open_dump_file(&path, self.config.overwrite())?;
        self.controller.shard_created(ordinal);
        let mut writer = RecordWriter::new(
            file,
            self.id_size,
            self.config.buffer_size(),
            self.compressor.clone(),
        );

        if ordinal == 0 {
            self.write_global_roots(&mut writer, threads);
        }
        let objects = self.dump_partition(
            &mut writer,
            ordinal,
            self.worker_count,
            TraceTarget::Shared(&self.global),
        );
        let bytes = writer.finish()?;
        log::debug!(
            "Worker {} wrote {} objects ({} bytes) to {}",
            ordinal,
            objects,
            bytes,
            path.display()
        );

        Ok(objects)
    }

    /// Header, UTF8, LOAD_CLASS, the dummy trace, then frames and traces of platform threads.
    /// Returns the captured threads, whose roots are written with the heap.
    fn write_preamble<W: Write>(
        &self,
        writer: &mut RecordWriter<W>,
        class_serials: &mut HashMap<Id, Serial>,
    ) -> Vec<ThreadSnapshot> {
        let heap = self.runtime;
        heap_dump::write_file_header(writer, self.timestamp_millis);

        let mut symbols = 0;
        for symbol in heap.symbols() {
            heap_dump::write_utf8(writer, &symbol);
            symbols += 1;
        }

        for class in loaded_classes(heap) {
            let serial = class_serials.len() as Serial + 1;
            heap_dump::write_load_class(writer, serial, class);
            class_serials.insert(class.id, serial);
        }

        thread_dump::write_dummy_trace(writer);
        let threads = thread_dump::capture_platform_threads(
            self.runtime,
            self.config.out_of_memory().as_ref(),
            &self.serials,
        );
        for thread in threads.iter() {
            thread.dump_stack_traces(writer, heap, self.runtime, class_serials);
        }
        log::debug!(
            "Wrote {} symbols, {} classes and {} thread stacks",
            symbols,
            class_serials.len(),
            threads.len()
        );

        threads
    }

    /// Class dumps, thread roots, global handles and sticky classes.
    fn write_global_roots<W: Write>(&self, writer: &mut RecordWriter<W>, threads: &[ThreadSnapshot]) {
        let heap = self.runtime;
        let mut encoder = ObjectGraphEncoder::new(heap);
        for class in loaded_classes(heap) {
            encoder.dump_class(writer, class);
        }

        for thread in threads {
            thread.dump_thread_obj(writer);
            thread.dump_stack_refs(writer, heap);
        }

        for (obj, handle) in heap.jni_global_roots() {
            if obj.is_null() || heap.is_dormant(obj) {
                continue;
            }
            heap_dump::write_root_jni_global(writer, obj, handle);
        }

        for obj in heap.unknown_roots() {
            if obj.is_null() || heap.is_dormant(obj) {
                continue;
            }
            heap_dump::write_root_unknown(writer, obj);
        }

        for class in loaded_classes(heap) {
            if class.boot_loader && class.kind == ClassKind::Instance {
                heap_dump::write_root_sticky_class(writer, class.id);
            }
        }
    }

    /// Walks one heap partition. Returns the number of objects written.
    fn dump_partition<W: Write>(
        &self,
        writer: &mut RecordWriter<W>,
        partition: usize,
        partition_count: usize,
        traces: TraceTarget<'_>,
    ) -> usize {
        let heap = self.runtime;
        let mut encoder = ObjectGraphEncoder::new(heap);
        let mut objects = 0;

        for obj in heap.live_objects(partition, partition_count) {
            if writer.has_error() {
                break;
            }
            if heap.is_dormant(obj) {
                continue;
            }

            let unmounted = self
                .runtime
                .virtual_thread(obj)
                .filter(|v| !v.mounted && thread_dump::should_dump_virtual_thread(v));
            if unmounted.is_some() {
                self.dump_unmounted_virtual_thread(writer, obj, &traces);
            }

            if encoder.dump_object(writer, obj).is_some() {
                objects += 1;
            }
        }

        objects
    }

    fn dump_unmounted_virtual_thread<W: Write>(
        &self,
        writer: &mut RecordWriter<W>,
        vthread: Id,
        traces: &TraceTarget<'_>,
    ) {
        let heap = self.runtime;
        let snapshot = match *traces {
            TraceTarget::Shared(global) => {
                let mut guard = lock(global);
                let GlobalWriter {
                    writer: global_writer,
                    class_serials,
                } = &mut *guard;
                let snapshot = ThreadSnapshot::unmounted(self.runtime, vthread, &self.serials);
                snapshot.dump_stack_traces(global_writer, heap, self.runtime, class_serials);
                snapshot
            }
            TraceTarget::Inline(class_serials) => {
                let snapshot = ThreadSnapshot::unmounted(self.runtime, vthread, &self.serials);
                snapshot.dump_stack_traces(writer, heap, self.runtime, class_serials);
                snapshot
            }
        };

        snapshot.dump_thread_obj(writer);
        snapshot.dump_stack_refs(writer, heap);
    }
}

/// Loaded classes that have a mirror; the others cannot be described yet.
fn loaded_classes<'h, H: HeapIntrospector + ?Sized>(
    heap: &'h H,
) -> impl Iterator<Item = &'h ClassInfo> + 'h {
    heap.loaded_classes()
        .into_iter()
        .filter_map(move |id| heap.class(id))
        .filter(|class| class.mirror_resolved)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpPhase {
    NotStarted,
    Electing,
    Preamble,
    HeapIterating,
    AllComplete,
    Merging,
    Done,
}

#[derive(Debug)]
struct ControllerState {
    phase: DumpPhase,
    started: bool,
    complete: usize,
    objects: usize,
    error: Option<DumpError>,
    shards: Vec<usize>,
}

/// Rendezvous of the parallel workers: the leader signals once it holds the output writer, and
/// every worker reports its result exactly once.
#[derive(Debug)]
pub struct DumperController {
    expected: usize,
    state: Mutex<ControllerState>,
    changed: Condvar,
}

impl DumperController {
    pub fn new(expected: usize) -> DumperController {
        DumperController {
            expected,
            state: Mutex::new(ControllerState {
                phase: DumpPhase::NotStarted,
                started: false,
                complete: 0,
                objects: 0,
                error: None,
                shards: Vec::new(),
            }),
            changed: Condvar::new(),
        }
    }

    pub fn phase(&self) -> DumpPhase {
        lock(&self.state).phase
    }

    pub fn set_phase(&self, phase: DumpPhase) {
        log::debug!("Heap dump phase: {:?}", phase);
        lock(&self.state).phase = phase;
    }

    pub fn signal_start(&self) {
        let mut state = lock(&self.state);
        state.started = true;
        state.phase = DumpPhase::Preamble;
        self.changed.notify_all();
    }

    pub fn wait_for_start_signal(&self) {
        let mut state = lock(&self.state);
        while !state.started {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Only shards a worker created are merged and removed afterwards.
    pub fn shard_created(&self, ordinal: usize) {
        lock(&self.state).shards.push(ordinal);
    }

    pub fn created_shards(&self) -> Vec<usize> {
        lock(&self.state).shards.clone()
    }

    /// Records one worker's result; the first error wins.
    pub fn dumper_complete(&self, ordinal: usize, result: Result<usize>) {
        let mut state = lock(&self.state);
        match result {
            Ok(objects) => state.objects += objects,
            Err(e) => {
                log::warn!("Heap dump worker {} failed: {}", ordinal, e);
                state.error.get_or_insert(e);
            }
        }
        state.complete += 1;
        if state.complete == self.expected {
            state.phase = DumpPhase::AllComplete;
        }
        self.changed.notify_all();
    }

    /// Blocks until every worker has reported. Returns the total object count or the first
    /// worker error.
    pub fn wait_all(&self) -> Result<usize> {
        let mut state = lock(&self.state);
        while state.complete < self.expected {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }

        if let Some(e) = state.error.as_ref() {
            return Err(e.clone());
        }
        if state.complete != self.expected {
            return Err(DumpError::Incomplete {
                completed: state.complete,
                expected: self.expected,
            });
        }
        Ok(state.objects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem_heap::{FieldSpec, InMemoryHeap};
    use crate::introspect::FieldValue;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn controller_collects_results_and_first_error() {
        let controller = Arc::new(DumperController::new(3));
        assert_eq!(DumpPhase::NotStarted, controller.phase());

        let handles = (0..3)
            .map(|i| {
                let controller = Arc::clone(&controller);
                thread::spawn(move || {
                    if i == 0 {
                        controller.signal_start();
                        controller.dumper_complete(i, Ok(5));
                    } else {
                        controller.wait_for_start_signal();
                        let result = if i == 2 {
                            Err(DumpError::Internal("boom".to_string()))
                        } else {
                            Ok(7)
                        };
                        controller.dumper_complete(i, result);
                    }
                })
            })
            .collect::<Vec<_>>();

        let result = controller.wait_all();
        for h in handles {
            h.join().unwrap();
        }

        assert!(matches!(result, Err(DumpError::Internal(ref m)) if m == "boom"));
        assert_eq!(DumpPhase::AllComplete, controller.phase());
    }

    #[test]
    fn controller_sums_objects() {
        let controller = DumperController::new(2);
        controller.signal_start();
        controller.dumper_complete(0, Ok(3));
        controller.dumper_complete(1, Ok(4));

        assert_eq!(7, controller.wait_all().unwrap());
    }

    fn small_heap() -> InMemoryHeap {
        let mut heap = InMemoryHeap::new(IdSize::U64);
        let object = heap.object_class();
        let point = heap.define_class(
            "Point",
            Some(object),
            &[FieldSpec::instance("x", "I"), FieldSpec::instance("y", "I")],
        );
        for i in 0..20 {
            heap.new_instance(point, &[("x", FieldValue::Int(i)), ("y", FieldValue::Int(-i))]);
        }
        heap
    }

    #[test]
    fn serial_dump_counts_objects_and_releases_pause() {
        let dir = tempfile::tempdir().unwrap();
        let heap = small_heap();
        let config = DumpConfig::new(dir.path().join("heap.hprof")).with_parallelism(1);

        let outcome = HeapDumper::new(&heap, config).dump().unwrap();

        assert_eq!(1, outcome.workers());
        assert_eq!(heap.object_count(), outcome.objects());
        assert_eq!(
            fs::metadata(outcome.path()).unwrap().len(),
            outcome.bytes_written()
        );
        assert_eq!(1, heap.pause_count());
        assert!(!heap.is_paused());
    }

    #[test]
    fn workers_are_capped_by_pool_size() {
        let dir = tempfile::tempdir().unwrap();
        let heap = small_heap();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(2)
            .build()
            .unwrap();
        let config = DumpConfig::new(dir.path().join("heap.hprof")).with_parallelism(8);

        let outcome = HeapDumper::new(&heap, config)
            .with_thread_pool(&pool)
            .dump()
            .unwrap();

        assert_eq!(2, outcome.workers());
        assert_eq!(heap.object_count(), outcome.objects());
        assert!(!merge::shard_path(outcome.path(), 0).exists());
        assert!(!merge::shard_path(outcome.path(), 1).exists());
    }

    #[test]
    fn existing_file_is_not_replaced_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heap.hprof");
        fs::write(&path, b"keep me").unwrap();
        let heap = small_heap();

        let result = HeapDumper::new(&heap, DumpConfig::new(&path)).dump();

        assert!(matches!(result, Err(DumpError::FileExists(ref p)) if p == &path));
        assert_eq!(b"keep me".to_vec(), fs::read(&path).unwrap());
        assert_eq!(0, heap.pause_count());
    }
}
