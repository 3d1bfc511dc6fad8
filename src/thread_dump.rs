//! Thread stacks: FRAME and TRACE records, plus the roots found on each stack.
//!
//! A platform thread running a mounted virtual thread yields two snapshots: the virtual thread
//! gets the frames above the continuation entry, the carrier the frames below it.

use crate::config::OutOfMemoryContext;
use crate::introspect::{
    Frame, HeapIntrospector, MethodInfo, PlatformThread, StackIntrospector, VirtualThread,
    VirtualThreadState,
};
use crate::writer::RecordWriter;
use crate::{Id, LineNum, RecordTag, Serial, SubRecordTag, STACK_TRACE_ID};
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};

/// Frame number written for native handles of a thread with no managed frames
pub const NO_FRAME: u32 = u32::MAX;

pub fn should_dump_platform_thread(thread: &PlatformThread) -> bool {
    thread.thread_obj.is_some() && !thread.exiting && !thread.hidden
}

/// Started and not yet terminated
pub fn should_dump_virtual_thread(vthread: &VirtualThread) -> bool {
    vthread.state != VirtualThreadState::New && vthread.state != VirtualThreadState::Terminated
}

/// Hands out thread serials and blocks of frame serials. Shared by all workers, since
/// unmounted virtual threads are found during the heap walk.
#[derive(Debug)]
pub struct SerialAllocator {
    next_thread: AtomicU32,
    next_frame: AtomicU32,
}

impl SerialAllocator {
    pub fn new() -> SerialAllocator {
        SerialAllocator {
            next_thread: AtomicU32::new(1),
            next_frame: AtomicU32::new(1),
        }
    }

    fn assign(&self, snapshot: &mut ThreadSnapshot) {
        snapshot.thread_serial = self.next_thread.fetch_add(1, Ordering::SeqCst);
        snapshot.frame_serials = snapshot.frame_count();
        snapshot.start_frame_serial = self
            .next_frame
            .fetch_add(snapshot.frame_serials, Ordering::SeqCst);
    }
}

impl Default for SerialAllocator {
    fn default() -> Self {
        SerialAllocator::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadKind {
    Platform,
    MountedVirtual,
    UnmountedVirtual,
}

/// One thread's stack, captured during the pause and serialized right away.
#[derive(Debug, Clone)]
pub struct ThreadSnapshot {
    kind: ThreadKind,
    thread_obj: Id,
    /// Innermost first; Entry frames are kept for their handles
    frames: Vec<Frame>,
    /// The thread's active native handles, if this snapshot holds its innermost frame
    active_handles: Option<Vec<Id>>,
    /// False for a platform thread that never entered managed code
    has_managed_frames: bool,
    oome_constructor: Option<MethodInfo>,
    thread_serial: Serial,
    start_frame_serial: Serial,
    /// Size of the frame serial block reserved at `start_frame_serial`
    frame_serials: u32,
}

fn is_managed(frame: &Frame) -> bool {
    matches!(frame, Frame::Java { .. } | Frame::Native { .. })
}

impl ThreadSnapshot {
    fn new(kind: ThreadKind, thread_obj: Id, frames: Vec<Frame>) -> ThreadSnapshot {
        let has_managed_frames = frames.iter().any(is_managed);
        ThreadSnapshot {
            kind,
            thread_obj,
            frames,
            active_handles: None,
            has_managed_frames,
            oome_constructor: None,
            thread_serial: 0,
            start_frame_serial: 0,
            frame_serials: 0,
        }
    }

    /// Snapshot of a virtual thread that is not mounted on any carrier; its frames come from
    /// its continuation.
    pub fn unmounted<S: StackIntrospector + ?Sized>(
        stacks: &S,
        vthread: Id,
        serials: &SerialAllocator,
    ) -> ThreadSnapshot {
        let mut snapshot = ThreadSnapshot::new(
            ThreadKind::UnmountedVirtual,
            vthread,
            stacks.unmounted_frames(vthread),
        );
        serials.assign(&mut snapshot);
        snapshot
    }

    pub fn kind(&self) -> ThreadKind {
        self.kind
    }

    pub fn thread_obj(&self) -> Id {
        self.thread_obj
    }

    pub fn thread_serial(&self) -> Serial {
        self.thread_serial
    }

    pub fn stack_trace_serial(&self) -> Serial {
        self.thread_serial + STACK_TRACE_ID
    }

    /// Managed frames, plus the synthetic allocation failure frame if there is one
    pub fn frame_count(&self) -> u32 {
        self.frames.iter().filter(|f| is_managed(f)).count() as u32
            + self.oome_constructor.is_some() as u32
    }

    /// FRAME records for every frame, then the TRACE record listing them.
    pub fn dump_stack_traces<W, H, S>(
        &self,
        writer: &mut RecordWriter<W>,
        heap: &H,
        stacks: &S,
        class_serials: &HashMap<Id, Serial>,
    ) where
        W: Write,
        H: HeapIntrospector + ?Sized,
        S: StackIntrospector + ?Sized,
    {
        let mut frame_serial = self.start_frame_serial;
        let mut depth = 0;

        if let Some(constructor) = self.oome_constructor.as_ref() {
            frame_serial += 1;
            let line = stacks.line_number(constructor, 0);
            write_stack_frame(writer, heap, class_serials, frame_serial, constructor, line);
            depth += 1;
        }

        for frame in self.frames.iter() {
            let (method, line) = match frame {
                Frame::Java { method, .. } if method.is_native => (method, LineNum::NativeMethod),
                Frame::Java { method, bci, .. } => (method, stacks.line_number(method, *bci)),
                Frame::Native { method } => (method, LineNum::NativeMethod),
                Frame::Entry { .. } | Frame::ContinuationEntry => continue,
            };
            frame_serial += 1;
            write_stack_frame(writer, heap, class_serials, frame_serial, method, line);
            depth += 1;
        }
        debug_assert_eq!(self.frame_serials, depth, "frame count mismatch");

        let id_len = writer.id_size().size_in_bytes() as u32;
        writer.write_header(RecordTag::StackTrace, 3 * 4 + depth * id_len);
        writer.write_u4(self.stack_trace_serial());
        writer.write_u4(self.thread_serial);
        writer.write_u4(depth);
        for j in 1..=depth {
            writer.write_id(Id::from(u64::from(self.start_frame_serial + j)));
        }
    }

    pub fn dump_thread_obj<W: Write>(&self, writer: &mut RecordWriter<W>) {
        let id_len = writer.id_size().size_in_bytes() as u32;
        writer.start_sub_record(SubRecordTag::RootThreadObj, 1 + id_len + 4 + 4);
        writer.write_object_id(self.thread_obj);
        writer.write_u4(self.thread_serial);
        writer.write_u4(self.stack_trace_serial());
        writer.end_sub_record();
    }

    /// Roots for references held in frames and native handles, tied to the frame number of the
    /// TRACE record.
    pub fn dump_stack_refs<W, H>(&self, writer: &mut RecordWriter<W>, heap: &H)
    where
        W: Write,
        H: HeapIntrospector + ?Sized,
    {
        let mut roots = StackRootWriter {
            writer,
            heap,
            thread_serial: self.thread_serial,
        };

        if self.kind == ThreadKind::Platform && !self.has_managed_frames {
            // native code that never called into managed code may still hold handles
            if let Some(handles) = self.active_handles.as_ref() {
                roots.write_all(SubRecordTag::RootJniLocal, handles, NO_FRAME);
            }
            return;
        }

        let mut depth = self.oome_constructor.is_some() as u32;
        let mut is_top_frame = true;
        let mut last_entry: Option<&Vec<Id>> = None;

        for frame in self.frames.iter() {
            match frame {
                Frame::Java {
                    locals,
                    expressions,
                    ..
                } => {
                    roots.write_all(SubRecordTag::RootJavaFrame, locals, depth);
                    roots.write_all(SubRecordTag::RootJavaFrame, expressions, depth);
                    last_entry = None;
                    depth += 1;
                }
                Frame::Native { .. } => {
                    let handles = if is_top_frame {
                        self.active_handles.as_ref()
                    } else {
                        last_entry
                    };
                    if let Some(handles) = handles {
                        roots.write_all(SubRecordTag::RootJniLocal, handles, depth);
                    }
                    last_entry = None;
                    depth += 1;
                }
                Frame::Entry { handles } => last_entry = Some(handles),
                Frame::ContinuationEntry => {}
            }
            is_top_frame = false;
        }
        debug_assert_eq!(self.frame_serials, depth, "frame count mismatch");
    }
}

struct StackRootWriter<'w, 'h, W: Write, H: HeapIntrospector + ?Sized> {
    writer: &'w mut RecordWriter<W>,
    heap: &'h H,
    thread_serial: Serial,
}

impl<'w, 'h, W: Write, H: HeapIntrospector + ?Sized> StackRootWriter<'w, 'h, W, H> {
    /// Null and dormant references are not roots
    fn write_all(&mut self, tag: SubRecordTag, objects: &[Id], frame: u32) {
        let id_len = self.writer.id_size().size_in_bytes() as u32;
        for obj in objects {
            if obj.is_null() || self.heap.is_dormant(*obj) {
                continue;
            }
            self.writer.start_sub_record(tag, 1 + id_len + 4 + 4);
            self.writer.write_object_id(*obj);
            self.writer.write_u4(self.thread_serial);
            self.writer.write_u4(frame);
            self.writer.end_sub_record();
        }
    }
}

fn write_stack_frame<W, H>(
    writer: &mut RecordWriter<W>,
    heap: &H,
    class_serials: &HashMap<Id, Serial>,
    frame_serial: Serial,
    method: &MethodInfo,
    line: LineNum,
) where
    W: Write,
    H: HeapIntrospector + ?Sized,
{
    let source_file = heap
        .class(method.holder)
        .and_then(|c| c.source_file)
        .unwrap_or(Id::NULL);
    let class_serial = class_serials.get(&method.holder).copied().unwrap_or(0);

    let id_len = writer.id_size().size_in_bytes() as u32;
    writer.write_header(RecordTag::StackFrame, 4 * id_len + 2 * 4);
    writer.write_id(Id::from(u64::from(frame_serial)));
    writer.write_symbol_id(method.name);
    writer.write_symbol_id(method.signature);
    writer.write_symbol_id(source_file);
    writer.write_u4(class_serial);
    writer.write_u4(line.as_raw() as u32);
}

/// The frameless trace that every class and object sub-record refers to
pub fn write_dummy_trace<W: Write>(writer: &mut RecordWriter<W>) {
    writer.write_header(RecordTag::StackTrace, 3 * 4);
    writer.write_u4(STACK_TRACE_ID);
    // thread serial, frame count
    writer.write_u4(0);
    writer.write_u4(0);
}

/// Snapshots of every eligible platform thread, and of the virtual thread each one has
/// mounted, in the order their traces are written: a mounted virtual thread comes right before
/// its carrier.
pub fn capture_platform_threads<S: StackIntrospector + ?Sized>(
    stacks: &S,
    out_of_memory: Option<&OutOfMemoryContext>,
    serials: &SerialAllocator,
) -> Vec<ThreadSnapshot> {
    let mut snapshots = Vec::new();

    for thread in stacks.platform_threads() {
        let thread_obj = match thread.thread_obj {
            Some(obj) if should_dump_platform_thread(&thread) => obj,
            _ => continue,
        };
        let mut oome = out_of_memory
            .filter(|ctx| ctx.thread == thread_obj)
            .map(|ctx| ctx.constructor);

        let PlatformThread {
            frames,
            active_handles,
            mounted_virtual_thread,
            ..
        } = thread;

        let has_managed_frames = frames.iter().any(is_managed);
        let (carrier_frames, top_handles) = match mounted_virtual_thread {
            Some(vthread) => {
                let split = frames
                    .iter()
                    .position(|f| *f == Frame::ContinuationEntry)
                    .unwrap_or(frames.len());
                let mut virtual_frames = frames;
                let carrier_frames = virtual_frames.split_off(split);

                let eligible = stacks
                    .virtual_thread(vthread)
                    .map(|v| should_dump_virtual_thread(&v))
                    .unwrap_or(false);
                if eligible {
                    let mut snapshot =
                        ThreadSnapshot::new(ThreadKind::MountedVirtual, vthread, virtual_frames);
                    snapshot.active_handles = Some(active_handles);
                    // the failing allocation happened in the virtual thread
                    snapshot.oome_constructor = oome.take();
                    serials.assign(&mut snapshot);
                    snapshots.push(snapshot);
                }
                (carrier_frames, None)
            }
            None => (frames, Some(active_handles)),
        };

        let mut snapshot = ThreadSnapshot::new(ThreadKind::Platform, thread_obj, carrier_frames);
        snapshot.has_managed_frames = has_managed_frames;
        snapshot.active_handles = top_handles;
        snapshot.oome_constructor = oome;
        serials.assign(&mut snapshot);
        snapshots.push(snapshot);
    }

    snapshots
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem_heap::InMemoryHeap;
    use crate::read::{self, SubRecord};
    use crate::IdSize;

    fn thread(frames: Vec<Frame>, handles: Vec<Id>) -> PlatformThread {
        PlatformThread {
            thread_obj: None,
            exiting: false,
            hidden: false,
            frames,
            active_handles: handles,
            mounted_virtual_thread: None,
        }
    }

    fn java_frame(method: MethodInfo, bci: u32, locals: Vec<Id>) -> Frame {
        Frame::Java {
            method,
            bci,
            locals,
            expressions: vec![],
        }
    }

    fn roots(snapshot: &ThreadSnapshot, heap: &InMemoryHeap) -> Vec<(SubRecordTag, Id, Option<u32>)> {
        let mut writer = RecordWriter::new(Vec::new(), heap.id_size(), 4096, None);
        snapshot.dump_stack_refs(&mut writer, heap);
        let bytes = writer.into_inner();
        if bytes.is_empty() {
            return vec![];
        }

        read::parse_sub_records(&bytes[9..], heap.id_size())
            .map(|r| match r.unwrap() {
                SubRecord::RootJavaFrame {
                    obj_id,
                    frame_index,
                    ..
                } => (SubRecordTag::RootJavaFrame, obj_id, frame_index),
                SubRecord::RootJniLocal {
                    obj_id,
                    frame_index,
                    ..
                } => (SubRecordTag::RootJniLocal, obj_id, frame_index),
                other => panic!("unexpected {:?}", other),
            })
            .collect()
    }

    #[test]
    fn eligibility() {
        let mut t = thread(vec![], vec![]);
        assert!(!should_dump_platform_thread(&t));
        t.thread_obj = Some(Id::new(0x100));
        assert!(should_dump_platform_thread(&t));
        t.hidden = true;
        assert!(!should_dump_platform_thread(&t));

        let v = |state| VirtualThread {
            state,
            mounted: false,
        };
        assert!(!should_dump_virtual_thread(&v(VirtualThreadState::New)));
        assert!(should_dump_virtual_thread(&v(VirtualThreadState::Started)));
        assert!(!should_dump_virtual_thread(&v(VirtualThreadState::Terminated)));
    }

    #[test]
    fn serials_are_allocated_in_blocks() {
        let mut heap = InMemoryHeap::new(IdSize::U32);
        let object = heap.object_class();
        let run = heap.method(object, "run", "()V", false);
        for frame_count in &[2, 3] {
            let obj = heap.new_thread_object();
            let mut t = thread(vec![java_frame(run, 0, vec![]); *frame_count], vec![]);
            t.thread_obj = Some(obj);
            heap.add_platform_thread(t);
        }

        let serials = SerialAllocator::new();
        let snapshots = capture_platform_threads(&heap, None, &serials);

        assert_eq!(
            vec![(1, 2, 1), (2, 3, 3)],
            snapshots
                .iter()
                .map(|s| (s.thread_serial(), s.stack_trace_serial(), s.start_frame_serial))
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn native_handles_of_entry_frame_go_to_next_native_frame() {
        let mut heap = InMemoryHeap::new(IdSize::U32);
        let object = heap.object_class();
        let a = heap.new_instance(object, &[]);
        let b = heap.new_instance(object, &[]);
        let c = heap.new_instance(object, &[]);
        let top = heap.new_instance(object, &[]);
        let java = heap.method(object, "work", "()V", false);
        let native = heap.method(object, "call", "()V", true);

        let obj = heap.new_thread_object();
        let mut t = thread(
            vec![
                Frame::Native { method: native },
                java_frame(java, 3, vec![a, Id::NULL]),
                Frame::Entry { handles: vec![b] },
                Frame::Native { method: native },
                Frame::Entry { handles: vec![c] },
                java_frame(java, 1, vec![]),
            ],
            vec![top],
        );
        t.thread_obj = Some(obj);
        heap.add_platform_thread(t);

        let snapshots = capture_platform_threads(&heap, None, &SerialAllocator::new());
        assert_eq!(4, snapshots[0].frame_count());
        assert_eq!(
            vec![
                (SubRecordTag::RootJniLocal, top, Some(0)),
                (SubRecordTag::RootJavaFrame, a, Some(1)),
                (SubRecordTag::RootJniLocal, b, Some(2)),
            ],
            roots(&snapshots[0], &heap)
        );
    }

    #[test]
    fn thread_without_managed_frames_roots_handles_at_no_frame() {
        let mut heap = InMemoryHeap::new(IdSize::U64);
        let object = heap.object_class();
        let handle = heap.new_instance(object, &[]);
        let obj = heap.new_thread_object();
        let mut t = thread(vec![], vec![handle]);
        t.thread_obj = Some(obj);
        heap.add_platform_thread(t);

        let snapshots = capture_platform_threads(&heap, None, &SerialAllocator::new());

        assert_eq!(0, snapshots[0].frame_count());
        assert_eq!(
            vec![(SubRecordTag::RootJniLocal, handle, None)],
            roots(&snapshots[0], &heap)
        );
    }

    #[test]
    fn mounted_virtual_thread_is_split_from_its_carrier() {
        let mut heap = InMemoryHeap::new(IdSize::U32);
        let object = heap.object_class();
        let local = heap.new_instance(object, &[]);
        let carrier_local = heap.new_instance(object, &[]);
        let m = heap.method(object, "m", "()V", false);
        let vthread = heap.new_virtual_thread(VirtualThreadState::Started, true, vec![]);
        let carrier = heap.new_thread_object();
        heap.add_platform_thread(PlatformThread {
            thread_obj: Some(carrier),
            exiting: false,
            hidden: false,
            frames: vec![
                java_frame(m, 0, vec![local]),
                java_frame(m, 1, vec![]),
                Frame::ContinuationEntry,
                java_frame(m, 2, vec![carrier_local]),
            ],
            active_handles: vec![],
            mounted_virtual_thread: Some(vthread),
        });

        let snapshots = capture_platform_threads(&heap, None, &SerialAllocator::new());

        assert_eq!(2, snapshots.len());
        assert_eq!(ThreadKind::MountedVirtual, snapshots[0].kind());
        assert_eq!(vthread, snapshots[0].thread_obj());
        assert_eq!(2, snapshots[0].frame_count());
        assert_eq!(ThreadKind::Platform, snapshots[1].kind());
        assert_eq!(1, snapshots[1].frame_count());
        assert_eq!(
            vec![(SubRecordTag::RootJavaFrame, carrier_local, Some(0))],
            roots(&snapshots[1], &heap)
        );
    }

    #[test]
    fn out_of_memory_frame_comes_first() {
        let mut heap = InMemoryHeap::new(IdSize::U32);
        let object = heap.object_class();
        let local = heap.new_instance(object, &[]);
        let oome_class = heap.define_class("java/lang/OutOfMemoryError", Some(object), &[]);
        heap.set_source_file(oome_class, "OutOfMemoryError.java");
        let constructor = heap.method(oome_class, "<init>", "()V", false);
        heap.set_line_number(&constructor, 0, LineNum::Normal(48));
        let run = heap.method(object, "run", "()V", false);
        let obj = heap.new_thread_object();
        let mut t = thread(vec![java_frame(run, 5, vec![local])], vec![]);
        t.thread_obj = Some(obj);
        heap.add_platform_thread(t);
        let ctx = OutOfMemoryContext {
            thread: obj,
            constructor,
        };

        let snapshots = capture_platform_threads(&heap, Some(&ctx), &SerialAllocator::new());
        let snapshot = &snapshots[0];
        assert_eq!(2, snapshot.frame_count());
        assert_eq!(
            vec![(SubRecordTag::RootJavaFrame, local, Some(1))],
            roots(snapshot, &heap)
        );

        let mut class_serials = HashMap::new();
        class_serials.insert(oome_class, 7);
        let mut writer = RecordWriter::new(Vec::new(), IdSize::U32, 4096, None);
        snapshot.dump_stack_traces(&mut writer, &heap, &heap, &class_serials);
        let bytes = writer.into_inner();
        let records = read::parse_records(&bytes, IdSize::U32)
            .map(|r| r.unwrap())
            .collect::<Vec<_>>();

        assert_eq!(3, records.len());
        let first = records[0].as_stack_frame().unwrap().unwrap();
        assert_eq!(constructor.name, first.method_name_id());
        assert_eq!(Some(heap.symbol("OutOfMemoryError.java")), first.source_file_name_id());
        assert_eq!(7, first.class_serial());
        assert_eq!(LineNum::Normal(48), first.line_num());
        let second = records[1].as_stack_frame().unwrap().unwrap();
        assert_eq!(0, second.class_serial());
        assert_eq!(None, second.source_file_name_id());

        let trace = records[2].as_stack_trace().unwrap().unwrap();
        assert_eq!(snapshot.stack_trace_serial(), trace.stack_trace_serial());
        assert_eq!(
            vec![first.id(), second.id()],
            trace.frame_ids().map(|r| r.unwrap()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn native_frames_report_native_line() {
        let mut heap = InMemoryHeap::new(IdSize::U32);
        let object = heap.object_class();
        let native = heap.method(object, "hashCode", "()I", true);
        let obj = heap.new_thread_object();
        let mut t = thread(vec![Frame::Native { method: native }], vec![]);
        t.thread_obj = Some(obj);
        heap.add_platform_thread(t);

        let snapshots = capture_platform_threads(&heap, None, &SerialAllocator::new());
        let mut writer = RecordWriter::new(Vec::new(), IdSize::U32, 4096, None);
        snapshots[0].dump_stack_traces(&mut writer, &heap, &heap, &HashMap::new());
        let bytes = writer.into_inner();
        let frame = read::parse_records(&bytes, IdSize::U32)
            .next()
            .unwrap()
            .unwrap()
            .as_stack_frame()
            .unwrap()
            .unwrap();

        assert_eq!(LineNum::NativeMethod, frame.line_num());
    }

    #[test]
    fn native_frame_line_follows_the_frame_not_the_method() {
        let mut heap = InMemoryHeap::new(IdSize::U32);
        let object = heap.object_class();
        let intrinsic = heap.method(object, "arraycopy", "()V", false);
        heap.set_line_number(&intrinsic, 0, LineNum::Normal(12));
        let obj = heap.new_thread_object();
        let mut t = thread(vec![Frame::Native { method: intrinsic }], vec![]);
        t.thread_obj = Some(obj);
        heap.add_platform_thread(t);

        let snapshots = capture_platform_threads(&heap, None, &SerialAllocator::new());
        let mut writer = RecordWriter::new(Vec::new(), IdSize::U32, 4096, None);
        snapshots[0].dump_stack_traces(&mut writer, &heap, &heap, &HashMap::new());
        let bytes = writer.into_inner();
        let frame = read::parse_records(&bytes, IdSize::U32)
            .next()
            .unwrap()
            .unwrap()
            .as_stack_frame()
            .unwrap()
            .unwrap();

        assert_eq!(LineNum::NativeMethod, frame.line_num());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "frame count mismatch")]
    fn frames_beyond_the_reserved_serials_panic_in_debug() {
        let mut heap = InMemoryHeap::new(IdSize::U32);
        let object = heap.object_class();
        let run = heap.method(object, "run", "()V", false);
        let obj = heap.new_thread_object();
        let mut t = thread(vec![java_frame(run, 0, vec![])], vec![]);
        t.thread_obj = Some(obj);
        heap.add_platform_thread(t);

        let mut snapshots = capture_platform_threads(&heap, None, &SerialAllocator::new());
        snapshots[0].frames.push(java_frame(run, 1, vec![]));

        let mut writer = RecordWriter::new(Vec::new(), IdSize::U32, 4096, None);
        snapshots[0].dump_stack_traces(&mut writer, &heap, &heap, &HashMap::new());
    }
}
