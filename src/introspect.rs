//! What the dumper needs from the runtime it is dumping.
//!
//! A production runtime implements these traits over its real object model and thread list;
//! [`crate::mem_heap::InMemoryHeap`] implements them over a hand-built object graph. All calls
//! happen while a [`PauseToken`] is held, so implementations may assume nothing mutates.

use crate::{FieldType, Id, IdSize, LineNum};
use std::borrow::Cow;

/// An interned UTF-8 name
#[derive(Debug, Clone, Copy)]
pub struct Symbol<'a> {
    pub id: Id,
    pub text: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    pub name: Id,
    /// First byte of the field's type signature, e.g. `b'I'` or `b'L'`
    pub signature: u8,
    /// Where the runtime keeps the value; only meaningful to the introspector
    pub offset: u32,
    pub is_static: bool,
}

impl FieldInfo {
    pub fn field_type(&self) -> Option<FieldType> {
        FieldType::from_signature(self.signature)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    Instance,
    ObjectArray,
    PrimitiveArray(FieldType),
}

#[derive(Debug, Clone)]
pub struct ClassInfo {
    pub id: Id,
    pub name: Id,
    /// `java/lang/Object` for array classes
    pub super_class: Option<Id>,
    pub loader: Option<Id>,
    pub signers: Option<Id>,
    pub protection_domain: Option<Id>,
    pub kind: ClassKind,
    /// Declared fields of this class only, static and instance, in declaration order
    pub fields: Vec<FieldInfo>,
    pub source_file: Option<Id>,
    /// Resolved constant pool reference arrays: the current class version first, then any
    /// previous versions still referenced after redefinition.
    pub resolved_references: Vec<Id>,
    /// Defined by the boot loader, so it can never be unloaded
    pub boot_loader: bool,
    /// False for classes whose runtime mirror does not exist yet; their instances are dormant.
    pub mirror_resolved: bool,
}

/// One live heap object, classified once by the introspector.
#[derive(Debug, Clone)]
pub enum HeapObject<'h> {
    Instance { class: Id },
    ObjectArray { class: Id, elements: Cow<'h, [Id]> },
    PrimitiveArray { values: PrimitiveValues<'h> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum PrimitiveValues<'h> {
    Boolean(Cow<'h, [bool]>),
    Char(Cow<'h, [u16]>),
    Float(Cow<'h, [f32]>),
    Double(Cow<'h, [f64]>),
    Byte(Cow<'h, [i8]>),
    Short(Cow<'h, [i16]>),
    Int(Cow<'h, [i32]>),
    Long(Cow<'h, [i64]>),
}

impl<'h> PrimitiveValues<'h> {
    pub fn element_type(&self) -> FieldType {
        match self {
            PrimitiveValues::Boolean(_) => FieldType::Boolean,
            PrimitiveValues::Char(_) => FieldType::Char,
            PrimitiveValues::Float(_) => FieldType::Float,
            PrimitiveValues::Double(_) => FieldType::Double,
            PrimitiveValues::Byte(_) => FieldType::Byte,
            PrimitiveValues::Short(_) => FieldType::Short,
            PrimitiveValues::Int(_) => FieldType::Int,
            PrimitiveValues::Long(_) => FieldType::Long,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            PrimitiveValues::Boolean(v) => v.len(),
            PrimitiveValues::Char(v) => v.len(),
            PrimitiveValues::Float(v) => v.len(),
            PrimitiveValues::Double(v) => v.len(),
            PrimitiveValues::Byte(v) => v.len(),
            PrimitiveValues::Short(v) => v.len(),
            PrimitiveValues::Int(v) => v.len(),
            PrimitiveValues::Long(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    Object(Id),
    Boolean(bool),
    Char(u16),
    Float(f32),
    Double(f64),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
}

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Object(_) => FieldType::Object,
            FieldValue::Boolean(_) => FieldType::Boolean,
            FieldValue::Char(_) => FieldType::Char,
            FieldValue::Float(_) => FieldType::Float,
            FieldValue::Double(_) => FieldType::Double,
            FieldValue::Byte(_) => FieldType::Byte,
            FieldValue::Short(_) => FieldType::Short,
            FieldValue::Int(_) => FieldType::Int,
            FieldValue::Long(_) => FieldType::Long,
        }
    }

    /// The zero value of `field_type`
    pub fn default_for(field_type: FieldType) -> FieldValue {
        match field_type {
            FieldType::Object => FieldValue::Object(Id::NULL),
            FieldType::Boolean => FieldValue::Boolean(false),
            FieldType::Char => FieldValue::Char(0),
            FieldType::Float => FieldValue::Float(0.0),
            FieldType::Double => FieldValue::Double(0.0),
            FieldType::Byte => FieldValue::Byte(0),
            FieldType::Short => FieldValue::Short(0),
            FieldType::Int => FieldValue::Int(0),
            FieldType::Long => FieldValue::Long(0),
        }
    }
}

/// Object model and heap iteration.
pub trait HeapIntrospector: Sync {
    /// Width of object, class and symbol ids for the whole dump
    fn id_size(&self) -> IdSize;

    fn symbols(&self) -> Box<dyn Iterator<Item = Symbol<'_>> + '_>;

    /// Symbol naming the synthetic static fields that hold resolved constant pool references
    fn resolved_references_name(&self) -> Id;

    fn loaded_classes(&self) -> Vec<Id>;

    fn class(&self, class: Id) -> Option<&ClassInfo>;

    /// Partition `partition` of `partition_count` disjoint partitions of the live heap.
    /// Class objects are not included; classes are dumped from `loaded_classes`.
    fn live_objects(
        &self,
        partition: usize,
        partition_count: usize,
    ) -> Box<dyn Iterator<Item = Id> + '_>;

    fn object(&self, obj: Id) -> Option<HeapObject<'_>>;

    /// The instance field of `obj` stored at `offset`
    fn field_value(&self, obj: Id, offset: u32, field_type: FieldType) -> FieldValue;

    fn static_field_value(&self, class: Id, field: &FieldInfo) -> FieldValue;

    /// An object is dormant when its class has no resolved mirror yet; it must not appear in
    /// the dump, and references to it are written as null.
    fn is_dormant(&self, obj: Id) -> bool {
        self.object(obj)
            .and_then(|o| match o {
                HeapObject::Instance { class } | HeapObject::ObjectArray { class, .. } => {
                    self.class(class)
                }
                HeapObject::PrimitiveArray { .. } => None,
            })
            .map(|c| !c.mirror_resolved)
            .unwrap_or(false)
    }

    /// (object, handle) pairs for global native handles
    fn jni_global_roots(&self) -> Vec<(Id, Id)>;

    /// Other runtime-global roots without a more specific kind
    fn unknown_roots(&self) -> Vec<Id>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodInfo {
    pub name: Id,
    pub signature: Id,
    /// Declaring class
    pub holder: Id,
    pub is_native: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A managed frame; `locals` and `expressions` are the reference-typed slots (null allowed)
    Java {
        method: MethodInfo,
        bci: u32,
        locals: Vec<Id>,
        expressions: Vec<Id>,
    },
    /// A managed frame of a native method
    Native { method: MethodInfo },
    /// Native-to-managed transition, holding the native handles of the call it made
    Entry { handles: Vec<Id> },
    /// Where a mounted virtual thread's frames end and its carrier's begin
    ContinuationEntry,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlatformThread {
    pub thread_obj: Option<Id>,
    pub exiting: bool,
    pub hidden: bool,
    /// Innermost frame first; empty when the thread has no managed frames
    pub frames: Vec<Frame>,
    /// Native handles of the innermost native call
    pub active_handles: Vec<Id>,
    pub mounted_virtual_thread: Option<Id>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualThreadState {
    New,
    Started,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualThread {
    pub state: VirtualThreadState,
    pub mounted: bool,
}

/// Thread and stack inspection.
pub trait StackIntrospector: Sync {
    fn platform_threads(&self) -> Vec<PlatformThread>;

    /// Some if `obj` is a virtual thread object
    fn virtual_thread(&self, obj: Id) -> Option<VirtualThread>;

    /// Frames saved in an unmounted virtual thread's continuation, innermost first
    fn unmounted_frames(&self, vthread: Id) -> Vec<Frame>;

    fn line_number(&self, method: &MethodInfo, bci: u32) -> LineNum;
}

/// Proof that the runtime is stopped. Dropping it resumes the world.
pub struct PauseToken<'a> {
    release: Option<Box<dyn FnOnce() + 'a>>,
}

impl<'a> PauseToken<'a> {
    pub fn new<F: FnOnce() + 'a>(release: F) -> PauseToken<'a> {
        PauseToken {
            release: Some(Box::new(release)),
        }
    }
}

impl<'a> Drop for PauseToken<'a> {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

pub trait WorldPause {
    fn stop_the_world(&self) -> PauseToken<'_>;
}
