//! An object graph built by hand, implementing the introspection traits.
//!
//! Used by the tests and the demo; also a reference for what a runtime binding must provide.

use crate::introspect::{
    ClassInfo, ClassKind, FieldInfo, FieldValue, Frame, HeapIntrospector, HeapObject,
    MethodInfo, PauseToken, PlatformThread, PrimitiveValues, StackIntrospector, Symbol,
    VirtualThread, VirtualThreadState, WorldPause,
};
use crate::{FieldType, Id, IdSize, LineNum};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

const FIRST_ID: u64 = 0x1000;
const ID_STEP: u64 = 0x10;

/// Name of the synthetic static fields holding resolved constant pool references
pub const RESOLVED_REFERENCES_NAME: &str = "<resolved_references>";

/// A field to declare with `InMemoryHeap::define_class`
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    /// A JVM type signature such as `I` or `Ljava/lang/String;`
    pub signature: String,
    pub is_static: bool,
}

impl FieldSpec {
    pub fn instance(name: &str, signature: &str) -> FieldSpec {
        FieldSpec {
            name: name.to_string(),
            signature: signature.to_string(),
            is_static: false,
        }
    }

    pub fn static_field(name: &str, signature: &str) -> FieldSpec {
        FieldSpec {
            name: name.to_string(),
            signature: signature.to_string(),
            is_static: true,
        }
    }
}

enum StoredObject {
    Instance {
        class: Id,
        fields: HashMap<u32, FieldValue>,
    },
    ObjectArray {
        class: Id,
        elements: Vec<Id>,
    },
    PrimitiveArray(PrimitiveValues<'static>),
}

struct StoredVirtualThread {
    thread: VirtualThread,
    frames: Vec<Frame>,
}

pub struct InMemoryHeap {
    id_size: IdSize,
    next_id: u64,
    next_offset: u32,
    symbols: Vec<(Id, String)>,
    symbol_ids: HashMap<String, Id>,
    /// Load order
    class_order: Vec<Id>,
    classes: HashMap<Id, ClassInfo>,
    class_names: HashMap<String, Id>,
    /// Allocation order, which is also the partitioning order
    object_order: Vec<Id>,
    objects: HashMap<Id, StoredObject>,
    statics: HashMap<(Id, u32), FieldValue>,
    jni_globals: Vec<(Id, Id)>,
    unknown_roots: Vec<Id>,
    threads: Vec<PlatformThread>,
    virtual_threads: HashMap<Id, StoredVirtualThread>,
    line_numbers: HashMap<(Id, Id, u32), LineNum>,
    resolved_references_name: Id,
    object_class: Id,
    object_array_class: Id,
    active_pauses: AtomicUsize,
    total_pauses: AtomicUsize,
}

impl InMemoryHeap {
    /// A heap holding only `java/lang/Object` and `[Ljava/lang/Object;`
    pub fn new(id_size: IdSize) -> InMemoryHeap {
        let mut heap = InMemoryHeap {
            id_size,
            next_id: FIRST_ID,
            next_offset: 0,
            symbols: Vec::new(),
            symbol_ids: HashMap::new(),
            class_order: Vec::new(),
            classes: HashMap::new(),
            class_names: HashMap::new(),
            object_order: Vec::new(),
            objects: HashMap::new(),
            statics: HashMap::new(),
            jni_globals: Vec::new(),
            unknown_roots: Vec::new(),
            threads: Vec::new(),
            virtual_threads: HashMap::new(),
            line_numbers: HashMap::new(),
            resolved_references_name: Id::NULL,
            object_class: Id::NULL,
            object_array_class: Id::NULL,
            active_pauses: AtomicUsize::new(0),
            total_pauses: AtomicUsize::new(0),
        };

        heap.resolved_references_name = heap.intern(RESOLVED_REFERENCES_NAME);
        heap.object_class = heap.define_class("java/lang/Object", None, &[]);
        heap.set_boot_loader(heap.object_class, true);
        heap.object_array_class =
            heap.define_array_class("[Ljava/lang/Object;", ClassKind::ObjectArray);

        heap
    }

    fn allocate_id(&mut self) -> Id {
        let id = Id::new(self.next_id);
        self.next_id += ID_STEP;
        id
    }

    pub fn object_class(&self) -> Id {
        self.object_class
    }

    pub fn object_array_class(&self) -> Id {
        self.object_array_class
    }

    pub fn intern(&mut self, text: &str) -> Id {
        if let Some(id) = self.symbol_ids.get(text) {
            return *id;
        }

        let id = self.allocate_id();
        self.symbols.push((id, text.to_string()));
        self.symbol_ids.insert(text.to_string(), id);
        id
    }

    /// The id of an already interned symbol, or null
    pub fn symbol(&self, text: &str) -> Id {
        self.symbol_ids.get(text).copied().unwrap_or(Id::NULL)
    }

    pub fn class_named(&self, name: &str) -> Option<Id> {
        self.class_names.get(name).copied()
    }

    pub fn define_class(&mut self, name: &str, super_class: Option<Id>, fields: &[FieldSpec]) -> Id {
        let fields = fields
            .iter()
            .map(|spec| {
                let name = self.intern(&spec.name);
                let offset = self.next_offset;
                self.next_offset += 1;
                FieldInfo {
                    name,
                    signature: spec.signature.as_bytes().first().copied().unwrap_or(b'V'),
                    offset,
                    is_static: spec.is_static,
                }
            })
            .collect();

        self.add_class(name, super_class, ClassKind::Instance, fields)
    }

    /// An array class with `java/lang/Object` as super class, defined by the boot loader
    pub fn define_array_class(&mut self, name: &str, kind: ClassKind) -> Id {
        let object = self.object_class;
        let id = self.add_class(name, Some(object), kind, Vec::new());
        self.set_boot_loader(id, true);
        id
    }

    fn add_class(
        &mut self,
        name: &str,
        super_class: Option<Id>,
        kind: ClassKind,
        fields: Vec<FieldInfo>,
    ) -> Id {
        let name_id = self.intern(name);
        let id = self.allocate_id();
        self.classes.insert(
            id,
            ClassInfo {
                id,
                name: name_id,
                super_class,
                loader: None,
                signers: None,
                protection_domain: None,
                kind,
                fields,
                source_file: None,
                resolved_references: Vec::new(),
                boot_loader: false,
                mirror_resolved: true,
            },
        );
        self.class_order.push(id);
        self.class_names.insert(name.to_string(), id);
        id
    }

    fn class_mut(&mut self, class: Id) -> &mut ClassInfo {
        match self.classes.get_mut(&class) {
            Some(c) => c,
            None => panic!("Unknown class {:#X}", class),
        }
    }

    pub fn set_boot_loader(&mut self, class: Id, boot_loader: bool) {
        self.class_mut(class).boot_loader = boot_loader;
    }

    pub fn set_mirror_resolved(&mut self, class: Id, resolved: bool) {
        self.class_mut(class).mirror_resolved = resolved;
    }

    pub fn set_loader(&mut self, class: Id, loader: Option<Id>) {
        self.class_mut(class).loader = loader;
    }

    pub fn set_resolved_references(&mut self, class: Id, arrays: Vec<Id>) {
        self.class_mut(class).resolved_references = arrays;
    }

    pub fn set_source_file(&mut self, class: Id, source_file: &str) {
        let name = self.intern(source_file);
        self.class_mut(class).source_file = Some(name);
    }

    /// Finds a declared field by name in `class` or its supers
    fn find_field(&self, class: Id, name: &str, is_static: bool) -> Option<&FieldInfo> {
        let name = self.symbol_ids.get(name)?;
        let mut next = Some(class);
        while let Some(class_id) = next {
            let info = self.classes.get(&class_id)?;
            if let Some(f) = info
                .fields
                .iter()
                .find(|f| f.name == *name && f.is_static == is_static)
            {
                return Some(f);
            }
            next = info.super_class;
        }
        None
    }

    pub fn set_static(&mut self, class: Id, name: &str, value: FieldValue) {
        let offset = match self.find_field(class, name, true) {
            Some(f) => f.offset,
            None => panic!("No static field {} in class {:#X}", name, class),
        };
        self.statics.insert((class, offset), value);
    }

    /// Unset fields read as zero values
    pub fn new_instance(&mut self, class: Id, values: &[(&str, FieldValue)]) -> Id {
        let id = self.allocate_id();
        self.objects.insert(
            id,
            StoredObject::Instance {
                class,
                fields: HashMap::new(),
            },
        );
        self.object_order.push(id);
        for (name, value) in values {
            self.set_field(id, name, *value);
        }
        id
    }

    pub fn set_field(&mut self, obj: Id, name: &str, value: FieldValue) {
        let class = match self.objects.get(&obj) {
            Some(StoredObject::Instance { class, .. }) => *class,
            _ => panic!("{:#X} is not an instance", obj),
        };
        let offset = match self.find_field(class, name, false) {
            Some(f) => f.offset,
            None => panic!("No field {} in class {:#X}", name, class),
        };
        if let Some(StoredObject::Instance { fields, .. }) = self.objects.get_mut(&obj) {
            fields.insert(offset, value);
        }
    }

    pub fn new_object_array(&mut self, class: Id, elements: &[Id]) -> Id {
        let id = self.allocate_id();
        self.objects.insert(
            id,
            StoredObject::ObjectArray {
                class,
                elements: elements.to_vec(),
            },
        );
        self.object_order.push(id);
        id
    }

    /// Also defines the array class (e.g. `[I`) on first use
    pub fn new_primitive_array(&mut self, values: PrimitiveValues<'static>) -> Id {
        let element_type = values.element_type();
        let class_name = format!("[{}", primitive_signature(element_type));
        if self.class_named(&class_name).is_none() {
            self.define_array_class(&class_name, ClassKind::PrimitiveArray(element_type));
        }

        let id = self.allocate_id();
        self.objects.insert(id, StoredObject::PrimitiveArray(values));
        self.object_order.push(id);
        id
    }

    /// Returns the handle id
    pub fn add_jni_global(&mut self, obj: Id) -> Id {
        let handle = self.allocate_id();
        self.jni_globals.push((obj, handle));
        handle
    }

    pub fn add_unknown_root(&mut self, obj: Id) {
        self.unknown_roots.push(obj);
    }

    fn class_or_define(&mut self, name: &str, super_class: Option<Id>) -> Id {
        match self.class_named(name) {
            Some(id) => id,
            None => {
                let id = self.define_class(name, super_class, &[]);
                self.set_boot_loader(id, true);
                id
            }
        }
    }

    /// An instance of `java/lang/Thread`
    pub fn new_thread_object(&mut self) -> Id {
        let object = self.object_class;
        let thread_class = self.class_or_define("java/lang/Thread", Some(object));
        self.new_instance(thread_class, &[])
    }

    pub fn add_platform_thread(&mut self, thread: PlatformThread) {
        self.threads.push(thread);
    }

    /// An instance of `java/lang/VirtualThread` with the given state. `frames` are reported
    /// as its continuation's frames when it is unmounted.
    pub fn new_virtual_thread(
        &mut self,
        state: VirtualThreadState,
        mounted: bool,
        frames: Vec<Frame>,
    ) -> Id {
        let object = self.object_class;
        let thread_class = self.class_or_define("java/lang/Thread", Some(object));
        let vthread_class = self.class_or_define("java/lang/VirtualThread", Some(thread_class));
        let id = self.new_instance(vthread_class, &[]);
        self.virtual_threads.insert(
            id,
            StoredVirtualThread {
                thread: VirtualThread { state, mounted },
                frames,
            },
        );
        id
    }

    pub fn method(&mut self, holder: Id, name: &str, signature: &str, is_native: bool) -> MethodInfo {
        MethodInfo {
            name: self.intern(name),
            signature: self.intern(signature),
            holder,
            is_native,
        }
    }

    pub fn set_line_number(&mut self, method: &MethodInfo, bci: u32, line: LineNum) {
        self.line_numbers
            .insert((method.holder, method.name, bci), line);
    }

    pub fn object_count(&self) -> usize {
        self.object_order.len()
    }

    /// How many times the world has been stopped
    pub fn pause_count(&self) -> usize {
        self.total_pauses.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.active_pauses.load(Ordering::SeqCst) > 0
    }
}

fn primitive_signature(field_type: FieldType) -> char {
    match field_type {
        FieldType::Object => 'L',
        FieldType::Boolean => 'Z',
        FieldType::Char => 'C',
        FieldType::Float => 'F',
        FieldType::Double => 'D',
        FieldType::Byte => 'B',
        FieldType::Short => 'S',
        FieldType::Int => 'I',
        FieldType::Long => 'J',
    }
}

fn borrow_values<'a>(values: &'a PrimitiveValues<'static>) -> PrimitiveValues<'a> {
    match values {
        PrimitiveValues::Boolean(v) => PrimitiveValues::Boolean(Cow::Borrowed(v)),
        PrimitiveValues::Char(v) => PrimitiveValues::Char(Cow::Borrowed(v)),
        PrimitiveValues::Float(v) => PrimitiveValues::Float(Cow::Borrowed(v)),
        PrimitiveValues::Double(v) => PrimitiveValues::Double(Cow::Borrowed(v)),
        PrimitiveValues::Byte(v) => PrimitiveValues::Byte(Cow::Borrowed(v)),
        PrimitiveValues::Short(v) => PrimitiveValues::Short(Cow::Borrowed(v)),
        PrimitiveValues::Int(v) => PrimitiveValues::Int(Cow::Borrowed(v)),
        PrimitiveValues::Long(v) => PrimitiveValues::Long(Cow::Borrowed(v)),
    }
}

impl HeapIntrospector for InMemoryHeap {
    fn id_size(&self) -> IdSize {
        self.id_size
    }

    fn symbols(&self) -> Box<dyn Iterator<Item = Symbol<'_>> + '_> {
        Box::new(self.symbols.iter().map(|(id, text)| Symbol {
            id: *id,
            text: text.as_bytes(),
        }))
    }

    fn resolved_references_name(&self) -> Id {
        self.resolved_references_name
    }

    fn loaded_classes(&self) -> Vec<Id> {
        self.class_order.clone()
    }

    fn class(&self, class: Id) -> Option<&ClassInfo> {
        self.classes.get(&class)
    }

    fn live_objects(
        &self,
        partition: usize,
        partition_count: usize,
    ) -> Box<dyn Iterator<Item = Id> + '_> {
        let count = partition_count.max(1);
        Box::new(
            self.object_order
                .iter()
                .enumerate()
                .filter(move |(i, _)| i % count == partition)
                .map(|(_, id)| *id),
        )
    }

    fn object(&self, obj: Id) -> Option<HeapObject<'_>> {
        self.objects.get(&obj).map(|stored| match stored {
            StoredObject::Instance { class, .. } => HeapObject::Instance { class: *class },
            StoredObject::ObjectArray { class, elements } => HeapObject::ObjectArray {
                class: *class,
                elements: Cow::Borrowed(elements),
            },
            StoredObject::PrimitiveArray(values) => HeapObject::PrimitiveArray {
                values: borrow_values(values),
            },
        })
    }

    fn field_value(&self, obj: Id, offset: u32, field_type: FieldType) -> FieldValue {
        match self.objects.get(&obj) {
            Some(StoredObject::Instance { fields, .. }) => fields
                .get(&offset)
                .copied()
                .unwrap_or_else(|| FieldValue::default_for(field_type)),
            _ => FieldValue::default_for(field_type),
        }
    }

    fn static_field_value(&self, class: Id, field: &FieldInfo) -> FieldValue {
        self.statics
            .get(&(class, field.offset))
            .copied()
            .unwrap_or_else(|| {
                FieldValue::default_for(field.field_type().unwrap_or(FieldType::Object))
            })
    }

    fn jni_global_roots(&self) -> Vec<(Id, Id)> {
        self.jni_globals.clone()
    }

    fn unknown_roots(&self) -> Vec<Id> {
        self.unknown_roots.clone()
    }
}

impl StackIntrospector for InMemoryHeap {
    fn platform_threads(&self) -> Vec<PlatformThread> {
        self.threads.clone()
    }

    fn virtual_thread(&self, obj: Id) -> Option<VirtualThread> {
        self.virtual_threads.get(&obj).map(|v| v.thread)
    }

    fn unmounted_frames(&self, vthread: Id) -> Vec<Frame> {
        self.virtual_threads
            .get(&vthread)
            .map(|v| v.frames.clone())
            .unwrap_or_default()
    }

    fn line_number(&self, method: &MethodInfo, bci: u32) -> LineNum {
        self.line_numbers
            .get(&(method.holder, method.name, bci))
            .copied()
            .unwrap_or(LineNum::Unknown)
    }
}

impl WorldPause for InMemoryHeap {
    fn stop_the_world(&self) -> PauseToken<'_> {
        self.active_pauses.fetch_add(1, Ordering::SeqCst);
        self.total_pauses.fetch_add(1, Ordering::SeqCst);
        PauseToken::new(move || {
            self.active_pauses.fetch_sub(1, Ordering::SeqCst);
        })
    }
}
