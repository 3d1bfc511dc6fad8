//! Encoding of classes, objects and global roots.
//!
//! Nothing here recurses into referents: a reference is always written as the referent's id,
//! so cyclic object graphs need no special handling.

use crate::class_cache::ClassMetadataCache;
use crate::introspect::{
    ClassInfo, ClassKind, FieldInfo, FieldValue, HeapIntrospector, HeapObject, Symbol,
};
use crate::writer::RecordWriter;
use crate::{FieldType, Id, IdSize, RecordTag, Serial, SubRecordTag, HPROF_MAGIC, STACK_TRACE_ID};
use std::io::Write;

pub mod primitive_array;

use primitive_array::{canonical_f32_bits, canonical_f64_bits};

/// Which sub-record `ObjectGraphEncoder::dump_object` produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpedKind {
    Instance,
    ObjectArray,
    PrimitiveArray,
}

/// Turns classes and live objects into heap dump sub-records. One per worker: the class
/// layout cache inside is not shared.
pub struct ObjectGraphEncoder<'h, H: HeapIntrospector + ?Sized> {
    heap: &'h H,
    class_cache: ClassMetadataCache,
    id_size: IdSize,
    /// Upper bound for one sub-record, from the u4 length of the enclosing segment
    max_record_size: u32,
}

impl<'h, H: HeapIntrospector + ?Sized> ObjectGraphEncoder<'h, H> {
    pub fn new(heap: &'h H) -> ObjectGraphEncoder<'h, H> {
        let id_size = heap.id_size();
        ObjectGraphEncoder {
            heap,
            class_cache: ClassMetadataCache::new(id_size),
            id_size,
            max_record_size: u32::MAX,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_max_record_size(mut self, max_record_size: u32) -> Self {
        self.max_record_size = max_record_size;
        self
    }

    fn id_len(&self) -> u32 {
        self.id_size.size_in_bytes() as u32
    }

    /// Writes the sub-record for one live object. None if the object was skipped because it
    /// is dormant or unknown to the introspector.
    pub fn dump_object<W: Write>(
        &mut self,
        writer: &mut RecordWriter<W>,
        obj: Id,
    ) -> Option<DumpedKind> {
        if self.heap.is_dormant(obj) {
            return None;
        }

        match self.heap.object(obj)? {
            HeapObject::Instance { class } => {
                if self.dump_instance(writer, obj, class) {
                    Some(DumpedKind::Instance)
                } else {
                    None
                }
            }
            HeapObject::ObjectArray { class, elements } => {
                self.dump_object_array(writer, obj, class, &elements);
                Some(DumpedKind::ObjectArray)
            }
            HeapObject::PrimitiveArray { values } => {
                self.dump_primitive_array(writer, obj, &values);
                Some(DumpedKind::PrimitiveArray)
            }
        }
    }

    /// False if the class (or a super class) is unknown, in which case nothing is written.
    pub fn dump_instance<W: Write>(
        &mut self,
        writer: &mut RecordWriter<W>,
        obj: Id,
        class: Id,
    ) -> bool {
        let layout = match self.class_cache.lookup_or_create(self.heap, class) {
            Some(layout) => layout,
            None => {
                log::debug!("Skipping instance {:#X} of unknown class {:#X}", obj, class);
                return false;
            }
        };

        let id = self.id_len();
        let size = 1 + id + 4 + id + 4 + layout.instance_size();
        writer.start_sub_record(SubRecordTag::InstanceDump, size);
        writer.write_object_id(obj);
        writer.write_u4(STACK_TRACE_ID);
        writer.write_class_id(class);
        writer.write_u4(layout.instance_size());
        for field in layout.fields() {
            let value = self
                .heap
                .field_value(obj, field.offset, field.field_type);
            self.write_field_value(writer, field.field_type, value);
        }
        writer.end_sub_record();

        true
    }

    pub fn dump_object_array<W: Write>(
        &mut self,
        writer: &mut RecordWriter<W>,
        obj: Id,
        class: Id,
        elements: &[Id],
    ) {
        let id = self.id_len();
        let header_size = 1 + 2 * 4 + 2 * id;
        let length = self.clamp_array_length(obj, elements.len(), FieldType::Object, header_size);
        let size = header_size + length as u32 * id;

        writer.start_sub_record(SubRecordTag::ObjectArrayDump, size);
        writer.write_object_id(obj);
        writer.write_u4(STACK_TRACE_ID);
        writer.write_u4(length as u32);
        writer.write_class_id(class);
        for element in &elements[..length] {
            writer.write_object_id(self.mask_dormant(*element));
        }
        writer.end_sub_record();
    }

    pub fn dump_class<W: Write>(&mut self, writer: &mut RecordWriter<W>, class: &ClassInfo) {
        match class.kind {
            ClassKind::Instance => self.dump_instance_class(writer, class),
            ClassKind::ObjectArray | ClassKind::PrimitiveArray(_) => {
                self.dump_array_class(writer, class)
            }
        }
    }

    fn dump_instance_class<W: Write>(&mut self, writer: &mut RecordWriter<W>, class: &ClassInfo) {
        let id = self.id_len();
        let id_size = self.id_size;
        let mut static_fields = typed_fields(class, true);
        let mut instance_fields = typed_fields(class, false);

        // field counts are u2; declared statics take precedence over resolved references
        let max_fields = u16::MAX as usize;
        let static_count = static_fields.len() + class.resolved_references.len();
        if static_count > max_fields {
            log::warn!(
                "Class {:#X} has {} static fields; dumping only {}",
                class.id,
                static_count,
                max_fields
            );
            static_fields.truncate(max_fields);
        }
        let resolved_count = class
            .resolved_references
            .len()
            .min(max_fields - static_fields.len());
        let resolved_references = &class.resolved_references[..resolved_count];
        if instance_fields.len() > max_fields {
            log::warn!(
                "Class {:#X} has {} instance fields; dumping only {}",
                class.id,
                instance_fields.len(),
                max_fields
            );
            instance_fields.truncate(max_fields);
        }

        let static_size = static_fields
            .iter()
            .map(|(_, t)| id + 1 + t.size_in_bytes(id_size) as u32)
            .sum::<u32>()
            + resolved_references.len() as u32 * (id + 1 + id);
        let static_count = static_fields.len() + resolved_references.len();
        let instance_fields_size = instance_fields.len() as u32 * (id + 1);
        let size = 1 + id + 4 + 6 * id + 4 + 2 + 2 + static_size + 2 + instance_fields_size;

        let instance_size = self
            .class_cache
            .lookup_or_create(self.heap, class.id)
            .map(|layout| layout.instance_size())
            .unwrap_or(0);

        writer.start_sub_record(SubRecordTag::ClassDump, size);
        writer.write_class_id(class.id);
        writer.write_u4(STACK_TRACE_ID);
        writer.write_class_id(class.super_class.unwrap_or(Id::NULL));
        writer.write_object_id(self.mask_dormant(class.loader.unwrap_or(Id::NULL)));
        writer.write_object_id(self.mask_dormant(class.signers.unwrap_or(Id::NULL)));
        writer.write_object_id(self.mask_dormant(class.protection_domain.unwrap_or(Id::NULL)));
        // reserved
        writer.write_object_id(Id::NULL);
        writer.write_object_id(Id::NULL);
        writer.write_u4(instance_size);
        // constant pool entries are not dumped
        writer.write_u2(0);

        writer.write_u2(static_count as u16);
        for (field, field_type) in static_fields.iter() {
            writer.write_symbol_id(field.name);
            writer.write_u1(field_type.type_byte());
            let value = self.heap.static_field_value(class.id, field);
            self.write_field_value(writer, *field_type, value);
        }
        // one synthetic field per resolved references array, so that objects only reachable
        // through the constant pool stay in the graph
        let resolved_references_name = self.heap.resolved_references_name();
        for array in resolved_references.iter() {
            writer.write_symbol_id(resolved_references_name);
            writer.write_u1(FieldType::Object.type_byte());
            writer.write_object_id(self.mask_dormant(*array));
        }

        writer.write_u2(instance_fields.len() as u16);
        for (field, field_type) in instance_fields.iter() {
            writer.write_symbol_id(field.name);
            writer.write_u1(field_type.type_byte());
        }
        writer.end_sub_record();
    }

    fn dump_array_class<W: Write>(&mut self, writer: &mut RecordWriter<W>, class: &ClassInfo) {
        let id = self.id_len();
        let size = 1 + id + 4 + 6 * id + 4 + 2 + 2 + 2;

        writer.start_sub_record(SubRecordTag::ClassDump, size);
        writer.write_class_id(class.id);
        writer.write_u4(STACK_TRACE_ID);
        writer.write_class_id(class.super_class.unwrap_or(Id::NULL));
        writer.write_object_id(self.mask_dormant(class.loader.unwrap_or(Id::NULL)));
        writer.write_object_id(self.mask_dormant(class.signers.unwrap_or(Id::NULL)));
        writer.write_object_id(self.mask_dormant(class.protection_domain.unwrap_or(Id::NULL)));
        writer.write_object_id(Id::NULL);
        writer.write_object_id(Id::NULL);
        // instance size, constant pool, static fields, instance fields
        writer.write_u4(0);
        writer.write_u2(0);
        writer.write_u2(0);
        writer.write_u2(0);
        writer.end_sub_record();
    }

    /// `value` must be of `field_type`; anything else would break the declared record length,
    /// so a mismatched value is replaced by the type's zero value.
    fn write_field_value<W: Write>(
        &self,
        writer: &mut RecordWriter<W>,
        field_type: FieldType,
        value: FieldValue,
    ) {
        let value = if value.field_type() == field_type {
            value
        } else {
            log::debug!(
                "Expected a {} value but got {:?}",
                field_type.java_type_name(),
                value
            );
            FieldValue::default_for(field_type)
        };

        match value {
            FieldValue::Object(obj) => writer.write_object_id(self.mask_dormant(obj)),
            FieldValue::Boolean(b) => writer.write_u1(b as u8),
            FieldValue::Char(c) => writer.write_u2(c),
            FieldValue::Float(f) => writer.write_u4(canonical_f32_bits(f)),
            FieldValue::Double(d) => writer.write_u8(canonical_f64_bits(d)),
            FieldValue::Byte(b) => writer.write_u1(b as u8),
            FieldValue::Short(s) => writer.write_u2(s as u16),
            FieldValue::Int(i) => writer.write_u4(i as u32),
            FieldValue::Long(l) => writer.write_u8(l as u64),
        }
    }

    /// Dormant objects are not dumped, so references to them become null.
    pub fn mask_dormant(&self, obj: Id) -> Id {
        if !obj.is_null() && self.heap.is_dormant(obj) {
            Id::NULL
        } else {
            obj
        }
    }
}

/// Declared fields of one kind with a known type, in declaration order
fn typed_fields(class: &ClassInfo, is_static: bool) -> Vec<(&FieldInfo, FieldType)> {
    class
        .fields
        .iter()
        .filter(|f| f.is_static == is_static)
        .filter_map(|f| f.field_type().map(|t| (f, t)))
        .collect()
}

/// `JAVA PROFILE 1.0.2\0`, id size, then the timestamp as two u4s.
pub fn write_file_header<W: Write>(writer: &mut RecordWriter<W>, timestamp_millis: u64) {
    writer.write_raw(HPROF_MAGIC);
    writer.write_u1(0);
    writer.write_u4(writer.id_size().size_in_bytes() as u32);
    writer.write_u4((timestamp_millis >> 32) as u32);
    writer.write_u4(timestamp_millis as u32);
}

pub fn write_utf8<W: Write>(writer: &mut RecordWriter<W>, symbol: &Symbol) {
    let id = writer.id_size().size_in_bytes() as u32;
    writer.write_header(RecordTag::Utf8, id + symbol.text.len() as u32);
    writer.write_symbol_id(symbol.id);
    writer.write_raw(symbol.text);
}

pub fn write_load_class<W: Write>(
    writer: &mut RecordWriter<W>,
    class_serial: Serial,
    class: &ClassInfo,
) {
    let id = writer.id_size().size_in_bytes() as u32;
    writer.write_header(RecordTag::LoadClass, 2 * id + 2 * 4);
    writer.write_u4(class_serial);
    writer.write_class_id(class.id);
    writer.write_u4(STACK_TRACE_ID);
    writer.write_symbol_id(class.name);
}

pub fn write_root_unknown<W: Write>(writer: &mut RecordWriter<W>, obj: Id) {
    let id = writer.id_size().size_in_bytes() as u32;
    writer.start_sub_record(SubRecordTag::RootUnknown, 1 + id);
    writer.write_object_id(obj);
    writer.end_sub_record();
}

pub fn write_root_jni_global<W: Write>(writer: &mut RecordWriter<W>, obj: Id, handle: Id) {
    let id = writer.id_size().size_in_bytes() as u32;
    writer.start_sub_record(SubRecordTag::RootJniGlobal, 1 + 2 * id);
    writer.write_object_id(obj);
    writer.write_id(handle);
    writer.end_sub_record();
}

pub fn write_root_sticky_class<W: Write>(writer: &mut RecordWriter<W>, class: Id) {
    let id = writer.id_size().size_in_bytes() as u32;
    writer.start_sub_record(SubRecordTag::RootStickyClass, 1 + id);
    writer.write_class_id(class);
    writer.end_sub_record();
}

pub fn write_heap_dump_end<W: Write>(writer: &mut RecordWriter<W>) {
    writer.write_header(RecordTag::HeapDumpEnd, 0);
}
