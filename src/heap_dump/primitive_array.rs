//! Primitive array sub-records, and the length clamping shared with object arrays.

use super::ObjectGraphEncoder;
use crate::introspect::{HeapIntrospector, PrimitiveValues};
use crate::writer::RecordWriter;
use crate::{FieldType, Id, SubRecordTag, STACK_TRACE_ID};
use std::io::Write;

/// Elements converted per `write_raw` call
const CHUNK_ELEMENTS: usize = 4096;

/// All NaNs are written as the canonical quiet NaN, as `Float.floatToIntBits` would.
pub fn canonical_f32_bits(v: f32) -> u32 {
    if v.is_nan() {
        0x7fc0_0000
    } else {
        v.to_bits()
    }
}

pub fn canonical_f64_bits(v: f64) -> u64 {
    if v.is_nan() {
        0x7ff8_0000_0000_0000
    } else {
        v.to_bits()
    }
}

/// Longest array whose sub-record of `header_size + length * element_size` bytes stays within
/// `max_record_size`.
pub fn max_array_length(header_size: u32, element_size: u32, max_record_size: u32) -> usize {
    (max_record_size.saturating_sub(header_size) / element_size) as usize
}

impl<'h, H: HeapIntrospector + ?Sized> ObjectGraphEncoder<'h, H> {
    /// `length`, or the longest length that fits one sub-record if that is shorter
    pub(crate) fn clamp_array_length(
        &self,
        obj: Id,
        length: usize,
        element_type: FieldType,
        header_size: u32,
    ) -> usize {
        let element_size = element_type.size_in_bytes(self.id_size) as u32;
        let max_length = max_array_length(header_size, element_size, self.max_record_size);
        if length > max_length {
            log::warn!(
                "Cannot dump {}[] array {:#X} with length {}; truncating to length {}",
                element_type.java_type_name(),
                obj,
                length,
                max_length
            );
            max_length
        } else {
            length
        }
    }

    pub fn dump_primitive_array<W: Write>(
        &mut self,
        writer: &mut RecordWriter<W>,
        obj: Id,
        values: &PrimitiveValues,
    ) {
        let element_type = values.element_type();
        let element_size = element_type.size_in_bytes(self.id_size) as u32;
        let header_size = 2 + 2 * 4 + self.id_size.size_in_bytes() as u32;
        let length = self.clamp_array_length(obj, values.len(), element_type, header_size);
        let size = header_size + length as u32 * element_size;

        writer.start_sub_record(SubRecordTag::PrimitiveArrayDump, size);
        writer.write_object_id(obj);
        writer.write_u4(STACK_TRACE_ID);
        writer.write_u4(length as u32);
        writer.write_u1(element_type.type_byte());
        match values {
            PrimitiveValues::Boolean(v) => write_be(writer, &v[..length], |b: bool| [b as u8]),
            PrimitiveValues::Char(v) => write_be(writer, &v[..length], u16::to_be_bytes),
            PrimitiveValues::Float(v) => write_be(writer, &v[..length], |f: f32| {
                canonical_f32_bits(f).to_be_bytes()
            }),
            PrimitiveValues::Double(v) => write_be(writer, &v[..length], |d: f64| {
                canonical_f64_bits(d).to_be_bytes()
            }),
            PrimitiveValues::Byte(v) => write_be(writer, &v[..length], i8::to_be_bytes),
            PrimitiveValues::Short(v) => write_be(writer, &v[..length], i16::to_be_bytes),
            PrimitiveValues::Int(v) => write_be(writer, &v[..length], i32::to_be_bytes),
            PrimitiveValues::Long(v) => write_be(writer, &v[..length], i64::to_be_bytes),
        }
        writer.end_sub_record();
    }
}

fn write_be<W, T, F, const N: usize>(writer: &mut RecordWriter<W>, values: &[T], to_bytes: F)
where
    W: Write,
    T: Copy,
    F: Fn(T) -> [u8; N],
{
    let mut scratch = Vec::with_capacity(CHUNK_ELEMENTS.min(values.len()) * N);
    for chunk in values.chunks(CHUNK_ELEMENTS) {
        scratch.clear();
        for v in chunk {
            scratch.extend_from_slice(&to_bytes(*v));
        }
        writer.write_raw(&scratch);
    }
}
