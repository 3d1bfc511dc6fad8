use super::parsing_iterator::*;
use super::{parse_id, parse_optional_id, Ids, ParseResult};
use crate::introspect::FieldValue;
use crate::{FieldType, Id, IdSize, Serial, SubRecordTag};
use getset::{CopyGetters, Getters};
use nom::bytes::complete as bytes;
use nom::number::complete as number;

/// One sub-record of a heap dump segment
#[derive(Debug, Clone)]
pub enum SubRecord<'a> {
    RootUnknown {
        obj_id: Id,
    },
    RootJniGlobal {
        obj_id: Id,
        handle: Id,
    },
    RootJniLocal {
        obj_id: Id,
        thread_serial: Serial,
        /// None for native handles of a thread with no managed frames
        frame_index: Option<u32>,
    },
    RootJavaFrame {
        obj_id: Id,
        thread_serial: Serial,
        frame_index: Option<u32>,
    },
    RootNativeStack {
        obj_id: Id,
        thread_serial: Serial,
    },
    RootStickyClass {
        class_id: Id,
    },
    RootThreadBlock {
        obj_id: Id,
        thread_serial: Serial,
    },
    RootMonitorUsed {
        obj_id: Id,
    },
    RootThreadObj {
        thread_obj_id: Id,
        thread_serial: Serial,
        stack_trace_serial: Serial,
    },
    Class(Class),
    Instance(Instance<'a>),
    ObjectArray(ObjectArray<'a>),
    PrimitiveArray(PrimitiveArray<'a>),
}

impl<'a> SubRecord<'a> {
    pub fn tag(&self) -> SubRecordTag {
        match self {
            SubRecord::RootUnknown { .. } => SubRecordTag::RootUnknown,
            SubRecord::RootJniGlobal { .. } => SubRecordTag::RootJniGlobal,
            SubRecord::RootJniLocal { .. } => SubRecordTag::RootJniLocal,
            SubRecord::RootJavaFrame { .. } => SubRecordTag::RootJavaFrame,
            SubRecord::RootNativeStack { .. } => SubRecordTag::RootNativeStack,
            SubRecord::RootStickyClass { .. } => SubRecordTag::RootStickyClass,
            SubRecord::RootThreadBlock { .. } => SubRecordTag::RootThreadBlock,
            SubRecord::RootMonitorUsed { .. } => SubRecordTag::RootMonitorUsed,
            SubRecord::RootThreadObj { .. } => SubRecordTag::RootThreadObj,
            SubRecord::Class(_) => SubRecordTag::ClassDump,
            SubRecord::Instance(_) => SubRecordTag::InstanceDump,
            SubRecord::ObjectArray(_) => SubRecordTag::ObjectArrayDump,
            SubRecord::PrimitiveArray(_) => SubRecordTag::PrimitiveArrayDump,
        }
    }

    /// The object or class this sub-record dumps, for class/instance/array dumps
    pub fn dumped_id(&self) -> Option<Id> {
        match self {
            SubRecord::Class(c) => Some(c.obj_id),
            SubRecord::Instance(i) => Some(i.obj_id),
            SubRecord::ObjectArray(a) => Some(a.obj_id),
            SubRecord::PrimitiveArray(a) => Some(a.obj_id),
            _ => None,
        }
    }

    pub(crate) fn parse(input: &[u8], id_size: IdSize) -> nom::IResult<&[u8], SubRecord> {
        let (rest, tag_byte) = number::be_u8(input)?;
        let tag = match SubRecordTag::from_tag_byte(tag_byte) {
            Some(tag) => tag,
            None => return Err(nom::Err::Error((input, nom::error::ErrorKind::Tag))),
        };

        let input = rest;
        match tag {
            SubRecordTag::RootUnknown => {
                let (input, obj_id) = parse_id(input, id_size)?;
                Ok((input, SubRecord::RootUnknown { obj_id }))
            }
            SubRecordTag::RootJniGlobal => {
                let (input, obj_id) = parse_id(input, id_size)?;
                let (input, handle) = parse_id(input, id_size)?;
                Ok((input, SubRecord::RootJniGlobal { obj_id, handle }))
            }
            SubRecordTag::RootJniLocal => {
                let (input, (obj_id, thread_serial, frame_index)) =
                    parse_frame_root(input, id_size)?;
                Ok((
                    input,
                    SubRecord::RootJniLocal {
                        obj_id,
                        thread_serial,
                        frame_index,
                    },
                ))
            }
            SubRecordTag::RootJavaFrame => {
                let (input, (obj_id, thread_serial, frame_index)) =
                    parse_frame_root(input, id_size)?;
                Ok((
                    input,
                    SubRecord::RootJavaFrame {
                        obj_id,
                        thread_serial,
                        frame_index,
                    },
                ))
            }
            SubRecordTag::RootNativeStack => {
                let (input, obj_id) = parse_id(input, id_size)?;
                let (input, thread_serial) = number::be_u32(input)?;
                Ok((
                    input,
                    SubRecord::RootNativeStack {
                        obj_id,
                        thread_serial,
                    },
                ))
            }
            SubRecordTag::RootStickyClass => {
                let (input, class_id) = parse_id(input, id_size)?;
                Ok((input, SubRecord::RootStickyClass { class_id }))
            }
            SubRecordTag::RootThreadBlock => {
                let (input, obj_id) = parse_id(input, id_size)?;
                let (input, thread_serial) = number::be_u32(input)?;
                Ok((
                    input,
                    SubRecord::RootThreadBlock {
                        obj_id,
                        thread_serial,
                    },
                ))
            }
            SubRecordTag::RootMonitorUsed => {
                let (input, obj_id) = parse_id(input, id_size)?;
                Ok((input, SubRecord::RootMonitorUsed { obj_id }))
            }
            SubRecordTag::RootThreadObj => {
                let (input, thread_obj_id) = parse_id(input, id_size)?;
                let (input, thread_serial) = number::be_u32(input)?;
                let (input, stack_trace_serial) = number::be_u32(input)?;
                Ok((
                    input,
                    SubRecord::RootThreadObj {
                        thread_obj_id,
                        thread_serial,
                        stack_trace_serial,
                    },
                ))
            }
            SubRecordTag::ClassDump => {
                Class::parse(input, id_size).map(|(i, c)| (i, SubRecord::Class(c)))
            }
            SubRecordTag::InstanceDump => {
                Instance::parse(input, id_size).map(|(i, o)| (i, SubRecord::Instance(o)))
            }
            SubRecordTag::ObjectArrayDump => {
                ObjectArray::parse(input, id_size).map(|(i, a)| (i, SubRecord::ObjectArray(a)))
            }
            SubRecordTag::PrimitiveArrayDump => PrimitiveArray::parse(input, id_size)
                .map(|(i, a)| (i, SubRecord::PrimitiveArray(a))),
        }
    }
}

/// Object id, thread serial and frame number; `u32::MAX` means no frame
fn parse_frame_root(
    input: &[u8],
    id_size: IdSize,
) -> nom::IResult<&[u8], (Id, Serial, Option<u32>)> {
    let (input, obj_id) = parse_id(input, id_size)?;
    let (input, thread_serial) = number::be_u32(input)?;
    let (input, frame) = number::be_u32(input)?;
    let frame_index = if frame == u32::MAX { None } else { Some(frame) };

    Ok((input, (obj_id, thread_serial, frame_index)))
}

fn parse_field_type(input: &[u8]) -> nom::IResult<&[u8], FieldType> {
    let (rest, type_byte) = number::be_u8(input)?;
    match FieldType::from_type_byte(type_byte) {
        Some(t) => Ok((rest, t)),
        None => Err(nom::Err::Error((input, nom::error::ErrorKind::Verify))),
    }
}

fn parse_field_value(
    input: &[u8],
    field_type: FieldType,
    id_size: IdSize,
) -> nom::IResult<&[u8], FieldValue> {
    match field_type {
        FieldType::Object => parse_id(input, id_size).map(|(i, v)| (i, FieldValue::Object(v))),
        FieldType::Boolean => number::be_u8(input).map(|(i, v)| (i, FieldValue::Boolean(v != 0))),
        FieldType::Char => number::be_u16(input).map(|(i, v)| (i, FieldValue::Char(v))),
        FieldType::Float => number::be_f32(input).map(|(i, v)| (i, FieldValue::Float(v))),
        FieldType::Double => number::be_f64(input).map(|(i, v)| (i, FieldValue::Double(v))),
        FieldType::Byte => number::be_i8(input).map(|(i, v)| (i, FieldValue::Byte(v))),
        FieldType::Short => number::be_i16(input).map(|(i, v)| (i, FieldValue::Short(v))),
        FieldType::Int => number::be_i32(input).map(|(i, v)| (i, FieldValue::Int(v))),
        FieldType::Long => number::be_i64(input).map(|(i, v)| (i, FieldValue::Long(v))),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StaticField {
    pub name_id: Id,
    pub field_type: FieldType,
    pub value: FieldValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name_id: Id,
    pub field_type: FieldType,
}

#[derive(CopyGetters, Getters, Debug, Clone)]
pub struct Class {
    #[get_copy = "pub"]
    obj_id: Id,
    #[get_copy = "pub"]
    stack_trace_serial: Serial,
    #[get_copy = "pub"]
    super_class_obj_id: Option<Id>,
    #[get_copy = "pub"]
    class_loader_obj_id: Option<Id>,
    #[get_copy = "pub"]
    signers_obj_id: Option<Id>,
    #[get_copy = "pub"]
    protection_domain_obj_id: Option<Id>,
    #[get_copy = "pub"]
    instance_size_bytes: u32,
    #[get = "pub"]
    static_fields: Vec<StaticField>,
    #[get = "pub"]
    instance_field_descriptors: Vec<FieldDescriptor>,
}

impl Class {
    fn parse(input: &[u8], id_size: IdSize) -> nom::IResult<&[u8], Class> {
        let (input, obj_id) = parse_id(input, id_size)?;
        let (input, stack_trace_serial) = number::be_u32(input)?;
        let (input, super_class_obj_id) = parse_optional_id(input, id_size)?;
        let (input, class_loader_obj_id) = parse_optional_id(input, id_size)?;
        let (input, signers_obj_id) = parse_optional_id(input, id_size)?;
        let (input, protection_domain_obj_id) = parse_optional_id(input, id_size)?;
        // reserved
        let (input, _) = parse_id(input, id_size)?;
        let (input, _) = parse_id(input, id_size)?;
        let (input, instance_size_bytes) = number::be_u32(input)?;

        let (mut input, constant_pool_len) = number::be_u16(input)?;
        for _ in 0..constant_pool_len {
            let (rest, _index) = number::be_u16(input)?;
            let (rest, field_type) = parse_field_type(rest)?;
            let (rest, _value) = parse_field_value(rest, field_type, id_size)?;
            input = rest;
        }

        let (mut input, static_len) = number::be_u16(input)?;
        let mut static_fields = Vec::with_capacity(static_len as usize);
        for _ in 0..static_len {
            let (rest, name_id) = parse_id(input, id_size)?;
            let (rest, field_type) = parse_field_type(rest)?;
            let (rest, value) = parse_field_value(rest, field_type, id_size)?;
            static_fields.push(StaticField {
                name_id,
                field_type,
                value,
            });
            input = rest;
        }

        let (mut input, instance_len) = number::be_u16(input)?;
        let mut instance_field_descriptors = Vec::with_capacity(instance_len as usize);
        for _ in 0..instance_len {
            let (rest, name_id) = parse_id(input, id_size)?;
            let (rest, field_type) = parse_field_type(rest)?;
            instance_field_descriptors.push(FieldDescriptor {
                name_id,
                field_type,
            });
            input = rest;
        }

        Ok((
            input,
            Class {
                obj_id,
                stack_trace_serial,
                super_class_obj_id,
                class_loader_obj_id,
                signers_obj_id,
                protection_domain_obj_id,
                instance_size_bytes,
                static_fields,
                instance_field_descriptors,
            },
        ))
    }
}

#[derive(CopyGetters, Debug, Clone)]
pub struct Instance<'a> {
    #[get_copy = "pub"]
    obj_id: Id,
    #[get_copy = "pub"]
    stack_trace_serial: Serial,
    #[get_copy = "pub"]
    class_obj_id: Id,
    /// Raw field values, in the order given by the class and its supers' field descriptors
    #[get_copy = "pub"]
    fields: &'a [u8],
}

impl<'a> Instance<'a> {
    fn parse(input: &[u8], id_size: IdSize) -> nom::IResult<&[u8], Instance> {
        let (input, obj_id) = parse_id(input, id_size)?;
        let (input, stack_trace_serial) = number::be_u32(input)?;
        let (input, class_obj_id) = parse_id(input, id_size)?;
        let (input, fields_len) = number::be_u32(input)?;
        let (input, fields) = bytes::take(fields_len)(input)?;

        Ok((
            input,
            Instance {
                obj_id,
                stack_trace_serial,
                class_obj_id,
                fields,
            },
        ))
    }

    /// Decodes `fields` given the instance field types of the class, then its supers
    pub fn field_values(
        &self,
        field_types: &[FieldType],
        id_size: IdSize,
    ) -> ParseResult<'a, Vec<FieldValue>> {
        let mut input = self.fields;
        let mut values = Vec::with_capacity(field_types.len());
        for field_type in field_types {
            let (rest, value) = parse_field_value(input, *field_type, id_size)?;
            values.push(value);
            input = rest;
        }

        Ok(values)
    }
}

#[derive(CopyGetters, Debug, Clone)]
pub struct ObjectArray<'a> {
    id_size: IdSize,
    #[get_copy = "pub"]
    obj_id: Id,
    #[get_copy = "pub"]
    stack_trace_serial: Serial,
    #[get_copy = "pub"]
    array_class_obj_id: Id,
    #[get_copy = "pub"]
    num_elements: u32,
    contents: &'a [u8],
}

impl<'a> ObjectArray<'a> {
    fn parse(input: &[u8], id_size: IdSize) -> nom::IResult<&[u8], ObjectArray> {
        let (input, obj_id) = parse_id(input, id_size)?;
        let (input, stack_trace_serial) = number::be_u32(input)?;
        let (input, num_elements) = number::be_u32(input)?;
        let (input, array_class_obj_id) = parse_id(input, id_size)?;
        let (input, contents) =
            bytes::take(num_elements as usize * id_size.size_in_bytes())(input)?;

        Ok((
            input,
            ObjectArray {
                id_size,
                obj_id,
                stack_trace_serial,
                array_class_obj_id,
                num_elements,
                contents,
            },
        ))
    }

    pub fn element_ids(&self) -> Ids<'a> {
        Ids {
            iter: ParsingIterator::new_stateless_id_size(
                self.id_size,
                self.contents,
                self.num_elements,
            ),
        }
    }

    /// All element ids; the contents were length-checked when parsed, so none can fail
    pub fn elements(&self) -> Vec<Id> {
        self.element_ids().filter_map(Result::ok).collect()
    }
}

#[derive(CopyGetters, Debug, Clone)]
pub struct PrimitiveArray<'a> {
    #[get_copy = "pub"]
    obj_id: Id,
    #[get_copy = "pub"]
    stack_trace_serial: Serial,
    #[get_copy = "pub"]
    primitive_type: FieldType,
    #[get_copy = "pub"]
    num_elements: u32,
    /// Raw big-endian element bytes
    #[get_copy = "pub"]
    contents: &'a [u8],
}

macro_rules! iterator_method {
    ($method_name:tt, $type_variant:tt, $iter_struct:tt) => {
        pub fn $method_name(&self) -> Option<$iter_struct<'a>> {
            match self.primitive_type {
                FieldType::$type_variant => Some($iter_struct {
                    iter: ParsingIterator::new_stateless(self.contents, self.num_elements),
                }),
                _ => None,
            }
        }
    };
}

impl<'a> PrimitiveArray<'a> {
    fn parse(input: &[u8], id_size: IdSize) -> nom::IResult<&[u8], PrimitiveArray> {
        let (input, obj_id) = parse_id(input, id_size)?;
        let (input, stack_trace_serial) = number::be_u32(input)?;
        let (input, num_elements) = number::be_u32(input)?;
        let (rest, primitive_type) = parse_field_type(input)?;
        if primitive_type == FieldType::Object {
            return Err(nom::Err::Error((input, nom::error::ErrorKind::Verify)));
        }

        let size = primitive_type.size_in_bytes(id_size);
        let (rest, contents) = bytes::take(num_elements as usize * size)(rest)?;

        Ok((
            rest,
            PrimitiveArray {
                obj_id,
                stack_trace_serial,
                primitive_type,
                num_elements,
                contents,
            },
        ))
    }

    iterator_method!(booleans, Boolean, Booleans);
    iterator_method!(chars, Char, Chars);
    iterator_method!(floats, Float, Floats);
    iterator_method!(doubles, Double, Doubles);
    iterator_method!(bytes, Byte, Bytes);
    iterator_method!(shorts, Short, Shorts);
    iterator_method!(ints, Int, Ints);
    iterator_method!(longs, Long, Longs);
}

impl StatelessParser for bool {
    fn parse(input: &[u8]) -> nom::IResult<&[u8], bool> {
        number::be_u8(input).map(|(input, b)| (input, b != 0))
    }
}

macro_rules! parser_impl {
    ($prim_type:tt, $parser_method:tt) => {
        impl StatelessParser for $prim_type {
            fn parse(input: &[u8]) -> nom::IResult<&[u8], $prim_type> {
                number::$parser_method(input)
            }
        }
    };
}

parser_impl!(u16, be_u16);
parser_impl!(f32, be_f32);
parser_impl!(f64, be_f64);
parser_impl!(i8, be_i8);
parser_impl!(i16, be_i16);
parser_impl!(i32, be_i32);
parser_impl!(i64, be_i64);

macro_rules! iter_struct {
    ($struct_name:ident, $item_type:ty) => {
        pub struct $struct_name<'a> {
            iter: ParsingIterator<'a, $item_type, StatelessParserWrapper<$item_type>>,
        }

        impl<'a> Iterator for $struct_name<'a> {
            type Item = ParseResult<'a, $item_type>;

            fn next(&mut self) -> Option<Self::Item> {
                self.iter.next()
            }
        }
    };
}

iter_struct!(Booleans, bool);
iter_struct!(Chars, u16);
iter_struct!(Floats, f32);
iter_struct!(Doubles, f64);
iter_struct!(Bytes, i8);
iter_struct!(Shorts, i16);
iter_struct!(Ints, i32);
iter_struct!(Longs, i64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_root_without_frame() {
        let mut bytes = vec![SubRecordTag::RootJniLocal.tag_byte()];
        bytes.extend_from_slice(&0x10_u32.to_be_bytes());
        bytes.extend_from_slice(&3_u32.to_be_bytes());
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());

        let (rest, record) = SubRecord::parse(&bytes, IdSize::U32).unwrap();
        assert!(rest.is_empty());
        match record {
            SubRecord::RootJniLocal {
                obj_id,
                thread_serial,
                frame_index,
            } => {
                assert_eq!(Id::new(0x10), obj_id);
                assert_eq!(3, thread_serial);
                assert_eq!(None, frame_index);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn primitive_array_typed_access() {
        let mut bytes = vec![SubRecordTag::PrimitiveArrayDump.tag_byte()];
        bytes.extend_from_slice(&0x20_u32.to_be_bytes());
        bytes.extend_from_slice(&1_u32.to_be_bytes());
        bytes.extend_from_slice(&2_u32.to_be_bytes());
        bytes.push(FieldType::Short.type_byte());
        bytes.extend_from_slice(&(-2_i16).to_be_bytes());
        bytes.extend_from_slice(&300_i16.to_be_bytes());

        let (_, record) = SubRecord::parse(&bytes, IdSize::U32).unwrap();
        match record {
            SubRecord::PrimitiveArray(arr) => {
                assert!(arr.ints().is_none());
                assert_eq!(
                    vec![-2, 300],
                    arr.shorts().unwrap().map(|r| r.unwrap()).collect::<Vec<_>>()
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn truncated_instance_is_an_error() {
        let mut bytes = vec![SubRecordTag::InstanceDump.tag_byte()];
        bytes.extend_from_slice(&0x20_u32.to_be_bytes());
        bytes.extend_from_slice(&1_u32.to_be_bytes());
        bytes.extend_from_slice(&0x30_u32.to_be_bytes());
        bytes.extend_from_slice(&8_u32.to_be_bytes());
        bytes.extend_from_slice(&[0; 4]);

        assert!(SubRecord::parse(&bytes, IdSize::U32).is_err());
    }

    #[test]
    fn unknown_sub_record_tag_is_an_error() {
        assert!(SubRecord::parse(&[0x42, 0, 0], IdSize::U32).is_err());
    }
}
