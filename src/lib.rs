//! Writes JVM hprof heap dumps from a paused runtime.
//!
//! The runtime is described through the capability traits in [`introspect`]; [`HeapDumper`]
//! walks the heap (optionally with several workers, each writing its own shard file), then
//! merges the shards into one `JAVA PROFILE 1.0.2` file. [`read`] parses the result back.
//!
//! Format reference: https://github.com/openjdk/jdk/blob/08822b4e0526fe001c39fe08e241b849eddf481d/src/hotspot/share/services/heapDumper.cpp

use getset::CopyGetters;
use std::fmt;
use std::fmt::Formatter;
use strum_macros::EnumIter;

pub mod class_cache;
pub mod compression;
pub mod config;
pub mod dumper;
pub mod error;
pub mod heap_dump;
pub mod introspect;
pub mod mem_heap;
pub mod merge;
pub mod read;
pub mod thread_dump;
pub mod writer;


pub use config::{DumpConfig, OutOfMemoryContext};
pub use dumper::{DumpOutcome, HeapDumper};
pub use error::{DumpError, Result};

/// Label at the start of every file we write, followed by a NUL.
pub const HPROF_MAGIC: &[u8] = b"JAVA PROFILE 1.0.2";

/// Serial of the empty stack trace referenced by every class and object sub-record.
pub const STACK_TRACE_ID: Serial = 1;

#[derive(CopyGetters, Copy, Clone, Debug, Default, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct Id {
    // 4-byte ids are widened; the writer narrows them again according to IdSize
    #[get_copy = "pub"]
    id: u64,
}

impl Id {
    pub const NULL: Id = Id { id: 0 };

    pub const fn new(id: u64) -> Id {
        Id { id }
    }

    pub fn is_null(&self) -> bool {
        self.id == 0
    }
}

impl From<u64> for Id {
    fn from(id: u64) -> Self {
        Id { id }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl fmt::UpperHex for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        fmt::UpperHex::fmt(&self.id, f)
    }
}

pub type Serial = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSize {
    U32,
    U64,
}

impl IdSize {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            IdSize::U32 => 4,
            IdSize::U64 => 8,
        }
    }

    pub fn from_size_in_bytes(size: u32) -> Option<IdSize> {
        match size {
            4 => Some(IdSize::U32),
            8 => Some(IdSize::U64),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, EnumIter)]
pub enum RecordTag {
    Utf8,
    LoadClass,
    UnloadClass,
    StackFrame,
    StackTrace,
    AllocSites,
    HeapSummary,
    StartThread,
    EndThread,
    HeapDump,
    CpuSamples,
    ControlSettings,
    HeapDumpSegment,
    HeapDumpEnd,
}

impl RecordTag {
    pub fn tag_byte(&self) -> u8 {
        match self {
            RecordTag::Utf8 => 0x01,
            RecordTag::LoadClass => 0x02,
            RecordTag::UnloadClass => 0x03,
            RecordTag::StackFrame => 0x04,
            RecordTag::StackTrace => 0x05,
            RecordTag::AllocSites => 0x06,
            RecordTag::HeapSummary => 0x07,
            RecordTag::StartThread => 0x0A,
            RecordTag::EndThread => 0x0B,
            RecordTag::HeapDump => 0x0C,
            RecordTag::CpuSamples => 0x0D,
            RecordTag::ControlSettings => 0x0E,
            RecordTag::HeapDumpSegment => 0x1C,
            RecordTag::HeapDumpEnd => 0x2C,
        }
    }

    pub fn from_tag_byte(byte: u8) -> Option<RecordTag> {
        use strum::IntoEnumIterator;

        RecordTag::iter().find(|t| t.tag_byte() == byte)
    }
}

/// Tags of the sub-records inside a heap dump segment
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, EnumIter)]
pub enum SubRecordTag {
    RootUnknown,
    RootJniGlobal,
    RootJniLocal,
    RootJavaFrame,
    RootNativeStack,
    RootStickyClass,
    RootThreadBlock,
    RootMonitorUsed,
    RootThreadObj,
    ClassDump,
    InstanceDump,
    ObjectArrayDump,
    PrimitiveArrayDump,
}

impl SubRecordTag {
    pub fn tag_byte(&self) -> u8 {
        match self {
            SubRecordTag::RootUnknown => 0xFF,
            SubRecordTag::RootJniGlobal => 0x01,
            SubRecordTag::RootJniLocal => 0x02,
            SubRecordTag::RootJavaFrame => 0x03,
            SubRecordTag::RootNativeStack => 0x04,
            SubRecordTag::RootStickyClass => 0x05,
            SubRecordTag::RootThreadBlock => 0x06,
            SubRecordTag::RootMonitorUsed => 0x07,
            SubRecordTag::RootThreadObj => 0x08,
            SubRecordTag::ClassDump => 0x20,
            SubRecordTag::InstanceDump => 0x21,
            SubRecordTag::ObjectArrayDump => 0x22,
            SubRecordTag::PrimitiveArrayDump => 0x23,
        }
    }

    pub fn from_tag_byte(byte: u8) -> Option<SubRecordTag> {
        use strum::IntoEnumIterator;

        SubRecordTag::iter().find(|t| t.tag_byte() == byte)
    }
}

/// Basic type of a field or array element, as encoded in class dumps and primitive arrays.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, EnumIter)]
pub enum FieldType {
    Object,
    Boolean,
    Char,
    Float,
    Double,
    Byte,
    Short,
    Int,
    Long,
}

impl FieldType {
    pub fn type_byte(&self) -> u8 {
        match self {
            FieldType::Object => 2,
            FieldType::Boolean => 4,
            FieldType::Char => 5,
            FieldType::Float => 6,
            FieldType::Double => 7,
            FieldType::Byte => 8,
            FieldType::Short => 9,
            FieldType::Int => 10,
            FieldType::Long => 11,
        }
    }

    pub fn from_type_byte(byte: u8) -> Option<FieldType> {
        use strum::IntoEnumIterator;

        FieldType::iter().find(|t| t.type_byte() == byte)
    }

    /// Maps the first character of a JVM type signature (`I`, `[B`, `Ljava/lang/String;`, ...)
    pub fn from_signature(first_char: u8) -> Option<FieldType> {
        match first_char {
            b'L' | b'[' => Some(FieldType::Object),
            b'Z' => Some(FieldType::Boolean),
            b'C' => Some(FieldType::Char),
            b'F' => Some(FieldType::Float),
            b'D' => Some(FieldType::Double),
            b'B' => Some(FieldType::Byte),
            b'S' => Some(FieldType::Short),
            b'I' => Some(FieldType::Int),
            b'J' => Some(FieldType::Long),
            _ => None,
        }
    }

    /// Encoded width of one value of this type
    pub fn size_in_bytes(&self, id_size: IdSize) -> usize {
        match self {
            FieldType::Object => id_size.size_in_bytes(),
            FieldType::Boolean | FieldType::Byte => 1,
            FieldType::Char | FieldType::Short => 2,
            FieldType::Float | FieldType::Int => 4,
            FieldType::Double | FieldType::Long => 8,
        }
    }

    pub fn java_type_name(&self) -> &'static str {
        match self {
            FieldType::Object => "Object",
            FieldType::Boolean => "boolean",
            FieldType::Char => "char",
            FieldType::Float => "float",
            FieldType::Double => "double",
            FieldType::Byte => "byte",
            FieldType::Short => "short",
            FieldType::Int => "int",
            FieldType::Long => "long",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LineNum {
    Normal(u32),
    Unknown,
    CompiledMethod,
    NativeMethod,
}

impl LineNum {
    /// The signed value stored in FRAME records
    pub fn as_raw(&self) -> i32 {
        match self {
            LineNum::Normal(n) => *n as i32,
            LineNum::Unknown => -1,
            LineNum::CompiledMethod => -2,
            LineNum::NativeMethod => -3,
        }
    }

    pub fn from_raw(num: i32) -> Option<LineNum> {
        match num {
            num if num > 0 => Some(LineNum::Normal(num as u32)),
            // line 0 shows up for synthetic code; tools treat it as unknown too
            0 | -1 => Some(LineNum::Unknown),
            -2 => Some(LineNum::CompiledMethod),
            -3 => Some(LineNum::NativeMethod),
            _ => None,
        }
    }
}

impl fmt::Display for LineNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LineNum::Normal(n) => write!(f, "{}", n),
            LineNum::Unknown => write!(f, "Unknown"),
            LineNum::CompiledMethod => write!(f, "CompiledMethod"),
            LineNum::NativeMethod => write!(f, "NativeMethod"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn tag_bytes_round_trip() {
        for tag in RecordTag::iter() {
            assert_eq!(Some(tag), RecordTag::from_tag_byte(tag.tag_byte()));
        }
        for tag in SubRecordTag::iter() {
            assert_eq!(Some(tag), SubRecordTag::from_tag_byte(tag.tag_byte()));
        }
        for t in FieldType::iter() {
            assert_eq!(Some(t), FieldType::from_type_byte(t.type_byte()));
        }
    }

    #[test]
    fn format_constants_match_hprof() {
        assert_eq!(0x1C, RecordTag::HeapDumpSegment.tag_byte());
        assert_eq!(0x2C, RecordTag::HeapDumpEnd.tag_byte());
        assert_eq!(0xFF, SubRecordTag::RootUnknown.tag_byte());
        assert_eq!(0x23, SubRecordTag::PrimitiveArrayDump.tag_byte());
        assert_eq!(11, FieldType::Long.type_byte());
        assert_eq!(None, RecordTag::from_tag_byte(0x99));
    }

    #[test]
    fn signatures_map_to_types() {
        assert_eq!(Some(FieldType::Object), FieldType::from_signature(b'['));
        assert_eq!(Some(FieldType::Object), FieldType::from_signature(b'L'));
        assert_eq!(Some(FieldType::Long), FieldType::from_signature(b'J'));
        assert_eq!(None, FieldType::from_signature(b'V'));
        assert_eq!(4, FieldType::Object.size_in_bytes(IdSize::U32));
        assert_eq!(8, FieldType::Object.size_in_bytes(IdSize::U64));
    }

    #[test]
    fn line_num_raw_values() {
        assert_eq!(-3, LineNum::NativeMethod.as_raw());
        assert_eq!(Some(LineNum::Normal(17)), LineNum::from_raw(17));
        assert_eq!(Some(LineNum::CompiledMethod), LineNum::from_raw(-2));
        assert_eq!(None, LineNum::from_raw(-9));
    }
}
