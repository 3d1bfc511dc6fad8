//! Parses the files the dumper produces, so that output can be checked record by record.
//!
//! Only the records and sub-records this crate writes are understood in detail; any other
//! top-level record is still framed and exposed with its raw body.

use crate::{Id, IdSize, LineNum, RecordTag, Serial};
use getset::CopyGetters;
use nom::bytes::complete as bytes;
use nom::number::complete as number;
use std::fmt;
use std::fmt::Formatter;

mod parsing_iterator;
pub mod sub_record;

use parsing_iterator::*;
pub use sub_record::SubRecord;

pub type ParseResult<'e, T> = Result<T, nom::Err<(&'e [u8], nom::error::ErrorKind)>>;

/// A recoverable nom error pointing at `input`
fn fail<T>(input: &[u8], kind: nom::error::ErrorKind) -> nom::IResult<&[u8], T> {
    Err(nom::Err::Error((input, kind)))
}

pub(crate) fn parse_id(input: &[u8], id_size: IdSize) -> nom::IResult<&[u8], Id> {
    let (input, id) = match id_size {
        IdSize::U32 => number::be_u32(input).map(|(i, id)| (i, id as u64))?,
        IdSize::U64 => number::be_u64(input)?,
    };

    Ok((input, Id::from(id)))
}

/// Null ids become None
pub(crate) fn parse_optional_id(input: &[u8], id_size: IdSize) -> nom::IResult<&[u8], Option<Id>> {
    let (input, id) = parse_id(input, id_size)?;
    Ok((input, if id.is_null() { None } else { Some(id) }))
}

impl StatelessParserWithId for Id {
    fn parse(input: &[u8], id_size: IdSize) -> nom::IResult<&[u8], Self> {
        parse_id(input, id_size)
    }
}

#[derive(CopyGetters)]
pub struct Hprof<'a> {
    #[get_copy = "pub"]
    header: Header<'a>,
    records: &'a [u8],
}

impl<'a> Hprof<'a> {
    pub fn records_iter(&self) -> Records<'a> {
        parse_records(self.records, self.header.id_size)
    }
}

pub fn parse_hprof(input: &[u8]) -> ParseResult<Hprof> {
    let (input, header) = Header::parse(input)?;

    Ok(Hprof {
        header,
        records: input,
    })
}

/// Top-level records of `input`, which must start at a record boundary (i.e. after the header)
pub fn parse_records(input: &[u8], id_size: IdSize) -> Records {
    Records {
        remaining: input,
        id_size,
    }
}

/// Sub-records of one heap dump segment body
pub fn parse_sub_records(input: &[u8], id_size: IdSize) -> SubRecords {
    SubRecords {
        id_size,
        remaining: input,
    }
}

#[derive(CopyGetters, Copy, Clone)]
pub struct Header<'a> {
    label: &'a [u8],
    #[get_copy = "pub"]
    id_size: IdSize,
    /// Millis since epoch
    #[get_copy = "pub"]
    timestamp_millis: u64,
}

impl<'a> Header<'a> {
    pub fn label(&self) -> Result<&'a str, std::str::Utf8Error> {
        std::str::from_utf8(self.label)
    }

    /// Bytes the header occupies at the start of the file
    pub fn encoded_len(&self) -> usize {
        self.label.len() + 1 + 3 * 4
    }

    fn parse(input: &[u8]) -> nom::IResult<&[u8], Header> {
        let (input, label) = bytes::take_until(&b"\0"[..])(input)?;
        let (input, _) = bytes::tag(&b"\0"[..])(input)?;

        let (rest, id_size_num) = number::be_u32(input)?;
        let id_size = match IdSize::from_size_in_bytes(id_size_num) {
            Some(s) => s,
            None => return fail(input, nom::error::ErrorKind::Verify),
        };
        let (rest, epoch_hi) = number::be_u32(rest)?;
        let (rest, epoch_lo) = number::be_u32(rest)?;

        Ok((
            rest,
            Header {
                label,
                id_size,
                timestamp_millis: ((epoch_hi as u64) << 32) + (epoch_lo as u64),
            },
        ))
    }
}

impl<'a> fmt::Debug for Header<'a> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("label", &self.label())
            .field("timestamp_millis", &self.timestamp_millis())
            .field("id_size", &self.id_size())
            .finish()
    }
}

pub struct Records<'a> {
    remaining: &'a [u8],
    id_size: IdSize,
}

impl<'a> Iterator for Records<'a> {
    type Item = ParseResult<'a, Record<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining.is_empty() {
            return None;
        }

        match Record::parse(self.remaining, self.id_size) {
            Ok((input, record)) => {
                self.remaining = input;
                Some(Ok(record))
            }
            Err(e) => {
                // no way to resynchronize after a bad record
                self.remaining = &[];
                Some(Err(e))
            }
        }
    }
}

#[derive(CopyGetters, Copy, Clone)]
pub struct Record<'a> {
    #[get_copy = "pub"]
    tag: RecordTag,
    #[get_copy = "pub"]
    micros_since_header_ts: u32,
    id_size: IdSize,
    #[get_copy = "pub"]
    body: &'a [u8],
}

impl<'a> Record<'a> {
    /// Declared body length
    pub fn len(&self) -> u32 {
        self.body.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    pub fn as_utf_8(&self) -> Option<ParseResult<'a, Utf8<'a>>> {
        match self.tag {
            RecordTag::Utf8 => Some(Utf8::parse(self.body, self.id_size)),
            _ => None,
        }
    }

    pub fn as_load_class(&self) -> Option<ParseResult<'a, LoadClass>> {
        match self.tag {
            RecordTag::LoadClass => Some(LoadClass::parse(self.body, self.id_size)),
            _ => None,
        }
    }

    pub fn as_stack_frame(&self) -> Option<ParseResult<'a, StackFrame>> {
        match self.tag {
            RecordTag::StackFrame => Some(StackFrame::parse(self.body, self.id_size)),
            _ => None,
        }
    }

    pub fn as_stack_trace(&self) -> Option<ParseResult<'a, StackTrace<'a>>> {
        match self.tag {
            RecordTag::StackTrace => Some(StackTrace::parse(self.body, self.id_size)),
            _ => None,
        }
    }

    pub fn as_heap_dump_segment(&self) -> Option<HeapDumpSegment<'a>> {
        match self.tag {
            RecordTag::HeapDump | RecordTag::HeapDumpSegment => Some(HeapDumpSegment {
                id_size: self.id_size,
                records: self.body,
            }),
            _ => None,
        }
    }

    fn parse(input: &[u8], id_size: IdSize) -> nom::IResult<&[u8], Record> {
        let (rest, tag_byte) = number::be_u8(input)?;
        let tag = match RecordTag::from_tag_byte(tag_byte) {
            Some(tag) => tag,
            None => return fail(input, nom::error::ErrorKind::Tag),
        };

        let (rest, micros) = number::be_u32(rest)?;
        let (rest, len) = number::be_u32(rest)?;
        let (rest, body) = bytes::take(len)(rest)?;

        Ok((
            rest,
            Record {
                tag,
                micros_since_header_ts: micros,
                id_size,
                body,
            },
        ))
    }
}

#[derive(CopyGetters, Copy, Clone)]
pub struct Utf8<'a> {
    #[get_copy = "pub"]
    name_id: Id,
    #[get_copy = "pub"]
    text: &'a [u8],
}

impl<'a> Utf8<'a> {
    fn parse(input: &[u8], id_size: IdSize) -> ParseResult<Utf8> {
        let (input, id) = parse_id(input, id_size)?;

        Ok(Utf8 {
            name_id: id,
            text: input,
        })
    }

    pub fn text_as_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(self.text)
    }
}

#[derive(CopyGetters, Copy, Clone, Debug)]
pub struct LoadClass {
    #[get_copy = "pub"]
    class_serial: Serial,
    #[get_copy = "pub"]
    class_obj_id: Id,
    #[get_copy = "pub"]
    stack_trace_serial: Serial,
    #[get_copy = "pub"]
    class_name_id: Id,
}

impl LoadClass {
    fn parse(input: &[u8], id_size: IdSize) -> ParseResult<LoadClass> {
        let (input, class_serial) = number::be_u32(input)?;
        let (input, class_obj_id) = parse_id(input, id_size)?;
        let (input, stack_trace_serial) = number::be_u32(input)?;
        let (_input, class_name_id) = parse_id(input, id_size)?;

        Ok(LoadClass {
            class_serial,
            class_obj_id,
            stack_trace_serial,
            class_name_id,
        })
    }
}

#[derive(CopyGetters, Copy, Clone, Debug)]
pub struct StackFrame {
    #[get_copy = "pub"]
    id: Id,
    #[get_copy = "pub"]
    method_name_id: Id,
    #[get_copy = "pub"]
    method_signature_id: Id,
    #[get_copy = "pub"]
    source_file_name_id: Option<Id>,
    /// 0 if the declaring class has no LOAD_CLASS record
    #[get_copy = "pub"]
    class_serial: Serial,
    #[get_copy = "pub"]
    line_num: LineNum,
}

impl StackFrame {
    fn parse(input: &[u8], id_size: IdSize) -> ParseResult<Self> {
        let (input, id) = parse_id(input, id_size)?;
        let (input, method_name_id) = parse_id(input, id_size)?;
        let (input, method_signature_id) = parse_id(input, id_size)?;
        let (input, source_file_name_id) = parse_optional_id(input, id_size)?;
        let (input, class_serial) = number::be_u32(input)?;
        let (_rest, raw_line) = number::be_i32(input)?;
        let line_num = match LineNum::from_raw(raw_line) {
            Some(l) => l,
            None => return Err(nom::Err::Error((input, nom::error::ErrorKind::Verify))),
        };

        Ok(StackFrame {
            id,
            method_name_id,
            method_signature_id,
            source_file_name_id,
            class_serial,
            line_num,
        })
    }
}

#[derive(CopyGetters, Clone, Debug)]
pub struct StackTrace<'a> {
    id_size: IdSize,
    #[get_copy = "pub"]
    stack_trace_serial: Serial,
    #[get_copy = "pub"]
    thread_serial: Serial,
    #[get_copy = "pub"]
    num_frame_ids: u32,
    frame_ids: &'a [u8],
}

impl<'a> StackTrace<'a> {
    fn parse(input: &[u8], id_size: IdSize) -> ParseResult<StackTrace> {
        let (input, stack_trace_serial) = number::be_u32(input)?;
        let (input, thread_serial) = number::be_u32(input)?;
        let (input, num_frame_ids) = number::be_u32(input)?;

        Ok(StackTrace {
            id_size,
            stack_trace_serial,
            thread_serial,
            num_frame_ids,
            frame_ids: input,
        })
    }

    pub fn frame_ids(&self) -> Ids<'a> {
        Ids {
            iter: ParsingIterator::new_stateless_id_size(
                self.id_size,
                self.frame_ids,
                self.num_frame_ids,
            ),
        }
    }
}

/// Either a HPROF_HEAP_DUMP or HPROF_HEAP_DUMP_SEGMENT
pub struct HeapDumpSegment<'a> {
    id_size: IdSize,
    records: &'a [u8],
}

impl<'a> HeapDumpSegment<'a> {
    pub fn sub_records(&self) -> SubRecords<'a> {
        parse_sub_records(self.records, self.id_size)
    }
}

pub struct SubRecords<'a> {
    id_size: IdSize,
    remaining: &'a [u8],
}

impl<'a> Iterator for SubRecords<'a> {
    type Item = ParseResult<'a, SubRecord<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining.is_empty() {
            return None;
        }

        match SubRecord::parse(self.remaining, self.id_size) {
            Ok((input, record)) => {
                self.remaining = input;
                Some(Ok(record))
            }
            Err(e) => {
                self.remaining = &[];
                Some(Err(e))
            }
        }
    }
}

pub struct Ids<'a> {
    iter: ParsingIterator<'a, Id, IdSizeParserWrapper<Id>>,
}

impl<'a> Iterator for Ids<'a> {
    type Item = ParseResult<'a, Id>;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next()
    }
}
