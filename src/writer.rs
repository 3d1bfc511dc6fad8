//! Buffered writer for hprof records.
//!
//! Heap dump sub-records are batched into `HEAP_DUMP_SEGMENT` records. A segment is kept
//! entirely in the buffer until it is finished, so its length can be patched in place before
//! the buffer is flushed. A sub-record too big for the buffer ("huge") gets a segment of its
//! own whose length is known up front; only such a segment may span several flushes.

use crate::compression::Compressor;
use crate::error::{DumpError, Result};
use crate::{Id, IdSize, RecordTag, SubRecordTag};
use std::io;
use std::io::{Read, Write};
use std::sync::Arc;

/// u1 tag, u4 micros, u4 length
pub const RECORD_HEADER_SIZE: usize = 9;
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;
pub const MIN_BUFFER_SIZE: usize = 64;

pub struct RecordWriter<W: Write> {
    sink: W,
    /// len() is the current position; never grows past `buffer_size`
    buffer: Vec<u8>,
    buffer_size: usize,
    id_size: IdSize,
    compressor: Option<Arc<dyn Compressor>>,
    compressed: Vec<u8>,
    bytes_written: u64,
    error: Option<DumpError>,
    in_segment: bool,
    huge_sub_record: bool,
    // only maintained with debug assertions
    sub_record_left: u64,
    sub_record_ended: bool,
}

impl<W: Write> RecordWriter<W> {
    pub fn new(
        sink: W,
        id_size: IdSize,
        buffer_size: usize,
        compressor: Option<Arc<dyn Compressor>>,
    ) -> RecordWriter<W> {
        let buffer_size = buffer_size.max(MIN_BUFFER_SIZE);
        let mut buffer = Vec::new();
        let error = buffer
            .try_reserve_exact(buffer_size)
            .err()
            .map(|_| DumpError::BufferAllocation { size: buffer_size });

        RecordWriter {
            sink,
            buffer,
            buffer_size,
            id_size,
            compressor,
            compressed: Vec::new(),
            bytes_written: 0,
            error,
            in_segment: false,
            huge_sub_record: false,
            sub_record_left: 0,
            sub_record_ended: true,
        }
    }

    pub fn id_size(&self) -> IdSize {
        self.id_size
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Bytes handed to the sink so far (after compression)
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn error(&self) -> Option<&DumpError> {
        self.error.as_ref()
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Latches `error` unless an earlier one is already latched. All later writes are dropped.
    pub fn set_error(&mut self, error: DumpError) {
        if self.error.is_none() {
            log::debug!("Heap dump writer failed: {}", error);
            self.error = Some(error);
        }
        self.buffer.clear();
    }

    pub fn position(&self) -> usize {
        self.buffer.len()
    }

    fn space(&self) -> usize {
        self.buffer_size - self.buffer.len()
    }

    pub fn write_raw(&mut self, mut bytes: &[u8]) {
        if self.error.is_some() {
            return;
        }
        self.account(bytes.len());

        while bytes.len() > self.space() {
            debug_assert!(
                !self.in_segment || self.huge_sub_record,
                "cannot overflow the buffer inside a non-huge sub-record"
            );
            let (head, tail) = bytes.split_at(self.space());
            self.buffer.extend_from_slice(head);
            self.flush_buffer();
            if self.error.is_some() {
                return;
            }
            bytes = tail;
        }

        self.buffer.extend_from_slice(bytes);
    }

    /// Values never straddle a flush: if the buffer can't hold them, flush first.
    fn write_fixed(&mut self, bytes: &[u8]) {
        if bytes.len() > self.space() {
            debug_assert!(!self.in_segment || self.huge_sub_record);
            self.flush_buffer();
        }
        self.write_raw(bytes);
    }

    pub fn write_u1(&mut self, v: u8) {
        self.write_fixed(&[v]);
    }

    pub fn write_u2(&mut self, v: u16) {
        self.write_fixed(&v.to_be_bytes());
    }

    pub fn write_u4(&mut self, v: u32) {
        self.write_fixed(&v.to_be_bytes());
    }

    pub fn write_u8(&mut self, v: u64) {
        self.write_fixed(&v.to_be_bytes());
    }

    pub fn write_id(&mut self, id: Id) {
        match self.id_size {
            IdSize::U32 => self.write_u4(id.id() as u32),
            IdSize::U64 => self.write_u8(id.id()),
        }
    }

    pub fn write_object_id(&mut self, obj: Id) {
        self.write_id(obj);
    }

    pub fn write_class_id(&mut self, class: Id) {
        self.write_id(class);
    }

    pub fn write_symbol_id(&mut self, symbol: Id) {
        self.write_id(symbol);
    }

    /// Starts a top-level record, closing any open heap dump segment first.
    pub fn write_header(&mut self, tag: RecordTag, len: u32) {
        self.finish_dump_segment();
        self.write_u1(tag.tag_byte());
        // micros since the header timestamp
        self.write_u4(0);
        self.write_u4(len);
    }

    /// Starts a sub-record of `len` bytes, tag byte included.
    pub fn start_sub_record(&mut self, tag: SubRecordTag, len: u32) {
        if self.error.is_some() {
            return;
        }

        if !self.in_segment {
            if !self.buffer.is_empty() {
                self.flush_buffer();
            }
            debug_assert!(self.buffer_size > RECORD_HEADER_SIZE);

            self.write_u1(RecordTag::HeapDumpSegment.tag_byte());
            self.write_u4(0);
            // patched when the segment is finished, unless this sub-record is huge: then it is
            // the only one in the segment and `len` is already the segment length
            self.write_u4(len);
            self.in_segment = true;
            self.huge_sub_record = len as usize > self.buffer_size - RECORD_HEADER_SIZE;
        } else if self.huge_sub_record || len as usize > self.space() {
            self.finish_dump_segment();
            self.start_sub_record(tag, len);
            return;
        }

        self.sub_record_left = u64::from(len);
        self.sub_record_ended = false;
        self.write_u1(tag.tag_byte());
    }

    pub fn end_sub_record(&mut self) {
        if self.error.is_some() {
            return;
        }
        debug_assert_eq!(
            0, self.sub_record_left,
            "sub-record not written completely"
        );
        debug_assert!(!self.sub_record_ended, "sub-record ended twice");
        self.sub_record_ended = true;
    }

    /// Patches the open segment's length (if it isn't huge) and flushes.
    pub fn finish_dump_segment(&mut self) {
        if !self.in_segment {
            return;
        }

        if self.huge_sub_record {
            self.huge_sub_record = false;
        } else if self.error.is_none() {
            debug_assert!(self.sub_record_ended, "sub-record must have ended");
            debug_assert!(
                self.buffer.len() > RECORD_HEADER_SIZE,
                "segment should have some content"
            );
            let len = (self.buffer.len() - RECORD_HEADER_SIZE) as u32;
            self.buffer[5..RECORD_HEADER_SIZE].copy_from_slice(&len.to_be_bytes());
        }

        self.in_segment = false;
        self.flush_buffer();
    }

    /// Ends any open segment and hands everything buffered to the sink.
    pub fn flush(&mut self) {
        self.finish_dump_segment();
        self.flush_buffer();
    }

    fn flush_buffer(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        if self.error.is_some() {
            self.buffer.clear();
            return;
        }

        let written = match self.compressor.as_ref() {
            Some(compressor) => {
                self.compressed.clear();
                match compressor.compress_append(&self.buffer, &mut self.compressed) {
                    Ok(()) => {
                        let len = self.compressed.len() as u64;
                        self.sink
                            .write_all(&self.compressed)
                            .map(|_| len)
                            .map_err(DumpError::from)
                    }
                    Err(e) => Err(e),
                }
            }
            None => {
                let len = self.buffer.len() as u64;
                self.sink
                    .write_all(&self.buffer)
                    .map(|_| len)
                    .map_err(DumpError::from)
            }
        };
        self.buffer.clear();

        match written {
            Ok(len) => self.bytes_written += len,
            Err(e) => self.set_error(e),
        }
    }

    /// Flushes all the way down to the sink. Returns total bytes written or the latched error.
    pub fn finish(&mut self) -> Result<u64> {
        self.flush();
        if self.error.is_none() {
            if let Err(e) = self.sink.flush() {
                self.set_error(e.into());
            }
        }

        match &self.error {
            Some(e) => Err(e.clone()),
            None => Ok(self.bytes_written),
        }
    }

    pub(crate) fn take_compressor(&mut self) -> Option<Arc<dyn Compressor>> {
        self.compressor.take()
    }

    pub(crate) fn set_compressor(&mut self, compressor: Option<Arc<dyn Compressor>>) {
        self.compressor = compressor;
    }

    /// Appends all of `source` directly to the sink, bypassing buffer and compressor.
    /// For File to File copies std uses copy_file_range/sendfile where the OS has them.
    pub fn copy_from<R: Read>(&mut self, source: &mut R) -> io::Result<u64> {
        debug_assert!(self.buffer.is_empty(), "flush before copying");
        let copied = io::copy(source, &mut self.sink)?;
        self.bytes_written += copied;

        Ok(copied)
    }

    pub fn get_ref(&self) -> &W {
        &self.sink
    }

    /// Flushes and returns the sink, discarding any latched error.
    pub fn into_inner(mut self) -> W {
        self.flush();
        self.sink
    }

    fn account(&mut self, len: usize) {
        if cfg!(debug_assertions) && !self.sub_record_ended {
            assert!(
                len as u64 <= self.sub_record_left,
                "sub-record overflow: writing {} bytes with {} declared bytes left",
                len,
                self.sub_record_left
            );
            self.sub_record_left -= len as u64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::GzipCompressor;
    use flate2::read::MultiGzDecoder;

    /// (tag, body) for each top-level record
    fn split_records(mut bytes: &[u8]) -> Vec<(u8, Vec<u8>)> {
        let mut records = Vec::new();
        while !bytes.is_empty() {
            let len = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) as usize;
            records.push((bytes[0], bytes[9..9 + len].to_vec()));
            bytes = &bytes[9 + len..];
        }
        records
    }

    fn write_unknown_root(writer: &mut RecordWriter<Vec<u8>>, id: u64) {
        writer.start_sub_record(SubRecordTag::RootUnknown, 1 + 4);
        writer.write_object_id(Id::new(id));
        writer.end_sub_record();
    }

    #[test]
    fn primitives_are_big_endian() {
        let mut writer = RecordWriter::new(Vec::new(), IdSize::U32, 64, None);
        writer.write_u1(0xAB);
        writer.write_u2(0x0102);
        writer.write_u4(0x0304_0506);
        writer.write_u8(0x0708_090A_0B0C_0D0E);
        writer.write_id(Id::new(0xDEAD_BEEF));

        assert_eq!(
            vec![
                0xAB, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D,
                0x0E, 0xDE, 0xAD, 0xBE, 0xEF
            ],
            writer.into_inner()
        );
    }

    #[test]
    fn wide_ids_use_eight_bytes() {
        let mut writer = RecordWriter::new(Vec::new(), IdSize::U64, 64, None);
        writer.write_class_id(Id::new(0x1234));

        assert_eq!(vec![0, 0, 0, 0, 0, 0, 0x12, 0x34], writer.into_inner());
    }

    #[test]
    fn segment_length_is_patched() {
        let mut writer = RecordWriter::new(Vec::new(), IdSize::U32, 64, None);
        write_unknown_root(&mut writer, 1);
        write_unknown_root(&mut writer, 2);
        writer.finish().unwrap();

        let records = split_records(writer.get_ref());
        assert_eq!(1, records.len());
        assert_eq!(0x1C, records[0].0);
        assert_eq!(
            vec![0xFF, 0, 0, 0, 1, 0xFF, 0, 0, 0, 2],
            records[0].1
        );
    }

    #[test]
    fn full_segment_starts_another() {
        // 9 byte header + 11 * 5 byte roots = 64
        let mut writer = RecordWriter::new(Vec::new(), IdSize::U32, 64, None);
        for id in 0..12 {
            write_unknown_root(&mut writer, id + 1);
        }
        writer.finish().unwrap();

        let records = split_records(writer.get_ref());
        assert_eq!(2, records.len());
        assert_eq!(55, records[0].1.len());
        assert_eq!(5, records[1].1.len());
        assert_eq!(vec![0xFF, 0, 0, 0, 12], records[1].1);
    }

    #[test]
    fn huge_sub_record_gets_own_segment() {
        let mut writer = RecordWriter::new(Vec::new(), IdSize::U32, 64, None);
        write_unknown_root(&mut writer, 7);

        let payload = (0..200_u32).map(|n| n as u8).collect::<Vec<_>>();
        writer.start_sub_record(SubRecordTag::PrimitiveArrayDump, 1 + payload.len() as u32);
        writer.write_raw(&payload);
        writer.end_sub_record();

        write_unknown_root(&mut writer, 8);
        writer.finish().unwrap();

        let records = split_records(writer.get_ref());
        assert_eq!(3, records.len());
        assert_eq!(5, records[0].1.len());
        assert_eq!(201, records[1].1.len());
        assert_eq!(0x23, records[1].1[0]);
        assert_eq!(&payload[..], &records[1].1[1..]);
        assert_eq!(vec![0xFF, 0, 0, 0, 8], records[2].1);
    }

    #[test]
    fn top_level_record_closes_segment() {
        let mut writer = RecordWriter::new(Vec::new(), IdSize::U32, 64, None);
        write_unknown_root(&mut writer, 3);
        writer.write_header(RecordTag::StackTrace, 12);
        writer.write_u4(1);
        writer.write_u4(0);
        writer.write_u4(0);
        writer.finish().unwrap();

        let records = split_records(writer.get_ref());
        assert_eq!(vec![0x1C, 0x05], records.iter().map(|r| r.0).collect::<Vec<_>>());
    }

    #[test]
    fn large_top_level_record_spans_flushes() {
        let mut writer = RecordWriter::new(Vec::new(), IdSize::U32, 64, None);
        let text = vec![b'x'; 500];
        writer.write_header(RecordTag::Utf8, 4 + text.len() as u32);
        writer.write_symbol_id(Id::new(9));
        writer.write_raw(&text);
        let written = writer.finish().unwrap();

        assert_eq!(9 + 4 + 500, written);
        assert_eq!(vec![(0x01, [&[0, 0, 0, 9][..], &text[..]].concat())], split_records(writer.get_ref()));
    }

    #[test]
    fn compressed_output_decodes_to_plain_output() {
        let gzip: Arc<dyn Compressor> = Arc::new(GzipCompressor::new(1));
        let mut plain = RecordWriter::new(Vec::new(), IdSize::U64, 128, None);
        let mut compressed = RecordWriter::new(Vec::new(), IdSize::U64, 128, Some(gzip));
        for writer in [&mut plain, &mut compressed].iter_mut() {
            for id in 0..100 {
                writer.start_sub_record(SubRecordTag::RootStickyClass, 1 + 8);
                writer.write_class_id(Id::new(id));
                writer.end_sub_record();
            }
            writer.finish().unwrap();
        }

        let mut decoded = Vec::new();
        MultiGzDecoder::new(&compressed.get_ref()[..])
            .read_to_end(&mut decoded)
            .unwrap();

        assert_eq!(plain.get_ref(), &decoded);
    }

    /// Accepts `limit` bytes, then fails every write
    struct FailingSink {
        written: Vec<u8>,
        limit: usize,
    }

    impl Write for FailingSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.written.len() + buf.len() > self.limit {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn first_error_is_latched_and_later_writes_dropped() {
        let sink = FailingSink {
            written: Vec::new(),
            limit: 64,
        };
        let mut writer = RecordWriter::new(sink, IdSize::U32, 64, None);
        for id in 0..40 {
            writer.start_sub_record(SubRecordTag::RootUnknown, 1 + 4);
            writer.write_object_id(Id::new(id));
            writer.end_sub_record();
        }

        assert!(writer.has_error());
        assert_eq!(64, writer.bytes_written());

        writer.write_header(RecordTag::HeapDumpEnd, 0);
        let err = writer.finish().unwrap_err();
        assert_eq!("I/O error: disk full", err.to_string());
        assert_eq!(64, writer.get_ref().written.len());
    }

    #[derive(Debug)]
    struct BrokenCompressor;

    impl Compressor for BrokenCompressor {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn compress_append(&self, _data: &[u8], _output: &mut Vec<u8>) -> Result<()> {
            Err(DumpError::Compression("out of memory".to_string()))
        }
    }

    #[test]
    fn compression_failure_is_latched() {
        let mut writer =
            RecordWriter::new(Vec::new(), IdSize::U32, 64, Some(Arc::new(BrokenCompressor)));
        for id in 0..40 {
            write_unknown_root(&mut writer, id + 1);
        }
        assert!(matches!(writer.error(), Some(DumpError::Compression(_))));

        writer.write_header(RecordTag::HeapDumpEnd, 0);
        let err = writer.finish().unwrap_err();

        assert_eq!("compression error: out of memory", err.to_string());
        assert_eq!(0, writer.bytes_written());
        assert!(writer.get_ref().is_empty());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "sub-record not written completely")]
    fn short_sub_record_panics_in_debug() {
        let mut writer = RecordWriter::new(Vec::new(), IdSize::U32, 64, None);
        writer.start_sub_record(SubRecordTag::RootUnknown, 1 + 4);
        writer.write_u2(1);
        writer.end_sub_record();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "sub-record overflow")]
    fn overlong_sub_record_panics_in_debug() {
        let mut writer = RecordWriter::new(Vec::new(), IdSize::U32, 64, None);
        writer.start_sub_record(SubRecordTag::RootUnknown, 1 + 4);
        writer.write_object_id(Id::new(1));
        writer.write_u1(0);
    }

    #[test]
    fn later_errors_do_not_replace_first() {
        let mut writer = RecordWriter::new(Vec::new(), IdSize::U32, 64, None);
        writer.set_error(DumpError::Compression("first".to_string()));
        writer.set_error(DumpError::Internal("second".to_string()));

        assert_eq!("compression error: first", writer.error().unwrap().to_string());
    }
}
