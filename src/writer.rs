//! Serializes typed records into a sink.
//!
//! One writer owns one sink. Thread-specific records go through a current-tid
//! register: a thread-change marker is emitted only when the writing thread
//! differs from the last one, so the common single-threaded stream carries no
//! per-record tid at all. Python frame ids inside allocation records are
//! delta-encoded against the thread's previously written frame id.

use std::collections::HashMap;
use std::io::SeekFrom;

use recorder_errors::{usage, ErrorCode, RecorderResult};

use crate::io::RecordSink;
use crate::records::{
    AggregatedAllocation, AllocatorKind, CodeObjectInfo, FrameId, Header, ImageMappings,
    MemoryRecord, RecordTag, ThreadId,
};
use crate::wire;

pub struct RecordWriter {
    sink: Box<dyn RecordSink>,
    header: Header,
    scratch: Vec<u8>,
    current_tid: Option<ThreadId>,
    last_frame_by_tid: HashMap<ThreadId, FrameId>,
    /// Interned code objects, kept so a forked child's stream can be made
    /// self-contained.
    code_objects: Vec<(FrameId, CodeObjectInfo)>,
    latest_mappings: Option<ImageMappings>,
    next_native_frame: FrameId,
    record_count: u64,
    /// Set by the trailer: stragglers racing shutdown are dropped instead of
    /// landing after the trailer (or over the rewritten header).
    closed: bool,
}

impl RecordWriter {
    pub fn new(sink: Box<dyn RecordSink>, header: Header) -> Self {
        Self {
            sink,
            header,
            scratch: Vec::with_capacity(256),
            current_tid: None,
            last_frame_by_tid: HashMap::new(),
            code_objects: Vec::new(),
            latest_mappings: None,
            next_native_frame: 1,
            record_count: 0,
            closed: false,
        }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Write the header, optionally seeking back to the start of the stream
    /// first so the final main-tid/skipped-frames values land in place.
    pub fn write_header(&mut self, seek_to_start: bool) -> RecorderResult<()> {
        if seek_to_start {
            self.sink.seek(SeekFrom::Start(0))?;
        }
        self.scratch.clear();
        self.header.encode(&mut self.scratch);
        let scratch = std::mem::take(&mut self.scratch);
        let result = self.sink.write_all(&scratch);
        self.scratch = scratch;
        result
    }

    /// Record the fork split: the child stream begins at the given thread
    /// with this many frames missing below its reconstructed stack.
    pub fn set_main_tid_and_skipped_frames(&mut self, main_tid: ThreadId, skipped: u32) {
        self.header.main_tid = main_tid;
        self.header.skipped_frames_on_main_tid = skipped;
    }

    fn emit(&mut self) -> RecorderResult<()> {
        if self.closed {
            return Err(usage!(
                ErrorCode::SinkClosed,
                "record stream already carries its trailer"
            ));
        }
        let scratch = std::mem::take(&mut self.scratch);
        let result = self.sink.write_all(&scratch);
        self.scratch = scratch;
        self.record_count += 1;
        result
    }

    fn switch_thread(&mut self, tid: ThreadId) -> RecorderResult<()> {
        if self.current_tid == Some(tid) {
            return Ok(());
        }
        self.scratch.clear();
        self.scratch.push(RecordTag::ThreadChange as u8);
        wire::put_varint(&mut self.scratch, tid);
        self.emit()?;
        self.current_tid = Some(tid);
        Ok(())
    }

    pub fn write_allocation(
        &mut self,
        tid: ThreadId,
        allocator: AllocatorKind,
        address: u64,
        size: u64,
        native_frame_id: FrameId,
        frame_id: FrameId,
    ) -> RecorderResult<()> {
        self.switch_thread(tid)?;
        let last = self.last_frame_by_tid.entry(tid).or_insert(0);
        let delta = frame_id as i64 - *last as i64;
        *last = frame_id;
        self.scratch.clear();
        self.scratch.push(RecordTag::Allocation as u8);
        self.scratch.push(allocator as u8);
        wire::put_varint(&mut self.scratch, address);
        wire::put_varint(&mut self.scratch, size);
        wire::put_varint(&mut self.scratch, native_frame_id);
        wire::put_svarint(&mut self.scratch, delta);
        self.emit()
    }

    pub fn write_free(
        &mut self,
        tid: ThreadId,
        allocator: AllocatorKind,
        address: u64,
    ) -> RecorderResult<()> {
        debug_assert!(allocator.is_free());
        self.switch_thread(tid)?;
        self.scratch.clear();
        self.scratch.push(RecordTag::Free as u8);
        self.scratch.push(allocator as u8);
        wire::put_varint(&mut self.scratch, address);
        self.emit()
    }

    pub fn write_frame_push(&mut self, tid: ThreadId, frame_id: FrameId) -> RecorderResult<()> {
        self.switch_thread(tid)?;
        self.scratch.clear();
        self.scratch.push(RecordTag::FramePush as u8);
        wire::put_varint(&mut self.scratch, frame_id);
        self.emit()
    }

    /// Run-length pop: deep unwinds collapse into one record.
    pub fn write_frame_pop(&mut self, tid: ThreadId, count: u64) -> RecorderResult<()> {
        self.switch_thread(tid)?;
        self.scratch.clear();
        self.scratch.push(RecordTag::FramePop as u8);
        wire::put_varint(&mut self.scratch, count);
        self.emit()
    }

    pub fn write_code_object(
        &mut self,
        frame_id: FrameId,
        info: &CodeObjectInfo,
    ) -> RecorderResult<()> {
        self.scratch.clear();
        self.scratch.push(RecordTag::CodeObject as u8);
        wire::put_varint(&mut self.scratch, frame_id);
        wire::put_str(&mut self.scratch, &info.function_name);
        wire::put_str(&mut self.scratch, &info.filename);
        wire::put_varint(&mut self.scratch, u64::from(info.first_line_no));
        wire::put_bytes(&mut self.scratch, &info.line_table);
        self.emit()?;
        self.code_objects.push((frame_id, info.clone()));
        Ok(())
    }

    /// Intern one native stack, outermost first, returning the id of the
    /// innermost frame. Ids are edges of a parent-pointer trie; repeated
    /// stacks should be deduplicated by the caller before reaching here.
    pub fn write_native_stack(&mut self, frames: &[u64]) -> RecorderResult<FrameId> {
        let mut parent: FrameId = 0;
        for ip in frames {
            let id = self.next_native_frame;
            self.next_native_frame += 1;
            self.scratch.clear();
            self.scratch.push(RecordTag::NativeFrame as u8);
            wire::put_varint(&mut self.scratch, *ip);
            wire::put_varint(&mut self.scratch, parent);
            self.emit()?;
            parent = id;
        }
        Ok(parent)
    }

    pub fn write_mappings(&mut self, mappings: &ImageMappings) -> RecorderResult<()> {
        self.scratch.clear();
        self.scratch.push(RecordTag::Mappings as u8);
        wire::put_varint(&mut self.scratch, mappings.generation);
        wire::put_varint(&mut self.scratch, mappings.segments.len() as u64);
        for segment in &mappings.segments {
            wire::put_varint(&mut self.scratch, segment.start);
            wire::put_varint(&mut self.scratch, segment.end);
            wire::put_varint(&mut self.scratch, segment.file_offset);
            wire::put_str(&mut self.scratch, &segment.path);
        }
        self.emit()?;
        self.latest_mappings = Some(mappings.clone());
        Ok(())
    }

    pub fn write_memory_record(&mut self, record: MemoryRecord) -> RecorderResult<()> {
        self.write_memory(RecordTag::MemoryRecord, record)
    }

    pub fn write_memory_snapshot(&mut self, record: MemoryRecord) -> RecorderResult<()> {
        self.write_memory(RecordTag::MemorySnapshot, record)
    }

    fn write_memory(&mut self, tag: RecordTag, record: MemoryRecord) -> RecorderResult<()> {
        self.scratch.clear();
        self.scratch.push(tag as u8);
        wire::put_varint(&mut self.scratch, record.timestamp_ms);
        wire::put_varint(&mut self.scratch, record.rss_bytes);
        wire::put_varint(&mut self.scratch, record.heap_bytes);
        self.emit()
    }

    pub fn write_context_switch(&mut self, tid: ThreadId) -> RecorderResult<()> {
        self.scratch.clear();
        self.scratch.push(RecordTag::ContextSwitch as u8);
        wire::put_varint(&mut self.scratch, tid);
        self.emit()?;
        self.current_tid = Some(tid);
        Ok(())
    }

    pub fn write_aggregated_allocation(
        &mut self,
        entry: &AggregatedAllocation,
    ) -> RecorderResult<()> {
        self.scratch.clear();
        self.scratch.push(RecordTag::AggregatedAllocation as u8);
        wire::put_varint(&mut self.scratch, entry.tid);
        wire::put_varint(&mut self.scratch, entry.frame_id);
        wire::put_varint(&mut self.scratch, entry.native_frame_id);
        wire::put_varint(&mut self.scratch, entry.count);
        wire::put_varint(&mut self.scratch, entry.total_bytes);
        self.emit()
    }

    pub fn write_trailer(&mut self) -> RecorderResult<()> {
        self.closed = true;
        self.scratch.clear();
        self.scratch.push(RecordTag::Trailer as u8);
        wire::put_varint(&mut self.scratch, self.record_count);
        let scratch = std::mem::take(&mut self.scratch);
        let result = self.sink.write_all(&scratch);
        self.scratch = scratch;
        result
    }

    pub fn flush(&mut self) -> RecorderResult<()> {
        self.sink.flush()
    }

    /// Flush, compress if configured, and release the sink.
    pub fn finalize(&mut self) -> RecorderResult<()> {
        self.sink.finalize()
    }

    /// Build the writer the forked child continues with. The parent's sink
    /// is flushed first so no parent bytes straddle the fork; the child's
    /// stream then gets its own header, the latest image mappings and every
    /// interned code object, making it self-contained.
    pub fn clone_in_child_process(
        &mut self,
        child_pid: u64,
        child_tid: ThreadId,
        skipped_frames: u32,
    ) -> RecorderResult<RecordWriter> {
        self.flush()?;
        let sink = self.sink.clone_in_child_process()?;

        let mut header = self.header.clone();
        header.pid = child_pid;
        header.main_tid = child_tid;
        header.skipped_frames_on_main_tid = skipped_frames;

        // The child stream is self-contained: native-frame ids restart at 1
        // and the tracker's intern cache must be cleared alongside.
        let mut child = RecordWriter::new(sink, header);
        child.current_tid = Some(child_tid);
        child.write_header(false)?;
        if let Some(mappings) = self.latest_mappings.clone() {
            child.write_mappings(&mappings)?;
        }
        for (frame_id, info) in self.code_objects.clone() {
            child.write_code_object(frame_id, &info)?;
        }
        Ok(child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::test_support::VecSink;
    use crate::records::{CURRENT_VERSION, FileFormat, HeaderFlags};

    pub(crate) fn test_header() -> Header {
        Header {
            version: CURRENT_VERSION,
            flags: HeaderFlags::empty(),
            file_format: FileFormat::AllEvents,
            pid: 100,
            main_tid: 1,
            skipped_frames_on_main_tid: 0,
            command_line: "python test.py".to_string(),
            python_version: (3 << 16) | (12 << 8),
            native_traces_enabled: false,
            trace_python_allocators: false,
        }
    }

    #[test]
    fn thread_change_markers_are_elided_for_a_single_thread() {
        let (sink, data) = VecSink::new();
        let mut writer = RecordWriter::new(Box::new(sink), test_header());
        writer
            .write_allocation(7, AllocatorKind::Malloc, 0x1000, 64, 0, 0)
            .expect("write");
        writer
            .write_allocation(7, AllocatorKind::Malloc, 0x2000, 64, 0, 0)
            .expect("write");
        writer
            .write_allocation(8, AllocatorKind::Malloc, 0x3000, 64, 0, 0)
            .expect("write");

        let bytes = data.lock().expect("lock").clone();
        let changes = bytes
            .iter()
            .filter(|byte| **byte == RecordTag::ThreadChange as u8)
            .count();
        // Tag bytes can collide with payload bytes, so only assert the
        // lower bound holds and the first record is a thread change.
        assert!(changes >= 2);
        assert_eq!(bytes[0], RecordTag::ThreadChange as u8);
    }

    #[test]
    fn native_stack_interning_returns_the_innermost_edge() {
        let (sink, _data) = VecSink::new();
        let mut writer = RecordWriter::new(Box::new(sink), test_header());
        let first = writer.write_native_stack(&[0x10, 0x20]).expect("intern");
        let second = writer.write_native_stack(&[0x30]).expect("intern");
        assert_eq!(first, 2);
        assert_eq!(second, 3);
        assert_eq!(writer.write_native_stack(&[]).expect("intern"), 0);
    }

    #[test]
    fn header_rewrite_lands_at_stream_start() {
        let (sink, data) = VecSink::new();
        let mut writer = RecordWriter::new(Box::new(sink), test_header());
        writer.write_header(false).expect("header");
        writer
            .write_allocation(1, AllocatorKind::Malloc, 0x1000, 8, 0, 0)
            .expect("write");
        let len_before = data.lock().expect("lock").len();

        writer.set_main_tid_and_skipped_frames(9, 4);
        writer.write_header(true).expect("rewrite");

        let bytes = data.lock().expect("lock").clone();
        assert_eq!(bytes.len(), len_before);
        let decoded =
            Header::decode(&mut std::io::Cursor::new(bytes)).expect("decode");
        assert_eq!(decoded.main_tid, 9);
        assert_eq!(decoded.skipped_frames_on_main_tid, 4);
    }
}
