//! Streaming parser for capture streams.
//!
//! The reader mirrors the writer's registers (current tid, per-thread frame
//! delta) and replays the bookkeeping records internally (frame pushes and
//! pops, code object interning, thread changes, image mappings, native-frame
//! edges), surfacing only the records a consumer aggregates over.
//!
//! Replay errors are terminal: the first malformed record flips the reader
//! into a failed state and every later call reports the same error.

use std::collections::HashMap;
use std::io::Read;

use recorder_errors::{target, ErrorCode, RecorderError, RecorderResult};

use crate::io::RecordSource;
use crate::linetable;
use crate::records::{
    AggregatedAllocation, Allocation, AllocatorKind, CodeObjectInfo, FrameId, Header,
    ImageMappings, MemoryRecord, RecordTag, ThreadId, UnresolvedNativeFrame, MAX_STRING_LEN,
};
use crate::wire;

/// What [`RecordReader::next_record`] surfaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordView {
    Allocation(Allocation),
    AggregatedAllocation(AggregatedAllocation),
    MemoryRecord(MemoryRecord),
    MemorySnapshot(MemoryRecord),
    EndOfFile,
}

/// A materialized Python frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub function: String,
    pub filename: String,
    pub line: u32,
}

/// A native frame resolved against the image mappings timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedNativeFrame {
    pub instruction_pointer: u64,
    /// `path+0xOFFSET`, or `??` when no image covers the address.
    pub location: String,
}

enum ReaderState {
    Active,
    Finished,
    Failed { code: ErrorCode, message: String },
}

struct Counted<S> {
    inner: S,
    offset: u64,
}

impl<S: Read> Read for Counted<S> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.offset += n as u64;
        Ok(n)
    }
}

impl<S: RecordSource> RecordSource for Counted<S> {
    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn close(&mut self) {
        self.inner.close()
    }
}

pub struct RecordReader<S: RecordSource> {
    source: Counted<S>,
    header: Header,
    state: ReaderState,
    current_tid: ThreadId,
    stacks: HashMap<ThreadId, Vec<FrameId>>,
    last_frame_by_tid: HashMap<ThreadId, FrameId>,
    code_objects: HashMap<FrameId, CodeObjectInfo>,
    mappings_timeline: Vec<ImageMappings>,
    /// Parent-pointer trie: id → (ip, parent, generation at intern time).
    native_frames: Vec<(u64, FrameId, u64)>,
    latest_memory: Option<MemoryRecord>,
    records_seen: u64,
    /// Pops allowed past an empty main-thread stack: frames that existed
    /// before the stream began, counted in the header.
    skipped_frames_budget: u32,
}

impl<S: RecordSource> RecordReader<S> {
    pub fn new(source: S) -> RecorderResult<Self> {
        let mut source = Counted { inner: source, offset: 0 };
        let header = Header::decode(&mut source)?;
        let skipped_frames_budget = header.skipped_frames_on_main_tid;
        Ok(Self {
            source,
            header,
            state: ReaderState::Active,
            current_tid: 0,
            stacks: HashMap::new(),
            last_frame_by_tid: HashMap::new(),
            code_objects: HashMap::new(),
            mappings_timeline: Vec::new(),
            native_frames: Vec::new(),
            latest_memory: None,
            records_seen: 0,
            skipped_frames_budget,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Last memory record parsed, for pull-style clients.
    pub fn latest_memory_record(&self) -> Option<MemoryRecord> {
        self.latest_memory
    }

    fn fail<T>(&mut self, err: RecorderError) -> RecorderResult<T> {
        let err = err.with_context("stream_offset", self.source.offset.to_string());
        self.state = ReaderState::Failed {
            code: err.code,
            message: err.to_string(),
        };
        Err(err)
    }

    pub fn next_record(&mut self) -> RecorderResult<RecordView> {
        match &self.state {
            ReaderState::Active => {}
            ReaderState::Finished => return Ok(RecordView::EndOfFile),
            ReaderState::Failed { code, message } => {
                return Err(target!(*code, "{}", message.clone()))
            }
        }
        loop {
            let mut tag_byte = [0u8; 1];
            if !self.source.read_exact_buf(&mut tag_byte) {
                self.state = ReaderState::Finished;
                return Ok(RecordView::EndOfFile);
            }
            let Some(tag) = RecordTag::from_u8(tag_byte[0]) else {
                let err = target!(
                    ErrorCode::TruncatedRecord,
                    "unknown record tag 0x{:02x}",
                    tag_byte[0]
                );
                return self.fail(err);
            };
            match self.parse_record(tag) {
                Ok(Some(view)) => return Ok(view),
                Ok(None) => continue,
                Err(err) => return self.fail(err),
            }
        }
    }

    fn parse_record(&mut self, tag: RecordTag) -> RecorderResult<Option<RecordView>> {
        self.records_seen += 1;
        let source = &mut self.source;
        match tag {
            RecordTag::Allocation => {
                let allocator = parse_allocator(wire_u8(source)?)?;
                let address = wire::get_varint(source)?;
                let size = wire::get_varint(source)?;
                let native_frame_id = wire::get_varint(source)?;
                let delta = wire::get_svarint(source)?;
                let last = self.last_frame_by_tid.entry(self.current_tid).or_insert(0);
                let frame_id = (*last as i64 + delta) as FrameId;
                *last = frame_id;
                Ok(Some(RecordView::Allocation(Allocation {
                    tid: self.current_tid,
                    address,
                    size,
                    allocator,
                    native_frame_id,
                    frame_id,
                })))
            }
            RecordTag::Free => {
                let allocator = parse_allocator(wire_u8(source)?)?;
                let address = wire::get_varint(source)?;
                Ok(Some(RecordView::Allocation(Allocation {
                    tid: self.current_tid,
                    address,
                    size: 0,
                    allocator,
                    native_frame_id: 0,
                    frame_id: 0,
                })))
            }
            RecordTag::FramePush => {
                let frame_id = wire::get_varint(source)?;
                self.stacks
                    .entry(self.current_tid)
                    .or_default()
                    .push(frame_id);
                Ok(None)
            }
            RecordTag::FramePop => {
                let count = wire::get_varint(source)?;
                let on_main_tid = self.current_tid == self.header.main_tid;
                let stack = self.stacks.entry(self.current_tid).or_default();
                if (stack.len() as u64) < count {
                    let deficit = (count - stack.len() as u64) as u32;
                    // The main thread may unwind frames that predate the
                    // stream, up to the header's skipped-frames count.
                    if !on_main_tid || self.skipped_frames_budget < deficit {
                        return Err(target!(
                            ErrorCode::TruncatedRecord,
                            "frame pop of {} underflows a stack of depth {}",
                            count,
                            stack.len()
                        ));
                    }
                    self.skipped_frames_budget -= deficit;
                    stack.clear();
                } else {
                    stack.truncate(stack.len() - count as usize);
                }
                Ok(None)
            }
            RecordTag::CodeObject => {
                let frame_id = wire::get_varint(source)?;
                let function_name = wire::get_str(source, MAX_STRING_LEN)?;
                let filename = wire::get_str(source, MAX_STRING_LEN)?;
                let first_line_no = wire::get_varint(source)? as u32;
                let line_table = wire::get_bytes(source, MAX_STRING_LEN)?;
                self.code_objects.entry(frame_id).or_insert(CodeObjectInfo {
                    function_name,
                    filename,
                    first_line_no,
                    line_table,
                });
                Ok(None)
            }
            RecordTag::ThreadChange | RecordTag::ContextSwitch => {
                self.current_tid = wire::get_varint(source)?;
                Ok(None)
            }
            RecordTag::MemoryRecord => {
                let record = parse_memory(source)?;
                self.latest_memory = Some(record);
                Ok(Some(RecordView::MemoryRecord(record)))
            }
            RecordTag::MemorySnapshot => {
                let record = parse_memory(source)?;
                Ok(Some(RecordView::MemorySnapshot(record)))
            }
            RecordTag::Mappings => {
                let generation = wire::get_varint(source)?;
                let count = wire::get_varint(source)? as usize;
                let mut segments = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    segments.push(crate::records::ImageSegment {
                        start: wire::get_varint(source)?,
                        end: wire::get_varint(source)?,
                        file_offset: wire::get_varint(source)?,
                        path: wire::get_str(source, MAX_STRING_LEN)?,
                    });
                }
                if let Some(last) = self.mappings_timeline.last() {
                    if generation < last.generation {
                        return Err(target!(
                            ErrorCode::TruncatedRecord,
                            "image generation went backwards ({} after {})",
                            generation,
                            last.generation
                        ));
                    }
                }
                self.mappings_timeline
                    .push(ImageMappings { generation, segments });
                Ok(None)
            }
            RecordTag::NativeFrame => {
                let ip = wire::get_varint(source)?;
                let parent = wire::get_varint(source)?;
                let generation = self
                    .mappings_timeline
                    .last()
                    .map(|m| m.generation)
                    .unwrap_or(0);
                self.native_frames.push((ip, parent, generation));
                Ok(None)
            }
            RecordTag::AggregatedAllocation => {
                Ok(Some(RecordView::AggregatedAllocation(AggregatedAllocation {
                    tid: wire::get_varint(source)?,
                    frame_id: wire::get_varint(source)?,
                    native_frame_id: wire::get_varint(source)?,
                    count: wire::get_varint(source)?,
                    total_bytes: wire::get_varint(source)?,
                })))
            }
            RecordTag::Trailer => {
                // The trailer itself is not counted by the writer.
                self.records_seen -= 1;
                let expected = wire::get_varint(source)?;
                if expected != self.records_seen {
                    return Err(target!(
                        ErrorCode::TruncatedRecord,
                        "trailer expects {} records but {} were read",
                        expected,
                        self.records_seen
                    ));
                }
                Ok(None)
            }
        }
    }

    /// Depth of the reconstructed Python stack for a thread.
    pub fn stack_depth(&self, tid: ThreadId) -> usize {
        self.stacks.get(&tid).map(Vec::len).unwrap_or(0)
    }

    /// Materialize up to `max` frames of a thread's stack, innermost first.
    /// Line numbers come from the interpreter's location table, falling back
    /// to the function's first line for artificial ranges.
    pub fn python_stack_for(&self, tid: ThreadId, max: usize) -> Vec<StackFrame> {
        let Some(stack) = self.stacks.get(&tid) else {
            return Vec::new();
        };
        stack
            .iter()
            .rev()
            .take(max)
            .map(|frame_id| self.materialize_frame(*frame_id))
            .collect()
    }

    fn materialize_frame(&self, frame_id: FrameId) -> StackFrame {
        match self.code_objects.get(&frame_id) {
            Some(info) => StackFrame {
                line: linetable::line_for_offset(&info.line_table, info.first_line_no, 0)
                    .unwrap_or(info.first_line_no),
                function: info.function_name.clone(),
                filename: info.filename.clone(),
            },
            None => StackFrame {
                function: "<unknown>".to_string(),
                filename: "<unknown>".to_string(),
                line: 0,
            },
        }
    }

    /// Walk the native-frame trie from `native_frame_id`, innermost first,
    /// without touching the mappings timeline.
    pub fn unresolved_native_stack(
        &self,
        native_frame_id: FrameId,
        max: usize,
    ) -> Vec<UnresolvedNativeFrame> {
        let mut frames = Vec::new();
        let mut current = native_frame_id;
        while current != 0 && frames.len() < max {
            let Some((ip, parent, generation)) =
                self.native_frames.get((current - 1) as usize).copied()
            else {
                break;
            };
            frames.push(UnresolvedNativeFrame {
                instruction_pointer: ip,
                image_generation: generation,
            });
            current = parent;
        }
        frames
    }

    /// Like [`RecordReader::unresolved_native_stack`], but resolving each
    /// instruction pointer against the mappings generation captured when the
    /// frame was interned.
    pub fn native_stack_for(&self, native_frame_id: FrameId, max: usize) -> Vec<ResolvedNativeFrame> {
        self.unresolved_native_stack(native_frame_id, max)
            .into_iter()
            .map(|frame| ResolvedNativeFrame {
                instruction_pointer: frame.instruction_pointer,
                location: self.resolve_ip(frame.instruction_pointer, frame.image_generation),
            })
            .collect()
    }

    fn resolve_ip(&self, ip: u64, generation: u64) -> String {
        // Latest mappings snapshot at or before the requested generation.
        let index = self
            .mappings_timeline
            .partition_point(|m| m.generation <= generation);
        let Some(mappings) = index.checked_sub(1).and_then(|i| self.mappings_timeline.get(i))
        else {
            return "??".to_string();
        };
        for segment in &mappings.segments {
            if ip >= segment.start && ip < segment.end {
                return format!(
                    "{}+0x{:x}",
                    segment.path,
                    ip - segment.start + segment.file_offset
                );
            }
        }
        "??".to_string()
    }
}

fn wire_u8(reader: &mut impl Read) -> RecorderResult<u8> {
    let mut byte = [0u8; 1];
    reader.read_exact(&mut byte).map_err(|err| {
        target!(ErrorCode::TruncatedRecord, "stream ended in record: {}", err)
    })?;
    Ok(byte[0])
}

fn parse_allocator(value: u8) -> RecorderResult<AllocatorKind> {
    AllocatorKind::from_u8(value)
        .ok_or_else(|| target!(ErrorCode::TruncatedRecord, "unknown allocator {}", value))
}

fn parse_memory(reader: &mut impl Read) -> RecorderResult<MemoryRecord> {
    Ok(MemoryRecord {
        timestamp_ms: wire::get_varint(reader)?,
        rss_bytes: wire::get_varint(reader)?,
        heap_bytes: wire::get_varint(reader)?,
    })
}
