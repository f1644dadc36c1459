//! Data model for the capture stream.
//!
//! The wire layout is little-endian with a fixed seven-byte magic pinning the
//! format and a `u16` version gating compatibility. Integers inside record
//! payloads are LEB128 varints (see `wire`); the header keeps fixed-width
//! fields so it can be rewritten in place with a seek.

use std::io::Read;

use bitflags::bitflags;
use recorder_errors::{target, ErrorCode, RecorderResult};

use crate::wire;

/// Pins the wire format. Readers refuse streams with a different magic.
pub const MAGIC: [u8; 7] = *b"MEMRAY0";

/// Bumped on incompatible layout changes.
pub const CURRENT_VERSION: u16 = 1;

/// Upper bound for length-prefixed payloads accepted by the reader.
pub const MAX_STRING_LEN: usize = 1 << 20;

/// Names one `(function, filename, first line)` triple within a capture.
/// Zero is reserved for "unknown".
pub type FrameId = u64;

/// Stable identifier the writer assigns on first sighting of a kernel thread.
pub type ThreadId = u64;

bitflags! {
    /// Header feature flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeaderFlags: u16 {
        const NATIVE_TRACE = 1 << 0;
        const COMPRESSED = 1 << 1;
        const PYTHON_ALLOCATORS = 1 << 2;
        const OBJECT_LIFETIMES = 1 << 3;
    }
}

/// Shape of the record body: every event, or pre-reduced aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    AllEvents,
    Aggregated,
}

impl FileFormat {
    pub fn as_u8(self) -> u8 {
        match self {
            FileFormat::AllEvents => 0,
            FileFormat::Aggregated => 1,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(FileFormat::AllEvents),
            1 => Some(FileFormat::Aggregated),
            _ => None,
        }
    }
}

/// One-byte tags opening every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordTag {
    Allocation = 0x01,
    Free = 0x02,
    FramePush = 0x03,
    FramePop = 0x04,
    CodeObject = 0x05,
    ThreadChange = 0x06,
    MemoryRecord = 0x07,
    Mappings = 0x08,
    ContextSwitch = 0x09,
    AggregatedAllocation = 0x0a,
    MemorySnapshot = 0x0b,
    NativeFrame = 0x0c,
    Trailer = 0x7f,
}

impl RecordTag {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(RecordTag::Allocation),
            0x02 => Some(RecordTag::Free),
            0x03 => Some(RecordTag::FramePush),
            0x04 => Some(RecordTag::FramePop),
            0x05 => Some(RecordTag::CodeObject),
            0x06 => Some(RecordTag::ThreadChange),
            0x07 => Some(RecordTag::MemoryRecord),
            0x08 => Some(RecordTag::Mappings),
            0x09 => Some(RecordTag::ContextSwitch),
            0x0a => Some(RecordTag::AggregatedAllocation),
            0x0b => Some(RecordTag::MemorySnapshot),
            0x0c => Some(RecordTag::NativeFrame),
            0x7f => Some(RecordTag::Trailer),
            _ => None,
        }
    }
}

/// Which allocator entry point produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AllocatorKind {
    Malloc = 1,
    Calloc = 2,
    Realloc = 3,
    PosixMemalign = 4,
    AlignedAlloc = 5,
    Valloc = 6,
    Memalign = 7,
    Pvalloc = 8,
    Free = 9,
    Mmap = 10,
    Munmap = 11,
    PymallocMalloc = 12,
    PymallocCalloc = 13,
    PymallocRealloc = 14,
    PymallocFree = 15,
}

impl AllocatorKind {
    /// Free events carry size zero and deallocate their address.
    pub fn is_free(self) -> bool {
        matches!(
            self,
            AllocatorKind::Free | AllocatorKind::Munmap | AllocatorKind::PymallocFree
        )
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(AllocatorKind::Malloc),
            2 => Some(AllocatorKind::Calloc),
            3 => Some(AllocatorKind::Realloc),
            4 => Some(AllocatorKind::PosixMemalign),
            5 => Some(AllocatorKind::AlignedAlloc),
            6 => Some(AllocatorKind::Valloc),
            7 => Some(AllocatorKind::Memalign),
            8 => Some(AllocatorKind::Pvalloc),
            9 => Some(AllocatorKind::Free),
            10 => Some(AllocatorKind::Mmap),
            11 => Some(AllocatorKind::Munmap),
            12 => Some(AllocatorKind::PymallocMalloc),
            13 => Some(AllocatorKind::PymallocCalloc),
            14 => Some(AllocatorKind::PymallocRealloc),
            15 => Some(AllocatorKind::PymallocFree),
            _ => None,
        }
    }
}

/// A reconstructed allocation or free event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub tid: ThreadId,
    pub address: u64,
    /// Zero for free events.
    pub size: u64,
    pub allocator: AllocatorKind,
    /// Zero when native tracing is off or no native stack was captured.
    pub native_frame_id: FrameId,
    /// Zero when no Python frame was on the ghost stack.
    pub frame_id: FrameId,
}

/// Immutable description of a code object, interned under its [`FrameId`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeObjectInfo {
    pub function_name: String,
    pub filename: String,
    pub first_line_no: u32,
    /// Opaque location table; decoded with the interpreter's rules.
    pub line_table: Vec<u8>,
}

/// Periodic `(monotonic ms, RSS, tracked heap)` sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRecord {
    pub timestamp_ms: u64,
    pub rss_bytes: u64,
    pub heap_bytes: u64,
}

/// One mapped range of a loaded image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSegment {
    pub start: u64,
    pub end: u64,
    pub file_offset: u64,
    pub path: String,
}

/// Loader state at a given generation. The generation is monotone
/// non-decreasing across the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMappings {
    pub generation: u64,
    pub segments: Vec<ImageSegment>,
}

/// An instruction pointer waiting for resolution against the mappings
/// timeline at its generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnresolvedNativeFrame {
    pub instruction_pointer: u64,
    pub image_generation: u64,
}

/// Snapshot-style aggregate entry written by the aggregated file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatedAllocation {
    pub tid: ThreadId,
    pub frame_id: FrameId,
    pub native_frame_id: FrameId,
    pub count: u64,
    pub total_bytes: u64,
}

/// Capture header. Fixed-width fields so `write_header(seek_to_start)` can
/// rewrite it in place once the final trailer state is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u16,
    pub flags: HeaderFlags,
    pub file_format: FileFormat,
    pub pid: u64,
    pub main_tid: ThreadId,
    pub skipped_frames_on_main_tid: u32,
    pub command_line: String,
    /// `(major << 16) | (minor << 8) | micro`.
    pub python_version: u32,
    pub native_traces_enabled: bool,
    pub trace_python_allocators: bool,
}

impl Header {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.flags.bits().to_le_bytes());
        out.push(self.file_format.as_u8());
        out.extend_from_slice(&self.pid.to_le_bytes());
        out.extend_from_slice(&self.main_tid.to_le_bytes());
        out.extend_from_slice(&self.skipped_frames_on_main_tid.to_le_bytes());
        wire::put_str(out, &self.command_line);
        out.extend_from_slice(&self.python_version.to_le_bytes());
        out.push(self.native_traces_enabled as u8);
        out.push(self.trace_python_allocators as u8);
    }

    pub fn decode(reader: &mut impl Read) -> RecorderResult<Self> {
        let mut magic = [0u8; 7];
        reader.read_exact(&mut magic).map_err(|err| {
            target!(ErrorCode::TruncatedRecord, "stream ended in header: {}", err)
        })?;
        if magic != MAGIC {
            return Err(target!(
                ErrorCode::BadMagic,
                "not a capture stream (bad magic)"
            ));
        }
        let version = read_u16(reader)?;
        if version > CURRENT_VERSION {
            return Err(target!(
                ErrorCode::UnsupportedVersion,
                "capture version {} is newer than supported version {}",
                version,
                CURRENT_VERSION
            ));
        }
        let flags = HeaderFlags::from_bits_truncate(read_u16(reader)?);
        let format_byte = read_u8(reader)?;
        let file_format = FileFormat::from_u8(format_byte).ok_or_else(|| {
            target!(
                ErrorCode::TruncatedRecord,
                "unknown file format {}",
                format_byte
            )
        })?;
        let pid = read_u64(reader)?;
        let main_tid = read_u64(reader)?;
        let skipped_frames_on_main_tid = read_u32(reader)?;
        let command_line = wire::get_str(reader, MAX_STRING_LEN)?;
        let python_version = read_u32(reader)?;
        let native_traces_enabled = read_u8(reader)? != 0;
        let trace_python_allocators = read_u8(reader)? != 0;
        Ok(Header {
            version,
            flags,
            file_format,
            pid,
            main_tid,
            skipped_frames_on_main_tid,
            command_line,
            python_version,
            native_traces_enabled,
            trace_python_allocators,
        })
    }
}

fn read_u8(reader: &mut impl Read) -> RecorderResult<u8> {
    let mut buf = [0u8; 1];
    read_fixed(reader, &mut buf)?;
    Ok(buf[0])
}

fn read_u16(reader: &mut impl Read) -> RecorderResult<u16> {
    let mut buf = [0u8; 2];
    read_fixed(reader, &mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32(reader: &mut impl Read) -> RecorderResult<u32> {
    let mut buf = [0u8; 4];
    read_fixed(reader, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(reader: &mut impl Read) -> RecorderResult<u64> {
    let mut buf = [0u8; 8];
    read_fixed(reader, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_fixed(reader: &mut impl Read, buf: &mut [u8]) -> RecorderResult<()> {
    reader.read_exact(buf).map_err(|err| {
        target!(ErrorCode::TruncatedRecord, "stream ended in header: {}", err)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_header() -> Header {
        Header {
            version: CURRENT_VERSION,
            flags: HeaderFlags::NATIVE_TRACE | HeaderFlags::PYTHON_ALLOCATORS,
            file_format: FileFormat::AllEvents,
            pid: 4321,
            main_tid: 1,
            skipped_frames_on_main_tid: 3,
            command_line: "python app.py --serve".to_string(),
            python_version: (3 << 16) | (12 << 8) | 1,
            native_traces_enabled: true,
            trace_python_allocators: true,
        }
    }

    #[test]
    fn header_round_trips() {
        let header = sample_header();
        let mut buf = Vec::new();
        header.encode(&mut buf);
        let decoded = Header::decode(&mut Cursor::new(buf)).expect("decode");
        assert_eq!(decoded, header);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buf = Vec::new();
        sample_header().encode(&mut buf);
        buf[0] = b'X';
        let err = Header::decode(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.code, ErrorCode::BadMagic);
    }

    #[test]
    fn newer_version_is_refused() {
        let mut header = sample_header();
        header.version = CURRENT_VERSION + 1;
        let mut buf = Vec::new();
        header.encode(&mut buf);
        let err = Header::decode(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.code, ErrorCode::UnsupportedVersion);
    }

    #[test]
    fn truncated_header_reports_parse_error() {
        let mut buf = Vec::new();
        sample_header().encode(&mut buf);
        buf.truncate(12);
        let err = Header::decode(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.code, ErrorCode::TruncatedRecord);
    }

    #[test]
    fn free_kinds_are_classified() {
        assert!(AllocatorKind::Free.is_free());
        assert!(AllocatorKind::Munmap.is_free());
        assert!(AllocatorKind::PymallocFree.is_free());
        assert!(!AllocatorKind::Malloc.is_free());
        assert!(!AllocatorKind::Mmap.is_free());
    }

    #[test]
    fn every_tag_survives_a_byte_round_trip() {
        for tag in [
            RecordTag::Allocation,
            RecordTag::Free,
            RecordTag::FramePush,
            RecordTag::FramePop,
            RecordTag::CodeObject,
            RecordTag::ThreadChange,
            RecordTag::MemoryRecord,
            RecordTag::Mappings,
            RecordTag::ContextSwitch,
            RecordTag::AggregatedAllocation,
            RecordTag::MemorySnapshot,
            RecordTag::NativeFrame,
            RecordTag::Trailer,
        ] {
            assert_eq!(RecordTag::from_u8(tag as u8), Some(tag));
        }
        assert_eq!(RecordTag::from_u8(0x42), None);
    }
}
