//! Process-wide tracker singleton.
//!
//! The tracker owns the record writer and is the single entry point the
//! allocation shims and the interpreter hooks report into. Capture-path
//! errors are absorbed here: a failed write drops the record, bumps the
//! dropped counter and leaves the host untouched. Lifetime is bounded by
//! `start()`/`stop()`; `pthread_atfork` handlers quiesce the writer around
//! forks and rebuild it in the child.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once, RwLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use libc::{c_int, c_void};
use log::{debug, warn};
use recorder_errors::{usage, ErrorCode, RecorderResult};

use crate::hooks;
use crate::logging::record_dropped_record;
use crate::records::{
    AllocatorKind, CodeObjectInfo, FrameId, ImageMappings, MemoryRecord, ThreadId,
};
use crate::shadow_stack;
use crate::writer::RecordWriter;

const MAX_NATIVE_FRAMES: usize = 128;
/// Shim frames between the allocation site and the backtrace call.
const NATIVE_FRAMES_TO_SKIP: usize = 2;

#[cfg(any(target_os = "linux", target_os = "macos"))]
extern "C" {
    fn backtrace(buffer: *mut *mut c_void, size: c_int) -> c_int;
}

pub struct TrackerOptions {
    pub native_traces: bool,
    pub trace_python_allocators: bool,
    pub memory_interval_ms: u64,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            native_traces: false,
            trace_python_allocators: false,
            memory_interval_ms: 10,
        }
    }
}

struct Tracker {
    writer: Mutex<RecordWriter>,
    active: AtomicBool,
    native_traces: bool,
    memory_interval_ms: u64,
    start_time: Instant,
    /// Live sizes for heap accounting in memory records.
    live_sizes: DashMap<u64, u64>,
    live_bytes: AtomicU64,
    dropped_records: AtomicU64,
    native_stack_ids: Mutex<HashMap<Vec<u64>, FrameId>>,
    mappings_generation: AtomicU64,
}

static TRACKER: RwLock<Option<Arc<Tracker>>> = RwLock::new(None);
static ATFORK: Once = Once::new();

/// Serializes tests that mutate process-wide tracker or patch state.
#[cfg(test)]
pub(crate) static GLOBAL_TEST_LOCK: Mutex<()> = Mutex::new(());

fn current() -> Option<Arc<Tracker>> {
    TRACKER.read().ok()?.clone()
}

/// Stable id of the calling kernel thread.
pub fn current_tid() -> ThreadId {
    #[cfg(target_os = "linux")]
    unsafe {
        libc::syscall(libc::SYS_gettid) as ThreadId
    }
    #[cfg(not(target_os = "linux"))]
    unsafe {
        libc::pthread_self() as ThreadId
    }
}

/// Activate capture. Fails if a tracker is already running.
pub fn start(mut writer: RecordWriter, options: TrackerOptions) -> RecorderResult<()> {
    {
        let guard = TRACKER.read().expect("tracker lock");
        if guard.is_some() {
            return Err(usage!(ErrorCode::AlreadyTracing, "tracker already active"));
        }
    }

    writer.write_header(false)?;
    let tracker = Arc::new(Tracker {
        writer: Mutex::new(writer),
        active: AtomicBool::new(true),
        native_traces: options.native_traces,
        memory_interval_ms: options.memory_interval_ms,
        start_time: Instant::now(),
        live_sizes: DashMap::new(),
        live_bytes: AtomicU64::new(0),
        dropped_records: AtomicU64::new(0),
        native_stack_ids: Mutex::new(HashMap::new()),
        mappings_generation: AtomicU64::new(0),
    });
    tracker.emit_mappings();

    ATFORK.call_once(|| unsafe {
        libc::pthread_atfork(Some(atfork_prepare), Some(atfork_parent), Some(atfork_child));
    });

    *TRACKER.write().expect("tracker lock") = Some(tracker.clone());
    hooks::overwrite_symbols()?;
    #[cfg(target_os = "macos")]
    hooks::macho::register_add_image_callback();
    spawn_memory_poller(tracker);
    Ok(())
}

/// Deactivate capture: shims fall through, symbols are restored, the stream
/// gets its trailer and the header is rewritten with final values.
pub fn stop() -> RecorderResult<()> {
    let Some(tracker) = TRACKER.write().expect("tracker lock").take() else {
        return Err(usage!(ErrorCode::TrackerInactive, "tracker is not active"));
    };
    tracker.active.store(false, Ordering::SeqCst);
    hooks::restore_symbols();

    let mut writer = tracker.writer.lock().expect("writer lock");
    writer.write_trailer()?;
    if writer.write_header(true).is_err() {
        // Socket sinks cannot seek; the initial header stands.
        debug!("stream is not seekable; header left as written at start");
    }
    writer.finalize()?;
    Ok(())
}

pub fn is_active() -> bool {
    current().is_some_and(|tracker| tracker.active.load(Ordering::Relaxed))
}

/// Push buffered records through to the sink.
pub fn flush() -> RecorderResult<()> {
    let Some(tracker) = current() else {
        return Err(usage!(ErrorCode::TrackerInactive, "tracker is not active"));
    };
    let mut writer = tracker.writer.lock().expect("writer lock");
    writer.flush()
}

/// Records dropped by absorbed capture-path errors.
pub fn dropped_records() -> u64 {
    current()
        .map(|tracker| tracker.dropped_records.load(Ordering::Relaxed))
        .unwrap_or(0)
}

impl Tracker {
    fn absorb(&self, result: RecorderResult<()>) {
        if let Err(err) = result {
            let dropped = self.dropped_records.fetch_add(1, Ordering::Relaxed);
            record_dropped_record("writer_error");
            if dropped == 0 {
                warn!("capture record dropped: {}", err);
            }
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    fn capture_native_stack(&self) -> FrameId {
        #[cfg(any(target_os = "linux", target_os = "macos"))]
        {
            let mut buffer = [std::ptr::null_mut::<c_void>(); MAX_NATIVE_FRAMES];
            let depth = unsafe { backtrace(buffer.as_mut_ptr(), MAX_NATIVE_FRAMES as c_int) };
            if depth <= NATIVE_FRAMES_TO_SKIP as c_int {
                return 0;
            }
            // Innermost first from the unwinder; the trie wants outermost
            // first so edges are shared across stacks.
            let mut frames: Vec<u64> = buffer[NATIVE_FRAMES_TO_SKIP..depth as usize]
                .iter()
                .map(|ptr| *ptr as u64)
                .collect();
            frames.reverse();

            let mut cache = self.native_stack_ids.lock().expect("native cache lock");
            if let Some(id) = cache.get(&frames) {
                return *id;
            }
            let mut writer = self.writer.lock().expect("writer lock");
            match writer.write_native_stack(&frames) {
                Ok(id) => {
                    cache.insert(frames, id);
                    id
                }
                Err(err) => {
                    drop(writer);
                    self.absorb(Err(err));
                    0
                }
            }
        }
        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        {
            0
        }
    }

    fn emit_mappings(&self) {
        let generation = self.mappings_generation.fetch_add(1, Ordering::SeqCst);
        let mappings = collect_mappings(generation);
        if mappings.segments.is_empty() {
            return;
        }
        let result = {
            let mut writer = self.writer.lock().expect("writer lock");
            writer.write_mappings(&mappings)
        };
        self.absorb(result);
    }
}

/// Report an allocator entry point returning new memory. Called from the
/// shims with the re-entrancy guard held.
pub fn record_allocation(kind: AllocatorKind, address: u64, size: u64) {
    let Some(tracker) = current() else { return };
    if !tracker.active.load(Ordering::Relaxed) {
        return;
    }
    tracker.live_sizes.insert(address, size);
    tracker.live_bytes.fetch_add(size, Ordering::Relaxed);

    let frame_id = shadow_stack::top_frame();
    let native_frame_id = if tracker.native_traces {
        tracker.capture_native_stack()
    } else {
        0
    };
    let tid = current_tid();
    let result = {
        let mut writer = tracker.writer.lock().expect("writer lock");
        writer.write_allocation(tid, kind, address, size, native_frame_id, frame_id)
    };
    tracker.absorb(result);
}

/// Report a deallocation entry point.
pub fn record_free(kind: AllocatorKind, address: u64) {
    let Some(tracker) = current() else { return };
    if !tracker.active.load(Ordering::Relaxed) {
        return;
    }
    if let Some((_, size)) = tracker.live_sizes.remove(&address) {
        tracker.live_bytes.fetch_sub(size, Ordering::Relaxed);
    }
    let tid = current_tid();
    let result = {
        let mut writer = tracker.writer.lock().expect("writer lock");
        writer.write_free(tid, kind, address)
    };
    tracker.absorb(result);
}

/// Interpreter entered a function: mirror it on the ghost stack and in the
/// stream.
pub fn record_frame_push(frame_id: FrameId) {
    shadow_stack::push_frame(frame_id);
    let Some(tracker) = current() else { return };
    if !tracker.active.load(Ordering::Relaxed) {
        return;
    }
    let tid = current_tid();
    let result = {
        let mut writer = tracker.writer.lock().expect("writer lock");
        writer.write_frame_push(tid, frame_id)
    };
    tracker.absorb(result);
}

/// Interpreter left a function.
pub fn record_frame_pop() {
    if shadow_stack::pop_frame().is_none() {
        return;
    }
    let Some(tracker) = current() else { return };
    if !tracker.active.load(Ordering::Relaxed) {
        return;
    }
    let tid = current_tid();
    let result = {
        let mut writer = tracker.writer.lock().expect("writer lock");
        writer.write_frame_pop(tid, 1)
    };
    tracker.absorb(result);
}

/// Emit a code object the registry just interned. Must reach the stream
/// before any record referencing its frame id.
pub fn write_code_object(frame_id: FrameId, info: &CodeObjectInfo) {
    let Some(tracker) = current() else { return };
    let result = {
        let mut writer = tracker.writer.lock().expect("writer lock");
        writer.write_code_object(frame_id, info)
    };
    tracker.absorb(result);
}

/// Emit push records for the calling thread's current ghost stack, so a
/// stack that predates the stream (attach time, fork) can be reconstructed.
pub fn snapshot_stack_to_writer() {
    let Some(tracker) = current() else { return };
    let tid = current_tid();
    let frames = shadow_stack::snapshot();
    let result = (|| {
        let mut writer = tracker.writer.lock().expect("writer lock");
        for frame_id in frames {
            writer.write_frame_push(tid, frame_id)?;
        }
        Ok(())
    })();
    tracker.absorb(result);
}

/// The loader added or removed an image: re-patch (idempotent) and push a
/// fresh mappings generation into the stream.
pub fn on_loader_change() {
    let Some(tracker) = current() else { return };
    if !tracker.active.load(Ordering::Relaxed) {
        return;
    }
    if let Err(err) = hooks::overwrite_symbols() {
        warn!("re-patching after image load failed: {}", err);
    }
    tracker.emit_mappings();
}

fn spawn_memory_poller(tracker: Arc<Tracker>) {
    std::thread::Builder::new()
        .name("heap-recorder-memory".to_string())
        .spawn(move || {
            // The poller's own allocations stay out of the stream.
            let _guard = hooks::RecursionGuard::acquire();
            while tracker.active.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(tracker.memory_interval_ms));
                if !tracker.active.load(Ordering::Relaxed) {
                    break;
                }
                let record = MemoryRecord {
                    timestamp_ms: tracker.elapsed_ms(),
                    rss_bytes: resident_set_size(),
                    heap_bytes: tracker.live_bytes.load(Ordering::Relaxed),
                };
                let result = {
                    let mut writer = tracker.writer.lock().expect("writer lock");
                    writer.write_memory_record(record)
                };
                tracker.absorb(result);
            }
        })
        .map(drop)
        .unwrap_or_else(|err| warn!("memory poller did not start: {}", err));
}

#[cfg(target_os = "linux")]
fn resident_set_size() -> u64 {
    let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
        return 0;
    };
    let resident_pages: u64 = statm
        .split_whitespace()
        .nth(1)
        .and_then(|field| field.parse().ok())
        .unwrap_or(0);
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
    resident_pages * page_size
}

#[cfg(not(target_os = "linux"))]
fn resident_set_size() -> u64 {
    0
}

#[cfg(target_os = "linux")]
fn collect_mappings(generation: u64) -> ImageMappings {
    use std::ffi::CStr;

    unsafe extern "C" fn collect(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> c_int {
        let mappings = &mut *(data as *mut ImageMappings);
        let info = &*info;
        let path = if info.dlpi_name.is_null() {
            String::new()
        } else {
            CStr::from_ptr(info.dlpi_name).to_string_lossy().into_owned()
        };
        let phdrs = std::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
        for phdr in phdrs {
            if phdr.p_type != libc::PT_LOAD {
                continue;
            }
            mappings.segments.push(crate::records::ImageSegment {
                start: info.dlpi_addr + phdr.p_vaddr,
                end: info.dlpi_addr + phdr.p_vaddr + phdr.p_memsz,
                file_offset: phdr.p_offset,
                path: path.clone(),
            });
        }
        0
    }

    let mut mappings = ImageMappings {
        generation,
        segments: Vec::new(),
    };
    unsafe {
        libc::dl_iterate_phdr(Some(collect), &mut mappings as *mut ImageMappings as *mut c_void);
    }
    mappings
}

#[cfg(not(target_os = "linux"))]
fn collect_mappings(generation: u64) -> ImageMappings {
    ImageMappings {
        generation,
        segments: Vec::new(),
    }
}

extern "C" fn atfork_prepare() {
    if let Some(tracker) = current() {
        let mut writer = tracker.writer.lock().expect("writer lock");
        let _ = writer.flush();
    }
}

extern "C" fn atfork_parent() {}

extern "C" fn atfork_child() {
    let guard = TRACKER.write();
    let Ok(mut guard) = guard else { return };
    let Some(tracker) = guard.clone() else { return };
    if !tracker.active.load(Ordering::Relaxed) {
        return;
    }

    let skipped = shadow_stack::reset_after_fork();
    let child_tid = current_tid();
    let child_pid = std::process::id() as u64;

    let cloned = {
        let mut writer = tracker.writer.lock().expect("writer lock");
        writer.clone_in_child_process(child_pid, child_tid, skipped)
    };
    match cloned {
        Ok(child_writer) => {
            let child = Arc::new(Tracker {
                writer: Mutex::new(child_writer),
                active: AtomicBool::new(true),
                native_traces: tracker.native_traces,
                memory_interval_ms: tracker.memory_interval_ms,
                start_time: tracker.start_time,
                live_sizes: DashMap::new(),
                live_bytes: AtomicU64::new(0),
                dropped_records: AtomicU64::new(0),
                // Cached ids refer to trie edges in the parent stream only.
                native_stack_ids: Mutex::new(HashMap::new()),
                mappings_generation: AtomicU64::new(
                    tracker.mappings_generation.load(Ordering::SeqCst),
                ),
            });
            *guard = Some(child.clone());
            drop(guard);
            spawn_memory_poller(child);
        }
        Err(err) => {
            // No stream for the child: deactivate instead of mixing records
            // into the parent's sink.
            warn!("capture disabled in forked child: {}", err);
            tracker.active.store(false, Ordering::SeqCst);
            *guard = None;
            drop(guard);
            hooks::restore_symbols();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::test_support::VecSink;
    use crate::records::{FileFormat, Header, HeaderFlags, CURRENT_VERSION};

    fn header() -> Header {
        Header {
            version: CURRENT_VERSION,
            flags: HeaderFlags::empty(),
            file_format: FileFormat::AllEvents,
            pid: std::process::id() as u64,
            main_tid: current_tid(),
            skipped_frames_on_main_tid: 0,
            command_line: "python test.py".to_string(),
            python_version: (3 << 16) | (12 << 8),
            native_traces_enabled: false,
            trace_python_allocators: false,
        }
    }

    #[test]
    fn inactive_tracker_ignores_events_and_stop_reports_usage() {
        let _lock = GLOBAL_TEST_LOCK.lock().expect("test lock");
        record_allocation(AllocatorKind::Malloc, 0x1000, 64);
        record_free(AllocatorKind::Free, 0x1000);
        assert!(!is_active());
        assert_eq!(dropped_records(), 0);
        // Stopping without a start is a usage error, not a crash.
        match stop() {
            Err(err) => assert_eq!(err.code, ErrorCode::TrackerInactive),
            Ok(()) => panic!("stop succeeded without a tracker"),
        }
    }

    #[test]
    fn current_tid_is_stable_within_a_thread() {
        let first = current_tid();
        let second = current_tid();
        assert_eq!(first, second);
        assert_ne!(first, 0);
        let other = std::thread::spawn(current_tid).join().expect("join");
        assert_ne!(other, first);
    }

    // The full start/stop cycle patches the process-wide allocator tables,
    // so it is exercised in one test to keep ordering deterministic.
    #[test]
    fn start_capture_stop_produces_a_replayable_stream() {
        let _lock = GLOBAL_TEST_LOCK.lock().expect("test lock");
        let (sink, data) = VecSink::new();
        let writer = RecordWriter::new(Box::new(sink), header());
        start(
            writer,
            TrackerOptions {
                native_traces: false,
                trace_python_allocators: false,
                memory_interval_ms: 1000,
            },
        )
        .expect("start");
        assert!(is_active());
        // A second start is refused while active.
        let (sink2, _data2) = VecSink::new();
        let second = start(RecordWriter::new(Box::new(sink2), header()), TrackerOptions::default());
        assert!(second.is_err());

        // Real allocations flow through the patched slots into the stream.
        let probe: Vec<u8> = Vec::with_capacity(1 << 16);
        drop(probe);

        stop().expect("stop");
        assert!(!is_active());

        let bytes = data.lock().expect("lock").clone();
        let mut reader =
            crate::reader::RecordReader::new(crate::io::test_support::BufferSource::new(bytes))
                .expect("reader");
        let mut saw_allocation = false;
        loop {
            match reader.next_record() {
                Ok(crate::reader::RecordView::Allocation(_)) => saw_allocation = true,
                Ok(crate::reader::RecordView::EndOfFile) => break,
                Ok(_) => {}
                Err(err) => panic!("replay failed: {err}"),
            }
        }
        assert!(saw_allocation, "no allocation records were captured");
    }
}
