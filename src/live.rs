//! Background reader for live captures.
//!
//! A worker thread drives a `RecordReader` over a socket source and folds
//! allocation records into a snapshot aggregator. Snapshot queries take the
//! same mutex the worker holds for exactly one record's processing, so a
//! query never stalls the stream for longer than that.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::debug;
use pyo3::prelude::*;
use recorder_errors::RecorderResult;

use crate::aggregate::{LocationKey, LocationStats, SnapshotAllocationAggregator};
use crate::errors::to_py_err;
use crate::ffi;
use crate::io::{RecordSource, SocketSource};
use crate::reader::{RecordReader, RecordView};
use crate::records::MemoryRecord;
use crate::replay::{summaries_from, AllocationSummary};

struct Shared {
    aggregator: Mutex<SnapshotAllocationAggregator>,
    aggregated: Mutex<HashMap<LocationKey, LocationStats>>,
    latest_memory: Mutex<Option<MemoryRecord>>,
    stop: AtomicBool,
    failed: AtomicBool,
}

pub struct BackgroundSocketReader {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    close: Box<dyn Fn() + Send + Sync>,
}

impl BackgroundSocketReader {
    /// Connect to a capture port and start draining records.
    pub fn connect(port: u16) -> RecorderResult<Self> {
        let source = SocketSource::connect(port)?;
        let handle = source.handle();
        Self::start(source, Box::new(move || handle.close()))
    }

    fn start<S: RecordSource + 'static>(
        source: S,
        close: Box<dyn Fn() + Send + Sync>,
    ) -> RecorderResult<Self> {
        let reader = RecordReader::new(source)?;
        let shared = Arc::new(Shared {
            aggregator: Mutex::new(SnapshotAllocationAggregator::new()),
            aggregated: Mutex::new(HashMap::new()),
            latest_memory: Mutex::new(None),
            stop: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        });
        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("heap-recorder-live".to_string())
            .spawn(move || run_worker(reader, worker_shared))
            .map_err(|err| {
                recorder_errors::enverr!(
                    recorder_errors::ErrorCode::Io,
                    "cannot spawn live reader thread: {}",
                    err
                )
            })?;
        Ok(Self {
            shared,
            worker: Some(worker),
            close,
        })
    }

    /// Current residents, reduced under the snapshot mutex.
    pub fn snapshot_allocation_records(&self, merge_threads: bool) -> Vec<AllocationSummary> {
        let mut entries = self
            .shared
            .aggregator
            .lock()
            .expect("aggregator lock")
            .snapshot(merge_threads);
        for (key, stats) in self.shared.aggregated.lock().expect("aggregated lock").iter() {
            let key = if merge_threads {
                LocationKey { tid: 0, ..*key }
            } else {
                *key
            };
            let entry = entries.entry(key).or_default();
            entry.count += stats.count;
            entry.total_bytes += stats.total_bytes;
        }
        summaries_from(entries)
    }

    pub fn latest_memory_record(&self) -> Option<MemoryRecord> {
        *self.shared.latest_memory.lock().expect("memory lock")
    }

    pub fn has_failed(&self) -> bool {
        self.shared.failed.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }

    /// Signal the worker, close the source and wait for drain.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        (self.close)();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for BackgroundSocketReader {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker<S: RecordSource>(mut reader: RecordReader<S>, shared: Arc<Shared>) {
    loop {
        if shared.stop.load(Ordering::SeqCst) {
            break;
        }
        match reader.next_record() {
            Ok(RecordView::Allocation(allocation)) => {
                shared
                    .aggregator
                    .lock()
                    .expect("aggregator lock")
                    .process_allocation(&allocation);
            }
            Ok(RecordView::AggregatedAllocation(entry)) => {
                let key = LocationKey {
                    frame_id: entry.frame_id,
                    native_frame_id: entry.native_frame_id,
                    tid: entry.tid,
                };
                let mut aggregated = shared.aggregated.lock().expect("aggregated lock");
                let stats = aggregated.entry(key).or_default();
                stats.count += entry.count;
                stats.total_bytes += entry.total_bytes;
            }
            Ok(RecordView::MemoryRecord(record)) | Ok(RecordView::MemorySnapshot(record)) => {
                *shared.latest_memory.lock().expect("memory lock") = Some(record);
            }
            Ok(RecordView::EndOfFile) => {
                debug!("live capture stream ended");
                break;
            }
            Err(err) => {
                debug!("live capture stream failed: {}", err);
                shared.failed.store(true, Ordering::SeqCst);
                break;
            }
        }
    }
}

/// Python-facing handle over a [`BackgroundSocketReader`].
#[pyclass]
pub struct SnapshotReader {
    inner: Option<BackgroundSocketReader>,
}

#[pymethods]
impl SnapshotReader {
    #[new]
    fn py_new(port: u16) -> PyResult<Self> {
        ffi::wrap_pyfunction("SnapshotReader", || {
            let inner = BackgroundSocketReader::connect(port).map_err(to_py_err)?;
            Ok(Self { inner: Some(inner) })
        })
    }

    /// Residents right now, grouped by location.
    #[pyo3(signature = (merge_threads = false))]
    fn snapshot_allocation_records(&self, merge_threads: bool) -> Vec<AllocationSummary> {
        self.inner
            .as_ref()
            .map(|reader| reader.snapshot_allocation_records(merge_threads))
            .unwrap_or_default()
    }

    fn latest_memory(&self) -> Option<(u64, u64, u64)> {
        self.inner.as_ref().and_then(|reader| {
            reader
                .latest_memory_record()
                .map(|record| (record.timestamp_ms, record.rss_bytes, record.heap_bytes))
        })
    }

    fn is_running(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(BackgroundSocketReader::is_running)
    }

    fn stop(&mut self) {
        if let Some(mut reader) = self.inner.take() {
            reader.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::test_support::BufferSource;
    use crate::io::SocketSink;
    use crate::records::{AllocatorKind, FileFormat, Header, HeaderFlags, CURRENT_VERSION};
    use crate::writer::RecordWriter;
    use std::time::Duration;

    fn header() -> Header {
        Header {
            version: CURRENT_VERSION,
            flags: HeaderFlags::empty(),
            file_format: FileFormat::AllEvents,
            pid: 7,
            main_tid: 1,
            skipped_frames_on_main_tid: 0,
            command_line: "python live-test.py".to_string(),
            python_version: (3 << 16) | (12 << 8),
            native_traces_enabled: false,
            trace_python_allocators: false,
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn worker_aggregates_a_live_socket_stream() {
        let mut sink = SocketSink::bind(0).expect("bind");
        let port = sink.port().expect("port");

        let writer_thread = std::thread::spawn(move || {
            let mut writer = RecordWriter::new(Box::new(sink), header());
            writer.write_header(false).expect("header");
            writer
                .write_allocation(1, AllocatorKind::Malloc, 0xA, 100, 0, 5)
                .expect("alloc");
            writer
                .write_allocation(1, AllocatorKind::Malloc, 0xB, 200, 0, 5)
                .expect("alloc");
            writer
                .write_free(1, AllocatorKind::Free, 0xA)
                .expect("free");
            writer
                .write_memory_record(MemoryRecord {
                    timestamp_ms: 1,
                    rss_bytes: 4096,
                    heap_bytes: 200,
                })
                .expect("memory");
            writer.write_trailer().expect("trailer");
            writer.flush().expect("flush");
        });

        let mut reader = BackgroundSocketReader::connect(port).expect("connect");
        writer_thread.join().expect("writer join");

        wait_until(|| reader.latest_memory_record().is_some());
        let records = reader.snapshot_allocation_records(false);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].total_bytes, 200);
        assert_eq!(records[0].frame_id, 5);

        reader.stop();
        assert!(!reader.has_failed());
    }

    #[test]
    fn aggregated_entries_merge_into_snapshots() {
        let mut bytes = Vec::new();
        header().encode(&mut bytes);
        // Hand-rolled aggregated record: tid 2, frame 9, no native frames,
        // 3 allocations totalling 900 bytes.
        bytes.push(0x0a);
        for value in [2u8, 9, 0, 3] {
            bytes.push(value);
        }
        bytes.extend_from_slice(&[0x84, 0x07]); // varint 900

        let reader = BackgroundSocketReader::start(
            BufferSource::new(bytes),
            Box::new(|| {}),
        )
        .expect("start");
        wait_until(|| !reader.is_running());

        let records = reader.snapshot_allocation_records(false);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].thread_id, 2);
        assert_eq!(records[0].count, 3);
        assert_eq!(records[0].total_bytes, 900);

        let merged = reader.snapshot_allocation_records(true);
        assert_eq!(merged[0].thread_id, 0);
    }
}
