//! Replay surface: turns a finished capture into aggregate views.
//!
//! `FileReader` replays the stream once per query; captures are cheap to
//! scan and this keeps the reader free of cross-query state. The summary
//! types are the caller-consumable form of a reduced snapshot.

use std::collections::HashMap;
use std::path::PathBuf;

use pyo3::prelude::*;

use crate::aggregate::{
    sorted_entries, HighWatermarkFinder, LocationKey, LocationStats,
    SnapshotAllocationAggregator, StreamingAllocationAggregator, TemporaryAllocationsAggregator,
};
use crate::errors::to_py_err;
use crate::ffi;
use crate::io::FileSource;
use crate::reader::{RecordReader, RecordView};
use crate::records::{Allocation, Header};
use recorder_errors::RecorderResult;

/// One aggregate line: a location key with its accumulated totals.
#[pyclass(frozen)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationSummary {
    #[pyo3(get)]
    pub thread_id: u64,
    #[pyo3(get)]
    pub frame_id: u64,
    #[pyo3(get)]
    pub native_frame_id: u64,
    #[pyo3(get)]
    pub count: u64,
    #[pyo3(get)]
    pub total_bytes: u64,
}

#[pymethods]
impl AllocationSummary {
    fn __repr__(&self) -> String {
        format!(
            "AllocationSummary(thread_id={}, frame_id={}, native_frame_id={}, count={}, total_bytes={})",
            self.thread_id, self.frame_id, self.native_frame_id, self.count, self.total_bytes
        )
    }
}

/// Reduce a snapshot map into presentation-ordered summaries.
pub(crate) fn summaries_from(
    entries: HashMap<LocationKey, LocationStats>,
) -> Vec<AllocationSummary> {
    sorted_entries(entries)
        .into_iter()
        .map(|(key, stats)| AllocationSummary {
            thread_id: key.tid,
            frame_id: key.frame_id,
            native_frame_id: key.native_frame_id,
            count: stats.count,
            total_bytes: stats.total_bytes,
        })
        .collect()
}

fn replay<F>(path: &PathBuf, mut on_allocation: F) -> RecorderResult<Header>
where
    F: FnMut(&Allocation),
{
    let source = FileSource::open(path)?;
    let mut reader = RecordReader::new(source)?;
    loop {
        match reader.next_record()? {
            RecordView::Allocation(allocation) => on_allocation(&allocation),
            RecordView::EndOfFile => break,
            RecordView::AggregatedAllocation(_)
            | RecordView::MemoryRecord(_)
            | RecordView::MemorySnapshot(_) => {}
        }
    }
    Ok(reader.header().clone())
}

/// Replays a finished capture file into aggregate views.
#[pyclass]
pub struct FileReader {
    path: PathBuf,
}

impl FileReader {
    pub fn open(path: PathBuf) -> RecorderResult<Self> {
        // Validate the header eagerly so version/magic problems surface at
        // construction rather than on the first query.
        let source = FileSource::open(&path)?;
        RecordReader::new(source)?;
        Ok(Self { path })
    }

    pub fn header(&self) -> RecorderResult<Header> {
        replay(&self.path, |_| {})
    }

    /// `(peak event index, peak live bytes)` over the whole stream.
    pub fn high_watermark(&self) -> RecorderResult<(u64, u64)> {
        let mut finder = HighWatermarkFinder::new();
        replay(&self.path, |allocation| finder.process_allocation(allocation))?;
        Ok(finder.high_watermark())
    }

    pub fn high_watermark_records(
        &self,
        merge_threads: bool,
    ) -> RecorderResult<Vec<AllocationSummary>> {
        let mut aggregator = StreamingAllocationAggregator::new();
        replay(&self.path, |allocation| {
            aggregator.process_allocation(allocation)
        })?;
        Ok(summaries_from(aggregator.high_watermark_snapshot(merge_threads)))
    }

    pub fn leaked_records(&self, merge_threads: bool) -> RecorderResult<Vec<AllocationSummary>> {
        let mut aggregator = StreamingAllocationAggregator::new();
        replay(&self.path, |allocation| {
            aggregator.process_allocation(allocation)
        })?;
        Ok(summaries_from(aggregator.leaks(merge_threads)))
    }

    pub fn temporary_records(
        &self,
        max_items: usize,
        merge_threads: bool,
    ) -> RecorderResult<Vec<AllocationSummary>> {
        let mut aggregator = TemporaryAllocationsAggregator::new(max_items);
        replay(&self.path, |allocation| {
            aggregator.process_allocation(allocation)
        })?;
        Ok(summaries_from(aggregator.temporaries(merge_threads)))
    }

    pub fn resident_records(&self, merge_threads: bool) -> RecorderResult<Vec<AllocationSummary>> {
        let mut aggregator = SnapshotAllocationAggregator::new();
        replay(&self.path, |allocation| {
            aggregator.process_allocation(allocation)
        })?;
        Ok(summaries_from(aggregator.snapshot(merge_threads)))
    }

    /// Reduce an all-events capture into the aggregated file format: one
    /// record per surviving location plus a peak-memory snapshot.
    pub fn write_aggregated_copy(&self, destination: &std::path::Path) -> RecorderResult<()> {
        let mut aggregator = StreamingAllocationAggregator::new();
        let mut header = replay(&self.path, |allocation| {
            aggregator.process_allocation(allocation)
        })?;
        header.file_format = crate::records::FileFormat::Aggregated;

        let sink = crate::io::FileSink::create(destination, None)?;
        let mut writer = crate::writer::RecordWriter::new(Box::new(sink), header);
        writer.write_header(false)?;
        for (key, stats) in sorted_entries(aggregator.leaks(false)) {
            writer.write_aggregated_allocation(&crate::records::AggregatedAllocation {
                tid: key.tid,
                frame_id: key.frame_id,
                native_frame_id: key.native_frame_id,
                count: stats.count,
                total_bytes: stats.total_bytes,
            })?;
        }
        writer.write_memory_snapshot(crate::records::MemoryRecord {
            timestamp_ms: 0,
            rss_bytes: 0,
            heap_bytes: aggregator.peak_bytes(),
        })?;
        writer.write_trailer()?;
        writer.finalize()
    }
}

#[pymethods]
impl FileReader {
    #[new]
    fn py_new(path: &str) -> PyResult<Self> {
        ffi::wrap_pyfunction("FileReader", || {
            Self::open(PathBuf::from(path)).map_err(to_py_err)
        })
    }

    #[pyo3(name = "high_watermark")]
    fn py_high_watermark(&self) -> PyResult<(u64, u64)> {
        self.high_watermark().map_err(to_py_err)
    }

    #[pyo3(name = "high_watermark_records", signature = (merge_threads = false))]
    fn py_high_watermark_records(&self, merge_threads: bool) -> PyResult<Vec<AllocationSummary>> {
        self.high_watermark_records(merge_threads).map_err(to_py_err)
    }

    #[pyo3(name = "leaked_records", signature = (merge_threads = false))]
    fn py_leaked_records(&self, merge_threads: bool) -> PyResult<Vec<AllocationSummary>> {
        self.leaked_records(merge_threads).map_err(to_py_err)
    }

    #[pyo3(name = "temporary_records", signature = (max_items = 32, merge_threads = false))]
    fn py_temporary_records(
        &self,
        max_items: usize,
        merge_threads: bool,
    ) -> PyResult<Vec<AllocationSummary>> {
        self.temporary_records(max_items, merge_threads)
            .map_err(to_py_err)
    }

    #[pyo3(name = "resident_records", signature = (merge_threads = false))]
    fn py_resident_records(&self, merge_threads: bool) -> PyResult<Vec<AllocationSummary>> {
        self.resident_records(merge_threads).map_err(to_py_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::FileSink;
    use crate::records::{AllocatorKind, FileFormat, HeaderFlags, CURRENT_VERSION};
    use crate::writer::RecordWriter;
    use tempfile::tempdir;

    fn header() -> Header {
        Header {
            version: CURRENT_VERSION,
            flags: HeaderFlags::empty(),
            file_format: FileFormat::AllEvents,
            pid: 7,
            main_tid: 1,
            skipped_frames_on_main_tid: 0,
            command_line: "python replay-test.py".to_string(),
            python_version: (3 << 16) | (12 << 8),
            native_traces_enabled: false,
            trace_python_allocators: false,
        }
    }

    fn write_capture(path: &std::path::Path) {
        let sink = FileSink::create(path, None).expect("sink");
        let mut writer = RecordWriter::new(Box::new(sink), header());
        writer.write_header(false).expect("header");
        // f1 allocates 100 at A; f2 allocates 200 at B; A is freed.
        writer
            .write_allocation(1, AllocatorKind::Malloc, 0xA, 100, 0, 1)
            .expect("alloc");
        writer
            .write_allocation(1, AllocatorKind::Malloc, 0xB, 200, 0, 2)
            .expect("alloc");
        writer
            .write_free(1, AllocatorKind::Free, 0xA)
            .expect("free");
        writer.write_trailer().expect("trailer");
        writer.finalize().expect("finalize");
    }

    #[test]
    fn file_replay_produces_watermark_and_leaks() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("capture.bin");
        write_capture(&path);

        let reader = FileReader::open(path).expect("open");
        assert_eq!(reader.high_watermark().expect("watermark"), (1, 300));

        let leaks = reader.leaked_records(false).expect("leaks");
        assert_eq!(leaks.len(), 1);
        assert_eq!(leaks[0].frame_id, 2);
        assert_eq!(leaks[0].total_bytes, 200);

        let peak = reader.high_watermark_records(false).expect("peak");
        assert_eq!(peak.len(), 2);
        // Presentation order: biggest location first.
        assert_eq!(peak[0].total_bytes, 200);
        assert_eq!(peak[1].total_bytes, 100);
    }

    #[test]
    fn residents_match_leaks_for_a_closed_stream() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("capture.bin");
        write_capture(&path);

        let reader = FileReader::open(path).expect("open");
        let residents = reader.resident_records(true).expect("residents");
        let leaks = reader.leaked_records(true).expect("leaks");
        assert_eq!(residents, leaks);
        assert_eq!(residents[0].thread_id, 0, "merge_threads collapses tids");
    }

    #[test]
    fn aggregated_copy_reduces_the_stream() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("capture.bin");
        let reduced = dir.path().join("capture.aggregated.bin");
        write_capture(&path);

        FileReader::open(path)
            .expect("open")
            .write_aggregated_copy(&reduced)
            .expect("reduce");

        let source = crate::io::FileSource::open(&reduced).expect("open reduced");
        let mut reader = RecordReader::new(source).expect("reader");
        assert_eq!(
            reader.header().file_format,
            crate::records::FileFormat::Aggregated
        );
        let mut aggregated = Vec::new();
        let mut snapshots = Vec::new();
        loop {
            match reader.next_record().expect("record") {
                crate::reader::RecordView::AggregatedAllocation(entry) => aggregated.push(entry),
                crate::reader::RecordView::MemorySnapshot(snapshot) => snapshots.push(snapshot),
                crate::reader::RecordView::EndOfFile => break,
                other => panic!("unexpected record {other:?}"),
            }
        }
        assert_eq!(aggregated.len(), 1);
        assert_eq!(aggregated[0].frame_id, 2);
        assert_eq!(aggregated[0].total_bytes, 200);
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].heap_bytes, 300);
    }

    #[test]
    fn opening_a_non_capture_file_fails_eagerly() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("not-a-capture.bin");
        std::fs::write(&path, b"plain text").expect("write");
        assert!(FileReader::open(path).is_err());
    }
}
