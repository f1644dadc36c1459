//! Session bootstrap: destination parsing, sink construction and header
//! metadata gathered from the interpreter.

use std::path::Path;

use pyo3::prelude::*;
use recorder_errors::{enverr, ErrorCode, RecorderResult};

use crate::io::{FileSink, RecordSink, SocketSink};
use crate::policy::RecorderPolicy;
use crate::records::{
    FileFormat, Header, HeaderFlags, CURRENT_VERSION,
};
use crate::tracker::{self, TrackerOptions};
use crate::writer::RecordWriter;

const COMPRESSION_LEVEL: u32 = 6;

pub(super) struct CaptureBootstrap {
    writer: RecordWriter,
    options: TrackerOptions,
}

impl CaptureBootstrap {
    pub(super) fn prepare(
        py: Python<'_>,
        destination: &str,
        policy: &RecorderPolicy,
    ) -> RecorderResult<Self> {
        let sink = build_sink(destination, policy)?;
        let header = build_header(py, policy)
            .map_err(|err| enverr!(ErrorCode::Io, "cannot gather header metadata: {}", err))?;
        let writer = RecordWriter::new(sink, header);
        let options = TrackerOptions {
            native_traces: policy.native_traces,
            trace_python_allocators: policy.trace_python_allocators,
            memory_interval_ms: policy.memory_interval_ms,
        };
        Ok(Self { writer, options })
    }

    pub(super) fn into_parts(self) -> (RecordWriter, TrackerOptions) {
        (self.writer, self.options)
    }
}

fn build_sink(destination: &str, policy: &RecorderPolicy) -> RecorderResult<Box<dyn RecordSink>> {
    if let Some(port) = destination.strip_prefix("tcp://") {
        let port: u16 = port.parse().map_err(|_| {
            enverr!(
                ErrorCode::InvalidDestination,
                "invalid capture port in '{}'",
                destination
            )
        })?;
        return Ok(Box::new(SocketSink::bind(port)?));
    }

    let path = Path::new(destination);
    if path.as_os_str().is_empty() {
        return Err(enverr!(
            ErrorCode::InvalidDestination,
            "capture destination is empty"
        ));
    }
    let compress_level = policy.compress.then_some(COMPRESSION_LEVEL);
    Ok(Box::new(FileSink::create(path, compress_level)?))
}

fn build_header(py: Python<'_>, policy: &RecorderPolicy) -> PyResult<Header> {
    let sys = py.import("sys")?;
    let argv: Vec<String> = sys.getattr("argv")?.extract().unwrap_or_default();
    let command_line = argv.join(" ");

    let version_info = py.version_info();
    let python_version = (u32::from(version_info.major) << 16)
        | (u32::from(version_info.minor) << 8)
        | u32::from(version_info.patch);

    let mut flags = HeaderFlags::empty();
    if policy.native_traces {
        flags |= HeaderFlags::NATIVE_TRACE;
    }
    if policy.trace_python_allocators {
        flags |= HeaderFlags::PYTHON_ALLOCATORS;
    }
    if policy.compress {
        flags |= HeaderFlags::COMPRESSED;
    }

    Ok(Header {
        version: CURRENT_VERSION,
        flags,
        file_format: FileFormat::AllEvents,
        pid: std::process::id() as u64,
        main_tid: tracker::current_tid(),
        skipped_frames_on_main_tid: 0,
        command_line,
        python_version,
        native_traces_enabled: policy.native_traces,
        trace_python_allocators: policy.trace_python_allocators,
    })
}
