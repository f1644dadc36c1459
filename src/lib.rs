//! Capture and replay core of a process-attached heap allocation tracer,
//! backed by PyO3.
//!
//! Capture: the symbol patcher rewrites allocator slots in every loaded
//! image so the shims see each event, the `sys.monitoring` callbacks keep a
//! per-thread ghost stack of interpreter frames, and the record writer
//! streams compact binary records to a file or socket sink. Replay: the
//! record reader reconstructs allocations and stacks deterministically and
//! feeds the aggregation engines behind `FileReader` and `SnapshotReader`.

use pyo3::prelude::*;

pub mod aggregate;
pub mod code_object;
pub mod errors;
mod ffi;
pub mod hooks;
pub mod io;
pub mod linetable;
pub mod live;
pub mod logging;
pub mod monitoring;
pub mod policy;
pub mod reader;
pub mod records;
pub mod replay;
mod runtime_tracer;
pub mod session;
pub mod shadow_stack;
pub mod tracker;
pub mod wire;
pub mod writer;

pub use crate::monitoring::{
    install_tracer, uninstall_tracer, CallbackOutcome, CallbackResult, EventSet, FrameTracer,
};
pub use crate::reader::{RecordReader, RecordView};
pub use crate::records::{Allocation, AllocatorKind, FrameId, Header, ThreadId};
pub use crate::writer::RecordWriter;

use crate::logging::init_rust_logging_with_default;

/// Python module definition.
#[pymodule]
fn codetracer_heap_recorder(_py: Python<'_>, m: &Bound<'_, PyModule>) -> PyResult<()> {
    // Initialize logging on import so users see logs without extra setup.
    // Respect RUST_LOG if present; otherwise default to warnings only.
    init_rust_logging_with_default("codetracer_heap_recorder=warn");
    ffi::register_exceptions(m)?;
    m.add_function(wrap_pyfunction!(session::start_tracing, m)?)?;
    m.add_function(wrap_pyfunction!(session::stop_tracing, m)?)?;
    m.add_function(wrap_pyfunction!(session::is_tracing, m)?)?;
    m.add_function(wrap_pyfunction!(session::flush_tracing, m)?)?;
    m.add_function(wrap_pyfunction!(session::dropped_record_count, m)?)?;
    m.add_class::<replay::FileReader>()?;
    m.add_class::<replay::AllocationSummary>()?;
    m.add_class::<live::SnapshotReader>()?;
    Ok(())
}
