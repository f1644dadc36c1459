//! PyO3 entry points for starting and managing capture sessions.

mod bootstrap;

use std::sync::atomic::{AtomicBool, Ordering};

use pyo3::prelude::*;
use recorder_errors::{usage, ErrorCode};

use crate::errors::to_py_err;
use crate::ffi;
use crate::hooks;
use crate::logging::{init_rust_logging_with_default, set_active_capture_id};
use crate::monitoring::{
    flush_installed_tracer, install_tracer, seed_current_stack, uninstall_tracer,
};
use crate::policy::{configure_policy_from_env, policy_snapshot};
use crate::runtime_tracer::HeapFrameTracer;
use crate::tracker;
use bootstrap::CaptureBootstrap;

/// Global flag tracking whether tracing is active.
static ACTIVE: AtomicBool = AtomicBool::new(false);

/// Start capturing allocation events into `destination`.
///
/// `destination` is a capture file path, or `tcp://PORT` to stream to a
/// live reader. Keyword arguments override the policy loaded from the
/// environment.
#[pyfunction]
#[pyo3(signature = (destination, *, native_traces = None, trace_python_allocators = None, compress = None, memory_interval_ms = None))]
pub fn start_tracing(
    destination: &str,
    native_traces: Option<bool>,
    trace_python_allocators: Option<bool>,
    compress: Option<bool>,
    memory_interval_ms: Option<u64>,
) -> PyResult<()> {
    ffi::wrap_pyfunction("start_tracing", || {
        // Ensure logging is ready before any tracer logs might be emitted.
        init_rust_logging_with_default("codetracer_heap_recorder=warn");
        if ACTIVE.load(Ordering::SeqCst) {
            return Err(to_py_err(usage!(
                ErrorCode::AlreadyTracing,
                "tracing already active"
            )));
        }
        configure_policy_from_env().map_err(to_py_err)?;

        let mut policy = policy_snapshot();
        if let Some(native_traces) = native_traces {
            policy.native_traces = native_traces;
        }
        if let Some(python_allocators) = trace_python_allocators {
            policy.trace_python_allocators = python_allocators;
        }
        if let Some(compress) = compress {
            policy.compress = compress;
        }
        if let Some(interval) = memory_interval_ms {
            policy.memory_interval_ms = interval.max(1);
        }

        Python::with_gil(|py| {
            let bootstrap = CaptureBootstrap::prepare(py, destination, &policy).map_err(to_py_err)?;
            let trace_python_allocators = policy.trace_python_allocators;
            let (writer, options) = bootstrap.into_parts();

            tracker::start(writer, options).map_err(to_py_err)?;
            if trace_python_allocators {
                hooks::pymalloc::install(py);
            }
            let install_result = install_tracer(py, Box::new(HeapFrameTracer::new(trace_python_allocators)))
                .and_then(|()| seed_current_stack(py));
            if let Err(err) = install_result {
                // Unwind the half-started session so a retry is possible.
                if trace_python_allocators {
                    hooks::pymalloc::remove(py);
                }
                let _ = tracker::stop();
                return Err(err);
            }

            set_active_capture_id(Some(destination.to_string()));
            ACTIVE.store(true, Ordering::SeqCst);
            Ok(())
        })
    })
}

/// Stop tracing and finalize the capture stream.
#[pyfunction]
pub fn stop_tracing() -> PyResult<()> {
    ffi::wrap_pyfunction("stop_tracing", || {
        Python::with_gil(|py| {
            // Uninstall triggers finish() on the tracer implementation,
            // which restores symbols and closes the writer.
            uninstall_tracer(py)?;
            set_active_capture_id(None);
            ACTIVE.store(false, Ordering::SeqCst);
            Ok(())
        })
    })
}

/// Query whether tracing is currently active.
#[pyfunction]
pub fn is_tracing() -> PyResult<bool> {
    ffi::wrap_pyfunction("is_tracing", || Ok(ACTIVE.load(Ordering::SeqCst)))
}

/// Flush buffered capture data to the sink.
#[pyfunction]
pub fn flush_tracing() -> PyResult<()> {
    ffi::wrap_pyfunction("flush_tracing", || {
        Python::with_gil(|py| flush_installed_tracer(py))
    })
}

/// Number of records dropped by absorbed capture-path errors.
#[pyfunction]
pub fn dropped_record_count() -> PyResult<u64> {
    ffi::wrap_pyfunction("dropped_record_count", || Ok(tracker::dropped_records()))
}
