//! Tracing backend interface for frame-lifecycle monitoring.

use pyo3::prelude::*;

use crate::records::FrameId;

use super::{CallbackOutcome, CallbackResult, EventSet, NO_EVENTS};

/// Trait implemented by frame-tracing backends.
///
/// Each method corresponds to a frame-lifecycle event from `sys.monitoring`;
/// the code object has already been interned, so implementations receive the
/// stable frame id. Default implementations let a backend subscribe to only
/// the events it cares about.
///
/// Every callback returns a `CallbackResult` so implementations can propagate
/// Python exceptions or request that the interpreter disables future events
/// for a location by yielding `CallbackOutcome::DisableLocation`.
pub trait FrameTracer: Send {
    /// The event set the tracer wants to receive.
    fn interest(&self) -> EventSet {
        NO_EVENTS
    }

    /// A Python function began executing (frame on stack).
    fn on_py_start(&mut self, _py: Python<'_>, _frame_id: FrameId) -> CallbackResult {
        Ok(CallbackOutcome::Continue)
    }

    /// A generator or coroutine resumed (not via `throw()`).
    fn on_py_resume(&mut self, _py: Python<'_>, _frame_id: FrameId) -> CallbackResult {
        Ok(CallbackOutcome::Continue)
    }

    /// A Python function is about to return.
    fn on_py_return(&mut self, _py: Python<'_>, _frame_id: FrameId) -> CallbackResult {
        Ok(CallbackOutcome::Continue)
    }

    /// A Python function is about to yield.
    fn on_py_yield(&mut self, _py: Python<'_>, _frame_id: FrameId) -> CallbackResult {
        Ok(CallbackOutcome::Continue)
    }

    /// A Python function is exiting during exception unwinding.
    fn on_py_unwind(&mut self, _py: Python<'_>, _frame_id: FrameId) -> CallbackResult {
        Ok(CallbackOutcome::Continue)
    }

    /// A generator or coroutine was resumed by `throw()`.
    fn on_py_throw(&mut self, _py: Python<'_>, _frame_id: FrameId) -> CallbackResult {
        Ok(CallbackOutcome::Continue)
    }

    /// Flush any buffered state to storage. Default is a no-op.
    fn flush(&mut self, _py: Python<'_>) -> PyResult<()> {
        Ok(())
    }

    /// Finish and close any underlying writers. Default is a no-op.
    fn finish(&mut self, _py: Python<'_>) -> PyResult<()> {
        Ok(())
    }
}
