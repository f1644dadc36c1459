//! The frame tracer driving the ghost stack.
//!
//! Each frame-lifecycle event mirrors the interpreter's stack onto the
//! per-thread ghost stack and into the record stream. The shim re-entrancy
//! guard is held for the duration of a callback so bookkeeping allocations
//! stay out of the capture.

use pyo3::prelude::*;

use crate::hooks::{self, RecursionGuard};
use crate::monitoring::{CallbackOutcome, CallbackResult, EventSet, FrameTracer};
use crate::records::FrameId;
use crate::tracker;

pub struct HeapFrameTracer {
    trace_python_allocators: bool,
}

impl HeapFrameTracer {
    pub fn new(trace_python_allocators: bool) -> Self {
        Self {
            trace_python_allocators,
        }
    }

    fn push(&self, frame_id: FrameId) -> CallbackResult {
        if let Some(_guard) = RecursionGuard::acquire() {
            tracker::record_frame_push(frame_id);
        }
        Ok(CallbackOutcome::Continue)
    }

    fn pop(&self) -> CallbackResult {
        if let Some(_guard) = RecursionGuard::acquire() {
            tracker::record_frame_pop();
        }
        Ok(CallbackOutcome::Continue)
    }
}

impl FrameTracer for HeapFrameTracer {
    fn interest(&self) -> EventSet {
        EventSet::PY_START
            | EventSet::PY_RESUME
            | EventSet::PY_RETURN
            | EventSet::PY_YIELD
            | EventSet::PY_UNWIND
            | EventSet::PY_THROW
    }

    fn on_py_start(&mut self, _py: Python<'_>, frame_id: FrameId) -> CallbackResult {
        self.push(frame_id)
    }

    fn on_py_resume(&mut self, _py: Python<'_>, frame_id: FrameId) -> CallbackResult {
        self.push(frame_id)
    }

    fn on_py_throw(&mut self, _py: Python<'_>, frame_id: FrameId) -> CallbackResult {
        self.push(frame_id)
    }

    fn on_py_return(&mut self, _py: Python<'_>, _frame_id: FrameId) -> CallbackResult {
        self.pop()
    }

    fn on_py_yield(&mut self, _py: Python<'_>, _frame_id: FrameId) -> CallbackResult {
        self.pop()
    }

    fn on_py_unwind(&mut self, _py: Python<'_>, _frame_id: FrameId) -> CallbackResult {
        self.pop()
    }

    fn flush(&mut self, _py: Python<'_>) -> PyResult<()> {
        tracker::flush().map_err(crate::errors::to_py_err)
    }

    fn finish(&mut self, py: Python<'_>) -> PyResult<()> {
        if self.trace_python_allocators {
            hooks::pymalloc::remove(py);
        }
        tracker::stop().map_err(crate::errors::to_py_err)
    }
}
