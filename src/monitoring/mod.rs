//! `sys.monitoring` plumbing: tool id acquisition, event-set translation and
//! callback registration for the frame-lifecycle events the ghost stack
//! consumes.

mod api;
mod callbacks;
mod install;

pub use api::FrameTracer;
pub use install::{
    flush_installed_tracer, install_tracer, seed_current_stack, uninstall_tracer,
};

use bitflags::bitflags;
use pyo3::prelude::*;
use pyo3::types::PyAny;

/// Outcome of a single callback invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    Continue,
    /// Ask the interpreter to stop reporting this location.
    DisableLocation,
}

/// Every callback can raise into the interpreter or steer monitoring.
pub type CallbackResult = PyResult<CallbackOutcome>;

bitflags! {
    /// Frame-lifecycle events, in crate-local bit positions. Translated to
    /// the interpreter's event mask through [`MonitoringEvents`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventSet: u32 {
        const PY_START = 1 << 0;
        const PY_RESUME = 1 << 1;
        const PY_RETURN = 1 << 2;
        const PY_YIELD = 1 << 3;
        const PY_UNWIND = 1 << 4;
        const PY_THROW = 1 << 5;
    }
}

pub const NO_EVENTS: EventSet = EventSet::empty();

/// Interpreter-assigned event numbers, read from `sys.monitoring.events`.
pub struct MonitoringEvents {
    py_start: u32,
    py_resume: u32,
    py_return: u32,
    py_yield: u32,
    py_unwind: u32,
    py_throw: u32,
}

impl MonitoringEvents {
    fn interpreter_mask(&self, events: EventSet) -> u32 {
        let mut mask = 0;
        for (flag, id) in [
            (EventSet::PY_START, self.py_start),
            (EventSet::PY_RESUME, self.py_resume),
            (EventSet::PY_RETURN, self.py_return),
            (EventSet::PY_YIELD, self.py_yield),
            (EventSet::PY_UNWIND, self.py_unwind),
            (EventSet::PY_THROW, self.py_throw),
        ] {
            if events.contains(flag) {
                mask |= id;
            }
        }
        mask
    }
}

/// A claimed `sys.monitoring` tool slot.
pub struct ToolId {
    id: u8,
}

const TOOL_NAME: &str = "codetracer-heap-recorder";
const MAX_TOOL_ID: u8 = 5;

fn monitoring<'py>(py: Python<'py>) -> PyResult<Bound<'py, PyAny>> {
    py.import("sys")?.getattr("monitoring")
}

pub(crate) fn monitoring_events(py: Python<'_>) -> PyResult<MonitoringEvents> {
    let events = monitoring(py)?.getattr("events")?;
    Ok(MonitoringEvents {
        py_start: events.getattr("PY_START")?.extract()?,
        py_resume: events.getattr("PY_RESUME")?.extract()?,
        py_return: events.getattr("PY_RETURN")?.extract()?,
        py_yield: events.getattr("PY_YIELD")?.extract()?,
        py_unwind: events.getattr("PY_UNWIND")?.extract()?,
        py_throw: events.getattr("PY_THROW")?.extract()?,
    })
}

/// Claim the first free tool slot.
pub(crate) fn acquire_tool_id(py: Python<'_>) -> PyResult<ToolId> {
    let monitoring = monitoring(py)?;
    let mut last_error = None;
    for id in 0..=MAX_TOOL_ID {
        match monitoring.call_method1("use_tool_id", (id, TOOL_NAME)) {
            Ok(_) => return Ok(ToolId { id }),
            Err(err) => last_error = Some(err),
        }
    }
    Err(last_error.expect("at least one tool id was attempted"))
}

pub(crate) fn free_tool_id(py: Python<'_>, tool: &ToolId) -> PyResult<()> {
    monitoring(py)?.call_method1("free_tool_id", (tool.id,))?;
    Ok(())
}

pub(crate) fn set_events(py: Python<'_>, tool: &ToolId, events: EventSet) -> PyResult<()> {
    let monitoring = monitoring(py)?;
    let mask = if events == NO_EVENTS {
        0
    } else {
        monitoring_events(py)?.interpreter_mask(events)
    };
    monitoring.call_method1("set_events", (tool.id, mask))?;
    Ok(())
}

pub(crate) fn register_callback(
    py: Python<'_>,
    tool: &ToolId,
    event_id: u32,
    callback: Option<&Bound<'_, PyAny>>,
) -> PyResult<()> {
    let monitoring = monitoring(py)?;
    match callback {
        Some(callback) => {
            monitoring.call_method1("register_callback", (tool.id, event_id, callback))?
        }
        None => monitoring.call_method1("register_callback", (tool.id, event_id, py.None()))?,
    };
    Ok(())
}
