//! `sys.monitoring` callback metadata and helpers.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;

use log::error;
use pyo3::prelude::*;
use pyo3::types::{PyAny, PyCode, PyModule};
use pyo3::wrap_pyfunction;

use crate::code_object::CodeObjectRegistry;
use crate::ffi;
use crate::logging;
use crate::policy::{self, OnRecorderError};
use crate::records::FrameId;

use super::api::FrameTracer;
use super::{monitoring_events, register_callback, CallbackOutcome, CallbackResult, EventSet, ToolId};

/// Global tracer state shared between callback invocations and installer.
pub(super) struct Global {
    pub(super) registry: CodeObjectRegistry,
    pub(super) tracer: Box<dyn FrameTracer>,
    pub(super) mask: EventSet,
    pub(super) tool: ToolId,
    pub(super) disable_sentinel: Py<PyAny>,
}

pub(super) static GLOBAL: Mutex<Option<Global>> = Mutex::new(None);

fn catch_callback<F>(label: &'static str, callback: F) -> CallbackResult
where
    F: FnOnce() -> CallbackResult,
{
    match catch_unwind(AssertUnwindSafe(callback)) {
        Ok(result) => result,
        Err(payload) => Err(ffi::panic_to_pyerr(label, payload)),
    }
}

fn call_tracer<F>(
    py: Python<'_>,
    guard: &mut Option<Global>,
    code: &Bound<'_, PyCode>,
    label: &'static str,
    callback: F,
) -> CallbackResult
where
    F: FnOnce(&mut dyn FrameTracer, FrameId) -> CallbackResult,
{
    let global = guard.as_mut().expect("tracer installed");
    let frame_id = global.registry.get_or_intern(py, code)?;
    let tracer = global.tracer.as_mut();
    catch_callback(label, || callback(tracer, frame_id))
}

fn handle_callback_result(
    py: Python<'_>,
    guard: &mut Option<Global>,
    result: CallbackResult,
) -> PyResult<Py<PyAny>> {
    match result {
        Ok(CallbackOutcome::Continue) => Ok(py.None()),
        Ok(CallbackOutcome::DisableLocation) => Ok(guard
            .as_ref()
            .map(|global| global.disable_sentinel.clone_ref(py))
            .unwrap_or_else(|| py.None())),
        Err(err) => handle_callback_error(py, guard, err),
    }
}

fn handle_callback_error(
    py: Python<'_>,
    guard: &mut Option<Global>,
    err: PyErr,
) -> PyResult<Py<PyAny>> {
    let policy = policy::policy_snapshot();
    match policy.on_recorder_error {
        OnRecorderError::Abort => Err(err),
        OnRecorderError::Disable => {
            let message = err.to_string();
            logging::record_detach("policy_disable");
            error!("frame callback error; disabling capture per policy: {}", message);
            super::install::uninstall_locked(py, guard)?;
            Ok(py.None())
        }
    }
}

macro_rules! frame_callback {
    ($name:ident, $label:literal, $method:ident) => {
        #[pyfunction]
        pub(super) fn $name(
            py: Python<'_>,
            code: Bound<'_, PyCode>,
            _instruction_offset: i32,
        ) -> PyResult<Py<PyAny>> {
            ffi::wrap_pyfunction($label, || {
                let mut guard = GLOBAL.lock().unwrap();
                if guard.is_none() {
                    return Ok(py.None());
                }
                let result = call_tracer(py, &mut guard, &code, $label, |tracer, frame_id| {
                    tracer.$method(py, frame_id)
                });
                handle_callback_result(py, &mut guard, result)
            })
        }
    };
    ($name:ident, $label:literal, $method:ident, with_value) => {
        #[pyfunction]
        pub(super) fn $name(
            py: Python<'_>,
            code: Bound<'_, PyCode>,
            _instruction_offset: i32,
            _value: Bound<'_, PyAny>,
        ) -> PyResult<Py<PyAny>> {
            ffi::wrap_pyfunction($label, || {
                let mut guard = GLOBAL.lock().unwrap();
                if guard.is_none() {
                    return Ok(py.None());
                }
                let result = call_tracer(py, &mut guard, &code, $label, |tracer, frame_id| {
                    tracer.$method(py, frame_id)
                });
                handle_callback_result(py, &mut guard, result)
            })
        }
    };
}

frame_callback!(callback_py_start, "callback_py_start", on_py_start);
frame_callback!(callback_py_resume, "callback_py_resume", on_py_resume);
frame_callback!(callback_py_return, "callback_py_return", on_py_return, with_value);
frame_callback!(callback_py_yield, "callback_py_yield", on_py_yield, with_value);
frame_callback!(callback_py_unwind, "callback_py_unwind", on_py_unwind, with_value);
frame_callback!(callback_py_throw, "callback_py_throw", on_py_throw, with_value);

/// Register the callbacks enabled by `mask` into the tool slot.
pub(super) fn register_enabled_callbacks(
    py: Python<'_>,
    module: &Bound<'_, PyModule>,
    tool: &ToolId,
    mask: &EventSet,
) -> PyResult<()> {
    let events = monitoring_events(py)?;
    let bindings: [(EventSet, u32, Bound<'_, PyAny>); 6] = [
        (
            EventSet::PY_START,
            events.py_start,
            wrap_pyfunction!(callback_py_start, module)?.into_any(),
        ),
        (
            EventSet::PY_RESUME,
            events.py_resume,
            wrap_pyfunction!(callback_py_resume, module)?.into_any(),
        ),
        (
            EventSet::PY_RETURN,
            events.py_return,
            wrap_pyfunction!(callback_py_return, module)?.into_any(),
        ),
        (
            EventSet::PY_YIELD,
            events.py_yield,
            wrap_pyfunction!(callback_py_yield, module)?.into_any(),
        ),
        (
            EventSet::PY_UNWIND,
            events.py_unwind,
            wrap_pyfunction!(callback_py_unwind, module)?.into_any(),
        ),
        (
            EventSet::PY_THROW,
            events.py_throw,
            wrap_pyfunction!(callback_py_throw, module)?.into_any(),
        ),
    ];
    for (flag, event_id, callback) in &bindings {
        if mask.contains(*flag) {
            register_callback(py, tool, *event_id, Some(callback))?;
        }
    }
    Ok(())
}

/// Drop every callback registered by [`register_enabled_callbacks`].
pub(super) fn unregister_enabled_callbacks(
    py: Python<'_>,
    tool: &ToolId,
    mask: &EventSet,
) -> PyResult<()> {
    let events = monitoring_events(py)?;
    let bindings = [
        (EventSet::PY_START, events.py_start),
        (EventSet::PY_RESUME, events.py_resume),
        (EventSet::PY_RETURN, events.py_return),
        (EventSet::PY_YIELD, events.py_yield),
        (EventSet::PY_UNWIND, events.py_unwind),
        (EventSet::PY_THROW, events.py_throw),
    ];
    for (flag, event_id) in bindings {
        if mask.contains(flag) {
            register_callback(py, tool, event_id, None)?;
        }
    }
    Ok(())
}
