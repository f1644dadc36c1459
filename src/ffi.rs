//! FFI helpers bridging `RecorderError` into Python exceptions with panic
//! containment.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use pyo3::create_exception;
use pyo3::exceptions::PyException;
use pyo3::prelude::*;
use recorder_errors::{ErrorCode, ErrorKind, RecorderError};

use crate::logging;

create_exception!(codetracer_heap_recorder, PyRecorderError, PyException);
create_exception!(codetracer_heap_recorder, PyUsageError, PyRecorderError);
create_exception!(
    codetracer_heap_recorder,
    PyEnvironmentError,
    PyRecorderError
);
create_exception!(codetracer_heap_recorder, PyTargetError, PyRecorderError);
create_exception!(codetracer_heap_recorder, PyInternalError, PyRecorderError);

/// Register the recorder exception hierarchy into the Python module.
pub fn register_exceptions(module: &Bound<'_, PyModule>) -> PyResult<()> {
    let py = module.py();
    module.add("RecorderError", py.get_type::<PyRecorderError>())?;
    module.add("UsageError", py.get_type::<PyUsageError>())?;
    module.add("EnvironmentError", py.get_type::<PyEnvironmentError>())?;
    module.add("TargetError", py.get_type::<PyTargetError>())?;
    module.add("InternalError", py.get_type::<PyInternalError>())?;
    Ok(())
}

/// Convert a captured panic into a `PyInternalError` while logging the payload.
pub(crate) fn panic_to_pyerr(label: &'static str, payload: Box<dyn Any + Send>) -> PyErr {
    handle_panic(label, payload)
}

fn handle_panic(label: &'static str, payload: Box<dyn Any + Send>) -> PyErr {
    let message = panic_payload_to_string(&payload);
    logging::record_panic(label);
    map_recorder_error(RecorderError::new(
        ErrorKind::Internal,
        ErrorCode::Unknown,
        format!("panic in {label}: {message}"),
    ))
}

fn panic_payload_to_string(payload: &Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

/// Map a `RecorderError` into the appropriate Python exception subclass.
pub fn map_recorder_error(err: RecorderError) -> PyErr {
    logging::log_recorder_error("recorder_error", &err);
    logging::emit_error_trailer(&err);

    let text = err.to_string();
    let code = err.code;
    let kind = err.kind;

    let pyerr = match kind {
        ErrorKind::Usage => PyUsageError::new_err(text),
        ErrorKind::Environment => PyEnvironmentError::new_err(text),
        ErrorKind::Target => PyTargetError::new_err(text),
        _ => PyInternalError::new_err(text),
    };

    Python::with_gil(|py| {
        let instance = pyerr.value(py);
        let _ = instance.setattr("code", code.as_str());
        let _ = instance.setattr("kind", format!("{:?}", kind));
    });

    pyerr
}

/// Helper that guards a `#[pyfunction]` implementation, catching panics while
/// leaving existing `PyResult` usage intact.
pub fn wrap_pyfunction<T, F>(label: &'static str, operation: F) -> PyResult<T>
where
    F: FnOnce() -> PyResult<T>,
{
    match catch_unwind(AssertUnwindSafe(operation)) {
        Ok(result) => result,
        Err(panic_payload) => Err(handle_panic(label, panic_payload)),
    }
}
