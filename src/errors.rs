//! Shared helpers for translating `RecorderError` into Python exceptions.

use pyo3::PyErr;
use recorder_errors::{RecorderError, RecorderResult};

/// Convenient alias for recorder results used across the Rust modules.
pub type Result<T> = RecorderResult<T>;

/// Convert a `RecorderError` into a `PyErr` carrying the stable error code
/// alongside the human-readable message and context payload.
pub fn to_py_err(err: RecorderError) -> PyErr {
    crate::ffi::map_recorder_error(err)
}
