//! Tracer installation plumbing backed by the callbacks module.

use log::warn;
use pyo3::{prelude::*, types::PyModule};
use recorder_errors::{usage, ErrorCode};

use crate::code_object::CodeObjectRegistry;
use crate::ffi;

use super::api::FrameTracer;
use super::callbacks::{self, Global, GLOBAL};
use super::{acquire_tool_id, free_tool_id, set_events, NO_EVENTS};

pub(super) fn uninstall_locked(py: Python<'_>, guard: &mut Option<Global>) -> PyResult<()> {
    if let Some(mut global) = guard.take() {
        let finish_result = global.tracer.finish(py);

        let cleanup_result = (|| -> PyResult<()> {
            callbacks::unregister_enabled_callbacks(py, &global.tool, &global.mask)?;
            set_events(py, &global.tool, NO_EVENTS)?;
            free_tool_id(py, &global.tool)?;
            Ok(())
        })();

        if let Err(err) = finish_result {
            if let Err(cleanup_err) = cleanup_result {
                warn!(
                    "failed to reset monitoring callbacks after finish error: {}",
                    cleanup_err
                );
            }
            return Err(err);
        }

        cleanup_result?;
    }
    Ok(())
}

/// Install a tracer and hook it into Python's `sys.monitoring`.
pub fn install_tracer(py: Python<'_>, tracer: Box<dyn FrameTracer>) -> PyResult<()> {
    let mut guard = GLOBAL.lock().unwrap();
    if guard.is_some() {
        return Err(ffi::map_recorder_error(usage!(
            ErrorCode::TracerInstallConflict,
            "tracer already installed"
        )));
    }

    let tool = acquire_tool_id(py)?;
    let monitoring = py.import("sys")?.getattr("monitoring")?;
    let disable_sentinel = monitoring.getattr("DISABLE")?.unbind();

    let module = PyModule::new(py, "_heap_recorder_callbacks")?;

    let mask = tracer.interest();
    callbacks::register_enabled_callbacks(py, &module, &tool, &mask)?;
    set_events(py, &tool, mask)?;

    *guard = Some(Global {
        registry: CodeObjectRegistry::default(),
        tracer,
        mask,
        tool,
        disable_sentinel,
    });
    Ok(())
}

/// Remove the installed tracer if any.
pub fn uninstall_tracer(py: Python<'_>) -> PyResult<()> {
    let mut guard = GLOBAL.lock().unwrap();
    uninstall_locked(py, &mut guard)
}

/// Flush the currently installed tracer if any.
pub fn flush_installed_tracer(py: Python<'_>) -> PyResult<()> {
    if let Some(global) = GLOBAL.lock().unwrap().as_mut() {
        global.tracer.flush(py)?;
    }
    Ok(())
}

/// Mirror the frames already on the interpreter stack into the ghost stack,
/// then emit their push sequence so the reader can reconstruct a stack that
/// predates the stream.
pub fn seed_current_stack(py: Python<'_>) -> PyResult<()> {
    use pyo3::types::PyCode;

    let guard = GLOBAL.lock().unwrap();
    let Some(global) = guard.as_ref() else {
        return Ok(());
    };

    let sys = py.import("sys")?;
    let mut frames = Vec::new();
    let mut frame = sys.call_method1("_getframe", (0,)).ok();
    while let Some(current) = frame {
        frames.push(current.getattr("f_code")?.downcast_into::<PyCode>()?);
        let back = current.getattr("f_back")?;
        frame = if back.is_none() { None } else { Some(back) };
    }

    // Outermost first, so pops during normal unwinding stay balanced.
    for code in frames.iter().rev() {
        let frame_id = global.registry.get_or_intern(py, code)?;
        crate::shadow_stack::push_frame(frame_id);
    }
    drop(guard);
    crate::tracker::snapshot_stack_to_writer();
    Ok(())
}
