//! Interning of Python code objects under stable frame ids.
//!
//! A code object is described once per capture: the first sighting extracts
//! `(function, filename, first line, location table)` and emits the stream
//! record, after which the id is a cheap lookup. Ids start at 1; zero is the
//! reserved "unknown frame" value.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use pyo3::prelude::*;
use pyo3::types::PyCode;

use crate::records::{CodeObjectInfo, FrameId};
use crate::tracker;

#[derive(Default)]
pub struct CodeObjectRegistry {
    by_code_id: DashMap<usize, FrameId>,
    next_frame_id: AtomicU64,
}

impl CodeObjectRegistry {
    /// Frame id for a code object, interning it on first sighting. The
    /// stream record is written before the id is published so every later
    /// reference points at an earlier record.
    pub fn get_or_intern(&self, _py: Python<'_>, code: &Bound<'_, PyCode>) -> PyResult<FrameId> {
        let key = code.as_ptr() as usize;
        match self.by_code_id.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(entry) => Ok(*entry.get()),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let frame_id = self.next_frame_id.fetch_add(1, Ordering::SeqCst) + 1;
                let info = extract_code_info(code)?;
                tracker::write_code_object(frame_id, &info);
                entry.insert(frame_id);
                Ok(frame_id)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.by_code_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code_id.is_empty()
    }
}

fn extract_code_info(code: &Bound<'_, PyCode>) -> PyResult<CodeObjectInfo> {
    let function_name: String = match code.getattr("co_qualname") {
        Ok(qualname) => qualname.extract()?,
        Err(_) => code.getattr("co_name")?.extract()?,
    };
    let filename: String = code.getattr("co_filename")?.extract()?;
    let first_line_no: u32 = code.getattr("co_firstlineno")?.extract()?;
    let line_table: Vec<u8> = code.getattr("co_linetable")?.extract()?;
    Ok(CodeObjectInfo {
        function_name,
        filename,
        first_line_no,
        line_table,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_code<'py>(py: Python<'py>, source: &str) -> Bound<'py, PyCode> {
        let builtins = py.import("builtins").expect("builtins");
        let code = builtins
            .getattr("compile")
            .expect("compile")
            .call1((source, "<registry-test>", "exec"))
            .expect("compiled");
        code.downcast_into::<PyCode>().expect("code object")
    }

    #[test]
    fn interning_is_stable_per_code_object() {
        Python::with_gil(|py| {
            let registry = CodeObjectRegistry::default();
            let code_a = compile_code(py, "a = 1");
            let code_b = compile_code(py, "b = 2");

            let id_a = registry.get_or_intern(py, &code_a).expect("intern a");
            let id_b = registry.get_or_intern(py, &code_b).expect("intern b");
            assert_ne!(id_a, 0, "zero is reserved for unknown frames");
            assert_ne!(id_a, id_b);
            assert_eq!(registry.get_or_intern(py, &code_a).expect("again"), id_a);
            assert_eq!(registry.len(), 2);
        });
    }

    #[test]
    fn extraction_reads_the_code_metadata() {
        Python::with_gil(|py| {
            let code = compile_code(py, "x = 40 + 2");
            let info = extract_code_info(&code).expect("extract");
            assert_eq!(info.filename, "<registry-test>");
            assert_eq!(info.first_line_no, 1);
            assert!(!info.line_table.is_empty());
        });
    }
}
