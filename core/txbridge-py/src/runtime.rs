//! The Python GIL as the bridge's host execution lock.

use pyo3::prelude::*;
use txbridge_core::HostRuntime;

/// Host runtime backed by the CPython GIL.
#[derive(Debug, Default, Clone, Copy)]
pub struct GilRuntime;

fn gil_held() -> bool {
    // SAFETY: PyGILState_Check only reads the current thread state.
    unsafe { pyo3::ffi::PyGILState_Check() == 1 }
}

impl HostRuntime for GilRuntime {
    fn enter(&self, f: &mut dyn FnMut()) {
        Python::with_gil(|_py| f())
    }

    fn detach(&self, f: &mut (dyn FnMut() + Send)) {
        if gil_held() {
            Python::with_gil(|py| py.allow_threads(|| f()))
        } else {
            f()
        }
    }

    fn name(&self) -> &'static str {
        "python-gil"
    }
}
