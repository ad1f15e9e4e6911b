//! Small helpers for reaching into `asyncio`/`contextvars`. The imported
//! modules are cached in a `GILOnceCell` to avoid re-importing on every call.

use pyo3::exceptions::PyRuntimeError;
use pyo3::prelude::*;
use pyo3::sync::GILOnceCell;
use pyo3::types::PyDict;

static ASYNCIO: GILOnceCell<Py<PyModule>> = GILOnceCell::new();
static CONTEXTVARS: GILOnceCell<Py<PyModule>> = GILOnceCell::new();

pub(crate) fn asyncio(py: Python<'_>) -> PyResult<Py<PyModule>> {
    ASYNCIO
        .get_or_try_init(py, || py.import("asyncio").map(Bound::unbind))
        .map(|m| m.clone_ref(py))
}

fn contextvars(py: Python<'_>) -> PyResult<Py<PyModule>> {
    CONTEXTVARS
        .get_or_try_init(py, || py.import("contextvars").map(Bound::unbind))
        .map(|m| m.clone_ref(py))
}

/// Copy the current `contextvars.Context`, used so a coroutine scheduled onto
/// the background loop observes the caller's context, as if it ran in place.
pub(crate) fn copy_context(py: Python<'_>) -> PyResult<Py<PyAny>> {
    let ctx = contextvars(py)?.getattr(py, "copy_context")?.call0(py)?;
    Ok(ctx)
}

/// `asyncio.ensure_future`, used by the Loop Host to schedule an arbitrary
/// awaitable as a cancellable `Task` on the background loop.
pub(crate) fn ensure_future(py: Python<'_>, awaitable: Py<PyAny>) -> PyResult<Py<PyAny>> {
    asyncio(py)?.call_method1(py, "ensure_future", (awaitable,))
}

/// The one piece of runtime reflection the dispatcher needs: "is a
/// cooperative event loop currently running on *this* OS thread?"
/// `asyncio.get_running_loop` raises `RuntimeError` with no running loop
/// instead of returning `None`, so we trap that specific condition rather
/// than doing an isinstance check.
pub(crate) fn get_running_loop(py: Python<'_>) -> PyResult<Option<Py<PyAny>>> {
    match asyncio(py)?.call_method0(py, "get_running_loop") {
        Ok(loop_obj) => Ok(Some(loop_obj)),
        Err(err) if err.is_instance_of::<PyRuntimeError>(py) => Ok(None),
        Err(err) => Err(err),
    }
}

static IDENTITY_COROUTINE: GILOnceCell<Py<PyAny>> = GILOnceCell::new();

/// A cached `async def _identity(value): return value`, used to give a
/// plain (synchronous) wrapped member a `.aio` form that is a real
/// awaitable without routing a non-async call through the background loop.
/// Built once via `py.run` and reused for every plain member's `.aio`.
pub(crate) fn identity_coroutine_fn(py: Python<'_>) -> PyResult<Py<PyAny>> {
    IDENTITY_COROUTINE
        .get_or_try_init(py, || {
            let namespace = PyDict::new(py);
            py.run(
                pyo3::ffi::c_str!("async def _aiobridge_identity(value):\n    return value\n"),
                Some(&namespace),
                Some(&namespace),
            )?;
            namespace
                .get_item("_aiobridge_identity")?
                .map(|f| f.unbind())
                .ok_or_else(|| PyRuntimeError::new_err("failed to build identity coroutine"))
        })
        .map(|f| f.clone_ref(py))
}

