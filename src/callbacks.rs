//! Cross-loop awaitables: Python-visible objects returned by `.aio` entries
//! that resolve on a *caller* loop once work finalizes on the *background*
//! loop.
//!
//! These capture whichever loop the *caller* is running on at submission
//! time, since any number of independent user loops may each submit work to
//! the one background loop.

use pyo3::exceptions::PyStopIteration;
use pyo3::prelude::*;
use pyo3::types::PyDict;
use std::sync::{atomic, Arc, OnceLock, RwLock};
use tokio::sync::Notify;

#[repr(u8)]
enum AwaitableState {
    Pending = 0,
    Completed = 1,
    Cancelled = 2,
}

/// Outcome of a background coroutine, ready to be handed back across the
/// loop boundary. `Err` carries an already-translated `PyErr` (translation
/// of the *value* inside the error, if any, is explicitly not attempted).
pub(crate) type BridgeResult = Result<Py<PyAny>, PyErr>;

/// A future-like object, valid on exactly one (caller) event loop, that the
/// background loop resolves via `call_soon_threadsafe` once the submitted
/// coroutine finalizes. Implements the informal `asyncio.Future` duck-type:
/// `__await__`, `add_done_callback`, `cancel`, `result`, `exception`, `done`,
/// plus the `_asyncio_future_blocking` marker attribute asyncio's `Task`
/// machinery inspects to decide whether to suspend on it.
#[pyclass(frozen)]
pub(crate) struct PyFutureAwaitable {
    state: atomic::AtomicU8,
    result: OnceLock<BridgeResult>,
    caller_loop: Py<PyAny>,
    cancel_notify: Arc<Notify>,
    py_block: atomic::AtomicBool,
    ack: RwLock<Option<(Py<PyAny>, Py<PyDict>)>>,
}

impl PyFutureAwaitable {
    pub(crate) fn new(caller_loop: Py<PyAny>) -> (Self, Arc<Notify>) {
        let cancel_notify = Arc::new(Notify::new());
        (
            Self {
                state: atomic::AtomicU8::new(AwaitableState::Pending as u8),
                result: OnceLock::new(),
                caller_loop,
                cancel_notify: cancel_notify.clone(),
                py_block: true.into(),
                ack: RwLock::new(None),
            },
            cancel_notify,
        )
    }

    /// Called from the background loop thread once the submitted coroutine
    /// has finalized. Schedules the done-callback on the caller loop.
    pub(crate) fn set_result(pyself: Py<Self>, py: Python<'_>, result: BridgeResult) {
        let rself = pyself.get();
        let _ = rself.result.set(result);

        if rself
            .state
            .compare_exchange(
                AwaitableState::Pending as u8,
                AwaitableState::Completed as u8,
                atomic::Ordering::Release,
                atomic::Ordering::Relaxed,
            )
            .is_err()
        {
            return;
        }

        let ack = rself.ack.read().unwrap();
        if let Some((cb, ctx)) = &*ack {
            let _ = rself.caller_loop.call_method(
                py,
                pyo3::intern!(py, "call_soon_threadsafe"),
                (cb, pyself.clone_ref(py)),
                Some(ctx.bind(py)),
            );
        }
    }
}

#[pymethods]
impl PyFutureAwaitable {
    fn __await__(pyself: PyRef<'_, Self>) -> PyRef<'_, Self> {
        pyself
    }

    fn __iter__(pyself: PyRef<'_, Self>) -> PyRef<'_, Self> {
        pyself
    }

    fn __next__(pyself: PyRef<'_, Self>) -> PyResult<Option<PyRef<'_, Self>>> {
        if pyself.state.load(atomic::Ordering::Acquire) == AwaitableState::Completed as u8 {
            let py = pyself.py();
            return match pyself.result.get().unwrap() {
                Ok(v) => Err(PyStopIteration::new_err(v.clone_ref(py))),
                Err(err) => Err(err.clone_ref(py)),
            };
        }
        Ok(Some(pyself))
    }

    #[getter(_asyncio_future_blocking)]
    fn get_block(&self) -> bool {
        self.py_block.load(atomic::Ordering::Relaxed)
    }

    #[setter(_asyncio_future_blocking)]
    fn set_block(&self, val: bool) {
        self.py_block.store(val, atomic::Ordering::Relaxed);
    }

    fn get_loop(&self, py: Python<'_>) -> Py<PyAny> {
        self.caller_loop.clone_ref(py)
    }

    #[pyo3(signature = (cb, context=None))]
    fn add_done_callback(pyself: PyRef<'_, Self>, cb: Py<PyAny>, context: Option<Py<PyAny>>) -> PyResult<()> {
        let py = pyself.py();
        let kwctx = PyDict::new(py);
        kwctx.set_item(pyo3::intern!(py, "context"), context)?;

        if pyself.state.load(atomic::Ordering::Acquire) == AwaitableState::Pending as u8 {
            *pyself.ack.write().unwrap() = Some((cb, kwctx.unbind()));
        } else {
            let caller_loop = pyself.caller_loop.clone_ref(py);
            caller_loop.call_method(py, pyo3::intern!(py, "call_soon"), (cb, pyself), Some(&kwctx))?;
        }
        Ok(())
    }

    #[allow(unused)]
    fn remove_done_callback(&self, _cb: Py<PyAny>) -> i32 {
        *self.ack.write().unwrap() = None;
        1
    }

    #[pyo3(signature = (msg=None))]
    fn cancel(pyself: PyRef<'_, Self>, msg: Option<Py<PyAny>>) -> bool {
        let _ = msg;
        if pyself
            .state
            .compare_exchange(
                AwaitableState::Pending as u8,
                AwaitableState::Cancelled as u8,
                atomic::Ordering::Release,
                atomic::Ordering::Relaxed,
            )
            .is_err()
        {
            return false;
        }

        // Wake the background task so it can unwind: cancelling the
        // awaitable returned by `.aio` cancels the underlying background
        // task.
        pyself.cancel_notify.notify_one();

        let ack = pyself.ack.read().unwrap();
        if let Some((cb, ctx)) = &*ack {
            let py = pyself.py();
            let caller_loop = pyself.caller_loop.clone_ref(py);
            let cb = cb.clone_ref(py);
            let ctx = ctx.clone_ref(py);
            drop(ack);
            let _ = caller_loop.call_method(py, pyo3::intern!(py, "call_soon"), (cb, pyself), Some(ctx.bind(py)));
        }
        true
    }

    fn done(&self) -> bool {
        self.state.load(atomic::Ordering::Acquire) != AwaitableState::Pending as u8
    }

    fn result(&self, py: Python<'_>) -> PyResult<Py<PyAny>> {
        match self.state.load(atomic::Ordering::Acquire) {
            s if s == AwaitableState::Completed as u8 => match self.result.get().unwrap() {
                Ok(v) => Ok(v.clone_ref(py)),
                Err(err) => Err(err.clone_ref(py)),
            },
            s if s == AwaitableState::Cancelled as u8 => {
                Err(crate::error::cancelled_err(py, "Future cancelled."))
            }
            _ => Err(pyo3::exceptions::PyRuntimeError::new_err("result is not ready")),
        }
    }

    fn exception(&self, py: Python<'_>) -> PyResult<Py<PyAny>> {
        match self.state.load(atomic::Ordering::Acquire) {
            s if s == AwaitableState::Completed as u8 => match self.result.get().unwrap() {
                Ok(_) => Ok(py.None()),
                Err(err) => Err(err.clone_ref(py)),
            },
            s if s == AwaitableState::Cancelled as u8 => {
                Err(crate::error::cancelled_err(py, "Future cancelled."))
            }
            _ => Err(pyo3::exceptions::PyRuntimeError::new_err("exception is not set")),
        }
    }
}

/// Single-shot awaitable used for the one-step "bare yield" protocol when
/// advancing a wrapped async generator. Lighter than `PyFutureAwaitable`
/// since no cross-loop cancellation plumbing is required for a single step.
#[pyclass(frozen)]
pub(crate) struct PyIterAwaitable {
    result: OnceLock<BridgeResult>,
}

impl PyIterAwaitable {
    pub(crate) fn new() -> Self {
        Self { result: OnceLock::new() }
    }

    pub(crate) fn set_result(pyself: Py<Self>, _py: Python<'_>, result: BridgeResult) {
        let _ = pyself.get().result.set(result);
    }
}

#[pymethods]
impl PyIterAwaitable {
    fn __await__(pyself: PyRef<'_, Self>) -> PyRef<'_, Self> {
        pyself
    }
    fn __iter__(pyself: PyRef<'_, Self>) -> PyRef<'_, Self> {
        pyself
    }

    fn __next__(&self, py: Python<'_>) -> PyResult<Option<Py<PyAny>>> {
        match self.result.get() {
            Some(Ok(v)) => Err(PyStopIteration::new_err(v.clone_ref(py))),
            Some(Err(err)) => Err(err.clone_ref(py)),
            None => Ok(Some(py.None())),
        }
    }
}
