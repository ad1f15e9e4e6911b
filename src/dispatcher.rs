//! Call Dispatcher: given a wrapped member and a call site, translate
//! inputs, submit to the Loop Host, translate outputs, and shape the result
//! according to the dispatch matrix (blocking call, cooperative call,
//! future-request, async-generator step, async-context-manager enter/exit).
//!
//! Caller-context detection ("is there already a running loop on this
//! thread?") asks `asyncio.get_running_loop` rather than guessing from
//! thread-local state.

use pyo3::prelude::*;
use pyo3::types::{PyDict, PyTuple};
use std::sync::Arc;

use crate::asyncio_util;
use crate::error;
use crate::future_handle::ConcurrentFuture;
use crate::loop_host::{self, LoopHost};
use crate::registry::TranslationRegistry;

/// Everything the Dispatcher needs from the owning Synchronizer, borrowed
/// for the duration of one call. Kept as a small bag of `Arc`s rather than a
/// trait object since there is exactly one real implementation.
#[derive(Clone)]
pub(crate) struct DispatchContext {
    pub(crate) registry: Arc<TranslationRegistry>,
    pub(crate) loop_host: Arc<LoopHost>,
    pub(crate) name: Arc<str>,
}

fn translate_args<'py>(
    ctx: &DispatchContext,
    py: Python<'py>,
    args: &Bound<'py, PyTuple>,
    kwargs: Option<&Bound<'py, PyDict>>,
    translate_io: bool,
) -> PyResult<(Py<PyTuple>, Option<Py<PyDict>>)> {
    if !translate_io {
        let kwargs = kwargs.map(|k| k.clone().unbind());
        return Ok((args.clone().unbind(), kwargs));
    }
    let translated_args = ctx.registry.translate_in(py, args.as_any())?;
    let translated_args = translated_args.bind(py).cast::<PyTuple>()?.clone().unbind();
    let translated_kwargs = match kwargs {
        Some(k) => {
            let t = ctx.registry.translate_in(py, k.as_any())?;
            Some(t.bind(py).cast::<PyDict>()?.clone().unbind())
        }
        None => None,
    };
    Ok((translated_args, translated_kwargs))
}

fn translate_result(ctx: &DispatchContext, py: Python<'_>, value: Py<PyAny>, translate_io: bool, wrap_impl: &dyn Fn(Python<'_>, &Bound<'_, PyAny>) -> PyResult<Py<PyAny>>) -> PyResult<Py<PyAny>> {
    if !translate_io {
        return Ok(value);
    }
    ctx.registry.translate_out(py, value.bind(py), wrap_impl)
}

fn build_coroutine(py: Python<'_>, coro_factory: &Py<PyAny>, args: &Py<PyTuple>, kwargs: Option<&Py<PyDict>>) -> PyResult<Py<PyAny>> {
    coro_factory.call(py, args.bind(py), kwargs.map(|k| k.bind(py)))
}

/// Blocking entry, value result shape (matrix rows 1 and 3: behavior is
/// identical whether or not a cooperative loop happens to be running in the
/// caller's thread — the user explicitly chose the blocking entry).
pub(crate) fn call_blocking(
    ctx: &DispatchContext,
    py: Python<'_>,
    coro_factory: &Py<PyAny>,
    args: &Bound<'_, PyTuple>,
    kwargs: Option<&Bound<'_, PyDict>>,
    translate_io: bool,
    wrap_impl: &dyn Fn(Python<'_>, &Bound<'_, PyAny>) -> PyResult<Py<PyAny>>,
) -> PyResult<Py<PyAny>> {
    if loop_host::is_on_background_loop() {
        return Err(error::misuse_err(format!(
            "synchronizer '{}': blocking entry invoked from its own background loop thread (would deadlock)",
            ctx.name
        )));
    }
    let (targs, tkwargs) = translate_args(ctx, py, args, kwargs, translate_io)?;
    let coro = build_coroutine(py, coro_factory, &targs, tkwargs.as_ref())?;
    let result = ctx.loop_host.run_blocking(py, coro)?;
    translate_result(ctx, py, result, translate_io, wrap_impl)
}

/// Blocking entry, future-requested (`_future=True`): matrix row 2.
pub(crate) fn call_blocking_future(
    ctx: &DispatchContext,
    py: Python<'_>,
    coro_factory: &Py<PyAny>,
    args: &Bound<'_, PyTuple>,
    kwargs: Option<&Bound<'_, PyDict>>,
    translate_io: bool,
) -> PyResult<Py<PyAny>> {
    if loop_host::is_on_background_loop() {
        return Err(error::misuse_err(format!(
            "synchronizer '{}': blocking entry invoked from its own background loop thread (would deadlock)",
            ctx.name
        )));
    }
    let (targs, tkwargs) = translate_args(ctx, py, args, kwargs, translate_io)?;
    let coro = build_coroutine(py, coro_factory, &targs, tkwargs.as_ref())?;
    // Result-shape translation on a scheduled future is applied lazily,
    // inside `ConcurrentFuture::result`, by the caller of this function
    // wrapping the handle — see wrapper.rs's `FutureResultProxy`.
    ctx.loop_host.schedule(py, coro)
}

/// Cooperative entry, value result shape (matrix rows 6 and 7: `.aio` is
/// legal from both a cooperative caller and a blocking caller, since the
/// returned object is itself just a coroutine-like awaitable that does not
/// touch `get_running_loop` until something actually drives it).
pub(crate) fn call_cooperative(
    ctx: &DispatchContext,
    py: Python<'_>,
    coro_factory: &Py<PyAny>,
    args: &Bound<'_, PyTuple>,
    kwargs: Option<&Bound<'_, PyDict>>,
    translate_io: bool,
) -> PyResult<Py<PyAny>> {
    let (targs, tkwargs) = translate_args(ctx, py, args, kwargs, translate_io)?;
    let coro = build_coroutine(py, coro_factory, &targs, tkwargs.as_ref())?;
    let pending = crate::wrapper::LazyCooperativeCall::new(ctx.clone(), coro, translate_io);
    Ok(Py::new(py, pending)?.into_any())
}

/// Called once a `LazyCooperativeCall` is first driven by whatever loop
/// ends up awaiting it: binds to that loop and submits to the background
/// loop.
pub(crate) fn submit_cooperative(ctx: &DispatchContext, py: Python<'_>, coro: Py<PyAny>) -> PyResult<Py<PyAny>> {
    let caller_loop = asyncio_util::get_running_loop(py)?.ok_or_else(|| {
        error::misuse_err("`.aio` awaitable was driven outside any running event loop")
    })?;
    ctx.loop_host.run_cooperative(py, coro, caller_loop)
}

/// Async-generator stepping, blocking side: advances the iterator one item
/// at a time via `run_blocking`.
pub(crate) fn step_blocking(ctx: &DispatchContext, py: Python<'_>, anext_coro_factory: &Py<PyAny>) -> PyResult<Option<Py<PyAny>>> {
    let coro = anext_coro_factory.call0(py)?;
    match ctx.loop_host.run_blocking(py, coro) {
        Ok(v) => Ok(Some(v)),
        Err(err) if is_stop_async_iteration(py, &err) => Ok(None),
        Err(err) => Err(err),
    }
}

/// Async-generator stepping, cooperative side: one `__anext__` submission
/// returning an awaitable that resolves to the next item or raises
/// `StopAsyncIteration`.
pub(crate) fn step_cooperative(ctx: &DispatchContext, py: Python<'_>, anext_coro_factory: &Py<PyAny>) -> PyResult<Py<PyAny>> {
    let coro = anext_coro_factory.call0(py)?;
    let pending = crate::wrapper::LazyCooperativeCall::new(ctx.clone(), coro, false);
    Ok(Py::new(py, pending)?.into_any())
}

fn is_stop_async_iteration(py: Python<'_>, err: &PyErr) -> bool {
    err.get_type(py).name().map(|n| n == "StopAsyncIteration").unwrap_or(false)
}

/// Async-context-manager enter/exit submission: exit always runs to
/// completion even if enter's caller never awaited/used the result, and
/// exceptions flowing through exit are translated in/out like any other
/// argument/return value.
pub(crate) fn ctx_enter_blocking(ctx: &DispatchContext, py: Python<'_>, aenter_coro_factory: &Py<PyAny>, wrap_impl: &dyn Fn(Python<'_>, &Bound<'_, PyAny>) -> PyResult<Py<PyAny>>) -> PyResult<Py<PyAny>> {
    let coro = aenter_coro_factory.call0(py)?;
    let result = ctx.loop_host.run_blocking(py, coro)?;
    translate_result(ctx, py, result, true, wrap_impl)
}

pub(crate) fn ctx_exit_blocking(ctx: &DispatchContext, py: Python<'_>, aexit_coro_factory: &Py<PyAny>, exc_args: &Bound<'_, PyTuple>) -> PyResult<Py<PyAny>> {
    let translated_exc = ctx.registry.translate_in(py, exc_args.as_any())?;
    let translated_exc = translated_exc.bind(py).cast::<PyTuple>()?.clone();
    let coro = aexit_coro_factory.call1(py, translated_exc)?;
    ctx.loop_host.run_blocking(py, coro)
}

pub(crate) fn ctx_enter_cooperative(ctx: &DispatchContext, py: Python<'_>, aenter_coro_factory: &Py<PyAny>) -> PyResult<Py<PyAny>> {
    let coro = aenter_coro_factory.call0(py)?;
    let pending = crate::wrapper::LazyCooperativeCall::new(ctx.clone(), coro, true);
    Ok(Py::new(py, pending)?.into_any())
}

pub(crate) fn ctx_exit_cooperative(ctx: &DispatchContext, py: Python<'_>, aexit_coro_factory: &Py<PyAny>, exc_args: &Bound<'_, PyTuple>) -> PyResult<Py<PyAny>> {
    let translated_exc = ctx.registry.translate_in(py, exc_args.as_any())?;
    let translated_exc = translated_exc.bind(py).cast::<PyTuple>()?.clone();
    let coro = aexit_coro_factory.call1(py, translated_exc)?;
    let pending = crate::wrapper::LazyCooperativeCall::new(ctx.clone(), coro, false);
    Ok(Py::new(py, pending)?.into_any())
}

/// Wraps a `ConcurrentFuture` so `.result()` applies output translation
/// before handing the value back (matrix row 2's "wrap handle so `.result()`
/// translates out"). Lives here rather than on `ConcurrentFuture` itself
/// since translation needs the registry, which the Loop Host does not know
/// about.
#[pyclass]
pub(crate) struct TranslatingFuture {
    inner: Py<ConcurrentFuture>,
    ctx: DispatchContext,
}

impl TranslatingFuture {
    pub(crate) fn new(inner: Py<ConcurrentFuture>, ctx: DispatchContext) -> Self {
        Self { inner, ctx }
    }
}

#[pymethods]
impl TranslatingFuture {
    #[pyo3(signature = (timeout=None))]
    fn result(&self, py: Python<'_>, timeout: Option<f64>) -> PyResult<Py<PyAny>> {
        let raw = self.inner.call_method1(py, "result", (timeout,))?;
        crate::wrapper::translate_out_with_fresh_wrappers(&self.ctx, py, raw)
    }

    fn cancel(&self, py: Python<'_>) -> PyResult<bool> {
        self.inner.call_method0(py, "cancel")?.extract(py)
    }

    fn done(&self, py: Python<'_>) -> PyResult<bool> {
        self.inner.call_method0(py, "done")?.extract(py)
    }

    fn cancelled(&self, py: Python<'_>) -> PyResult<bool> {
        self.inner.call_method0(py, "cancelled")?.extract(py)
    }
}
