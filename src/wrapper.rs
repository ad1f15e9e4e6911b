//! Wrapper Factory: produces the dual-interface proxy objects for
//! functions, methods, classes, async generators, and async context
//! managers, plus `wrap()` itself.
//!
//! A tagged-variant descriptor for each wrapped member, rather than a class
//! hierarchy of wrapper kinds: one shared `Invocable` pyclass parameterized
//! by a `MemberKind` instead of a distinct Rust type per kind.
//! `WrappedInstance::__getattr__` builds a fresh bound `Invocable` on each
//! access rather than installing real Python descriptors, which keeps one
//! shared pyclass instead of a dynamically-constructed type per wrapped
//! class (see DESIGN.md for the tradeoff this accepts on
//! `isinstance`/dunder-protocol fidelity).

use pyo3::exceptions::PyTypeError;
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyString, PyTuple};
use std::sync::Mutex;

use crate::dispatcher::{self, DispatchContext, TranslatingFuture};
use crate::error;
use crate::future_handle::ConcurrentFuture;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MemberKind {
    Coroutine,
    AsyncGenerator,
    Plain,
}

#[derive(Clone)]
struct MemberDescriptor {
    name: String,
    kind: MemberKind,
}

/// What `wrap(SomeClass)` returns: callable to construct new wrapped
/// instances, and the per-member dispatch table built once at wrap-time.
#[pyclass]
pub(crate) struct ClassDescriptor {
    ctx: DispatchContext,
    impl_cls: Py<PyAny>,
    members: Vec<MemberDescriptor>,
    translate_io: bool,
    supports_actx: bool,
    display_name: String,
}

impl ClassDescriptor {
    fn member(&self, name: &str) -> Option<&MemberDescriptor> {
        self.members.iter().find(|m| m.name == name)
    }
}

#[pymethods]
impl ClassDescriptor {
    #[pyo3(signature = (*args, **kwargs))]
    fn __call__(slf: &Bound<'_, Self>, args: &Bound<'_, PyTuple>, kwargs: Option<&Bound<'_, PyDict>>) -> PyResult<Py<WrappedInstance>> {
        let py = slf.py();
        let this = slf.borrow();
        let init = this.impl_cls.bind(py).getattr("__init__").ok();
        let is_async_init = init.map(|i| is_coroutine_function(py, &i).unwrap_or(false)).unwrap_or(false);

        let (targs, tkwargs) = translate_call_args(&this.ctx, py, args, kwargs, this.translate_io)?;

        let impl_obj = if is_async_init {
            let construct = CONSTRUCT_THEN_RETURN.get_or_try_init(py, || build_construct_helper(py))?.clone_ref(py);
            let ctor_coro_factory = construct.bind(py).call1((this.impl_cls.clone_ref(py),))?;
            let coro = ctor_coro_factory.call(targs.bind(py), tkwargs.as_ref().map(|k| k.bind(py)))?;
            this.ctx.loop_host.run_blocking(py, coro.unbind())?
        } else {
            this.impl_cls.call(py, targs.bind(py), tkwargs.as_ref().map(|k| k.bind(py)))?
        };

        let descriptor: Py<Self> = slf.clone().unbind();
        let wrapper = WrappedInstance::new_for(py, impl_obj.clone_ref(py), descriptor)?;
        this.ctx.registry.bind(py, impl_obj, wrapper.clone_ref(py).into_any())?;
        Ok(wrapper)
    }

    #[getter]
    fn __name__(&self) -> &str {
        &self.display_name
    }
}

static CONSTRUCT_THEN_RETURN: pyo3::sync::GILOnceCell<Py<PyAny>> = pyo3::sync::GILOnceCell::new();

/// `async def _construct(cls):\n    async def _inner(*a, **kw):\n        self = cls.__new__(cls)\n        await self.__init__(*a, **kw)\n        return self\n    return _inner`
/// — builds a coroutine-function closure that performs `cls.__new__` +
/// `await __init__` in one background-loop submission, since Python's async
/// `__init__` protocol (PEP-less but common in this ecosystem: classes with
/// a coroutine `__init__`) must run on the Synchronizer's loop like any
/// other user coroutine.
fn build_construct_helper(py: Python<'_>) -> PyResult<Py<PyAny>> {
    let namespace = PyDict::new(py);
    py.run(
        pyo3::ffi::c_str!(
            "def _aiobridge_construct(cls):\n    async def _inner(*a, **kw):\n        self = cls.__new__(cls)\n        await self.__init__(*a, **kw)\n        return self\n    return _inner\n"
        ),
        Some(&namespace),
        Some(&namespace),
    )?;
    namespace
        .get_item("_aiobridge_construct")?
        .map(|f| f.unbind())
        .ok_or_else(|| pyo3::exceptions::PyRuntimeError::new_err("failed to build async-constructor helper"))
}

/// The per-instance proxy produced by instantiating a `ClassDescriptor`.
/// One shared pyclass for every wrapped class (see module docs); dunder
/// protocol methods are always present on the type and check
/// `class_descriptor.supports_actx`/member kind at call time rather than
/// being added or omitted per wrapped class.
#[pyclass]
pub(crate) struct WrappedInstance {
    impl_obj: Py<PyAny>,
    class_descriptor: Py<ClassDescriptor>,
}

impl WrappedInstance {
    pub(crate) fn new_for(py: Python<'_>, impl_obj: Py<PyAny>, class_descriptor: Py<ClassDescriptor>) -> PyResult<Py<Self>> {
        Py::new(py, Self { impl_obj, class_descriptor })
    }
}

#[pymethods]
impl WrappedInstance {
    fn __getattr__(&self, py: Python<'_>, name: String) -> PyResult<Py<PyAny>> {
        let descriptor = self.class_descriptor.borrow(py);
        if let Some(member) = descriptor.member(&name) {
            if member.kind == MemberKind::Plain {
                let raw = self.impl_obj.bind(py).getattr(name.as_str())?;
                if !raw.is_callable() {
                    let ctx = descriptor.ctx.clone();
                    return translate_out_with_fresh_wrappers(&ctx, py, raw.unbind());
                }
            }
            let callable = self.impl_obj.bind(py).getattr(name.as_str())?.unbind();
            let invocable = Invocable {
                ctx: descriptor.ctx.clone(),
                callable,
                kind: member.kind,
                translate_io: descriptor.translate_io,
                name,
            };
            return Ok(Py::new(py, invocable)?.into_any());
        }
        // Not a recognized async member: pass through to the implementation
        // directly, still translating the result out.
        let raw = self.impl_obj.bind(py).getattr(name.as_str())?;
        translate_out_with_fresh_wrappers(&descriptor.ctx, py, raw.unbind())
    }

    fn __repr__(&self, py: Python<'_>) -> PyResult<String> {
        let descriptor = self.class_descriptor.borrow(py);
        let inner = self.impl_obj.bind(py).repr()?;
        Ok(format!("<{} wrapping {}>", descriptor.display_name, inner))
    }

    fn __enter__(&self, py: Python<'_>) -> PyResult<Py<PyAny>> {
        let descriptor = self.class_descriptor.borrow(py);
        if !descriptor.supports_actx {
            return Err(PyTypeError::new_err(format!("{} is not a context manager", descriptor.display_name)));
        }
        let aenter = self.impl_obj.bind(py).getattr("__aenter__")?.unbind();
        dispatcher::ctx_enter_blocking(&descriptor.ctx, py, &aenter, &|py, v| wrap_impl_instance(&descriptor.ctx, py, v))
    }

    #[pyo3(signature = (exc_type=None, exc_val=None, exc_tb=None))]
    fn __exit__(&self, py: Python<'_>, exc_type: Option<Py<PyAny>>, exc_val: Option<Py<PyAny>>, exc_tb: Option<Py<PyAny>>) -> PyResult<Py<PyAny>> {
        let descriptor = self.class_descriptor.borrow(py);
        if !descriptor.supports_actx {
            return Err(PyTypeError::new_err(format!("{} is not a context manager", descriptor.display_name)));
        }
        let aexit = self.impl_obj.bind(py).getattr("__aexit__")?.unbind();
        let exc_tuple = PyTuple::new(py, [exc_type, exc_val, exc_tb])?;
        dispatcher::ctx_exit_blocking(&descriptor.ctx, py, &aexit, &exc_tuple)
    }

    fn __aenter__(&self, py: Python<'_>) -> PyResult<Py<PyAny>> {
        let descriptor = self.class_descriptor.borrow(py);
        if !descriptor.supports_actx {
            return Err(PyTypeError::new_err(format!("{} is not an async context manager", descriptor.display_name)));
        }
        let aenter = self.impl_obj.bind(py).getattr("__aenter__")?.unbind();
        dispatcher::ctx_enter_cooperative(&descriptor.ctx, py, &aenter)
    }

    #[pyo3(signature = (exc_type=None, exc_val=None, exc_tb=None))]
    fn __aexit__(&self, py: Python<'_>, exc_type: Option<Py<PyAny>>, exc_val: Option<Py<PyAny>>, exc_tb: Option<Py<PyAny>>) -> PyResult<Py<PyAny>> {
        let descriptor = self.class_descriptor.borrow(py);
        if !descriptor.supports_actx {
            return Err(PyTypeError::new_err(format!("{} is not an async context manager", descriptor.display_name)));
        }
        let aexit = self.impl_obj.bind(py).getattr("__aexit__")?.unbind();
        let exc_tuple = PyTuple::new(py, [exc_type, exc_val, exc_tb])?;
        dispatcher::ctx_exit_cooperative(&descriptor.ctx, py, &aexit, &exc_tuple)
    }
}

/// A bound or free coroutine-function / async-generator-function /
/// synchronous callable exposing both the blocking call operator and the
/// `.aio` cooperative entry.
#[pyclass]
pub(crate) struct Invocable {
    ctx: DispatchContext,
    callable: Py<PyAny>,
    kind: MemberKind,
    translate_io: bool,
    name: String,
}

#[pymethods]
impl Invocable {
    #[pyo3(signature = (*args, **kwargs))]
    fn __call__(&self, py: Python<'_>, args: &Bound<'_, PyTuple>, kwargs: Option<&Bound<'_, PyDict>>) -> PyResult<Py<PyAny>> {
        match self.kind {
            MemberKind::Coroutine => {
                let (future_requested, kwargs) = extract_future_flag(py, kwargs)?;
                if future_requested {
                    let raw = dispatcher::call_blocking_future(&self.ctx, py, &self.callable, args, kwargs.as_ref().map(|k| k.bind(py)), self.translate_io)?;
                    let concurrent: Py<ConcurrentFuture> = raw.extract(py)?;
                    Ok(Py::new(py, TranslatingFuture::new(concurrent, self.ctx.clone()))?.into_any())
                } else {
                    let ctx = self.ctx.clone();
                    dispatcher::call_blocking(&self.ctx, py, &self.callable, args, kwargs.as_ref().map(|k| k.bind(py)), self.translate_io, &|py, v| wrap_impl_instance(&ctx, py, v))
                }
            }
            MemberKind::AsyncGenerator => {
                let (targs, tkwargs) = translate_call_args(&self.ctx, py, args, kwargs, self.translate_io)?;
                let agen = self.callable.call(py, targs.bind(py), tkwargs.as_ref().map(|k| k.bind(py)))?;
                Ok(Py::new(py, BlockingAsyncIterator { ctx: self.ctx.clone(), agen })?.into_any())
            }
            MemberKind::Plain => {
                let (targs, tkwargs) = translate_call_args(&self.ctx, py, args, kwargs, self.translate_io)?;
                let raw = self.callable.call(py, targs.bind(py), tkwargs.as_ref().map(|k| k.bind(py)))?;
                translate_out_with_fresh_wrappers(&self.ctx, py, raw)
            }
        }
    }

    #[getter]
    fn aio(&self, py: Python<'_>) -> PyResult<Py<AioEntry>> {
        Py::new(
            py,
            AioEntry {
                ctx: self.ctx.clone(),
                callable: self.callable.clone_ref(py),
                kind: self.kind,
                translate_io: self.translate_io,
            },
        )
    }

    #[getter]
    fn __name__(&self) -> &str {
        &self.name
    }
}

/// The `.aio` cooperative-entry counterpart to `Invocable`.
#[pyclass]
pub(crate) struct AioEntry {
    ctx: DispatchContext,
    callable: Py<PyAny>,
    kind: MemberKind,
    translate_io: bool,
}

#[pymethods]
impl AioEntry {
    #[pyo3(signature = (*args, **kwargs))]
    fn __call__(&self, py: Python<'_>, args: &Bound<'_, PyTuple>, kwargs: Option<&Bound<'_, PyDict>>) -> PyResult<Py<PyAny>> {
        match self.kind {
            MemberKind::Coroutine => dispatcher::call_cooperative(&self.ctx, py, &self.callable, args, kwargs, self.translate_io),
            MemberKind::AsyncGenerator => {
                let (targs, tkwargs) = translate_call_args(&self.ctx, py, args, kwargs, self.translate_io)?;
                let agen = self.callable.call(py, targs.bind(py), tkwargs.as_ref().map(|k| k.bind(py)))?;
                Ok(Py::new(py, AsyncIteratorProxy { ctx: self.ctx.clone(), agen })?.into_any())
            }
            MemberKind::Plain => {
                let (targs, tkwargs) = translate_call_args(&self.ctx, py, args, kwargs, self.translate_io)?;
                let raw = self.callable.call(py, targs.bind(py), tkwargs.as_ref().map(|k| k.bind(py)))?;
                let translated = translate_out_with_fresh_wrappers(&self.ctx, py, raw)?;
                let identity = crate::asyncio_util::identity_coroutine_fn(py)?;
                identity.call1(py, (translated,))
            }
        }
    }
}

/// Deferred `.aio`/cooperative-step submission: built eagerly (argument
/// translation and coroutine construction happen at `.aio(...)` call time,
/// which is cheap and side-effect-free for the bridge itself) but does not
/// call `get_running_loop`/submit to the background loop until something
/// actually drives it — matching matrix row "cooperative | blocking |
/// value": `.aio(...)` is legal from a blocking caller as long as nothing
/// awaits it until a loop exists.
#[pyclass]
pub(crate) struct LazyCooperativeCall {
    ctx: DispatchContext,
    coro: Mutex<Option<Py<PyAny>>>,
    translate_io: bool,
    delegate: Mutex<Option<Py<PyAny>>>,
}

impl LazyCooperativeCall {
    pub(crate) fn new(ctx: DispatchContext, coro: Py<PyAny>, translate_io: bool) -> Self {
        Self {
            ctx,
            coro: Mutex::new(Some(coro)),
            translate_io,
            delegate: Mutex::new(None),
        }
    }

    fn ensure_submitted(&self, py: Python<'_>) -> PyResult<Py<PyAny>> {
        {
            let delegate = self.delegate.lock().unwrap();
            if let Some(d) = &*delegate {
                return Ok(d.clone_ref(py));
            }
        }
        let coro = self
            .coro
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| error::misuse_err("cooperative awaitable driven more than once"))?;
        let awaitable = dispatcher::submit_cooperative(&self.ctx, py, coro)?;
        *self.delegate.lock().unwrap() = Some(awaitable.clone_ref(py));
        Ok(awaitable)
    }
}

#[pymethods]
impl LazyCooperativeCall {
    fn __await__(pyself: PyRef<'_, Self>) -> PyRef<'_, Self> {
        pyself
    }
    fn __iter__(pyself: PyRef<'_, Self>) -> PyRef<'_, Self> {
        pyself
    }

    fn __next__(&self, py: Python<'_>) -> PyResult<Option<Py<PyAny>>> {
        let delegate = self.ensure_submitted(py)?;
        delegate.call_method0(py, "__next__").map(Some).or_else(|err| {
            if err.is_instance_of::<pyo3::exceptions::PyStopIteration>(py) {
                Err(err)
            } else {
                Err(err)
            }
        })
    }
}

/// Translation-aware result for looking up a non-callable attribute or a
/// synchronous passthrough call: synchronous members of the implementation
/// pass through unchanged but still receive input/output translation.
pub(crate) fn translate_out_with_fresh_wrappers(ctx: &DispatchContext, py: Python<'_>, value: Py<PyAny>) -> PyResult<Py<PyAny>> {
    ctx.registry.translate_out(py, value.bind(py), &|py, v| wrap_impl_instance(ctx, py, v))
}

/// Build (or look up the existing cached) wrapper for a raw implementation
/// instance whose class is known to be registered.
pub(crate) fn wrap_impl_instance(ctx: &DispatchContext, py: Python<'_>, impl_obj: &Bound<'_, PyAny>) -> PyResult<Py<PyAny>> {
    if let Some(existing) = ctx.registry.existing_wrapper(py, impl_obj) {
        return Ok(existing);
    }
    let cls = impl_obj.get_type();
    let descriptor = ctx
        .registry
        .wrapper_class_for(&cls)
        .ok_or_else(|| error::misuse_err("no wrapper registered for this implementation class"))?;
    let descriptor: Py<ClassDescriptor> = descriptor.extract(py)?;
    let wrapper = WrappedInstance::new_for(py, impl_obj.clone().unbind(), descriptor)?;
    ctx.registry.bind(py, impl_obj.clone().unbind(), wrapper.clone_ref(py).into_any())?;
    Ok(wrapper.into_any())
}

/// Blocking iterator driving a live async generator one step at a time.
#[pyclass]
pub(crate) struct BlockingAsyncIterator {
    ctx: DispatchContext,
    agen: Py<PyAny>,
}

#[pymethods]
impl BlockingAsyncIterator {
    fn __iter__(pyself: PyRef<'_, Self>) -> PyRef<'_, Self> {
        pyself
    }

    fn __next__(&self, py: Python<'_>) -> PyResult<Option<Py<PyAny>>> {
        let anext = self.agen.bind(py).getattr("__anext__")?.unbind();
        match dispatcher::step_blocking(&self.ctx, py, &anext)? {
            Some(v) => translate_out_with_fresh_wrappers(&self.ctx, py, v).map(Some),
            None => Ok(None),
        }
    }
}

/// Cooperative-side counterpart, driven via `async for` on a caller loop.
#[pyclass]
pub(crate) struct AsyncIteratorProxy {
    ctx: DispatchContext,
    agen: Py<PyAny>,
}

#[pymethods]
impl AsyncIteratorProxy {
    fn __aiter__(pyself: PyRef<'_, Self>) -> PyRef<'_, Self> {
        pyself
    }

    fn __anext__(&self, py: Python<'_>) -> PyResult<Py<PyAny>> {
        let anext = self.agen.bind(py).getattr("__anext__")?.unbind();
        dispatcher::step_cooperative(&self.ctx, py, &anext)
    }
}

fn extract_future_flag<'py>(py: Python<'py>, kwargs: Option<&Bound<'py, PyDict>>) -> PyResult<(bool, Option<Bound<'py, PyDict>>)> {
    let Some(kwargs) = kwargs else { return Ok((false, None)) };
    let key = PyString::new(py, "_future");
    if let Some(flag) = kwargs.get_item(&key)? {
        let remaining = kwargs.copy()?;
        remaining.del_item(&key)?;
        Ok((flag.is_truthy()?, Some(remaining)))
    } else {
        Ok((false, Some(kwargs.clone())))
    }
}

fn translate_call_args<'py>(
    ctx: &DispatchContext,
    py: Python<'py>,
    args: &Bound<'py, PyTuple>,
    kwargs: Option<&Bound<'py, PyDict>>,
    translate_io: bool,
) -> PyResult<(Py<PyTuple>, Option<Py<PyDict>>)> {
    if !translate_io {
        return Ok((args.clone().unbind(), kwargs.map(|k| k.clone().unbind())));
    }
    let targs = ctx.registry.translate_in(py, args.as_any())?;
    let targs = targs.bind(py).cast::<PyTuple>()?.clone().unbind();
    let tkwargs = match kwargs {
        Some(k) => {
            let t = ctx.registry.translate_in(py, k.as_any())?;
            Some(t.bind(py).cast::<PyDict>()?.clone().unbind())
        }
        None => None,
    };
    Ok((targs, tkwargs))
}

fn is_coroutine_function(py: Python<'_>, f: &Bound<'_, PyAny>) -> PyResult<bool> {
    let inspect = py.import("inspect")?;
    inspect.call_method1("iscoroutinefunction", (f,))?.is_truthy()
}

fn is_async_gen_function(py: Python<'_>, f: &Bound<'_, PyAny>) -> PyResult<bool> {
    let inspect = py.import("inspect")?;
    inspect.call_method1("isasyncgenfunction", (f,))?.is_truthy()
}

fn classify_member(py: Python<'_>, attr: &Bound<'_, PyAny>) -> PyResult<MemberKind> {
    if is_coroutine_function(py, attr)? {
        Ok(MemberKind::Coroutine)
    } else if is_async_gen_function(py, attr)? {
        Ok(MemberKind::AsyncGenerator)
    } else {
        Ok(MemberKind::Plain)
    }
}

/// `wrap(target, *, name=None, target_module=None, translate_io=True)`.
/// Dispatches on what kind of target was handed in. Takes the owning
/// Synchronizer's `DispatchContext` directly rather than a Python
/// object — the module-level `wrap()` pyfunction and `Synchronizer.wrap()`
/// (in synchronizer.rs) are the two thin Python-visible entry points that
/// resolve a `Synchronizer` and call through to this.
pub(crate) fn wrap(
    py: Python<'_>,
    target: Py<PyAny>,
    ctx: DispatchContext,
    name: Option<String>,
    target_module: Option<String>,
    translate_io: bool,
) -> PyResult<Py<PyAny>> {
    let target_bound = target.bind(py);

    if target_bound.is_instance_of::<pyo3::types::PyType>() {
        if let Some(existing) = ctx.registry.wrapper_class_for(target_bound) {
            return Ok(existing);
        }
        let descriptor = build_class_descriptor(py, target.clone_ref(py), ctx.clone(), translate_io, name)?;
        let descriptor_py = Py::new(py, descriptor)?;
        ctx.registry.register_type_pair(target.clone_ref(py), descriptor_py.clone_ref(py).into_any(), py);
        let _ = target_module;
        return Ok(descriptor_py.into_any());
    }

    if is_coroutine_function(py, target_bound)? {
        let invocable = Invocable {
            ctx,
            callable: target,
            kind: MemberKind::Coroutine,
            translate_io,
            name: name.unwrap_or_else(|| target_bound.getattr("__name__").and_then(|n| n.extract()).unwrap_or_default()),
        };
        return Ok(Py::new(py, invocable)?.into_any());
    }
    if is_async_gen_function(py, target_bound)? {
        let invocable = Invocable {
            ctx,
            callable: target,
            kind: MemberKind::AsyncGenerator,
            translate_io,
            name: name.unwrap_or_else(|| target_bound.getattr("__name__").and_then(|n| n.extract()).unwrap_or_default()),
        };
        return Ok(Py::new(py, invocable)?.into_any());
    }

    Err(error::misuse_err(
        "wrap() target must be a coroutine function, async generator function, or class",
    ))
}

fn build_class_descriptor(py: Python<'_>, impl_cls: Py<PyAny>, ctx: DispatchContext, translate_io: bool, name: Option<String>) -> PyResult<ClassDescriptor> {
    let cls_bound = impl_cls.bind(py);
    let mut members = Vec::new();
    for attr_name in cls_bound.dir()?.iter() {
        let attr_name: String = attr_name.extract()?;
        if attr_name.starts_with("__") && attr_name != "__aenter__" && attr_name != "__aexit__" {
            continue;
        }
        let Ok(attr) = cls_bound.getattr(attr_name.as_str()) else { continue };
        if !attr.is_callable() {
            continue;
        }
        let kind = classify_member(py, &attr)?;
        members.push(MemberDescriptor { name: attr_name, kind });
    }

    let supports_actx = members.iter().any(|m| m.name == "__aenter__") && members.iter().any(|m| m.name == "__aexit__");
    let display_name = name.unwrap_or_else(|| cls_bound.getattr("__name__").and_then(|n| n.extract()).unwrap_or_else(|_| "WrappedClass".to_string()));

    Ok(ClassDescriptor {
        ctx,
        impl_cls,
        members,
        translate_io,
        supports_actx,
        display_name,
    })
}
