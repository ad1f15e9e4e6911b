//! The `Synchronizer` pyclass: the process-addressable handle users
//! construct directly or obtain via `get_synchronizer(name)`. Owns one
//! `LoopHost`, one `TranslationRegistry`, and the `Lifecycle` state machine,
//! and is the thing `wrap(target, ...)` is called against.

use dashmap::DashMap;
use pyo3::prelude::*;
use pyo3::sync::GILOnceCell;
use std::sync::Arc;
use std::time::Duration;

use crate::config::SynchronizerConfig;
use crate::dispatcher::DispatchContext;
use crate::error;
use crate::lifecycle::{self, Lifecycle};
use crate::logging::log_info;
use crate::loop_host::LoopHost;
use crate::registry::TranslationRegistry;

/// Process-wide named-singleton table backing `get_synchronizer`. A
/// `DashMap` rather than a GIL-guarded `dict` so lookup from any thread
/// never needs the GIL merely to find the `Py<Synchronizer>` to operate on.
static SYNCHRONIZERS: GILOnceCell<DashMap<String, Py<Synchronizer>>> = GILOnceCell::new();

fn singleton_table(py: Python<'_>) -> &'static DashMap<String, Py<Synchronizer>> {
    SYNCHRONIZERS.get_or_init(py, DashMap::new)
}

#[pyclass]
pub(crate) struct Synchronizer {
    ctx: DispatchContext,
    lifecycle: Arc<Lifecycle>,
    // The interpreter-exit finalizer is registered lazily, the first time
    // this Synchronizer is actually used (`wrap`/`close`), rather than at
    // construction: registering it requires a `Py<Self>`/`Bound<Self>` of
    // the just-built object, which `#[new]` does not have access to, and an
    // unused Synchronizer never starts a background thread, so it has
    // nothing a finalizer would need to tear down anyway.
    finalizer: GILOnceCell<Py<PyAny>>,
}

impl Synchronizer {
    fn assemble(config: SynchronizerConfig) -> Self {
        let name: Arc<str> = Arc::from(config.name.as_str());
        let loop_host = Arc::new(LoopHost::new(config.name.clone()));
        loop_host.set_uncaught_error_hook(config.on_uncaught_error);
        let lifecycle = Arc::new(Lifecycle::new(name.clone()));
        lifecycle.mark_running();
        loop_host.set_crash_hook(lifecycle.clone());

        let ctx = DispatchContext {
            registry: Arc::new(TranslationRegistry::default()),
            loop_host,
            name,
        };

        Synchronizer {
            ctx,
            lifecycle,
            finalizer: GILOnceCell::new(),
        }
    }

    /// Registers the interpreter-exit finalizer on first real use, if it
    /// hasn't already been registered.
    fn ensure_finalizer(slf: &Bound<'_, Self>) -> PyResult<()> {
        let py = slf.py();
        if slf.borrow().finalizer.get(py).is_some() {
            return Ok(());
        }
        let (name, lifecycle, loop_host) = {
            let this = slf.borrow();
            (this.ctx.name.clone(), this.lifecycle.clone(), this.ctx.loop_host.clone())
        };
        let handle = lifecycle::register_process_exit_finalizer(py, slf.as_any(), name, lifecycle, loop_host)?;
        let _ = slf.borrow().finalizer.set(py, handle);
        Ok(())
    }

    pub(crate) fn dispatch_context(&self) -> DispatchContext {
        self.ctx.clone()
    }
}

#[pymethods]
impl Synchronizer {
    #[new]
    #[pyo3(signature = (name=None, *, on_uncaught_error=None))]
    fn new(name: Option<String>, on_uncaught_error: Option<Py<PyAny>>) -> Self {
        Self::assemble(SynchronizerConfig::from_args(name, on_uncaught_error))
    }

    #[getter]
    fn name(&self) -> String {
        self.ctx.name.to_string()
    }

    #[getter]
    fn state(&self) -> &'static str {
        self.lifecycle.snapshot().as_str()
    }

    /// `wrap(target, *, name=None, target_module=None, translate_io=True)`
    /// against this Synchronizer. The free top-level `wrap` function in
    /// `wrapper.rs` is a thin convenience over this using the default-named
    /// singleton.
    #[pyo3(signature = (target, *, name=None, target_module=None, translate_io=true))]
    fn wrap(
        slf: &Bound<'_, Self>,
        target: Py<PyAny>,
        name: Option<String>,
        target_module: Option<String>,
        translate_io: bool,
    ) -> PyResult<Py<PyAny>> {
        let py = slf.py();
        if !slf.borrow().lifecycle.is_usable() {
            return Err(error::closed_err(&slf.borrow().ctx.name));
        }
        Self::ensure_finalizer(slf)?;
        let ctx = slf.borrow().ctx.clone();
        crate::wrapper::wrap(py, target, ctx, name, target_module, translate_io)
    }

    /// Explicit synchronous shutdown: cancels all tracked scheduled work,
    /// drains the background loop, and joins its thread. Idempotent — safe
    /// to call more than once, and safe even if the interpreter-exit
    /// finalizer later fires too.
    #[pyo3(signature = (timeout=5.0))]
    fn close(slf: &Bound<'_, Self>, timeout: f64) -> PyResult<()> {
        let py = slf.py();
        Self::ensure_finalizer(slf)?;
        let (lifecycle, loop_host) = {
            let this = slf.borrow();
            (this.lifecycle.clone(), this.ctx.loop_host.clone())
        };
        lifecycle::shutdown_synchronizer(py, &lifecycle, &loop_host, Duration::from_secs_f64(timeout.max(0.0)));
        Ok(())
    }

    fn __repr__(&self) -> String {
        format!("Synchronizer(name={:?}, state={:?})", self.ctx.name, self.lifecycle.snapshot().as_str())
    }
}

/// `get_synchronizer(name) -> Synchronizer`: returns the process-global
/// Synchronizer for `name`, constructing it on first use. `DashMap::entry`'s
/// atomic get-or-insert resolves construction races without a separate
/// lock.
#[pyfunction]
#[pyo3(signature = (name))]
pub(crate) fn get_synchronizer(py: Python<'_>, name: String) -> PyResult<Py<Synchronizer>> {
    let table = singleton_table(py);
    if let Some(existing) = table.get(&name) {
        return Ok(existing.clone_ref(py));
    }

    let config = SynchronizerConfig::from_args(Some(name.clone()), None);
    let created = Py::new(py, Synchronizer::assemble(config))?;
    Synchronizer::ensure_finalizer(created.bind(py))?;

    let winner = table.entry(name).or_insert_with(|| created.clone_ref(py)).clone_ref(py);
    log_info!("aiobridge", "get_synchronizer resolved");
    Ok(winner)
}

const DEFAULT_SYNCHRONIZER_NAME: &str = "default";

/// Module-level `wrap(target, *, name=None, target_module=None,
/// translate_io=True)`: a free function with no explicit Synchronizer
/// argument. Resolves against the process's default-named singleton, so
/// callers who never think about Synchronizers at all still get one shared
/// background loop.
#[pyfunction]
#[pyo3(signature = (target, *, name=None, target_module=None, translate_io=true))]
pub(crate) fn wrap(
    py: Python<'_>,
    target: Py<PyAny>,
    name: Option<String>,
    target_module: Option<String>,
    translate_io: bool,
) -> PyResult<Py<PyAny>> {
    let synchronizer = get_synchronizer(py, DEFAULT_SYNCHRONIZER_NAME.to_string())?;
    Synchronizer::ensure_finalizer(synchronizer.bind(py))?;
    let ctx = synchronizer.borrow(py).ctx.clone();
    crate::wrapper::wrap(py, target, ctx, name, target_module, translate_io)
}

/// Iterates every named singleton and shuts each down. Complements each
/// Synchronizer's own per-instance finalizer, which only fires once that
/// specific wrapper object is collected or the interpreter exits; this one
/// additionally guarantees singletons kept alive solely by the named table
/// itself are still torn down.
pub(crate) fn shutdown_all(py: Python<'_>) {
    if let Some(table) = SYNCHRONIZERS.get(py) {
        for entry in table.iter() {
            let sync = entry.value().borrow(py);
            lifecycle::shutdown_synchronizer(py, &sync.lifecycle, &sync.ctx.loop_host, Duration::from_secs(5));
        }
    }
}
