//! `aiobridge`: a PyO3 extension exposing the Synchronizer runtime.
//!
//! One dedicated background thread per `Synchronizer`, running its own
//! `asyncio` event loop, lets a single async Python implementation be
//! invoked either blockingly or cooperatively without leaking an event loop
//! into user code.

#[cfg(not(any(target_env = "musl", target_os = "freebsd", target_os = "openbsd", target_os = "windows", feature = "mimalloc")))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use pyo3::prelude::*;

pub mod asyncio_util;
pub mod callbacks;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod future_handle;
pub mod lifecycle;
pub mod logging;
pub mod loop_host;
pub mod registry;
pub mod synchronizer;
pub mod wrapper;

use crate::dispatcher::TranslatingFuture;
use crate::future_handle::ConcurrentFuture;
use crate::synchronizer::Synchronizer;
use crate::wrapper::{AioEntry, AsyncIteratorProxy, BlockingAsyncIterator, ClassDescriptor, Invocable, LazyCooperativeCall, WrappedInstance};

#[pymodule(gil_used = false)]
fn aiobridge(py: Python<'_>, module: &Bound<'_, PyModule>) -> PyResult<()> {
    crate::logging::LogQueue::ensure_started();

    // Runtime handle + singleton lookup.
    module.add_class::<Synchronizer>()?;
    module.add_function(wrap_pyfunction!(synchronizer::get_synchronizer, module)?)?;
    module.add_function(wrap_pyfunction!(synchronizer::wrap, module)?)?;

    // Dual-interface proxy objects the Wrapper Factory produces.
    module.add_class::<ClassDescriptor>()?;
    module.add_class::<WrappedInstance>()?;
    module.add_class::<Invocable>()?;
    module.add_class::<AioEntry>()?;
    module.add_class::<LazyCooperativeCall>()?;
    module.add_class::<BlockingAsyncIterator>()?;
    module.add_class::<AsyncIteratorProxy>()?;

    // Result-shape handles.
    module.add_class::<ConcurrentFuture>()?;
    module.add_class::<TranslatingFuture>()?;

    // Error taxonomy.
    error::register(py, module)?;

    // Process-wide teardown, complementing each Synchronizer's own
    // `weakref.finalize` registered in lifecycle.rs: this one additionally
    // catches singletons kept alive solely by the named table in
    // synchronizer.rs, which no per-instance finalizer would otherwise reach.
    let atexit = py.import("atexit")?;
    atexit.call_method1("register", (wrap_pyfunction!(shutdown_all_synchronizers, module)?,))?;

    Ok(())
}

/// Iterates every named singleton and shuts each down; registered with
/// Python's `atexit` at import time (see `aiobridge` above).
#[pyfunction]
fn shutdown_all_synchronizers(py: Python<'_>) {
    synchronizer::shutdown_all(py);
}
