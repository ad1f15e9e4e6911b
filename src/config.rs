//! Construction-time configuration for a `Synchronizer`, kept as a plain
//! struct rather than its own pyclass — the external surface is just
//! `Synchronizer(name=None, *, on_uncaught_error=None)`, and nothing else
//! needs to construct this independent of a Synchronizer.

use pyo3::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};

static ANONYMOUS_COUNTER: AtomicU64 = AtomicU64::new(0);

pub(crate) struct SynchronizerConfig {
    pub(crate) name: String,
    pub(crate) on_uncaught_error: Option<Py<PyAny>>,
}

impl SynchronizerConfig {
    pub(crate) fn from_args(name: Option<String>, on_uncaught_error: Option<Py<PyAny>>) -> Self {
        let name = name.unwrap_or_else(|| {
            let n = ANONYMOUS_COUNTER.fetch_add(1, Ordering::Relaxed);
            format!("synchronizer-{n}")
        });
        Self { name, on_uncaught_error }
    }
}
