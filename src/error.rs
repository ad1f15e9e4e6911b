//! Error taxonomy for the bridge, realized as concrete Python exception
//! types rather than bare `PyRuntimeError`s so callers can discriminate.

use pyo3::create_exception;
use pyo3::exceptions::PyException;
use pyo3::prelude::*;

create_exception!(aiobridge, AioBridgeError, PyException, "Base class for all aiobridge errors.");

create_exception!(
    aiobridge,
    SynchronizerClosedError,
    AioBridgeError,
    "Raised when a call is submitted to a Synchronizer after shutdown."
);

create_exception!(
    aiobridge,
    MisuseError,
    AioBridgeError,
    "Raised when wrapping an unsupported target, or when the blocking entry \
     is invoked from inside the background loop itself."
);

create_exception!(
    aiobridge,
    LoopHostError,
    AioBridgeError,
    "Raised when the background loop has crashed and the Synchronizer has \
     entered a terminal failed state."
);

pub(crate) fn register(py: Python<'_>, module: &Bound<'_, PyModule>) -> PyResult<()> {
    module.add("AioBridgeError", py.get_type::<AioBridgeError>())?;
    module.add("SynchronizerClosedError", py.get_type::<SynchronizerClosedError>())?;
    module.add("MisuseError", py.get_type::<MisuseError>())?;
    module.add("LoopHostError", py.get_type::<LoopHostError>())?;
    Ok(())
}

pub(crate) fn closed_err(name: &str) -> PyErr {
    SynchronizerClosedError::new_err(format!("synchronizer '{name}' is closed"))
}

pub(crate) fn misuse_err(msg: impl Into<String>) -> PyErr {
    MisuseError::new_err(msg.into())
}

pub(crate) fn loop_host_err(msg: impl Into<String>) -> PyErr {
    LoopHostError::new_err(msg.into())
}

/// Cancellation is surfaced as Python's own `asyncio.CancelledError` rather
/// than a new type, so `except asyncio.CancelledError` still works for
/// callers that never imported `aiobridge` (see DESIGN.md's note on
/// cancellation typing).
pub(crate) fn cancelled_err(py: Python<'_>, msg: &str) -> PyErr {
    match crate::asyncio_util::asyncio(py) {
        Ok(asyncio) => match asyncio.getattr(py, "CancelledError") {
            Ok(cls) => PyErr::from_value(
                cls.bind(py)
                    .call1((msg,))
                    .unwrap_or_else(|_| cls.bind(py).clone()),
            ),
            Err(_) => pyo3::exceptions::PyRuntimeError::new_err(msg.to_string()),
        },
        Err(_) => pyo3::exceptions::PyRuntimeError::new_err(msg.to_string()),
    }
}
