//! Lifecycle & Signals: the Synchronizer's own state machine (`Created ->
//! Running -> Stopping -> Stopped/Failed`), interpreter-exit shutdown, and
//! keyboard-interrupt forwarding during a blocking call.
//!
//! Deliberately no generic named-hook registry and no separate
//! `Starting`/`Error` substates — a Synchronizer is inert until first use
//! and only ever fails by way of the Loop Host crashing, which the loop
//! host itself already tracks (see DESIGN.md's trimming notes).

use pyo3::exceptions::PyKeyboardInterrupt;
use pyo3::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::logging::{log_debug, log_info, log_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LifecycleState {
    Created,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl LifecycleState {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

/// The Synchronizer's own state, separate from `LoopHost`'s internal
/// `HostState` — this tracks the *Synchronizer's* lifecycle, of which "the
/// loop host has started" is only one transition.
pub(crate) struct Lifecycle {
    name: Arc<str>,
    state: Mutex<LifecycleState>,
}

impl Lifecycle {
    pub(crate) fn new(name: Arc<str>) -> Self {
        Self {
            name,
            state: Mutex::new(LifecycleState::Created),
        }
    }

    pub(crate) fn snapshot(&self) -> LifecycleState {
        *self.state.lock().unwrap()
    }

    /// Called the first time any primitive actually starts the background
    /// loop. A no-op once already `Running`.
    pub(crate) fn mark_running(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == LifecycleState::Created {
            *state = LifecycleState::Running;
        }
    }

    /// Transition into `Stopping`. Returns `false` if shutdown has already
    /// been initiated (by a prior `close()`, a prior interpreter-exit
    /// finalizer run, or a loop-host crash), so callers can treat shutdown
    /// as idempotent rather than racing two teardown sequences.
    pub(crate) fn begin_shutdown(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match *state {
            LifecycleState::Stopping | LifecycleState::Stopped | LifecycleState::Failed => false,
            LifecycleState::Created | LifecycleState::Running => {
                *state = LifecycleState::Stopping;
                true
            }
        }
    }

    pub(crate) fn mark_stopped(&self) {
        *self.state.lock().unwrap() = LifecycleState::Stopped;
    }

    pub(crate) fn mark_failed(&self) {
        *self.state.lock().unwrap() = LifecycleState::Failed;
    }

    pub(crate) fn is_usable(&self) -> bool {
        matches!(self.snapshot(), LifecycleState::Created | LifecycleState::Running)
    }
}

/// Full teardown sequence: mark closing, bulk cancel scheduled work, run the
/// loop until cancellations settle within a bounded deadline, close the loop
/// and join the thread. Idempotent — a second call after shutdown has
/// already begun is a no-op.
pub(crate) fn shutdown_synchronizer(
    py: Python<'_>,
    lifecycle: &Lifecycle,
    loop_host: &crate::loop_host::LoopHost,
    deadline: std::time::Duration,
) {
    if !lifecycle.begin_shutdown() {
        return;
    }
    log_info!(&lifecycle.name, "shutdown starting");
    loop_host.begin_shutdown();
    loop_host.cancel_all_scheduled(py);
    loop_host.stop_and_join(py, deadline);
    lifecycle.mark_stopped();
    log_info!(&lifecycle.name, "shutdown complete");
}

/// Registers `shutdown_synchronizer` to run via `weakref.finalize` on
/// `target` (normally the Synchronizer's own Python wrapper). `weakref.
/// finalize` callbacks fire both when the referent is collected *and*,
/// unless detached, at interpreter exit — giving "run this when the
/// interpreter is going down" without reaching for `pyo3::ffi::Py_AtExit`.
pub(crate) fn register_process_exit_finalizer(
    py: Python<'_>,
    target: &Bound<'_, PyAny>,
    name: Arc<str>,
    lifecycle: Arc<Lifecycle>,
    loop_host: Arc<crate::loop_host::LoopHost>,
) -> PyResult<Py<PyAny>> {
    let weakref = py.import("weakref")?;
    let finalizer = Py::new(
        py,
        ShutdownFinalizer {
            name,
            lifecycle,
            loop_host,
        },
    )?;
    let handle = weakref.call_method1("finalize", (target, finalizer))?;
    Ok(handle.unbind())
}

#[pyclass]
struct ShutdownFinalizer {
    name: Arc<str>,
    lifecycle: Arc<Lifecycle>,
    loop_host: Arc<crate::loop_host::LoopHost>,
}

#[pymethods]
impl ShutdownFinalizer {
    fn __call__(&self, py: Python<'_>) {
        log_debug!(&self.name, "interpreter-exit finalizer running");
        shutdown_synchronizer(py, &self.lifecycle, &self.loop_host, std::time::Duration::from_secs(5));
    }
}

/// Installs a temporary `SIGINT` handler for the duration of one blocking
/// call. Only armed on the main thread, since `signal.signal` raises outside
/// it and a blocking call off the main thread has no terminating signal to
/// forward in the first place.
pub(crate) struct InterruptGuard {
    previous: Py<PyAny>,
    interrupted: Arc<AtomicBool>,
}

impl InterruptGuard {
    pub(crate) fn arm(py: Python<'_>, cancel_notify: Arc<Notify>) -> Option<(Self, Arc<AtomicBool>)> {
        match is_main_thread(py) {
            Ok(true) => {}
            _ => return None,
        }
        let signal = py.import("signal").ok()?;
        let sigint = signal.getattr("SIGINT").ok()?;
        let interrupted = Arc::new(AtomicBool::new(false));
        let handler = Py::new(
            py,
            InterruptForwarder {
                cancel_notify,
                interrupted: interrupted.clone(),
            },
        )
        .ok()?;
        let previous = signal
            .call_method1("signal", (sigint, handler))
            .ok()?
            .unbind();
        Some((
            Self {
                previous,
                interrupted: interrupted.clone(),
            },
            interrupted,
        ))
    }

    pub(crate) fn disarm(self, py: Python<'_>) {
        if let Ok(signal) = py.import("signal") {
            if let Ok(sigint) = signal.getattr("SIGINT") {
                if signal.call_method1("signal", (sigint, self.previous)).is_err() {
                    log_warn!("aiobridge", "failed to restore previous SIGINT handler");
                }
            }
        }
    }

    pub(crate) fn was_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }
}

fn is_main_thread(py: Python<'_>) -> PyResult<bool> {
    let threading = py.import("threading")?;
    let current = threading.call_method0("current_thread")?;
    let main = threading.call_method0("main_thread")?;
    Ok(current.is(&main))
}

/// The signal handler itself: wakes the in-flight task's cancellation
/// watcher the same way an ordinary cancellation would; the blocking call's
/// caller notices `was_interrupted()` once its wait unblocks and re-raises
/// `KeyboardInterrupt` rather than a plain cancellation error.
#[pyclass]
struct InterruptForwarder {
    cancel_notify: Arc<Notify>,
    interrupted: Arc<AtomicBool>,
}

#[pymethods]
impl InterruptForwarder {
    #[pyo3(signature = (_signum, _frame))]
    fn __call__(&self, _signum: i32, _frame: Py<PyAny>) -> PyResult<()> {
        self.interrupted.store(true, Ordering::Release);
        self.cancel_notify.notify_one();
        Ok(())
    }
}

/// Surfaces as `KeyboardInterrupt` once a blocking call's in-flight task has
/// finalized after an interrupt.
pub(crate) fn keyboard_interrupt_err() -> PyErr {
    PyKeyboardInterrupt::new_err("interrupted while waiting for background task")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_created_and_transitions_to_running() {
        let lifecycle = Lifecycle::new(Arc::from("test"));
        assert_eq!(lifecycle.snapshot(), LifecycleState::Created);
        assert!(lifecycle.is_usable());
        lifecycle.mark_running();
        assert_eq!(lifecycle.snapshot(), LifecycleState::Running);
        assert!(lifecycle.is_usable());
    }

    #[test]
    fn begin_shutdown_is_idempotent() {
        let lifecycle = Lifecycle::new(Arc::from("test"));
        lifecycle.mark_running();
        assert!(lifecycle.begin_shutdown());
        assert_eq!(lifecycle.snapshot(), LifecycleState::Stopping);
        assert!(!lifecycle.begin_shutdown());
        lifecycle.mark_stopped();
        assert!(!lifecycle.begin_shutdown());
        assert!(!lifecycle.is_usable());
    }

    #[test]
    fn failed_state_is_not_usable_and_blocks_further_shutdown() {
        let lifecycle = Lifecycle::new(Arc::from("test"));
        lifecycle.mark_running();
        lifecycle.mark_failed();
        assert_eq!(lifecycle.snapshot(), LifecycleState::Failed);
        assert!(!lifecycle.is_usable());
        assert!(!lifecycle.begin_shutdown());
    }
}
