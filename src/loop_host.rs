//! Loop Host: one background OS thread running one `asyncio` event loop for
//! the lifetime of a Synchronizer, plus the three primitives (`run_blocking`,
//! `run_cooperative`, `schedule`) the Call Dispatcher uses to get a coroutine
//! executed there.
//!
//! The thread attaches the GIL once, then drives `asyncio.run_forever`;
//! cross-thread submission and result delivery go through
//! `call_soon_threadsafe` and one-shot channels rather than anything that
//! requires the submitting thread to already be on an event loop.

use dashmap::DashMap;
use pyo3::prelude::*;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tokio::sync::{oneshot, Notify};

use crate::asyncio_util::{self, copy_context};
use crate::callbacks::{BridgeResult, PyFutureAwaitable, PyIterAwaitable};
use crate::error;
use crate::logging::{log_debug, log_error, log_info};

thread_local! {
    /// Set for the lifetime of `background_main` on the Loop Host's own
    /// thread. Lets the Call Dispatcher reject a blocking-entry call made
    /// from inside the background loop itself (it would deadlock) without
    /// needing a thread-id registry.
    static ON_BACKGROUND_LOOP: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Is the calling OS thread a Loop Host's own background thread?
pub(crate) fn is_on_background_loop() -> bool {
    ON_BACKGROUND_LOOP.with(|f| f.get())
}

/// A cell published by `TaskSetup::__call__` once `ensure_future` has
/// actually turned a submitted coroutine into a real `asyncio.Task` on the
/// background loop. Everything that wants to cancel or otherwise observe
/// "the task" — `ScheduledEntry`, `CancelWatcher`, `ConcurrentFuture`,
/// `TaskCanceller` — holds a clone of this cell rather than the one-shot
/// `TaskSetup` wrapper itself, which never grows a `cancel` method once
/// `ensure_future` has run and replaced it.
pub(crate) type TaskHandle = Arc<Mutex<Option<Py<PyAny>>>>;

/// Per-scheduled-coroutine bookkeeping the Lifecycle component cancels in
/// bulk on shutdown. Tracked strongly in a table keyed by task id, rather
/// than weakly, since Rust has no weak handle to a `tokio` task.
struct ScheduledEntry {
    task: TaskHandle,
    cancel_notify: Arc<Notify>,
}

enum HostState {
    NotStarted,
    Running { thread: JoinHandle<()>, event_loop: Py<PyAny> },
    Failed(String),
    Closed,
}

/// Background loop thread + bridging primitives, owned by one Synchronizer.
pub(crate) struct LoopHost {
    name: String,
    state: Mutex<HostState>,
    start_lock: Mutex<()>,
    scheduled: DashMap<u64, ScheduledEntry>,
    next_task_id: AtomicU64,
    generation: AtomicU64,
    closing: AtomicBool,
    on_uncaught_error: Mutex<Option<Py<PyAny>>>,
    /// Set by `background_main` itself if `run_forever` (or the event-loop
    /// install step preceding it) raises rather than returning via the
    /// normal `stop()` path. Checked on the next call into the Loop Host so
    /// a crash surfaces as a Loop-host error instead of a hang.
    crashed: Arc<AtomicBool>,
    crash_message: Arc<Mutex<Option<String>>>,
    /// Notified of a crash so the owning Synchronizer's own lifecycle state
    /// machine (a separate concept from `HostState`) also transitions to
    /// `Failed`, independent of whether anything happens to call back into
    /// the Loop Host afterward.
    crash_hook: Mutex<Option<Arc<crate::lifecycle::Lifecycle>>>,
}

impl LoopHost {
    pub(crate) fn new(name: String) -> Self {
        Self {
            name,
            state: Mutex::new(HostState::NotStarted),
            start_lock: Mutex::new(()),
            scheduled: DashMap::new(),
            next_task_id: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            closing: AtomicBool::new(false),
            on_uncaught_error: Mutex::new(None),
            crashed: Arc::new(AtomicBool::new(false)),
            crash_message: Arc::new(Mutex::new(None)),
            crash_hook: Mutex::new(None),
        }
    }

    /// Installs the `on_uncaught_error` callback from `Synchronizer`'s
    /// construction-time configuration.
    pub(crate) fn set_uncaught_error_hook(&self, hook: Option<Py<PyAny>>) {
        *self.on_uncaught_error.lock().unwrap() = hook;
    }

    /// Wires the owning Synchronizer's `Lifecycle` so a background-thread
    /// crash also flips the Synchronizer's own externally-visible state.
    pub(crate) fn set_crash_hook(&self, lifecycle: Arc<crate::lifecycle::Lifecycle>) {
        *self.crash_hook.lock().unwrap() = Some(lifecycle);
    }

    /// If the background thread has crashed since the last check, transition
    /// `HostState` into `Failed` and notify the crash hook. Idempotent.
    fn poll_crash(&self) {
        if !self.crashed.load(Ordering::Acquire) {
            return;
        }
        let msg = self
            .crash_message
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| "background loop crashed".to_string());
        {
            let mut state = self.state.lock().unwrap();
            if !matches!(&*state, HostState::Failed(_)) {
                *state = HostState::Failed(msg.clone());
            }
        }
        if let Some(lifecycle) = self.crash_hook.lock().unwrap().as_ref() {
            lifecycle.mark_failed();
        }
        log_error!(&self.name, "{msg}");
    }

    /// Lazily start the worker thread and its loop. Thread-safe under
    /// concurrent first use via `start_lock`.
    pub(crate) fn ensure_started(&self, py: Python<'_>) -> PyResult<Py<PyAny>> {
        self.poll_crash();
        {
            let state = self.state.lock().unwrap();
            match &*state {
                HostState::Running { event_loop, .. } => return Ok(event_loop.clone_ref(py)),
                HostState::Failed(msg) => return Err(error::loop_host_err(msg.clone())),
                HostState::Closed => return Err(error::closed_err(&self.name)),
                HostState::NotStarted => {}
            }
        }

        let _start_guard = self.start_lock.lock().unwrap();
        {
            let state = self.state.lock().unwrap();
            if let HostState::Running { event_loop, .. } = &*state {
                return Ok(event_loop.clone_ref(py));
            }
        }

        let asyncio = asyncio_util::asyncio(py)?;
        let event_loop: Py<PyAny> = asyncio.call_method0(py, "new_event_loop")?;
        let event_loop_for_thread = event_loop.clone_ref(py);
        let name = self.name.clone();
        let crashed = self.crashed.clone();
        let crash_message = self.crash_message.clone();

        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<()>();
        let thread = std::thread::Builder::new()
            .name(format!("aiobridge-{}", self.name))
            .spawn(move || background_main(name, event_loop_for_thread, ready_tx, crashed, crash_message))
            .map_err(|e| error::loop_host_err(format!("failed to spawn background thread: {e}")))?;

        // Wait for the loop to actually be running before handing out the
        // handle, so a racing `run_blocking` never submits to a loop that
        // hasn't started `run_forever` yet.
        py.detach(|| ready_rx.recv().ok());

        if self.crashed.load(Ordering::Acquire) {
            self.poll_crash();
            let state = self.state.lock().unwrap();
            if let HostState::Failed(msg) = &*state {
                return Err(error::loop_host_err(msg.clone()));
            }
        }

        *self.state.lock().unwrap() = HostState::Running {
            thread,
            event_loop: event_loop.clone_ref(py),
        };
        log_info!(&self.name, "background loop started");
        Ok(event_loop)
    }

    fn next_id(&self) -> u64 {
        self.next_task_id.fetch_add(1, Ordering::Relaxed)
    }

    /// `run_blocking(coro) -> value | raises`. Forbidden on the background
    /// thread itself — callers must check that via
    /// `Dispatcher::misuse_if_on_background_thread` before calling this.
    pub(crate) fn run_blocking(&self, py: Python<'_>, coro: Py<PyAny>) -> PyResult<Py<PyAny>> {
        let event_loop = self.ensure_started(py)?;
        let ctx = copy_context(py)?;
        let (tx, rx) = oneshot::channel::<BridgeResult>();
        let tx = Arc::new(Mutex::new(Some(tx)));

        let task = self.submit_with_completion(py, &event_loop, coro, ctx, move |py, result| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(result.map(|v| v.clone_ref(py)).map_err(|e: PyErr| e.clone_ref(py)));
            }
        })?;

        // Wire keyboard-interrupt forwarding for the duration of this one
        // blocking wait. `InterruptGuard::arm` is a no-op off the main
        // thread.
        let cancel_notify = Arc::new(Notify::new());
        self.watch_cancellation(py, &event_loop, task, cancel_notify.clone())?;
        let armed = crate::lifecycle::InterruptGuard::arm(py, cancel_notify);

        let outcome = py.detach(|| block_on_current_thread(rx));

        let interrupted = if let Some((guard, interrupted)) = armed {
            guard.disarm(py);
            interrupted.load(Ordering::Acquire)
        } else {
            false
        };

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) if interrupted => Err(crate::lifecycle::keyboard_interrupt_err()),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(error::loop_host_err("background loop dropped the result channel")),
        }
    }

    /// `run_cooperative(coro) -> awaitable`, resolved on whichever loop the
    /// caller is running.
    pub(crate) fn run_cooperative(&self, py: Python<'_>, coro: Py<PyAny>, caller_loop: Py<PyAny>) -> PyResult<Py<PyAny>> {
        let event_loop = self.ensure_started(py)?;
        let ctx = copy_context(py)?;

        let (awaitable, cancel_notify) = PyFutureAwaitable::new(caller_loop.clone_ref(py));
        let awaitable = Py::new(py, awaitable)?;

        let awaitable_for_cb = awaitable.clone_ref(py);
        let caller_loop_for_cb = caller_loop.clone_ref(py);

        let task = self.submit_with_completion(py, &event_loop, coro, ctx, move |py, result| {
            let _ = call_back_on_caller_loop(py, &caller_loop_for_cb, awaitable_for_cb.clone_ref(py), result);
        })?;

        // Wire the awaitable's cancellation back to the scheduled task.
        self.watch_cancellation(py, &event_loop, task, cancel_notify)?;

        Ok(awaitable.into_any())
    }

    /// `schedule(coro) -> concurrent_future`: submit-and-return-immediately.
    pub(crate) fn schedule(&self, py: Python<'_>, coro: Py<PyAny>) -> PyResult<Py<PyAny>> {
        let event_loop = self.ensure_started(py)?;
        let ctx = copy_context(py)?;
        let id = self.next_id();

        let (tx, rx) = oneshot::channel::<BridgeResult>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let name = self.name.clone();
        let uncaught_hook = self.on_uncaught_error.lock().unwrap().as_ref().map(|h| h.clone_ref(py));

        let task = self.submit_with_completion(py, &event_loop, coro, ctx, move |py, result| {
            // `schedule()` is fire-and-forget by contract, so every error
            // here is treated as "uncaught" and offered to the configured
            // hook, regardless of whether the caller later reads
            // `ConcurrentFuture.result()` too.
            if let Err(err) = &result {
                if let Some(hook) = &uncaught_hook {
                    if let Err(hook_err) = hook.call1(py, (err.clone_ref(py),)) {
                        log_error!(&name, "on_uncaught_error hook itself raised: {hook_err}");
                    }
                } else {
                    log_error!(&name, "uncaught error in scheduled work: {err}");
                }
            }
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(result.map(|v| v.clone_ref(py)).map_err(|e: PyErr| e.clone_ref(py)));
            }
        })?;

        let cancel_notify = Arc::new(Notify::new());
        self.scheduled.insert(id, ScheduledEntry { task: task.clone(), cancel_notify: cancel_notify.clone() });

        let handle = crate::future_handle::ConcurrentFuture::new(rx, task, cancel_notify, event_loop);
        Py::new(py, handle).map(|h| h.into_any())
    }

    /// Mark a scheduled entry finished so shutdown doesn't try to cancel it.
    pub(crate) fn forget_scheduled(&self, id: u64) {
        self.scheduled.remove(&id);
    }

    /// One-step advance of an async generator/iterator living on the
    /// background loop.
    pub(crate) fn step_async_iterator(&self, py: Python<'_>, anext_coro: Py<PyAny>) -> PyResult<Py<PyAny>> {
        let event_loop = self.ensure_started(py)?;
        let ctx = copy_context(py)?;
        let aw = Py::new(py, PyIterAwaitable::new())?;
        let aw_for_cb = aw.clone_ref(py);

        self.submit_with_completion(py, &event_loop, anext_coro, ctx, move |py, result| {
            PyIterAwaitable::set_result(aw_for_cb.clone_ref(py), py, result.map(|v| v.clone_ref(py)).map_err(|e: PyErr| e.clone_ref(py)));
        })?;

        Ok(aw.into_any())
    }

    /// Submit `coro` to the background loop wrapped in a Task, invoking
    /// `on_done(py, result)` (off the background thread's own `call_soon`,
    /// i.e. still on the background loop thread) once it finalizes. Returns
    /// a `TaskHandle` cell that `TaskSetup::__call__` fills in with the real
    /// `asyncio.Task` once `ensure_future` has actually run on the loop
    /// thread, so the caller can watch/cancel it.
    fn submit_with_completion<F>(&self, py: Python<'_>, event_loop: &Py<PyAny>, coro: Py<PyAny>, ctx: Py<PyAny>, on_done: F) -> PyResult<TaskHandle>
    where
        F: FnOnce(Python<'_>, BridgeResult) + Send + 'static,
    {
        let task_cell: TaskHandle = Arc::new(Mutex::new(None));
        let setup = Py::new(
            py,
            TaskSetup {
                coro: Some(coro),
                on_done: Some(Box::new(on_done)),
                task_cell: task_cell.clone(),
            },
        )?;
        let kwargs = pyo3::types::PyDict::new(py);
        kwargs.set_item("context", &ctx)?;
        event_loop.call_method(py, pyo3::intern!(py, "call_soon_threadsafe"), (setup,), Some(&kwargs))?;
        Ok(task_cell)
    }

    fn watch_cancellation(&self, py: Python<'_>, event_loop: &Py<PyAny>, task_cell: TaskHandle, cancel_notify: Arc<Notify>) -> PyResult<()> {
        let watcher = Py::new(
            py,
            CancelWatcher {
                task_cell,
                cancel_notify,
                event_loop: event_loop.clone_ref(py),
            },
        )?;
        // Arming the watcher is itself a call onto the background loop, so
        // the plain OS thread it spawns to wait on the notifier never
        // touches the Python task directly — it only schedules the cancel
        // back onto the loop thread. Python objects are never safe to touch
        // off the loop thread that owns them.
        event_loop.call_method1(py, pyo3::intern!(py, "call_soon_threadsafe"), (watcher,))?;
        Ok(())
    }

    pub(crate) fn begin_shutdown(&self) {
        self.closing.store(true, Ordering::Release);
        self.generation.fetch_add(1, Ordering::Release);
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Bumped once per shutdown; exposed so the Synchronizer can tell a
    /// stale scheduled-work handle from the current generation apart.
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Cancel every tracked scheduled task.
    pub(crate) fn cancel_all_scheduled(&self, py: Python<'_>) {
        let event_loop = {
            let state = self.state.lock().unwrap();
            match &*state {
                HostState::Running { event_loop, .. } => event_loop.clone_ref(py),
                _ => return,
            }
        };
        for entry in self.scheduled.iter() {
            entry.cancel_notify.notify_one();
            let _ = event_loop.call_method1(
                py,
                pyo3::intern!(py, "call_soon_threadsafe"),
                (TaskCanceller::new(entry.task.clone()),),
            );
        }
        self.scheduled.clear();
    }

    /// Stop the loop and join the thread.
    pub(crate) fn stop_and_join(&self, py: Python<'_>, deadline: std::time::Duration) {
        let event_loop = {
            let state = self.state.lock().unwrap();
            match &*state {
                HostState::Running { event_loop, .. } => Some(event_loop.clone_ref(py)),
                _ => None,
            }
        };
        let Some(event_loop) = event_loop else { return };

        // `stop()` itself is not thread-safe; schedule it via
        // `call_soon_threadsafe` so `run_forever` unwinds on its own thread.
        if let Ok(stop) = event_loop.getattr(py, "stop") {
            let _ = event_loop.call_method1(py, pyo3::intern!(py, "call_soon_threadsafe"), (stop,));
        }

        let start = std::time::Instant::now();
        let thread = {
            let mut state = self.state.lock().unwrap();
            match std::mem::replace(&mut *state, HostState::Closed) {
                HostState::Running { thread, .. } => Some(thread),
                other => {
                    *state = other;
                    None
                }
            }
        };
        if let Some(thread) = thread {
            py.detach(|| {
                while start.elapsed() < deadline && !thread.is_finished() {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
            });
            if !thread.is_finished() {
                log_error!(&self.name, "background loop did not stop within the shutdown deadline; abandoning thread");
            } else {
                let _ = thread.join();
            }
        }
        log_info!(&self.name, "background loop stopped");
    }
}

fn call_back_on_caller_loop(py: Python<'_>, caller_loop: &Py<PyAny>, awaitable: Py<PyFutureAwaitable>, result: BridgeResult) -> PyResult<()> {
    let setter = Py::new(py, ResultSetter { awaitable, result: Some(result) })?;
    caller_loop.call_method1(py, pyo3::intern!(py, "call_soon_threadsafe"), (setter,))?;
    Ok(())
}

/// Bounces `PyFutureAwaitable::set_result` onto whatever loop is running the
/// `call_soon_threadsafe` callback (the caller loop), since setting the
/// result schedules further Python callbacks (done-callbacks) that must run
/// there, not on the background thread.
#[pyclass]
struct ResultSetter {
    awaitable: Py<PyFutureAwaitable>,
    result: Option<BridgeResult>,
}

#[pymethods]
impl ResultSetter {
    fn __call__(&mut self, py: Python<'_>) {
        if let Some(result) = self.result.take() {
            PyFutureAwaitable::set_result(self.awaitable.clone_ref(py), py, result);
        }
    }
}

/// Runs on the background loop thread: wraps `coro` in `ensure_future`,
/// publishes the resulting real `asyncio.Task` into `task_cell` for
/// `CancelWatcher`/`TaskCanceller`/`ConcurrentFuture` to read, and attaches a
/// done-callback that forwards the outcome to `on_done`.
#[pyclass]
struct TaskSetup {
    coro: Option<Py<PyAny>>,
    on_done: Option<Box<dyn FnOnce(Python<'_>, BridgeResult) + Send>>,
    task_cell: TaskHandle,
}

#[pymethods]
impl TaskSetup {
    fn __call__(&mut self, py: Python<'_>) -> PyResult<()> {
        let Some(coro) = self.coro.take() else { return Ok(()) };
        let Some(on_done) = self.on_done.take() else { return Ok(()) };

        let task = asyncio_util::ensure_future(py, coro)?;
        *self.task_cell.lock().unwrap() = Some(task.clone_ref(py));
        let completer = Py::new(py, TaskCompleter { on_done: Some(on_done) })?;
        task.call_method1(py, pyo3::intern!(py, "add_done_callback"), (completer,))?;
        Ok(())
    }
}

#[pyclass]
struct TaskCompleter {
    on_done: Option<Box<dyn FnOnce(Python<'_>, BridgeResult) + Send>>,
}

#[pymethods]
impl TaskCompleter {
    fn __call__(&mut self, py: Python<'_>, task: Py<PyAny>) -> PyResult<()> {
        let Some(on_done) = self.on_done.take() else { return Ok(()) };

        let cancelled = task.call_method0(py, "cancelled")?.is_truthy(py)?;
        let result = if cancelled {
            Err(error::cancelled_err(py, "background task was cancelled"))
        } else {
            match task.call_method0(py, "exception")? {
                exc if !exc.is_none(py) => Err(PyErr::from_value(exc.into_bound(py))),
                _ => task.call_method0(py, "result"),
            }
        };
        on_done(py, result);
        Ok(())
    }
}

#[pyclass]
pub(crate) struct TaskCanceller {
    task: TaskHandle,
}

impl TaskCanceller {
    pub(crate) fn new(task: TaskHandle) -> Self {
        Self { task }
    }
}

#[pymethods]
impl TaskCanceller {
    fn __call__(&self, py: Python<'_>) -> PyResult<()> {
        // The cell is empty only if `TaskSetup::__call__` hasn't run yet,
        // which `call_soon_threadsafe`'s FIFO ordering makes impossible by
        // the time this runs (the setup was always scheduled first) — this
        // check is just defensive, not load-bearing.
        if let Some(task) = self.task.lock().unwrap().as_ref() {
            if let Ok(cancel) = task.getattr(py, "cancel") {
                let _ = cancel.call0(py);
            }
        }
        Ok(())
    }
}

/// Watches a `PyFutureAwaitable`'s cancellation notifier and forwards it to
/// the underlying background task once the task exists.
#[pyclass]
struct CancelWatcher {
    task_cell: TaskHandle,
    cancel_notify: Arc<Notify>,
    event_loop: Py<PyAny>,
}

#[pymethods]
impl CancelWatcher {
    fn __call__(&self, py: Python<'_>) -> PyResult<()> {
        let notify = self.cancel_notify.clone();
        let task_cell = self.task_cell.clone();
        let event_loop = self.event_loop.clone_ref(py);
        // Wait on the notifier from a plain OS thread, not the background
        // loop thread — the background loop itself must never be blocked by
        // this wait. The actual cancellation is scheduled back onto the
        // loop thread rather than invoked here.
        let _ = std::thread::Builder::new().name("aiobridge-cancel-watch".into()).spawn(move || {
            block_on_current_thread(notify.notified());
            Python::attach(|py| {
                let _ = event_loop.call_method1(
                    py,
                    pyo3::intern!(py, "call_soon_threadsafe"),
                    (TaskCanceller::new(task_cell),),
                );
            });
        });
        let _ = py;
        Ok(())
    }
}

fn background_main(
    name: String,
    event_loop: Py<PyAny>,
    ready_tx: std::sync::mpsc::Sender<()>,
    crashed: Arc<AtomicBool>,
    crash_message: Arc<Mutex<Option<String>>>,
) {
    ON_BACKGROUND_LOOP.with(|f| f.set(true));
    Python::attach(|py| {
        if let Err(err) = asyncio_util::asyncio(py).and_then(|asyncio| {
            asyncio.call_method1(py, "set_event_loop", (&event_loop,))
        }) {
            let msg = format!("failed to install background event loop: {err}");
            log_error!(&name, "{msg}");
            *crash_message.lock().unwrap() = Some(msg);
            crashed.store(true, Ordering::Release);
            let _ = ready_tx.send(());
            return;
        }

        let _ = ready_tx.send(());
        log_debug!(&name, "entering run_forever");

        // `run_forever` returns once `loop.stop()` has been called (our
        // shutdown path) or if a callback propagates an exception that
        // isn't caught by the loop's own exception handler. The latter is
        // the Loop-host-error kind (spec §7): mark the host crashed so the
        // next call into it fails fast instead of submitting to a dead loop.
        if let Err(err) = event_loop.call_method0(py, "run_forever") {
            let msg = format!("background loop raised out of run_forever: {err}");
            log_error!(&name, "{msg}");
            *crash_message.lock().unwrap() = Some(msg);
            crashed.store(true, Ordering::Release);
        }

        let _ = event_loop.call_method0(py, "close");
    });
    log_debug!(&name, "background thread exiting");
}

/// Drive an arbitrary future to completion on the calling OS thread. The
/// blocking entry may be called from a thread that never touched tokio (a
/// plain Python thread, or the interpreter's main thread), so rather than
/// requiring an ambient runtime context we spin up a minimal current-thread
/// executor just for this wait — cheap (no extra OS thread; `block_on` runs
/// on the calling thread itself) and keeps this crate on the same `tokio`
/// primitives as the rest of the Loop Host instead of hand-rolling a waker.
fn block_on_current_thread<F: Future>(fut: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("failed to build current-thread executor for a blocking wait")
        .block_on(fut)
}
