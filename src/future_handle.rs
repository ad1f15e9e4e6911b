//! `ConcurrentFuture`: the handle `LoopHost::schedule` hands back for
//! fire-and-forget submissions. Deliberately NOT an `asyncio.Future`
//! duck-type — unlike `PyFutureAwaitable` this is meant to be waited on from
//! blocking code (no event loop required), so it follows the shape of
//! `concurrent.futures.Future` instead: `result(timeout=None)`, `cancel()`,
//! `done()`, `cancelled()`, `add_done_callback`.

use pyo3::prelude::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::sync::Notify;

use crate::callbacks::BridgeResult;
use crate::error;
use crate::loop_host::TaskHandle;

enum Slot {
    Pending(oneshot::Receiver<BridgeResult>),
    Ready(BridgeResult),
    Cancelled,
}

#[pyclass]
pub(crate) struct ConcurrentFuture {
    slot: Mutex<Slot>,
    task: TaskHandle,
    cancel_notify: Arc<Notify>,
    event_loop: Py<PyAny>,
}

impl ConcurrentFuture {
    pub(crate) fn new(rx: oneshot::Receiver<BridgeResult>, task: TaskHandle, cancel_notify: Arc<Notify>, event_loop: Py<PyAny>) -> Self {
        Self {
            slot: Mutex::new(Slot::Pending(rx)),
            task,
            cancel_notify,
            event_loop,
        }
    }

    /// Drain the channel without blocking; used by `done`/`cancelled` so they
    /// never park the calling thread.
    fn try_settle(&self) {
        let mut slot = self.slot.lock().unwrap();
        if let Slot::Pending(rx) = &mut *slot {
            if let Ok(result) = rx.try_recv() {
                *slot = Slot::Ready(result);
            }
        }
    }
}

#[pymethods]
impl ConcurrentFuture {
    #[pyo3(signature = (timeout=None))]
    fn result(&self, py: Python<'_>, timeout: Option<f64>) -> PyResult<Py<PyAny>> {
        {
            let mut slot = self.slot.lock().unwrap();
            if let Slot::Pending(rx) = &mut *slot {
                let outcome = py.detach(|| match timeout {
                    Some(secs) => block_on_with_timeout(rx, Duration::from_secs_f64(secs.max(0.0))),
                    None => block_on(rx).map(Some),
                });
                match outcome {
                    Ok(Some(result)) => *slot = Slot::Ready(result),
                    Ok(None) => return Err(pyo3::exceptions::PyTimeoutError::new_err("result not available within timeout")),
                    Err(_) => *slot = Slot::Ready(Err(error::loop_host_err("background loop dropped the result channel"))),
                }
            }
        }

        let slot = self.slot.lock().unwrap();
        match &*slot {
            Slot::Ready(Ok(v)) => Ok(v.clone_ref(py)),
            Slot::Ready(Err(e)) => Err(e.clone_ref(py)),
            Slot::Cancelled => Err(error::cancelled_err(py, "scheduled work was cancelled")),
            Slot::Pending(_) => unreachable!("settled above"),
        }
    }

    fn cancel(&self, py: Python<'_>) -> bool {
        self.try_settle();
        let mut slot = self.slot.lock().unwrap();
        if matches!(&*slot, Slot::Pending(_)) {
            *slot = Slot::Cancelled;
            self.cancel_notify.notify_one();
            let canceller = crate::loop_host::TaskCanceller::new(self.task.clone());
            if let Ok(canceller) = Py::new(py, canceller) {
                let _ = self.event_loop.call_method1(py, pyo3::intern!(py, "call_soon_threadsafe"), (canceller,));
            }
            true
        } else {
            false
        }
    }

    fn done(&self) -> bool {
        self.try_settle();
        !matches!(&*self.slot.lock().unwrap(), Slot::Pending(_))
    }

    fn cancelled(&self) -> bool {
        self.try_settle();
        matches!(&*self.slot.lock().unwrap(), Slot::Cancelled)
    }
}

/// Minimal current-thread `tokio` executor for one blocking wait, mirroring
/// `loop_host::block_on_current_thread` — this crate's one way of driving a
/// future to completion on a caller thread that may never have touched
/// tokio, rather than hand-rolling a park/unpark waker.
fn current_thread_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("failed to build current-thread executor for a blocking wait")
}

/// Takes `rx` by mutable reference rather than by value: a timed-out wait
/// must leave the receiver intact so a later `result(timeout=...)` call can
/// keep waiting on the same still-pending channel instead of losing it.
fn block_on(rx: &mut oneshot::Receiver<BridgeResult>) -> Result<BridgeResult, oneshot::error::RecvError> {
    current_thread_runtime().block_on(rx)
}

fn block_on_with_timeout(rx: &mut oneshot::Receiver<BridgeResult>, timeout: Duration) -> Result<Option<BridgeResult>, oneshot::error::RecvError> {
    current_thread_runtime().block_on(async {
        match tokio::time::timeout(timeout, &mut *rx).await {
            Ok(result) => result.map(Some),
            Err(_elapsed) => Ok(None),
        }
    })
}
