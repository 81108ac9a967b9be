//! In-process worker thread.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::outcome::{CellState, Outcome, ResultCell};
use crate::task::{self, BoxedTask};

/// What the worker thread writes and the handle reads.
struct SlotState<T> {
    outcome: Option<Outcome<T>>,
    finished: bool,
    panicked: bool,
}

/// Memory shared between the handle and its thread.
struct Slot<T> {
    state: Mutex<SlotState<T>>,
    done: Condvar,
}

impl<T> Slot<T> {
    /// Recover the guard from a poisoned lock; the state is plain data that is
    /// only ever written whole.
    fn lock(&self) -> MutexGuard<'_, SlotState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Marks the slot finished when the thread ends, by return or by unwinding.
struct FinishGuard<T>(Arc<Slot<T>>);

impl<T> Drop for FinishGuard<T> {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        state.finished = true;
        state.panicked = thread::panicking();
        self.0.done.notify_all();
    }
}

/// Runs a callable on a separate OS thread.
///
/// With failure capture enabled, an `Err` or panic from the callable becomes
/// `Outcome::Failure`. With it disabled (the default), the failure unwinds
/// the worker thread instead and no outcome is ever recorded; see
/// [`ThreadWorker::terminated_abnormally`].
///
/// ```
/// use std::time::Duration;
/// use offload_core::{Outcome, ThreadWorker};
///
/// let mut worker = ThreadWorker::new(|x: i32| Ok::<_, String>(x * 2));
/// worker.invoke(21).unwrap();
/// assert!(worker.join(Some(Duration::from_secs(5))).unwrap());
/// assert_eq!(worker.response().unwrap(), &Outcome::Success(42));
/// ```
pub struct ThreadWorker<A, T> {
    id: Uuid,
    task: Option<BoxedTask<A, T>>,
    capture_failures: bool,
    slot: Arc<Slot<T>>,
    thread: Option<JoinHandle<()>>,
    cell: ResultCell<T>,
}

impl<A, T> ThreadWorker<A, T>
where
    A: Send + 'static,
    T: Send + 'static,
{
    pub fn new<F, E>(f: F) -> Self
    where
        F: FnOnce(A) -> std::result::Result<T, E> + Send + 'static,
        E: fmt::Display,
    {
        Self {
            id: Uuid::new_v4(),
            task: Some(task::boxed(f)),
            capture_failures: false,
            slot: Arc::new(Slot {
                state: Mutex::new(SlotState {
                    outcome: None,
                    finished: false,
                    panicked: false,
                }),
                done: Condvar::new(),
            }),
            thread: None,
            cell: ResultCell::new(),
        }
    }

    /// Record failures as outcomes instead of letting them end the thread.
    pub fn capture_failures(mut self, capture: bool) -> Self {
        self.capture_failures = capture;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Start the callable on a new thread. Returns immediately.
    pub fn invoke(&mut self, args: A) -> Result<()> {
        let work = self
            .task
            .take()
            .ok_or_else(|| Error::Submission("thread worker already invoked".to_string()))?;

        let slot = Arc::clone(&self.slot);
        let capture = self.capture_failures;
        let handle = thread::Builder::new()
            .name(format!("offload-{}", self.id.simple()))
            .spawn(move || {
                let _finish = FinishGuard(Arc::clone(&slot));
                let outcome = if capture {
                    task::run_captured(work, args)
                } else {
                    match work(args) {
                        Ok(value) => Outcome::Success(value),
                        Err(failure) => panic!("{}", failure),
                    }
                };
                slot.lock().outcome = Some(outcome);
            })
            .map_err(|e| Error::Spawn(format!("failed to spawn worker thread: {}", e)))?;

        self.cell.start()?;
        self.thread = Some(handle);
        tracing::debug!(worker = %self.id, capture, "Started worker thread");
        Ok(())
    }

    /// Move an outcome written by the thread into this handle's cell.
    pub fn update(&mut self) -> Result<()> {
        if self.cell.has_responded() {
            return Ok(());
        }
        let outcome = self.slot.lock().outcome.take();
        if let Some(outcome) = outcome {
            tracing::debug!(worker = %self.id, failed = outcome.is_failure(), "Worker thread responded");
            self.cell.complete(outcome)?;
        }
        Ok(())
    }

    /// Block until the thread terminates or `timeout` elapses (`None` waits
    /// without bound). Returns whether the thread has terminated.
    ///
    /// Does not read the outcome, and an expired timeout does not stop the thread.
    pub fn join(&mut self, timeout: Option<Duration>) -> Result<bool> {
        if self.cell.state() == CellState::Unstarted {
            return Err(Error::NotInvoked);
        }

        // A timeout too large to represent as an instant means no deadline.
        let timeout = timeout.filter(|t| Instant::now().checked_add(*t).is_some());
        let finished = {
            let guard = self.slot.lock();
            let guard = match timeout {
                None => self
                    .slot
                    .done
                    .wait_while(guard, |s| !s.finished)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(timeout) => {
                    self.slot
                        .done
                        .wait_timeout_while(guard, timeout, |s| !s.finished)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
            guard.finished
        };

        if finished {
            if let Some(handle) = self.thread.take() {
                if handle.join().is_err() {
                    tracing::warn!(worker = %self.id, "Worker thread terminated abnormally");
                }
            }
        }
        Ok(finished)
    }

    /// Whether the thread has terminated.
    pub fn is_finished(&self) -> bool {
        self.slot.lock().finished
    }

    /// Whether the thread ended by unwinding instead of recording an outcome.
    ///
    /// Only possible with failure capture disabled.
    pub fn terminated_abnormally(&self) -> bool {
        self.slot.lock().panicked
    }

    pub fn state(&self) -> CellState {
        self.cell.state()
    }

    /// The outcome, or [`Error::NoResponse`] until the thread has responded.
    pub fn response(&mut self) -> Result<&Outcome<T>> {
        self.update()?;
        self.cell.outcome()
    }

    pub fn has_erred(&mut self) -> Result<bool> {
        self.update()?;
        self.cell.has_erred()
    }

    pub fn has_responded(&mut self) -> bool {
        if let Err(e) = self.update() {
            tracing::warn!(worker = %self.id, "Failed to refresh worker state: {}", e);
        }
        self.cell.has_responded()
    }

    /// Consume the handle, returning the outcome if one was recorded.
    pub fn into_outcome(mut self) -> Option<Outcome<T>> {
        self.has_responded();
        self.cell.into_outcome()
    }
}
