//! Process-isolated worker for a single callable.
//!
//! Provides true interruption capability by running the callable in a
//! forked child process that can be stopped, continued or killed at any time.

use std::fmt;
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::ipc::{KillHandle, Worker};
use crate::outcome::{CellState, Outcome, ResultCell};
use crate::task::{self, BoxedTask};

use super::poll_until;

/// Runs a callable in an isolated child process.
///
/// Failures are always captured: an `Err` or panic inside the child is sent
/// back as `Outcome::Failure`. Unlike [`super::ThreadWorker`] there is no
/// switch to turn capture off, because a failure in another address space
/// has nowhere else to go.
///
/// The callable reaches the child through `fork(2)`; its argument and its
/// return value cross the channel serialized, so both must implement serde.
///
/// Unlike `ThreadWorker`, the callable cannot affect the parent's memory:
/// - Immediate interruption with [`ProcessWorker::kill`]
/// - Crash isolation (a panic or abort does not affect the caller)
/// - OS-level suspension with [`ProcessWorker::suspend`]
pub struct ProcessWorker<A, T> {
    id: Uuid,
    config: WorkerConfig,
    task: Option<BoxedTask<A, T>>,
    worker: Option<Worker<T>>,
    cell: ResultCell<T>,
}

impl<A, T> ProcessWorker<A, T>
where
    A: Serialize + DeserializeOwned + 'static,
    T: Serialize + DeserializeOwned + 'static,
{
    pub fn new<F, E>(f: F) -> Self
    where
        F: FnOnce(A) -> std::result::Result<T, E> + Send + 'static,
        E: fmt::Display,
    {
        Self::with_config(f, WorkerConfig::default())
    }

    pub fn with_config<F, E>(f: F, config: WorkerConfig) -> Self
    where
        F: FnOnce(A) -> std::result::Result<T, E> + Send + 'static,
        E: fmt::Display,
    {
        Self {
            id: Uuid::new_v4(),
            config,
            task: Some(task::boxed(f)),
            worker: None,
            cell: ResultCell::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Fork the child and send it the serialized arguments. Returns immediately.
    pub fn invoke(&mut self, args: A) -> Result<()> {
        let task = self
            .task
            .take()
            .ok_or_else(|| Error::Submission("process worker already invoked".to_string()))?;
        let args = match bincode::serialize(&args) {
            Ok(args) => args,
            Err(e) => {
                self.task = Some(task);
                return Err(e.into());
            }
        };

        let mut worker = Worker::spawn(&self.config, task, false, &[])?;
        worker.start(&args)?;
        self.cell.start()?;

        tracing::debug!(worker = %self.id, pid = worker.pid(), "Started worker process");
        self.worker = Some(worker);
        Ok(())
    }

    fn worker_mut(&mut self) -> Result<&mut Worker<T>> {
        self.worker.as_mut().ok_or(Error::NotInvoked)
    }

    /// Non-blocking: if the child's outcome has arrived, record it.
    pub fn update(&mut self) -> Result<()> {
        if self.cell.has_responded() {
            return Ok(());
        }
        let Some(worker) = self.worker.as_mut() else {
            return Ok(());
        };
        if let Some(outcome) = worker.poll()? {
            tracing::debug!(
                worker = %self.id,
                failed = outcome.is_failure(),
                "Worker process responded"
            );
            self.cell.complete(outcome)?;
        }
        Ok(())
    }

    /// Block until the child exits or `timeout` elapses (`None` waits without
    /// bound). Returns whether the child has exited.
    ///
    /// The channel is drained while waiting so a large reply cannot leave the
    /// child blocked on a full pipe. An expired timeout does not kill the child.
    pub fn join(&mut self, timeout: Option<Duration>) -> Result<bool> {
        self.worker_mut()?;
        // A timeout too large to represent as an instant means no deadline.
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let interval = self.config.poll_interval;

        poll_until(deadline, interval, || {
            self.update()?;
            let exited = !self.worker_mut()?.is_alive()?;
            if exited {
                self.update()?;
            }
            Ok(exited)
        })
    }

    /// Stop the child at the OS level (SIGSTOP).
    ///
    /// Not cooperative: anything the child holds (locks, files) stays held
    /// until [`ProcessWorker::resume`].
    pub fn suspend(&mut self) -> Result<()> {
        self.worker_mut()?.suspend()
    }

    /// Continue a suspended child (SIGCONT).
    pub fn resume(&mut self) -> Result<()> {
        self.worker_mut()?.resume()
    }

    /// Kill the child immediately (SIGKILL).
    ///
    /// Terminal: no outcome is produced afterwards and `has_responded()` stays
    /// false unless the outcome had already been recorded.
    pub fn kill(&mut self) -> Result<()> {
        let id = self.id;
        let worker = self.worker_mut()?;
        tracing::debug!(worker = %id, pid = worker.pid(), "Killing worker process");
        worker.kill()
    }

    /// Handle that can kill the child from another thread.
    pub fn kill_handle(&self) -> Option<KillHandle> {
        self.worker.as_ref().map(Worker::kill_handle)
    }

    pub fn pid(&self) -> Option<u32> {
        self.worker.as_ref().map(Worker::pid)
    }

    pub fn is_alive(&mut self) -> bool {
        match self.worker.as_mut() {
            Some(worker) => worker.is_alive().unwrap_or(false),
            None => false,
        }
    }

    /// Exit status once the child has been reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.worker.as_ref().and_then(Worker::exit_status)
    }

    pub fn state(&self) -> CellState {
        self.cell.state()
    }

    /// The outcome, or [`Error::NoResponse`] until the child has responded.
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
}
