//! Deferred execution with a uniform result-handle contract.
//!
//! This crate provides:
//! - `ThreadWorker` - run a callable on an in-process worker thread
//! - `ProcessWorker` - run a callable in an isolated, killable child process
//! - `ProcessGroup` - run N callables as N child processes behind a start barrier
//! - `ResultCell` / `Outcome` - the write-once outcome every handle exposes
//!
//! Each handle is invoked once, starts eagerly, and is then polled or joined.
//! A failure inside the callable never escapes into the caller as an error;
//! it becomes `Outcome::Failure(WorkerFailure)` and is read back like a
//! success (except on a `ThreadWorker` with failure capture disabled).

pub mod config;
pub mod error;
pub mod execute;
#[cfg(unix)]
pub mod ipc;
pub mod outcome;
mod task;

pub use config::WorkerConfig;
pub use error::{Error, Result};
pub use execute::ThreadWorker;
#[cfg(unix)]
pub use execute::{ProcessGroup, ProcessWorker};
#[cfg(unix)]
pub use ipc::KillHandle;
pub use outcome::{CellState, FailureKind, Outcome, ResultCell, WorkerFailure};
