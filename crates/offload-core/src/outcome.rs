//! Outcomes of deferred work and the write-once cell that holds them.
//!
//! Every handle owns a [`ResultCell`]. The cell moves through
//! `Unstarted → [AwaitingBarrier →] Running → Completed` and never back;
//! once completed its [`Outcome`] is immutable.

use std::any::Any;
use std::fmt;

use serde::Serialize;

use crate::error::{Error, Result};

/// Lifecycle state of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CellState {
    /// Created, not yet invoked.
    Unstarted,
    /// Process spawned, waiting for the group start token.
    AwaitingBarrier,
    /// Callable is (or may be) executing.
    Running,
    /// Outcome recorded.
    Completed,
}

/// Classification of a captured failure.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize,
    rkyv::Archive, rkyv::Serialize, rkyv::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The callable returned `Err`.
    Error,
    /// The callable panicked.
    Panic,
    /// A value could not cross the process boundary.
    Serialization,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Error => "error",
            Self::Panic => "panic",
            Self::Serialization => "serialization",
        })
    }
}

/// Serializable envelope for a failure raised by a callable.
///
/// Built at the failure site. The error value itself is never shipped
/// across a process boundary; only its kind, rendered message and an
/// optional detail string (the error type name, for returned errors).
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error,
    rkyv::Archive, rkyv::Serialize, rkyv::Deserialize,
)]
#[error("{kind}: {message}")]
pub struct WorkerFailure {
    pub kind: FailureKind,
    pub message: String,
    pub detail: Option<String>,
}

impl WorkerFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Capture an error returned by a callable.
    pub fn from_error<E: fmt::Display>(error: &E) -> Self {
        Self::new(FailureKind::Error, error.to_string()).with_detail(std::any::type_name::<E>())
    }

    /// Capture a panic payload.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "callable panicked with a non-string payload".to_string()
        };
        Self::new(FailureKind::Panic, message)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Serialization, message)
    }
}

/// Final result of one unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome<T> {
    Success(T),
    Failure(WorkerFailure),
}

impl<T> Outcome<T> {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    pub fn success(&self) -> Option<&T> {
        match self {
            Self::Success(value) => Some(value),
            Self::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&WorkerFailure> {
        match self {
            Self::Success(_) => None,
            Self::Failure(failure) => Some(failure),
        }
    }

    /// Convert into a `Result`, so callers can use `?` on a failure.
    pub fn into_result(self) -> std::result::Result<T, WorkerFailure> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Failure(failure) => Err(failure),
        }
    }
}

impl<T> From<std::result::Result<T, WorkerFailure>> for Outcome<T> {
    fn from(result: std::result::Result<T, WorkerFailure>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(failure) => Self::Failure(failure),
        }
    }
}

/// Write-once holder of a handle's state and outcome.
#[derive(Debug)]
pub struct ResultCell<T> {
    state: CellState,
    outcome: Option<Outcome<T>>,
}

impl<T> Default for ResultCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResultCell<T> {
    pub fn new() -> Self {
        Self {
            state: CellState::Unstarted,
            outcome: None,
        }
    }

    pub fn state(&self) -> CellState {
        self.state
    }

    /// Move forward to `next`. Regressing, or leaving `Completed`, is refused.
    fn advance(&mut self, next: CellState) -> Result<()> {
        if self.state >= next || self.state == CellState::Completed {
            return Err(Error::State {
                from: self.state,
                message: format!("cannot move to {:?}", next),
            });
        }
        self.state = next;
        Ok(())
    }

    /// `Unstarted → AwaitingBarrier`.
    pub fn await_barrier(&mut self) -> Result<()> {
        self.advance(CellState::AwaitingBarrier)
    }

    /// `Unstarted | AwaitingBarrier → Running`.
    pub fn start(&mut self) -> Result<()> {
        self.advance(CellState::Running)
    }

    /// Record the outcome. Fails with [`Error::State`] if one is already set.
    pub fn complete(&mut self, outcome: Outcome<T>) -> Result<()> {
        self.advance(CellState::Completed)?;
        self.outcome = Some(outcome);
        Ok(())
    }

    pub fn set_success(&mut self, value: T) -> Result<()> {
        self.complete(Outcome::Success(value))
    }

    pub fn set_failure(&mut self, failure: WorkerFailure) -> Result<()> {
        self.complete(Outcome::Failure(failure))
    }

    /// The recorded outcome, or [`Error::NoResponse`] if not yet completed.
    pub fn outcome(&self) -> Result<&Outcome<T>> {
        self.outcome.as_ref().ok_or_else(Error::no_response)
    }

    pub fn has_erred(&self) -> Result<bool> {
        self.outcome().map(Outcome::is_failure)
    }

    pub fn has_responded(&self) -> bool {
        self.state == CellState::Completed
    }

    pub fn into_outcome(self) -> Option<Outcome<T>> {
        self.outcome
    }
}
