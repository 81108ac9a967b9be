//! Error types for offload-core.

use thiserror::Error;

use crate::outcome::CellState;

/// Result type for offload-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in offload-core.
///
/// A failure of the submitted callable itself is not an `Error`: it is
/// captured as [`crate::Outcome::Failure`] and read back like any other
/// outcome.
#[derive(Debug, Error)]
pub enum Error {
    /// The work could not be submitted (handle already invoked, empty group,
    /// member added after launch).
    #[error("submission error: {0}")]
    Submission(String),

    /// The operation needs a handle that has been invoked.
    #[error("worker has not been invoked")]
    NotInvoked,

    /// An outcome was queried before the handle reached `Completed`.
    #[error("no response given{}", index.map(|i| format!(" by member {}", i)).unwrap_or_default())]
    NoResponse {
        /// Group member index, if the query addressed a single member.
        index: Option<usize>,
    },

    /// Invalid result-cell transition.
    #[error("invalid state transition from {from:?}: {message}")]
    State { from: CellState, message: String },

    /// A value crossing the process boundary could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IPC communication error with a worker process.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// Failed to create a worker thread or process.
    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    /// Group member index outside the fixed member set.
    #[error("member index {index} out of range for group of {len}")]
    IndexOutOfRange { index: usize, len: usize },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for a whole-handle `NoResponse`.
    pub(crate) fn no_response() -> Self {
        Self::NoResponse { index: None }
    }

    /// Render the error together with a recovery hint for display.
    pub fn with_hint(&self) -> String {
        let hint = match self {
            Self::Submission(_) => {
                "each handle runs exactly once; construct a new worker to run again"
            }
            Self::NotInvoked => "call invoke() before joining or controlling the worker",
            Self::NoResponse { .. } => {
                "poll has_responded() or join() the worker before reading its response"
            }
            Self::State { .. } => "an outcome can only be recorded once per handle",
            Self::Serialization(_) => {
                "arguments and return values of process workers must round-trip through serde"
            }
            Self::Ipc(_) => "the worker process may have been killed or crashed",
            Self::Spawn(_) => "check process and file-descriptor limits (ulimit -u / ulimit -n)",
            Self::IndexOutOfRange { .. } => "member indices follow submission order, starting at 0",
            Self::Io(_) => return self.to_string(),
        };
        format!("{}\n  hint: {}", self, hint)
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
