//! Execution backends for deferred work.
//!
//! # Backends
//!
//! - **`ThreadWorker`** - Runs the callable on a new OS thread in the same
//!   address space. The outcome is written straight into shared memory.
//! - **`ProcessWorker`** - Runs the callable in a forked child process. The
//!   outcome comes back serialized over a pipe; the child can be suspended,
//!   resumed and killed at the OS level.
//! - **`ProcessGroup`** - Runs N callables as N forked children that all
//!   wait on a start barrier, then exposes per-member and aggregate queries.
//!
//! # Architecture
//!
//! ```text
//! ProcessWorker / ProcessGroup member (parent)
//!     │
//!     └── Worker (ipc)
//!             │
//!             ├── fork() → child runs `serve`
//!             │       ├── Ready            (group members only)
//!             │       ├── blocks on Start { args }
//!             │       └── Success { payload } | Failure(WorkerFailure)
//!             │
//!             ├── poll(2) + read → ResultCell on update()
//!             │
//!             └── SIGSTOP / SIGCONT / SIGKILL
//! ```

mod thread;
#[cfg(unix)]
mod group;
#[cfg(unix)]
mod process;

pub use thread::ThreadWorker;
#[cfg(unix)]
pub use group::ProcessGroup;
#[cfg(unix)]
pub use process::ProcessWorker;

#[cfg(unix)]
use std::time::{Duration, Instant};

#[cfg(unix)]
use crate::error::Result;

/// Run `step` every `interval` until it returns `true` or `deadline` passes.
///
/// Returns the last value of `step`.
#[cfg(unix)]
fn poll_until(
    deadline: Option<Instant>,
    interval: Duration,
    mut step: impl FnMut() -> Result<bool>,
) -> Result<bool> {
    loop {
        if step()? {
            return Ok(true);
        }
        let mut nap = interval;
        if let Some(deadline) = deadline {
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            nap = nap.min(deadline - now);
        }
        std::thread::sleep(nap);
    }
}
