//! Forked worker processes and OS-level process control.

use std::io::{self, Write};
use std::os::fd::RawFd;
use std::os::unix::process::ExitStatusExt;
use std::panic::{self, AssertUnwindSafe};
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::WorkerConfig;
use crate::error::{Error, Result};

use super::channel::{ChildChannel, ParentChannel, channel_pair};

/// Exit code of a worker whose body unwound past the catch in `serve`.
const EXIT_WORKER_PANICKED: i32 = 101;

/// State shared between a [`ChildProcess`] and its [`KillHandle`]s.
#[derive(Debug)]
struct Control {
    pid: libc::pid_t,
    killed: AtomicBool,
    reaped: AtomicBool,
}

impl Control {
    /// Send SIGKILL, at most once.
    fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) || self.reaped.load(Ordering::SeqCst) {
            return;
        }
        // SAFETY: plain kill(2); the pid is ours and not yet reaped.
        unsafe {
            libc::kill(self.pid, libc::SIGKILL);
        }
    }
}

/// Thread-safe handle for killing worker processes from another thread.
///
/// Cloneable. Killing through the handle is the same terminal action as
/// `kill()` on the owning worker: the worker never responds afterwards.
#[derive(Debug, Clone)]
pub struct KillHandle {
    controls: Vec<Arc<Control>>,
}

impl KillHandle {
    /// Kill every process behind this handle immediately.
    pub fn kill(&self) {
        for control in &self.controls {
            control.kill();
        }
    }

    /// Check if a kill has been requested for every process behind this handle.
    pub fn is_killed(&self) -> bool {
        self.controls
            .iter()
            .all(|control| control.killed.load(Ordering::SeqCst))
    }

    pub(crate) fn merge(handles: impl IntoIterator<Item = KillHandle>) -> Self {
        Self {
            controls: handles.into_iter().flat_map(|h| h.controls).collect(),
        }
    }
}

/// A forked worker process owned by the parent.
pub(crate) struct ChildProcess {
    control: Arc<Control>,
    status: Option<ExitStatus>,
    kill_on_drop: bool,
}

impl ChildProcess {
    pub fn pid(&self) -> u32 {
        self.control.pid as u32
    }

    pub fn was_killed(&self) -> bool {
        self.control.killed.load(Ordering::SeqCst)
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.status
    }

    pub fn kill_handle(&self) -> KillHandle {
        KillHandle {
            controls: vec![Arc::clone(&self.control)],
        }
    }

    fn reaped(&self) -> bool {
        self.control.reaped.load(Ordering::SeqCst)
    }

    fn waitpid(&mut self, flags: libc::c_int) -> Result<Option<ExitStatus>> {
        if self.reaped() {
            return Ok(self.status);
        }
        let mut raw: libc::c_int = 0;
        loop {
            // SAFETY: waitpid(2) on our own child with a valid status pointer.
            let rc = unsafe { libc::waitpid(self.control.pid, &mut raw, flags) };
            if rc == 0 {
                return Ok(None);
            }
            if rc == self.control.pid {
                let status = ExitStatus::from_raw(raw);
                self.status = Some(status);
                self.control.reaped.store(true, Ordering::SeqCst);
                return Ok(Some(status));
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ECHILD) => {
                    // Already collected elsewhere; nothing left to wait for.
                    self.control.reaped.store(true, Ordering::SeqCst);
                    return Ok(self.status);
                }
                _ => return Err(Error::Ipc(format!("Failed to wait for worker: {}", err))),
            }
        }
    }

    /// Reap the process if it has exited, without blocking.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        self.waitpid(libc::WNOHANG)
    }

    pub fn is_alive(&mut self) -> Result<bool> {
        self.try_wait()?;
        Ok(!self.reaped())
    }

    fn signal(&mut self, signal: libc::c_int, action: &str) -> Result<()> {
        if !self.is_alive()? {
            tracing::debug!("Skipping {} of exited worker {}", action, self.control.pid);
            return Ok(());
        }
        // SAFETY: plain kill(2) on our own unreaped child.
        if unsafe { libc::kill(self.control.pid, signal) } == -1 {
            let err = io::Error::last_os_error();
            // ESRCH means process already exited, which is fine
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(Error::Ipc(format!(
                    "Failed to {} worker {}: {}",
                    action, self.control.pid, err
                )));
            }
        }
        Ok(())
    }

    /// Stop the process (SIGSTOP). Not cooperative: any resource the worker
    /// holds stays held until it is resumed.
    pub fn suspend(&mut self) -> Result<()> {
        self.signal(libc::SIGSTOP, "suspend")
    }

    /// Continue a stopped process (SIGCONT).
    pub fn resume(&mut self) -> Result<()> {
        self.signal(libc::SIGCONT, "resume")
    }

    /// Kill the process immediately (SIGKILL) and reap it.
    pub fn kill(&mut self) -> Result<()> {
        self.control.kill();
        self.waitpid(0)?;
        Ok(())
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if self.reaped() {
            return;
        }
        if self.kill_on_drop {
            if let Err(e) = self.kill() {
                tracing::warn!("Failed to kill worker on drop: {}", e);
            }
        } else if let Err(e) = self.try_wait() {
            tracing::warn!("Failed to reap worker on drop: {}", e);
        }
    }
}

/// Fork a worker process that runs `body` with its end of a fresh channel.
///
/// `inherited` lists parent-side descriptors of sibling workers; the child
/// closes them so each channel has exactly one writer per direction.
/// The child never returns from this function: it exits with the code
/// `body` returns, skipping the parent's destructors and exit handlers.
pub(crate) fn fork_worker<F>(
    config: &WorkerConfig,
    inherited: &[RawFd],
    body: F,
) -> Result<(ChildProcess, ParentChannel)>
where
    F: FnOnce(ChildChannel) -> i32,
{
    let (parent, child) = channel_pair(config.max_message_bytes)?;

    // Flush buffered stdio so the child does not replay it.
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();

    // SAFETY: the child only runs `body` and then `_exit`s; it never returns
    // into the caller's stack frames or runs the parent's destructors.
    match unsafe { libc::fork() } {
        -1 => Err(Error::Spawn(format!(
            "fork failed: {}",
            io::Error::last_os_error()
        ))),
        0 => {
            drop(parent);
            for &fd in inherited {
                // SAFETY: closing our copy of a sibling's descriptor; nothing
                // in this process uses it again.
                unsafe {
                    libc::close(fd);
                }
            }
            // Failures are reported over the channel; keep stderr quiet.
            panic::set_hook(Box::new(|_| {}));
            let code = panic::catch_unwind(AssertUnwindSafe(move || body(child)))
                .unwrap_or(EXIT_WORKER_PANICKED);
            // SAFETY: terminate the child without unwinding into the parent's frames.
            unsafe { libc::_exit(code) }
        }
        pid => {
            drop(child);
            Ok((
                ChildProcess {
                    control: Arc::new(Control {
                        pid,
                        killed: AtomicBool::new(false),
                        reaped: AtomicBool::new(false),
                    }),
                    status: None,
                    kill_on_drop: config.kill_on_drop,
                },
                parent,
            ))
        }
    }
}
