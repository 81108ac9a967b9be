//! Duplex pipe channel between a parent and one forked worker.

use std::fs::File;
use std::io::{self, BufWriter, Read};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::error::{Error, Result};

use super::protocol::{ChildMessage, LENGTH_PREFIX, ParentMessage, read_message, write_message};

/// Result of a non-blocking receive on the parent end.
#[derive(Debug)]
pub(crate) enum Received {
    /// Nothing has arrived yet.
    Pending,
    /// A complete message.
    Message(ChildMessage),
    /// The worker closed its end without sending anything more.
    Closed,
}

/// Largest single read from the reply pipe.
const READ_CHUNK: usize = 64 * 1024;

/// Parent end: writes commands, reads replies.
///
/// The reply descriptor is non-blocking. Bytes of a frame that has not fully
/// arrived stay in `partial` until a later call completes it, so a worker
/// stopped halfway through a large write never stalls the parent.
pub(crate) struct ParentChannel {
    commands: BufWriter<File>,
    replies: File,
    partial: Vec<u8>,
    max_message_bytes: usize,
}

/// Worker end: reads commands, writes replies. All operations block.
pub(crate) struct ChildChannel {
    commands: File,
    replies: BufWriter<File>,
    max_message_bytes: usize,
}

fn pipe() -> io::Result<(File, File)> {
    let mut fds: [RawFd; 2] = [-1; 2];
    // SAFETY: `fds` is a valid two-element buffer for pipe(2) to fill.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe(2) succeeded, so both descriptors are open and owned by nobody else.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    Ok((File::from(read), File::from(write)))
}

fn set_nonblocking(file: &File) -> io::Result<()> {
    let fd = file.as_raw_fd();
    // SAFETY: fcntl(2) flag query and update on a descriptor we own.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags == -1 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Create both ends of a worker channel.
pub(crate) fn channel_pair(max_message_bytes: usize) -> Result<(ParentChannel, ChildChannel)> {
    let (command_rx, command_tx) = pipe()?;
    let (reply_rx, reply_tx) = pipe()?;
    set_nonblocking(&reply_rx)?;

    Ok((
        ParentChannel {
            commands: BufWriter::new(command_tx),
            replies: reply_rx,
            partial: Vec::new(),
            max_message_bytes,
        },
        ChildChannel {
            commands: command_rx,
            replies: BufWriter::new(reply_tx),
            max_message_bytes,
        },
    ))
}

impl ParentChannel {
    pub fn send(&mut self, message: &ParentMessage) -> Result<()> {
        write_message(&mut self.commands, message)
    }

    /// Block until the next message, or `None` if the worker closed its end.
    pub fn recv(&mut self) -> Result<Option<ChildMessage>> {
        loop {
            match self.try_recv()? {
                Received::Message(message) => return Ok(Some(message)),
                Received::Closed => return Ok(None),
                Received::Pending => self.wait_readable()?,
            }
        }
    }

    /// Check for a reply without blocking.
    ///
    /// Takes whatever the pipe holds right now and reports `Pending` until a
    /// whole frame has arrived.
    pub fn try_recv(&mut self) -> Result<Received> {
        if let Some(message) = self.take_frame()? {
            return Ok(Received::Message(message));
        }
        let closed = self.fill()?;
        if let Some(message) = self.take_frame()? {
            return Ok(Received::Message(message));
        }
        match (closed, self.partial.is_empty()) {
            (false, _) => Ok(Received::Pending),
            (true, true) => Ok(Received::Closed),
            (true, false) => Err(Error::Ipc(format!(
                "Worker closed its channel mid-frame ({} bytes received)",
                self.partial.len()
            ))),
        }
    }

    /// Read until the pipe is empty. Returns whether the writer has gone away.
    fn fill(&mut self) -> Result<bool> {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            // An oversized frame is rejected by `take_frame`; stop buffering it.
            if self.partial.len() > LENGTH_PREFIX + self.max_message_bytes {
                return Ok(false);
            }
            match self.replies.read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => self.partial.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(Error::Ipc(format!(
                        "Failed to read from worker channel: {}",
                        e
                    )));
                }
            }
        }
    }

    /// Split off and decode the first buffered frame once all of it is here.
    fn take_frame(&mut self) -> Result<Option<ChildMessage>> {
        let Some(prefix) = self.partial.first_chunk::<LENGTH_PREFIX>() else {
            return Ok(None);
        };
        let len = u32::from_le_bytes(*prefix) as usize;
        if len > self.max_message_bytes {
            return Err(Error::Ipc(format!(
                "IPC message too large: {} bytes (limit {})",
                len, self.max_message_bytes
            )));
        }
        if self.partial.len() < LENGTH_PREFIX + len {
            return Ok(None);
        }

        let rest = self.partial.split_off(LENGTH_PREFIX + len);
        let frame = std::mem::replace(&mut self.partial, rest);
        read_message(&mut frame.as_slice(), self.max_message_bytes)
    }

    fn wait_readable(&self) -> Result<()> {
        let mut pfd = libc::pollfd {
            fd: self.replies.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        loop {
            // SAFETY: `pfd` is a single valid pollfd; -1 waits until readable or hung up.
            if unsafe { libc::poll(&mut pfd, 1, -1) } >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(Error::Ipc(format!("Failed to poll worker channel: {}", err)));
            }
        }
    }

    /// Descriptors held by this end, for closing in sibling workers.
    pub fn raw_fds(&self) -> [RawFd; 2] {
        [self.commands.get_ref().as_raw_fd(), self.replies.as_raw_fd()]
    }
}

impl ChildChannel {
    pub fn send(&mut self, message: &ChildMessage) -> Result<()> {
        write_message(&mut self.replies, message)
    }

    pub fn recv(&mut self) -> Result<Option<ParentMessage>> {
        read_message(&mut self.commands, self.max_message_bytes)
    }
}
