//! Worker process management.
//!
//! [`Worker`] is the parent's view of one forked worker: the process plus
//! the parent end of its channel. [`serve`] is what runs inside the fork.

use std::marker::PhantomData;
use std::os::fd::RawFd;
use std::process::ExitStatus;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::outcome::{Outcome, WorkerFailure};
use crate::task::{BoxedTask, run_captured};

use super::channel::{ChildChannel, ParentChannel, Received};
use super::process::{ChildProcess, KillHandle, fork_worker};
use super::protocol::{ChildMessage, ParentMessage};

/// Exit code of a worker that lost its channel to the parent.
const EXIT_CHANNEL_LOST: i32 = 2;

/// Worker-side loop: optionally announce readiness, block on the start
/// token, run the task and send back exactly one outcome.
fn serve<A, T>(mut channel: ChildChannel, task: BoxedTask<A, T>, handshake: bool) -> i32
where
    A: DeserializeOwned,
    T: Serialize,
{
    if handshake && channel.send(&ChildMessage::Ready).is_err() {
        return EXIT_CHANNEL_LOST;
    }

    // Blocking read: the worker sleeps here until the start token arrives.
    let args = match channel.recv() {
        Ok(Some(ParentMessage::Start { args })) => args,
        _ => return EXIT_CHANNEL_LOST,
    };

    let reply = match bincode::deserialize::<A>(&args) {
        Ok(args) => match run_captured(task, args) {
            Outcome::Success(value) => match bincode::serialize(&value) {
                Ok(payload) => ChildMessage::Success { payload },
                Err(e) => ChildMessage::Failure(WorkerFailure::serialization(format!(
                    "failed to encode return value: {}",
                    e
                ))),
            },
            Outcome::Failure(failure) => ChildMessage::Failure(failure),
        },
        Err(e) => ChildMessage::Failure(WorkerFailure::serialization(format!(
            "failed to decode arguments: {}",
            e
        ))),
    };

    match channel.send(&reply) {
        Ok(()) => 0,
        Err(_) => EXIT_CHANNEL_LOST,
    }
}

/// Parent-side handle to one forked worker.
pub(crate) struct Worker<T> {
    process: ChildProcess,
    /// `None` once the outcome was received, the channel closed, or the worker was killed.
    channel: Option<ParentChannel>,
    _output: PhantomData<fn() -> T>,
}

impl<T> Worker<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Fork a worker for `task`.
    ///
    /// With `handshake`, the worker sends `Ready` before blocking on the start
    /// token, and the parent must call [`Worker::wait_ready`] before
    /// [`Worker::start`].
    pub fn spawn<A>(
        config: &WorkerConfig,
        task: BoxedTask<A, T>,
        handshake: bool,
        inherited: &[RawFd],
    ) -> Result<Self>
    where
        A: DeserializeOwned,
    {
        let (process, channel) =
            fork_worker(config, inherited, move |channel| serve(channel, task, handshake))?;
        tracing::debug!("Spawned worker process {}", process.pid());

        Ok(Self {
            process,
            channel: Some(channel),
            _output: PhantomData,
        })
    }

    fn channel(&mut self) -> Result<&mut ParentChannel> {
        self.channel
            .as_mut()
            .ok_or_else(|| Error::Ipc(format!("Worker {} channel is closed", self.process.pid())))
    }

    /// Block until the worker is parked on the start barrier.
    pub fn wait_ready(&mut self) -> Result<()> {
        let pid = self.process.pid();
        match self.channel()?.recv()? {
            Some(ChildMessage::Ready) => Ok(()),
            Some(other) => Err(Error::Ipc(format!(
                "Unexpected message from worker {} before start: {:?}",
                pid, other
            ))),
            None => Err(Error::Ipc(format!(
                "Worker {} exited before reaching the start barrier",
                pid
            ))),
        }
    }

    /// Send the start token carrying the encoded arguments.
    pub fn start(&mut self, args: &[u8]) -> Result<()> {
        self.channel()?.send(&ParentMessage::Start {
            args: args.to_vec(),
        })
    }

    /// Non-blocking check for the worker's outcome.
    ///
    /// Returns the outcome at most once. A killed worker never yields one,
    /// even if it finished writing before the kill landed.
    pub fn poll(&mut self) -> Result<Option<Outcome<T>>> {
        if self.process.was_killed() {
            self.channel = None;
            return Ok(None);
        }
        let pid = self.process.pid();
        let Some(channel) = self.channel.as_mut() else {
            return Ok(None);
        };

        loop {
            let outcome = match channel.try_recv() {
                Ok(Received::Pending) => return Ok(None),
                Ok(Received::Message(ChildMessage::Ready)) => continue,
                Ok(Received::Message(ChildMessage::Success { payload })) => {
                    match bincode::deserialize::<T>(&payload) {
                        Ok(value) => Outcome::Success(value),
                        Err(e) => Outcome::Failure(WorkerFailure::serialization(format!(
                            "failed to decode return value: {}",
                            e
                        ))),
                    }
                }
                Ok(Received::Message(ChildMessage::Failure(failure))) => Outcome::Failure(failure),
                Ok(Received::Closed) => {
                    tracing::warn!("Worker {} closed its channel without a response", pid);
                    self.channel = None;
                    return Ok(None);
                }
                Err(Error::Serialization(message)) => {
                    tracing::warn!("Undecodable response from worker {}: {}", pid, message);
                    Outcome::Failure(WorkerFailure::serialization(message))
                }
                Err(e) => {
                    self.channel = None;
                    return Err(e);
                }
            };
            self.channel = None;
            return Ok(Some(outcome));
        }
    }

    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    pub fn raw_fds(&self) -> Vec<RawFd> {
        self.channel
            .as_ref()
            .map(|channel| channel.raw_fds().to_vec())
            .unwrap_or_default()
    }

    pub fn is_alive(&mut self) -> Result<bool> {
        self.process.is_alive()
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.process.exit_status()
    }

    pub fn suspend(&mut self) -> Result<()> {
        self.process.suspend()
    }

    pub fn resume(&mut self) -> Result<()> {
        self.process.resume()
    }

    /// Kill immediately and discard the channel. Terminal.
    pub fn kill(&mut self) -> Result<()> {
        self.channel = None;
        self.process.kill()
    }

    pub fn kill_handle(&self) -> KillHandle {
        self.process.kill_handle()
    }
}
