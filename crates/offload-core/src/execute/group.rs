//! Fan-out/fan-in over N callables in N worker processes with a synchronized start.

use std::fmt;
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

/// One callable of the group and everything it owns.
struct Member<A, T> {
    task: Option<BoxedTask<A, T>>,
    worker: Option<Worker<T>>,
    cell: ResultCell<T>,
}

impl<A, T> Member<A, T>
where
    T: Serialize + DeserializeOwned,
{
    /// Non-blocking outcome check for a single member.
    fn refresh(&mut self) -> Result<()> {
        if self.cell.has_responded() {
            return Ok(());
        }
        let Some(worker) = self.worker.as_mut() else {
            return Ok(());
        };
        if let Some(outcome) = worker.poll()? {
            self.cell.complete(outcome)?;
        }
        Ok(())
    }
}

/// Runs N callables as N isolated child processes started together.
///
/// Members are indexed in submission order; the index set is fixed once the
/// group is invoked. Every child blocks on a start token that the parent
/// sends only after all children exist and have reported ready, so no member
/// begins its callable before every sibling has been launched.
///
/// Members complete independently and in any order; indexed results always
/// come back in submission order.
pub struct ProcessGroup<A, T> {
    id: Uuid,
    config: WorkerConfig,
    members: Vec<Member<A, T>>,
    launched: bool,
}

impl<A, T> Default for ProcessGroup<A, T>
where
    A: Serialize + DeserializeOwned + 'static,
    T: Serialize + DeserializeOwned + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<A, T> ProcessGroup<A, T>
where
    A: Serialize + DeserializeOwned + 'static,
    T: Serialize + DeserializeOwned + 'static,
{
    pub fn new() -> Self {
        Self::with_config(WorkerConfig::default())
    }

    pub fn with_config(config: WorkerConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            members: Vec::new(),
            launched: false,
        }
    }

    /// Build a group from callables of one type.
    pub fn from_tasks<I, F, E>(tasks: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: FnOnce(A) -> std::result::Result<T, E> + Send + 'static,
        E: fmt::Display,
    {
        let mut group = Self::new();
        group.members = tasks
            .into_iter()
            .map(|f| Member {
                task: Some(task::boxed(f)),
                worker: None,
                cell: ResultCell::new(),
            })
            .collect();
        group
    }

    /// Add a callable and return its member index.
    ///
    /// Fails with [`Error::Submission`] once the group has been invoked.
    pub fn push<F, E>(&mut self, f: F) -> Result<usize>
    where
        F: FnOnce(A) -> std::result::Result<T, E> + Send + 'static,
        E: fmt::Display,
    {
        if self.launched {
            return Err(Error::Submission(
                "cannot add a member to a process group after launch".to_string(),
            ));
        }
        self.members.push(Member {
            task: Some(task::boxed(f)),
            worker: None,
            cell: ResultCell::new(),
        });
        Ok(self.members.len() - 1)
    }

    /// Builder form of [`ProcessGroup::push`] for groups not yet invoked.
    pub fn with_task<F, E>(mut self, f: F) -> Self
    where
        F: FnOnce(A) -> std::result::Result<T, E> + Send + 'static,
        E: fmt::Display,
    {
        self.members.push(Member {
            task: Some(task::boxed(f)),
            worker: None,
            cell: ResultCell::new(),
        });
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Launch every member with the same arguments.
    ///
    /// Forks all children first, waits until each is parked on the start
    /// barrier, then sends the start token (carrying the arguments) to all.
    /// If any step fails, every member already forked is killed.
    pub fn invoke(&mut self, args: A) -> Result<()> {
        if self.launched {
            return Err(Error::Submission("process group already invoked".to_string()));
        }
        if self.members.is_empty() {
            return Err(Error::Submission("process group has no members".to_string()));
        }
        let args = bincode::serialize(&args)?;
        self.launched = true;

        if let Err(e) = self.launch(&args) {
            tracing::warn!(group = %self.id, "Launch failed, killing members: {}", e);
            for member in &mut self.members {
                if let Some(worker) = member.worker.as_mut() {
                    if let Err(kill_err) = worker.kill() {
                        tracing::warn!(
                            group = %self.id,
                            pid = worker.pid(),
                            "Failed to kill member during launch rollback: {}",
                            kill_err
                        );
                    }
                }
            }
            return Err(e);
        }
        Ok(())
    }

    fn launch(&mut self, args: &[u8]) -> Result<()> {
        let mut inherited = Vec::new();
        for member in &mut self.members {
            let Some(task) = member.task.take() else {
                return Err(Error::Submission("group member already launched".to_string()));
            };
            let worker = Worker::spawn(&self.config, task, true, &inherited)?;
            inherited.extend(worker.raw_fds());
            member.cell.await_barrier()?;
            member.worker = Some(worker);
        }

        for member in &mut self.members {
            if let Some(worker) = member.worker.as_mut() {
                worker.wait_ready()?;
            }
        }

        // Every member exists and is blocked on its channel: release them all.
        for member in &mut self.members {
            if let Some(worker) = member.worker.as_mut() {
                worker.start(args)?;
                member.cell.start()?;
            }
        }

        tracing::debug!(group = %self.id, members = self.members.len(), "Started process group");
        Ok(())
    }

    fn member(&self, index: usize) -> Result<&Member<A, T>> {
        self.members.get(index).ok_or(Error::IndexOutOfRange {
            index,
            len: self.members.len(),
        })
    }

    /// Non-blocking: record the outcome of every member that has responded.
    ///
    /// All members are checked even if one fails; the first error is returned.
    pub fn update(&mut self) -> Result<()> {
        let mut first_error = None;
        for (index, member) in self.members.iter_mut().enumerate() {
            let was_pending = !member.cell.has_responded();
            match member.refresh() {
                Ok(()) if was_pending && member.cell.has_responded() => {
                    tracing::debug!(group = %self.id, index, "Group member responded");
                }
                Ok(()) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Refresh for queries that cannot fail.
    fn refresh(&mut self) {
        if let Err(e) = self.update() {
            tracing::warn!(group = %self.id, "Failed to refresh group state: {}", e);
        }
    }

    fn wait(&mut self, deadline: Option<Instant>) -> Result<bool> {
        if !self.launched {
            return Err(Error::NotInvoked);
        }
        let interval = self.config.poll_interval;
        poll_until(deadline, interval, || {
            self.update()?;
            let mut all_exited = true;
            for member in &mut self.members {
                if let Some(worker) = member.worker.as_mut() {
                    if worker.is_alive()? {
                        all_exited = false;
                    }
                }
            }
            if all_exited {
                self.update()?;
            }
            Ok(all_exited)
        })
    }

    /// Block until every child process has exited. No bound; race it against
    /// your own timer or use [`ProcessGroup::join_timeout`] for a deadline.
    pub fn join(&mut self) -> Result<()> {
        self.wait(None).map(|_| ())
    }

    /// Block until every child exits or `timeout` elapses. Returns whether all exited.
    ///
    /// A timeout too large to represent waits without bound.
    pub fn join_timeout(&mut self, timeout: Duration) -> Result<bool> {
        self.wait(Instant::now().checked_add(timeout))
    }

    fn for_each_worker(
        &mut self,
        action: &str,
        mut f: impl FnMut(&mut Worker<T>) -> Result<()>,
    ) -> Result<()> {
        if !self.launched {
            return Err(Error::NotInvoked);
        }
        tracing::debug!(group = %self.id, "Applying {} to every member", action);
        let mut first_error = None;
        for member in &mut self.members {
            if let Some(worker) = member.worker.as_mut() {
                if let Err(e) = f(worker) {
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Stop every member process (SIGSTOP).
    pub fn suspend(&mut self) -> Result<()> {
        self.for_each_worker("suspend", Worker::suspend)
    }

    /// Continue every member process (SIGCONT).
    pub fn resume(&mut self) -> Result<()> {
        self.for_each_worker("resume", Worker::resume)
    }

    /// Kill every member process (SIGKILL). Terminal for members that have
    /// not yet responded.
    pub fn kill(&mut self) -> Result<()> {
        self.for_each_worker("kill", Worker::kill)
    }

    /// Handle that can kill every member from another thread.
    pub fn kill_handle(&self) -> Option<KillHandle> {
        if !self.launched {
            return None;
        }
        Some(KillHandle::merge(
            self.members
                .iter()
                .filter_map(|m| m.worker.as_ref().map(Worker::kill_handle)),
        ))
    }

    /// Process ids in member order, once launched.
    pub fn pids(&self) -> Vec<Option<u32>> {
        self.members
            .iter()
            .map(|m| m.worker.as_ref().map(Worker::pid))
            .collect()
    }

    pub fn state(&self, index: usize) -> Result<CellState> {
        self.member(index).map(|m| m.cell.state())
    }

    pub fn states(&self) -> Vec<CellState> {
        self.members.iter().map(|m| m.cell.state()).collect()
    }

    /// Outcome of one member, or [`Error::NoResponse`] until it has responded.
    pub fn response(&mut self, index: usize) -> Result<&Outcome<T>> {
        self.member(index)?;
        self.update()?;
        self.members[index]
            .cell
            .outcome()
            .map_err(|_| Error::NoResponse { index: Some(index) })
    }

    /// Every outcome in submission order. All-or-nothing: fails with
    /// [`Error::NoResponse`] unless every member has responded.
    pub fn responses(&mut self) -> Result<Vec<&Outcome<T>>> {
        self.update()?;
        self.members.iter().map(|m| m.cell.outcome()).collect()
    }

    pub fn has_erred(&mut self, index: usize) -> Result<bool> {
        self.response(index).map(Outcome::is_failure)
    }

    /// Per-member failure flags. All-or-nothing like [`ProcessGroup::responses`].
    pub fn erred_flags(&mut self) -> Result<Vec<bool>> {
        Ok(self
            .responses()?
            .into_iter()
            .map(Outcome::is_failure)
            .collect())
    }

    pub fn has_responded(&mut self, index: usize) -> Result<bool> {
        self.member(index)?;
        self.refresh();
        Ok(self.members[index].cell.has_responded())
    }

    /// Per-member response flags. Never fails.
    pub fn responded_flags(&mut self) -> Vec<bool> {
        self.refresh();
        self.members.iter().map(|m| m.cell.has_responded()).collect()
    }

    /// Whether any member has responded with a failure so far.
    pub fn has_any_erred(&mut self) -> bool {
        self.refresh();
        self.members
            .iter()
            .any(|m| m.cell.has_erred().unwrap_or(false))
    }

    /// Whether every member failed. Fails with [`Error::NoResponse`] unless
    /// every member has responded.
    pub fn has_all_erred(&mut self) -> Result<bool> {
        Ok(self.erred_flags()?.into_iter().all(|erred| erred))
    }

    pub fn has_any_responded(&mut self) -> bool {
        self.responded_flags().into_iter().any(|r| r)
    }

    /// Whether every member has responded. Once true, stays true.
    pub fn has_all_responded(&mut self) -> bool {
        self.responded_flags().into_iter().all(|r| r)
    }
}
