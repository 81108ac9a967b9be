//! Run commands for the offload CLI.
//!
//! Each command offloads built-in workloads to one backend, waits for them
//! and collects their outcomes into a [`Report`].

use std::time::{Duration, Instant};

use offload_core::{ProcessGroup, ProcessWorker, ThreadWorker, WorkerConfig};

use crate::report::{MemberReport, Report};
use crate::workload::{Input, Workload};

/// Run one workload on a worker thread.
///
/// A thread cannot be interrupted, so on timeout the report shows no
/// response and the thread is left to finish on its own.
pub fn thread(
    workload: Workload,
    input: Input,
    timeout: Option<Duration>,
) -> anyhow::Result<Report> {
    let start = Instant::now();
    let mut worker = ThreadWorker::new(workload.task()).capture_failures(true);
    worker.invoke(input)?;

    if !worker.join(timeout)? {
        tracing::warn!("Thread worker {} did not finish in time", worker.id());
    }

    let mut report = Report::new("thread", worker.id(), start.elapsed());
    report.members.push(MemberReport {
        index: 0,
        workload,
        pid: None,
        state: worker.state(),
        outcome: worker.response().ok().cloned(),
    });
    Ok(report)
}

/// Run one workload in an isolated worker process. Killed on timeout.
pub fn process(
    workload: Workload,
    input: Input,
    timeout: Option<Duration>,
) -> anyhow::Result<Report> {
    let start = Instant::now();
    let mut worker = ProcessWorker::with_config(workload.task(), WorkerConfig::from_env());
    worker.invoke(input)?;

    if !worker.join(timeout)? {
        tracing::warn!("Worker process {:?} timed out, killing", worker.pid());
        worker.kill()?;
    }

    let mut report = Report::new("process", worker.id(), start.elapsed());
    report.members.push(MemberReport {
        index: 0,
        workload,
        pid: worker.pid(),
        state: worker.state(),
        outcome: worker.response().ok().cloned(),
    });
    Ok(report)
}

/// Run every workload as one member of a process group. All members are
/// killed on timeout.
pub fn group(
    workloads: &[Workload],
    input: Input,
    timeout: Option<Duration>,
) -> anyhow::Result<Report> {
    let start = Instant::now();
    let mut group = ProcessGroup::with_config(WorkerConfig::from_env());
    for workload in workloads {
        group.push(workload.task())?;
    }
    group.invoke(input)?;

    let finished = match timeout {
        Some(timeout) => group.join_timeout(timeout)?,
        None => {
            group.join()?;
            true
        }
    };
    if !finished {
        tracing::warn!("Process group {} timed out, killing all members", group.id());
        group.kill()?;
    }

    let mut report = Report::new("group", group.id(), start.elapsed());
    let pids = group.pids();
    for (index, &workload) in workloads.iter().enumerate() {
        report.members.push(MemberReport {
            index,
            workload,
            pid: pids.get(index).copied().flatten(),
            state: group.state(index)?,
            outcome: group.response(index).ok().cloned(),
        });
    }
    Ok(report)
}
