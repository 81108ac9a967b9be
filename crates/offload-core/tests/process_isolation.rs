//! Integration tests for process isolation.
//!
//! Every test here forks real worker processes.

#![cfg(unix)]

use std::os::unix::process::ExitStatusExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use offload_core::{CellState, Error, FailureKind, Outcome, ProcessWorker, WorkerConfig};
use serde::{Deserialize, Serialize, Serializer};

const LONG: Option<Duration> = Some(Duration::from_secs(10));

static TOUCHED: AtomicUsize = AtomicUsize::new(0);

/// Deserializes fine, never serializes.
#[derive(Debug, Deserialize)]
struct Unserializable;

impl Serialize for Unserializable {
    fn serialize<S: Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
        Err(serde::ser::Error::custom("refuses to serialize"))
    }
}

#[test]
fn test_success_roundtrip() {
    let mut worker = ProcessWorker::new(|(a, b): (i64, String)| {
        Ok::<_, String>(format!("{}-{}", b, a * 2))
    });
    worker.invoke((21, "answer".to_string())).unwrap();
    assert!(worker.pid().is_some());

    assert!(worker.join(LONG).unwrap());
    assert!(worker.has_responded());
    assert!(!worker.has_erred().unwrap());
    assert_eq!(
        worker.response().unwrap(),
        &Outcome::Success("answer-42".to_string())
    );
    assert_eq!(worker.exit_status().unwrap().code(), Some(0));
}

#[test]
fn test_raised_error_is_captured() {
    let mut worker = ProcessWorker::new(|_: ()| Err::<i32, _>("x".to_string()));
    worker.invoke(()).unwrap();
    assert!(worker.join(LONG).unwrap());

    assert!(worker.has_erred().unwrap());
    let failure = worker.response().unwrap().failure().unwrap();
    assert_eq!(failure.kind, FailureKind::Error);
    assert_eq!(failure.message, "x");
}

#[test]
fn test_panic_is_captured() {
    let mut worker = ProcessWorker::new(|n: u32| -> Result<u32, String> {
        if n > 0 {
            panic!("panicked with {}", n);
        }
        Ok(n)
    });
    worker.invoke(3).unwrap();
    assert!(worker.join(LONG).unwrap());

    let failure = worker.response().unwrap().failure().unwrap().clone();
    assert_eq!(failure.kind, FailureKind::Panic);
    assert_eq!(failure.message, "panicked with 3");
}

#[test]
fn test_queries_before_completion() {
    let mut worker = ProcessWorker::new(|_: ()| {
        thread::sleep(Duration::from_millis(300));
        Ok::<_, String>(1u8)
    });
    assert!(!worker.has_responded());
    assert_eq!(worker.state(), CellState::Unstarted);

    worker.invoke(()).unwrap();
    assert_eq!(worker.state(), CellState::Running);
    assert!(!worker.has_responded());
    assert!(matches!(worker.response(), Err(Error::NoResponse { .. })));
    assert!(matches!(worker.has_erred(), Err(Error::NoResponse { .. })));

    assert!(worker.join(LONG).unwrap());
    assert_eq!(worker.state(), CellState::Completed);
}

#[test]
fn test_repeated_queries_are_identical() {
    let mut worker = ProcessWorker::new(|v: Vec<u16>| Ok::<_, String>(v.iter().sum::<u16>()));
    worker.invoke(vec![1, 2, 3]).unwrap();
    worker.join(LONG).unwrap();

    let first = worker.response().unwrap().clone();
    for _ in 0..5 {
        assert_eq!(worker.response().unwrap(), &first);
        assert!(!worker.has_erred().unwrap());
        assert!(worker.has_responded());
    }
    assert_eq!(first, Outcome::Success(6));
}

#[test]
fn test_update_is_non_blocking() {
    let mut worker = ProcessWorker::new(|_: ()| {
        thread::sleep(Duration::from_secs(5));
        Ok::<_, String>(())
    });
    worker.invoke(()).unwrap();

    let start = Instant::now();
    for _ in 0..100 {
        worker.update().unwrap();
    }
    assert!(start.elapsed() < Duration::from_secs(2));
    assert!(!worker.has_responded());
    worker.kill().unwrap();
}

#[test]
fn test_join_timeout_leaves_worker_running() {
    let mut worker = ProcessWorker::new(|_: ()| {
        thread::sleep(Duration::from_secs(10));
        Ok::<_, String>(())
    });
    worker.invoke(()).unwrap();

    let start = Instant::now();
    assert!(!worker.join(Some(Duration::from_millis(100))).unwrap());
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert!(worker.is_alive());

    worker.kill().unwrap();
    assert!(!worker.is_alive());
}

#[test]
fn test_kill_prevents_any_response() {
    let mut worker = ProcessWorker::new(|_: ()| {
        thread::sleep(Duration::from_millis(500));
        Ok::<_, String>(99)
    });
    worker.invoke(()).unwrap();
    worker.kill().unwrap();

    assert!(worker.join(LONG).unwrap());
    assert_eq!(worker.exit_status().unwrap().signal(), Some(libc::SIGKILL));

    // Well past the point where the callable would have finished.
    thread::sleep(Duration::from_millis(700));
    for _ in 0..3 {
        assert!(!worker.has_responded());
        assert!(matches!(worker.response(), Err(Error::NoResponse { .. })));
    }
    assert_eq!(worker.state(), CellState::Running);
}

#[test]
fn test_kill_handle_from_another_thread() {
    let mut worker = ProcessWorker::new(|_: ()| -> Result<(), String> {
        loop {
            thread::sleep(Duration::from_millis(50));
        }
    });
    worker.invoke(()).unwrap();
    let handle = worker.kill_handle().unwrap();

    let start = Instant::now();
    let killer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        handle.kill();
        handle.is_killed()
    });

    assert!(worker.join(LONG).unwrap());
    assert!(killer.join().unwrap());
    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(!worker.has_responded());
}

#[test]
fn test_suspend_resume_preserves_outcome() {
    let mut worker = ProcessWorker::new(|n: u64| {
        thread::sleep(Duration::from_millis(200));
        Ok::<_, String>((1..=n).product::<u64>())
    });
    worker.invoke(10).unwrap();
    worker.suspend().unwrap();

    thread::sleep(Duration::from_millis(400));
    assert!(!worker.has_responded());
    assert!(worker.is_alive());

    worker.resume().unwrap();
    assert!(worker.join(LONG).unwrap());
    assert_eq!(worker.response().unwrap(), &Outcome::Success(3_628_800));
}

#[test]
fn test_queries_stay_non_blocking_while_reply_is_half_written() {
    let mut worker = ProcessWorker::new(|len: usize| Ok::<_, String>(vec![1u8; len]));
    worker.invoke(1024 * 1024).unwrap();

    // The reply no longer fits in the pipe; stop the child mid-write.
    thread::sleep(Duration::from_millis(300));
    worker.suspend().unwrap();

    let (tx, rx) = mpsc::channel();
    let querier = thread::spawn(move || {
        let responded = worker.has_responded();
        tx.send(responded).unwrap();
        worker
    });
    let responded = rx
        .recv_timeout(Duration::from_secs(3))
        .expect("has_responded blocked on a stopped worker");
    assert!(!responded);

    let mut worker = querier.join().unwrap();
    worker.resume().unwrap();
    assert!(worker.join(LONG).unwrap());
    match worker.response().unwrap() {
        Outcome::Success(bytes) => assert_eq!(bytes.len(), 1024 * 1024),
        Outcome::Failure(f) => panic!("unexpected failure: {}", f),
    }
}

#[test]
fn test_join_with_unbounded_timeout() {
    let mut worker = ProcessWorker::new(|x: u8| Ok::<_, String>(x));
    worker.invoke(5).unwrap();
    assert!(worker.join(Some(Duration::MAX)).unwrap());
    assert_eq!(worker.response().unwrap(), &Outcome::Success(5));
}

#[test]
fn test_child_memory_is_isolated() {
    let mut worker = ProcessWorker::new(|_: ()| {
        Ok::<_, String>(TOUCHED.fetch_add(1, Ordering::SeqCst) + 1)
    });
    worker.invoke(()).unwrap();
    worker.join(LONG).unwrap();

    assert_eq!(worker.response().unwrap(), &Outcome::Success(1));
    assert_eq!(TOUCHED.load(Ordering::SeqCst), 0);
}

#[test]
fn test_filesystem_effects_are_shared() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("marker.txt");

    let mut worker = ProcessWorker::new(|path: std::path::PathBuf| -> Result<u32, String> {
        std::fs::write(&path, "written by worker").map_err(|e| e.to_string())?;
        Ok(std::process::id())
    });
    worker.invoke(path.clone()).unwrap();
    worker.join(LONG).unwrap();

    let child_pid = *worker.response().unwrap().success().unwrap();
    assert_ne!(child_pid, std::process::id());
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "written by worker");
}

#[test]
fn test_failure_envelope_serializes_to_json() {
    let mut worker = ProcessWorker::new(|_: ()| Err::<(), _>("disk full".to_string()));
    worker.invoke(()).unwrap();
    worker.join(LONG).unwrap();

    let json = serde_json::to_value(worker.response().unwrap()).unwrap();
    assert_eq!(json["failure"]["kind"], "error");
    assert_eq!(json["failure"]["message"], "disk full");
}

#[test]
fn test_large_payload_drained_during_join() {
    let mut worker = ProcessWorker::new(|len: usize| Ok::<_, String>(vec![0xABu8; len]));
    worker.invoke(4 * 1024 * 1024).unwrap();

    assert!(worker.join(LONG).unwrap());
    match worker.response().unwrap() {
        Outcome::Success(bytes) => {
            assert_eq!(bytes.len(), 4 * 1024 * 1024);
            assert!(bytes.iter().all(|&b| b == 0xAB));
        }
        Outcome::Failure(f) => panic!("unexpected failure: {}", f),
    }
}

#[test]
fn test_unserializable_return_value_is_a_failure() {
    let mut worker = ProcessWorker::new(|_: ()| Ok::<_, String>(Unserializable));
    worker.invoke(()).unwrap();
    worker.join(LONG).unwrap();

    assert!(worker.has_erred().unwrap());
    let failure = worker.response().unwrap().failure().unwrap();
    assert_eq!(failure.kind, FailureKind::Serialization);
    assert!(failure.message.contains("refuses to serialize"));
}

#[test]
fn test_unserializable_arguments_rejected_at_invoke() {
    let mut worker = ProcessWorker::new(|_: Unserializable| Ok::<_, String>(()));
    let result = worker.invoke(Unserializable);
    assert!(matches!(result, Err(Error::Serialization(msg)) if msg.contains("refuses")));
    assert!(worker.pid().is_none());
    assert_eq!(worker.state(), CellState::Unstarted);
}

#[test]
fn test_oversized_reply_is_a_failure() {
    let config = WorkerConfig::default().max_message_bytes(1024);
    let mut worker =
        ProcessWorker::with_config(|_: ()| Ok::<_, String>(vec![1u8; 64 * 1024]), config);
    worker.invoke(()).unwrap();

    let result = worker.join(LONG);
    assert!(matches!(result, Err(Error::Ipc(msg)) if msg.contains("too large")));
    assert!(!worker.has_responded());
}

#[test]
fn test_invoke_is_one_shot() {
    let mut worker = ProcessWorker::new(|x: i32| Ok::<_, String>(x));
    worker.invoke(1).unwrap();
    assert!(matches!(worker.invoke(2), Err(Error::Submission(_))));
    worker.join(LONG).unwrap();
    assert_eq!(worker.response().unwrap(), &Outcome::Success(1));
}

#[test]
fn test_control_before_invoke() {
    let mut worker = ProcessWorker::new(|x: i32| Ok::<_, String>(x));
    assert!(matches!(worker.join(None), Err(Error::NotInvoked)));
    assert!(matches!(worker.suspend(), Err(Error::NotInvoked)));
    assert!(matches!(worker.kill(), Err(Error::NotInvoked)));
    assert!(worker.kill_handle().is_none());
    assert!(!worker.is_alive());
}

#[test]
fn test_drop_kills_running_child() {
    let mut worker = ProcessWorker::new(|_: ()| {
        thread::sleep(Duration::from_secs(30));
        Ok::<_, String>(())
    });
    worker.invoke(()).unwrap();
    let pid = worker.pid().unwrap() as libc::pid_t;

    let start = Instant::now();
    drop(worker);
    assert!(start.elapsed() < Duration::from_secs(5));

    // SAFETY: signal 0 delivers nothing and only checks that the pid exists.
    let rc = unsafe { libc::kill(pid, 0) };
    assert_eq!(rc, -1);
}
