//! Uniform representation of caller-supplied callables.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use crate::outcome::{Outcome, WorkerFailure};

/// A callable with its error type erased into a [`WorkerFailure`].
pub(crate) type BoxedTask<A, T> = Box<dyn FnOnce(A) -> Result<T, WorkerFailure> + Send + 'static>;

/// Box a callable, converting its error into a failure envelope at the failure site.
pub(crate) fn boxed<F, A, T, E>(f: F) -> BoxedTask<A, T>
where
    F: FnOnce(A) -> Result<T, E> + Send + 'static,
    E: fmt::Display,
{
    Box::new(move |args| f(args).map_err(|e| WorkerFailure::from_error(&e)))
}

/// Run a task, turning both a returned error and a panic into `Outcome::Failure`.
pub(crate) fn run_captured<A, T>(task: BoxedTask<A, T>, args: A) -> Outcome<T> {
    match panic::catch_unwind(AssertUnwindSafe(move || task(args))) {
        Ok(result) => result.into(),
        Err(payload) => Outcome::Failure(WorkerFailure::from_panic(payload.as_ref())),
    }
}
