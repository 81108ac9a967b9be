//! Built-in workloads the CLI can offload.

use std::fmt;
use std::thread;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Workload {
    /// Return the square of the input value
    Square,
    /// Return the input value unchanged (after the delay)
    Sleep,
    /// Return an error mentioning the input value
    Fail,
    /// Panic with a message mentioning the input value
    Panic,
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Square => "square",
            Self::Sleep => "sleep",
            Self::Fail => "fail",
            Self::Panic => "panic",
        })
    }
}

/// Argument every workload receives; crosses the process boundary as-is.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Input {
    pub value: u64,
    pub delay_ms: u64,
}

impl Workload {
    /// Sleep for `delay_ms`, then do the work.
    pub fn run(self, input: Input) -> Result<u64, String> {
        if input.delay_ms > 0 {
            thread::sleep(Duration::from_millis(input.delay_ms));
        }
        match self {
            Self::Square => input
                .value
                .checked_mul(input.value)
                .ok_or_else(|| format!("square of {} overflows u64", input.value)),
            Self::Sleep => Ok(input.value),
            Self::Fail => Err(format!("workload failed for value {}", input.value)),
            Self::Panic => panic!("workload panicked for value {}", input.value),
        }
    }

    /// The workload as a callable for a worker.
    pub fn task(self) -> impl FnOnce(Input) -> Result<u64, String> + Send + 'static {
        move |input| self.run(input)
    }
}
