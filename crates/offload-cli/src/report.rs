//! Rendering of workload outcomes.

use std::time::Duration;

use offload_core::{CellState, Outcome};
use serde::Serialize;

use crate::workload::Workload;

/// What one member (or the single worker) ended with.
#[derive(Debug, Serialize)]
pub struct MemberReport {
    pub index: usize,
    pub workload: Workload,
    pub pid: Option<u32>,
    pub state: CellState,
    /// `None` when no response was given (timed out or killed).
    pub outcome: Option<Outcome<u64>>,
}

/// Outcomes of one command run.
#[derive(Debug, Serialize)]
pub struct Report {
    pub backend: &'static str,
    pub id: String,
    pub elapsed_ms: u128,
    pub members: Vec<MemberReport>,
}

impl Report {
    pub fn new(backend: &'static str, id: impl ToString, elapsed: Duration) -> Self {
        Self {
            backend,
            id: id.to_string(),
            elapsed_ms: elapsed.as_millis(),
            members: Vec::new(),
        }
    }

    /// Members that failed or never responded.
    pub fn unsuccessful(&self) -> usize {
        self.members
            .iter()
            .filter(|m| !matches!(m.outcome, Some(Outcome::Success(_))))
            .count()
    }

    pub fn print(&self, json: bool) -> anyhow::Result<()> {
        if json {
            println!("{}", serde_json::to_string_pretty(self)?);
            return Ok(());
        }

        println!("{} {}", self.backend, self.id);
        println!("{}", "─".repeat(50));
        for member in &self.members {
            let pid = member
                .pid
                .map(|pid| format!("pid {}", pid))
                .unwrap_or_else(|| "-".to_string());
            let result = match &member.outcome {
                Some(Outcome::Success(value)) => format!("success  {}", value),
                Some(Outcome::Failure(failure)) => format!("failure  {}", failure),
                None => format!("no response ({:?})", member.state),
            };
            println!(
                "  [{}] {:<8} {:<10} {}",
                member.index, member.workload, pid, result
            );
        }
        println!("{}", "─".repeat(50));
        println!(
            "Completed {} of {} in {:.2}s",
            self.members.len() - self.unsuccessful(),
            self.members.len(),
            self.elapsed_ms as f64 / 1000.0
        );
        Ok(())
    }
}
