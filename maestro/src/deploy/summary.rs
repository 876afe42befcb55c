//! Fleet deployment summary

use std::fmt::Write;

use chrono::{DateTime, Utc};
use colored::Colorize;

use crate::errors::FailureReason;

/// Terminal outcome of one host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryEntry {
    pub address: String,
    pub failure: Option<FailureReason>,
}

impl SummaryEntry {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

/// Aggregate result of one run, in configuration order
#[derive(Debug, Clone)]
pub struct DeploymentSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, FailureReason)>,
    pub entries: Vec<SummaryEntry>,
}

impl DeploymentSummary {
    pub fn new(run_id: String, started_at: DateTime<Utc>, entries: Vec<SummaryEntry>) -> Self {
        let succeeded = entries
            .iter()
            .filter(|e| e.succeeded())
            .map(|e| e.address.clone())
            .collect();
        let failed = entries
            .iter()
            .filter_map(|e| e.failure.clone().map(|reason| (e.address.clone(), reason)))
            .collect();
        Self {
            run_id,
            started_at,
            finished_at: Utc::now(),
            total: entries.len(),
            succeeded,
            failed,
            entries,
        }
    }

    /// Every host succeeded
    pub fn is_success(&self) -> bool {
        self.total > 0 && self.failed.is_empty()
    }

    /// This summary with the entries of `rerun` replacing those of the same hosts
    ///
    /// Hosts `rerun` did not touch keep their last outcome and their position.
    pub fn merge(&self, rerun: &DeploymentSummary) -> DeploymentSummary {
        let mut entries: Vec<SummaryEntry> = self
            .entries
            .iter()
            .map(|entry| {
                rerun
                    .entries
                    .iter()
                    .find(|e| e.address == entry.address)
                    .unwrap_or(entry)
                    .clone()
            })
            .collect();
        entries.extend(
            rerun
                .entries
                .iter()
                .filter(|e| !self.entries.iter().any(|known| known.address == e.address))
                .cloned(),
        );

        let mut merged = DeploymentSummary::new(rerun.run_id.clone(), rerun.started_at, entries);
        merged.finished_at = rerun.finished_at;
        merged
    }

    pub fn was_cancelled(&self) -> bool {
        self.failed
            .iter()
            .any(|(_, reason)| matches!(reason, FailureReason::Cancelled))
    }

    /// Human readable report for the console
    pub fn render(&self) -> String {
        let elapsed = self.finished_at - self.started_at;
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} run {} finished in {:.1}s",
            "Deployment".bold(),
            self.run_id,
            elapsed.num_milliseconds() as f64 / 1000.0
        );

        let width = self
            .entries
            .iter()
            .map(|e| e.address.len())
            .max()
            .unwrap_or(0);
        for entry in &self.entries {
            match &entry.failure {
                None => {
                    let _ = writeln!(out, "  {:<width$}  {}", entry.address, "OK".green().bold());
                }
                Some(reason) => {
                    let _ = writeln!(
                        out,
                        "  {:<width$}  {} [{}] {}",
                        entry.address,
                        "FAILED".red().bold(),
                        reason.stage(),
                        reason
                    );
                }
            }
        }

        let totals = format!(
            "{} succeeded, {} failed, {} total",
            self.succeeded.len(),
            self.failed.len(),
            self.total
        );
        let _ = writeln!(
            out,
            "{}",
            if self.is_success() {
                totals.green()
            } else {
                totals.yellow()
            }
        );
        out
    }

    pub fn print(&self) {
        print!("{}", self.render());
    }
}
