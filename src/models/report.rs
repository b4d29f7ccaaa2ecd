//! Represents the outcome of one invocation of the job.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// A file that was attempted and recorded as failed.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct FailedFile {
    pub name: String,

    /// `TransferError::kind()` of the failure.
    pub kind: String,

    /// Rendered error message.
    pub error: String,

    pub retryable: bool,
}

/// Summary of a run, logged at the end and optionally printed as JSON.
#[derive(Serialize, Clone, Debug)]
pub struct RunReport {
    /// Correlates log lines of the same run.
    pub run_id: Uuid,

    pub started_at: DateTime<Utc>,

    pub finished_at: Option<DateTime<Utc>>,

    /// Number of candidates returned by the lister.
    pub listed: usize,

    /// Candidates skipped because an earlier run already handled them.
    pub skipped: Vec<String>,

    /// Names recorded as posted during this run.
    pub posted: Vec<String>,

    /// Names recorded as failed during this run.
    pub failed: Vec<FailedFile>,

    /// Listed names the state records cannot hold. Never transferred.
    pub invalid: Vec<String>,

    /// Candidates neither attempted nor recorded because the batch aborted.
    pub unattempted: Vec<String>,

    /// True when a failure stopped the remaining batch.
    pub aborted: bool,
}

impl RunReport {
    pub fn start() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            listed: 0,
            skipped: Vec::new(),
            posted: Vec::new(),
            failed: Vec::new(),
            invalid: Vec::new(),
            unattempted: Vec::new(),
            aborted: false,
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Process exit status for this report.
    ///
    /// `2` when the batch aborted, `3` when files failed in isolation or
    /// were skipped as unrecordable, `0` otherwise. `1` is reserved for fatal errors outside the report.
    pub fn exit_code(&self) -> u8 {
        if self.aborted {
            2
        } else if !self.failed.is_empty() || !self.invalid.is_empty() {
            3
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(name: &str) -> FailedFile {
        FailedFile {
            name: name.into(),
            kind: "transport".into(),
            error: "broken pipe".into(),
            retryable: true,
        }
    }

    #[test]
    fn clean_run_exits_zero() {
        let mut report = RunReport::start();
        report.posted.push("a.csv".into());
        report.skipped.push("b.csv".into());
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn aborted_run_takes_precedence_over_failures() {
        let mut report = RunReport::start();
        report.failed.push(failed("a.csv"));
        assert_eq!(report.exit_code(), 3);

        report.aborted = true;
        assert_eq!(report.exit_code(), 2);
    }

    #[test]
    fn invalid_names_are_not_a_clean_run() {
        let mut report = RunReport::start();
        report.posted.push("a.csv".into());
        report.invalid.push("   ".into());
        assert_eq!(report.exit_code(), 3);
    }

    #[test]
    fn serializes_with_timestamps() {
        let mut report = RunReport::start();
        report.finish();
        let json = serde_json::to_value(&report).unwrap();
        assert!(json["finished_at"].is_string());
        assert_eq!(json["aborted"], false);
    }
}
