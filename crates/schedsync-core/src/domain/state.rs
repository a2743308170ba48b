//! Task state machine for a batch.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Task status.
///
/// State transitions:
/// - Pending -> Processing (claim)
/// - Processing -> Completed / Failed
/// - Processing -> Pending (stale claim recovery)
/// - Failed -> Pending (manual reset)
///
/// Persisted as lowercase strings (`"pending"`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting to be claimed.
    Pending,

    /// Claimed by one invocation.
    Processing,

    /// Scraped and persisted (possibly with zero lessons).
    Completed,

    /// Terminal for this run; can be reset to Pending by an operator.
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    /// Is this a terminal state for the current run?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Is this task eligible for claim?
    pub fn is_claimable(self) -> bool {
        matches!(self, TaskStatus::Pending)
    }

    /// Exhaustive transition table.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Processing) => true,
            (Processing, Completed) | (Processing, Failed) | (Processing, Pending) => true,
            (Failed, Pending) => true,
            (Pending, _) | (Processing, _) | (Completed, _) | (Failed, _) => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for TaskStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::claim(TaskStatus::Pending, TaskStatus::Processing, true)]
    #[case::complete(TaskStatus::Processing, TaskStatus::Completed, true)]
    #[case::fail(TaskStatus::Processing, TaskStatus::Failed, true)]
    #[case::stale_reset(TaskStatus::Processing, TaskStatus::Pending, true)]
    #[case::manual_reset(TaskStatus::Failed, TaskStatus::Pending, true)]
    #[case::skip_processing(TaskStatus::Pending, TaskStatus::Completed, false)]
    #[case::reopen_completed(TaskStatus::Completed, TaskStatus::Pending, false)]
    #[case::completed_to_failed(TaskStatus::Completed, TaskStatus::Failed, false)]
    #[case::reclaim_failed(TaskStatus::Failed, TaskStatus::Processing, false)]
    fn transition_table(#[case] from: TaskStatus, #[case] to: TaskStatus, #[case] ok: bool) {
        assert_eq!(from.can_transition_to(to), ok);
    }

    #[test]
    fn status_strings_roundtrip() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
        assert!("done".parse::<TaskStatus>().is_err());
    }
}
