//! Batch record and status aggregation.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::ids::BatchId;
use super::state::TaskStatus;
use super::task::TaskRecord;

/// One refresh cycle. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub batch_id: BatchId,
    pub created_at: DateTime<Utc>,

    /// First target date (site-local "today" at creation time).
    pub start_date: NaiveDate,
    pub horizon_days: u32,
    pub total_tasks: u32,

    /// Expiry as unix seconds.
    pub ttl: i64,
}

/// Batch state (aggregated from tasks).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    /// At least one task is pending or processing.
    Running,

    /// Every task completed.
    Completed,

    /// No task is runnable and at least one failed.
    CompletedWithFailures,
}

/// Aggregate counts for one batch.
///
/// `total == pending + processing + completed + failed` always holds because
/// the counts are built from a single scan and `total` is derived.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchStatusSummary {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub progress_percent: f64,
}

impl BatchStatusSummary {
    pub fn from_statuses(statuses: impl IntoIterator<Item = TaskStatus>) -> Self {
        let mut summary = Self::default();
        for status in statuses {
            summary.add(status);
        }
        summary.finish()
    }

    pub fn from_counts(pending: usize, processing: usize, completed: usize, failed: usize) -> Self {
        Self {
            pending,
            processing,
            completed,
            failed,
            ..Self::default()
        }
        .finish()
    }

    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a TaskRecord>) -> Self {
        Self::from_statuses(tasks.into_iter().map(|t| t.status))
    }

    fn add(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Processing => self.processing += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
        }
    }

    fn finish(mut self) -> Self {
        self.total = self.pending + self.processing + self.completed + self.failed;
        self.progress_percent = if self.total == 0 {
            100.0
        } else {
            let done = (self.completed + self.failed) as f64;
            (done / self.total as f64 * 1000.0).round() / 10.0
        };
        self
    }

    /// Work left for some invocation (pending or still claimed).
    pub fn has_remaining(&self) -> bool {
        self.pending > 0 || self.processing > 0
    }

    pub fn state(&self) -> BatchState {
        if self.has_remaining() {
            BatchState::Running
        } else if self.failed > 0 {
            BatchState::CompletedWithFailures
        } else {
            BatchState::Completed
        }
    }
}
