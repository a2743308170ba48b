//! Status - バッチの進捗レポート（CLI の batch-status が出すもの）

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{BatchId, BatchRecord, BatchState, BatchStatusSummary, LocationCode, TaskRecord};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedTask {
    pub location_code: LocationCode,
    pub date: NaiveDate,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<TaskRecord> for FailedTask {
    fn from(task: TaskRecord) -> Self {
        Self {
            location_code: task.key.location,
            date: task.key.date,
            error_message: task.error_message,
            updated_at: task.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStatusReport {
    pub batch_id: BatchId,
    pub created_at: DateTime<Utc>,
    pub start_date: NaiveDate,
    pub horizon_days: u32,
    pub state: BatchState,
    pub summary: BatchStatusSummary,
    pub failed: Vec<FailedTask>,
}

impl BatchStatusReport {
    pub fn new(batch: BatchRecord, summary: BatchStatusSummary, failed: Vec<FailedTask>) -> Self {
        Self {
            batch_id: batch.batch_id,
            created_at: batch.created_at,
            start_date: batch.start_date,
            horizon_days: batch.horizon_days,
            state: summary.state(),
            summary,
            failed,
        }
    }

    /// Human readable multi-line rendering.
    pub fn render(&self) -> String {
        let s = &self.summary;
        let mut out = format!(
            "batch {} ({} days from {})\n\
             state: {:?}\n\
             progress: {:.1}% ({} / {})\n\
             pending={} processing={} completed={} failed={}\n",
            self.batch_id,
            self.horizon_days,
            self.start_date,
            self.state,
            s.progress_percent,
            s.completed + s.failed,
            s.total,
            s.pending,
            s.processing,
            s.completed,
            s.failed,
        );
        for f in &self.failed {
            out.push_str(&format!(
                "  failed {} {}: {}\n",
                f.location_code,
                f.date,
                f.error_message.as_deref().unwrap_or("-")
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskKey, TaskStatus};
    use chrono::TimeZone;
    use ulid::Ulid;

    #[test]
    fn report_renders_failures_and_serializes() {
        let now = Utc.with_ymd_and_hms(2026, 10, 18, 0, 0, 0).unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        let batch = BatchRecord {
            batch_id: BatchId::from_ulid(Ulid::new()),
            created_at: now,
            start_date: date,
            horizon_days: 7,
            total_tasks: 2,
            ttl: 0,
        };
        let mut task = TaskRecord::new_pending(
            batch.batch_id,
            TaskKey::new(LocationCode::new("ginza"), date),
            now,
            0,
        );
        task.claim(now).unwrap();
        task.fail("navigate timed out after 30000ms".to_string(), now).unwrap();

        let summary = BatchStatusSummary::from_statuses([TaskStatus::Completed, TaskStatus::Failed]);
        let report = BatchStatusReport::new(batch, summary, vec![FailedTask::from(task)]);

        assert_eq!(report.state, BatchState::CompletedWithFailures);
        let text = report.render();
        assert!(text.contains("progress: 100.0% (2 / 2)"), "{text}");
        assert!(text.contains("failed ginza 2026-10-18: navigate timed out"), "{text}");

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["state"], "completed_with_failures");
        assert_eq!(json["summary"]["failed"], 1);
        assert_eq!(json["failed"][0]["location_code"], "ginza");
    }
}
