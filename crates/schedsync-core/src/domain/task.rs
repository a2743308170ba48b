//! Task record: one (location, date) unit of work inside a batch.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::errors::InvalidTransition;
use super::ids::{BatchId, LocationCode, TaskKey};
use super::state::TaskStatus;

/// Persisted task record.
///
/// Design:
/// - This is the single source of truth for task state.
/// - All status changes go through `transition()` so that the table in
///   `TaskStatus::can_transition_to` is enforced on every store backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub batch_id: BatchId,
    pub key: TaskKey,
    pub status: TaskStatus,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Set when the task reaches Completed or Failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lesson_count: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_duration_ms: Option<u64>,

    /// Expiry as unix seconds.
    pub ttl: i64,
}

impl TaskRecord {
    pub fn new_pending(batch_id: BatchId, key: TaskKey, now: DateTime<Utc>, ttl: i64) -> Self {
        Self {
            batch_id,
            key,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            processed_at: None,
            error_message: None,
            lesson_count: None,
            processing_duration_ms: None,
            ttl,
        }
    }

    pub fn location(&self) -> &LocationCode {
        &self.key.location
    }

    pub fn date(&self) -> NaiveDate {
        self.key.date
    }

    /// Checked status change; stamps `updated_at`.
    pub fn transition(&mut self, next: TaskStatus, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                key: self.key.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Pending -> Processing.
    pub fn claim(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::Processing, now)
    }

    /// Processing -> Completed.
    pub fn complete(
        &mut self,
        lesson_count: u32,
        duration_ms: u64,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::Completed, now)?;
        self.processed_at = Some(now);
        self.lesson_count = Some(lesson_count);
        self.processing_duration_ms = Some(duration_ms);
        self.error_message = None;
        Ok(())
    }

    /// Processing -> Failed.
    pub fn fail(&mut self, error: String, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::Failed, now)?;
        self.processed_at = Some(now);
        self.error_message = Some(error);
        Ok(())
    }

    /// Processing -> Pending (stale) or Failed -> Pending (manual).
    ///
    /// The last error is kept so an operator can still see why a reset task
    /// failed before.
    pub fn reset_to_pending(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::Pending, now)?;
        self.processed_at = None;
        Ok(())
    }

    /// Processing claim older than `cutoff`.
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Processing && self.updated_at < cutoff
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.ttl <= now.timestamp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use ulid::Ulid;

    fn record() -> TaskRecord {
        let now = Utc.with_ymd_and_hms(2026, 10, 18, 0, 0, 0).unwrap();
        TaskRecord::new_pending(
            BatchId::from_ulid(Ulid::new()),
            TaskKey::new(
                LocationCode::new("shibuya"),
                NaiveDate::from_ymd_opt(2026, 10, 18).unwrap(),
            ),
            now,
            now.timestamp() + 86_400,
        )
    }

    #[test]
    fn happy_path_records_metrics() {
        let mut task = record();
        let later = task.created_at + Duration::seconds(5);

        task.claim(later).unwrap();
        assert_eq!(task.status, TaskStatus::Processing);
        assert_eq!(task.updated_at, later);

        task.complete(12, 4_200, later).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.lesson_count, Some(12));
        assert_eq!(task.processing_duration_ms, Some(4_200));
        assert_eq!(task.processed_at, Some(later));
    }

    #[test]
    fn complete_without_claim_is_rejected() {
        let mut task = record();
        let err = task.complete(1, 1, task.created_at).unwrap_err();
        assert_eq!(err.from, TaskStatus::Pending);
        assert_eq!(err.to, TaskStatus::Completed);
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn failed_task_can_be_reset_and_keeps_error() {
        let mut task = record();
        let now = task.created_at;
        task.claim(now).unwrap();
        task.fail("boom".into(), now).unwrap();
        task.reset_to_pending(now).unwrap();

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.error_message.as_deref(), Some("boom"));
        assert_eq!(task.processed_at, None);
    }

    #[test]
    fn staleness_uses_updated_at() {
        let mut task = record();
        let t0 = task.created_at;
        task.claim(t0).unwrap();

        assert!(task.is_stale(t0 + Duration::seconds(1)));
        assert!(!task.is_stale(t0));
        assert!(!task.is_expired(t0));
        assert!(task.is_expired(t0 + Duration::days(1)));
    }
}
