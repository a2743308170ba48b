//! LessonStore port - 下流に公開するレッスンデータ
//!
//! 書き込みは全て冪等（同じ入力を何度書いても結果は同じ）。
//! リトライされたタスクは同じ日を再スクレイプして再書き込みするためです。

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::domain::{LessonRecord, LessonScope, LessonStats, LocationCode, StoreError};

#[async_trait]
pub trait LessonStore: Send + Sync {
    /// Upsert by lesson identity within one (location, date).
    ///
    /// Records whose location/date do not match the arguments are rejected
    /// with `StoreError::Schema`.
    async fn upsert_many(
        &self,
        location: &LocationCode,
        date: NaiveDate,
        lessons: &[LessonRecord],
    ) -> Result<usize, StoreError>;

    /// Replace the whole lesson set of one (location, date).
    ///
    /// Slots that disappeared from the site since the last write are removed.
    async fn replace_day(
        &self,
        location: &LocationCode,
        date: NaiveDate,
        lessons: &[LessonRecord],
    ) -> Result<usize, StoreError>;

    /// Bulk delete. Returns the number of removed records.
    async fn delete_scope(&self, scope: &LessonScope) -> Result<usize, StoreError>;

    async fn query(
        &self,
        location: &LocationCode,
        date: NaiveDate,
    ) -> Result<Vec<LessonRecord>, StoreError>;

    async fn query_all(&self) -> Result<Vec<LessonRecord>, StoreError>;

    async fn stats(&self) -> Result<LessonStats, StoreError>;
}

/// Shared guard for the `upsert_many`/`replace_day` contract.
pub(crate) fn check_day(
    location: &LocationCode,
    date: NaiveDate,
    lessons: &[LessonRecord],
) -> Result<(), StoreError> {
    match lessons
        .iter()
        .find(|l| &l.location_code != location || l.date != date)
    {
        Some(l) => Err(StoreError::Schema(format!(
            "lesson {} at {} does not belong to {}#{}",
            l.lesson_id(),
            l.location_code,
            location,
            date
        ))),
        None => Ok(()),
    }
}
