//! In-memory LessonStore (tests, dry runs).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::Mutex;

use crate::domain::{LessonRecord, LessonScope, LessonStats, LocationCode, StoreError};
use crate::ports::LessonStore;
use crate::ports::lesson_store::check_day;

type LessonKey = (LocationCode, String);

#[derive(Clone, Default)]
pub struct InMemoryLessonStore {
    lessons: Arc<Mutex<BTreeMap<LessonKey, LessonRecord>>>,
}

impl InMemoryLessonStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LessonStore for InMemoryLessonStore {
    async fn upsert_many(
        &self,
        location: &LocationCode,
        date: NaiveDate,
        lessons: &[LessonRecord],
    ) -> Result<usize, StoreError> {
        check_day(location, date, lessons)?;
        let mut map = self.lessons.lock().await;
        for lesson in lessons {
            map.insert((location.clone(), lesson.lesson_id()), lesson.clone());
        }
        Ok(lessons.len())
    }

    async fn replace_day(
        &self,
        location: &LocationCode,
        date: NaiveDate,
        lessons: &[LessonRecord],
    ) -> Result<usize, StoreError> {
        check_day(location, date, lessons)?;
        let mut map = self.lessons.lock().await;
        map.retain(|(l, _), r| !(l == location && r.date == date));
        for lesson in lessons {
            map.insert((location.clone(), lesson.lesson_id()), lesson.clone());
        }
        Ok(lessons.len())
    }

    async fn delete_scope(&self, scope: &LessonScope) -> Result<usize, StoreError> {
        let mut map = self.lessons.lock().await;
        let before = map.len();
        map.retain(|(l, _), r| !scope.contains(l, r.date));
        Ok(before - map.len())
    }

    async fn query(
        &self,
        location: &LocationCode,
        date: NaiveDate,
    ) -> Result<Vec<LessonRecord>, StoreError> {
        let map = self.lessons.lock().await;
        Ok(map
            .iter()
            .filter(|((l, _), r)| l == location && r.date == date)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn query_all(&self) -> Result<Vec<LessonRecord>, StoreError> {
        let map = self.lessons.lock().await;
        Ok(map.values().cloned().collect())
    }

    async fn stats(&self) -> Result<LessonStats, StoreError> {
        let map = self.lessons.lock().await;
        Ok(LessonStats::from_records(map.values()))
    }
}
