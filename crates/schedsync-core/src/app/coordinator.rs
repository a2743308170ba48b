//! BatchCoordinator - バッチの作成と 1 タスク分の処理
//!
//! # フロー（process_next）
//! 1. claim（pending → processing）
//! 2. Extractor でスクレイプ
//! 3. 成功: (location, date) のレッスンを replace_day → complete
//!    失敗: fail（エラーメッセージを残す）
//! 4. 集計を見て、まだ仕事が残っているかを返す
//!
//! タスク単位の失敗は TaskRecord に記録され、ここより外には出ません。
//! 外に出るのはストア自体の失敗（claim conflict / write error）だけです。

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Offset, Utc};
use tracing::{debug, info, instrument, warn};

use super::status::{BatchStatusReport, FailedTask};
use crate::domain::{
    BatchError, BatchId, BatchRecord, LessonScope, LocationCode, LocationRef, RetryPolicy,
    StoreError, TaskKey, TaskRecord, TaskStatus,
};
use crate::ports::{Clock, IdGenerator, LessonStore, TaskStore};
use crate::scrape::Extractor;

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Site time zone; "today" for a new batch is computed here.
    pub site_offset: FixedOffset,
    /// How long batch and task records are kept.
    pub task_ttl: Duration,
    pub store_retry: RetryPolicy,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            site_offset: site_offset(9),
            task_ttl: Duration::days(7),
            store_retry: RetryPolicy::store_default(),
        }
    }
}

/// `+hours` from UTC; out-of-range values fall back to UTC.
pub fn site_offset(hours: i32) -> FixedOffset {
    FixedOffset::east_opt(hours * 3600).unwrap_or(Utc.fix())
}

/// How one claimed task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskResult {
    Completed { lesson_count: u32 },
    Failed { error: String },
    /// Someone else moved the task (stale reset) before we could record it.
    Lost,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedTask {
    pub key: TaskKey,
    pub result: TaskResult,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    /// `None` when nothing was pending.
    pub processed: Option<ProcessedTask>,
    pub has_more: bool,
}

pub struct BatchCoordinator {
    tasks: Arc<dyn TaskStore>,
    lessons: Arc<dyn LessonStore>,
    extractor: Arc<dyn Extractor>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    settings: CoordinatorSettings,
}

impl BatchCoordinator {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        lessons: Arc<dyn LessonStore>,
        extractor: Arc<dyn Extractor>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            tasks,
            lessons,
            extractor,
            ids,
            clock,
            settings,
        }
    }

    pub fn lesson_store(&self) -> &Arc<dyn LessonStore> {
        &self.lessons
    }

    /// Site-local calendar date right now.
    pub fn site_today(&self) -> NaiveDate {
        self.clock
            .now()
            .with_timezone(&self.settings.site_offset)
            .date_naive()
    }

    fn ttl_from(&self, now: DateTime<Utc>) -> i64 {
        (now + self.settings.task_ttl).timestamp()
    }

    async fn retry<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        with_store_retry(&self.settings.store_retry, op, f).await
    }

    /// Create a batch covering `locations × [today, today + horizon_days)`.
    ///
    /// The lessons of every enumerated location are cleared first; the batch
    /// and its tasks are written only after the clear went through.
    #[instrument(skip(self, locations), fields(locations = locations.len()))]
    pub async fn initialize_batch(
        &self,
        locations: &[LocationRef],
        horizon_days: u32,
    ) -> Result<BatchId, BatchError> {
        if horizon_days == 0 {
            return Err(BatchError::InvalidHorizon);
        }
        let codes: Vec<LocationCode> = locations
            .iter()
            .map(|l| l.code.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if codes.is_empty() {
            return Err(BatchError::NoLocations);
        }

        let cleared = self
            .clear_lessons_for_scope(&LessonScope::Locations(codes.clone()))
            .await?;

        let now = self.clock.now();
        let start_date = self.site_today();
        let keys: Vec<TaskKey> = codes
            .iter()
            .flat_map(|code| {
                (0..horizon_days).filter_map(move |offset| {
                    start_date
                        .checked_add_days(chrono::Days::new(u64::from(offset)))
                        .map(|date| TaskKey::new(code.clone(), date))
                })
            })
            .collect();

        let batch = BatchRecord {
            batch_id: self.ids.generate_batch_id(),
            created_at: now,
            start_date,
            horizon_days,
            total_tasks: keys.len() as u32,
            ttl: self.ttl_from(now),
        };
        let batch_id = batch.batch_id;

        self.retry("create_batch", || self.tasks.create_batch(&batch))
            .await?;
        let inserted = self
            .retry("create_tasks", || {
                self.tasks.create_tasks(batch_id, &keys, now, batch.ttl)
            })
            .await?;

        info!(
            %batch_id,
            %start_date,
            horizon_days,
            tasks = inserted,
            cleared_lessons = cleared,
            "batch initialized"
        );
        Ok(batch_id)
    }

    #[instrument(skip(self))]
    pub async fn clear_lessons_for_scope(&self, scope: &LessonScope) -> Result<usize, BatchError> {
        let removed = self
            .retry("delete_scope", || self.lessons.delete_scope(scope))
            .await?;
        debug!(removed, "lessons cleared");
        Ok(removed)
    }

    /// Claim and process at most one task. `Ok(false)` means nothing is left
    /// for this invocation.
    pub async fn process_one_task(&self, batch_id: BatchId) -> Result<bool, BatchError> {
        Ok(self.process_next(batch_id).await?.has_more)
    }

    #[instrument(skip(self))]
    pub async fn process_next(&self, batch_id: BatchId) -> Result<StepReport, BatchError> {
        let claimed_at = self.clock.now();
        let Some(task) = self
            .retry("claim", || self.tasks.claim_next_pending(batch_id, claimed_at))
            .await?
        else {
            debug!("no pending task");
            return Ok(StepReport {
                processed: None,
                has_more: false,
            });
        };

        let processed = self.run_task(batch_id, &task).await?;

        let summary = self
            .retry("status_summary", || self.tasks.status_summary(batch_id))
            .await?;
        debug!(
            pending = summary.pending,
            processing = summary.processing,
            completed = summary.completed,
            failed = summary.failed,
            "batch progress"
        );

        Ok(StepReport {
            processed: Some(processed),
            has_more: summary.has_remaining(),
        })
    }

    async fn run_task(&self, batch_id: BatchId, task: &TaskRecord) -> Result<ProcessedTask, BatchError> {
        let key = &task.key;
        let started = tokio::time::Instant::now();
        let extracted = self.extractor.extract(&key.location, key.date).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let outcome = match extracted {
            Ok(extraction) => {
                let persisted = self
                    .retry("replace_day", || {
                        self.lessons
                            .replace_day(&key.location, key.date, &extraction.lessons)
                    })
                    .await;
                match persisted {
                    Ok(count) => Ok(count as u32),
                    Err(e) => Err(format!("persist failed: {e}")),
                }
            }
            Err(e) => Err(e.to_string()),
        };

        let now = self.clock.now();
        let recorded = match &outcome {
            Ok(lesson_count) => {
                self.retry("complete", || {
                    self.tasks.complete(batch_id, key, *lesson_count, duration_ms, now)
                })
                .await
            }
            Err(error) => {
                self.retry("fail", || self.tasks.fail(batch_id, key, error, now))
                    .await
            }
        };

        let result = match (recorded, outcome) {
            (Ok(()), Ok(lesson_count)) => {
                info!(task = %key, lesson_count, duration_ms, "task completed");
                TaskResult::Completed { lesson_count }
            }
            (Ok(()), Err(error)) => {
                warn!(task = %key, %error, duration_ms, "task failed");
                TaskResult::Failed { error }
            }
            (Err(StoreError::InvalidTransition(e)), _) => {
                warn!(task = %key, error = %e, "task was moved while processing; result dropped");
                TaskResult::Lost
            }
            (Err(e), _) => return Err(e.into()),
        };

        Ok(ProcessedTask {
            key: key.clone(),
            result,
            duration_ms,
        })
    }

    #[instrument(skip(self))]
    pub async fn reset_failed(&self, batch_id: BatchId) -> Result<usize, BatchError> {
        let now = self.clock.now();
        let reset = self
            .retry("reset_failed", || self.tasks.reset_failed(batch_id, now))
            .await?;
        info!(reset, "failed tasks reset to pending");
        Ok(reset)
    }

    #[instrument(skip(self))]
    pub async fn reset_stale(&self, batch_id: BatchId, stale_after: Duration) -> Result<usize, BatchError> {
        let now = self.clock.now();
        let reset = self
            .retry("reset_stale", || {
                self.tasks.reset_stale_processing(batch_id, stale_after, now)
            })
            .await?;
        if reset > 0 {
            warn!(reset, "stale processing tasks returned to pending");
        }
        Ok(reset)
    }

    pub async fn status_report(&self, batch_id: BatchId) -> Result<BatchStatusReport, BatchError> {
        let batch = self
            .retry("get_batch", || self.tasks.get_batch(batch_id))
            .await?
            .ok_or(StoreError::BatchNotFound(batch_id))?;
        let summary = self
            .retry("status_summary", || self.tasks.status_summary(batch_id))
            .await?;
        let failed = self
            .retry("list_tasks", || {
                self.tasks.list_tasks(batch_id, Some(TaskStatus::Failed))
            })
            .await?
            .into_iter()
            .map(FailedTask::from)
            .collect();

        Ok(BatchStatusReport::new(batch, summary, failed))
    }

    pub async fn latest_batch(&self) -> Result<Option<BatchRecord>, BatchError> {
        Ok(self
            .retry("latest_batch", || self.tasks.latest_batch())
            .await?)
    }

    #[instrument(skip(self))]
    pub async fn purge_expired(&self) -> Result<usize, BatchError> {
        let now = self.clock.now();
        let purged = self
            .retry("purge_expired", || self.tasks.purge_expired(now))
            .await?;
        info!(purged, "expired tasks purged");
        Ok(purged)
    }
}

/// Retry transient store errors with exponential backoff.
pub async fn with_store_retry<T, F, Fut>(
    policy: &RetryPolicy,
    op: &'static str,
    mut f: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match f().await {
            Err(e) if e.is_retryable() && policy.should_retry(attempts) => {
                let delay = policy.next_delay(attempts);
                warn!(op, attempts, error = %e, ?delay, "store error, retrying");
                tokio::time::sleep(delay).await;
            }
            res => return res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LessonRecord, ScrapeError};
    use crate::impls::{FixtureLauncher, InMemoryLessonStore, InMemoryTaskStore};
    use crate::ports::{FixedClock, UlidGenerator};
    use crate::scrape::fixtures::THREE_SLOT_PAGE;
    use crate::scrape::{Extraction, ExtractionConfig, ExtractionWorker};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Returns a canned result per (location, date); unknown keys yield an
    /// empty schedule.
    #[derive(Default)]
    struct ScriptedExtractor {
        results: HashMap<TaskKey, Result<Vec<LessonRecord>, ScrapeError>>,
    }

    #[async_trait]
    impl Extractor for ScriptedExtractor {
        async fn extract(&self, location: &LocationCode, date: NaiveDate) -> Result<Extraction, ScrapeError> {
            let key = TaskKey::new(location.clone(), date);
            let lessons = self.results.get(&key).cloned().unwrap_or(Ok(Vec::new()))?;
            Ok(Extraction {
                lessons,
                quarantined: 0,
                attempts: 1,
            })
        }
    }

    struct Harness {
        coordinator: BatchCoordinator,
        tasks: InMemoryTaskStore,
        lessons: InMemoryLessonStore,
        clock: Arc<FixedClock>,
    }

    fn t0() -> DateTime<Utc> {
        // 2026-10-18 23:30 JST
        Utc.with_ymd_and_hms(2026, 10, 18, 14, 30, 0).unwrap()
    }

    fn harness(extractor: Arc<dyn Extractor>) -> Harness {
        let tasks = InMemoryTaskStore::new();
        let lessons = InMemoryLessonStore::new();
        let clock = Arc::new(FixedClock::new(t0()));
        let settings = CoordinatorSettings {
            store_retry: RetryPolicy::immediate(3),
            ..CoordinatorSettings::default()
        };
        let coordinator = BatchCoordinator::new(
            Arc::new(tasks.clone()),
            Arc::new(lessons.clone()),
            extractor,
            Arc::new(UlidGenerator::new(clock.clone())),
            clock.clone(),
            settings,
        );
        Harness {
            coordinator,
            tasks,
            lessons,
            clock,
        }
    }

    fn studios() -> Vec<LocationRef> {
        vec![LocationRef::new("ginza", "銀座"), LocationRef::new("shibuya", "渋谷")]
    }

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, day).unwrap()
    }

    #[tokio::test]
    async fn initialize_enumerates_locations_and_site_local_days() {
        let h = harness(Arc::new(ScriptedExtractor::default()));
        let batch_id = h.coordinator.initialize_batch(&studios(), 3).await.unwrap();

        let batch = h.tasks.get_batch(batch_id).await.unwrap().unwrap();
        assert_eq!(batch.start_date, d(18));
        assert_eq!(batch.total_tasks, 6);
        assert_eq!(batch.ttl, (t0() + Duration::days(7)).timestamp());

        let keys: Vec<String> = h
            .tasks
            .list_tasks(batch_id, None)
            .await
            .unwrap()
            .iter()
            .map(|t| t.key.sort_key())
            .collect();
        assert_eq!(
            keys,
            vec![
                "ginza#2026-10-18",
                "ginza#2026-10-19",
                "ginza#2026-10-20",
                "shibuya#2026-10-18",
                "shibuya#2026-10-19",
                "shibuya#2026-10-20",
            ]
        );
    }

    #[tokio::test]
    async fn site_today_follows_the_configured_offset() {
        let h = harness(Arc::new(ScriptedExtractor::default()));
        // 15:30 UTC = 00:30 JST the next day
        h.clock.set(Utc.with_ymd_and_hms(2026, 10, 18, 15, 30, 0).unwrap());
        assert_eq!(h.coordinator.site_today(), d(19));
    }

    #[tokio::test]
    async fn initialize_clears_only_enumerated_locations() {
        let h = harness(Arc::new(ScriptedExtractor::default()));
        let ebisu = LocationCode::new("ebisu");
        let ginza = LocationCode::new("ginza");
        h.lessons
            .upsert_many(&ginza, d(17), &[crate::domain::lesson::fixtures::lesson("ginza", d(17), 10, "A")])
            .await
            .unwrap();
        h.lessons
            .upsert_many(&ebisu, d(17), &[crate::domain::lesson::fixtures::lesson("ebisu", d(17), 10, "A")])
            .await
            .unwrap();

        h.coordinator.initialize_batch(&studios(), 1).await.unwrap();

        let remaining = h.lessons.query_all().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].location_code, ebisu);
    }

    #[tokio::test]
    async fn initialize_rejects_empty_inputs() {
        let h = harness(Arc::new(ScriptedExtractor::default()));
        assert!(matches!(
            h.coordinator.initialize_batch(&[], 7).await,
            Err(BatchError::NoLocations)
        ));
        assert!(matches!(
            h.coordinator.initialize_batch(&studios(), 0).await,
            Err(BatchError::InvalidHorizon)
        ));
        assert!(h.tasks.latest_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn terminates_after_exactly_k_claims() {
        let h = harness(Arc::new(ScriptedExtractor::default()));
        let batch_id = h.coordinator.initialize_batch(&studios(), 2).await.unwrap();

        let mut calls = 0;
        loop {
            calls += 1;
            if !h.coordinator.process_one_task(batch_id).await.unwrap() {
                break;
            }
            assert!(calls < 100, "runaway loop");
        }
        assert_eq!(calls, 4);

        let report = h.coordinator.status_report(batch_id).await.unwrap();
        assert_eq!(report.summary.completed, 4);
        assert_eq!(report.summary.progress_percent, 100.0);

        let again = h.coordinator.process_next(batch_id).await.unwrap();
        assert_eq!(again.processed, None);
        assert!(!again.has_more);
    }

    #[tokio::test]
    async fn empty_day_completes_with_zero_lessons() {
        let h = harness(Arc::new(ScriptedExtractor::default()));
        let batch_id = h
            .coordinator
            .initialize_batch(&[LocationRef::new("ginza", "銀座")], 1)
            .await
            .unwrap();

        let step = h.coordinator.process_next(batch_id).await.unwrap();
        let processed = step.processed.unwrap();
        assert_eq!(processed.result, TaskResult::Completed { lesson_count: 0 });
        assert!(!step.has_more);

        let done = h
            .tasks
            .list_tasks(batch_id, Some(TaskStatus::Completed))
            .await
            .unwrap();
        assert_eq!(done[0].lesson_count, Some(0));
    }

    #[tokio::test]
    async fn scrape_failure_is_recorded_not_raised() {
        let key = TaskKey::new(LocationCode::new("ginza"), d(18));
        let mut extractor = ScriptedExtractor::default();
        extractor
            .results
            .insert(key.clone(), Err(ScrapeError::Structure("'.schedule' not found".into())));
        let h = harness(Arc::new(extractor));
        let batch_id = h
            .coordinator
            .initialize_batch(&[LocationRef::new("ginza", "銀座")], 2)
            .await
            .unwrap();

        let first = h.coordinator.process_next(batch_id).await.unwrap();
        assert!(matches!(
            first.processed.unwrap().result,
            TaskResult::Failed { ref error } if error.contains("schedule structure not found")
        ));
        assert!(first.has_more);
        assert!(!h.coordinator.process_one_task(batch_id).await.unwrap());

        let report = h.coordinator.status_report(batch_id).await.unwrap();
        assert_eq!(report.summary.failed, 1);
        assert_eq!(report.failed[0].location_code, LocationCode::new("ginza"));
        assert_eq!(report.failed[0].date, d(18));

        assert_eq!(h.coordinator.reset_failed(batch_id).await.unwrap(), 1);
        assert!(h.coordinator.process_one_task(batch_id).await.is_ok());
    }

    #[tokio::test]
    async fn real_worker_persists_the_three_slot_page() {
        let launcher = FixtureLauncher::new();
        launcher
            .serve_html("https://studio.test/ginza/2026-10-18", THREE_SLOT_PAGE)
            .await;
        let clock = Arc::new(FixedClock::new(t0()));
        let mut config = ExtractionConfig::new("https://studio.test/{location}/{date}");
        config.retry = RetryPolicy::immediate(1);
        let worker = ExtractionWorker::new(Arc::new(launcher.clone()), clock, config).unwrap();

        let h = harness(Arc::new(worker));
        let ginza = LocationCode::new("ginza");

        // same day scraped by two consecutive batches: one record per slot
        for _ in 0..2 {
            let batch_id = h
                .coordinator
                .initialize_batch(&[LocationRef::new("ginza", "銀座")], 1)
                .await
                .unwrap();
            assert!(!h.coordinator.process_one_task(batch_id).await.unwrap());

            let done = h
                .tasks
                .list_tasks(batch_id, Some(TaskStatus::Completed))
                .await
                .unwrap();
            assert_eq!(done[0].lesson_count, Some(3));
            assert_eq!(h.lessons.query(&ginza, d(18)).await.unwrap().len(), 3);
        }
        assert_eq!(launcher.visits().await.len(), 2);
        assert_eq!(launcher.opened(), launcher.closed());
    }

    /// Fails every write a fixed number of times before succeeding.
    struct FlakyLessons {
        inner: InMemoryLessonStore,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl LessonStore for FlakyLessons {
        async fn upsert_many(&self, l: &LocationCode, d: NaiveDate, r: &[LessonRecord]) -> Result<usize, StoreError> {
            self.inner.upsert_many(l, d, r).await
        }
        async fn replace_day(&self, l: &LocationCode, d: NaiveDate, r: &[LessonRecord]) -> Result<usize, StoreError> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Write("database is locked".into()));
            }
            self.inner.replace_day(l, d, r).await
        }
        async fn delete_scope(&self, s: &LessonScope) -> Result<usize, StoreError> {
            self.inner.delete_scope(s).await
        }
        async fn query(&self, l: &LocationCode, d: NaiveDate) -> Result<Vec<LessonRecord>, StoreError> {
            self.inner.query(l, d).await
        }
        async fn query_all(&self) -> Result<Vec<LessonRecord>, StoreError> {
            self.inner.query_all().await
        }
        async fn stats(&self) -> Result<crate::domain::LessonStats, StoreError> {
            self.inner.stats().await
        }
    }

    async fn flaky_run(failures: u32) -> TaskResult {
        let tasks = InMemoryTaskStore::new();
        let clock = Arc::new(FixedClock::new(t0()));
        let coordinator = BatchCoordinator::new(
            Arc::new(tasks),
            Arc::new(FlakyLessons {
                inner: InMemoryLessonStore::new(),
                failures_left: AtomicU32::new(failures),
            }),
            Arc::new(ScriptedExtractor::default()),
            Arc::new(UlidGenerator::new(clock.clone())),
            clock,
            CoordinatorSettings {
                store_retry: RetryPolicy::immediate(3),
                ..CoordinatorSettings::default()
            },
        );
        let batch_id = coordinator
            .initialize_batch(&[LocationRef::new("ginza", "銀座")], 1)
            .await
            .unwrap();
        coordinator
            .process_next(batch_id)
            .await
            .unwrap()
            .processed
            .unwrap()
            .result
    }

    #[tokio::test]
    async fn store_writes_are_retried_then_task_fails() {
        assert_eq!(flaky_run(2).await, TaskResult::Completed { lesson_count: 0 });
        assert!(matches!(
            flaky_run(3).await,
            TaskResult::Failed { ref error } if error.starts_with("persist failed")
        ));
    }

    #[tokio::test]
    async fn stale_claims_are_recovered() {
        let h = harness(Arc::new(ScriptedExtractor::default()));
        let batch_id = h
            .coordinator
            .initialize_batch(&[LocationRef::new("ginza", "銀座")], 1)
            .await
            .unwrap();
        let key = TaskKey::new(LocationCode::new("ginza"), d(18));
        h.tasks
            .force_status(batch_id, &key, TaskStatus::Processing, t0())
            .await;

        assert_eq!(h.coordinator.reset_stale(batch_id, Duration::minutes(15)).await.unwrap(), 0);
        h.clock.advance(Duration::minutes(16));
        assert_eq!(h.coordinator.reset_stale(batch_id, Duration::minutes(15)).await.unwrap(), 1);
        assert!(!h.coordinator.process_one_task(batch_id).await.unwrap());
        assert_eq!(
            h.tasks.status_summary(batch_id).await.unwrap().completed,
            1
        );
    }
}
