//! In-memory TaskStore (tests, dry runs).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use crate::domain::{
    BatchId, BatchRecord, BatchStatusSummary, StoreError, TaskKey, TaskRecord, TaskStatus,
};
use crate::ports::TaskStore;

/// In-memory store state.
///
/// Tasks are kept in a `BTreeMap` per batch so claim order and listings follow
/// the sort key, like the SQLite backend.
#[derive(Default)]
struct InMemoryTaskState {
    batches: HashMap<BatchId, BatchRecord>,
    tasks: HashMap<BatchId, BTreeMap<TaskKey, TaskRecord>>,
}

impl InMemoryTaskState {
    fn task_mut(&mut self, batch_id: BatchId, key: &TaskKey) -> Result<&mut TaskRecord, StoreError> {
        self.tasks
            .get_mut(&batch_id)
            .and_then(|tasks| tasks.get_mut(key))
            .ok_or_else(|| StoreError::NotFound {
                batch_id,
                key: key.clone(),
            })
    }

    fn tasks_mut(&mut self, batch_id: BatchId) -> impl Iterator<Item = &mut TaskRecord> {
        self.tasks
            .get_mut(&batch_id)
            .into_iter()
            .flat_map(|tasks| tasks.values_mut())
    }
}

/// In-memory task store.
///
/// The mutex is held for the whole claim, so the pending check and the
/// transition form one atomic step.
#[derive(Clone, Default)]
pub struct InMemoryTaskStore {
    state: Arc<Mutex<InMemoryTaskState>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force a task into a status (tests only; bypasses the transition table).
    #[cfg(test)]
    pub(crate) async fn force_status(
        &self,
        batch_id: BatchId,
        key: &TaskKey,
        status: TaskStatus,
        updated_at: DateTime<Utc>,
    ) {
        let mut state = self.state.lock().await;
        if let Ok(task) = state.task_mut(batch_id, key) {
            task.status = status;
            task.updated_at = updated_at;
        }
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create_batch(&self, batch: &BatchRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.batches.insert(batch.batch_id, batch.clone());
        Ok(())
    }

    async fn get_batch(&self, batch_id: BatchId) -> Result<Option<BatchRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.batches.get(&batch_id).cloned())
    }

    async fn latest_batch(&self) -> Result<Option<BatchRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .batches
            .values()
            .max_by_key(|b| b.batch_id)
            .cloned())
    }

    async fn create_tasks(
        &self,
        batch_id: BatchId,
        keys: &[TaskKey],
        now: DateTime<Utc>,
        ttl: i64,
    ) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let tasks = state.tasks.entry(batch_id).or_default();
        let mut inserted = 0;
        for key in keys {
            if !tasks.contains_key(key) {
                tasks.insert(key.clone(), TaskRecord::new_pending(batch_id, key.clone(), now, ttl));
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn claim_next_pending(
        &self,
        batch_id: BatchId,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(task) = state
            .tasks_mut(batch_id)
            .find(|t| t.status.is_claimable())
        else {
            return Ok(None);
        };
        task.claim(now)?;
        Ok(Some(task.clone()))
    }

    async fn complete(
        &self,
        batch_id: BatchId,
        key: &TaskKey,
        lesson_count: u32,
        duration_ms: u64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .task_mut(batch_id, key)?
            .complete(lesson_count, duration_ms, now)?;
        Ok(())
    }

    async fn fail(
        &self,
        batch_id: BatchId,
        key: &TaskKey,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .task_mut(batch_id, key)?
            .fail(error_message.to_string(), now)?;
        Ok(())
    }

    async fn status_summary(&self, batch_id: BatchId) -> Result<BatchStatusSummary, StoreError> {
        let state = self.state.lock().await;
        let summary = match state.tasks.get(&batch_id) {
            Some(tasks) => BatchStatusSummary::from_tasks(tasks.values()),
            None => BatchStatusSummary::from_statuses([]),
        };
        Ok(summary)
    }

    async fn list_tasks(
        &self,
        batch_id: BatchId,
        status: Option<TaskStatus>,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .tasks
            .get(&batch_id)
            .into_iter()
            .flat_map(|tasks| tasks.values())
            .filter(|t| status.is_none_or(|s| t.status == s))
            .cloned()
            .collect())
    }

    async fn reset_stale_processing(
        &self,
        batch_id: BatchId,
        stale_after: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let cutoff = now - stale_after;
        let mut state = self.state.lock().await;
        let mut count = 0;
        for task in state.tasks_mut(batch_id).filter(|t| t.is_stale(cutoff)) {
            task.reset_to_pending(now)?;
            count += 1;
        }
        Ok(count)
    }

    async fn reset_failed(&self, batch_id: BatchId, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let mut count = 0;
        for task in state
            .tasks_mut(batch_id)
            .filter(|t| t.status == TaskStatus::Failed)
        {
            task.reset_to_pending(now)?;
            count += 1;
        }
        Ok(count)
    }

    async fn delete_batch(&self, batch_id: BatchId) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        state.batches.remove(&batch_id);
        Ok(state.tasks.remove(&batch_id).map_or(0, |t| t.len()))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let mut removed = 0;
        for tasks in state.tasks.values_mut() {
            let before = tasks.len();
            tasks.retain(|_, t| !t.is_expired(now));
            removed += before - tasks.len();
        }
        state.tasks.retain(|_, tasks| !tasks.is_empty());
        state.batches.retain(|_, b| b.ttl > now.timestamp());
        Ok(removed)
    }
}
