//! TaskStore port - タスク状態の正本（source of truth）
//!
//! TaskStore は以下を管理します：
//! - バッチのメタ情報（BatchRecord）
//! - タスクの状態（TaskStatus）とメトリクス
//!
//! # 設計原則
//! - claim は status に対する compare-and-swap（同じタスクを二重に claim しない）
//! - 状態遷移はすべて `TaskRecord::transition` の遷移表を通す
//! - invocation をまたいだ状態はすべてここから再構築できる

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::domain::{
    BatchId, BatchRecord, BatchStatusSummary, StoreError, TaskKey, TaskRecord, TaskStatus,
};

/// How many lost CAS races `claim_next_pending` tolerates before giving up.
pub const MAX_CLAIM_RACES: u32 = 8;

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist the batch metadata.
    async fn create_batch(&self, batch: &BatchRecord) -> Result<(), StoreError>;

    async fn get_batch(&self, batch_id: BatchId) -> Result<Option<BatchRecord>, StoreError>;

    /// Most recently created batch (ULID order).
    async fn latest_batch(&self) -> Result<Option<BatchRecord>, StoreError>;

    /// Bulk insert pending tasks. Existing keys are left untouched, so a
    /// partially failed creation can simply be re-run.
    ///
    /// Returns the number of newly inserted tasks.
    async fn create_tasks(
        &self,
        batch_id: BatchId,
        keys: &[TaskKey],
        now: DateTime<Utc>,
        ttl: i64,
    ) -> Result<usize, StoreError>;

    /// Atomically move one pending task to processing.
    ///
    /// `Ok(None)` means there is nothing left to claim.
    async fn claim_next_pending(
        &self,
        batch_id: BatchId,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>, StoreError>;

    /// processing -> completed.
    async fn complete(
        &self,
        batch_id: BatchId,
        key: &TaskKey,
        lesson_count: u32,
        duration_ms: u64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// processing -> failed.
    async fn fail(
        &self,
        batch_id: BatchId,
        key: &TaskKey,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn status_summary(&self, batch_id: BatchId) -> Result<BatchStatusSummary, StoreError>;

    /// Tasks of a batch ordered by key, optionally filtered by status.
    async fn list_tasks(
        &self,
        batch_id: BatchId,
        status: Option<TaskStatus>,
    ) -> Result<Vec<TaskRecord>, StoreError>;

    /// processing claims not touched for `stale_after` go back to pending.
    async fn reset_stale_processing(
        &self,
        batch_id: BatchId,
        stale_after: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    /// Manual failed -> pending reset for a whole batch.
    async fn reset_failed(&self, batch_id: BatchId, now: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Remove a batch and all of its tasks. Returns removed task count.
    async fn delete_batch(&self, batch_id: BatchId) -> Result<usize, StoreError>;

    /// Remove batches and tasks whose ttl has passed. Returns removed task count.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}
