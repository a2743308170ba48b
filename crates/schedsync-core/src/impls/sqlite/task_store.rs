use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use tracing::warn;

use super::{
    SqliteDb, fmt_date, fmt_ts, non_negative, parse_date, parse_ts, read_err, write_err,
};
use crate::domain::{
    BatchId, BatchRecord, BatchStatusSummary, LocationCode, StoreError, TaskKey, TaskRecord,
    TaskStatus,
};
use crate::ports::{MAX_CLAIM_RACES, TaskStore};

const TASK_COLUMNS: &str = "batch_id, sort_key, location_code, target_date, status, created_at, \
     updated_at, processed_at, error_message, lesson_count, processing_duration_ms, ttl";

/// Raw `tasks` row before validation.
struct TaskRow {
    batch_id: String,
    sort_key: String,
    location_code: String,
    target_date: String,
    status: String,
    created_at: String,
    updated_at: String,
    processed_at: Option<String>,
    error_message: Option<String>,
    lesson_count: Option<i64>,
    processing_duration_ms: Option<i64>,
    ttl: i64,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            batch_id: row.get(0)?,
            sort_key: row.get(1)?,
            location_code: row.get(2)?,
            target_date: row.get(3)?,
            status: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
            processed_at: row.get(7)?,
            error_message: row.get(8)?,
            lesson_count: row.get(9)?,
            processing_duration_ms: row.get(10)?,
            ttl: row.get(11)?,
        })
    }
}

impl TryFrom<TaskRow> for TaskRecord {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let batch_id: BatchId = row
            .batch_id
            .parse()
            .map_err(|e| StoreError::Schema(format!("batch_id: {e}")))?;
        let key = TaskKey::new(
            LocationCode::new(row.location_code),
            parse_date("target_date", &row.target_date)?,
        );
        if key.sort_key() != row.sort_key {
            return Err(StoreError::Schema(format!(
                "sort_key '{}' does not match {key}",
                row.sort_key
            )));
        }
        let status: TaskStatus = row
            .status
            .parse()
            .map_err(|e| StoreError::Schema(format!("{key}: {e}")))?;

        Ok(TaskRecord {
            batch_id,
            key,
            status,
            created_at: parse_ts("created_at", &row.created_at)?,
            updated_at: parse_ts("updated_at", &row.updated_at)?,
            processed_at: row
                .processed_at
                .as_deref()
                .map(|s| parse_ts("processed_at", s))
                .transpose()?,
            error_message: row.error_message,
            lesson_count: row
                .lesson_count
                .map(|v| non_negative("lesson_count", v))
                .transpose()?,
            processing_duration_ms: row
                .processing_duration_ms
                .map(|v| non_negative("processing_duration_ms", v))
                .transpose()?,
            ttl: row.ttl,
        })
    }
}

fn select_tasks(
    conn: &Connection,
    where_clause: &str,
    params: &[&dyn rusqlite::ToSql],
    limit: Option<u32>,
) -> Result<Vec<TaskRow>, StoreError> {
    let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE {where_clause} ORDER BY sort_key");
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    let mut stmt = conn.prepare(&sql).map_err(read_err)?;
    let rows = stmt
        .query_map(params, TaskRow::from_row)
        .map_err(read_err)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(read_err)
}

/// Validate rows, logging and skipping the ones that fail.
fn quarantine(rows: Vec<TaskRow>) -> Vec<TaskRecord> {
    rows.into_iter()
        .filter_map(|row| {
            let location = format!("{}/{}", row.batch_id, row.sort_key);
            match TaskRecord::try_from(row) {
                Ok(task) => Some(task),
                Err(e) => {
                    warn!(row = %location, error = %e, "quarantined task row");
                    None
                }
            }
        })
        .collect()
}

fn load_task(conn: &Connection, batch_id: BatchId, key: &TaskKey) -> Result<TaskRecord, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE batch_id = ?1 AND sort_key = ?2"),
            params![batch_id.to_string(), key.sort_key()],
            TaskRow::from_row,
        )
        .optional()
        .map_err(read_err)?
        .ok_or_else(|| StoreError::NotFound {
            batch_id,
            key: key.clone(),
        })?;
    TaskRecord::try_from(row)
}

/// Conditional write: only applies while the row still has `expected` status.
fn store_task(conn: &Connection, task: &TaskRecord, expected: TaskStatus) -> Result<bool, StoreError> {
    let changed = conn
        .execute(
            "UPDATE tasks
             SET status = ?3, updated_at = ?4, processed_at = ?5, error_message = ?6,
                 lesson_count = ?7, processing_duration_ms = ?8
             WHERE batch_id = ?1 AND sort_key = ?2 AND status = ?9",
            params![
                task.batch_id.to_string(),
                task.key.sort_key(),
                task.status.as_str(),
                fmt_ts(task.updated_at),
                task.processed_at.map(fmt_ts),
                task.error_message,
                task.lesson_count.map(i64::from),
                task.processing_duration_ms.map(|v| v as i64),
                expected.as_str(),
            ],
        )
        .map_err(write_err)?;
    Ok(changed == 1)
}

/// pending のまま読めない行は failed に移す（claim を塞がないように）
fn park_malformed(
    conn: &Connection,
    batch_id: &str,
    sort_key: &str,
    error: &StoreError,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    warn!(row = %format!("{batch_id}/{sort_key}"), %error, "malformed pending task moved to failed");
    conn.execute(
        "UPDATE tasks SET status = ?3, error_message = ?4, updated_at = ?5
         WHERE batch_id = ?1 AND sort_key = ?2 AND status = ?6",
        params![
            batch_id,
            sort_key,
            TaskStatus::Failed.as_str(),
            format!("malformed task row: {error}"),
            fmt_ts(now),
            TaskStatus::Pending.as_str(),
        ],
    )
    .map_err(write_err)?;
    Ok(())
}

/// Load, mutate through the domain transition, write back with CAS.
fn transition_one<F>(
    conn: &mut Connection,
    batch_id: BatchId,
    key: &TaskKey,
    apply: F,
) -> Result<(), StoreError>
where
    F: FnOnce(&mut TaskRecord) -> Result<(), StoreError>,
{
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(write_err)?;
    let mut task = load_task(&tx, batch_id, key)?;
    let before = task.status;
    apply(&mut task)?;
    if !store_task(&tx, &task, before)? {
        return Err(StoreError::Write(format!(
            "task {key} changed underneath the transition"
        )));
    }
    tx.commit().map_err(write_err)
}

/// Bulk reset of every row matching `status` and `filter` back to pending.
fn reset_matching<F>(
    conn: &mut Connection,
    batch_id: BatchId,
    status: TaskStatus,
    now: DateTime<Utc>,
    filter: F,
) -> Result<usize, StoreError>
where
    F: Fn(&TaskRecord) -> bool,
{
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(write_err)?;
    let rows = select_tasks(
        &tx,
        "batch_id = ?1 AND status = ?2",
        &[&batch_id.to_string(), &status.as_str()],
        None,
    )?;
    let mut count = 0;
    for mut task in quarantine(rows).into_iter().filter(|t| filter(t)) {
        task.reset_to_pending(now)?;
        if store_task(&tx, &task, status)? {
            count += 1;
        }
    }
    tx.commit().map_err(write_err)?;
    Ok(count)
}

fn batch_from_row(row: &Row<'_>) -> rusqlite::Result<(String, String, String, i64, i64, i64)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn parse_batch(raw: (String, String, String, i64, i64, i64)) -> Result<BatchRecord, StoreError> {
    let (batch_id, created_at, start_date, horizon_days, total_tasks, ttl) = raw;
    Ok(BatchRecord {
        batch_id: batch_id
            .parse()
            .map_err(|e| StoreError::Schema(format!("batch_id: {e}")))?,
        created_at: parse_ts("created_at", &created_at)?,
        start_date: parse_date("start_date", &start_date)?,
        horizon_days: non_negative("horizon_days", horizon_days)?,
        total_tasks: non_negative("total_tasks", total_tasks)?,
        ttl,
    })
}

const BATCH_COLUMNS: &str = "batch_id, created_at, start_date, horizon_days, total_tasks, ttl";

/// SQLite-backed TaskStore.
#[derive(Clone)]
pub struct SqliteTaskStore {
    db: SqliteDb,
}

impl SqliteTaskStore {
    pub fn new(db: SqliteDb) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create_batch(&self, batch: &BatchRecord) -> Result<(), StoreError> {
        let batch = batch.clone();
        self.db
            .call(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT OR REPLACE INTO batches ({BATCH_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
                    ),
                    params![
                        batch.batch_id.to_string(),
                        fmt_ts(batch.created_at),
                        fmt_date(batch.start_date),
                        i64::from(batch.horizon_days),
                        i64::from(batch.total_tasks),
                        batch.ttl,
                    ],
                )
                .map_err(write_err)?;
                Ok(())
            })
            .await
    }

    async fn get_batch(&self, batch_id: BatchId) -> Result<Option<BatchRecord>, StoreError> {
        self.db
            .call(move |conn| {
                conn.query_row(
                    &format!("SELECT {BATCH_COLUMNS} FROM batches WHERE batch_id = ?1"),
                    params![batch_id.to_string()],
                    batch_from_row,
                )
                .optional()
                .map_err(read_err)?
                .map(parse_batch)
                .transpose()
            })
            .await
    }

    async fn latest_batch(&self) -> Result<Option<BatchRecord>, StoreError> {
        self.db
            .call(|conn| {
                conn.query_row(
                    &format!("SELECT {BATCH_COLUMNS} FROM batches ORDER BY batch_id DESC LIMIT 1"),
                    [],
                    batch_from_row,
                )
                .optional()
                .map_err(read_err)?
                .map(parse_batch)
                .transpose()
            })
            .await
    }

    async fn create_tasks(
        &self,
        batch_id: BatchId,
        keys: &[TaskKey],
        now: DateTime<Utc>,
        ttl: i64,
    ) -> Result<usize, StoreError> {
        let keys = keys.to_vec();
        self.db
            .call(move |conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(write_err)?;
                let mut inserted = 0;
                {
                    let mut stmt = tx
                        .prepare(&format!(
                            "INSERT OR IGNORE INTO tasks ({TASK_COLUMNS})
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, NULL, NULL, NULL, NULL, ?7)"
                        ))
                        .map_err(write_err)?;
                    for key in &keys {
                        inserted += stmt
                            .execute(params![
                                batch_id.to_string(),
                                key.sort_key(),
                                key.location.as_str(),
                                fmt_date(key.date),
                                TaskStatus::Pending.as_str(),
                                fmt_ts(now),
                                ttl,
                            ])
                            .map_err(write_err)?;
                    }
                }
                tx.commit().map_err(write_err)?;
                Ok(inserted)
            })
            .await
    }

    async fn claim_next_pending(
        &self,
        batch_id: BatchId,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>, StoreError> {
        self.db
            .call(move |conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(write_err)?;
                let rows = select_tasks(
                    &tx,
                    "batch_id = ?1 AND status = ?2",
                    &[&batch_id.to_string(), &TaskStatus::Pending.as_str()],
                    None,
                )?;

                let mut races = 0;
                for row in rows {
                    let (row_batch, sort_key) = (row.batch_id.clone(), row.sort_key.clone());
                    let mut task = match TaskRecord::try_from(row) {
                        Ok(task) => task,
                        Err(e) => {
                            park_malformed(&tx, &row_batch, &sort_key, &e, now)?;
                            continue;
                        }
                    };
                    task.claim(now)?;
                    if store_task(&tx, &task, TaskStatus::Pending)? {
                        tx.commit().map_err(write_err)?;
                        return Ok(Some(task));
                    }
                    races += 1;
                    if races >= MAX_CLAIM_RACES {
                        break;
                    }
                }
                tx.commit().map_err(write_err)?;

                if races > 0 {
                    Err(StoreError::ClaimConflict {
                        batch_id,
                        attempts: races,
                    })
                } else {
                    Ok(None)
                }
            })
            .await
    }

    async fn complete(
        &self,
        batch_id: BatchId,
        key: &TaskKey,
        lesson_count: u32,
        duration_ms: u64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let key = key.clone();
        self.db
            .call(move |conn| {
                transition_one(conn, batch_id, &key, |task| {
                    task.complete(lesson_count, duration_ms, now)?;
                    Ok(())
                })
            })
            .await
    }

    async fn fail(
        &self,
        batch_id: BatchId,
        key: &TaskKey,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let key = key.clone();
        let error_message = error_message.to_string();
        self.db
            .call(move |conn| {
                transition_one(conn, batch_id, &key, |task| {
                    task.fail(error_message, now)?;
                    Ok(())
                })
            })
            .await
    }

    async fn status_summary(&self, batch_id: BatchId) -> Result<BatchStatusSummary, StoreError> {
        self.db
            .call(move |conn| {
                let mut stmt = conn
                    .prepare("SELECT status, COUNT(*) FROM tasks WHERE batch_id = ?1 GROUP BY status")
                    .map_err(read_err)?;
                let rows = stmt
                    .query_map(params![batch_id.to_string()], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                    })
                    .map_err(read_err)?;

                let mut counts = [0usize; 4];
                for row in rows {
                    let (status, count) = row.map_err(read_err)?;
                    let count: usize = non_negative("count", count)?;
                    match status.parse::<TaskStatus>() {
                        Ok(TaskStatus::Pending) => counts[0] += count,
                        Ok(TaskStatus::Processing) => counts[1] += count,
                        Ok(TaskStatus::Completed) => counts[2] += count,
                        Ok(TaskStatus::Failed) => counts[3] += count,
                        Err(e) => warn!(%batch_id, count, error = %e, "quarantined task rows"),
                    }
                }
                Ok(BatchStatusSummary::from_counts(
                    counts[0], counts[1], counts[2], counts[3],
                ))
            })
            .await
    }

    async fn list_tasks(
        &self,
        batch_id: BatchId,
        status: Option<TaskStatus>,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        self.db
            .call(move |conn| {
                let rows = match status {
                    Some(status) => select_tasks(
                        conn,
                        "batch_id = ?1 AND status = ?2",
                        &[&batch_id.to_string(), &status.as_str()],
                        None,
                    )?,
                    None => select_tasks(conn, "batch_id = ?1", &[&batch_id.to_string()], None)?,
                };
                Ok(quarantine(rows))
            })
            .await
    }

    async fn reset_stale_processing(
        &self,
        batch_id: BatchId,
        stale_after: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let cutoff = now - stale_after;
        self.db
            .call(move |conn| {
                reset_matching(conn, batch_id, TaskStatus::Processing, now, |t| {
                    t.is_stale(cutoff)
                })
            })
            .await
    }

    async fn reset_failed(&self, batch_id: BatchId, now: DateTime<Utc>) -> Result<usize, StoreError> {
        self.db
            .call(move |conn| reset_matching(conn, batch_id, TaskStatus::Failed, now, |_| true))
            .await
    }

    async fn delete_batch(&self, batch_id: BatchId) -> Result<usize, StoreError> {
        self.db
            .call(move |conn| {
                let tx = conn.transaction().map_err(write_err)?;
                let removed = tx
                    .execute("DELETE FROM tasks WHERE batch_id = ?1", params![batch_id.to_string()])
                    .map_err(write_err)?;
                tx.execute("DELETE FROM batches WHERE batch_id = ?1", params![batch_id.to_string()])
                    .map_err(write_err)?;
                tx.commit().map_err(write_err)?;
                Ok(removed)
            })
            .await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let now = now.timestamp();
        self.db
            .call(move |conn| {
                let tx = conn.transaction().map_err(write_err)?;
                let removed = tx
                    .execute("DELETE FROM tasks WHERE ttl <= ?1", params![now])
                    .map_err(write_err)?;
                tx.execute("DELETE FROM batches WHERE ttl <= ?1", params![now])
                    .map_err(write_err)?;
                tx.commit().map_err(write_err)?;
                Ok(removed)
            })
            .await
    }
}
