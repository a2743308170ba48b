//! SQLite backend - invocation をまたいで状態を保持する永続ストア
//!
//! rusqlite は同期 API なので、接続は `Arc<Mutex<Connection>>` に入れて
//! `spawn_blocking` 上で操作します（async の中でロックを跨いで await しない）。
//!
//! プロセス間の排他は SQLite の `BEGIN IMMEDIATE` + busy timeout に任せます。

mod lesson_store;
mod task_store;

pub use lesson_store::SqliteLessonStore;
pub use task_store::SqliteTaskStore;

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::domain::StoreError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS batches (
    batch_id      TEXT PRIMARY KEY,
    created_at    TEXT NOT NULL,
    start_date    TEXT NOT NULL,
    horizon_days  INTEGER NOT NULL,
    total_tasks   INTEGER NOT NULL,
    ttl           INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
    batch_id                TEXT NOT NULL,
    sort_key                TEXT NOT NULL,
    location_code           TEXT NOT NULL,
    target_date             TEXT NOT NULL,
    status                  TEXT NOT NULL,
    created_at              TEXT NOT NULL,
    updated_at              TEXT NOT NULL,
    processed_at            TEXT,
    error_message           TEXT,
    lesson_count            INTEGER,
    processing_duration_ms  INTEGER,
    ttl                     INTEGER NOT NULL,
    PRIMARY KEY (batch_id, sort_key)
);

CREATE INDEX IF NOT EXISTS tasks_by_status ON tasks (batch_id, status);

CREATE TABLE IF NOT EXISTS lessons (
    location_code     TEXT NOT NULL,
    sort_key          TEXT NOT NULL,
    lesson_date       TEXT NOT NULL,
    start_time        TEXT NOT NULL,
    end_time          TEXT,
    lesson_name       TEXT NOT NULL,
    instructor        TEXT NOT NULL,
    is_available      INTEGER NOT NULL,
    available_seats   INTEGER NOT NULL,
    total_seats       INTEGER NOT NULL,
    seats_exact       INTEGER NOT NULL,
    status_text       TEXT,
    background_color  TEXT,
    text_color        TEXT,
    last_updated      TEXT NOT NULL,
    PRIMARY KEY (location_code, sort_key)
);

CREATE INDEX IF NOT EXISTS lessons_by_day ON lessons (location_code, lesson_date);
";

/// Shared SQLite handle. Cheap to clone; both stores can use one database.
#[derive(Clone)]
pub struct SqliteDb {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDb {
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(write_err)?;
        conn.busy_timeout(busy_timeout).map_err(write_err)?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .map_err(write_err)?;
        Self::bootstrap(conn)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(write_err)?;
        Self::bootstrap(conn)
    }

    fn bootstrap(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(write_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    pub(crate) async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Write("sqlite connection mutex poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Write(format!("sqlite worker failed: {e}")))?
    }
}

pub(crate) fn write_err(err: rusqlite::Error) -> StoreError {
    StoreError::Write(err.to_string())
}

pub(crate) fn read_err(err: rusqlite::Error) -> StoreError {
    StoreError::Read(err.to_string())
}

pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(field: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Schema(format!("{field}='{raw}': {e}")))
}

pub(crate) fn fmt_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub(crate) fn parse_date(field: &str, raw: &str) -> Result<NaiveDate, StoreError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| StoreError::Schema(format!("{field}='{raw}': {e}")))
}

pub(crate) fn non_negative<T: TryFrom<i64>>(field: &str, raw: i64) -> Result<T, StoreError> {
    T::try_from(raw).map_err(|_| StoreError::Schema(format!("{field}={raw} out of range")))
}
