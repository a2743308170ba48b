use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use rusqlite::{Connection, Row, Transaction, params};
use tracing::warn;

use super::{SqliteDb, fmt_date, fmt_ts, non_negative, parse_date, parse_ts, read_err, write_err};
use crate::domain::{LessonRecord, LessonScope, LessonStats, LocationCode, StoreError};
use crate::ports::LessonStore;
use crate::ports::lesson_store::check_day;

const LESSON_COLUMNS: &str = "location_code, sort_key, lesson_date, start_time, end_time, \
     lesson_name, instructor, is_available, available_seats, total_seats, seats_exact, \
     status_text, background_color, text_color, last_updated";

struct LessonRow {
    location_code: String,
    sort_key: String,
    lesson_date: String,
    start_time: String,
    end_time: Option<String>,
    lesson_name: String,
    instructor: String,
    is_available: bool,
    available_seats: i64,
    total_seats: i64,
    seats_exact: bool,
    status_text: Option<String>,
    background_color: Option<String>,
    text_color: Option<String>,
    last_updated: String,
}

impl LessonRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            location_code: row.get(0)?,
            sort_key: row.get(1)?,
            lesson_date: row.get(2)?,
            start_time: row.get(3)?,
            end_time: row.get(4)?,
            lesson_name: row.get(5)?,
            instructor: row.get(6)?,
            is_available: row.get(7)?,
            available_seats: row.get(8)?,
            total_seats: row.get(9)?,
            seats_exact: row.get(10)?,
            status_text: row.get(11)?,
            background_color: row.get(12)?,
            text_color: row.get(13)?,
            last_updated: row.get(14)?,
        })
    }
}

fn parse_time(field: &str, raw: &str) -> Result<NaiveTime, StoreError> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .map_err(|e| StoreError::Schema(format!("{field}='{raw}': {e}")))
}

impl TryFrom<LessonRow> for LessonRecord {
    type Error = StoreError;

    fn try_from(row: LessonRow) -> Result<Self, Self::Error> {
        let record = LessonRecord {
            location_code: LocationCode::new(row.location_code),
            date: parse_date("lesson_date", &row.lesson_date)?,
            start_time: parse_time("start_time", &row.start_time)?,
            end_time: row
                .end_time
                .as_deref()
                .map(|s| parse_time("end_time", s))
                .transpose()?,
            lesson_name: row.lesson_name,
            instructor: row.instructor,
            is_available: row.is_available,
            available_seats: non_negative("available_seats", row.available_seats)?,
            total_seats: non_negative("total_seats", row.total_seats)?,
            seats_exact: row.seats_exact,
            status_text: row.status_text,
            background_color: row.background_color,
            text_color: row.text_color,
            last_updated: parse_ts("last_updated", &row.last_updated)?,
        };
        if record.lesson_id() != row.sort_key {
            return Err(StoreError::Schema(format!(
                "sort_key '{}' does not match {}",
                row.sort_key,
                record.lesson_id()
            )));
        }
        Ok(record)
    }
}

fn select_lessons(
    conn: &Connection,
    where_clause: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<LessonRecord>, StoreError> {
    let sql = format!(
        "SELECT {LESSON_COLUMNS} FROM lessons WHERE {where_clause} ORDER BY location_code, sort_key"
    );
    let mut stmt = conn.prepare(&sql).map_err(read_err)?;
    let rows = stmt
        .query_map(params, LessonRow::from_row)
        .map_err(read_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(read_err)?;

    Ok(rows
        .into_iter()
        .filter_map(|row| {
            let id = format!("{}/{}", row.location_code, row.sort_key);
            LessonRecord::try_from(row)
                .map_err(|e| warn!(row = %id, error = %e, "quarantined lesson row"))
                .ok()
        })
        .collect())
}

fn upsert_rows(tx: &Transaction<'_>, lessons: &[LessonRecord]) -> Result<usize, StoreError> {
    let mut stmt = tx
        .prepare(&format!(
            "INSERT INTO lessons ({LESSON_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT (location_code, sort_key) DO UPDATE SET
                lesson_date = excluded.lesson_date,
                start_time = excluded.start_time,
                end_time = excluded.end_time,
                lesson_name = excluded.lesson_name,
                instructor = excluded.instructor,
                is_available = excluded.is_available,
                available_seats = excluded.available_seats,
                total_seats = excluded.total_seats,
                seats_exact = excluded.seats_exact,
                status_text = excluded.status_text,
                background_color = excluded.background_color,
                text_color = excluded.text_color,
                last_updated = excluded.last_updated"
        ))
        .map_err(write_err)?;

    for l in lessons {
        stmt.execute(params![
            l.location_code.as_str(),
            l.lesson_id(),
            fmt_date(l.date),
            l.start_time.format("%H:%M").to_string(),
            l.end_time.map(|t| t.format("%H:%M").to_string()),
            l.lesson_name,
            l.instructor,
            l.is_available,
            i64::from(l.available_seats),
            i64::from(l.total_seats),
            l.seats_exact,
            l.status_text,
            l.background_color,
            l.text_color,
            fmt_ts(l.last_updated),
        ])
        .map_err(write_err)?;
    }
    Ok(lessons.len())
}

/// SQLite-backed LessonStore.
#[derive(Clone)]
pub struct SqliteLessonStore {
    db: SqliteDb,
}

impl SqliteLessonStore {
    pub fn new(db: SqliteDb) -> Self {
        Self { db }
    }
}

#[async_trait]
impl LessonStore for SqliteLessonStore {
    async fn upsert_many(
        &self,
        location: &LocationCode,
        date: NaiveDate,
        lessons: &[LessonRecord],
    ) -> Result<usize, StoreError> {
        check_day(location, date, lessons)?;
        let lessons = lessons.to_vec();
        self.db
            .call(move |conn| {
                let tx = conn.transaction().map_err(write_err)?;
                let n = upsert_rows(&tx, &lessons)?;
                tx.commit().map_err(write_err)?;
                Ok(n)
            })
            .await
    }

    async fn replace_day(
        &self,
        location: &LocationCode,
        date: NaiveDate,
        lessons: &[LessonRecord],
    ) -> Result<usize, StoreError> {
        check_day(location, date, lessons)?;
        let location = location.clone();
        let lessons = lessons.to_vec();
        self.db
            .call(move |conn| {
                let tx = conn.transaction().map_err(write_err)?;
                tx.execute(
                    "DELETE FROM lessons WHERE location_code = ?1 AND lesson_date = ?2",
                    params![location.as_str(), fmt_date(date)],
                )
                .map_err(write_err)?;
                let n = upsert_rows(&tx, &lessons)?;
                tx.commit().map_err(write_err)?;
                Ok(n)
            })
            .await
    }

    async fn delete_scope(&self, scope: &LessonScope) -> Result<usize, StoreError> {
        let scope = scope.clone();
        self.db
            .call(move |conn| {
                let tx = conn.transaction().map_err(write_err)?;
                let removed = match &scope {
                    LessonScope::All => tx.execute("DELETE FROM lessons", []).map_err(write_err)?,
                    LessonScope::Locations(codes) => {
                        let mut removed = 0;
                        for code in codes {
                            removed += tx
                                .execute(
                                    "DELETE FROM lessons WHERE location_code = ?1",
                                    params![code.as_str()],
                                )
                                .map_err(write_err)?;
                        }
                        removed
                    }
                    LessonScope::Day { location, date } => tx
                        .execute(
                            "DELETE FROM lessons WHERE location_code = ?1 AND lesson_date = ?2",
                            params![location.as_str(), fmt_date(*date)],
                        )
                        .map_err(write_err)?,
                };
                tx.commit().map_err(write_err)?;
                Ok(removed)
            })
            .await
    }

    async fn query(
        &self,
        location: &LocationCode,
        date: NaiveDate,
    ) -> Result<Vec<LessonRecord>, StoreError> {
        let location = location.clone();
        self.db
            .call(move |conn| {
                select_lessons(
                    conn,
                    "location_code = ?1 AND lesson_date = ?2",
                    &[&location.as_str(), &fmt_date(date)],
                )
            })
            .await
    }

    async fn query_all(&self) -> Result<Vec<LessonRecord>, StoreError> {
        self.db.call(|conn| select_lessons(conn, "1 = 1", &[])).await
    }

    async fn stats(&self) -> Result<LessonStats, StoreError> {
        self.db
            .call(|conn| {
                let (total, locations, lo, hi) = conn
                    .query_row(
                        "SELECT COUNT(*), COUNT(DISTINCT location_code), MIN(lesson_date), MAX(lesson_date)
                         FROM lessons",
                        [],
                        |row| {
                            Ok((
                                row.get::<_, i64>(0)?,
                                row.get::<_, i64>(1)?,
                                row.get::<_, Option<String>>(2)?,
                                row.get::<_, Option<String>>(3)?,
                            ))
                        },
                    )
                    .map_err(read_err)?;

                let date_range = match (lo, hi) {
                    (Some(lo), Some(hi)) => {
                        Some((parse_date("min_date", &lo)?, parse_date("max_date", &hi)?))
                    }
                    _ => None,
                };
                Ok(LessonStats {
                    total: non_negative("total", total)?,
                    location_count: non_negative("location_count", locations)?,
                    date_range,
                })
            })
            .await
    }
}
