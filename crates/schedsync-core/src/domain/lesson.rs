//! Lesson model: the scraped artifact published to downstream readers.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::LocationCode;

/// One lesson slot at a studio.
///
/// Identity is `(location_code, lesson_id)` where `lesson_id` is
/// `"{date}#{HH:MM}#{lesson_name}"`. Writing the same identity twice keeps a
/// single record (latest write wins).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonRecord {
    pub location_code: LocationCode,
    pub date: NaiveDate,
    pub start_time: NaiveTime,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<NaiveTime>,

    pub lesson_name: String,
    pub instructor: String,

    pub is_available: bool,
    pub available_seats: u32,
    pub total_seats: u32,

    /// `false` when the seat numbers are the placeholder values derived from a
    /// bare available/unavailable flag.
    pub seats_exact: bool,

    /// Raw status label as shown on the site (e.g. `残り2席`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_color: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_color: Option<String>,

    pub last_updated: DateTime<Utc>,
}

impl LessonRecord {
    pub fn lesson_id(&self) -> String {
        lesson_id(self.date, self.start_time, &self.lesson_name)
    }
}

pub fn lesson_id(date: NaiveDate, start_time: NaiveTime, lesson_name: &str) -> String {
    format!(
        "{}#{}#{}",
        date.format("%Y-%m-%d"),
        start_time.format("%H:%M"),
        lesson_name
    )
}

/// Which lessons a bulk delete applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LessonScope {
    All,
    Locations(Vec<LocationCode>),
    Day { location: LocationCode, date: NaiveDate },
}

impl LessonScope {
    pub fn contains(&self, location: &LocationCode, date: NaiveDate) -> bool {
        match self {
            LessonScope::All => true,
            LessonScope::Locations(codes) => codes.contains(location),
            LessonScope::Day {
                location: l,
                date: d,
            } => l == location && *d == date,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonStats {
    pub total: usize,
    pub location_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_range: Option<(NaiveDate, NaiveDate)>,
}

impl LessonStats {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a LessonRecord>) -> Self {
        let mut total = 0;
        let mut locations = BTreeSet::new();
        let mut range: Option<(NaiveDate, NaiveDate)> = None;
        for r in records {
            total += 1;
            locations.insert(r.location_code.as_str());
            range = Some(match range {
                None => (r.date, r.date),
                Some((lo, hi)) => (lo.min(r.date), hi.max(r.date)),
            });
        }
        Self {
            total,
            location_count: locations.len(),
            date_range: range,
        }
    }
}

/// A studio known to the location directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationRef {
    pub code: LocationCode,
    pub name: String,
}

impl LocationRef {
    pub fn new(code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            code: LocationCode::new(code),
            name: name.into(),
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::TimeZone;

    pub fn lesson(location: &str, date: NaiveDate, hh: u32, name: &str) -> LessonRecord {
        LessonRecord {
            location_code: LocationCode::new(location),
            date,
            start_time: NaiveTime::from_hms_opt(hh, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(hh, 45, 0),
            lesson_name: name.to_string(),
            instructor: "Aki".to_string(),
            is_available: true,
            available_seats: 3,
            total_seats: 20,
            seats_exact: true,
            status_text: Some("残り3席".to_string()),
            background_color: Some("#ffcc00".to_string()),
            text_color: None,
            last_updated: Utc.with_ymd_and_hms(2026, 10, 18, 0, 0, 0).unwrap(),
        }
    }
}
