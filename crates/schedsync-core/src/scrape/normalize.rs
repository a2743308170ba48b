//! RawSlot -> LessonRecord
//!
//! 席数の扱い:
//! - ステータス文言から数が読めれば正確な値（`seats_exact = true`）
//! - 満席系の文言は 0
//! - それ以外はフラグだけ。空きありは仮の 5 席、総数は名目上の 20 席（`seats_exact = false`）

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use regex::Regex;

use super::parse::RawSlot;
use crate::domain::{LessonRecord, LocationCode};

/// Seats reported for an "available" slot when the page gives no count.
pub const PLACEHOLDER_AVAILABLE_SEATS: u32 = 5;

/// Capacity reported when the page does not expose one.
pub const NOMINAL_TOTAL_SEATS: u32 = 20;

static SEATS_LEFT: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"残り\s*(\d+)\s*席",
        r"あと\s*(\d+)\s*席",
        r"残\s*(\d+)",
        r"(?i)(\d+)\s*seats?\s*left",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static regex"))
    .collect()
});

static FULL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)満席|キャンセル待ち|\bfull\b|sold\s*out").expect("static regex")
});

static CLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,2})\s*[:：]\s*(\d{2})").expect("static regex"));

/// What the status text says about seats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeatSignal {
    Exact(u32),
    Full,
}

/// Full-width digits (`２`) -> ASCII.
fn fold_digits(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '０'..='９' => char::from_u32(c as u32 - '０' as u32 + '0' as u32).unwrap_or(c),
            _ => c,
        })
        .collect()
}

pub fn classify_status(text: &str) -> Option<SeatSignal> {
    let text = fold_digits(text);
    if FULL.is_match(&text) {
        return Some(SeatSignal::Full);
    }
    SEATS_LEFT.iter().find_map(|re| {
        re.captures(&text)
            .and_then(|c| c[1].parse::<u32>().ok())
            .map(SeatSignal::Exact)
    })
}

/// `10:00`, `10:00 - 10:45`, `10：00〜10：45`
pub fn parse_time_range(text: &str) -> Option<(NaiveTime, Option<NaiveTime>)> {
    let text = fold_digits(text);
    let mut times = CLOCK.captures_iter(&text).filter_map(|c| {
        let h = c[1].parse().ok()?;
        let m = c[2].parse().ok()?;
        NaiveTime::from_hms_opt(h, m, 0)
    });
    let start = times.next()?;
    Some((start, times.next()))
}

/// Seat fields: (is_available, available, total, exact)
fn seats(slot: &RawSlot) -> (bool, u32, u32, bool) {
    match slot.status_text.as_deref().and_then(classify_status) {
        Some(SeatSignal::Exact(n)) => (n > 0, n, NOMINAL_TOTAL_SEATS.max(n), true),
        Some(SeatSignal::Full) => (false, 0, NOMINAL_TOTAL_SEATS, true),
        None if slot.flag_available => (true, PLACEHOLDER_AVAILABLE_SEATS, NOMINAL_TOTAL_SEATS, false),
        None => (false, 0, NOMINAL_TOTAL_SEATS, false),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub lessons: Vec<LessonRecord>,
    /// Slots dropped for missing a time or program label.
    pub quarantined: usize,
}

pub fn normalize(
    location: &LocationCode,
    date: NaiveDate,
    slots: Vec<RawSlot>,
    now: DateTime<Utc>,
) -> Normalized {
    let mut lessons: Vec<LessonRecord> = Vec::with_capacity(slots.len());
    let mut quarantined = 0;

    for slot in slots {
        let range = slot.time_text.as_deref().and_then(parse_time_range);
        let (Some((start_time, end_time)), Some(program)) = (range, slot.program.clone()) else {
            tracing::warn!(
                %location,
                %date,
                time = ?slot.time_text,
                program = ?slot.program,
                "quarantined malformed slot"
            );
            quarantined += 1;
            continue;
        };

        let (is_available, available_seats, total_seats, seats_exact) = seats(&slot);
        let record = LessonRecord {
            location_code: location.clone(),
            date,
            start_time,
            end_time,
            lesson_name: program,
            instructor: slot.instructor.unwrap_or_default(),
            is_available,
            available_seats,
            total_seats,
            seats_exact,
            status_text: slot.status_text,
            background_color: slot.background_color,
            text_color: slot.text_color,
            last_updated: now,
        };

        // 同じ枠が二重に描画されていたら後勝ち
        match lessons.iter_mut().find(|l| l.lesson_id() == record.lesson_id()) {
            Some(existing) => *existing = record,
            None => lessons.push(record),
        }
    }

    Normalized { lessons, quarantined }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    #[rstest]
    #[case("残り2席", Some(SeatSignal::Exact(2)))]
    #[case("残り２席", Some(SeatSignal::Exact(2)))]
    #[case("残2", Some(SeatSignal::Exact(2)))]
    #[case("あと 3 席", Some(SeatSignal::Exact(3)))]
    #[case("4 seats left", Some(SeatSignal::Exact(4)))]
    #[case("1 Seat Left", Some(SeatSignal::Exact(1)))]
    #[case("満席", Some(SeatSignal::Full))]
    #[case("キャンセル待ち", Some(SeatSignal::Full))]
    #[case("FULL", Some(SeatSignal::Full))]
    #[case("Sold out", Some(SeatSignal::Full))]
    #[case("予約する", None)]
    #[case("", None)]
    fn status_text_classification(#[case] text: &str, #[case] expected: Option<SeatSignal>) {
        assert_eq!(classify_status(text), expected);
    }

    #[rstest]
    #[case("10:00", Some((10, 0, None)))]
    #[case("7:30 - 8:15", Some((7, 30, Some((8, 15)))))]
    #[case("１９：００〜１９：４５", Some((19, 0, Some((19, 45)))))]
    #[case("25:00", None)]
    #[case("TBD", None)]
    fn time_ranges(#[case] text: &str, #[case] expected: Option<(u32, u32, Option<(u32, u32)>)>) {
        let expected = expected.map(|(h, m, end)| {
            (
                NaiveTime::from_hms_opt(h, m, 0).unwrap(),
                end.map(|(h, m)| NaiveTime::from_hms_opt(h, m, 0).unwrap()),
            )
        });
        assert_eq!(parse_time_range(text), expected);
    }

    fn slot(time: &str, program: &str, status: Option<&str>, flag: bool) -> RawSlot {
        RawSlot {
            time_text: Some(time.to_string()),
            program: Some(program.to_string()),
            instructor: Some("Aki".to_string()),
            status_text: status.map(str::to_string),
            flag_available: flag,
            ..RawSlot::default()
        }
    }

    fn run(slots: Vec<RawSlot>) -> Normalized {
        normalize(
            &LocationCode::new("ginza"),
            NaiveDate::from_ymd_opt(2026, 10, 18).unwrap(),
            slots,
            Utc.with_ymd_and_hms(2026, 10, 18, 1, 0, 0).unwrap(),
        )
    }

    #[test]
    fn seat_rules() {
        let out = run(vec![
            slot("10:00", "A", Some("残り2席"), true),
            slot("11:00", "B", Some("満席"), true),
            slot("12:00", "C", None, true),
            slot("13:00", "D", None, false),
            slot("14:00", "E", Some("予約受付中"), false),
        ]);
        let seats: Vec<_> = out
            .lessons
            .iter()
            .map(|l| (l.is_available, l.available_seats, l.total_seats, l.seats_exact))
            .collect();
        assert_eq!(
            seats,
            vec![
                (true, 2, 20, true),
                (false, 0, 20, true),
                (true, PLACEHOLDER_AVAILABLE_SEATS, NOMINAL_TOTAL_SEATS, false),
                (false, 0, 20, false),
                (false, 0, 20, false),
            ]
        );
    }

    #[test]
    fn malformed_slots_are_quarantined() {
        let mut no_time = slot("", "A", None, true);
        no_time.time_text = None;
        let mut no_program = slot("11:00", "", None, true);
        no_program.program = None;

        let out = run(vec![no_time, no_program, slot("12:00", "C", None, true)]);
        assert_eq!(out.quarantined, 2);
        assert_eq!(out.lessons.len(), 1);
        assert_eq!(out.lessons[0].lesson_id(), "2026-10-18#12:00#C");
    }

    #[test]
    fn duplicate_slots_collapse_to_one_record() {
        let out = run(vec![
            slot("10:00", "A", Some("残り3席"), true),
            slot("10:00", "A", Some("残り1席"), true),
        ]);
        assert_eq!(out.lessons.len(), 1);
        assert_eq!(out.lessons[0].available_seats, 1);
    }
}
