use chrono::{DateTime, Datelike, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Listings return at most this many of the newest records.
pub const RECENT_RECORDS_LIMIT: usize = 50;

/// Status written for every recognised arrival.
pub const STATUS_PRESENT: &str = "present";

/// A registered person. The descriptor is never part of this view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: String,
    pub name: String,
    pub class: String,
    pub registered_at: DateTime<Local>,
}

/// Display-safe projection of a person, looked up only after a match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonInfo {
    pub name: String,
    pub class: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: i64,
    pub person_id: String,
    pub person_name: String,
    pub person_class: String,
    pub confidence: f32,
    pub status: String,
    pub is_late: bool,
    pub late_count: u32,
    pub absent_count: u32,
    pub created_at: DateTime<Local>,
    /// Local calendar day of `created_at`.
    pub day: NaiveDate,
}

/// Roster entry for a person whose late count passed the escalation threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LateComer {
    pub name: String,
    pub class: String,
    pub total_late_count: u32,
}

/// Search/date filter applied to record listings and exports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFilter {
    /// Case-insensitive substring of the name or the class.
    pub search: Option<String>,
    pub date: Option<NaiveDate>,
}

impl RecordFilter {
    /// Build a filter from the loosely-typed form used over IPC, where an
    /// empty string means "not set".
    pub fn from_parts(search: &str, date: &str) -> Result<Self, chrono::ParseError> {
        let search = Some(search.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let date = match date.trim() {
            "" => None,
            d => Some(NaiveDate::parse_from_str(d, "%Y-%m-%d")?),
        };
        Ok(Self { search, date })
    }

    /// `search` as a SQL `LIKE` pattern matching it anywhere. Wildcards in
    /// the search text are escaped with a backslash.
    pub fn like_pattern(&self) -> Option<String> {
        self.search.as_deref().map(|search| {
            let mut pattern = String::with_capacity(search.len() + 2);
            pattern.push('%');
            for c in search.chars() {
                if matches!(c, '%' | '_' | '\\') {
                    pattern.push('\\');
                }
                pattern.push(c);
            }
            pattern.push('%');
            pattern
        })
    }
}

/// Summary figures shown alongside the records table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecordStats {
    pub total_records: usize,
    pub today_records: usize,
    pub unique_people: usize,
    /// Total records divided by the day of the month, rounded.
    pub average_per_day: u64,
}

impl RecordStats {
    pub fn compute(records: &[AttendanceRecord], today: NaiveDate) -> Self {
        let today_records = records.iter().filter(|r| r.day == today).count();
        let unique_people = records
            .iter()
            .map(|r| r.person_name.as_str())
            .collect::<HashSet<_>>()
            .len();
        let days = today.day().max(1) as f64;
        Self {
            total_records: records.len(),
            today_records,
            unique_people,
            average_per_day: (records.len() as f64 / days).round() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(id: i64, name: &str, class: &str, day: NaiveDate) -> AttendanceRecord {
        let created_at = Local
            .from_local_datetime(&day.and_hms_opt(8, 0, 0).unwrap())
            .single()
            .unwrap();
        AttendanceRecord {
            id,
            person_id: format!("p-{name}"),
            person_name: name.into(),
            person_class: class.into(),
            confidence: 0.8,
            status: STATUS_PRESENT.into(),
            is_late: false,
            late_count: 0,
            absent_count: 0,
            created_at,
            day,
        }
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_like_pattern_escapes_wildcards() {
        assert_eq!(RecordFilter::default().like_pattern(), None);

        let f = RecordFilter { search: Some("10-b".into()), date: None };
        assert_eq!(f.like_pattern().as_deref(), Some("%10-b%"));

        let f = RecordFilter { search: Some(r"50%_a\b".into()), date: None };
        assert_eq!(f.like_pattern().as_deref(), Some(r"%50\%\_a\\b%"));
    }

    #[test]
    fn test_from_parts() {
        let f = RecordFilter::from_parts("  ", "").unwrap();
        assert_eq!(f, RecordFilter::default());

        let f = RecordFilter::from_parts("asha", "2026-03-02").unwrap();
        assert_eq!(f.search.as_deref(), Some("asha"));
        assert_eq!(f.date, Some(d(2026, 3, 2)));

        assert!(RecordFilter::from_parts("", "03/02/2026").is_err());
    }

    #[test]
    fn test_stats() {
        let today = d(2026, 3, 4);
        let records = vec![
            record(1, "Asha", "10-B", today),
            record(2, "Omar", "10-B", today),
            record(3, "Asha", "10-B", d(2026, 3, 3)),
            record(4, "Lin", "9-A", d(2026, 3, 1)),
            record(5, "Lin", "9-A", d(2026, 3, 2)),
            record(6, "Omar", "10-B", d(2026, 3, 2)),
        ];
        let stats = RecordStats::compute(&records, today);
        assert_eq!(stats.total_records, 6);
        assert_eq!(stats.today_records, 2);
        assert_eq!(stats.unique_people, 3);
        // 6 records / 4 days = 1.5 -> 2
        assert_eq!(stats.average_per_day, 2);
    }
}
