//! Spreadsheet export of attendance records, one worksheet per class.

use chrono::NaiveDate;
use rollcall_core::AttendanceRecord;
use rust_xlsxwriter::{Color, Format, Workbook, XlsxError};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

const UNASSIGNED_CLASS: &str = "Unassigned";
const MAX_SHEET_NAME: usize = 31;
const HEADER_FILL: u32 = 0x4472C4;
const LATE_FILL: u32 = 0xFFFF00;

pub const COLUMNS: [&str; 8] = [
    "Student Name",
    "Date",
    "Time",
    "Status",
    "Late Status",
    "Total Late Count",
    "Absent Count",
    "Confidence",
];

const COLUMN_WIDTHS: [f64; 8] = [24.0, 12.0, 10.0, 10.0, 12.0, 16.0, 13.0, 12.0];

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("no records to export")]
    NoRecords,
    #[error("failed to write spreadsheet: {0}")]
    Xlsx(#[from] XlsxError),
}

/// `attendance_records_YYYY-MM-DD.xlsx`
pub fn default_file_name(today: NaiveDate) -> PathBuf {
    PathBuf::from(format!("attendance_records_{}.xlsx", today.format("%Y-%m-%d")))
}

/// Records grouped by class in first-seen order, keeping input order
/// within each group. An empty class is grouped as "Unassigned".
pub fn group_by_class(records: &[AttendanceRecord]) -> Vec<(String, Vec<&AttendanceRecord>)> {
    let mut groups: Vec<(String, Vec<&AttendanceRecord>)> = Vec::new();
    for record in records {
        let class = match record.person_class.trim() {
            "" => UNASSIGNED_CLASS,
            c => c,
        };
        match groups.iter_mut().find(|(name, _)| name == class) {
            Some((_, members)) => members.push(record),
            None => groups.push((class.to_string(), vec![record])),
        }
    }
    groups
}

/// Make a class name usable as a worksheet name, unique among `taken`.
pub fn sheet_name(class: &str, taken: &mut HashSet<String>) -> String {
    let cleaned: String = class
        .chars()
        .map(|c| match c {
            '[' | ']' | ':' | '*' | '?' | '/' | '\\' => '_',
            c => c,
        })
        .collect();
    // Excel rejects names that start or end with an apostrophe.
    let cleaned = cleaned.trim_matches('\'').trim();
    let base: String = if cleaned.is_empty() {
        UNASSIGNED_CLASS.to_string()
    } else {
        cleaned.chars().take(MAX_SHEET_NAME).collect()
    };

    let mut candidate = base.clone();
    let mut n = 2;
    // sheet names compare case-insensitively
    while taken.contains(&candidate.to_lowercase()) {
        let suffix = format!(" ({n})");
        let keep = MAX_SHEET_NAME - suffix.chars().count();
        candidate = format!("{}{suffix}", base.chars().take(keep).collect::<String>());
        n += 1;
    }
    taken.insert(candidate.to_lowercase());
    candidate
}

/// One spreadsheet row, in `COLUMNS` order.
pub fn row_values(record: &AttendanceRecord) -> [String; 8] {
    [
        record.person_name.clone(),
        record.day.format("%Y-%m-%d").to_string(),
        record.created_at.format("%H:%M:%S").to_string(),
        capitalize(&record.status),
        late_label(record.is_late).to_string(),
        record.late_count.to_string(),
        record.absent_count.to_string(),
        format!("{:.1}%", record.confidence * 100.0),
    ]
}

fn late_label(is_late: bool) -> &'static str {
    if is_late {
        "Late"
    } else {
        "On Time"
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Index of the "Late Status" column.
const LATE_STATUS_COL: usize = 4;

/// One worksheet to be written: its final name and its rows in order.
#[derive(Debug, Clone, PartialEq)]
pub struct SheetPlan {
    pub name: String,
    pub rows: Vec<PlannedRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedRow {
    pub values: [String; 8],
    /// The late-status cell gets the highlight fill.
    pub late: bool,
}

/// Lay records out into worksheets without touching the spreadsheet writer.
pub fn plan_sheets(records: &[AttendanceRecord]) -> Vec<SheetPlan> {
    let mut taken = HashSet::new();
    group_by_class(records)
        .into_iter()
        .map(|(class, members)| SheetPlan {
            name: sheet_name(&class, &mut taken),
            rows: members
                .into_iter()
                .map(|record| PlannedRow {
                    values: row_values(record),
                    late: record.is_late,
                })
                .collect(),
        })
        .collect()
}

/// Build the workbook in memory.
pub fn build_workbook(records: &[AttendanceRecord]) -> Result<Workbook, ExportError> {
    if records.is_empty() {
        return Err(ExportError::NoRecords);
    }

    let header = Format::new()
        .set_bold()
        .set_font_color(Color::White)
        .set_background_color(Color::RGB(HEADER_FILL));
    let late = Format::new().set_background_color(Color::RGB(LATE_FILL));

    let mut workbook = Workbook::new();
    for plan in plan_sheets(records) {
        let sheet = workbook.add_worksheet();
        sheet.set_name(&plan.name)?;

        for (col, (title, width)) in COLUMNS.iter().zip(COLUMN_WIDTHS).enumerate() {
            let col = col as u16;
            sheet.write_string_with_format(0, col, *title, &header)?;
            sheet.set_column_width(col, width)?;
        }

        for (i, planned) in plan.rows.iter().enumerate() {
            let row = i as u32 + 1;
            for (col, value) in planned.values.iter().enumerate() {
                if col == LATE_STATUS_COL && planned.late {
                    sheet.write_string_with_format(row, col as u16, value, &late)?;
                } else {
                    sheet.write_string(row, col as u16, value)?;
                }
            }
        }
        tracing::debug!(sheet = %plan.name, rows = plan.rows.len(), "worksheet written");
    }

    Ok(workbook)
}

/// Write `records` to an .xlsx file at `path`.
pub fn write_xlsx(records: &[AttendanceRecord], path: &Path) -> Result<(), ExportError> {
    let mut workbook = build_workbook(records)?;
    workbook.save(path)?;
    tracing::info!(path = %path.display(), records = records.len(), "spreadsheet saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Local, TimeZone};

    fn record(name: &str, class: &str, is_late: bool, confidence: f32) -> AttendanceRecord {
        let created_at = Local.with_ymd_and_hms(2026, 3, 2, 8, 45, 7).single().unwrap();
        AttendanceRecord {
            id: 1,
            person_id: format!("id-{name}"),
            person_name: name.into(),
            person_class: class.into(),
            confidence,
            status: "present".into(),
            is_late,
            late_count: u32::from(is_late),
            absent_count: 0,
            created_at,
            day: created_at.date_naive(),
        }
    }

    #[test]
    fn test_groups_in_first_seen_order() {
        let records = vec![
            record("Asha", "10-B", false, 0.9),
            record("Omar", "9-A", true, 0.8),
            record("Lin", "10-B", true, 0.7),
            record("Kofi", "  ", false, 0.7),
        ];
        let groups = group_by_class(&records);
        let names: Vec<_> = groups.iter().map(|(c, m)| (c.as_str(), m.len())).collect();
        assert_eq!(names, [("10-B", 2), ("9-A", 1), ("Unassigned", 1)]);
        assert_eq!(groups[0].1[1].person_name, "Lin");
    }

    #[test]
    fn test_sheet_names_are_sanitized_and_unique() {
        let mut taken = HashSet::new();
        assert_eq!(sheet_name("10/B [am]", &mut taken), "10_B _am_");
        assert_eq!(sheet_name("10/b [AM]", &mut taken), "10_b _AM_ (2)");

        let long = "A".repeat(40);
        let first = sheet_name(&long, &mut taken);
        let second = sheet_name(&long, &mut taken);
        assert_eq!(first.chars().count(), 31);
        assert_eq!(second.chars().count(), 31);
        assert!(second.ends_with(" (2)"));
        assert_eq!(sheet_name("'''", &mut taken), "Unassigned");
    }

    #[test]
    fn test_row_values() {
        let row = row_values(&record("Omar", "9-A", true, 0.8234));
        assert_eq!(
            row,
            ["Omar", "2026-03-02", "08:45:07", "Present", "Late", "1", "0", "82.3%"]
                .map(String::from)
        );
        assert_eq!(row_values(&record("Asha", "9-A", false, 1.0))[4], "On Time");
    }

    #[test]
    fn test_two_classes_make_two_sheets() {
        let records = vec![
            record("Asha", "10-B", false, 0.9),
            record("Omar", "9-A", true, 0.8),
            record("Lin", "10-B", true, 0.7),
        ];

        let plans = plan_sheets(&records);
        assert_eq!(plans.len(), 2);

        assert_eq!(plans[0].name, "10-B");
        let names: Vec<_> = plans[0].rows.iter().map(|r| r.values[0].as_str()).collect();
        assert_eq!(names, ["Asha", "Lin"]);
        assert_eq!(
            plans[0].rows.iter().map(|r| r.late).collect::<Vec<_>>(),
            [false, true]
        );
        assert_eq!(plans[0].rows[1].values[LATE_STATUS_COL], "Late");

        assert_eq!(plans[1].name, "9-A");
        assert_eq!(plans[1].rows.len(), 1);
        assert_eq!(plans[1].rows[0].values[0], "Omar");
        assert!(plans[1].rows[0].late);

        let mut workbook = build_workbook(&records).unwrap();
        assert!(workbook.worksheet_from_name("10-B").is_ok());
        assert!(workbook.worksheet_from_name("9-A").is_ok());
        assert!(workbook.worksheet_from_index(2).is_err());
    }

    #[test]
    fn test_empty_export_is_refused() {
        assert!(matches!(build_workbook(&[]), Err(ExportError::NoRecords)));
    }

    #[test]
    fn test_write_xlsx_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(default_file_name(NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()));
        assert!(path.ends_with("attendance_records_2026-03-02.xlsx"));

        let records = vec![
            record("Asha", "10-B", false, 0.9),
            record("Omar", "9-A", true, 0.8),
            record("Lin", "10-B", true, 0.7),
        ];
        write_xlsx(&records, &path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..2], b"PK");
    }
}
