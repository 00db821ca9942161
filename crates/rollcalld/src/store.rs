//! SQLite persistence for people, attendance records and the late-comers roster.
//!
//! All statements run on the `tokio-rusqlite` background connection. Every
//! attendance write is one IMMEDIATE transaction: the prior late count is
//! read, the (person, day) row is upserted and the roster is updated
//! together, so concurrent writers cannot race on the count.

use chrono::{DateTime, Local, NaiveDate, SecondsFormat, Utc};
use rollcall_core::records::STATUS_PRESENT;
use rollcall_core::reconcile::{self, DayDecision};
use rollcall_core::{
    AttendanceRecord, Descriptor, LateComer, LatePolicy, Person, PersonInfo, RecordFilter,
};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use thiserror::Error;

const SCHEMA_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS people (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    class TEXT NOT NULL,
    descriptor_json TEXT NOT NULL,
    registered_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS attendance_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    student_id TEXT NOT NULL,
    student_name TEXT NOT NULL,
    student_class TEXT NOT NULL,
    confidence REAL NOT NULL,
    status TEXT NOT NULL DEFAULT 'present',
    is_late INTEGER NOT NULL DEFAULT 0,
    late_count INTEGER NOT NULL DEFAULT 0,
    absent_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,   -- RFC 3339, UTC
    day TEXT NOT NULL           -- local calendar day, YYYY-MM-DD
);

CREATE TABLE IF NOT EXISTS late_comers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    student_name TEXT NOT NULL,
    student_class TEXT NOT NULL,
    total_late_count INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

// Created after duplicate collapse so databases written before the
// constraint existed can still be opened.
const SCHEMA_INDEXES: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_attendance_person_day
    ON attendance_records(student_id, day);
CREATE INDEX IF NOT EXISTS idx_attendance_created ON attendance_records(created_at);
CREATE UNIQUE INDEX IF NOT EXISTS idx_late_comers_person
    ON late_comers(student_name, student_class);
"#;

const RECORD_COLUMNS: &str = "id, student_id, student_name, student_class, confidence, status, \
     is_late, late_count, absent_count, created_at, day";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("failed to create database directory: {0}")]
    Io(#[from] std::io::Error),
}

/// A recognised arrival about to be written.
#[derive(Debug, Clone)]
pub struct NewAttendance {
    pub person_id: String,
    pub info: PersonInfo,
    pub confidence: f32,
    pub at: DateTime<Local>,
}

/// What a call to [`Store::record_attendance`] did.
#[derive(Debug, Clone)]
pub struct RecordOutcome {
    pub decision: DayDecision,
    /// The row as written; `None` when today's row was kept as is.
    pub record: Option<AttendanceRecord>,
    /// Whether the late-comers roster was upserted.
    pub escalated: bool,
}

/// Handle to the attendance database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    conn: tokio_rusqlite::Connection,
}

impl Store {
    /// Open (creating if needed) the database at `path`.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = tokio_rusqlite::Connection::open(path).await?;
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = tokio_rusqlite::Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: tokio_rusqlite::Connection) -> Result<Self, StoreError> {
        let collapsed = conn
            .call(|conn| {
                conn.execute_batch(SCHEMA_TABLES)?;
                let collapsed = collapse_duplicates(conn)?;
                conn.execute_batch(SCHEMA_INDEXES)?;
                Ok(collapsed)
            })
            .await?;
        if collapsed > 0 {
            tracing::warn!(removed = collapsed, "collapsed same-day duplicate attendance rows");
        }
        Ok(Self { conn })
    }

    // ---------------------------------------------------------------------
    // People
    // ---------------------------------------------------------------------

    pub async fn add_person(
        &self,
        name: &str,
        class: &str,
        descriptor: &Descriptor,
    ) -> Result<Person, StoreError> {
        let person = Person {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            class: class.to_string(),
            registered_at: Local::now(),
        };
        let row = person.clone();
        let descriptor_json = descriptor.to_json();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO people (id, name, class, descriptor_json, registered_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        row.id,
                        row.name,
                        row.class,
                        descriptor_json,
                        to_db_time(&row.registered_at)
                    ],
                )?;
                Ok(())
            })
            .await?;
        tracing::info!(person_id = %person.id, class = %person.class, "person registered");
        Ok(person)
    }

    /// Replace a person's descriptor. Returns false if the id is unknown.
    pub async fn replace_descriptor(
        &self,
        person_id: &str,
        descriptor: &Descriptor,
    ) -> Result<bool, StoreError> {
        let id = person_id.to_string();
        let descriptor_json = descriptor.to_json();
        let changed = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE people SET descriptor_json = ?1 WHERE id = ?2",
                    params![descriptor_json, id],
                )?)
            })
            .await?;
        Ok(changed > 0)
    }

    /// Remove a person. Their attendance history is kept.
    pub async fn remove_person(&self, person_id: &str) -> Result<bool, StoreError> {
        let id = person_id.to_string();
        let changed = self
            .conn
            .call(move |conn| Ok(conn.execute("DELETE FROM people WHERE id = ?1", [id])?))
            .await?;
        Ok(changed > 0)
    }

    pub async fn list_people(&self) -> Result<Vec<Person>, StoreError> {
        let people = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, class, registered_at FROM people ORDER BY class, name",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(Person {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        class: row.get(2)?,
                        registered_at: from_db_time(row, 3)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;
        Ok(people)
    }

    /// Recognition projection: id and stored descriptor text only.
    pub async fn recognition_gallery(&self) -> Result<Vec<(String, String)>, StoreError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT id, descriptor_json FROM people")?;
                let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;
        Ok(rows)
    }

    /// Display projection for one matched id: name and class only.
    pub async fn basic_info(&self, person_id: &str) -> Result<Option<PersonInfo>, StoreError> {
        let id = person_id.to_string();
        let info = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT name, class FROM people WHERE id = ?1",
                        [id],
                        |row| {
                            Ok(PersonInfo {
                                name: row.get(0)?,
                                class: row.get(1)?,
                            })
                        },
                    )
                    .optional()?)
            })
            .await?;
        Ok(info)
    }

    // ---------------------------------------------------------------------
    // Attendance
    // ---------------------------------------------------------------------

    /// Write a recognised arrival, keeping one row per person per day.
    pub async fn record_attendance(
        &self,
        new: NewAttendance,
        policy: &LatePolicy,
    ) -> Result<RecordOutcome, StoreError> {
        let policy = *policy;
        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let day = new.at.date_naive();
                let day_text = day.format("%Y-%m-%d").to_string();

                let existing: Option<(i64, f64)> = tx
                    .query_row(
                        "SELECT id, confidence FROM attendance_records \
                         WHERE student_id = ?1 AND day = ?2",
                        params![new.person_id, day_text],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;

                let decision =
                    DayDecision::decide(existing.map(|(_, c)| c as f32), new.confidence);
                if !decision.writes() {
                    tx.commit()?;
                    return Ok(RecordOutcome {
                        decision,
                        record: None,
                        escalated: false,
                    });
                }

                // Counts carry forward from the last day before this one.
                let (prior_late, prior_absent): (u32, u32) = tx
                    .query_row(
                        "SELECT late_count, absent_count FROM attendance_records \
                         WHERE student_id = ?1 AND day < ?2 \
                         ORDER BY day DESC, created_at DESC LIMIT 1",
                        params![new.person_id, day_text],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?
                    .unwrap_or((0, 0));

                let is_late = policy.is_late(new.at.time());
                let late_count = policy.next_late_count(prior_late, is_late);
                let created_at = to_db_time(&new.at);

                let id = match existing {
                    Some((id, _)) => {
                        tx.execute(
                            "UPDATE attendance_records SET student_name = ?1, student_class = ?2, \
                             confidence = ?3, status = ?4, is_late = ?5, late_count = ?6, \
                             absent_count = ?7, created_at = ?8 WHERE id = ?9",
                            params![
                                new.info.name,
                                new.info.class,
                                new.confidence as f64,
                                STATUS_PRESENT,
                                is_late,
                                late_count,
                                prior_absent,
                                created_at,
                                id
                            ],
                        )?;
                        id
                    }
                    None => {
                        tx.execute(
                            "INSERT INTO attendance_records (student_id, student_name, \
                             student_class, confidence, status, is_late, late_count, \
                             absent_count, created_at, day) \
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                            params![
                                new.person_id,
                                new.info.name,
                                new.info.class,
                                new.confidence as f64,
                                STATUS_PRESENT,
                                is_late,
                                late_count,
                                prior_absent,
                                created_at,
                                day_text
                            ],
                        )?;
                        tx.last_insert_rowid()
                    }
                };

                let escalated = policy.escalates(late_count);
                if escalated {
                    tx.execute(
                        "INSERT INTO late_comers \
                         (student_name, student_class, total_late_count, updated_at) \
                         VALUES (?1, ?2, ?3, ?4) \
                         ON CONFLICT(student_name, student_class) \
                         DO UPDATE SET total_late_count = excluded.total_late_count, \
                                       updated_at = excluded.updated_at",
                        params![new.info.name, new.info.class, late_count, created_at],
                    )?;
                }

                tx.commit()?;

                Ok(RecordOutcome {
                    decision,
                    record: Some(AttendanceRecord {
                        id,
                        person_id: new.person_id,
                        person_name: new.info.name,
                        person_class: new.info.class,
                        confidence: new.confidence,
                        status: STATUS_PRESENT.to_string(),
                        is_late,
                        late_count,
                        absent_count: prior_absent,
                        created_at: new.at,
                        day,
                    }),
                    escalated,
                })
            })
            .await?;
        Ok(outcome)
    }

    /// Records matching `filter`, newest first, at most `limit` if given.
    pub async fn records(
        &self,
        filter: &RecordFilter,
        limit: Option<usize>,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let day = filter.date.map(|d| d.format("%Y-%m-%d").to_string());
        let pattern = filter.like_pattern();
        // a negative LIMIT means no limit
        let limit = limit.map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX));
        let records = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {RECORD_COLUMNS} FROM attendance_records \
                     WHERE (?1 IS NULL OR day = ?1) \
                       AND (?2 IS NULL \
                            OR student_name LIKE ?2 ESCAPE '\\' \
                            OR student_class LIKE ?2 ESCAPE '\\') \
                     ORDER BY created_at DESC, id DESC LIMIT ?3"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![day, pattern, limit], row_to_record)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;
        Ok(records)
    }

    /// Late-comers roster, highest count first.
    pub async fn late_comers(&self) -> Result<Vec<LateComer>, StoreError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT student_name, student_class, total_late_count FROM late_comers \
                     ORDER BY total_late_count DESC, student_name",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(LateComer {
                        name: row.get(0)?,
                        class: row.get(1)?,
                        total_late_count: row.get(2)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;
        Ok(rows)
    }

    /// Delete every attendance record. The late-comers roster is kept.
    pub async fn clear_records(&self) -> Result<usize, StoreError> {
        let removed = self
            .conn
            .call(|conn| Ok(conn.execute("DELETE FROM attendance_records", [])?))
            .await?;
        tracing::warn!(removed, "attendance records cleared");
        Ok(removed)
    }
}

/// Collapse any same-day duplicates for a person down to the row with the
/// highest confidence. Returns the number of rows deleted.
fn collapse_duplicates(conn: &mut rusqlite::Connection) -> rusqlite::Result<usize> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let groups: Vec<(String, String)> = {
        let mut stmt = tx.prepare(
            "SELECT student_id, day FROM attendance_records \
             GROUP BY student_id, day HAVING COUNT(*) > 1",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<Result<Vec<_>, _>>()?
    };

    let mut removed = 0;
    for (student_id, day) in groups {
        let rows: Vec<(i64, f64)> = {
            let mut stmt = tx.prepare(
                "SELECT id, confidence FROM attendance_records \
                 WHERE student_id = ?1 AND day = ?2 ORDER BY created_at, id",
            )?;
            let rows =
                stmt.query_map(params![student_id, day], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        let confidences: Vec<f32> = rows.iter().map(|(_, c)| *c as f32).collect();
        let Some(keep) = reconcile::survivor(&confidences) else {
            continue;
        };
        for (i, (id, _)) in rows.iter().enumerate() {
            if i != keep {
                removed += tx.execute("DELETE FROM attendance_records WHERE id = ?1", [id])?;
            }
        }
    }
    tx.commit()?;
    Ok(removed)
}

fn to_db_time(t: &DateTime<Local>) -> String {
    t.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn from_db_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Local>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Local))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    let day_text: String = row.get(10)?;
    let day = NaiveDate::parse_from_str(&day_text, "%Y-%m-%d")
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(10, Type::Text, Box::new(e)))?;
    Ok(AttendanceRecord {
        id: row.get(0)?,
        person_id: row.get(1)?,
        person_name: row.get(2)?,
        person_class: row.get(3)?,
        confidence: row.get::<_, f64>(4)? as f32,
        status: row.get(5)?,
        is_late: row.get(6)?,
        late_count: row.get(7)?,
        absent_count: row.get(8)?,
        created_at: from_db_time(row, 9)?,
        day,
    })
}
