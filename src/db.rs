use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;

// ============================================================================
// IDENTITY RECORD
// ============================================================================

/// Where an identity stands between the two feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentityStatus {
    /// Known to the roster feed only
    UnmatchedRoster,

    /// Known to the ratings feed only
    UnmatchedRatings,

    /// Roster identity holding a ratings external id
    Linked,
}

impl IdentityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityStatus::UnmatchedRoster => "unmatched-roster",
            IdentityStatus::UnmatchedRatings => "unmatched-ratings",
            IdentityStatus::Linked => "linked",
        }
    }
}

/// Canonical professor entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub id: i64,

    /// Name as spelled by the roster feed ("HUANG L")
    pub name_roster: Option<String>,

    /// Name as spelled by the ratings feed ("Lei Huang")
    pub name_ratings: Option<String>,

    /// Ratings-feed identifier; at most one identity holds a given value
    pub external_id: Option<i64>,

    pub department: Option<String>,

    /// 0-100, set by whichever pass made the link
    pub match_confidence: Option<f64>,
}

impl IdentityRecord {
    pub fn status(&self) -> IdentityStatus {
        match (self.name_roster.is_some(), self.external_id.is_some()) {
            (true, true) => IdentityStatus::Linked,
            (true, false) => IdentityStatus::UnmatchedRoster,
            (false, _) => IdentityStatus::UnmatchedRatings,
        }
    }
}

const IDENTITY_COLUMNS: &str =
    "id, name_roster, name_ratings, external_id, department, match_confidence";

fn identity_from_row(row: &Row) -> rusqlite::Result<IdentityRecord> {
    Ok(IdentityRecord {
        id: row.get(0)?,
        name_roster: row.get(1)?,
        name_ratings: row.get(2)?,
        external_id: row.get(3)?,
        department: row.get(4)?,
        match_confidence: row.get(5)?,
    })
}

// ============================================================================
// DEPENDENT RECORDS
// ============================================================================

/// One course offering taught by an identity; natural key (course, quarter, year)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeRecord {
    pub id: i64,
    pub professor_id: i64,
    pub course_code: String,
    pub quarter: String,
    pub year: i32,
    pub avg_gpa: Option<f64>,
    pub enrolled: i64,
}

/// Grade row as handed over by the roster feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewGrade {
    pub course_code: String,
    pub quarter: String,
    pub year: i32,
    pub avg_gpa: Option<f64>,
    pub enrolled: i64,
}

/// Aggregate snapshot from the ratings feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingRecord {
    pub id: i64,
    pub professor_id: i64,
    pub overall_quality: Option<f64>,
    pub difficulty: Option<f64>,
    pub would_take_again_pct: Option<f64>,
    pub num_ratings: i64,
    pub fetched_at: DateTime<Utc>,
}

/// Computed per-course score; natural key (course)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub id: i64,
    pub professor_id: i64,
    pub course_code: String,
    pub score: f64,
    pub computed_at: DateTime<Utc>,
}

/// Event for audit trail: every link, merge and collision leaves one
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn open_database(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)
        .with_context(|| format!("Failed to open database: {:?}", db_path))?;
    setup_database(&conn)?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // Dependents are detached explicitly before an identity is deleted;
    // an unreferenced delete must fail rather than cascade.
    conn.pragma_update(None, "foreign_keys", "ON")?;

    // ==========================================================================
    // Identities (one row per canonical professor)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS professors (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name_roster TEXT,
            name_ratings TEXT,
            external_id INTEGER UNIQUE,
            department TEXT,
            match_confidence REAL CHECK (match_confidence BETWEEN 0 AND 100),
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Dependents (each owned by exactly one identity)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            professor_id INTEGER NOT NULL REFERENCES professors(id),
            course_code TEXT NOT NULL,
            quarter TEXT NOT NULL,
            year INTEGER NOT NULL,
            avg_gpa REAL,
            enrolled INTEGER NOT NULL DEFAULT 0,
            UNIQUE (professor_id, course_code, quarter, year)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS rating_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            professor_id INTEGER NOT NULL REFERENCES professors(id),
            overall_quality REAL,
            difficulty REAL,
            would_take_again_pct REAL,
            num_ratings INTEGER NOT NULL DEFAULT 0,
            fetched_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS score_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            professor_id INTEGER NOT NULL REFERENCES professors(id),
            course_code TEXT NOT NULL,
            score REAL NOT NULL,
            computed_at TEXT NOT NULL,
            UNIQUE (professor_id, course_code)
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_professors_roster_name ON professors(name_roster)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_natural_key
         ON grade_records(professor_id, course_code, quarter, year)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_year ON grade_records(year)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_ratings_professor ON rating_records(professor_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// IDENTITY QUERIES
// ============================================================================

pub fn get_identity(conn: &Connection, id: i64) -> Result<Option<IdentityRecord>> {
    let sql = format!("SELECT {} FROM professors WHERE id = ?1", IDENTITY_COLUMNS);
    let identity = conn
        .query_row(&sql, [id], identity_from_row)
        .optional()
        .with_context(|| format!("Failed to load identity {}", id))?;
    Ok(identity)
}

pub fn find_by_external_id(conn: &Connection, external_id: i64) -> Result<Option<IdentityRecord>> {
    let sql = format!("SELECT {} FROM professors WHERE external_id = ?1", IDENTITY_COLUMNS);
    let identity = conn.query_row(&sql, [external_id], identity_from_row).optional()?;
    Ok(identity)
}

pub fn find_by_roster_name(conn: &Connection, name_roster: &str) -> Result<Option<IdentityRecord>> {
    let sql = format!(
        "SELECT {} FROM professors WHERE name_roster = ?1 ORDER BY id LIMIT 1",
        IDENTITY_COLUMNS
    );
    let identity = conn.query_row(&sql, [name_roster], identity_from_row).optional()?;
    Ok(identity)
}

fn query_identities(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Vec<IdentityRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let identities = stmt
        .query_map(params, identity_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(identities)
}

/// Roster identities without a ratings link that taught in `min_year` or later
pub fn get_unmatched_roster(conn: &Connection, min_year: i32) -> Result<Vec<IdentityRecord>> {
    let sql = format!(
        "SELECT {} FROM professors p
         WHERE p.name_roster IS NOT NULL
           AND p.external_id IS NULL
           AND EXISTS (
               SELECT 1 FROM grade_records g
               WHERE g.professor_id = p.id AND g.year >= ?1
           )
         ORDER BY p.id",
        IDENTITY_COLUMNS
    );
    query_identities(conn, &sql, [min_year]).context("Failed to load unmatched roster identities")
}

/// Ratings-only identities not yet claimed by a roster identity
pub fn get_unlinked_ratings(conn: &Connection) -> Result<Vec<IdentityRecord>> {
    let sql = format!(
        "SELECT {} FROM professors
         WHERE external_id IS NOT NULL AND name_roster IS NULL
         ORDER BY id",
        IDENTITY_COLUMNS
    );
    query_identities(conn, &sql, []).context("Failed to load unlinked ratings identities")
}

/// Every roster identity, linked or not
pub fn get_roster_identities(conn: &Connection) -> Result<Vec<IdentityRecord>> {
    let sql = format!(
        "SELECT {} FROM professors WHERE name_roster IS NOT NULL ORDER BY id",
        IDENTITY_COLUMNS
    );
    query_identities(conn, &sql, []).context("Failed to load roster identities")
}

pub fn get_all_identities(conn: &Connection) -> Result<Vec<IdentityRecord>> {
    let sql = format!("SELECT {} FROM professors ORDER BY id", IDENTITY_COLUMNS);
    query_identities(conn, &sql, [])
}

// ============================================================================
// IDENTITY MUTATIONS
// ============================================================================

pub fn insert_identity(
    conn: &Connection,
    name_roster: Option<&str>,
    name_ratings: Option<&str>,
    external_id: Option<i64>,
    department: Option<&str>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO professors (name_roster, name_ratings, external_id, department)
         VALUES (?1, ?2, ?3, ?4)",
        params![name_roster, name_ratings, external_id, department],
    )
    .context("Failed to insert identity")?;
    Ok(conn.last_insert_rowid())
}

/// Overwrite the ratings-side fields of an identity
pub fn set_ratings_link(
    conn: &Connection,
    id: i64,
    external_id: Option<i64>,
    name_ratings: Option<&str>,
    match_confidence: Option<f64>,
) -> Result<()> {
    conn.execute(
        "UPDATE professors
         SET external_id = ?1, name_ratings = ?2, match_confidence = ?3
         WHERE id = ?4",
        params![external_id, name_ratings, match_confidence, id],
    )
    .with_context(|| format!("Failed to set ratings link on identity {}", id))?;
    Ok(())
}

pub fn clear_external_id(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("UPDATE professors SET external_id = NULL WHERE id = ?1", [id])
        .with_context(|| format!("Failed to clear external id on identity {}", id))?;
    Ok(())
}

pub fn update_ratings_profile(
    conn: &Connection,
    id: i64,
    name_ratings: &str,
    department: Option<&str>,
) -> Result<()> {
    conn.execute(
        "UPDATE professors
         SET name_ratings = ?1, department = COALESCE(?2, department)
         WHERE id = ?3",
        params![name_ratings, department, id],
    )?;
    Ok(())
}

/// Delete an identity. Fails while any dependent still references it.
pub fn delete_identity(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("DELETE FROM professors WHERE id = ?1", [id])
        .with_context(|| format!("Failed to delete identity {}", id))?;
    Ok(())
}

// ============================================================================
// DEPENDENT QUERIES & MUTATIONS
// ============================================================================

/// Insert a grade row; returns false when the natural key already exists
pub fn insert_grade_record(conn: &Connection, professor_id: i64, grade: &NewGrade) -> Result<bool> {
    let result = conn.execute(
        "INSERT INTO grade_records (professor_id, course_code, quarter, year, avg_gpa, enrolled)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            professor_id,
            grade.course_code,
            grade.quarter,
            grade.year,
            grade.avg_gpa,
            grade.enrolled,
        ],
    );

    match result {
        Ok(_) => Ok(true),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

pub fn get_grades_for(conn: &Connection, professor_id: i64) -> Result<Vec<GradeRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, professor_id, course_code, quarter, year, avg_gpa, enrolled
         FROM grade_records
         WHERE professor_id = ?1
         ORDER BY id",
    )?;

    let grades = stmt
        .query_map([professor_id], |row| {
            Ok(GradeRecord {
                id: row.get(0)?,
                professor_id: row.get(1)?,
                course_code: row.get(2)?,
                quarter: row.get(3)?,
                year: row.get(4)?,
                avg_gpa: row.get(5)?,
                enrolled: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(grades)
}

/// Id of the grade row `professor_id` owns for a natural key, if any
pub fn find_grade_by_natural_key(
    conn: &Connection,
    professor_id: i64,
    course_code: &str,
    quarter: &str,
    year: i32,
) -> Result<Option<i64>> {
    let id = conn
        .query_row(
            "SELECT id FROM grade_records
             WHERE professor_id = ?1 AND course_code = ?2 AND quarter = ?3 AND year = ?4",
            params![professor_id, course_code, quarter, year],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

pub fn repoint_grade(conn: &Connection, grade_id: i64, professor_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE grade_records SET professor_id = ?1 WHERE id = ?2",
        [professor_id, grade_id],
    )?;
    Ok(())
}

pub fn delete_grade(conn: &Connection, grade_id: i64) -> Result<()> {
    conn.execute("DELETE FROM grade_records WHERE id = ?1", [grade_id])?;
    Ok(())
}

pub fn insert_rating_record(
    conn: &Connection,
    professor_id: i64,
    overall_quality: Option<f64>,
    difficulty: Option<f64>,
    would_take_again_pct: Option<f64>,
    num_ratings: i64,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO rating_records (
            professor_id, overall_quality, difficulty, would_take_again_pct, num_ratings, fetched_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            professor_id,
            overall_quality,
            difficulty,
            would_take_again_pct,
            num_ratings,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_ratings_for(conn: &Connection, professor_id: i64) -> Result<Vec<RatingRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, professor_id, overall_quality, difficulty, would_take_again_pct,
                num_ratings, fetched_at
         FROM rating_records
         WHERE professor_id = ?1
         ORDER BY id",
    )?;

    let ratings = stmt
        .query_map([professor_id], |row| {
            let fetched_at_str: String = row.get(6)?;
            Ok(RatingRecord {
                id: row.get(0)?,
                professor_id: row.get(1)?,
                overall_quality: row.get(2)?,
                difficulty: row.get(3)?,
                would_take_again_pct: row.get(4)?,
                num_ratings: row.get(5)?,
                fetched_at: parse_timestamp(&fetched_at_str, 6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ratings)
}

/// Move every rating row of `from` to `to`; returns the number moved
pub fn repoint_ratings(conn: &Connection, from: i64, to: i64) -> Result<usize> {
    let moved = conn.execute(
        "UPDATE rating_records SET professor_id = ?1 WHERE professor_id = ?2",
        [to, from],
    )?;
    Ok(moved)
}

/// Insert a score row; returns false when the identity already has one for the course
pub fn insert_score_record(conn: &Connection, professor_id: i64, course_code: &str, score: f64) -> Result<bool> {
    let result = conn.execute(
        "INSERT INTO score_records (professor_id, course_code, score, computed_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![professor_id, course_code, score, Utc::now().to_rfc3339()],
    );

    match result {
        Ok(_) => Ok(true),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

pub fn get_scores_for(conn: &Connection, professor_id: i64) -> Result<Vec<ScoreRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, professor_id, course_code, score, computed_at
         FROM score_records
         WHERE professor_id = ?1
         ORDER BY id",
    )?;

    let scores = stmt
        .query_map([professor_id], |row| {
            let computed_at_str: String = row.get(4)?;
            Ok(ScoreRecord {
                id: row.get(0)?,
                professor_id: row.get(1)?,
                course_code: row.get(2)?,
                score: row.get(3)?,
                computed_at: parse_timestamp(&computed_at_str, 4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(scores)
}

pub fn find_score_by_course(conn: &Connection, professor_id: i64, course_code: &str) -> Result<Option<i64>> {
    let id = conn
        .query_row(
            "SELECT id FROM score_records WHERE professor_id = ?1 AND course_code = ?2",
            params![professor_id, course_code],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

pub fn repoint_score(conn: &Connection, score_id: i64, professor_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE score_records SET professor_id = ?1 WHERE id = ?2",
        [professor_id, score_id],
    )?;
    Ok(())
}

pub fn delete_score(conn: &Connection, score_id: i64) -> Result<()> {
    conn.execute("DELETE FROM score_records WHERE id = ?1", [score_id])?;
    Ok(())
}

/// Number of grade, rating and score rows still referencing an identity
pub fn count_dependents(conn: &Connection, professor_id: i64) -> Result<i64> {
    let count = conn.query_row(
        "SELECT (SELECT COUNT(*) FROM grade_records WHERE professor_id = ?1)
              + (SELECT COUNT(*) FROM rating_records WHERE professor_id = ?1)
              + (SELECT COUNT(*) FROM score_records WHERE professor_id = ?1)",
        [professor_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

fn parse_timestamp(value: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
        })
}

// ============================================================================
// COUNTS
// ============================================================================

/// Snapshot of the store, grouped by identity status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCounts {
    pub unmatched_roster: i64,
    pub unmatched_ratings: i64,
    pub linked: i64,
    pub grade_records: i64,
    pub rating_records: i64,
    pub score_records: i64,
}

impl StoreCounts {
    pub fn identities(&self) -> i64 {
        self.unmatched_roster + self.unmatched_ratings + self.linked
    }

    pub fn dependents(&self) -> i64 {
        self.grade_records + self.rating_records + self.score_records
    }
}

pub fn count_store(conn: &Connection) -> Result<StoreCounts> {
    let count = |sql: &str| -> Result<i64> { Ok(conn.query_row(sql, [], |row| row.get(0))?) };

    Ok(StoreCounts {
        unmatched_roster: count(
            "SELECT COUNT(*) FROM professors WHERE name_roster IS NOT NULL AND external_id IS NULL",
        )?,
        unmatched_ratings: count("SELECT COUNT(*) FROM professors WHERE name_roster IS NULL")?,
        linked: count(
            "SELECT COUNT(*) FROM professors WHERE name_roster IS NOT NULL AND external_id IS NOT NULL",
        )?,
        grade_records: count("SELECT COUNT(*) FROM grade_records")?,
        rating_records: count("SELECT COUNT(*) FROM rating_records")?,
        score_records: count("SELECT COUNT(*) FROM score_records")?,
    })
}

// ============================================================================
// AUDIT TRAIL
// ============================================================================

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get events for a specific entity, newest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp DESC, id DESC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: parse_timestamp(&timestamp_str, 1)?,
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
                })?,
                actor: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

pub fn count_events(conn: &Connection, event_type: &str) -> Result<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM events WHERE event_type = ?1",
        [event_type],
        |row| row.get(0),
    )?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    fn grade(course: &str, quarter: &str, year: i32) -> NewGrade {
        NewGrade {
            course_code: course.to_string(),
            quarter: quarter.to_string(),
            year,
            avg_gpa: Some(3.4),
            enrolled: 80,
        }
    }

    #[test]
    fn test_setup_is_idempotent() {
        let conn = test_conn();
        setup_database(&conn).unwrap();
        assert_eq!(count_store(&conn).unwrap(), StoreCounts::default());
    }

    #[test]
    fn test_external_id_is_unique() {
        let conn = test_conn();
        insert_identity(&conn, None, Some("Lei Huang"), Some(42), Some("Computer Science")).unwrap();
        let second = insert_identity(&conn, None, Some("Lin Huang"), Some(42), None);
        assert!(second.is_err(), "two identities must never share an external id");
    }

    #[test]
    fn test_identity_status() {
        let conn = test_conn();
        let roster = insert_identity(&conn, Some("HUANG L"), None, None, Some("CMPSC")).unwrap();
        let ratings = insert_identity(&conn, None, Some("Lei Huang"), Some(42), None).unwrap();
        let linked = insert_identity(&conn, Some("CHANG SHIYU"), Some("Shiyu Chang"), Some(7), None).unwrap();

        assert_eq!(get_identity(&conn, roster).unwrap().unwrap().status(), IdentityStatus::UnmatchedRoster);
        assert_eq!(get_identity(&conn, ratings).unwrap().unwrap().status(), IdentityStatus::UnmatchedRatings);
        assert_eq!(get_identity(&conn, linked).unwrap().unwrap().status(), IdentityStatus::Linked);
        assert!(get_identity(&conn, 9999).unwrap().is_none());

        let counts = count_store(&conn).unwrap();
        assert_eq!(counts.unmatched_roster, 1);
        assert_eq!(counts.unmatched_ratings, 1);
        assert_eq!(counts.linked, 1);
        assert_eq!(counts.identities(), 3);
    }

    #[test]
    fn test_status_labels() {
        assert_eq!(IdentityStatus::UnmatchedRoster.as_str(), "unmatched-roster");
        assert_eq!(IdentityStatus::UnmatchedRatings.as_str(), "unmatched-ratings");
        assert_eq!(IdentityStatus::Linked.as_str(), "linked");
    }

    #[test]
    fn test_unmatched_roster_respects_min_year() {
        let conn = test_conn();
        let recent = insert_identity(&conn, Some("HUANG L"), None, None, Some("CMPSC")).unwrap();
        let retired = insert_identity(&conn, Some("OLD T"), None, None, Some("CMPSC")).unwrap();
        let no_grades = insert_identity(&conn, Some("NEW N"), None, None, Some("CMPSC")).unwrap();
        insert_grade_record(&conn, recent, &grade("CMPSC 130A", "Fall", 2024)).unwrap();
        insert_grade_record(&conn, retired, &grade("CMPSC 8", "Fall", 2015)).unwrap();

        let unmatched: Vec<i64> = get_unmatched_roster(&conn, 2023).unwrap().iter().map(|p| p.id).collect();
        assert_eq!(unmatched, vec![recent]);
        assert!(!unmatched.contains(&no_grades));

        set_ratings_link(&conn, recent, Some(5), Some("Lei Huang"), Some(90.0)).unwrap();
        assert!(get_unmatched_roster(&conn, 2023).unwrap().is_empty());
    }

    #[test]
    fn test_unlinked_ratings_excludes_linked() {
        let conn = test_conn();
        let free = insert_identity(&conn, None, Some("Lei Huang"), Some(42), None).unwrap();
        insert_identity(&conn, Some("CHANG SHIYU"), Some("Shiyu Chang"), Some(7), None).unwrap();

        let unlinked: Vec<i64> = get_unlinked_ratings(&conn).unwrap().iter().map(|p| p.id).collect();
        assert_eq!(unlinked, vec![free]);
    }

    #[test]
    fn test_grade_natural_key_is_idempotent() {
        let conn = test_conn();
        let id = insert_identity(&conn, Some("HUANG L"), None, None, None).unwrap();

        assert!(insert_grade_record(&conn, id, &grade("CMPSC 130A", "Fall", 2024)).unwrap());
        assert!(!insert_grade_record(&conn, id, &grade("CMPSC 130A", "Fall", 2024)).unwrap());
        assert!(insert_grade_record(&conn, id, &grade("CMPSC 130A", "Winter", 2024)).unwrap());

        assert_eq!(get_grades_for(&conn, id).unwrap().len(), 2);
        assert!(find_grade_by_natural_key(&conn, id, "CMPSC 130A", "Fall", 2024).unwrap().is_some());
        assert!(find_grade_by_natural_key(&conn, id, "CMPSC 130A", "Spring", 2024).unwrap().is_none());
    }

    #[test]
    fn test_delete_with_dependents_fails() {
        let conn = test_conn();
        let id = insert_identity(&conn, None, Some("Lei Huang"), Some(42), None).unwrap();
        insert_rating_record(&conn, id, Some(4.0), Some(3.0), None, 10).unwrap();

        assert!(delete_identity(&conn, id).is_err());

        let other = insert_identity(&conn, Some("HUANG L"), None, None, None).unwrap();
        assert_eq!(repoint_ratings(&conn, id, other).unwrap(), 1);
        delete_identity(&conn, id).unwrap();

        assert!(get_identity(&conn, id).unwrap().is_none());
        assert_eq!(get_ratings_for(&conn, other).unwrap().len(), 1);
    }

    #[test]
    fn test_score_records() {
        let conn = test_conn();
        let id = insert_identity(&conn, Some("HUANG L"), None, None, None).unwrap();

        assert!(insert_score_record(&conn, id, "CMPSC 130A", 81.5).unwrap());
        assert!(!insert_score_record(&conn, id, "CMPSC 130A", 70.0).unwrap());

        let scores = get_scores_for(&conn, id).unwrap();
        assert_eq!(scores.len(), 1);
        assert_eq!(scores[0].score, 81.5);
        assert_eq!(find_score_by_course(&conn, id, "CMPSC 130A").unwrap(), Some(scores[0].id));
    }

    #[test]
    fn test_event_log() {
        let conn = test_conn();

        let event = Event::new(
            "identity_linked",
            "professor",
            "17",
            serde_json::json!({"external_id": 42}),
            "test_actor",
        );

        insert_event(&conn, &event).unwrap();

        let events = get_events_for_entity(&conn, "professor", "17").unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "identity_linked");
        assert_eq!(events[0].actor, "test_actor");
        assert_eq!(events[0].data["external_id"], 42);
        assert_eq!(count_events(&conn, "identity_linked").unwrap(), 1);
    }
}
