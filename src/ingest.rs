// 📥 Ingestion Boundary - Append roster identities and ratings candidates
//
// Both feeds arrive without shared IDs. Records are validated here, once,
// so the matching passes can trust every field they read.
//
// Roster CSV columns:  instructor, department, course_code, quarter, year, avg_gpa, enrolled
// Ratings CSV columns: external_id, first_name, last_name, department,
//                      overall_quality, difficulty, would_take_again_pct, num_ratings

use crate::db::{
    find_by_external_id, find_by_roster_name, insert_grade_record, insert_identity,
    insert_rating_record, update_ratings_profile, NewGrade,
};
use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ============================================================================
// INPUT RECORDS
// ============================================================================

/// One row of the roster (grades) feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterRow {
    pub instructor: String,
    #[serde(default)]
    pub department: Option<String>,
    pub course_code: String,
    pub quarter: String,
    pub year: i32,
    #[serde(default)]
    pub avg_gpa: Option<f64>,
    #[serde(default)]
    pub enrolled: i64,
}

/// One professor from the ratings feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingCandidate {
    pub external_id: i64,
    pub first_name: String,
    pub last_name: String,
    pub department: String,
    #[serde(default)]
    pub overall_quality: Option<f64>,
    #[serde(default)]
    pub difficulty: Option<f64>,
    #[serde(default)]
    pub would_take_again_pct: Option<f64>,
    #[serde(default)]
    pub num_ratings: i64,
}

impl RatingCandidate {
    /// "First Last" as displayed by the ratings feed
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name.trim(), self.last_name.trim())
    }

    pub fn validate(&self) -> Result<()> {
        if self.external_id <= 0 {
            bail!("ratings candidate has invalid external id {}", self.external_id);
        }
        if self.last_name.trim().is_empty() {
            bail!("ratings candidate {} has no last name", self.external_id);
        }
        if self.first_name.trim().is_empty() {
            bail!("ratings candidate {} has no first name", self.external_id);
        }
        Ok(())
    }
}

// ============================================================================
// APPEND OPERATIONS
// ============================================================================

/// Get or create the roster identity for a roster name
pub fn append_roster_identity(conn: &Connection, name: &str, department: Option<&str>) -> Result<i64> {
    let name = name.trim();
    if name.is_empty() {
        bail!("roster identity has an empty name");
    }

    if let Some(existing) = find_by_roster_name(conn, name)? {
        return Ok(existing.id);
    }

    let department = department.map(str::trim).filter(|d| !d.is_empty());
    let id = insert_identity(conn, Some(name), None, None, department)?;
    debug!("Appended roster identity {} ({})", name, id);
    Ok(id)
}

/// Get or create the ratings identity for a candidate and record its rating snapshot
pub fn append_rating_candidate(conn: &Connection, candidate: &RatingCandidate) -> Result<i64> {
    candidate.validate()?;

    let name = candidate.display_name();
    let department = Some(candidate.department.trim()).filter(|d| !d.is_empty());

    let id = match find_by_external_id(conn, candidate.external_id)? {
        Some(existing) => {
            // Roster-linked identities keep their roster department
            let department = if existing.name_roster.is_some() { None } else { department };
            update_ratings_profile(conn, existing.id, &name, department)?;
            existing.id
        }
        None => insert_identity(conn, None, Some(&name), Some(candidate.external_id), department)?,
    };

    insert_rating_record(
        conn,
        id,
        candidate.overall_quality,
        candidate.difficulty,
        candidate.would_take_again_pct,
        candidate.num_ratings,
    )?;

    debug!("Appended ratings candidate {} (external id {})", name, candidate.external_id);
    Ok(id)
}

// ============================================================================
// CSV IMPORT
// ============================================================================

/// Outcome of loading one feed file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
    pub rows: usize,
    pub inserted: usize,
    pub skipped: usize,
    pub rejected: usize,
}

pub fn import_roster_csv(conn: &mut Connection, csv_path: &Path) -> Result<ImportReport> {
    let mut rdr = csv::Reader::from_path(csv_path)
        .with_context(|| format!("Failed to open roster CSV: {:?}", csv_path))?;

    let mut report = ImportReport::default();
    let tx = conn.transaction()?;

    for result in rdr.deserialize::<RosterRow>() {
        report.rows += 1;

        let row = match result {
            Ok(row) => row,
            Err(e) => {
                warn!("Rejected roster row {}: {}", report.rows, e);
                report.rejected += 1;
                continue;
            }
        };

        let professor_id = match append_roster_identity(&tx, &row.instructor, row.department.as_deref()) {
            Ok(id) => id,
            Err(e) => {
                warn!("Rejected roster row {}: {}", report.rows, e);
                report.rejected += 1;
                continue;
            }
        };

        let grade = NewGrade {
            course_code: row.course_code.trim().to_string(),
            quarter: row.quarter.trim().to_string(),
            year: row.year,
            avg_gpa: row.avg_gpa,
            enrolled: row.enrolled,
        };

        if insert_grade_record(&tx, professor_id, &grade)? {
            report.inserted += 1;
        } else {
            report.skipped += 1;
        }
    }

    tx.commit()?;
    info!(
        "Roster import: {} rows, {} inserted, {} duplicates skipped, {} rejected",
        report.rows, report.inserted, report.skipped, report.rejected
    );
    Ok(report)
}

pub fn import_ratings_csv(conn: &mut Connection, csv_path: &Path) -> Result<ImportReport> {
    let mut rdr = csv::Reader::from_path(csv_path)
        .with_context(|| format!("Failed to open ratings CSV: {:?}", csv_path))?;

    let mut report = ImportReport::default();
    let tx = conn.transaction()?;

    for result in rdr.deserialize::<RatingCandidate>() {
        report.rows += 1;

        let candidate = match result {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!("Rejected ratings row {}: {}", report.rows, e);
                report.rejected += 1;
                continue;
            }
        };

        if let Err(e) = candidate.validate() {
            warn!("Rejected ratings row {}: {}", report.rows, e);
            report.rejected += 1;
            continue;
        }

        append_rating_candidate(&tx, &candidate)?;
        report.inserted += 1;
    }

    tx.commit()?;
    info!(
        "Ratings import: {} rows, {} appended, {} rejected",
        report.rows, report.inserted, report.rejected
    );
    Ok(report)
}
