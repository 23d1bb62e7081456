// 🔗 Link/Merge Transaction - The only code that mutates identities
//
// link:  a roster identity absorbs a ratings-only identity (the donor)
// merge: a full-name roster identity absorbs its abbreviated duplicate (the loser)
//
// Both run against whatever connection they are given. Callers supply the
// atomicity: a savepoint per pair inside a pass, or `link_atomic` /
// `merge_atomic` for one-off reconciliation.
//
// Order matters. Dependents are re-pointed first, the donor's external id is
// cleared before the winner takes it (the column is UNIQUE), and an identity
// is deleted only once nothing references it.

use crate::db::{
    clear_external_id, count_dependents, delete_grade, delete_identity, delete_score,
    find_by_external_id, find_grade_by_natural_key, find_score_by_course, get_grades_for,
    get_identity, get_scores_for, insert_event, repoint_grade, repoint_ratings, repoint_score,
    set_ratings_link, Event, IdentityRecord,
};
use anyhow::{bail, Result};
use log::{info, warn};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

/// Actor recorded on audit events
const ACTOR: &str = "professor_matcher";

// ============================================================================
// OUTCOMES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LinkOutcome {
    /// Winner now holds the external id; donor is gone
    Linked { external_id: i64 },

    /// Dry-run: the link would have been made
    Proposed { external_id: i64 },

    /// The external id is already claimed by another roster identity
    Collision { external_id: i64, holder_id: i64 },

    /// Nothing to do (missing identity, donor without external id, winner already linked)
    Skipped { reason: String },
}

impl LinkOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, LinkOutcome::Linked { .. } | LinkOutcome::Proposed { .. })
    }
}

/// What moved during a merge
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSummary {
    pub link_transferred: bool,
    pub grades_moved: usize,
    pub grades_dropped: usize,
    pub ratings_moved: usize,
    pub scores_moved: usize,
    pub scores_dropped: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MergeOutcome {
    Merged(MergeSummary),

    /// Dry-run: the merge would have been made
    Proposed,

    /// Both sides hold different external ids; merging would drop one of them
    Conflict { loser_external_id: i64, winner_external_id: i64 },

    Skipped { reason: String },
}

impl MergeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, MergeOutcome::Merged(_) | MergeOutcome::Proposed)
    }
}

fn skipped_link(reason: impl Into<String>) -> Result<LinkOutcome> {
    Ok(LinkOutcome::Skipped { reason: reason.into() })
}

fn skipped_merge(reason: impl Into<String>) -> Result<MergeOutcome> {
    Ok(MergeOutcome::Skipped { reason: reason.into() })
}

// ============================================================================
// LINK
// ============================================================================

/// Give the donor's external id, ratings name and dependents to the winner,
/// then delete the donor.
pub fn link_identities(
    conn: &Connection,
    winner_id: i64,
    donor_id: i64,
    confidence: f64,
    dry_run: bool,
) -> Result<LinkOutcome> {
    if winner_id == donor_id {
        return skipped_link("winner and donor are the same identity");
    }
    let Some(winner) = get_identity(conn, winner_id)? else {
        return skipped_link(format!("winner {} no longer exists", winner_id));
    };
    let Some(donor) = get_identity(conn, donor_id)? else {
        return skipped_link(format!("donor {} no longer exists", donor_id));
    };
    let Some(external_id) = donor.external_id else {
        return skipped_link(format!("donor {} holds no external id", donor_id));
    };
    if winner.external_id.is_some() {
        return skipped_link(format!("winner {} is already linked", winner_id));
    }

    // Collision guard: the external id already belongs to a roster identity
    if let Some(holder) = find_by_external_id(conn, external_id)? {
        if holder.id != winner.id && holder.name_roster.is_some() {
            warn!(
                "Collision: external id {} already linked to {} (id={}), skipping {}",
                external_id,
                holder.name_roster.as_deref().unwrap_or_default(),
                holder.id,
                display_name(&winner)
            );
            if !dry_run {
                record_event(
                    conn,
                    "link_collision",
                    winner.id,
                    serde_json::json!({
                        "external_id": external_id,
                        "holder_id": holder.id,
                        "donor_id": donor.id,
                    }),
                )?;
            }
            return Ok(LinkOutcome::Collision {
                external_id,
                holder_id: holder.id,
            });
        }
    }

    if dry_run {
        return Ok(LinkOutcome::Proposed { external_id });
    }

    let confidence = confidence.clamp(0.0, 100.0);

    // Snapshot before touching anything
    let saved_name_ratings = donor.name_ratings.clone();

    let ratings_moved = repoint_ratings(conn, donor.id, winner.id)?;
    let grades = transfer_grades(conn, donor.id, winner.id)?;
    let scores = transfer_scores(conn, donor.id, winner.id)?;

    clear_external_id(conn, donor.id)?;
    ensure_detached(conn, donor.id)?;
    delete_identity(conn, donor.id)?;

    set_ratings_link(
        conn,
        winner.id,
        Some(external_id),
        saved_name_ratings.as_deref(),
        Some(confidence),
    )?;

    record_event(
        conn,
        "identity_linked",
        winner.id,
        serde_json::json!({
            "donor_id": donor.id,
            "external_id": external_id,
            "name_ratings": saved_name_ratings,
            "confidence": confidence,
            "ratings_moved": ratings_moved,
            "grades_moved": grades.0,
            "scores_moved": scores.0,
        }),
    )?;

    Ok(LinkOutcome::Linked { external_id })
}

/// `link_identities` in its own transaction, for manual reconciliation
pub fn link_atomic(conn: &mut Connection, winner_id: i64, donor_id: i64, confidence: f64) -> Result<LinkOutcome> {
    let tx = conn.transaction()?;
    let outcome = link_identities(&tx, winner_id, donor_id, confidence, false)?;
    tx.commit()?;

    if let LinkOutcome::Linked { external_id } = outcome {
        info!("Manual link: identity {} now holds external id {}", winner_id, external_id);
    }
    Ok(outcome)
}

// ============================================================================
// MERGE
// ============================================================================

/// Fold a duplicate roster identity (loser) into the surviving one (winner).
///
/// A ratings link held only by the loser moves to the winner. Grades and
/// scores move unless the winner already owns the same natural key, in which
/// case the loser's copy is discarded. The loser is deleted last.
pub fn merge_identities(conn: &Connection, loser_id: i64, winner_id: i64, dry_run: bool) -> Result<MergeOutcome> {
    if loser_id == winner_id {
        return skipped_merge("loser and winner are the same identity");
    }
    let Some(loser) = get_identity(conn, loser_id)? else {
        return skipped_merge(format!("loser {} no longer exists", loser_id));
    };
    let Some(winner) = get_identity(conn, winner_id)? else {
        return skipped_merge(format!("winner {} no longer exists", winner_id));
    };

    if let (Some(loser_external_id), Some(winner_external_id)) = (loser.external_id, winner.external_id) {
        return Ok(MergeOutcome::Conflict {
            loser_external_id,
            winner_external_id,
        });
    }

    if dry_run {
        return Ok(MergeOutcome::Proposed);
    }

    let mut summary = MergeSummary::default();

    if let (Some(external_id), None) = (loser.external_id, winner.external_id) {
        let saved_name_ratings = loser.name_ratings.clone();
        let saved_confidence = loser.match_confidence;

        clear_external_id(conn, loser.id)?;
        set_ratings_link(
            conn,
            winner.id,
            Some(external_id),
            saved_name_ratings.as_deref(),
            saved_confidence,
        )?;
        summary.link_transferred = true;
    }

    summary.ratings_moved = repoint_ratings(conn, loser.id, winner.id)?;
    (summary.grades_moved, summary.grades_dropped) = transfer_grades(conn, loser.id, winner.id)?;
    (summary.scores_moved, summary.scores_dropped) = transfer_scores(conn, loser.id, winner.id)?;

    ensure_detached(conn, loser.id)?;
    delete_identity(conn, loser.id)?;

    record_event(
        conn,
        "identity_merged",
        winner.id,
        serde_json::json!({
            "loser_id": loser.id,
            "loser_name": loser.name_roster,
            "summary": summary,
        }),
    )?;

    Ok(MergeOutcome::Merged(summary))
}

/// `merge_identities` in its own transaction, for manual reconciliation
pub fn merge_atomic(conn: &mut Connection, loser_id: i64, winner_id: i64) -> Result<MergeOutcome> {
    let tx = conn.transaction()?;
    let outcome = merge_identities(&tx, loser_id, winner_id, false)?;
    tx.commit()?;

    if let MergeOutcome::Merged(summary) = &outcome {
        info!("Manual merge: identity {} folded into {} ({:?})", loser_id, winner_id, summary);
    }
    Ok(outcome)
}

// ============================================================================
// HELPERS
// ============================================================================

/// Move grade rows, discarding those whose natural key the target already has.
/// Returns (moved, dropped).
fn transfer_grades(conn: &Connection, from: i64, to: i64) -> Result<(usize, usize)> {
    let mut moved = 0;
    let mut dropped = 0;

    for grade in get_grades_for(conn, from)? {
        let duplicate =
            find_grade_by_natural_key(conn, to, &grade.course_code, &grade.quarter, grade.year)?;
        if duplicate.is_some() {
            delete_grade(conn, grade.id)?;
            dropped += 1;
        } else {
            repoint_grade(conn, grade.id, to)?;
            moved += 1;
        }
    }

    Ok((moved, dropped))
}

/// Move score rows, discarding those for courses the target already has.
/// Returns (moved, dropped).
fn transfer_scores(conn: &Connection, from: i64, to: i64) -> Result<(usize, usize)> {
    let mut moved = 0;
    let mut dropped = 0;

    for score in get_scores_for(conn, from)? {
        if find_score_by_course(conn, to, &score.course_code)?.is_some() {
            delete_score(conn, score.id)?;
            dropped += 1;
        } else {
            repoint_score(conn, score.id, to)?;
            moved += 1;
        }
    }

    Ok((moved, dropped))
}

/// Re-read the dependents of an identity about to be deleted
fn ensure_detached(conn: &Connection, id: i64) -> Result<()> {
    let remaining = count_dependents(conn, id)?;
    if remaining > 0 {
        bail!("identity {} still owns {} dependent rows", id, remaining);
    }
    Ok(())
}

fn record_event(conn: &Connection, event_type: &str, identity_id: i64, data: serde_json::Value) -> Result<()> {
    let event = Event::new(event_type, "professor", &identity_id.to_string(), data, ACTOR);
    insert_event(conn, &event)
}

fn display_name(identity: &IdentityRecord) -> &str {
    identity
        .name_roster
        .as_deref()
        .or(identity.name_ratings.as_deref())
        .unwrap_or("<unnamed>")
}
