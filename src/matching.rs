// 🎯 Matching Engine - Four passes that link roster and ratings identities
//
// Pass 1: last name + first initial, exactly one candidate
// Pass 2: fuzzy full-name match against the remaining pool
// Pass 3: department disambiguation of Pass 1's ambiguous records
// Pass 4: fold abbreviated roster duplicates into their full-name twin
//
// Each pass reads the residue left by the previous one, runs in a single
// transaction, and isolates every pair in a savepoint. A pair that fails is
// rolled back and counted; the pass carries on.

use crate::candidates::CandidateIndex;
use crate::config::MatchingConfig;
use crate::db::{
    count_store, get_roster_identities, get_unlinked_ratings, get_unmatched_roster, insert_event,
    Event, IdentityRecord,
};
use crate::departments::DepartmentAliases;
use crate::linking::{link_identities, merge_identities, LinkOutcome, MergeOutcome};
use crate::names::{
    initial_matches, normalize_for_compare, normalize_roster_for_compare, parse_roster_name, token_sort_ratio,
    ParsedName,
};
use anyhow::Result;
use log::{debug, error, info, warn};
use rusqlite::{Connection, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// STATS
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pass1Stats {
    pub considered: usize,
    pub linked: usize,
    pub no_candidate: usize,
    pub ambiguous: usize,
    pub collisions: usize,
    pub skipped: usize,
    pub errors: usize,
    pub malformed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pass2Stats {
    pub considered: usize,
    pub linked: usize,
    pub below_threshold: usize,
    /// Best score close enough to be worth a manual look
    pub needs_review: usize,
    pub collisions: usize,
    pub skipped: usize,
    pub errors: usize,
    pub malformed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pass3Stats {
    pub considered: usize,
    pub linked: usize,
    pub no_dept: usize,
    pub still_ambiguous: usize,
    pub collisions: usize,
    pub skipped: usize,
    pub errors: usize,
    pub malformed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pass4Stats {
    /// (last name, department) groups with at least two members
    pub groups: usize,
    pub merged: usize,
    pub ambiguous: usize,
    pub conflicting_links: usize,
    pub skipped: usize,
    pub errors: usize,
    pub malformed: usize,
}

/// Everything `run_matching` reports
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchingStats {
    pub dry_run: bool,
    pub min_year: i32,
    pub initial_unmatched: usize,
    pub initial_unlinked: usize,
    pub pass1: Pass1Stats,
    pub pass2: Pass2Stats,
    pub pass3: Pass3Stats,
    pub pass4: Pass4Stats,
    pub total_new_matches: usize,
    pub total_merges: usize,
}

/// How a single link attempt inside a pass ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Linked,
    Collision,
    Skipped,
    Failed,
}

/// A pool entry for Pass 2
struct PoolEntry {
    record: IdentityRecord,
    normalized: String,
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct MatchingEngine {
    config: MatchingConfig,
    departments: DepartmentAliases,
}

impl Default for MatchingEngine {
    fn default() -> Self {
        Self::from_config(MatchingConfig::default())
    }
}

impl MatchingEngine {
    pub fn new(config: MatchingConfig, departments: DepartmentAliases) -> Self {
        Self { config, departments }
    }

    /// Engine with the built-in department aliases
    pub fn from_config(config: MatchingConfig) -> Self {
        let departments = DepartmentAliases::with_defaults().with_fuzzy_threshold(config.department_fuzzy_threshold);
        Self::new(config, departments)
    }

    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    pub fn departments(&self) -> &DepartmentAliases {
        &self.departments
    }

    // ========================================================================
    // ORCHESTRATOR
    // ========================================================================

    /// Run Pass 1 → 4 in order.
    ///
    /// A pass that fails outright is logged and reported with one error; the
    /// passes after it still run. Safe to call again: resolved records are
    /// never picked up twice.
    pub fn run_matching(&self, conn: &mut Connection, min_year: i32, dry_run: bool) -> Result<MatchingStats> {
        info!("=== Professor Matching{} ===", if dry_run { " (dry run)" } else { "" });

        let initial_unmatched = get_unmatched_roster(conn, min_year)?.len();
        let initial_unlinked = get_unlinked_ratings(conn)?.len();
        info!(
            "Starting: {} unmatched roster, {} unlinked ratings",
            initial_unmatched, initial_unlinked
        );

        info!("--- Pass 1: Initial Match ---");
        let pass1 = self.run_pass1(conn, min_year, dry_run).unwrap_or_else(|e| {
            error!("Pass 1 failed: {:#}", e);
            Pass1Stats { errors: 1, ..Default::default() }
        });
        info!("Pass 1 results: {:?}", pass1);

        info!("--- Pass 2: Full-Name Fuzzy ---");
        let pass2 = self.run_pass2(conn, min_year, dry_run).unwrap_or_else(|e| {
            error!("Pass 2 failed: {:#}", e);
            Pass2Stats { errors: 1, ..Default::default() }
        });
        info!("Pass 2 results: {:?}", pass2);

        info!("--- Pass 3: Department Disambiguation ---");
        let pass3 = self.run_pass3(conn, min_year, dry_run).unwrap_or_else(|e| {
            error!("Pass 3 failed: {:#}", e);
            Pass3Stats { errors: 1, ..Default::default() }
        });
        info!("Pass 3 results: {:?}", pass3);

        info!("--- Pass 4: Roster Deduplication ---");
        let pass4 = self.run_pass4(conn, dry_run).unwrap_or_else(|e| {
            error!("Pass 4 failed: {:#}", e);
            Pass4Stats { errors: 1, ..Default::default() }
        });
        info!("Pass 4 results: {:?}", pass4);

        let total_new_matches = pass1.linked + pass2.linked + pass3.linked;
        let total_merges = pass4.merged;
        info!("=== Done: {} new matches, {} merges ===", total_new_matches, total_merges);

        let stats = MatchingStats {
            dry_run,
            min_year,
            initial_unmatched,
            initial_unlinked,
            pass1,
            pass2,
            pass3,
            pass4,
            total_new_matches,
            total_merges,
        };

        if !dry_run {
            let run_id = uuid::Uuid::new_v4().to_string();
            let event = Event::new(
                "matching_run_completed",
                "matching_run",
                &run_id,
                serde_json::to_value(&stats)?,
                "professor_matcher",
            );
            insert_event(conn, &event)?;

            let counts = count_store(conn)?;
            debug!("Store after run: {:?}", counts);
        }

        Ok(stats)
    }

    pub fn run_pass1(&self, conn: &mut Connection, min_year: i32, dry_run: bool) -> Result<Pass1Stats> {
        let mut tx = conn.transaction()?;
        let stats = self.pass1_initial_match(&mut tx, min_year, dry_run)?;
        finish_pass(tx, dry_run)?;
        Ok(stats)
    }

    pub fn run_pass2(&self, conn: &mut Connection, min_year: i32, dry_run: bool) -> Result<Pass2Stats> {
        let mut tx = conn.transaction()?;
        let stats = self.pass2_fullname_fuzzy(&mut tx, min_year, dry_run)?;
        finish_pass(tx, dry_run)?;
        Ok(stats)
    }

    pub fn run_pass3(&self, conn: &mut Connection, min_year: i32, dry_run: bool) -> Result<Pass3Stats> {
        let mut tx = conn.transaction()?;
        let stats = self.pass3_department_disambiguation(&mut tx, min_year, dry_run)?;
        finish_pass(tx, dry_run)?;
        Ok(stats)
    }

    pub fn run_pass4(&self, conn: &mut Connection, dry_run: bool) -> Result<Pass4Stats> {
        let mut tx = conn.transaction()?;
        let stats = self.pass4_deduplication(&mut tx, dry_run)?;
        finish_pass(tx, dry_run)?;
        Ok(stats)
    }

    // ========================================================================
    // PASS 1: last name + initial
    // ========================================================================

    fn pass1_initial_match(&self, tx: &mut Transaction<'_>, min_year: i32, dry_run: bool) -> Result<Pass1Stats> {
        let mut stats = Pass1Stats::default();

        let roster = get_unmatched_roster(tx, min_year)?;
        let mut index = CandidateIndex::build(&get_unlinked_ratings(tx)?);

        for record in roster {
            let Some(name) = parsed_roster(&record) else {
                stats.malformed += 1;
                continue;
            };
            if !name.is_initial_only {
                continue;
            }
            stats.considered += 1;

            let donor = match index.initial_candidates(&name).as_slice() {
                [] => {
                    stats.no_candidate += 1;
                    continue;
                }
                [only] => only.record.clone(),
                many => {
                    stats.ambiguous += 1;
                    debug!("Pass 1: {} ambiguous, {} candidates", roster_label(&record), many.len());
                    continue;
                }
            };

            let confidence = if self.same_department(&record, &donor) {
                self.config.initial_dept_confidence
            } else {
                self.config.initial_confidence
            };

            match self.try_link(tx, &record, &donor, confidence, dry_run, "Pass 1") {
                Attempt::Linked => {
                    stats.linked += 1;
                    index.remove(donor.id);
                }
                Attempt::Collision => stats.collisions += 1,
                Attempt::Skipped => stats.skipped += 1,
                Attempt::Failed => stats.errors += 1,
            }
        }

        Ok(stats)
    }

    // ========================================================================
    // PASS 2: fuzzy full name
    // ========================================================================

    fn pass2_fullname_fuzzy(&self, tx: &mut Transaction<'_>, min_year: i32, dry_run: bool) -> Result<Pass2Stats> {
        let mut stats = Pass2Stats::default();

        // Re-derived: Pass 1 has consumed part of both sides
        let roster = get_unmatched_roster(tx, min_year)?;
        let mut pool: Vec<PoolEntry> = get_unlinked_ratings(tx)?
            .into_iter()
            .filter_map(|record| {
                let normalized = normalize_for_compare(record.name_ratings.as_deref()?);
                (!normalized.is_empty()).then_some(PoolEntry { record, normalized })
            })
            .collect();

        for record in roster {
            let Some(name) = parsed_roster(&record) else {
                stats.malformed += 1;
                continue;
            };
            if name.is_initial_only {
                continue;
            }
            stats.considered += 1;

            let normalized = normalize_roster_for_compare(record.name_roster.as_deref().unwrap_or_default());

            // Highest score wins; on ties the first in scan order is kept
            let mut best: Option<(usize, f64)> = None;
            for (pos, entry) in pool.iter().enumerate() {
                let score = token_sort_ratio(&normalized, &entry.normalized);
                if best.map_or(true, |(_, best_score)| score > best_score) {
                    best = Some((pos, score));
                }
            }

            let Some((pos, score)) = best else {
                stats.below_threshold += 1;
                continue;
            };

            if score < self.config.fuzzy_accept_threshold {
                stats.below_threshold += 1;
                if score >= self.config.fuzzy_review_threshold {
                    stats.needs_review += 1;
                    info!(
                        "Pass 2: needs review: {} ~ {} (score={})",
                        roster_label(&record),
                        candidate_label(&pool[pos].record),
                        score
                    );
                }
                continue;
            }

            let donor = pool[pos].record.clone();
            let bonus = if self.same_department(&record, &donor) {
                self.config.department_bonus
            } else {
                0.0
            };
            let confidence = (score + bonus).min(100.0);

            match self.try_link(tx, &record, &donor, confidence, dry_run, "Pass 2") {
                Attempt::Linked => {
                    stats.linked += 1;
                    // First claim wins: nobody else in this pass may take it
                    pool.remove(pos);
                }
                Attempt::Collision => stats.collisions += 1,
                Attempt::Skipped => stats.skipped += 1,
                Attempt::Failed => stats.errors += 1,
            }
        }

        Ok(stats)
    }

    // ========================================================================
    // PASS 3: department disambiguation
    // ========================================================================

    fn pass3_department_disambiguation(
        &self,
        tx: &mut Transaction<'_>,
        min_year: i32,
        dry_run: bool,
    ) -> Result<Pass3Stats> {
        let mut stats = Pass3Stats::default();

        let roster = get_unmatched_roster(tx, min_year)?;
        let mut index = CandidateIndex::build(&get_unlinked_ratings(tx)?);

        for record in roster {
            let Some(name) = parsed_roster(&record) else {
                stats.malformed += 1;
                continue;
            };
            if !name.is_initial_only {
                continue;
            }
            let has_department = record.department.as_deref().is_some_and(|d| !d.trim().is_empty());
            if !has_department {
                stats.no_dept += 1;
                continue;
            }

            let candidates = index.initial_candidates(&name);
            if candidates.len() <= 1 {
                // Pass 1 territory
                continue;
            }
            stats.considered += 1;

            let dept_matches: Vec<IdentityRecord> = candidates
                .iter()
                .filter(|candidate| self.same_department(&record, &candidate.record))
                .map(|candidate| candidate.record.clone())
                .collect();

            let donor = match dept_matches.as_slice() {
                [only] => only.clone(),
                _ => {
                    stats.still_ambiguous += 1;
                    debug!(
                        "Pass 3: {} still ambiguous, {} of {} candidates in department",
                        roster_label(&record),
                        dept_matches.len(),
                        candidates.len()
                    );
                    continue;
                }
            };

            match self.try_link(
                tx,
                &record,
                &donor,
                self.config.disambiguation_confidence,
                dry_run,
                "Pass 3",
            ) {
                Attempt::Linked => {
                    stats.linked += 1;
                    index.remove(donor.id);
                }
                Attempt::Collision => stats.collisions += 1,
                Attempt::Skipped => stats.skipped += 1,
                Attempt::Failed => stats.errors += 1,
            }
        }

        Ok(stats)
    }

    // ========================================================================
    // PASS 4: roster deduplication
    // ========================================================================

    fn pass4_deduplication(&self, tx: &mut Transaction<'_>, dry_run: bool) -> Result<Pass4Stats> {
        let mut stats = Pass4Stats::default();

        // All roster identities, linked or not: duplicates can sit on either side
        let mut groups: BTreeMap<(String, String), Vec<(IdentityRecord, ParsedName)>> = BTreeMap::new();
        for record in get_roster_identities(tx)? {
            let Some(name) = parsed_roster(&record) else {
                stats.malformed += 1;
                continue;
            };
            let department = record.department.as_deref().unwrap_or_default().trim().to_lowercase();
            groups
                .entry((name.last_key(), department))
                .or_default()
                .push((record, name));
        }

        for members in groups.values() {
            if members.len() < 2 {
                continue;
            }
            stats.groups += 1;

            let (initials, fulls): (Vec<_>, Vec<_>) = members
                .iter()
                .filter(|(_, name)| !name.first.is_empty())
                .partition(|(_, name)| name.is_initial_only);

            for (abbreviated, abbreviated_name) in initials {
                let twins: Vec<&IdentityRecord> = fulls
                    .iter()
                    .filter(|(_, full_name)| initial_matches(&abbreviated_name.first, &full_name.first))
                    .map(|(record, _)| record)
                    .collect();

                let winner = match twins.as_slice() {
                    [] => continue,
                    [only] => *only,
                    many => {
                        stats.ambiguous += 1;
                        debug!(
                            "Pass 4: {} matches {} full names, not merged",
                            roster_label(abbreviated),
                            many.len()
                        );
                        continue;
                    }
                };

                match self.try_merge(tx, abbreviated, winner, dry_run) {
                    Ok(MergeOutcome::Merged(summary)) => {
                        stats.merged += 1;
                        info!(
                            "Pass 4: merged {} -> {} ({} grades moved, {} dropped{})",
                            roster_label(abbreviated),
                            roster_label(winner),
                            summary.grades_moved,
                            summary.grades_dropped,
                            if summary.link_transferred { ", link transferred" } else { "" }
                        );
                    }
                    Ok(MergeOutcome::Proposed) => {
                        stats.merged += 1;
                        info!(
                            "Pass 4 (dry run): would merge {} -> {}",
                            roster_label(abbreviated),
                            roster_label(winner)
                        );
                    }
                    Ok(MergeOutcome::Conflict {
                        loser_external_id,
                        winner_external_id,
                    }) => {
                        stats.conflicting_links += 1;
                        warn!(
                            "Pass 4: {} (ext {}) and {} (ext {}) hold different links, not merged",
                            roster_label(abbreviated),
                            loser_external_id,
                            roster_label(winner),
                            winner_external_id
                        );
                    }
                    Ok(MergeOutcome::Skipped { reason }) => {
                        stats.skipped += 1;
                        debug!("Pass 4: skipped {}: {}", roster_label(abbreviated), reason);
                    }
                    Err(e) => {
                        stats.errors += 1;
                        error!(
                            "Pass 4: merge {} -> {} failed: {:#}",
                            roster_label(abbreviated),
                            roster_label(winner),
                            e
                        );
                    }
                }
            }
        }

        Ok(stats)
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    fn same_department(&self, roster: &IdentityRecord, candidate: &IdentityRecord) -> bool {
        self.departments
            .matches(roster.department.as_deref(), candidate.department.as_deref())
    }

    /// One link inside its own savepoint
    fn try_link(
        &self,
        tx: &mut Transaction<'_>,
        winner: &IdentityRecord,
        donor: &IdentityRecord,
        confidence: f64,
        dry_run: bool,
        pass: &str,
    ) -> Attempt {
        let result = tx.savepoint().map_err(anyhow::Error::from).and_then(|sp| {
            let outcome = link_identities(&sp, winner.id, donor.id, confidence, dry_run)?;
            sp.commit()?;
            Ok(outcome)
        });

        match result {
            Ok(LinkOutcome::Linked { external_id }) => {
                info!(
                    "{}: {} -> {} (ext {}, confidence {})",
                    pass,
                    roster_label(winner),
                    candidate_label(donor),
                    external_id,
                    confidence
                );
                Attempt::Linked
            }
            Ok(LinkOutcome::Proposed { external_id }) => {
                info!(
                    "{} (dry run): would link {} -> {} (ext {}, confidence {})",
                    pass,
                    roster_label(winner),
                    candidate_label(donor),
                    external_id,
                    confidence
                );
                Attempt::Linked
            }
            Ok(LinkOutcome::Collision { .. }) => Attempt::Collision,
            Ok(LinkOutcome::Skipped { reason }) => {
                debug!("{}: skipped {}: {}", pass, roster_label(winner), reason);
                Attempt::Skipped
            }
            Err(e) => {
                error!(
                    "{}: link {} -> {} failed: {:#}",
                    pass,
                    roster_label(winner),
                    candidate_label(donor),
                    e
                );
                Attempt::Failed
            }
        }
    }

    /// One merge inside its own savepoint
    fn try_merge(
        &self,
        tx: &mut Transaction<'_>,
        loser: &IdentityRecord,
        winner: &IdentityRecord,
        dry_run: bool,
    ) -> Result<MergeOutcome> {
        let sp = tx.savepoint()?;
        let outcome = merge_identities(&sp, loser.id, winner.id, dry_run)?;
        sp.commit()?;
        Ok(outcome)
    }
}

/// Commit a pass, or throw it away in dry-run
fn finish_pass(tx: Transaction<'_>, dry_run: bool) -> Result<()> {
    if dry_run {
        tx.rollback()?;
    } else {
        tx.commit()?;
    }
    Ok(())
}

/// Parsed roster name, or None when there is no usable last name
fn parsed_roster(record: &IdentityRecord) -> Option<ParsedName> {
    let name = parse_roster_name(record.name_roster.as_deref()?);
    if name.last_key().is_empty() {
        debug!("Skipping malformed roster name {:?} (id={})", record.name_roster, record.id);
        return None;
    }
    Some(name)
}

fn roster_label(record: &IdentityRecord) -> String {
    format!(
        "{} ({})",
        record.name_roster.as_deref().unwrap_or("<unnamed>"),
        record.department.as_deref().unwrap_or("-")
    )
}

fn candidate_label(record: &IdentityRecord) -> &str {
    record.name_ratings.as_deref().unwrap_or("<unnamed>")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{
        count_events, count_store, find_by_roster_name, get_all_identities, get_identity, insert_grade_record,
        setup_database, NewGrade,
    };
    use crate::ingest::{append_rating_candidate, append_roster_identity, RatingCandidate};
    use crate::linking::link_identities;
    use std::collections::HashSet;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    fn roster(conn: &Connection, name: &str, dept: &str) -> i64 {
        let id = append_roster_identity(conn, name, Some(dept)).unwrap();
        let grade = NewGrade {
            course_code: format!("{} 101", dept),
            quarter: "Fall".to_string(),
            year: 2024,
            avg_gpa: Some(3.3),
            enrolled: 90,
        };
        insert_grade_record(conn, id, &grade).unwrap();
        id
    }

    fn ratings(conn: &Connection, external_id: i64, first: &str, last: &str, dept: &str) -> i64 {
        let candidate = RatingCandidate {
            external_id,
            first_name: first.to_string(),
            last_name: last.to_string(),
            department: dept.to_string(),
            overall_quality: Some(4.0),
            difficulty: Some(3.0),
            would_take_again_pct: Some(75.0),
            num_ratings: 12,
        };
        append_rating_candidate(conn, &candidate).unwrap()
    }

    fn engine() -> MatchingEngine {
        MatchingEngine::default()
    }

    #[test]
    fn test_pass1_links_lone_candidate_with_department_confidence() {
        let mut conn = test_conn();
        let huang = roster(&conn, "HUANG L", "CMPSC");
        ratings(&conn, 42, "Lei", "Huang", "Computer Science");

        let stats = engine().run_pass1(&mut conn, 2023, false).unwrap();
        assert_eq!(stats.linked, 1);

        let linked = get_identity(&conn, huang).unwrap().unwrap();
        assert_eq!(linked.external_id, Some(42));
        assert_eq!(linked.match_confidence, Some(90.0));
        assert_eq!(linked.name_ratings.as_deref(), Some("Lei Huang"));
        assert_eq!(count_store(&conn).unwrap().unmatched_ratings, 0);
    }

    #[test]
    fn test_pass1_lower_confidence_without_department_match() {
        let mut conn = test_conn();
        let huang = roster(&conn, "HUANG L", "MATH");
        ratings(&conn, 42, "Lei", "Huang", "Computer Science");

        engine().run_pass1(&mut conn, 2023, false).unwrap();
        assert_eq!(get_identity(&conn, huang).unwrap().unwrap().match_confidence, Some(75.0));
    }

    #[test]
    fn test_pass1_tallies_deferrals_and_malformed() {
        let mut conn = test_conn();
        roster(&conn, "HUANG L", "CMPSC");
        roster(&conn, "GARCIA M", "MATH");
        roster(&conn, ",", "MATH");
        ratings(&conn, 1, "Lei", "Huang", "Computer Science");
        ratings(&conn, 2, "Lin", "Huang", "Mathematics");

        let stats = engine().run_pass1(&mut conn, 2023, false).unwrap();
        assert_eq!(stats.linked, 0);
        assert_eq!(stats.ambiguous, 1);
        assert_eq!(stats.no_candidate, 1);
        assert_eq!(stats.malformed, 1);
    }

    #[test]
    fn test_min_year_filters_inactive_roster() {
        let mut conn = test_conn();
        let old = append_roster_identity(&conn, "HUANG L", Some("CMPSC")).unwrap();
        let grade = NewGrade {
            course_code: "CMPSC 8".to_string(),
            quarter: "Fall".to_string(),
            year: 2019,
            avg_gpa: None,
            enrolled: 30,
        };
        insert_grade_record(&conn, old, &grade).unwrap();
        ratings(&conn, 42, "Lei", "Huang", "Computer Science");

        assert_eq!(engine().run_pass1(&mut conn, 2023, false).unwrap().considered, 0);
        assert_eq!(engine().run_pass1(&mut conn, 2019, false).unwrap().linked, 1);
    }

    #[test]
    fn test_ambiguous_initial_resolved_by_department() {
        let mut conn = test_conn();
        let huang = roster(&conn, "HUANG L", "CMPSC");
        ratings(&conn, 42, "Lei", "Huang", "Computer Science");
        ratings(&conn, 43, "Lin", "Huang", "Mathematics");

        let stats = engine().run_matching(&mut conn, 2023, false).unwrap();

        assert_eq!(stats.pass1.linked, 0);
        assert_eq!(stats.pass1.ambiguous, 1);
        assert_eq!(stats.pass3.linked, 1);
        assert_eq!(stats.total_new_matches, 1);

        let linked = get_identity(&conn, huang).unwrap().unwrap();
        assert_eq!(linked.external_id, Some(42));
        assert_eq!(linked.match_confidence, Some(90.0));
    }

    #[test]
    fn test_pass3_still_ambiguous_and_no_dept() {
        let mut conn = test_conn();
        roster(&conn, "HUANG L", "CMPSC");
        let no_dept = append_roster_identity(&conn, "WANG Y", None).unwrap();
        let grade = NewGrade {
            course_code: "CMPSC 16".to_string(),
            quarter: "Fall".to_string(),
            year: 2024,
            avg_gpa: None,
            enrolled: 10,
        };
        insert_grade_record(&conn, no_dept, &grade).unwrap();
        ratings(&conn, 42, "Lei", "Huang", "Computer Science");
        ratings(&conn, 43, "Lin", "Huang", "Computer Science");

        let stats = engine().run_pass3(&mut conn, 2023, false).unwrap();
        assert_eq!(stats.still_ambiguous, 1);
        assert_eq!(stats.no_dept, 1);
        assert_eq!(stats.linked, 0);
    }

    #[test]
    fn test_comma_name_links_in_pass2() {
        let mut conn = test_conn();
        let smith = roster(&conn, "SMITH, JOHN", "MATH");
        ratings(&conn, 7, "John", "Smith", "Mathematics");

        let stats = engine().run_matching(&mut conn, 2023, false).unwrap();
        assert_eq!(stats.pass2.linked, 1);

        let linked = get_identity(&conn, smith).unwrap().unwrap();
        assert_eq!(linked.external_id, Some(7));
        // 100 + department bonus, capped
        assert_eq!(linked.match_confidence, Some(100.0));
    }

    #[test]
    fn test_pass2_first_claim_wins() {
        let mut conn = test_conn();
        let first = roster(&conn, "SMITH JOHN", "MATH");
        let second = roster(&conn, "SMITH, JOHN", "PSTAT");
        ratings(&conn, 7, "John", "Smith", "Mathematics");

        let stats = engine().run_pass2(&mut conn, 2023, false).unwrap();
        assert_eq!(stats.linked, 1);
        assert_eq!(stats.below_threshold, 1);
        assert_eq!(get_identity(&conn, first).unwrap().unwrap().external_id, Some(7));
        assert_eq!(get_identity(&conn, second).unwrap().unwrap().external_id, None);
    }

    #[test]
    fn test_pass2_tolerates_middle_initial() {
        let mut conn = test_conn();
        let smith = roster(&conn, "SMITH, JOHN", "MATH");
        ratings(&conn, 8, "John A.", "Smith", "Mathematics");

        let stats = engine().run_pass2(&mut conn, 2023, false).unwrap();
        assert_eq!(stats.linked, 1);

        let linked = get_identity(&conn, smith).unwrap().unwrap();
        assert_eq!(linked.external_id, Some(8));
        // 91 + department bonus
        assert_eq!(linked.match_confidence, Some(96.0));
    }

    #[test]
    fn test_pass2_near_miss_flagged_for_review() {
        let mut conn = test_conn();
        let garcia = roster(&conn, "GARCIA, MARIA", "MATH");
        ratings(&conn, 9, "Maria", "Garcia-Lopez", "Mathematics");

        let stats = engine().run_pass2(&mut conn, 2023, false).unwrap();
        assert_eq!(stats.linked, 0);
        assert_eq!(stats.below_threshold, 1);
        assert_eq!(stats.needs_review, 1);
        assert_eq!(get_identity(&conn, garcia).unwrap().unwrap().external_id, None);
    }

    #[test]
    fn test_pass4_merges_abbreviated_duplicate() {
        let mut conn = test_conn();
        let abbreviated = roster(&conn, "CHANG S", "CMPSC");
        let full = roster(&conn, "CHANG SHIYU", "CMPSC");
        let donor = ratings(&conn, 100, "Shiyu", "Chang", "Computer Science");
        link_identities(&conn, abbreviated, donor, 75.0, false).unwrap();

        let before = count_store(&conn).unwrap();
        let stats = engine().run_matching(&mut conn, 2023, false).unwrap();
        let after = count_store(&conn).unwrap();

        assert_eq!(stats.pass4.merged, 1);
        assert!(get_identity(&conn, abbreviated).unwrap().is_none());

        let survivor = get_identity(&conn, full).unwrap().unwrap();
        assert_eq!(survivor.name_roster.as_deref(), Some("CHANG SHIYU"));
        assert_eq!(survivor.external_id, Some(100));

        let chang: Vec<_> = get_all_identities(&conn)
            .unwrap()
            .into_iter()
            .filter(|p| p.name_roster.as_deref().is_some_and(|n| n.starts_with("CHANG")))
            .collect();
        assert_eq!(chang.len(), 1);

        // Both identities taught the same course-term: one copy is dropped
        assert!(after.dependents() < before.dependents());
    }

    #[test]
    fn test_pass4_refuses_ambiguous_and_conflicting_pairs() {
        let mut conn = test_conn();
        roster(&conn, "LEE J", "MATH");
        roster(&conn, "LEE JOHN", "MATH");
        roster(&conn, "LEE JANE", "MATH");
        let park_s = roster(&conn, "PARK S", "ECE");
        let park_full = roster(&conn, "PARK SUNG", "ECE");
        conn.execute("UPDATE professors SET external_id = 500 WHERE id = ?1", [park_s]).unwrap();
        conn.execute("UPDATE professors SET external_id = 501 WHERE id = ?1", [park_full]).unwrap();

        let stats = engine().run_pass4(&mut conn, false).unwrap();
        assert_eq!(stats.merged, 0);
        assert_eq!(stats.ambiguous, 1);
        assert_eq!(stats.conflicting_links, 1);
        assert!(find_by_roster_name(&conn, "LEE J").unwrap().is_some());
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let mut conn = test_conn();
        roster(&conn, "HUANG L", "CMPSC");
        roster(&conn, "SMITH, JOHN", "MATH");
        roster(&conn, "CHANG S", "CMPSC");
        roster(&conn, "CHANG SHIYU", "CMPSC");
        ratings(&conn, 42, "Lei", "Huang", "Computer Science");
        ratings(&conn, 7, "John", "Smith", "Mathematics");

        let before = count_store(&conn).unwrap();
        let stats = engine().run_matching(&mut conn, 2023, true).unwrap();

        assert!(stats.dry_run);
        assert_eq!(stats.pass1.linked, 1);
        assert_eq!(stats.pass2.linked, 1);
        assert_eq!(stats.pass4.merged, 1);
        assert_eq!(count_store(&conn).unwrap(), before);
        assert_eq!(count_events(&conn, "identity_linked").unwrap(), 0);
        assert_eq!(count_events(&conn, "matching_run_completed").unwrap(), 0);
    }

    #[test]
    fn test_second_run_is_a_no_op() {
        let mut conn = test_conn();
        roster(&conn, "HUANG L", "CMPSC");
        roster(&conn, "SMITH, JOHN", "MATH");
        roster(&conn, "CHANG S", "CMPSC");
        roster(&conn, "CHANG SHIYU", "CMPSC");
        roster(&conn, "NGUYEN T", "PSTAT");
        ratings(&conn, 42, "Lei", "Huang", "Computer Science");
        ratings(&conn, 7, "John", "Smith", "Mathematics");
        ratings(&conn, 100, "Shiyu", "Chang", "Computer Science");

        let first = engine().run_matching(&mut conn, 2023, false).unwrap();
        assert!(first.total_new_matches > 0);
        assert_eq!(first.total_merges, 1);
        let after_first = count_store(&conn).unwrap();

        let second = engine().run_matching(&mut conn, 2023, false).unwrap();
        assert_eq!(second.total_new_matches, 0);
        assert_eq!(second.total_merges, 0);
        assert_eq!(count_store(&conn).unwrap(), after_first);
        assert_eq!(count_events(&conn, "matching_run_completed").unwrap(), 2);
    }

    #[test]
    fn test_external_ids_stay_unique() {
        let mut conn = test_conn();
        roster(&conn, "HUANG L", "CMPSC");
        roster(&conn, "HUANG, L", "CMPSC");
        roster(&conn, "HUANG LEI", "MATH");
        ratings(&conn, 42, "Lei", "Huang", "Computer Science");

        engine().run_matching(&mut conn, 2023, false).unwrap();

        let ids: Vec<i64> = get_all_identities(&conn)
            .unwrap()
            .into_iter()
            .filter_map(|p| p.external_id)
            .collect();
        let unique: HashSet<i64> = ids.iter().copied().collect();
        assert_eq!(ids.len(), 1);
        assert_eq!(unique.len(), ids.len());
    }

    #[test]
    fn test_failed_pairs_are_rolled_back_and_pass_continues() {
        let mut conn = test_conn();
        let huang = roster(&conn, "HUANG L", "CMPSC");
        let smith = roster(&conn, "SMITH J", "MATH");
        ratings(&conn, 42, "Lei", "Huang", "Computer Science");
        ratings(&conn, 7, "John", "Smith", "Mathematics");

        // Every link writes an audit event as its last step
        conn.execute("DROP TABLE events", []).unwrap();
        let before = count_store(&conn).unwrap();

        let stats = engine().run_pass1(&mut conn, 2023, false).unwrap();

        assert_eq!(stats.considered, 2);
        assert_eq!(stats.errors, 2);
        assert_eq!(stats.linked, 0);
        assert_eq!(get_identity(&conn, huang).unwrap().unwrap().external_id, None);
        assert_eq!(get_identity(&conn, smith).unwrap().unwrap().external_id, None);
        assert_eq!(count_store(&conn).unwrap(), before);
    }

    #[test]
    fn test_failed_merge_is_rolled_back() {
        let mut conn = test_conn();
        let abbreviated = roster(&conn, "CHANG S", "CMPSC");
        let full = roster(&conn, "CHANG SHIYU", "CMPSC");

        conn.execute("DROP TABLE events", []).unwrap();
        let before = count_store(&conn).unwrap();

        let stats = engine().run_pass4(&mut conn, false).unwrap();

        assert_eq!(stats.errors, 1);
        assert_eq!(stats.merged, 0);
        assert!(get_identity(&conn, abbreviated).unwrap().is_some());
        assert!(get_identity(&conn, full).unwrap().is_some());
        assert_eq!(count_store(&conn).unwrap(), before);
    }

    #[test]
    fn test_from_config_applies_department_threshold() {
        let config = MatchingConfig {
            department_fuzzy_threshold: 100.0,
            ..MatchingConfig::default()
        };
        let strict = MatchingEngine::from_config(config);

        assert_eq!(strict.config().department_fuzzy_threshold, 100.0);
        assert!(strict.departments().matches(Some("CMPSC"), Some("Computer Science")));
        assert!(!strict.departments().matches(Some("CMPSC"), Some("Computer Sciences")));
        assert!(engine().departments().matches(Some("CMPSC"), Some("Computer Sciences")));
    }
}
