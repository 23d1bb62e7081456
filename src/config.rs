// ⚙️ Matching Configuration - thresholds and confidences for every pass
//
// Defaults are the values the matcher has been tuned with. Every field can be
// overridden through a MATCH_* environment variable.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

pub const DEFAULT_DB_PATH: &str = "professors.db";
pub const DB_PATH_ENV: &str = "PROFESSOR_DB_PATH";
pub const DEPARTMENT_ALIASES_ENV: &str = "DEPARTMENT_ALIASES_PATH";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// Pass 1 confidence when the departments disagree (or are unknown)
    pub initial_confidence: f64,

    /// Pass 1 confidence when the departments agree
    pub initial_dept_confidence: f64,

    /// Pass 2 acceptance score
    pub fuzzy_accept_threshold: f64,

    /// Pass 2 best scores at or above this (but below acceptance) are logged for review
    pub fuzzy_review_threshold: f64,

    /// Added to a Pass 2 score when departments agree
    pub department_bonus: f64,

    /// Pass 3 fixed confidence
    pub disambiguation_confidence: f64,

    /// Department alias fuzzy fallback
    pub department_fuzzy_threshold: f64,

    /// Only roster identities with grades from this year on are matched
    pub min_year: i32,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            initial_confidence: 75.0,
            initial_dept_confidence: 90.0,
            fuzzy_accept_threshold: 85.0,
            fuzzy_review_threshold: 70.0,
            department_bonus: 5.0,
            disambiguation_confidence: 90.0,
            department_fuzzy_threshold: 80.0,
            min_year: 2023,
        }
    }
}

impl MatchingConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let config = Self {
            initial_confidence: env_or("MATCH_INITIAL_CONFIDENCE", defaults.initial_confidence),
            initial_dept_confidence: env_or("MATCH_INITIAL_DEPT_CONFIDENCE", defaults.initial_dept_confidence),
            fuzzy_accept_threshold: env_or("MATCH_FUZZY_THRESHOLD", defaults.fuzzy_accept_threshold),
            fuzzy_review_threshold: env_or("MATCH_REVIEW_THRESHOLD", defaults.fuzzy_review_threshold),
            department_bonus: env_or("MATCH_DEPT_BONUS", defaults.department_bonus),
            disambiguation_confidence: env_or("MATCH_DISAMBIGUATION_CONFIDENCE", defaults.disambiguation_confidence),
            department_fuzzy_threshold: env_or("MATCH_DEPT_FUZZY_THRESHOLD", defaults.department_fuzzy_threshold),
            min_year: env_or("MATCH_MIN_YEAR", defaults.min_year),
        };

        debug!("Matching config from env: {:?}", config);
        config
    }

    pub fn log_config(&self) {
        info!("⚙️ Matching configuration");
        info!(
            "   Pass 1: confidence {} / {} with department",
            self.initial_confidence, self.initial_dept_confidence
        );
        info!(
            "   Pass 2: accept >= {}, review >= {}, department bonus +{}",
            self.fuzzy_accept_threshold, self.fuzzy_review_threshold, self.department_bonus
        );
        info!("   Pass 3: confidence {}", self.disambiguation_confidence);
        info!("   Departments: fuzzy threshold {}", self.department_fuzzy_threshold);
        info!("   Minimum grade year: {}", self.min_year);
    }
}

/// Database path from PROFESSOR_DB_PATH, falling back to the default file
pub fn db_path_from_env() -> String {
    env::var(DB_PATH_ENV).unwrap_or_else(|_| DEFAULT_DB_PATH.to_string())
}

/// Optional department alias file from DEPARTMENT_ALIASES_PATH
pub fn department_aliases_path_from_env() -> Option<String> {
    env::var(DEPARTMENT_ALIASES_ENV)
        .ok()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
}

fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!("Ignoring {}={:?}: not a valid value, using {}", key, raw, default);
                default
            }
        },
        Err(_) => default,
    }
}
