// 🏛️ Department Alias Resolver - Roster codes vs. ratings department names
//
// Roster rows carry short codes ("CMPSC", "POL S"), ratings rows carry free text
// ("Computer Science", "Political Science"). The alias table is many-to-many:
// one code can have several names and one name can belong to several codes.
//
// Matching order: direct code → names, inverse name → codes, fuzzy fallback.
// Unknown codes never match.

use crate::names::indel_ratio;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

/// Default similarity (0-100) required by the fuzzy fallback
pub const DEFAULT_FUZZY_THRESHOLD: f64 = 80.0;

/// Built-in code → ratings-name table
const DEFAULT_ALIASES: &[(&str, &[&str])] = &[
    ("ANTH", &["Anthropology"]),
    ("ART", &["Art", "Art Studio"]),
    ("ARTHI", &["Art History", "History Of Art And Architecture"]),
    ("ARTST", &["Art Studio"]),
    ("ASTRO", &["Astronomy", "Physics"]),
    ("BIOE", &["Bioengineering"]),
    ("BIOL", &["Biology", "Biological Sciences"]),
    ("BMSE", &["Biomolecular Science And Engineering"]),
    ("BL ST", &["Black Studies"]),
    ("CH E", &["Chemical Engineering"]),
    ("CHEM", &["Chemistry", "Chemistry And Biochemistry"]),
    ("CHIN", &["Chinese"]),
    ("CLASS", &["Classics"]),
    ("COMM", &["Communication"]),
    ("CMPSC", &["Computer Science"]),
    ("CMPTG", &["Computing"]),
    ("CNCSP", &["Counseling, Clinical & School Psychology"]),
    ("DANCE", &["Dance"]),
    ("DYNS", &["Dynamical Neuroscience"]),
    ("EARTH", &["Earth Science"]),
    ("EACS", &["East Asian Cultural Studies"]),
    ("ECON", &["Economics"]),
    ("ED", &["Education"]),
    ("ECE", &["Electrical And Computer Engineering", "Electrical Engineering"]),
    ("ENGL", &["English"]),
    ("ENGR", &["Engineering"]),
    ("ENV S", &["Environmental Studies"]),
    ("ESM", &["Environmental Science And Management"]),
    ("ES", &["Ethnic Studies"]),
    ("FAMST", &["Film And Media Studies"]),
    ("FEMST", &["Feminist Studies"]),
    ("FR", &["French", "French And Italian"]),
    ("GEOG", &["Geography"]),
    ("GER", &["German", "Germanic And Slavic Studies"]),
    ("GPS", &["Global Studies", "Global & International Studies"]),
    ("GREEK", &["Classics"]),
    ("HIST", &["History"]),
    ("INT", &["Interdisciplinary"]),
    ("ITAL", &["Italian", "French And Italian"]),
    ("JAPAN", &["Japanese"]),
    ("KOR", &["Korean"]),
    ("LATIN", &["Classics"]),
    ("LAIS", &["Latin American And Iberian Studies"]),
    ("LING", &["Linguistics"]),
    ("LIT", &["Comparative Literature", "Literature"]),
    ("MARSC", &["Marine Science"]),
    ("MATRL", &["Materials"]),
    ("MATH", &["Mathematics"]),
    ("ME", &["Mechanical Engineering"]),
    ("MAT", &["Media Arts And Technology"]),
    ("MCDB", &["Molecular, Cellular & Developmental Biology", "Biology"]),
    ("MUS", &["Music"]),
    ("PHIL", &["Philosophy"]),
    ("PHYS", &["Physics"]),
    ("POL S", &["Political Science"]),
    ("PORT", &["Portuguese"]),
    ("PSTAT", &["Statistics And Applied Probability", "Statistics"]),
    ("PSY", &["Psychology", "Psychological & Brain Sciences"]),
    ("RG ST", &["Religious Studies"]),
    ("RENST", &["Renaissance Studies"]),
    ("SLAV", &["Slavic Languages And Literature", "Germanic And Slavic Studies"]),
    ("SOC", &["Sociology"]),
    ("SPAN", &["Spanish", "Spanish And Portuguese"]),
    ("SHS", &["Society And Health Sciences"]),
    ("TMP", &["Technology Management"]),
    ("THTR", &["Theater", "Theater And Dance"]),
    ("WRIT", &["Writing"]),
    ("W&L", &["Writing And Literature"]),
];

// ============================================================================
// ALIAS FILE FORMAT
// ============================================================================

/// On-disk alias extension: `{"CODE": ["Name", "Other Name"]}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AliasFile(pub BTreeMap<String, Vec<String>>);

// ============================================================================
// DEPARTMENT ALIASES
// ============================================================================

/// Alias table plus its precomputed inverse.
///
/// Constructed explicitly and handed to the matching engine; there is no
/// process-wide instance.
#[derive(Debug, Clone)]
pub struct DepartmentAliases {
    /// UPPERCASE code → lowercase names
    by_code: HashMap<String, Vec<String>>,

    /// lowercase name → UPPERCASE codes
    by_name: HashMap<String, Vec<String>>,

    /// Similarity (0-100) required by the fuzzy fallback
    fuzzy_threshold: f64,
}

impl DepartmentAliases {
    /// Empty table
    pub fn new() -> Self {
        DepartmentAliases {
            by_code: HashMap::new(),
            by_name: HashMap::new(),
            fuzzy_threshold: DEFAULT_FUZZY_THRESHOLD,
        }
    }

    /// Table pre-loaded with the built-in campus aliases
    pub fn with_defaults() -> Self {
        let mut aliases = DepartmentAliases::new();
        for (code, names) in DEFAULT_ALIASES {
            aliases.register(code, names.iter().copied());
        }
        aliases
    }

    /// Built-in aliases extended with the entries of a JSON alias file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read department alias file: {:?}", path.as_ref()))?;

        let file: AliasFile =
            serde_json::from_str(&content).context("Failed to parse department alias JSON")?;

        let mut aliases = DepartmentAliases::with_defaults();
        for (code, names) in &file.0 {
            aliases.register(code, names.iter().map(String::as_str));
        }
        Ok(aliases)
    }

    pub fn with_fuzzy_threshold(mut self, threshold: f64) -> Self {
        self.fuzzy_threshold = threshold.clamp(0.0, 100.0);
        self
    }

    /// Add names for a code, keeping both directions of the index in sync
    pub fn register<'a, I>(&mut self, code: &str, names: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let code = normalize_code(code);
        if code.is_empty() {
            return;
        }

        for name in names {
            let name = normalize_name(name);
            if name.is_empty() {
                continue;
            }

            let known = self.by_code.entry(code.clone()).or_default();
            if !known.contains(&name) {
                known.push(name.clone());
            }

            let codes = self.by_name.entry(name).or_default();
            if !codes.contains(&code) {
                codes.push(code.clone());
            }
        }
    }

    /// Does the roster department (a code, or a known name) denote the same
    /// department as the ratings department name?
    pub fn matches(&self, roster_department: Option<&str>, ratings_department: Option<&str>) -> bool {
        let (Some(roster), Some(ratings)) = (roster_department, ratings_department) else {
            return false;
        };

        let ratings_name = normalize_name(ratings);
        if ratings_name.is_empty() {
            return false;
        }

        let codes = self.codes_for(roster);
        if codes.is_empty() {
            return false;
        }

        // 1. direct: code → names
        if codes.iter().any(|code| self.names_for_code(code).contains(&ratings_name)) {
            return true;
        }

        // 2. inverse: name → codes
        if let Some(owners) = self.by_name.get(&ratings_name) {
            if codes.iter().any(|code| owners.contains(code)) {
                return true;
            }
        }

        // 3. fuzzy fallback against every alias of the code(s)
        codes.iter().any(|code| {
            self.names_for_code(code)
                .iter()
                .any(|known| similarity(known, &ratings_name) >= self.fuzzy_threshold)
        })
    }

    /// Codes a roster department resolves to: itself if it is a known code,
    /// else the owners of a known name. Empty for unknown departments.
    pub fn codes_for(&self, roster_department: &str) -> Vec<String> {
        let code = normalize_code(roster_department);
        if self.by_code.contains_key(&code) {
            return vec![code];
        }

        self.by_name
            .get(&normalize_name(roster_department))
            .cloned()
            .unwrap_or_default()
    }

    fn names_for_code(&self, code: &str) -> &[String] {
        self.by_code.get(code).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains_code(&self, code: &str) -> bool {
        self.by_code.contains_key(&normalize_code(code))
    }

    pub fn code_count(&self) -> usize {
        self.by_code.len()
    }
}

impl Default for DepartmentAliases {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn normalize_code(code: &str) -> String {
    code.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase()
}

fn normalize_name(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn similarity(a: &str, b: &str) -> f64 {
    indel_ratio(a, b)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn aliases() -> DepartmentAliases {
        DepartmentAliases::with_defaults()
    }

    #[test]
    fn test_direct_match() {
        assert!(aliases().matches(Some("CMPSC"), Some("Computer Science")));
    }

    #[test]
    fn test_case_and_whitespace_insensitive() {
        assert!(aliases().matches(Some("cmpsc"), Some("computer science")));
        assert!(aliases().matches(Some(" pol  s "), Some("Political   Science")));
    }

    #[test]
    fn test_no_match() {
        assert!(!aliases().matches(Some("CMPSC"), Some("Mathematics")));
    }

    #[test]
    fn test_empty_inputs() {
        let table = aliases();
        assert!(!table.matches(Some(""), Some("Computer Science")));
        assert!(!table.matches(Some("CMPSC"), Some("")));
        assert!(!table.matches(None, Some("Computer Science")));
        assert!(!table.matches(Some("CMPSC"), None));
    }

    #[test]
    fn test_multi_name_department() {
        let table = aliases();
        assert!(table.matches(Some("CHEM"), Some("Chemistry")));
        assert!(table.matches(Some("CHEM"), Some("Chemistry And Biochemistry")));
        assert!(table.matches(Some("PSTAT"), Some("Statistics")));
    }

    #[test]
    fn test_shared_name_belongs_to_several_codes() {
        let table = aliases();
        assert!(table.matches(Some("GREEK"), Some("Classics")));
        assert!(table.matches(Some("LATIN"), Some("Classics")));
        assert!(table.matches(Some("CLASS"), Some("Classics")));
    }

    #[test]
    fn test_fuzzy_fallback() {
        let table = aliases();
        assert!(table.matches(Some("ECE"), Some("Electrical & Computer Engineering")));
        assert!(table.matches(Some("CMPSC"), Some("Computer Sciences")));
        assert!(!table.matches(Some("CMPSC"), Some("Computer Engineering")));
    }

    #[test]
    fn test_unknown_code_never_matches() {
        let table = aliases();
        assert!(!table.matches(Some("ZZZZZ"), Some("Computer Science")));
        assert!(!table.matches(Some("ZZZZZ"), Some("zzzzz")));
    }

    #[test]
    fn test_roster_department_given_as_name() {
        let table = aliases();
        assert_eq!(table.codes_for("Computer Science"), vec!["CMPSC".to_string()]);
        assert!(table.matches(Some("Computer Science"), Some("Computer Science")));
    }

    #[test]
    fn test_register_keeps_inverse_in_sync() {
        let mut table = DepartmentAliases::new();
        table.register("DS", ["Data Science", "Data Science"]);
        table.register("CMPSC", ["Data Science"]);

        assert_eq!(table.code_count(), 2);
        assert!(table.matches(Some("DS"), Some("data science")));
        assert!(table.matches(Some("CMPSC"), Some("Data Science")));
        assert_eq!(table.codes_for("data science").len(), 2);
    }

    #[test]
    fn test_common_codes_present() {
        let table = aliases();
        for code in ["CMPSC", "MATH", "PHYS", "ECON", "ENGL", "HIST", "PSTAT", "PSY"] {
            assert!(table.contains_code(code), "{} missing from alias table", code);
        }
    }

    #[test]
    fn test_from_file_extends_defaults() {
        let path = std::env::temp_dir().join(format!("dept_aliases_{}.json", uuid::Uuid::new_v4()));
        let mut file = fs::File::create(&path).unwrap();
        write!(file, r#"{{"DATA": ["Data Science"], "CMPSC": ["Computing Sciences"]}}"#).unwrap();

        let table = DepartmentAliases::from_file(&path).unwrap();
        fs::remove_file(&path).unwrap();

        assert!(table.matches(Some("DATA"), Some("Data Science")));
        assert!(table.matches(Some("CMPSC"), Some("Computing Sciences")));
        assert!(table.matches(Some("CMPSC"), Some("Computer Science")));
    }

    #[test]
    fn test_strict_threshold_disables_fuzzy() {
        let table = aliases().with_fuzzy_threshold(100.0);
        assert!(!table.matches(Some("CMPSC"), Some("Computer Sciences")));
        assert!(table.matches(Some("CMPSC"), Some("Computer Science")));
    }
}
