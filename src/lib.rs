// Professor Linkage - Core Library
// Links roster and ratings identities; exposes all modules for the CLI and tests

pub mod db;
pub mod names;        // Name Normalizer
pub mod departments;  // Department Alias Resolver
pub mod candidates;   // Candidate Indexer
pub mod ingest;       // Ingestion boundary (appends + CSV import)
pub mod linking;      // Link/Merge Transaction
pub mod matching;     // Passes 1-4 + Orchestrator
pub mod config;

// Re-export commonly used types
pub use db::{
    IdentityRecord, IdentityStatus, GradeRecord, NewGrade, RatingRecord, ScoreRecord,
    Event, StoreCounts,
    open_database, setup_database, count_store,
    insert_event, get_events_for_entity,
};
pub use names::{
    ParsedName,
    parse_roster_name, parse_ratings_name, is_initial_only, initial_matches,
    normalize_for_compare, normalize_roster_for_compare, token_sort_ratio, indel_ratio,
};
pub use departments::{AliasFile, DepartmentAliases};
pub use candidates::{CandidateIndex, IndexedCandidate};
pub use ingest::{
    RosterRow, RatingCandidate, ImportReport,
    append_roster_identity, append_rating_candidate,
    import_roster_csv, import_ratings_csv,
};
pub use linking::{
    LinkOutcome, MergeOutcome, MergeSummary,
    link_identities, merge_identities, link_atomic, merge_atomic,
};
pub use matching::{
    MatchingEngine, MatchingStats,
    Pass1Stats, Pass2Stats, Pass3Stats, Pass4Stats,
};
pub use config::MatchingConfig;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
