use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;

use professor_linkage::config::{db_path_from_env, department_aliases_path_from_env};
use professor_linkage::{
    count_store, import_ratings_csv, import_roster_csv, link_atomic, merge_atomic, open_database,
    DepartmentAliases, IdentityStatus, LinkOutcome, MatchingConfig, MatchingEngine, MergeOutcome,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// SQLite database (defaults to $PROFESSOR_DB_PATH, then professors.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Extra department aliases as JSON: {"CODE": ["Name", ...]}
    #[arg(long, global = true)]
    department_aliases: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run matching passes 1-4 and print the stats as JSON
    Match {
        /// Only match roster identities with grades from this year on
        #[arg(long)]
        min_year: Option<i32>,

        /// Decide everything, write nothing
        #[arg(long)]
        dry_run: bool,
    },

    /// Manually link a roster identity to a ratings identity
    Link {
        winner_id: i64,
        donor_id: i64,

        #[arg(long, default_value_t = 100.0)]
        confidence: f64,
    },

    /// Manually merge a duplicate roster identity into another
    Merge { loser_id: i64, winner_id: i64 },

    /// Load a roster (grades) CSV
    ImportRoster { csv: PathBuf },

    /// Load a ratings CSV
    ImportRatings { csv: PathBuf },

    /// Show identity and dependent counts
    Status,
}

fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let cli = Cli::parse();

    let db_path = cli.db.clone().unwrap_or_else(|| PathBuf::from(db_path_from_env()));
    let mut conn = open_database(&db_path)?;
    info!("Using database {:?}", db_path);

    match cli.command {
        Command::Match { min_year, dry_run } => {
            let config = MatchingConfig::from_env();
            let departments = load_departments(cli.department_aliases, &config)?;
            let engine = MatchingEngine::new(config, departments);

            engine.config().log_config();
            info!("Loaded {} department codes", engine.departments().code_count());

            let min_year = min_year.unwrap_or(engine.config().min_year);

            let stats = engine.run_matching(&mut conn, min_year, dry_run)?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Link {
            winner_id,
            donor_id,
            confidence,
        } => match link_atomic(&mut conn, winner_id, donor_id, confidence)? {
            LinkOutcome::Linked { external_id } => {
                println!("✓ Identity {} linked to external id {}", winner_id, external_id);
            }
            LinkOutcome::Collision {
                external_id,
                holder_id,
            } => {
                println!("✗ External id {} is already held by identity {}", external_id, holder_id);
            }
            LinkOutcome::Skipped { reason } => println!("✗ Not linked: {}", reason),
            LinkOutcome::Proposed { .. } => {}
        },
        Command::Merge { loser_id, winner_id } => match merge_atomic(&mut conn, loser_id, winner_id)? {
            MergeOutcome::Merged(summary) => {
                println!("✓ Identity {} merged into {}", loser_id, winner_id);
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
            MergeOutcome::Conflict {
                loser_external_id,
                winner_external_id,
            } => {
                println!(
                    "✗ Both identities are linked (external ids {} and {})",
                    loser_external_id, winner_external_id
                );
            }
            MergeOutcome::Skipped { reason } => println!("✗ Not merged: {}", reason),
            MergeOutcome::Proposed => {}
        },
        Command::ImportRoster { csv } => {
            let report = import_roster_csv(&mut conn, &csv)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::ImportRatings { csv } => {
            let report = import_ratings_csv(&mut conn, &csv)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Status => {
            let counts = count_store(&conn)?;
            println!("📊 Professor identities");
            for (status, count) in [
                (IdentityStatus::Linked, counts.linked),
                (IdentityStatus::UnmatchedRoster, counts.unmatched_roster),
                (IdentityStatus::UnmatchedRatings, counts.unmatched_ratings),
            ] {
                println!("   {:<19} {}", format!("{}:", status.as_str()), count);
            }
            println!("   Grade records:      {}", counts.grade_records);
            println!("   Rating records:     {}", counts.rating_records);
            println!("   Score records:      {}", counts.score_records);
        }
    }

    Ok(())
}

/// Built-in aliases, extended from --department-aliases or DEPARTMENT_ALIASES_PATH
fn load_departments(flag: Option<PathBuf>, config: &MatchingConfig) -> Result<DepartmentAliases> {
    let path = flag.or_else(|| department_aliases_path_from_env().map(PathBuf::from));

    let departments = match path {
        Some(path) => DepartmentAliases::from_file(&path)
            .with_context(|| format!("Failed to load department aliases from {:?}", path))?,
        None => DepartmentAliases::with_defaults(),
    };

    Ok(departments.with_fuzzy_threshold(config.department_fuzzy_threshold))
}
