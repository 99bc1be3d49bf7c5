//! Command-line argument types for the `mend` binary. Thin glue only:
//! parsing lives here, dispatch in `main.rs`, everything else in the
//! library.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mend")]
#[command(version)]
#[command(about = "Diagnose build/runtime failures and apply remediations safely")]
pub struct Args {
    /// Project directory to operate on
    #[arg(long, default_value = ".")]
    pub project: PathBuf,

    /// JSON file with environment facts from the analyzer
    #[arg(long)]
    pub context: Option<PathBuf>,

    /// Emit machine-readable JSON instead of colored text
    #[arg(long)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Rank known failure patterns against a failure description
    Diagnose {
        /// Free-text failure description (error output, symptom, ...)
        description: String,

        /// Show at most this many candidates
        #[arg(long, default_value = "5")]
        limit: usize,
    },

    /// Apply a solution file transactionally
    Apply {
        /// Path to a solution JSON file
        solution: PathBuf,

        /// Pattern id to record the outcome against
        #[arg(long)]
        pattern_id: Option<String>,

        /// Overall deadline for the whole apply, in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Restore a backup (the latest when no id is given)
    Rollback {
        /// Backup id to restore
        id: Option<String>,
    },

    /// Show catalog statistics
    Stats,

    /// Import patterns from a flat JSON catalog
    Import {
        /// Path to a JSON array of pattern records
        catalog: PathBuf,
    },

    /// Export the pattern catalog as flat JSON to stdout
    Export,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_shape_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_diagnose_parses() {
        let args = Args::parse_from(["mend", "diagnose", "EADDRINUSE :3000"]);
        match args.command {
            Command::Diagnose { description, limit } => {
                assert_eq!(description, "EADDRINUSE :3000");
                assert_eq!(limit, 5);
            }
            _ => panic!("expected diagnose"),
        }
    }

    #[test]
    fn test_apply_with_timeout_parses() {
        let args = Args::parse_from([
            "mend", "apply", "fix.json", "--pattern-id", "p1", "--timeout-secs", "60",
        ]);
        match args.command {
            Command::Apply { solution, pattern_id, timeout_secs } => {
                assert_eq!(solution, PathBuf::from("fix.json"));
                assert_eq!(pattern_id.as_deref(), Some("p1"));
                assert_eq!(timeout_secs, Some(60));
            }
            _ => panic!("expected apply"),
        }
    }

    #[test]
    fn test_rollback_id_optional() {
        let args = Args::parse_from(["mend", "rollback"]);
        assert!(matches!(args.command, Command::Rollback { id: None }));
    }
}
