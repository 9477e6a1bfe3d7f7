//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Discover and retrieve digitized historical works from digital-library
/// providers.
///
/// Reads an input CSV of works, searches the configured providers for each
/// record, downloads the best candidate's artifacts, and maintains a work
/// journal under the output directory.
#[derive(Parser, Debug)]
#[command(name = "foliofetch")]
#[command(author, version, about)]
pub struct Args {
    /// Input CSV file (required unless a status command is used)
    pub input: Option<PathBuf>,

    /// Output directory for work folders, index.csv, and state
    #[arg(short, long, default_value = "retrieved")]
    pub output_dir: PathBuf,

    /// Search and journal only; skip all downloads
    #[arg(long)]
    pub dry_run: bool,

    /// Log level (error, warn, info, debug, trace); RUST_LOG wins
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Config file path (overrides FOLIOFETCH_CONFIG and the default lookup)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Show interactive progress even when stderr is not a terminal
    #[arg(long, conflicts_with = "force_cli")]
    pub force_interactive: bool,

    /// Plain line-based output, no interactive progress
    #[arg(long)]
    pub force_cli: bool,

    /// Print the quota ledger and deferred queue, then exit
    #[arg(long)]
    pub quota_status: bool,

    /// Prune old terminal items from the deferred queue, then exit
    #[arg(long)]
    pub cleanup_deferred: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_minimal_invocation_parses() {
        let args = Args::try_parse_from(["foliofetch", "works.csv"]).unwrap();
        assert_eq!(args.input.unwrap(), PathBuf::from("works.csv"));
        assert_eq!(args.output_dir, PathBuf::from("retrieved"));
        assert!(!args.dry_run);
        assert_eq!(args.log_level, "info");
        assert!(args.config.is_none());
    }

    #[test]
    fn test_cli_no_input_allowed_for_status_commands() {
        let args = Args::try_parse_from(["foliofetch", "--quota-status"]).unwrap();
        assert!(args.input.is_none());
        assert!(args.quota_status);

        let args = Args::try_parse_from(["foliofetch", "--cleanup-deferred"]).unwrap();
        assert!(args.cleanup_deferred);
    }

    #[test]
    fn test_cli_output_dir_flag() {
        let args =
            Args::try_parse_from(["foliofetch", "works.csv", "--output-dir", "/data/out"]).unwrap();
        assert_eq!(args.output_dir, PathBuf::from("/data/out"));

        let args = Args::try_parse_from(["foliofetch", "works.csv", "-o", "out"]).unwrap();
        assert_eq!(args.output_dir, PathBuf::from("out"));
    }

    #[test]
    fn test_cli_dry_run_flag() {
        let args = Args::try_parse_from(["foliofetch", "works.csv", "--dry-run"]).unwrap();
        assert!(args.dry_run);
    }

    #[test]
    fn test_cli_force_flags_conflict() {
        let args = Args::try_parse_from(["foliofetch", "works.csv", "--force-cli"]).unwrap();
        assert!(args.force_cli);

        let result = Args::try_parse_from([
            "foliofetch",
            "works.csv",
            "--force-cli",
            "--force-interactive",
        ]);
        let err = result.unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn test_cli_log_level_flag() {
        let args =
            Args::try_parse_from(["foliofetch", "works.csv", "--log-level", "debug"]).unwrap();
        assert_eq!(args.log_level, "debug");
    }

    #[test]
    fn test_cli_config_flag() {
        let args =
            Args::try_parse_from(["foliofetch", "works.csv", "--config", "custom.toml"]).unwrap();
        assert_eq!(args.config.unwrap(), PathBuf::from("custom.toml"));
    }

    #[test]
    fn test_cli_help_flag_shows_usage() {
        let result = Args::try_parse_from(["foliofetch", "--help"]);
        let err = result.unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn test_cli_version_flag_shows_version() {
        let result = Args::try_parse_from(["foliofetch", "--version"]);
        let err = result.unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }

    #[test]
    fn test_cli_unknown_flag_rejected() {
        let result = Args::try_parse_from(["foliofetch", "--nope"]);
        let err = result.unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::UnknownArgument);
    }
}
