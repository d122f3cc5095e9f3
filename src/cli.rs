use clap::{Args, Parser, Subcommand};

use crate::types::LogLevel;

#[derive(Parser, Debug)]
#[command(
    name = "livephoto-cleaner",
    version,
    about = "Replace Live Photos with still-image copies and reclaim their video storage"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Options shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Photo library directory (contains library.json)
    #[arg(long, global = true, env = "LIVEPHOTO_CLEANER_LIBRARY")]
    pub library: Option<String>,

    /// Directory for the ledger and settings
    #[arg(long, global = true, default_value = "~/.livephoto-cleaner")]
    pub data_directory: String,

    /// Log level
    #[arg(long, global = true, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Disable progress bar
    #[arg(long, global = true)]
    pub no_progress_bar: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List Live Photos that have not been processed yet
    Scan(ScanArgs),

    /// Replace Live Photos with still copies
    Clean(CleanArgs),

    /// Show ledger size, candidate counts and reclaimable space
    Status,

    /// Forget which assets were processed
    ResetLedger(ResetLedgerArgs),

    /// Show or change persisted settings
    Settings(SettingsArgs),

    /// Approximate space freed by cleaning
    FreedSpace(FreedSpaceArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ScanArgs {
    /// Print every candidate identifier
    #[arg(long)]
    pub list: bool,
}

#[derive(Args, Debug, Clone)]
pub struct CleanArgs {
    /// Only process these asset identifiers (default: every candidate)
    #[arg(long = "asset", value_name = "ID")]
    pub assets: Vec<String>,

    /// Process at most N assets, oldest first
    #[arg(long)]
    pub limit: Option<usize>,

    /// Also process assets with edits
    #[arg(long)]
    pub include_edited: bool,

    /// Load cloud-only originals over the network for this run
    #[arg(long)]
    pub include_icloud: bool,

    /// Keep the original Live Photos for this run
    #[arg(long)]
    pub keep_originals: bool,

    /// Do not add copies to the destination album for this run
    #[arg(long)]
    pub no_album: bool,

    /// Skip confirmation prompts; a cloud prompt is answered with "abandon"
    #[arg(short = 'y', long)]
    pub yes: bool,

    /// Assets per library transaction
    #[arg(long, default_value_t = 25, value_parser = clap::value_parser!(u16).range(1..))]
    pub block_size: u16,

    /// Concurrent resource requests per batch
    #[arg(long, default_value_t = 8, value_parser = clap::value_parser!(u16).range(1..))]
    pub concurrent_fetches: u16,

    /// Retries for a failed resource request
    #[arg(long, default_value_t = 2)]
    pub max_retries: u32,

    /// Base delay in seconds between retries
    #[arg(long, default_value_t = 1)]
    pub retry_delay: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ResetLedgerArgs {
    /// Skip the confirmation prompt
    #[arg(short = 'y', long)]
    pub yes: bool,
}

#[derive(Args, Debug, Clone)]
pub struct SettingsArgs {
    /// Persist a setting, e.g. --set move_to_album=false
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub assignments: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct FreedSpaceArgs {
    /// Measure every candidate instead of unedited ones only
    #[arg(long)]
    pub all: bool,

    /// Only measure these asset identifiers
    #[arg(long = "asset", value_name = "ID", conflicts_with = "all")]
    pub assets: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_defaults() {
        let cli = Cli::try_parse_from(["livephoto-cleaner", "--library", "/lib", "clean"]).unwrap();
        assert_eq!(cli.global.library.as_deref(), Some("/lib"));
        assert_eq!(cli.global.data_directory, "~/.livephoto-cleaner");
        match cli.command {
            Command::Clean(args) => {
                assert_eq!(args.block_size, 25);
                assert_eq!(args.concurrent_fetches, 8);
                assert_eq!(args.max_retries, 2);
                assert_eq!(args.retry_delay, 1);
                assert!(!args.include_icloud);
                assert!(args.assets.is_empty());
            }
            other => panic!("expected clean, got {other:?}"),
        }
    }

    #[test]
    fn test_global_args_after_subcommand() {
        let cli = Cli::try_parse_from([
            "livephoto-cleaner",
            "status",
            "--library",
            "/lib",
            "--log-level",
            "warn",
        ])
        .unwrap();
        assert!(matches!(cli.command, Command::Status));
        assert_eq!(cli.global.log_level, LogLevel::Warn);
    }

    #[test]
    fn test_zero_block_size_rejected() {
        assert!(Cli::try_parse_from(["livephoto-cleaner", "clean", "--block-size", "0"]).is_err());
    }

    #[test]
    fn test_settings_assignments() {
        let cli = Cli::try_parse_from([
            "livephoto-cleaner",
            "settings",
            "--set",
            "move_to_album=false",
            "--set",
            "include_icloud_images=true",
        ])
        .unwrap();
        match cli.command {
            Command::Settings(args) => assert_eq!(args.assignments.len(), 2),
            other => panic!("expected settings, got {other:?}"),
        }
    }

    #[test]
    fn test_freed_space_all_conflicts_with_assets() {
        assert!(Cli::try_parse_from([
            "livephoto-cleaner",
            "freed-space",
            "--all",
            "--asset",
            "X"
        ])
        .is_err());
    }
}
