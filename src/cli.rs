use clap::{Args, Parser, Subcommand};

use crate::config::DEFAULT_CONFIG_PATH;
use crate::types::{LogLevel, StatusFilter};

#[derive(Parser, Debug)]
#[command(
    name = "bucket-mirror",
    about = "Mirror an S3 bucket into a local directory tree"
)]
pub struct Cli {
    /// Path to the YAML settings file
    #[arg(short = 'c', long, global = true, default_value = DEFAULT_CONFIG_PATH, env = "BUCKET_MIRROR_CONFIG")]
    pub config: String,

    /// Log level (RUST_LOG takes precedence when set)
    #[arg(long, global = true, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Register the configured bucket in the ledger
    Configure,

    /// Mirror continuously on the configured polling interval
    Monitor,

    /// Run a single cycle, or mirror one object
    Sync(SyncArgs),

    /// Show what the next cycle would download, without downloading
    Diff(ListArgs),

    /// Show ledger counts and the last cycle times
    Status,

    /// List ledger entries
    List(EntryListArgs),

    /// Clear every ledger entry for the bucket
    Reset(ResetArgs),

    /// Move failed entries back to pending and run a cycle
    RetryFailed,

    /// Count the files already under the destination root
    SnapshotLocal(ListArgs),

    /// Count the objects under the included paths
    SnapshotRemote(ListArgs),

    /// Check that completed entries still exist locally with the recorded size
    Verify,
}

#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncArgs {
    /// Mirror only this key, whatever its ledger status
    #[arg(long)]
    pub key: Option<String>,

    /// Download one object at a time
    #[arg(long)]
    pub single_threaded: bool,
}

#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct ListArgs {
    /// Print every item, not just the totals
    #[arg(long)]
    pub list: bool,
}

#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryListArgs {
    /// Only show entries with this status (repeatable)
    #[arg(long = "status", value_enum)]
    pub statuses: Vec<StatusFilter>,
}

#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct ResetArgs {
    /// Skip the confirmation prompt
    #[arg(short = 'y', long)]
    pub yes: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["bucket-mirror", "status"]).unwrap();
        assert_eq!(cli.config, DEFAULT_CONFIG_PATH);
        assert_eq!(cli.log_level, LogLevel::Info);
        assert_eq!(cli.command, Command::Status);
    }

    #[test]
    fn test_sync_flags() {
        let cli = Cli::try_parse_from([
            "bucket-mirror",
            "sync",
            "--key",
            "photos/a.jpg",
            "--single-threaded",
        ])
        .unwrap();
        assert_eq!(
            cli.command,
            Command::Sync(SyncArgs {
                key: Some("photos/a.jpg".into()),
                single_threaded: true,
            })
        );
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "bucket-mirror",
            "monitor",
            "--config",
            "/etc/mirror.yaml",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(cli.config, "/etc/mirror.yaml");
        assert_eq!(cli.log_level, LogLevel::Debug);
    }

    #[test]
    fn test_list_repeated_status() {
        let cli = Cli::try_parse_from([
            "bucket-mirror",
            "list",
            "--status",
            "failed",
            "--status",
            "pending",
        ])
        .unwrap();
        assert_eq!(
            cli.command,
            Command::List(EntryListArgs {
                statuses: vec![StatusFilter::Failed, StatusFilter::Pending],
            })
        );
    }

    #[test]
    fn test_kebab_case_subcommands() {
        for name in ["retry-failed", "snapshot-local", "snapshot-remote"] {
            assert!(Cli::try_parse_from(["bucket-mirror", name]).is_ok(), "{name}");
        }
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Cli::try_parse_from(["bucket-mirror"]).is_err());
    }
}
