//! bucket-mirror: keep a local directory tree in step with an S3 bucket.
//!
//! Objects are listed page by page, diffed against a SQLite status ledger (or
//! the local tree), and downloaded through a bounded pool of transfers that
//! write to a temporary file and rename it into place once the size checks
//! out. The `monitor` command repeats this on a fixed interval.

#![warn(clippy::all)]

mod cli;
mod config;
mod diff;
mod engine;
mod ledger;
mod mapper;
mod monitor;
mod progress;
mod remote;
mod retry;
mod shutdown;
mod snapshot;
mod transfer;
mod types;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Command, EntryListArgs, ListArgs, ResetArgs, SyncArgs};
use config::Settings;
use engine::{CycleReport, SyncEngine};
use ledger::{EntryStatus, Ledger, LedgerError, SqliteLedger};
use remote::{RemoteStore, S3Store};
use transfer::{format_duration, BatchReport};
use types::Tracking;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

impl Command {
    /// Whether the command reads or writes the ledger regardless of tracking.
    fn needs_ledger(&self) -> bool {
        matches!(
            self,
            Command::Status
                | Command::List(_)
                | Command::Reset(_)
                | Command::RetryFailed
                | Command::Verify
        )
    }
}

async fn open_ledger(settings: &Settings) -> anyhow::Result<Arc<dyn Ledger>> {
    match SqliteLedger::open(&settings.database_path, &settings.bucket_name).await {
        Ok(ledger) => {
            tracing::debug!("Ledger opened at {}", ledger.path().display());
            Ok(Arc::new(ledger))
        }
        Err(e @ LedgerError::SourceNotConfigured(_)) => Err(anyhow::anyhow!(
            "{}. Run `bucket-mirror configure` first.",
            e
        )),
        Err(e) => Err(e).with_context(|| {
            format!(
                "Failed to open ledger at {}",
                settings.database_path.display()
            )
        }),
    }
}

/// Run the configure command.
async fn run_configure(settings: &Settings) -> anyhow::Result<()> {
    let created =
        SqliteLedger::configure(&settings.database_path, &settings.bucket_name).await?;
    if created {
        println!(
            "Registered bucket {} in {}",
            settings.bucket_name,
            settings.database_path.display()
        );
    } else {
        println!(
            "Bucket {} is already registered in {}",
            settings.bucket_name,
            settings.database_path.display()
        );
    }
    Ok(())
}

/// Run the status command.
async fn run_status(engine: &SyncEngine) -> anyhow::Result<()> {
    let summary = engine.summarize().await?;

    println!("Bucket: {}", engine.settings().bucket_name);
    println!("Ledger: {}", engine.settings().database_path.display());
    println!();
    println!("Entries:");
    println!("  {:<11} {}", "Total:", summary.total);
    for status in EntryStatus::ALL {
        println!("  {:<11} {}", format!("{}:", status), summary.count(status));
    }
    println!();

    if let Some(started) = &summary.last_cycle_started {
        println!("Last cycle started:   {}", started.format(TIME_FORMAT));
    }
    if let Some(completed) = &summary.last_cycle_completed {
        println!("Last cycle completed: {}", completed.format(TIME_FORMAT));
    }
    Ok(())
}

/// Run the list command.
async fn run_list(engine: &SyncEngine, args: EntryListArgs) -> anyhow::Result<()> {
    let statuses: Vec<EntryStatus> = args.statuses.into_iter().map(Into::into).collect();
    let entries = engine.list_entries(&statuses).await?;

    for entry in &entries {
        let path = entry
            .local_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<10} {:>12} {}  {} -> {}",
            entry.status.as_str(),
            entry.size_bytes,
            entry.last_modified.format(TIME_FORMAT),
            entry.key,
            path
        );
        if let Some(error) = &entry.last_error {
            println!("{:<10} attempts: {}, last error: {}", "", entry.attempts, error);
        }
    }
    println!();
    println!("{} entries", entries.len());
    Ok(())
}

/// Run the reset command.
async fn run_reset(engine: &SyncEngine, args: ResetArgs) -> anyhow::Result<()> {
    if !args.yes {
        println!(
            "This will clear every ledger entry for bucket {} in:",
            engine.settings().bucket_name
        );
        println!("  {}", engine.settings().database_path.display());
        println!();
        print!("Are you sure? [y/N] ");
        use std::io::Write;
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled.");
            return Ok(());
        }
    }

    let removed = engine.reset_ledger().await?;
    println!("Removed {} entries.", removed);
    Ok(())
}

/// Run the verify command.
async fn run_verify(engine: &SyncEngine) -> anyhow::Result<()> {
    let report = engine.verify().await?;

    println!("Verified {} completed entries", report.checked);
    println!();
    for entry in &report.missing {
        match &entry.local_path {
            Some(path) => println!("MISSING: {} ({})", path.display(), entry.key),
            None => println!("NO PATH: {} - no local path recorded", entry.key),
        }
    }
    for (entry, actual) in &report.mismatched {
        println!(
            "SIZE MISMATCH: {} ({}) expected {} bytes, found {}",
            entry
                .local_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            entry.key,
            entry.size_bytes,
            actual
        );
    }

    println!();
    println!("Results:");
    println!(
        "  OK:         {}",
        report.checked - report.missing.len() as u64 - report.mismatched.len() as u64
    );
    println!("  Missing:    {}", report.missing.len());
    println!("  Mismatched: {}", report.mismatched.len());

    if !report.is_clean() {
        std::process::exit(1);
    }
    Ok(())
}

/// Run the diff command.
async fn run_diff(engine: &SyncEngine, args: ListArgs) -> anyhow::Result<()> {
    let scan = engine.scan_once().await?;
    if args.list {
        for pending in &scan.pending {
            println!(
                "{}  {:>12}  {} -> {}",
                pending.last_modified.format(TIME_FORMAT),
                pending.size_bytes,
                pending.key,
                pending.local_path.display()
            );
        }
        println!();
    }
    println!("Listed:   {}", scan.listed);
    println!("Skipped:  {}", scan.skipped);
    println!("Pending:  {} ({} bytes)", scan.pending_count(), scan.total_bytes());
    if scan.duplicates > 0 {
        println!("Duplicates: {} (keys listed under overlapping paths)", scan.duplicates);
    }
    if scan.held_failed > 0 {
        println!("Held failed: {} (run retry-failed to include them)", scan.held_failed);
    }
    Ok(())
}

async fn run_snapshot_local(engine: &SyncEngine, args: ListArgs) -> anyhow::Result<()> {
    let snapshot = engine.local_snapshot().await?;
    if args.list {
        for path in snapshot.paths() {
            println!("{}", path);
        }
        println!();
    }
    println!(
        "{} files under {}",
        snapshot.len(),
        engine.settings().destination_root.display()
    );
    Ok(())
}

async fn run_snapshot_remote(engine: &SyncEngine, args: ListArgs) -> anyhow::Result<()> {
    let objects = engine.remote_snapshot().await?;
    if args.list {
        for object in &objects {
            println!(
                "{}  {:>12}  {}",
                object.last_modified.format(TIME_FORMAT),
                object.size_bytes,
                object.key
            );
        }
        println!();
    }
    let bytes: u64 = objects.iter().map(|o| o.size_bytes).sum();
    println!(
        "{} objects ({} bytes) in bucket {}",
        objects.len(),
        bytes,
        engine.settings().bucket_name
    );
    Ok(())
}

fn print_batch(batch: &BatchReport) {
    println!("Downloaded:      {}", batch.completed);
    println!("Already present: {}", batch.already_present);
    println!("Failed:          {}", batch.failed.len());
    for failure in &batch.failed {
        println!("  {} - {}", failure.key, failure.reason);
    }
    if batch.not_admitted > 0 {
        println!("Not started:     {} (shutdown requested)", batch.not_admitted);
    }
    println!(
        "Transferred {} bytes in {}",
        batch.bytes_transferred,
        format_duration(batch.elapsed)
    );
}

fn print_cycle(report: &CycleReport) {
    println!("Listed:          {}", report.listed);
    println!("Skipped:         {}", report.skipped);
    println!("Pending:         {}", report.pending);
    print_batch(&report.batch);
}

fn check_batch(batch: &BatchReport) -> anyhow::Result<()> {
    if !batch.failed.is_empty() {
        anyhow::bail!("{} downloads failed", batch.failed.len());
    }
    Ok(())
}

/// Run the sync command.
async fn run_sync(engine: &SyncEngine, args: SyncArgs) -> anyhow::Result<()> {
    let shutdown_token = shutdown::install_signal_handler()?;
    match args.key {
        Some(key) => {
            let batch = engine.sync_key(&key, &shutdown_token).await?;
            print_batch(&batch);
            check_batch(&batch)
        }
        None => {
            let report = engine.run_cycle(&shutdown_token).await?;
            print_cycle(&report);
            check_batch(&report.batch)
        }
    }
}

/// Run the retry-failed command.
async fn run_retry_failed(engine: &SyncEngine) -> anyhow::Result<()> {
    match engine.reset_failed().await? {
        0 => tracing::info!("No failed entries to retry"),
        count => tracing::info!(count, "Reset failed entries to pending"),
    }
    run_sync(engine, SyncArgs::default()).await
}

/// Run the monitor command.
async fn run_monitor(engine: &SyncEngine) -> anyhow::Result<()> {
    let shutdown_token = shutdown::install_signal_handler()?;
    tracing::info!(
        interval = %format_duration(engine.settings().polling_interval),
        "Monitoring bucket {}",
        engine.settings().bucket_name
    );
    let cycles = monitor::run_forever(engine, &shutdown_token).await;
    tracing::info!(cycles, "Monitor stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter())),
        )
        .init();

    let config_path = config::expand_tilde(&cli.config);
    let mut settings = Settings::load(&config_path)
        .with_context(|| format!("Failed to load settings from {}", config_path.display()))?;
    if let Command::Sync(SyncArgs {
        single_threaded: true,
        ..
    }) = &cli.command
    {
        settings.max_downloads = 1;
    }
    for line in settings.summarize().lines() {
        tracing::debug!("{}", line);
    }

    if cli.command == Command::Configure {
        return run_configure(&settings).await;
    }

    let ledger = if cli.command.needs_ledger() || settings.tracking == Tracking::Ledger {
        Some(open_ledger(&settings).await?)
    } else {
        None
    };
    let store: Arc<dyn RemoteStore> = Arc::new(S3Store::connect(&settings).await);
    let engine = SyncEngine::new(settings, store, ledger);

    match cli.command {
        Command::Configure => Ok(()),
        Command::Monitor => run_monitor(&engine).await,
        Command::Sync(args) => run_sync(&engine, args).await,
        Command::Diff(args) => run_diff(&engine, args).await,
        Command::Status => run_status(&engine).await,
        Command::List(args) => run_list(&engine, args).await,
        Command::Reset(args) => run_reset(&engine, args).await,
        Command::RetryFailed => run_retry_failed(&engine).await,
        Command::SnapshotLocal(args) => run_snapshot_local(&engine, args).await,
        Command::SnapshotRemote(args) => run_snapshot_remote(&engine, args).await,
        Command::Verify => run_verify(&engine).await,
    }
}
