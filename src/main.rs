use std::collections::BTreeSet;
use std::io::{IsTerminal, Write};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use livephoto_cleaner::cli::{self, Command};
use livephoto_cleaner::config::{self, Config};
use livephoto_cleaner::engine::{
    self, Alert, AlertAction, DuplicationEngine, EngineEvent, RunOutcome,
};
use livephoto_cleaner::ledger::{AssetLedger, FileLedger};
use livephoto_cleaner::library::{DirectoryLibrary, PhotoStore};
use livephoto_cleaner::scanner::{CandidateScanner, CandidateSet};
use livephoto_cleaner::shutdown;
use livephoto_cleaner::types::{AssetId, PhotoAsset};

/// Create a progress bar, hidden when disabled or stdout is not a TTY.
fn create_progress_bar(no_progress_bar: bool, total: u64) -> ProgressBar {
    if no_progress_bar || !std::io::stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::with_template(
        "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("=> "));
    }
    pb
}

fn prompt_line(question: &str) -> anyhow::Result<String> {
    print!("{question}");
    std::io::stdout().flush()?;
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

fn confirm(question: &str) -> anyhow::Result<bool> {
    Ok(prompt_line(&format!("{question} [y/N] "))?.eq_ignore_ascii_case("y"))
}

async fn open_library(config: &Config) -> anyhow::Result<Arc<DirectoryLibrary>> {
    let root = config.require_library()?;
    let library = DirectoryLibrary::open(root)
        .await
        .with_context(|| format!("Failed to open photo library at {}", root.display()))?;
    Ok(Arc::new(library))
}

async fn open_scanner(config: &Config) -> anyhow::Result<(Arc<DirectoryLibrary>, Arc<FileLedger>, CandidateScanner)> {
    let library = open_library(config).await?;
    let ledger = Arc::new(FileLedger::open(&config.ledger_path()).await);
    let scanner = CandidateScanner::new(library.clone(), ledger.clone());
    Ok((library, ledger, scanner))
}

/// Pick assets by identifier, in creation order. Unknown ids are reported.
fn select_by_id(candidates: &CandidateSet, ids: &[String]) -> Vec<PhotoAsset> {
    let wanted: BTreeSet<AssetId> = ids.iter().map(|id| AssetId::new(id.as_str())).collect();
    for id in &wanted {
        if !candidates.contains(id) {
            tracing::warn!(asset = %id, "Not an unprocessed Live Photo, skipping");
        }
    }
    candidates
        .all()
        .into_iter()
        .filter(|a| wanted.contains(&a.id))
        .collect()
}

async fn run_scan(config: &Config, args: cli::ScanArgs) -> anyhow::Result<()> {
    let (_library, ledger, scanner) = open_scanner(config).await?;
    let candidates = scanner.scan().await?;

    println!("Unprocessed Live Photos: {}", candidates.len());
    println!("  Unedited: {}", candidates.unedited.len());
    println!("  Edited:   {}", candidates.edited.len());
    println!("Already processed:       {}", ledger.len());

    if args.list {
        println!();
        for asset in candidates.all() {
            let marker = if asset.has_adjustments { " (edited)" } else { "" };
            println!(
                "{}  {}{}",
                asset.created.format("%Y-%m-%d %H:%M:%S"),
                asset.id,
                marker
            );
        }
    }
    Ok(())
}

async fn run_status(config: &Config) -> anyhow::Result<()> {
    let (library, ledger, scanner) = open_scanner(config).await?;
    let candidates = scanner.scan().await?;
    let freed = engine::approx_freed_space(library.as_ref(), &candidates.all()).await?;
    let settings = config.settings_store().load().await;

    println!("Library: {}", library.root().display());
    println!("Ledger:  {} ({} processed)", ledger.path().display(), ledger.len());
    println!();
    println!("Candidates:");
    println!("  Unedited: {}", candidates.unedited.len());
    println!("  Edited:   {}", candidates.edited.len());
    println!("  Reclaimable: {freed:.2} MiB");
    println!();
    println!("Settings:");
    print_settings(&settings);
    Ok(())
}

async fn run_reset_ledger(config: &Config, args: cli::ResetLedgerArgs) -> anyhow::Result<()> {
    let ledger = FileLedger::open(&config.ledger_path()).await;
    if ledger.is_empty() && !ledger.path().exists() {
        println!("No ledger found at {}", ledger.path().display());
        return Ok(());
    }

    if !args.yes {
        println!("This will forget {} processed assets recorded in:", ledger.len());
        println!("  {}", ledger.path().display());
        println!();
        if !confirm("Are you sure?")? {
            println!("Cancelled.");
            return Ok(());
        }
    }

    ledger.reset().await?;
    println!("Ledger reset.");
    Ok(())
}

fn print_settings(settings: &livephoto_cleaner::settings::Settings) {
    println!("  include_icloud_images:       {}", settings.include_icloud_images);
    println!("  delete_original_live_photos: {}", settings.delete_original_live_photos);
    println!("  move_to_album:               {}", settings.move_to_album);
}

async fn run_settings(config: &Config, args: cli::SettingsArgs) -> anyhow::Result<()> {
    let store = config.settings_store();
    let mut settings = store.load().await;
    if !args.assignments.is_empty() {
        for assignment in &args.assignments {
            settings.assign(assignment)?;
        }
        store.save(&settings).await?;
        println!("Saved {}", store.path().display());
    }
    print_settings(&settings);
    Ok(())
}

async fn run_freed_space(config: &Config, args: cli::FreedSpaceArgs) -> anyhow::Result<()> {
    let (library, _ledger, scanner) = open_scanner(config).await?;
    let candidates = scanner.scan().await?;
    let selection = if args.all {
        candidates.all()
    } else if !args.assets.is_empty() {
        select_by_id(&candidates, &args.assets)
    } else {
        candidates.unedited.clone()
    };
    let freed = engine::approx_freed_space(library.as_ref(), &selection).await?;
    println!("{} assets, approximately {freed:.2} MiB", selection.len());
    Ok(())
}

enum PauseDecision {
    Resume { allow_cloud: bool },
    Abandon,
}

fn decide_on_pause(alert: &Alert, interactive: bool) -> anyhow::Result<PauseDecision> {
    let presentation = alert.presentation();
    println!();
    println!("{}", presentation.title);
    println!("{}", presentation.message);
    if !interactive {
        println!("Not answering interactively, abandoning the remaining assets.");
        return Ok(PauseDecision::Abandon);
    }
    for (i, action) in presentation.actions.iter().enumerate() {
        println!("  [{}] {}", i + 1, action.label());
    }
    let answer = prompt_line("Choice: ")?;
    let action = answer
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .and_then(|i| presentation.actions.get(i).copied());
    Ok(match action {
        Some(AlertAction::EnableCloudAndResume) => PauseDecision::Resume { allow_cloud: true },
        Some(AlertAction::Retry) => PauseDecision::Resume { allow_cloud: false },
        _ => PauseDecision::Abandon,
    })
}

/// Render engine events until the engine is dropped. Returns the number of
/// originals replaced by this run.
async fn report_events(mut events: mpsc::UnboundedReceiver<EngineEvent>, pb: ProgressBar) -> usize {
    let mut replaced = 0;
    while let Some(event) = events.recv().await {
        match event {
            EngineEvent::BatchStarted { index, size } => {
                pb.set_message(format!("batch {index} ({size} assets)"));
            }
            EngineEvent::Progress { index, processed } => {
                replaced += processed.len();
                pb.inc(processed.len() as u64);
                pb.suspend(|| tracing::debug!(batch = index, assets = processed.len(), "Batch done"));
            }
            EngineEvent::Completed { processed } => {
                pb.suspend(|| tracing::info!(processed, "All batches committed"));
            }
            EngineEvent::Alert(alert) => {
                pb.suspend(|| tracing::warn!(alert = %alert, "Engine alert"));
            }
        }
    }
    replaced
}

async fn run_clean(
    config: &Config,
    args: cli::CleanArgs,
    shutdown_token: CancellationToken,
) -> anyhow::Result<()> {
    let library = open_library(config).await?;
    let _lock = library
        .acquire_lock()
        .await
        .context("Another process is modifying this library")?;
    let ledger = Arc::new(FileLedger::open(&config.ledger_path()).await);
    let scanner = CandidateScanner::new(library.clone(), ledger.clone());

    let settings_store = config.settings_store();
    let mut persisted = settings_store.load().await;
    let settings = config::run_settings(persisted, &args);

    let candidates = scanner.scan().await?;
    let mut selection = if args.assets.is_empty() {
        candidates.all()
    } else {
        select_by_id(&candidates, &args.assets)
    };
    if !args.include_edited {
        let before = selection.len();
        selection.retain(|a| !a.has_adjustments);
        let skipped = before - selection.len();
        if skipped > 0 {
            tracing::warn!(
                skipped,
                "Skipping edited Live Photos; their copies keep the edit but lose the ability to revert it. Pass --include-edited to process them"
            );
        }
    }
    if let Some(limit) = args.limit {
        selection.truncate(limit);
    }
    if selection.is_empty() {
        println!("Nothing to clean.");
        return Ok(());
    }

    let freed = engine::approx_freed_space(library.as_ref(), &selection).await?;
    tracing::info!(
        assets = selection.len(),
        reclaimable_mib = freed,
        delete_originals = settings.delete_original_live_photos,
        "Starting cleanup"
    );

    let interactive = !args.yes && std::io::stdin().is_terminal();
    if settings.delete_original_live_photos && interactive {
        let question = format!(
            "Replace {} Live Photos with still copies and delete the originals (about {freed:.2} MiB)?",
            selection.len()
        );
        if !confirm(&question)? {
            println!("Cancelled.");
            return Ok(());
        }
    }

    let store: Arc<dyn PhotoStore> = library.clone();
    let ledger_dyn: Arc<dyn AssetLedger> = ledger.clone();
    let (engine, events) = DuplicationEngine::new(store, ledger_dyn, config::engine_config(&args));
    let engine = Arc::new(engine);
    engine.set_settings(settings).await;
    engine.set_assets(selection.clone()).await;

    let pb = create_progress_bar(config.no_progress_bar, selection.len() as u64);
    let reporter = tokio::spawn(report_events(events, pb.clone()));
    let canceller = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            shutdown_token.cancelled().await;
            engine.cancel();
        })
    };

    let mut outcome = engine.run().await;
    while let RunOutcome::Paused(alert) = &outcome {
        match pb.suspend(|| decide_on_pause(alert, interactive))? {
            PauseDecision::Resume { allow_cloud } => {
                if allow_cloud && !persisted.include_icloud_images {
                    persisted.include_icloud_images = true;
                    if let Err(e) = settings_store.save(&persisted).await {
                        tracing::warn!(error = %e, "Failed to persist iCloud setting");
                    }
                }
                outcome = engine.resume(allow_cloud).await;
            }
            PauseDecision::Abandon => {
                let dropped = engine.abandon().await;
                pb.suspend(|| println!("Abandoned {dropped} remaining assets."));
                break;
            }
        }
    }

    canceller.abort();
    let _ = canceller.await;
    drop(engine);
    let replaced_this_run = reporter.await.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Progress reporter failed");
        0
    });
    pb.finish_and_clear();

    match outcome {
        RunOutcome::Finished { processed } => {
            if settings.delete_original_live_photos {
                println!("Replaced {processed} Live Photos.");
            } else {
                println!("Created {processed} still copies; the original Live Photos were kept.");
            }
            Ok(())
        }
        RunOutcome::Paused(_) => {
            println!("Processed {replaced_this_run} assets before stopping.");
            Ok(())
        }
        RunOutcome::Failed(alert) => {
            let presentation = alert.presentation();
            anyhow::bail!("{}: {}", presentation.title, presentation.message)
        }
        RunOutcome::Cancelled => {
            println!("Cancelled.");
            Ok(())
        }
        RunOutcome::Idle => {
            println!("Nothing to clean.");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    let config = Config::from_cli(&cli.global);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter())),
        )
        .init();
    tracing::debug!(data_directory = %config.data_directory.display(), "Starting livephoto-cleaner");

    match cli.command {
        Command::Scan(args) => run_scan(&config, args).await,
        Command::Clean(args) => {
            let shutdown_token = shutdown::install_signal_handler()?;
            run_clean(&config, args, shutdown_token).await
        }
        Command::Status => run_status(&config).await,
        Command::ResetLedger(args) => run_reset_ledger(&config, args).await,
        Command::Settings(args) => run_settings(&config, args).await,
        Command::FreedSpace(args) => run_freed_space(&config, args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livephoto_cleaner::engine::AlertKind;

    #[tokio::test]
    async fn test_report_events_counts_only_this_run() {
        let (tx, rx) = mpsc::unbounded_channel();
        let reporter = tokio::spawn(report_events(rx, ProgressBar::hidden()));

        tx.send(EngineEvent::BatchStarted { index: 1, size: 2 }).unwrap();
        tx.send(EngineEvent::Progress {
            index: 1,
            processed: vec![AssetId::from("A"), AssetId::from("B")],
        })
        .unwrap();
        tx.send(EngineEvent::BatchStarted { index: 2, size: 2 }).unwrap();
        tx.send(EngineEvent::Alert(Alert::new(AlertKind::UnableToLoadCloudAssetData)))
            .unwrap();
        drop(tx);

        assert_eq!(reporter.await.unwrap(), 2);
    }
}
